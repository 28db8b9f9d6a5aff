use crate::{
    cache::TtlCache,
    http::{HttpRequest, HttpTransport},
    social::{SocialRef, normalise_url},
};
use regex::Regex;
use serde_json::Value;
use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};
use tracing::debug;

static SOCIAL_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)https?://(?:www\.)?(?:x\.com|twitter\.com)/(?:i/communities/\d+|[A-Za-z0-9_]+(?:/status/\d+)?)",
    )
    .expect("static regex")
});

const IMAGE_EXTENSIONS: [&str; 6] = [".png", ".jpg", ".jpeg", ".gif", ".svg", ".webp"];

/// Keys checked first, at the top level and inside each nested container.
const CANDIDATE_KEYS: [&str; 6] = ["twitter", "x", "twitter_url", "twitterUrl", "twitterLink", "social_twitter"];

/// Nested objects commonly holding social links.
const CONTAINER_KEYS: [&str; 4] = ["extensions", "properties", "socials", "links"];

fn is_image(uri: &str) -> bool {
    let path = uri.split(['?', '#']).next().unwrap_or(uri).to_ascii_lowercase();
    IMAGE_EXTENSIONS.iter().any(|extension| path.ends_with(extension))
}

fn social_candidate(value: &Value) -> Option<String> {
    let raw = value.as_str()?;
    if let Some(link) = SOCIAL_LINK.find(raw) {
        return Some(link.as_str().to_string());
    }

    normalise_url(raw).filter(|url| SocialRef::classify(url) != SocialRef::Invalid)
}

fn candidate_in(object: &serde_json::Map<String, Value>) -> Option<String> {
    CANDIDATE_KEYS
        .iter()
        .filter_map(|key| object.get(*key))
        .find_map(social_candidate)
}

fn first_link(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => SOCIAL_LINK.find(text).map(|link| link.as_str().to_string()),
        Value::Array(items) => items.iter().find_map(first_link),
        Value::Object(object) => object.values().find_map(first_link),
        _ => None,
    }
}

/// Extract a social-profile url from an arbitrarily shaped metadata document.
///
/// Candidate keys win over nested containers, which win over a depth-first scan of
/// every string in the document. The first match is returned.
pub fn extract_social_url(document: &Value) -> Option<String> {
    if let Value::Object(object) = document {
        if let Some(url) = candidate_in(object) {
            return Some(url);
        }

        let nested = CONTAINER_KEYS
            .iter()
            .filter_map(|key| object.get(*key))
            .find_map(|container| match container {
                Value::Object(inner) => candidate_in(inner),
                Value::Array(items) => items.iter().find_map(first_link),
                _ => None,
            });

        if nested.is_some() {
            return nested;
        }
    }

    first_link(document)
}

/// Resolves an event's metadata uri to a social url.
///
/// Each uri is fetched at most once per TTL, including uris that yielded nothing. The
/// fetch is a single short attempt: image uris, non-200 and non-json answers all
/// resolve to `None`.
pub struct MetadataResolver {
    transport: Arc<dyn HttpTransport>,
    timeout: Duration,
    cache: TtlCache<String, Option<String>>,
}

impl std::fmt::Debug for MetadataResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataResolver")
            .field("timeout", &self.timeout)
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl MetadataResolver {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        timeout: Duration,
        ttl: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            transport,
            timeout,
            cache: TtlCache::new(ttl, max_entries),
        }
    }

    pub async fn resolve(&self, uri: &str) -> Option<String> {
        let uri = uri.trim();
        if uri.is_empty() {
            return None;
        }

        self.cache
            .get_or_fetch(uri.to_string(), || self.fetch(uri))
            .await
            .value
    }

    async fn fetch(&self, uri: &str) -> Option<String> {
        if is_image(uri) {
            return None;
        }

        let request = HttpRequest::get(uri).with_timeout(self.timeout);
        let response = match tokio::time::timeout(self.timeout, self.transport.send(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(error)) => {
                debug!(%uri, %error, "metadata fetch failed");
                return None;
            }
            Err(_) => {
                debug!(%uri, "metadata fetch timed out");
                return None;
            }
        };

        if response.status != 200 || !response.is_json() {
            debug!(%uri, status = response.status, "metadata not usable");
            return None;
        }

        let document = serde_json::from_str::<Value>(&response.body).ok()?;
        let url = extract_social_url(&document);
        debug!(%uri, ?url, "metadata resolved");
        url
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::TransportError,
        http::{HttpResponse, tests::ScriptedTransport},
    };
    use async_trait::async_trait;
    use serde_json::json;

    #[test]
    fn test_extract_social_url() {
        struct TestCase {
            input: Value,
            expected: Option<&'static str>,
        }

        let tests = vec![
            TestCase {
                // TC0: top level candidate key
                input: json!({"name": "Pulse", "twitter": "https://x.com/pulse"}),
                expected: Some("https://x.com/pulse"),
            },
            TestCase {
                // TC1: bare handle under candidate key
                input: json!({"twitter": "@pulse"}),
                expected: Some("https://x.com/pulse"),
            },
            TestCase {
                // TC2: nested under extensions
                input: json!({"extensions": {"twitter": "https://twitter.com/pulse_dev"}}),
                expected: Some("https://twitter.com/pulse_dev"),
            },
            TestCase {
                // TC3: deep inside an unrelated shape
                input: json!({"attributes": [{"trait": "socials", "value": "see https://x.com/i/communities/123 now"}]}),
                expected: Some("https://x.com/i/communities/123"),
            },
            TestCase {
                // TC4: candidate key beats a link found earlier in the scan
                input: json!({"description": "https://x.com/other", "x": "https://x.com/primary"}),
                expected: Some("https://x.com/primary"),
            },
            TestCase {
                // TC5: nothing social
                input: json!({"website": "https://pulse.fun", "twitter": ""}),
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = extract_social_url(&test.input);
            assert_eq!(actual.as_deref(), test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_is_image() {
        assert!(is_image("https://ipfs.io/ipfs/Qm/logo.PNG"));
        assert!(is_image("https://cdn/img.webp?size=64"));
        assert!(!is_image("https://ipfs.io/ipfs/Qm/meta.json"));
    }

    fn resolver(transport: Arc<ScriptedTransport>) -> MetadataResolver {
        MetadataResolver::new(
            transport,
            Duration::from_secs(1),
            Duration::from_secs(600),
            100,
        )
    }

    #[tokio::test]
    async fn test_resolve_caches_outcome_per_uri() {
        let transport = Arc::new(ScriptedTransport::new([
            Ok(HttpResponse::new(200, r#"{"twitter": "https://x.com/pulse"}"#)
                .with_header("Content-Type", "application/json; charset=utf-8")),
            Ok(HttpResponse::new(200, "<html></html>").with_header("Content-Type", "text/html")),
        ]));
        let resolver = resolver(Arc::clone(&transport));

        assert_eq!(resolver.resolve("https://meta/a.json").await.as_deref(), Some("https://x.com/pulse"));
        assert_eq!(resolver.resolve("https://meta/a.json").await.as_deref(), Some("https://x.com/pulse"));
        assert_eq!(resolver.resolve("https://meta/b.json").await, None);
        assert_eq!(resolver.resolve("https://meta/b.json").await, None);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn test_resolve_image_uri_skips_network() {
        let transport = Arc::new(ScriptedTransport::default());
        let resolver = resolver(Arc::clone(&transport));

        assert_eq!(resolver.resolve("https://cdn/logo.png").await, None);
        assert_eq!(transport.request_count(), 0);
    }

    /// Host that answers only after `delay`.
    struct StalledHost {
        delay: Duration,
    }

    #[async_trait]
    impl HttpTransport for StalledHost {
        async fn send(&self, _: &HttpRequest) -> Result<HttpResponse, TransportError> {
            tokio::time::sleep(self.delay).await;
            Ok(HttpResponse::new(200, r#"{"twitter": "https://x.com/late"}"#)
                .with_header("Content-Type", "application/json"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_gives_up_after_timeout() {
        let resolver = MetadataResolver::new(
            Arc::new(StalledHost {
                delay: Duration::from_secs(5),
            }),
            Duration::from_secs(1),
            Duration::from_secs(600),
            100,
        );

        let start = tokio::time::Instant::now();
        assert_eq!(resolver.resolve("https://meta/slow.json").await, None);
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        // The miss is cached, so a repeat resolves without waiting again
        let start = tokio::time::Instant::now();
        assert_eq!(resolver.resolve("https://meta/slow.json").await, None);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
