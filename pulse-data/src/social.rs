use crate::{
    cache::TtlCache,
    error::LookupError,
    http::{HttpRequest, RateLimitedClient},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{sync::LazyLock, time::Duration};
use tracing::debug;

static POST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^https?://(?:www\.)?(?:twitter\.com|x\.com)/[A-Za-z0-9_]+/status/\d+")
        .expect("static regex")
});

static COMMUNITY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:www\.)?(?:twitter\.com|x\.com)/i/communities/(\d+)")
        .expect("static regex")
});

static USER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)https?://(?:www\.)?(?:twitter\.com|x\.com)/([A-Za-z0-9_]+)(?:\?|/status|/?$)")
        .expect("static regex")
});

/// First path segments owned by the site rather than by an account.
const RESERVED_PATHS: &[&str] = &[
    "i", "home", "explore", "search", "notifications", "messages", "settings", "intent", "share",
    "hashtag",
];

static HANDLE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,15}$").expect("static regex"));

/// Classified social-profile url.
///
/// Precedence is post, community, user, invalid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocialRef {
    Post,
    Community(SmolStr),
    User(SmolStr),
    Invalid,
}

impl SocialRef {
    pub fn classify(url: &str) -> Self {
        if POST_REGEX.is_match(url) {
            return Self::Post;
        }

        if let Some(captures) = COMMUNITY_REGEX.captures(url) {
            return Self::Community(SmolStr::new(&captures[1]));
        }

        match USER_REGEX.captures(url) {
            Some(captures) if !is_reserved_path(&captures[1]) => Self::User(SmolStr::new(&captures[1])),
            _ => Self::Invalid,
        }
    }
}

fn is_reserved_path(segment: &str) -> bool {
    RESERVED_PATHS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(segment))
}

/// Normalise a raw social field: bare handles (`name`, `@name`) become
/// `https://x.com/name`, blank input becomes `None`.
pub fn normalise_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let handle = trimmed.strip_prefix('@').unwrap_or(trimmed);
    if HANDLE_REGEX.is_match(handle) {
        return Some(format!("https://x.com/{handle}"));
    }

    Some(trimmed.to_string())
}

/// Social enrichment attached to every record.
///
/// Serialised untagged, so each variant renders as its plain field set, eg/
/// `{"followers": 10, "following": 2}`, `{"skipped": true}`, `{"error": "HTTP 404"}` or
/// `null` when the event carried no social url.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SocialOutcome {
    User {
        followers: u64,
        following: u64,
    },
    Community {
        community_followers: u64,
        admin_username: SmolStr,
        admin_followers: u64,
        admin_following: u64,
    },
    Skipped {
        skipped: bool,
    },
    Error {
        error: String,
    },
    Missing,
}

impl SocialOutcome {
    pub fn skipped() -> Self {
        Self::Skipped { skipped: true }
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Self::User { .. } | Self::Community { .. })
    }
}

impl From<LookupError> for SocialOutcome {
    fn from(error: LookupError) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct UserInfoResponse {
    data: Option<UserInfo>,
}

#[derive(Deserialize)]
struct UserInfo {
    #[serde(default)]
    followers: u64,
    #[serde(default)]
    following: u64,
}

#[derive(Deserialize)]
struct CommunityInfoResponse {
    community_info: Option<CommunityInfo>,
}

#[derive(Deserialize)]
struct CommunityInfo {
    #[serde(default)]
    member_count: u64,
    admin: Option<CommunityAdmin>,
}

#[derive(Deserialize)]
struct CommunityAdmin {
    #[serde(default)]
    screen_name: SmolStr,
    #[serde(default)]
    followers_count: u64,
    #[serde(default)]
    friends_count: u64,
}

/// Resolves social-profile urls to follower statistics, caching successful lookups per
/// username and per community id.
#[derive(Debug)]
pub struct SocialGraphGateway {
    client: RateLimitedClient,
    api_base: String,
    api_key: String,
    users: TtlCache<SmolStr, SocialOutcome>,
    communities: TtlCache<SmolStr, SocialOutcome>,
}

impl SocialGraphGateway {
    pub fn new(
        client: RateLimitedClient,
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        ttl: Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            users: TtlCache::new(ttl, max_entries),
            communities: TtlCache::new(ttl, max_entries),
        }
    }

    /// Resolve the optional social url of an event. Never fails: every problem is
    /// expressed as a [`SocialOutcome`].
    pub async fn lookup(&self, url: Option<&str>) -> SocialOutcome {
        let Some(url) = url.and_then(normalise_url) else {
            return SocialOutcome::Missing;
        };

        let result = match SocialRef::classify(&url) {
            SocialRef::Post => return SocialOutcome::skipped(),
            SocialRef::Invalid => return SocialOutcome::from(LookupError::InvalidUrl),
            SocialRef::Community(id) => {
                self.communities
                    .get_or_try_fetch(id.clone(), || self.fetch_community(&id))
                    .await
            }
            SocialRef::User(name) => {
                self.users
                    .get_or_try_fetch(name.clone(), || self.fetch_user(&name))
                    .await
            }
        };

        match result {
            Ok(outcome) => {
                debug!(%url, cached = outcome.cached, "social lookup resolved");
                outcome.value
            }
            Err(error) => {
                debug!(%url, %error, "social lookup failed");
                SocialOutcome::from(error)
            }
        }
    }

    async fn fetch_user(&self, username: &str) -> Result<SocialOutcome, LookupError> {
        let request = HttpRequest::get(format!("{}/twitter/user/info", self.api_base))
            .with_query("userName", username)
            .with_header("X-API-Key", self.api_key.as_str());

        let response = self.client.execute(&request).await?;
        if !response.is_success() {
            return Err(LookupError::from_status(response.status));
        }

        let UserInfo {
            followers,
            following,
        } = response
            .json::<UserInfoResponse>()?
            .data
            .ok_or_else(|| LookupError::Payload("user info without data".to_string()))?;

        Ok(SocialOutcome::User {
            followers,
            following,
        })
    }

    async fn fetch_community(&self, community_id: &str) -> Result<SocialOutcome, LookupError> {
        let request = HttpRequest::get(format!("{}/twitter/community/info", self.api_base))
            .with_query("community_id", community_id)
            .with_header("X-API-Key", self.api_key.as_str());

        let response = self.client.execute(&request).await?;
        if !response.is_success() {
            return Err(LookupError::from_status(response.status));
        }

        let info = response
            .json::<CommunityInfoResponse>()?
            .community_info
            .ok_or_else(|| LookupError::Payload("missing community_info".to_string()))?;

        let admin = info.admin.ok_or(LookupError::MissingAdmin)?;

        Ok(SocialOutcome::Community {
            community_followers: info.member_count,
            admin_username: admin.screen_name,
            admin_followers: admin.followers_count,
            admin_following: admin.friends_count,
        })
    }
}
