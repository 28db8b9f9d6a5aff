//! Runtime configuration for the tracker.
//!
//! Every struct has sensible production defaults, `with_*` builder methods, and a
//! `from_env` constructor that overrides defaults with `PULSE_*` environment variables.

use std::{path::PathBuf, str::FromStr, time::Duration};

/// Remote endpoints used by the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    /// WebSocket feed delivering `new_pairs` and `update_pulse_v2` rooms.
    pub feed_url: String,
    /// `Origin` header sent with the feed handshake and authenticated API calls.
    pub origin: String,
    /// Host serving `/pair-chart`.
    pub api_host: String,
    /// Full url of the originator token listing endpoint.
    pub dev_tokens_url: String,
    /// Full url of the access-token refresh endpoint.
    pub refresh_url: String,
    /// Base url of the social graph API.
    pub social_api: String,
    /// Full url of the reference-rate endpoint.
    pub oracle_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            feed_url: "wss://cluster-global2.axiom.trade/".to_string(),
            origin: "https://axiom.trade".to_string(),
            api_host: "https://api.axiom.trade".to_string(),
            dev_tokens_url: "https://api7.axiom.trade/dev-tokens-v2".to_string(),
            refresh_url: "https://api10.axiom.trade/refresh-access-token".to_string(),
            social_api: "https://api.twitterapi.io".to_string(),
            oracle_url: "https://api.coingecko.com/api/v3/simple/price?ids=solana&vs_currencies=usd"
                .to_string(),
        }
    }
}

/// Retry behaviour of the [`RateLimitedClient`](crate::http::RateLimitedClient).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub backoff_factor: f64,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1500),
            backoff_factor: 1.5,
            request_timeout: Duration::from_secs(12),
        }
    }
}

/// Time-to-live and capacity of every cache instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheSettings {
    pub social_ttl: Duration,
    pub aggregate_ttl: Duration,
    pub peak_price_ttl: Duration,
    pub oracle_ttl: Duration,
    pub metadata_ttl: Duration,
    pub migration_freshness: Duration,
    pub migration_capacity: usize,
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            social_ttl: Duration::from_secs(300),
            aggregate_ttl: Duration::from_secs(300),
            peak_price_ttl: Duration::from_secs(600),
            oracle_ttl: Duration::from_secs(60),
            metadata_ttl: Duration::from_secs(600),
            migration_freshness: Duration::from_secs(15),
            migration_capacity: 2000,
            max_entries: 10_000,
        }
    }
}

/// Per-event orchestration limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EnrichmentSettings {
    /// Maximum number of events orchestrated concurrently.
    pub workers: usize,
    /// Upper bound on concurrent peak-price lookups inside one aggregate.
    pub fanout_concurrency: usize,
    /// Number of most recent originator instruments averaged.
    pub avg_tokens_count: usize,
    /// Events not matched within this window of arrival skip the pending queue.
    pub match_window: Duration,
    /// Pending events older than this are emitted without migration data.
    pub max_processing_time: Duration,
    /// Interval of the deferred matcher poller.
    pub poll_interval: Duration,
    /// Bound on waiting for the in-flight social and aggregate lookups.
    pub lookup_timeout: Duration,
    /// Bound on fetching an off-band metadata document.
    pub metadata_timeout: Duration,
    /// Capacity of the pending queue.
    pub pending_capacity: usize,
}

impl Default for EnrichmentSettings {
    fn default() -> Self {
        Self {
            workers: 50,
            fanout_concurrency: 10,
            avg_tokens_count: 10,
            match_window: Duration::from_millis(400),
            max_processing_time: Duration::from_secs(2),
            poll_interval: Duration::from_millis(50),
            lookup_timeout: Duration::from_secs(12),
            metadata_timeout: Duration::from_secs(1),
            pending_capacity: 1000,
        }
    }
}

/// Feed connection behaviour.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeedSettings {
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub token_leeway: Duration,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
            ping_interval: Duration::from_secs(20),
            read_timeout: Duration::from_secs(120),
            token_leeway: Duration::from_secs(10),
        }
    }
}

/// Top level tracker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerConfig {
    pub auth_file: PathBuf,
    pub social_api_key: String,
    pub endpoints: Endpoints,
    pub retry: RetryPolicy,
    pub caches: CacheSettings,
    pub enrichment: EnrichmentSettings,
    pub feed: FeedSettings,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            auth_file: PathBuf::from("auth_data.json"),
            social_api_key: String::new(),
            endpoints: Endpoints::default(),
            retry: RetryPolicy::default(),
            caches: CacheSettings::default(),
            enrichment: EnrichmentSettings::default(),
            feed: FeedSettings::default(),
        }
    }
}

impl TrackerConfig {
    /// Build a configuration from defaults overridden by `PULSE_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PULSE_AUTH_FILE") {
            config.auth_file = PathBuf::from(path);
        }
        if let Ok(key) = std::env::var("PULSE_SOCIAL_API_KEY") {
            config.social_api_key = key;
        }
        if let Ok(url) = std::env::var("PULSE_FEED_URL") {
            config.endpoints.feed_url = url;
        }
        if let Ok(host) = std::env::var("PULSE_API_HOST") {
            config.endpoints.api_host = host;
        }
        if let Ok(url) = std::env::var("PULSE_DEV_TOKENS_URL") {
            config.endpoints.dev_tokens_url = url;
        }
        if let Ok(url) = std::env::var("PULSE_REFRESH_URL") {
            config.endpoints.refresh_url = url;
        }
        if let Ok(url) = std::env::var("PULSE_SOCIAL_API") {
            config.endpoints.social_api = url;
        }

        if let Some(count) = env_parse("PULSE_AVG_TOKENS_COUNT") {
            config.enrichment.avg_tokens_count = count;
        }
        if let Some(workers) = env_parse("PULSE_WORKERS") {
            config.enrichment.workers = workers;
        }
        if let Some(ms) = env_parse("PULSE_MAX_PROCESSING_MS") {
            config.enrichment.max_processing_time = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse("PULSE_MATCH_WINDOW_MS") {
            config.enrichment.match_window = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_auth_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth_file = path.into();
        self
    }

    pub fn with_social_api_key(mut self, key: impl Into<String>) -> Self {
        self.social_api_key = key.into();
        self
    }

    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_enrichment(mut self, enrichment: EnrichmentSettings) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn with_feed(mut self, feed: FeedSettings) -> Self {
        self.feed = feed;
        self
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|value| value.parse().ok())
}
