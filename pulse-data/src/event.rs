use crate::{aggregate::AggregateMarketCap, error::LookupError, social::SocialOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use smol_str::SmolStr;
use tokio::time::Instant;

/// Newly observed instrument, as received on the `new_pairs` room.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenEvent {
    pub token_address: SmolStr,
    pub pair_address: SmolStr,
    pub token_name: SmolStr,
    pub token_ticker: SmolStr,
    pub deployer_address: Option<SmolStr>,
    pub social_url: Option<String>,
    pub metadata_uri: Option<String>,
    pub protocol: SmolStr,
    pub created_at: Option<DateTime<Utc>>,
    pub received_at: Instant,
}

/// Migration counters of the originator at the time the event was matched.
#[derive(Debug, Copy, Clone, PartialEq, Deserialize, Serialize)]
pub struct MigrationCounts {
    pub migrated: u64,
    pub total: u64,
    /// `migrated / total * 100`, rounded to 2 decimals; zero when `total` is zero.
    pub percentage: f64,
}

impl MigrationCounts {
    pub fn new(migrated: u64, total: u64) -> Self {
        let percentage = if total == 0 {
            0.0
        } else {
            (migrated as f64 / total as f64 * 10_000.0).round() / 100.0
        };

        Self {
            migrated,
            total,
            percentage,
        }
    }
}

/// Migration enrichment: matched counts, or `"unavailable"` once the match window closed.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum MigrationOutcome {
    Matched(MigrationCounts),
    Unavailable,
}

impl Serialize for MigrationOutcome {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            MigrationOutcome::Matched(counts) => counts.serialize(serializer),
            MigrationOutcome::Unavailable => serializer.serialize_str("unavailable"),
        }
    }
}

/// Aggregate enrichment: the originator statistics with their cache flag, or an error
/// label, eg/ `{"error": "no valid tokens"}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AggregateOutcome {
    Resolved {
        #[serde(flatten)]
        aggregate: AggregateMarketCap,
        cached: bool,
    },
    Error {
        error: String,
    },
}

impl AggregateOutcome {
    pub fn avg_mcap(&self) -> Option<f64> {
        match self {
            AggregateOutcome::Resolved { aggregate, .. } => Some(aggregate.avg_mcap),
            AggregateOutcome::Error { .. } => None,
        }
    }

    pub fn avg_peak_mcap(&self) -> Option<f64> {
        match self {
            AggregateOutcome::Resolved { aggregate, .. } => aggregate.avg_peak_mcap,
            AggregateOutcome::Error { .. } => None,
        }
    }
}

impl From<LookupError> for AggregateOutcome {
    fn from(error: LookupError) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }
}

/// Fully enriched record handed to the [`OutputSink`](crate::sink::OutputSink).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedRecord {
    /// Strictly increasing in delivery order, assigned by the emitter.
    pub counter: u64,
    pub token_name: SmolStr,
    pub token_ticker: SmolStr,
    pub token_address: SmolStr,
    pub pair_address: SmolStr,
    pub deployer_address: Option<SmolStr>,
    pub twitter: Option<String>,
    pub protocol: SmolStr,
    pub created_at: Option<DateTime<Utc>>,
    pub twitter_stats: SocialOutcome,
    pub dev_mcap_info: AggregateOutcome,
    pub migration: MigrationOutcome,
    pub processing_time_ms: u64,
    pub emitted_at: DateTime<Utc>,
}
