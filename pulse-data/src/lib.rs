//! # Pulse-Data
//! Real-time ingestion of a new-token feed, enriched with social graph statistics,
//! originator market-cap aggregates and migration counters before being handed to an
//! [`OutputSink`](sink::OutputSink).
//!
//! ## Pipeline
//! * [`StreamConsumer`](stream::StreamConsumer) holds the authenticated feed connection,
//!   forwarding `new_pairs` frames as [`TokenEvent`](event::TokenEvent)s and folding
//!   `update_pulse_v2` snapshots into the [`MigrationStatCache`](stream::MigrationStatCache).
//! * [`EnrichmentScheduler`](enrich::EnrichmentScheduler) runs the social and aggregate
//!   lookups of every event concurrently and matches it with its migration stat.
//! * [`Emitter`](sink::Emitter) numbers each [`EnrichedRecord`](event::EnrichedRecord)
//!   and delivers it.
//!
//! Every outbound HTTP call goes through the [`RateLimitedClient`](http::RateLimitedClient)
//! and the [`HttpTransport`](http::HttpTransport) seam, with credentials kept fresh by the
//! [`CredentialStore`](credential::CredentialStore).

/// Originator market-cap aggregation.
pub mod aggregate;

/// Time-bounded, size-capped lookup cache.
pub mod cache;

/// Runtime configuration with `PULSE_*` environment overrides.
pub mod config;

/// Bearer credential pair with expiry check, refresh and persistence.
pub mod credential;

/// Per-event enrichment scheduling and deferred migration matching.
pub mod enrich;

/// All [`Error`](std::error::Error)s generated in Pulse-Data.
pub mod error;

/// Token events and the enriched records emitted for them.
pub mod event;

/// HTTP transport seam and the retrying client built on top of it.
pub mod http;

/// Pair chart peak lookups and the reference-rate oracle.
pub mod market;

/// Shared running flag.
pub mod signal;

/// Record emission and delivery.
pub mod sink;

/// Social-profile url classification and follower lookups.
pub mod social;

/// Feed connection, frame protocol and migration stat cache.
pub mod stream;

/// Top level wiring of consumer, scheduler and sink.
pub mod tracker;

pub use config::TrackerConfig;
pub use error::DataError;
pub use event::{EnrichedRecord, TokenEvent};
pub use signal::RunSignal;
pub use sink::{BroadcastSink, ChannelSink, OutputSink};
pub use tracker::Tracker;

