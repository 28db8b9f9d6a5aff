use crate::{
    event::{AggregateOutcome, EnrichedRecord, MigrationOutcome, TokenEvent},
    social::SocialOutcome,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

/// Consumer of enriched records, eg/ a display layer or a broadcast server.
///
/// Called while the emitter holds its sequence lock, so implementations must not block.
pub trait OutputSink: Send + Sync {
    fn deliver(&self, record: EnrichedRecord);
}

/// [`OutputSink`] forwarding records into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<EnrichedRecord>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EnrichedRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelSink {
    fn deliver(&self, record: EnrichedRecord) {
        if self.tx.send(record).is_err() {
            debug!("record receiver dropped");
        }
    }
}

/// [`OutputSink`] fanning records out to every subscribed receiver.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<EnrichedRecord>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EnrichedRecord> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl OutputSink for BroadcastSink {
    fn deliver(&self, record: EnrichedRecord) {
        match self.tx.send(record) {
            Ok(receivers) => debug!(receivers, "record broadcast"),
            Err(_) => debug!("no subscribers, record dropped"),
        }
    }
}

/// Assembles [`EnrichedRecord`]s and hands them to the [`OutputSink`].
///
/// Sequence numbers are assigned under the same lock as delivery, so they are strictly
/// increasing in delivery order.
pub struct Emitter {
    sink: Arc<dyn OutputSink>,
    counter: Mutex<u64>,
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("counter", &*self.counter.lock())
            .finish_non_exhaustive()
    }
}

impl Emitter {
    pub fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink,
            counter: Mutex::new(0),
        }
    }

    /// Emit one record, returning its sequence number.
    pub fn emit(
        &self,
        event: TokenEvent,
        social_url: Option<String>,
        social: SocialOutcome,
        aggregate: AggregateOutcome,
        migration: MigrationOutcome,
    ) -> u64 {
        let processing_time_ms = u64::try_from(event.received_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        let mut counter = self.counter.lock();
        *counter += 1;

        let record = EnrichedRecord {
            counter: *counter,
            token_name: event.token_name,
            token_ticker: event.token_ticker,
            token_address: event.token_address,
            pair_address: event.pair_address,
            deployer_address: event.deployer_address,
            twitter: social_url,
            protocol: event.protocol,
            created_at: event.created_at,
            twitter_stats: social,
            dev_mcap_info: aggregate,
            migration,
            processing_time_ms,
            emitted_at: Utc::now(),
        };

        info!(
            counter = record.counter,
            ticker = %record.token_ticker,
            social = record.twitter_stats.is_present(),
            avg_mcap = ?record.dev_mcap_info.avg_mcap(),
            avg_peak_mcap = ?record.dev_mcap_info.avg_peak_mcap(),
            migration = ?record.migration,
            latency_ms = record.processing_time_ms,
            "token emitted"
        );

        self.sink.deliver(record);
        *counter
    }
}
