//! Per-event enrichment: concurrent lookups, deferred migration matching and emission.
//!
//! Every [`TokenEvent`] runs in its own task gated by a semaphore. The task spawns the
//! social and aggregate lookups, then either finalises straight away (migration stat
//! already cached, or the match window already closed) or parks the event in the
//! [`DeferredMatcher`]. A poller sweeps the matcher until the [`RunSignal`] stops, and
//! whatever is still pending afterwards is finalised as timed out.

use crate::{
    aggregate::AggregationEngine,
    config::EnrichmentSettings,
    error::LookupError,
    event::{AggregateOutcome, MigrationOutcome, TokenEvent},
    signal::RunSignal,
    sink::Emitter,
    social::{SocialGraphGateway, SocialOutcome},
    stream::MigrationStatCache,
};
use chrono::Utc;
use matcher::{DeferredMatcher, LookupHandles, PendingEvent, Phase};
use metadata::MetadataResolver;
use std::sync::Arc;
use tokio::{
    sync::{Semaphore, mpsc},
    task::JoinSet,
    time::Instant,
};
use tracing::{debug, info, warn};

/// Pending-event queue and phase tracking.
pub mod matcher;

/// Metadata uri to social url resolution.
pub mod metadata;

/// Lookup services shared by every enrichment task.
#[derive(Debug, Clone)]
pub struct EnrichmentServices {
    pub social: Arc<SocialGraphGateway>,
    pub aggregates: Arc<AggregationEngine>,
    pub metadata: Arc<MetadataResolver>,
    pub migrations: Arc<MigrationStatCache>,
}

/// Drives every received [`TokenEvent`] through enrichment to the [`Emitter`].
#[derive(Debug, Clone)]
pub struct EnrichmentScheduler {
    inner: Arc<Enricher>,
}

#[derive(Debug)]
struct Enricher {
    services: EnrichmentServices,
    matcher: DeferredMatcher,
    emitter: Emitter,
    settings: EnrichmentSettings,
}

impl EnrichmentScheduler {
    pub fn new(services: EnrichmentServices, emitter: Emitter, settings: EnrichmentSettings) -> Self {
        let matcher = DeferredMatcher::new(settings.pending_capacity, settings.max_processing_time);
        Self {
            inner: Arc::new(Enricher {
                services,
                matcher,
                emitter,
                settings,
            }),
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.matcher.len()
    }

    /// Consume events until `running` stops or the event channel closes.
    ///
    /// Returns once every in-flight task has finished and the pending queue has been
    /// flushed, so each received event is emitted exactly once.
    pub async fn run(self, events_rx: mpsc::UnboundedReceiver<TokenEvent>, running: RunSignal) {
        info!(
            workers = self.inner.settings.workers,
            match_window_ms = self.inner.settings.match_window.as_millis() as u64,
            max_processing_ms = self.inner.settings.max_processing_time.as_millis() as u64,
            "enrichment scheduler started"
        );

        let poller = tokio::spawn(Arc::clone(&self.inner).poll(running.clone()));
        Arc::clone(&self.inner).dispatch(events_rx, running).await;

        if let Err(error) = poller.await {
            warn!(%error, "matcher poller task failed");
        }

        let remaining = self.inner.matcher.drain();
        if !remaining.is_empty() {
            info!(count = remaining.len(), "finalising pending events on shutdown");
        }

        let mut flush = JoinSet::new();
        for pending in remaining {
            let enricher = Arc::clone(&self.inner);
            flush.spawn(async move { enricher.finalise(pending, MigrationOutcome::Unavailable).await });
        }
        while flush.join_next().await.is_some() {}

        info!("enrichment scheduler stopped");
    }
}

impl Enricher {
    async fn dispatch(self: Arc<Self>, mut events_rx: mpsc::UnboundedReceiver<TokenEvent>, running: RunSignal) {
        let permits = Arc::new(Semaphore::new(self.settings.workers.max(1)));
        let mut tasks = JoinSet::new();

        loop {
            let event = tokio::select! {
                _ = running.stopped() => break,
                event = events_rx.recv() => match event {
                    Some(event) => event,
                    None => {
                        debug!("event channel closed");
                        break;
                    }
                },
            };

            let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
                break;
            };

            let enricher = Arc::clone(&self);
            tasks.spawn(async move {
                enricher.orchestrate(event).await;
                drop(permit);
            });

            while let Some(result) = tasks.try_join_next() {
                if let Err(error) = result {
                    warn!(%error, "enrichment task failed");
                }
            }
        }

        let dropped = events_rx.len();
        if dropped > 0 {
            warn!(dropped, "events left unprocessed on shutdown");
        }

        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                warn!(%error, "enrichment task failed");
            }
        }
    }

    async fn poll(self: Arc<Self>, running: RunSignal) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        let mut finalising = JoinSet::new();

        loop {
            tokio::select! {
                _ = running.stopped() => break,
                _ = interval.tick() => {}
            }

            for (pending, migration) in self.matcher.sweep(&self.services.migrations, Utc::now()) {
                let enricher = Arc::clone(&self);
                finalising.spawn(async move { enricher.finalise(pending, migration).await });
            }

            while finalising.try_join_next().is_some() {}
        }

        while finalising.join_next().await.is_some() {}
    }

    async fn orchestrate(self: Arc<Self>, event: TokenEvent) {
        let lookups = self.spawn_lookups(&event);
        let mut pending = PendingEvent::new(event, lookups);

        let stat = self.services.migrations.lookup(
            &pending.event.token_address,
            &pending.event.pair_address,
            Utc::now(),
        );

        if let Some(stat) = stat {
            pending.advance(Phase::Matched);
            self.finalise(pending, MigrationOutcome::Matched(stat.counts())).await;
            return;
        }

        if pending.event.received_at.elapsed() < self.settings.match_window {
            match self.matcher.enqueue(pending) {
                Ok(()) => return,
                Err(rejected) => {
                    warn!(token = %rejected.event.token_address, "pending queue full, emitting unmatched");
                    pending = rejected;
                }
            }
        }

        pending.advance(Phase::TimedOut);
        self.finalise(pending, MigrationOutcome::Unavailable).await;
    }

    fn spawn_lookups(&self, event: &TokenEvent) -> LookupHandles {
        let social = {
            let services = self.services.clone();
            let social_url = event.social_url.clone();
            let metadata_uri = event.metadata_uri.clone();

            tokio::spawn(async move {
                let url = match (social_url, metadata_uri) {
                    (Some(url), _) => Some(url),
                    (None, Some(uri)) => services.metadata.resolve(&uri).await,
                    (None, None) => None,
                };
                let outcome = services.social.lookup(url.as_deref()).await;
                (url, outcome)
            })
        };

        let aggregate = {
            let aggregates = Arc::clone(&self.services.aggregates);
            let originator = event.deployer_address.clone();

            tokio::spawn(async move {
                let Some(originator) = originator else {
                    return AggregateOutcome::from(LookupError::Payload("no originator address".to_string()));
                };

                match aggregates.aggregate(&originator).await {
                    Ok(resolved) => AggregateOutcome::Resolved {
                        aggregate: resolved.value,
                        cached: resolved.cached,
                    },
                    Err(error) => AggregateOutcome::from(error),
                }
            })
        };

        LookupHandles { social, aggregate }
    }

    /// Wait for both lookups up to `lookup_timeout`, then emit.
    ///
    /// Lookups still running at the deadline are detached rather than aborted, so their
    /// results still reach the caches for later events.
    async fn finalise(&self, mut pending: PendingEvent, migration: MigrationOutcome) {
        let deadline = Instant::now() + self.settings.lookup_timeout;

        let (social_url, social) = match tokio::time::timeout_at(deadline, &mut pending.lookups.social).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(error)) => (
                pending.event.social_url.clone(),
                SocialOutcome::from(LookupError::Task(error.to_string())),
            ),
            Err(_) => (pending.event.social_url.clone(), SocialOutcome::from(LookupError::Timeout)),
        };

        let aggregate = match tokio::time::timeout_at(deadline, &mut pending.lookups.aggregate).await {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(error)) => AggregateOutcome::from(LookupError::Task(error.to_string())),
            Err(_) => AggregateOutcome::from(LookupError::Timeout),
        };

        if !pending.advance(Phase::Emitted) {
            return;
        }

        self.emitter.emit(pending.event, social_url, social, aggregate, migration);
    }
}
