use crate::{
    aggregate::AggregationEngine,
    config::TrackerConfig,
    credential::CredentialStore,
    enrich::{EnrichmentScheduler, EnrichmentServices, metadata::MetadataResolver},
    error::DataError,
    event::TokenEvent,
    http::{HttpTransport, RateLimitedClient, ReqwestTransport},
    market::{MarketDataGateway, PriceOracle},
    signal::RunSignal,
    sink::{Emitter, OutputSink},
    social::SocialGraphGateway,
    stream::{ConnectionState, MigrationStatCache, StreamConsumer},
};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

impl EnrichmentServices {
    /// Build every lookup service from the [`TrackerConfig`], sharing one transport and
    /// one [`CredentialStore`].
    pub fn from_config(
        config: &TrackerConfig,
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        let endpoints = &config.endpoints;
        let caches = &config.caches;
        let client = RateLimitedClient::new(Arc::clone(&transport), config.retry);

        let market = Arc::new(MarketDataGateway::new(
            client.clone(),
            Arc::clone(&credentials),
            &endpoints.api_host,
            endpoints.origin.as_str(),
            caches.peak_price_ttl,
            caches.max_entries,
        ));

        let oracle = Arc::new(PriceOracle::new(
            client.clone(),
            endpoints.oracle_url.as_str(),
            caches.oracle_ttl,
        ));

        let aggregates = AggregationEngine::new(
            client.clone(),
            credentials,
            endpoints.dev_tokens_url.as_str(),
            endpoints.origin.as_str(),
            market,
            oracle,
            caches.aggregate_ttl,
            caches.max_entries,
        )
        .with_instrument_count(config.enrichment.avg_tokens_count)
        .with_fanout_concurrency(config.enrichment.fanout_concurrency);

        if config.social_api_key.is_empty() {
            warn!("no social API key configured, social lookups will be rejected");
        }

        Self {
            social: Arc::new(SocialGraphGateway::new(
                client,
                endpoints.social_api.as_str(),
                config.social_api_key.as_str(),
                caches.social_ttl,
                caches.max_entries,
            )),
            aggregates: Arc::new(aggregates),
            metadata: Arc::new(MetadataResolver::new(
                transport,
                config.enrichment.metadata_timeout,
                caches.metadata_ttl,
                caches.max_entries,
            )),
            migrations: Arc::new(MigrationStatCache::new(
                caches.migration_freshness,
                caches.migration_capacity,
            )),
        }
    }
}

/// Entry point wiring the feed consumer to the enrichment scheduler.
///
/// ```ignore
/// let sink = Arc::new(BroadcastSink::new(10_000));
/// let tracker = Tracker::from_config(&TrackerConfig::from_env(), sink)?;
/// let running = tracker.handle();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     running.stop();
/// });
/// tracker.run().await?;
/// ```
#[derive(Debug)]
pub struct Tracker {
    consumer: StreamConsumer,
    scheduler: EnrichmentScheduler,
    events_rx: mpsc::UnboundedReceiver<TokenEvent>,
    running: RunSignal,
}

impl Tracker {
    /// Construct a [`Tracker`] using a `reqwest` backed transport.
    pub fn from_config(config: &TrackerConfig, sink: Arc<dyn OutputSink>) -> Result<Self, DataError> {
        Self::new(config, Arc::new(ReqwestTransport::new(reqwest::Client::new())), sink)
    }

    /// Construct a [`Tracker`], loading the credential pair from `config.auth_file`.
    pub fn new(
        config: &TrackerConfig,
        transport: Arc<dyn HttpTransport>,
        sink: Arc<dyn OutputSink>,
    ) -> Result<Self, DataError> {
        let credentials = CredentialStore::load(
            &config.auth_file,
            config.endpoints.refresh_url.as_str(),
            config.endpoints.origin.as_str(),
            Arc::clone(&transport),
        )?
        .with_leeway(config.feed.token_leeway);

        Ok(Self::with_credentials(config, transport, Arc::new(credentials), sink))
    }

    pub fn with_credentials(
        config: &TrackerConfig,
        transport: Arc<dyn HttpTransport>,
        credentials: Arc<CredentialStore>,
        sink: Arc<dyn OutputSink>,
    ) -> Self {
        let services = EnrichmentServices::from_config(config, transport, Arc::clone(&credentials));
        let running = RunSignal::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let consumer = StreamConsumer::new(
            config.endpoints.feed_url.as_str(),
            config.endpoints.origin.as_str(),
            config.feed,
            credentials,
            Arc::clone(&services.migrations),
            events_tx,
            running.clone(),
        );

        let scheduler = EnrichmentScheduler::new(services, Emitter::new(sink), config.enrichment);

        Self {
            consumer,
            scheduler,
            events_rx,
            running,
        }
    }

    /// Handle used to stop a running [`Tracker`] from another task.
    pub fn handle(&self) -> RunSignal {
        self.running.clone()
    }

    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.consumer.subscribe_state()
    }

    /// Run until stopped or until the feed fails fatally.
    ///
    /// Every event received before shutdown is emitted before this returns.
    pub async fn run(self) -> Result<(), DataError> {
        let Self {
            consumer,
            scheduler,
            events_rx,
            running,
        } = self;

        let enrichment = tokio::spawn(scheduler.run(events_rx, running.clone()));
        let result = consumer.run().await;

        running.stop();
        drop(consumer);

        if let Err(error) = enrichment.await {
            warn!(%error, "enrichment scheduler task failed");
        }

        match &result {
            Ok(()) => info!("tracker stopped"),
            Err(error) => warn!(%error, "tracker stopped on fatal error"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credential::{Credential, tests::fresh_jwt},
        error::CredentialError,
        http::tests::ScriptedTransport,
        sink::ChannelSink,
    };

    #[test]
    fn test_new_missing_auth_file_is_credential_error() {
        let config = TrackerConfig::default().with_auth_file("/definitely/not/here/auth_data.json");
        let (sink, _records) = ChannelSink::new();

        let error = Tracker::new(&config, Arc::new(ScriptedTransport::default()), Arc::new(sink))
            .unwrap_err();

        assert!(matches!(
            error,
            DataError::Credential(CredentialError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_run_returns_once_stopped() {
        let transport = Arc::new(ScriptedTransport::default());
        let credentials = Arc::new(CredentialStore::new(
            Credential::new(fresh_jwt(), "refresh"),
            "https://auth/refresh",
            "https://origin",
            transport.clone(),
        ));
        let (sink, _records) = ChannelSink::new();
        let tracker = Tracker::with_credentials(
            &TrackerConfig::default(),
            transport.clone(),
            credentials,
            Arc::new(sink),
        );

        let state = tracker.state();
        tracker.handle().stop();

        assert_eq!(tracker.run().await, Ok(()));
        assert_eq!(*state.borrow(), ConnectionState::Stopped);
        assert_eq!(transport.request_count(), 0);
    }
}
