use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pulse_data::{
    ChannelSink, EnrichedRecord, RunSignal, TokenEvent, Tracker, TrackerConfig,
    aggregate::{AggregateMarketCap, InstrumentComponent},
    config::{EnrichmentSettings, Endpoints},
    credential::{Credential, CredentialStore},
    enrich::{EnrichmentScheduler, EnrichmentServices},
    error::TransportError,
    event::{AggregateOutcome, MigrationCounts, MigrationOutcome},
    http::{HttpRequest, HttpResponse, HttpTransport},
    sink::Emitter,
    social::SocialOutcome,
    stream::{MigrationStatCache, protocol::PulseRow},
};
use serde_json::json;
use smol_str::SmolStr;
use std::{sync::Arc, time::Duration};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Fake upstream APIs, recording every requested url.
#[derive(Debug, Default)]
struct FakeApi {
    requests: Mutex<Vec<String>>,
}

impl FakeApi {
    fn count(&self, fragment: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|url| url.contains(fragment))
            .count()
    }
}

fn json_response(body: serde_json::Value) -> HttpResponse {
    HttpResponse::new(200, body.to_string()).with_header("Content-Type", "application/json")
}

#[async_trait]
impl HttpTransport for FakeApi {
    async fn send(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().push(request.url.clone());

        let response = if request.url.contains("/twitter/user/info") {
            json_response(json!({"data": {"followers": 1200, "following": 80}}))
        } else if request.url.contains("/dev-tokens") {
            json_response(json!({
                "tokens": [{
                    "createdAt": "2025-01-02T00:00:00Z",
                    "priceSol": 0.25,
                    "supply": 1_000_000.0,
                    "pairAddress": "dev-pair",
                    "tokenTicker": "OLD"
                }]
            }))
        } else if request.url.contains("/pair-chart") {
            json_response(json!({"bars": [[0, 0.3, 0.5, 0.2, 0.4, 1000]]}))
        } else if request.url.contains("/price") {
            json_response(json!({"solana": {"usd": 100.0}}))
        } else if request.url.contains("/meta/") {
            json_response(json!({"extensions": {"twitter": "https://x.com/pulse_dev"}}))
        } else {
            HttpResponse::new(404, "")
        };

        Ok(response)
    }
}

fn fresh_jwt() -> String {
    let exp = Utc::now().timestamp() + 3600;
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp}}}"#));
    format!("eyJhbGciOiJIUzI1NiJ9.{payload}.signature")
}

fn config(feed_url: &str, enrichment: EnrichmentSettings) -> TrackerConfig {
    TrackerConfig::default()
        .with_social_api_key("test-key")
        .with_endpoints(Endpoints {
            feed_url: feed_url.to_string(),
            origin: "http://origin".to_string(),
            api_host: "http://api".to_string(),
            dev_tokens_url: "http://api/dev-tokens-v2".to_string(),
            refresh_url: "http://auth/refresh-access-token".to_string(),
            social_api: "http://social".to_string(),
            oracle_url: "http://oracle/price".to_string(),
        })
        .with_enrichment(enrichment)
}

fn credentials(api: &Arc<FakeApi>) -> Arc<CredentialStore> {
    Arc::new(CredentialStore::new(
        Credential::new(fresh_jwt(), "refresh"),
        "http://auth/refresh-access-token",
        "http://origin",
        api.clone(),
    ))
}

struct Harness {
    api: Arc<FakeApi>,
    migrations: Arc<MigrationStatCache>,
    events_tx: mpsc::UnboundedSender<TokenEvent>,
    records: mpsc::UnboundedReceiver<EnrichedRecord>,
    running: RunSignal,
    task: JoinHandle<()>,
}

impl Harness {
    fn start(enrichment: EnrichmentSettings) -> Self {
        init_logging();

        let api = Arc::new(FakeApi::default());
        let config = config("ws://unused", enrichment);
        let services = EnrichmentServices::from_config(&config, api.clone(), credentials(&api));
        let migrations = Arc::clone(&services.migrations);

        let (sink, records) = ChannelSink::new();
        let scheduler = EnrichmentScheduler::new(services, Emitter::new(Arc::new(sink)), enrichment);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let running = RunSignal::new();
        let task = tokio::spawn(scheduler.run(events_rx, running.clone()));

        Self {
            api,
            migrations,
            events_tx,
            records,
            running,
            task,
        }
    }

    async fn next_record(&mut self) -> EnrichedRecord {
        tokio::time::timeout(Duration::from_secs(5), self.records.recv())
            .await
            .expect("record within 5s")
            .expect("sink open")
    }

    async fn shutdown(self) {
        self.running.stop();
        tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("scheduler stops within 5s")
            .expect("scheduler task");
    }
}

fn event(token: &str) -> TokenEvent {
    TokenEvent {
        token_address: SmolStr::new(token),
        pair_address: SmolStr::new(format!("{token}-pair")),
        token_name: SmolStr::new("Pulse"),
        token_ticker: SmolStr::new("PLS"),
        deployer_address: None,
        social_url: None,
        metadata_uri: None,
        protocol: SmolStr::new("Pump V1"),
        created_at: Some(Utc::now()),
        received_at: Instant::now(),
    }
}

fn stat(token: &str, migrated: u64, total: u64) -> PulseRow {
    PulseRow {
        token_address: SmolStr::new(token),
        pair_address: SmolStr::new(format!("{token}-pair")),
        observed_at: Utc::now(),
        migrated,
        total,
    }
}

#[tokio::test]
async fn test_post_url_is_skipped_without_social_call() {
    let mut harness = Harness::start(EnrichmentSettings::default());
    harness.migrations.apply_batch([stat("post", 1, 2)], Utc::now());

    harness.events_tx
        .send(TokenEvent {
            social_url: Some("https://x.com/someone/status/1234567890".to_string()),
            deployer_address: Some(SmolStr::new("dev-wallet")),
            ..event("post")
        })
        .unwrap();

    let record = harness.next_record().await;

    assert_eq!(record.twitter_stats, SocialOutcome::skipped());
    assert_eq!(harness.api.count("/twitter/"), 0);
    assert_eq!(record.migration, MigrationOutcome::Matched(MigrationCounts::new(1, 2)));
    assert_eq!(
        record.dev_mcap_info,
        AggregateOutcome::Resolved {
            aggregate: AggregateMarketCap {
                avg_mcap: 25_000_000.0,
                avg_peak_mcap: Some(500_000.0),
                valid_instruments: 1,
                components: vec![InstrumentComponent {
                    pair_address: Some(SmolStr::new("dev-pair")),
                    ticker: SmolStr::new("OLD"),
                    mcap: 25_000_000.0,
                    supply: 1_000_000.0,
                    peak_mcap: Some(500_000.0),
                }],
            },
            cached: false,
        }
    );

    let serialised = serde_json::to_value(&record).unwrap();
    assert_eq!(serialised["twitter_stats"], json!({"skipped": true}));
    assert_eq!(serialised["migration"]["percentage"], json!(50.0));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_stat_arriving_late_is_matched() {
    let mut harness = Harness::start(EnrichmentSettings::default());

    harness.events_tx.send(event("late")).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    harness.migrations.apply_batch([stat("late", 3, 4)], Utc::now());

    let record = harness.next_record().await;

    assert_eq!(record.token_address, "late");
    assert_eq!(record.migration, MigrationOutcome::Matched(MigrationCounts::new(3, 4)));
    assert!(record.processing_time_ms >= 200);
    assert!(record.processing_time_ms < 2_000);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_event_is_emitted_unavailable_after_ceiling() {
    let mut harness = Harness::start(EnrichmentSettings {
        max_processing_time: Duration::from_millis(500),
        ..EnrichmentSettings::default()
    });

    harness.events_tx.send(event("orphan")).unwrap();
    let record = harness.next_record().await;

    assert_eq!(record.migration, MigrationOutcome::Unavailable);
    assert!(record.processing_time_ms >= 500);
    assert_eq!(serde_json::to_value(&record).unwrap()["migration"], json!("unavailable"));
    assert_eq!(
        record.dev_mcap_info,
        AggregateOutcome::Error {
            error: "no originator address".to_string()
        }
    );

    harness.shutdown().await;
}

#[tokio::test]
async fn test_metadata_uri_supplies_social_url() {
    let mut harness = Harness::start(EnrichmentSettings::default());
    harness.migrations.apply_batch([stat("meta", 0, 0)], Utc::now());

    harness.events_tx
        .send(TokenEvent {
            metadata_uri: Some("http://ipfs/meta/meta.json".to_string()),
            ..event("meta")
        })
        .unwrap();

    let record = harness.next_record().await;

    assert_eq!(record.twitter.as_deref(), Some("https://x.com/pulse_dev"));
    assert_eq!(
        record.twitter_stats,
        SocialOutcome::User {
            followers: 1200,
            following: 80
        }
    );
    assert_eq!(record.migration, MigrationOutcome::Matched(MigrationCounts::new(0, 0)));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_counters_strictly_increase() {
    let mut harness = Harness::start(EnrichmentSettings {
        max_processing_time: Duration::from_millis(300),
        ..EnrichmentSettings::default()
    });

    let tokens = (0..25).map(|index| format!("token-{index}")).collect::<Vec<_>>();
    harness.migrations.apply_batch(
        tokens.iter().step_by(2).map(|token| stat(token, 1, 1)),
        Utc::now(),
    );

    for token in &tokens {
        harness.events_tx.send(event(token)).unwrap();
    }

    let mut counters = Vec::new();
    for _ in &tokens {
        counters.push(harness.next_record().await.counter);
    }

    assert!(counters.windows(2).all(|pair| pair[0] < pair[1]));
    assert_eq!(counters, (1..=25).collect::<Vec<u64>>());

    harness.shutdown().await;
}

#[tokio::test]
async fn test_tracker_enriches_events_from_feed() {
    init_logging();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let feed = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut socket = accept_async(stream).await.unwrap();

        let mut joined = 0;
        while joined < 2 {
            if let Some(Ok(Message::Text(_))) = socket.next().await {
                joined += 1;
            }
        }

        let mut row = vec![serde_json::Value::Null; 42];
        row[0] = json!("feed-token");
        row[1] = json!("feed-pair");
        row[30] = json!(Utc::now().to_rfc3339());
        row[33] = json!(2);
        row[41] = json!(8);
        let snapshot = json!({"room": "update_pulse_v2", "content": [row]});
        socket.send(Message::Text(snapshot.to_string().into())).await.unwrap();

        let new_pair = json!({
            "room": "new_pairs",
            "created_at": "2025-06-01T12:00:00Z",
            "content": {
                "token_address": "feed-token",
                "pair_address": "feed-pair",
                "token_name": "Feed",
                "token_ticker": "FEED",
                "twitter": "https://x.com/feed_dev",
                "protocol": "Pump V1"
            }
        });
        socket.send(Message::Text(new_pair.to_string().into())).await.unwrap();

        while let Some(Ok(message)) = socket.next().await {
            if message.is_close() {
                break;
            }
        }
    });

    let api = Arc::new(FakeApi::default());
    let (sink, mut records) = ChannelSink::new();
    let tracker = Tracker::with_credentials(
        &config(&format!("ws://{addr}"), EnrichmentSettings::default()),
        api.clone(),
        credentials(&api),
        Arc::new(sink),
    );
    let running = tracker.handle();
    let task = tokio::spawn(tracker.run());

    let record = tokio::time::timeout(Duration::from_secs(5), records.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(record.counter, 1);
    assert_eq!(record.token_ticker, "FEED");
    assert_eq!(record.migration, MigrationOutcome::Matched(MigrationCounts::new(2, 8)));
    assert_eq!(
        record.twitter_stats,
        SocialOutcome::User {
            followers: 1200,
            following: 80
        }
    );
    assert_eq!(api.count("/twitter/user/info"), 1);

    running.stop();
    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, Ok(()));

    feed.await.unwrap();
}
