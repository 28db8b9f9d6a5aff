use chrono::Utc;
use futures::{SinkExt, StreamExt};
use pulse_data::{BroadcastSink, EnrichedRecord, Tracker, TrackerConfig};
use std::{net::SocketAddr, process::ExitCode, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast::{self, error::RecvError},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Listener address and broadcast buffer, from `PULSE_WS_ADDR` and `PULSE_WS_BUFFER_SIZE`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct ServerSettings {
    addr: SocketAddr,
    buffer_size: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 9001)),
            buffer_size: 10_000,
        }
    }
}

impl ServerSettings {
    fn from_env() -> Self {
        Self::from_vars(
            std::env::var("PULSE_WS_ADDR").ok().as_deref(),
            std::env::var("PULSE_WS_BUFFER_SIZE").ok().as_deref(),
        )
    }

    /// Unparseable values fall back to the defaults.
    fn from_vars(addr: Option<&str>, buffer_size: Option<&str>) -> Self {
        let defaults = Self::default();
        Self {
            addr: addr
                .and_then(|addr| addr.trim().parse().ok())
                .unwrap_or(defaults.addr),
            buffer_size: buffer_size
                .and_then(|size| size.trim().parse().ok())
                .filter(|size| *size > 0)
                .unwrap_or(defaults.buffer_size),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let settings = ServerSettings::from_env();
    info!(addr = %settings.addr, buffer_size = settings.buffer_size, "starting pulse-data server");

    let listener = match TcpListener::bind(settings.addr).await {
        Ok(listener) => listener,
        Err(error) => {
            error!(%error, addr = %settings.addr, "failed to bind broadcast server");
            return ExitCode::FAILURE;
        }
    };

    let sink = BroadcastSink::new(settings.buffer_size);
    tokio::spawn(serve(listener, sink.clone()));

    let config = TrackerConfig::from_env();
    let tracker = match Tracker::from_config(&config, Arc::new(sink)) {
        Ok(tracker) => tracker,
        Err(error) => {
            error!(%error, auth_file = %config.auth_file.display(), "failed to initialise tracker");
            return ExitCode::FAILURE;
        }
    };

    let running = tracker.handle();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "failed to listen for ctrl-c");
            return;
        }
        info!("shutdown requested");
        running.stop();
    });

    match tracker.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "tracker terminated");
            ExitCode::FAILURE
        }
    }
}

/// Accept WebSocket clients until the listener fails.
async fn serve(listener: TcpListener, sink: BroadcastSink) {
    loop {
        match listener.accept().await {
            Ok((stream, peer_addr)) => {
                info!(%peer_addr, "client connected");
                tokio::spawn(handle_client(stream, peer_addr, sink.subscribe()));
            }
            Err(error) => {
                error!(%error, "failed to accept connection");
                break;
            }
        }
    }
}

/// Forward broadcast records to one client until either side goes away.
///
/// Clients are read-only: anything they send other than a close is ignored.
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    mut records: broadcast::Receiver<EnrichedRecord>,
) {
    let socket = match accept_async(stream).await {
        Ok(socket) => socket,
        Err(error) => {
            warn!(%peer_addr, %error, "client handshake failed");
            return;
        }
    };
    let (mut outbound, mut inbound) = socket.split();

    if outbound.send(welcome_frame()).await.is_err() {
        debug!(%peer_addr, "client left before welcome");
        return;
    }

    let mut delivered = 0_u64;
    let reason = loop {
        tokio::select! {
            record = records.recv() => match record {
                Ok(record) => {
                    let Some(frame) = record_frame(&record) else {
                        continue;
                    };
                    if outbound.send(frame).await.is_err() {
                        break "send failed";
                    }
                    delivered += 1;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(%peer_addr, skipped, "client lagging, records skipped");
                }
                Err(RecvError::Closed) => break "tracker stopped",
            },
            message = inbound.next() => match message {
                Some(Ok(Message::Close(_))) | None => break "client closed",
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    debug!(%peer_addr, %error, "client read failed");
                    break "client error";
                }
            },
        }
    };

    info!(%peer_addr, delivered, reason, "client disconnected");
}

fn welcome_frame() -> Message {
    let welcome = serde_json::json!({
        "type": "welcome",
        "feed": "pulse-data",
        "timestamp": Utc::now(),
    });
    Message::Text(welcome.to_string().into())
}

fn record_frame(record: &EnrichedRecord) -> Option<Message> {
    match serde_json::to_string(record) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(error) => {
            warn!(%error, counter = record.counter, "failed to serialise record");
            None
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}
