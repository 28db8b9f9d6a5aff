use crate::{
    config::FeedSettings,
    credential::CredentialStore,
    error::DataError,
    event::TokenEvent,
    signal::RunSignal,
    stream::{
        migration::MigrationStatCache,
        protocol::{FeedFrame, JoinRequest, NewPairContent, PulseRow, Room},
        watchdog::{FeedWatchdog, Watched},
    },
};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{
            HeaderValue,
            header::{COOKIE, ORIGIN},
        },
    },
};
use tracing::{debug, error, info, warn};
use url::Url;

type FeedSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the feed connection, published through a `watch` channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// What a single feed frame turned into.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    Event,
    Snapshot { accepted: usize },
    Ignored,
}

/// Long-lived consumer of the token feed.
///
/// `new_pairs` frames become [`TokenEvent`]s handed to the enrichment scheduler over an
/// unbounded channel, so the receive loop never blocks on enrichment. `update_pulse_v2`
/// frames refresh the shared [`MigrationStatCache`].
#[derive(Debug)]
pub struct StreamConsumer {
    feed_url: String,
    origin: String,
    settings: FeedSettings,
    credentials: Arc<CredentialStore>,
    migrations: Arc<MigrationStatCache>,
    events_tx: mpsc::UnboundedSender<TokenEvent>,
    running: RunSignal,
    state_tx: watch::Sender<ConnectionState>,
}

impl StreamConsumer {
    pub fn new(
        feed_url: impl Into<String>,
        origin: impl Into<String>,
        settings: FeedSettings,
        credentials: Arc<CredentialStore>,
        migrations: Arc<MigrationStatCache>,
        events_tx: mpsc::UnboundedSender<TokenEvent>,
        running: RunSignal,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            feed_url: feed_url.into(),
            origin: origin.into(),
            settings,
            credentials,
            migrations,
            events_tx,
            running,
            state_tx,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Run the connect/consume/reconnect loop until the [`RunSignal`] is stopped.
    ///
    /// Returns [`DataError::AuthFatal`] if the feed rejects the handshake and the
    /// credential refresh fails too.
    pub async fn run(&self) -> Result<(), DataError> {
        info!(url = %self.feed_url, "starting feed consumer");

        while self.running.is_running() {
            self.set_state(ConnectionState::Connecting);

            if let Err(error) = self.credentials.ensure_fresh().await {
                warn!(%error, "pre-connect credential refresh failed");
            }

            match self.connect().await {
                Ok(socket) => {
                    info!(url = %self.feed_url, "feed connected");
                    self.set_state(ConnectionState::Connected);
                    self.consume(socket).await;
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(error) if error.is_auth_failure() => {
                    warn!(%error, "feed rejected credentials, refreshing");
                    if let Err(refresh_error) = self.credentials.refresh().await {
                        error!(%refresh_error, "credential refresh failed, stopping feed consumer");
                        self.set_state(ConnectionState::Stopped);
                        return Err(DataError::AuthFatal(refresh_error.to_string()));
                    }
                    self.set_state(ConnectionState::Disconnected);
                }
                Err(error @ DataError::Url(_)) => {
                    self.set_state(ConnectionState::Stopped);
                    return Err(error);
                }
                Err(error) => {
                    error!(%error, url = %self.feed_url, "failed to connect to feed");
                    self.set_state(ConnectionState::Disconnected);
                }
            }

            if !self.running.is_running() {
                break;
            }

            debug!(delay = ?self.settings.reconnect_delay, "waiting before reconnecting");
            tokio::select! {
                _ = self.running.stopped() => break,
                _ = tokio::time::sleep(self.settings.reconnect_delay) => {}
            }
        }

        self.set_state(ConnectionState::Stopped);
        info!("feed consumer stopped");
        Ok(())
    }

    async fn connect(&self) -> Result<FeedSocket, DataError> {
        let url = Url::parse(&self.feed_url).map_err(|error| DataError::Url(error.to_string()))?;
        let mut request = url.as_str().into_client_request()?;

        let cookie = HeaderValue::from_str(&self.credentials.current().cookie_header())
            .map_err(|error| DataError::Socket(format!("invalid cookie header: {error}")))?;
        let origin = HeaderValue::from_str(&self.origin)
            .map_err(|error| DataError::Socket(format!("invalid origin header: {error}")))?;

        let headers = request.headers_mut();
        headers.insert(COOKIE, cookie);
        headers.insert(ORIGIN, origin);

        let (socket, response) = connect_async(request).await?;
        debug!(status = %response.status(), "feed handshake completed");

        Ok(socket)
    }

    async fn consume(&self, socket: FeedSocket) {
        let (mut write, mut read) = socket.split();

        for room in Room::ALL {
            let join = match serde_json::to_string(&JoinRequest::new(room)) {
                Ok(join) => join,
                Err(error) => {
                    error!(%error, %room, "failed to encode join request");
                    return;
                }
            };
            if let Err(error) = write.send(Message::Text(join.into())).await {
                warn!(%error, %room, "failed to join room");
                return;
            }
            debug!(%room, "joined room");
        }

        let mut watchdog = FeedWatchdog::new(self.settings.read_timeout);
        let mut ping = tokio::time::interval_at(
            Instant::now() + self.settings.ping_interval,
            self.settings.ping_interval,
        );

        loop {
            tokio::select! {
                _ = self.running.stopped() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                _ = ping.tick() => {
                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        debug!("failed to send ping, connection likely dead");
                        break;
                    }
                }
                watched = watchdog.next(&mut read) => match watched {
                    Watched::Frame(Ok(Message::Text(text))) => {
                        self.handle_frame(text.as_str());
                    }
                    Watched::Frame(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                        Ok(text) => {
                            self.handle_frame(text);
                        }
                        Err(error) => debug!(%error, "ignoring non utf-8 binary frame"),
                    },
                    Watched::Frame(Ok(Message::Close(frame))) => {
                        info!(?frame, "feed closed by server");
                        break;
                    }
                    Watched::Frame(Ok(_)) => {}
                    Watched::Frame(Err(error)) => {
                        warn!(%error, "feed read error");
                        break;
                    }
                    Watched::Ended => {
                        info!("feed stream ended");
                        break;
                    }
                    Watched::Idle { quiet_for } => {
                        warn!(quiet_secs = quiet_for.as_secs(), "feed went quiet, treating as closed");
                        break;
                    }
                },
            }
        }

        info!(frames = watchdog.frames(), "feed session ended");
    }

    /// Decode and route one text frame.
    pub fn handle_frame(&self, text: &str) -> FrameOutcome {
        let frame = match serde_json::from_str::<FeedFrame>(text) {
            Ok(frame) => frame,
            Err(error) => {
                debug!(%error, "ignoring undecodable frame");
                return FrameOutcome::Ignored;
            }
        };

        match frame.room() {
            Some(Room::NewPairs) => {
                let event = serde_json::from_value::<NewPairContent>(frame.content)
                    .ok()
                    .and_then(|content| {
                        content.into_event(frame.created_at.as_deref(), Instant::now())
                    });

                let Some(event) = event else {
                    debug!("dropping new pair without token or pair address");
                    return FrameOutcome::Ignored;
                };

                debug!(token = %event.token_address, ticker = %event.token_ticker, "new pair");
                if self.events_tx.send(event).is_err() {
                    warn!("enrichment scheduler is gone, dropping event");
                }
                FrameOutcome::Event
            }
            Some(Room::PulseUpdates) => {
                let rows = PulseRow::decode_all(&frame.content);
                let accepted = self.migrations.apply_batch(rows, Utc::now());
                FrameOutcome::Snapshot { accepted }
            }
            None => FrameOutcome::Ignored,
        }
    }
}
