//! Per-shard gateway connection
//!
//! Owns the socket, codec, decompressor and heartbeat timer for one shard and
//! drives its [`ShardSession`]. Reconnects with backoff until the session is
//! closed with a fatal code, the connect attempts run out, or the shard is
//! destroyed.

use crate::config::BackoffConfig;
use crate::error::{CodecError, GatewayError};
use crate::gateway::codec::{Codec, Encoding};
use crate::gateway::compression::{Compression, Decompressor};
use crate::gateway::identify::{IdentifyGate, IdentifyPermit};
use crate::gateway::protocol::{self, GatewayPayload, IdentifyParams};
use crate::gateway::session::{SessionAction, ShardSession, ShardStatus};
use crate::gateway::state::ShardRegistry;
use crate::metrics::GatewayMetrics;
use futures_util::future::BoxFuture;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWrite = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Undecodable frames in a row before the socket is recycled
const MAX_CONSECUTIVE_CODEC_ERRORS: u32 = 5;

/// Close code that keeps the session resumable
const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// Event emitted by a shard
#[derive(Debug, Clone, PartialEq)]
pub enum ShardEvent {
    /// Session established
    Ready {
        shard_id: u32,
        session_id: String,
        data: Value,
    },
    /// Session resumed after a reconnect
    Resumed { shard_id: u32 },
    /// Any other dispatch, in the order received on the shard
    Dispatch {
        shard_id: u32,
        name: String,
        seq: Option<u64>,
        data: Value,
    },
    /// The shard stopped for good; nothing else follows from it
    Terminated {
        shard_id: u32,
        /// Close code when the gateway ended the session
        code: Option<u16>,
        reason: String,
    },
}

impl ShardEvent {
    pub fn shard_id(&self) -> u32 {
        match self {
            Self::Ready { shard_id, .. }
            | Self::Resumed { shard_id }
            | Self::Dispatch { shard_id, .. }
            | Self::Terminated { shard_id, .. } => *shard_id,
        }
    }

    /// Dispatch name as sent by the provider
    pub fn name(&self) -> &str {
        match self {
            Self::Ready { .. } => "READY",
            Self::Resumed { .. } => "RESUMED",
            Self::Dispatch { name, .. } => name,
            Self::Terminated { .. } => "SHARD_TERMINATED",
        }
    }

    /// Terminal notice for a shard that ended with `error`
    pub fn terminated(shard_id: u32, error: &GatewayError) -> Self {
        let code = match error {
            GatewayError::FatalSession { code, .. } => Some(*code),
            _ => None,
        };
        Self::Terminated {
            shard_id,
            code,
            reason: error.to_string(),
        }
    }
}

/// Commands that can be sent to a connection
#[derive(Debug)]
pub enum ShardCommand {
    /// Send a raw payload
    Send(GatewayPayload),
    /// Send an op 3 presence update
    UpdatePresence(Value),
    /// Drop the socket and resume
    Reconnect,
    /// Close for good
    Destroy,
}

/// Settings shared by every shard of a manager
#[derive(Clone)]
pub struct ConnectionSettings {
    pub gateway_url: String,
    pub api_version: u8,
    pub encoding: Encoding,
    pub compression: Compression,
    pub identify: IdentifyParams,
    pub backoff: BackoffConfig,
    pub disabled_events: Arc<std::collections::HashSet<String>>,
}

/// How a single socket lifetime ended
#[derive(Debug)]
enum SocketExit {
    /// Reconnect; `resume` tells whether the session survived
    Reconnect { resume: bool },
    /// Destroyed on request
    Destroyed,
}

/// Socket-scoped state, rebuilt on every connect
struct LiveSocket {
    write: WsWrite,
    decompressor: Option<Box<dyn Decompressor>>,
    heartbeat: Option<Interval>,
    identify_wait: Option<BoxFuture<'static, IdentifyPermit>>,
    codec_errors: u32,
}

/// Manages a single gateway connection with auto-reconnection
pub struct GatewayConnection {
    settings: ConnectionSettings,
    codec: Box<dyn Codec>,
    session: ShardSession,
    gate: Arc<IdentifyGate>,
    registry: ShardRegistry,
    metrics: GatewayMetrics,
    events: mpsc::Sender<ShardEvent>,
    commands: mpsc::Receiver<ShardCommand>,
    /// Fires on the first READY
    ready_tx: Option<oneshot::Sender<()>>,
    /// Current socket reached READY or RESUMED
    established: bool,
}

impl GatewayConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard_id: u32,
        shard_count: u32,
        settings: ConnectionSettings,
        gate: Arc<IdentifyGate>,
        registry: ShardRegistry,
        metrics: GatewayMetrics,
        events: mpsc::Sender<ShardEvent>,
        commands: mpsc::Receiver<ShardCommand>,
    ) -> Result<Self, GatewayError> {
        let codec = settings.encoding.codec()?;
        let session = ShardSession::new(shard_id, shard_count)
            .with_disabled_events(Arc::clone(&settings.disabled_events));
        registry.register(shard_id);

        Ok(Self {
            settings,
            codec,
            session,
            gate,
            registry,
            metrics,
            events,
            commands,
            ready_tx: None,
            established: false,
        })
    }

    /// Signal the first READY on this channel
    pub fn with_ready_signal(mut self, ready_tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(ready_tx);
        self
    }

    pub fn shard_id(&self) -> u32 {
        self.session.shard_id()
    }

    /// Socket URL with version, encoding and compression in the query
    pub fn socket_url(&self) -> Result<Url, GatewayError> {
        let base = self
            .session
            .token()
            .and_then(|t| t.resume_url.as_deref())
            .unwrap_or(&self.settings.gateway_url);
        build_socket_url(
            base,
            self.settings.api_version,
            self.settings.encoding,
            self.settings.compression,
        )
    }

    fn publish(&self) {
        self.registry.publish(&self.session);
        self.metrics
            .set_shard_status(self.shard_id(), self.session.status());
    }

    /// Run the connection loop (reconnects on failure)
    pub async fn run(mut self) -> Result<(), GatewayError> {
        let shard_id = self.shard_id();
        let mut attempt = 0u32;
        let mut first_connect = true;

        loop {
            if !first_connect {
                let delay = self.settings.backoff.delay_for_attempt(attempt);
                debug!(shard_id, delay_ms = delay.as_millis() as u64, attempt, "Reconnecting after delay");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    cmd = self.commands.recv() => {
                        if matches!(cmd, None | Some(ShardCommand::Destroy)) {
                            return self.finish(None);
                        }
                    }
                }
            }
            first_connect = false;

            let outcome = self.connect_and_run().await;
            // Only connects that never reached a session count as failures.
            let established = std::mem::take(&mut self.established);
            if established {
                attempt = 0;
            }

            match outcome {
                Ok(SocketExit::Destroyed) | Err(GatewayError::ShuttingDown) => {
                    return self.finish(None)
                }
                Ok(SocketExit::Reconnect { resume }) => {
                    self.metrics.record_reconnect(shard_id, resume);
                    info!(shard_id, resume, "Shard reconnecting");
                }
                Err(e) if e.is_fatal() => {
                    error!(shard_id, error = %e, "Fatal gateway error");
                    return self.finish(Some(e));
                }
                Err(e) if established => {
                    self.metrics.record_error(e.error_type_label());
                    warn!(shard_id, error = %e, "Gateway connection dropped");
                    if self.session.status() != ShardStatus::Reconnecting {
                        self.session.set_disconnected();
                        self.publish();
                    }
                }
                Err(e) => {
                    self.metrics.record_error(e.error_type_label());
                    attempt += 1;
                    warn!(shard_id, error = %e, attempt, "Gateway connection failed");

                    if attempt >= self.settings.backoff.max_connect_attempts {
                        error!(shard_id, attempts = attempt, "Max reconnection attempts reached");
                        return self.finish(Some(GatewayError::Connection {
                            shard_id,
                            attempts: attempt,
                            last_error: e.to_string(),
                        }));
                    }
                    if self.session.status() != ShardStatus::Reconnecting {
                        self.session.set_disconnected();
                        self.publish();
                    }
                }
            }
        }
    }

    fn finish(&mut self, error: Option<GatewayError>) -> Result<(), GatewayError> {
        self.session.set_idle();
        self.publish();
        match error {
            None => {
                info!(shard_id = self.shard_id(), "Shard destroyed");
                Ok(())
            }
            Some(e) => {
                self.metrics.record_error(e.error_type_label());
                Err(e)
            }
        }
    }

    /// One socket lifetime: connect, handshake, pump frames until it ends
    async fn connect_and_run(&mut self) -> Result<SocketExit, GatewayError> {
        let shard_id = self.shard_id();
        let url = self.socket_url()?;

        self.session.on_connecting();
        self.publish();
        debug!(shard_id, url = %url, "Connecting to gateway");

        let (stream, _) = timeout(
            self.settings.backoff.connect_timeout(),
            tokio_tungstenite::connect_async(url.as_str()),
        )
        .await
        .map_err(|_| GatewayError::Connection {
            shard_id,
            attempts: 1,
            last_error: "connection timeout".to_string(),
        })??;

        info!(shard_id, "Gateway socket open");

        let (write, mut read) = stream.split();
        let mut live = LiveSocket {
            write,
            decompressor: self.settings.compression.decompressor(),
            heartbeat: None,
            identify_wait: None,
            codec_errors: 0,
        };

        self.pump(&mut live, &mut read).await
    }

    async fn pump(
        &mut self,
        live: &mut LiveSocket,
        read: &mut WsRead,
    ) -> Result<SocketExit, GatewayError> {
        let shard_id = self.shard_id();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(message)) => {
                            if let Some(exit) = self.on_message(live, message).await? {
                                return Ok(exit);
                            }
                        }
                        Some(Err(e)) => {
                            self.session.on_close(None);
                            self.publish();
                            return Err(GatewayError::WebSocket(e));
                        }
                        None => {
                            debug!(shard_id, "Gateway stream ended");
                            let action = self.session.on_close(None);
                            self.publish();
                            return self.exit_for(action);
                        }
                    }
                }
                cmd = self.commands.recv() => {
                    if let Some(exit) = self.on_command(live, cmd).await? {
                        return Ok(exit);
                    }
                }
                _ = next_tick(&mut live.heartbeat) => {
                    let action = self.session.heartbeat_tick(Instant::now());
                    if let Some(exit) = self.apply(live, action).await? {
                        return Ok(exit);
                    }
                }
                permit = next_permit(&mut live.identify_wait) => {
                    live.identify_wait = None;
                    let payload = protocol::identify(
                        &self.settings.identify,
                        shard_id,
                        self.session.shard_count(),
                    );
                    self.send(live, &payload).await?;
                    permit.complete();
                    self.session.identify_sent();
                    self.publish();
                    info!(shard_id, shard_count = self.session.shard_count(), "Identify sent");
                }
            }
        }
    }

    async fn on_message(
        &mut self,
        live: &mut LiveSocket,
        message: Message,
    ) -> Result<Option<SocketExit>, GatewayError> {
        let shard_id = self.shard_id();

        let decoded = match message {
            Message::Text(text) => self.codec.decode(text.as_bytes()),
            Message::Binary(data) => match live.decompressor.as_mut() {
                Some(decompressor) => match decompressor.push(&data) {
                    Ok(Some(inflated)) => self.codec.decode(&inflated),
                    Ok(None) => return Ok(None),
                    Err(e) => {
                        decompressor.reset();
                        Err(e)
                    }
                },
                None => self.codec.decode(&data),
            },
            Message::Close(frame) => {
                let code = frame.map(|f| u16::from(f.code));
                info!(shard_id, code, "Gateway closed the connection");
                let action = self.session.on_close(code);
                self.publish();
                return self.exit_for(action).map(Some);
            }
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Ok(None),
        };

        let payload = decoded.and_then(|value| {
            GatewayPayload::from_value(value)
                .map_err(|e| CodecError::decode(self.codec.name(), format!("bad envelope: {e}")))
        });

        let payload = match payload {
            Ok(payload) => {
                live.codec_errors = 0;
                payload
            }
            Err(e) => {
                live.codec_errors += 1;
                self.metrics.record_error("codec");
                warn!(shard_id, error = %e, consecutive = live.codec_errors, "Dropping undecodable frame");
                if live.codec_errors >= MAX_CONSECUTIVE_CODEC_ERRORS {
                    self.session.on_close(None);
                    self.publish();
                    return Err(GatewayError::Codec(e));
                }
                return Ok(None);
            }
        };

        let had_ack = self.session.last_heartbeat_ack();
        let actions = self.session.handle(payload, Instant::now());
        if self.session.last_heartbeat_ack() != had_ack {
            if let Some(latency) = self.session.latest_latency() {
                self.metrics.record_heartbeat_latency(shard_id, latency);
            }
        }

        for action in actions {
            if let Some(exit) = self.apply(live, action).await? {
                return Ok(Some(exit));
            }
        }
        self.publish();
        Ok(None)
    }

    async fn on_command(
        &mut self,
        live: &mut LiveSocket,
        cmd: Option<ShardCommand>,
    ) -> Result<Option<SocketExit>, GatewayError> {
        match cmd {
            Some(ShardCommand::Send(payload)) => {
                self.send(live, &payload).await?;
                Ok(None)
            }
            Some(ShardCommand::UpdatePresence(presence)) => {
                self.send(live, &protocol::presence_update(presence)).await?;
                Ok(None)
            }
            Some(ShardCommand::Reconnect) => {
                self.session.on_close(Some(RESUMABLE_CLOSE_CODE));
                self.publish();
                close(live, RESUMABLE_CLOSE_CODE, "reconnect requested").await;
                Ok(Some(SocketExit::Reconnect {
                    resume: self.session.is_resumable(),
                }))
            }
            Some(ShardCommand::Destroy) | None => {
                close(live, 1000, "destroyed").await;
                Ok(Some(SocketExit::Destroyed))
            }
        }
    }

    async fn apply(
        &mut self,
        live: &mut LiveSocket,
        action: SessionAction,
    ) -> Result<Option<SocketExit>, GatewayError> {
        let shard_id = self.shard_id();

        match action {
            SessionAction::Send(payload) => {
                self.send(live, &payload).await?;
            }
            SessionAction::StartHeartbeat(period) => {
                // First beat lands at a random point inside the first period.
                let first = period.mul_f64(rand::random::<f64>());
                let mut interval = tokio::time::interval_at(Instant::now() + first, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                live.heartbeat = Some(interval);
                debug!(shard_id, interval_ms = period.as_millis() as u64, "Heartbeat started");
            }
            SessionAction::Identify => {
                let gate = Arc::clone(&self.gate);
                live.identify_wait = Some(Box::pin(gate.acquire(shard_id)));
            }
            SessionAction::Resume { session_id, seq } => {
                let payload = protocol::resume(&self.settings.identify.token, &session_id, seq);
                self.send(live, &payload).await?;
                self.session.resume_sent();
                info!(shard_id, seq, "Resume sent");
            }
            SessionAction::Ready { session_id, data } => {
                info!(shard_id, session_id = %session_id, "Shard ready");
                self.established = true;
                self.publish();
                self.emit(ShardEvent::Ready {
                    shard_id,
                    session_id,
                    data,
                })
                .await?;
                if let Some(ready_tx) = self.ready_tx.take() {
                    let _ = ready_tx.send(());
                }
            }
            SessionAction::Resumed => {
                info!(shard_id, seq = self.session.seq(), "Shard resumed");
                self.established = true;
                self.publish();
                self.emit(ShardEvent::Resumed { shard_id }).await?;
            }
            SessionAction::Dispatch { name, seq, data } => {
                self.registry.record_event(shard_id);
                self.metrics.record_event(shard_id, &name);
                self.emit(ShardEvent::Dispatch {
                    shard_id,
                    name,
                    seq,
                    data,
                })
                .await?;
            }
            SessionAction::Reconnect { resume } => {
                self.publish();
                let code = if resume { RESUMABLE_CLOSE_CODE } else { 1000 };
                close(live, code, "reconnecting").await;
                return Ok(Some(SocketExit::Reconnect { resume }));
            }
            SessionAction::Stop { code, reason } => {
                return Err(GatewayError::FatalSession {
                    shard_id,
                    code,
                    reason: reason.to_string(),
                });
            }
        }
        Ok(None)
    }

    fn exit_for(&self, action: SessionAction) -> Result<SocketExit, GatewayError> {
        match action {
            SessionAction::Stop { code, reason } => Err(GatewayError::FatalSession {
                shard_id: self.shard_id(),
                code,
                reason: reason.to_string(),
            }),
            SessionAction::Reconnect { resume } => Ok(SocketExit::Reconnect { resume }),
            _ => Ok(SocketExit::Reconnect {
                resume: self.session.is_resumable(),
            }),
        }
    }

    async fn send(&self, live: &mut LiveSocket, payload: &GatewayPayload) -> Result<(), GatewayError> {
        let frame = self.codec.frame(&payload.to_value())?;
        live.write.send(frame).await?;
        Ok(())
    }

    /// Forward an event upward; waits when the consumer is behind
    async fn emit(&self, event: ShardEvent) -> Result<(), GatewayError> {
        self.events
            .send(event)
            .await
            .map_err(|_| GatewayError::ShuttingDown)
    }
}

/// Build the socket URL for a gateway base address
pub fn build_socket_url(
    base: &str,
    api_version: u8,
    encoding: Encoding,
    compression: Compression,
) -> Result<Url, GatewayError> {
    let mut url = Url::parse(base)
        .map_err(|e| GatewayError::Config(format!("invalid gateway url '{base}': {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query.clear();
        query.append_pair("v", &api_version.to_string());
        query.append_pair("encoding", encoding.name());
        if let Some(compress) = compression.query_value() {
            query.append_pair("compress", compress);
        }
    }
    Ok(url)
}

async fn close(live: &mut LiveSocket, code: u16, reason: &str) {
    live.heartbeat = None;
    live.identify_wait = None;
    let frame = CloseFrame {
        code: WsCloseCode::from(code),
        reason: reason.to_string().into(),
    };
    // The socket may already be gone; nothing to recover either way.
    let _ = live.write.send(Message::Close(Some(frame))).await;
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn next_permit(wait: &mut Option<BoxFuture<'static, IdentifyPermit>>) -> IdentifyPermit {
    match wait {
        Some(fut) => fut.await,
        None => std::future::pending().await,
    }
}
