//! Per-shard session state machine
//!
//! `ShardSession` owns everything a shard knows about its session: status,
//! resumable token, sequence number, heartbeat bookkeeping and latency
//! samples. It performs no I/O. Each input returns the actions the
//! connection must carry out, which keeps the protocol logic testable
//! without sockets or timers.

use crate::gateway::protocol::{self, classify_close, CloseAction, GatewayPayload, OpCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Number of round-trip samples kept per shard
pub const LATENCY_SAMPLES: usize = 3;

/// Heartbeat interval used when HELLO does not carry one
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 41_250;

/// Shortest heartbeat interval accepted from HELLO
const MIN_HEARTBEAT_INTERVAL_MS: u64 = 100;

/// Connection state of a shard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardStatus {
    Disconnected,
    Connecting,
    /// Socket open, waiting to identify
    Identifying,
    /// Socket open, resuming a previous session
    Resuming,
    /// Handshake sent, waiting for the session to be confirmed
    Nearly,
    Connected,
    Reconnecting,
    /// Stopped on purpose; no further reconnects
    Idle,
}

impl ShardStatus {
    /// Ordering used for aggregation: higher is "more connected"
    pub fn rank(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Disconnected => 1,
            Self::Reconnecting => 2,
            Self::Connecting => 3,
            Self::Identifying | Self::Resuming => 4,
            Self::Nearly => 5,
            Self::Connected => 6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Nearly => "nearly",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Idle => "idle",
        }
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl std::fmt::Display for ShardStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resumable session token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeToken {
    pub session_id: String,
    /// Gateway URL to use when resuming, from READY
    pub resume_url: Option<String>,
}

/// What the connection must do after feeding the session an input
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    /// Send a frame on the socket
    Send(GatewayPayload),
    /// (Re)start the heartbeat timer at this interval
    StartHeartbeat(Duration),
    /// Acquire the identify permit, then send identify
    Identify,
    /// Send resume for this session
    Resume { session_id: String, seq: Option<u64> },
    /// Session established
    Ready { session_id: String, data: Value },
    /// Session resumed
    Resumed,
    /// Forward a dispatch upward
    Dispatch { name: String, seq: Option<u64>, data: Value },
    /// Close the socket and reconnect
    Reconnect { resume: bool },
    /// Stop for good (fatal close code)
    Stop { code: u16, reason: &'static str },
}

/// Session state for one shard
#[derive(Debug)]
pub struct ShardSession {
    shard_id: u32,
    shard_count: u32,
    status: ShardStatus,
    token: Option<ResumeToken>,
    seq: Option<u64>,
    heartbeat_interval: Option<Duration>,
    last_heartbeat_sent: Option<Instant>,
    last_heartbeat_ack: Option<Instant>,
    ack_pending: bool,
    latency: VecDeque<Duration>,
    disabled_events: Arc<HashSet<String>>,
}

impl ShardSession {
    pub fn new(shard_id: u32, shard_count: u32) -> Self {
        Self {
            shard_id,
            shard_count,
            status: ShardStatus::Disconnected,
            token: None,
            seq: None,
            heartbeat_interval: None,
            last_heartbeat_sent: None,
            last_heartbeat_ack: None,
            ack_pending: false,
            latency: VecDeque::with_capacity(LATENCY_SAMPLES),
            disabled_events: Arc::new(HashSet::new()),
        }
    }

    /// Dispatch names that are tracked but not forwarded
    pub fn with_disabled_events(mut self, events: Arc<HashSet<String>>) -> Self {
        self.disabled_events = events;
        self
    }

    pub fn shard_id(&self) -> u32 {
        self.shard_id
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    pub fn status(&self) -> ShardStatus {
        self.status
    }

    pub fn seq(&self) -> Option<u64> {
        self.seq
    }

    pub fn token(&self) -> Option<&ResumeToken> {
        self.token.as_ref()
    }

    pub fn is_resumable(&self) -> bool {
        self.token.is_some()
    }

    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval
    }

    pub fn last_heartbeat_ack(&self) -> Option<Instant> {
        self.last_heartbeat_ack
    }

    /// Most recent round-trip sample
    pub fn latest_latency(&self) -> Option<Duration> {
        self.latency.back().copied()
    }

    pub fn latency_samples(&self) -> impl Iterator<Item = Duration> + '_ {
        self.latency.iter().copied()
    }

    /// Socket is being opened
    pub fn on_connecting(&mut self) {
        self.status = ShardStatus::Connecting;
        self.heartbeat_interval = None;
        self.ack_pending = false;
    }

    /// Identify frame went out
    pub fn identify_sent(&mut self) {
        self.status = ShardStatus::Nearly;
    }

    /// Resume frame went out
    pub fn resume_sent(&mut self) {
        self.status = ShardStatus::Nearly;
    }

    /// Feed one decoded inbound frame
    pub fn handle(&mut self, payload: GatewayPayload, now: Instant) -> Vec<SessionAction> {
        let Some(op) = payload.opcode() else {
            debug!(shard_id = self.shard_id, op = payload.op, "Ignoring unknown opcode");
            return Vec::new();
        };

        match op {
            OpCode::Hello => self.on_hello(&payload.d),
            OpCode::HeartbeatAck => {
                self.on_heartbeat_ack(now);
                Vec::new()
            }
            OpCode::Heartbeat => {
                // Provider asked for an immediate beat; it does not replace the timer's beat.
                vec![SessionAction::Send(protocol::heartbeat(self.seq))]
            }
            OpCode::Dispatch => self.on_dispatch(payload),
            OpCode::Reconnect => {
                info!(shard_id = self.shard_id, "Provider requested reconnect");
                self.status = ShardStatus::Reconnecting;
                vec![SessionAction::Reconnect {
                    resume: self.is_resumable(),
                }]
            }
            OpCode::InvalidSession => {
                let resumable = payload.d.as_bool().unwrap_or(false);
                if !resumable {
                    self.token = None;
                    self.seq = None;
                }
                warn!(shard_id = self.shard_id, resumable, "Session invalidated");
                self.status = ShardStatus::Reconnecting;
                vec![SessionAction::Reconnect {
                    resume: self.is_resumable(),
                }]
            }
            other => {
                debug!(shard_id = self.shard_id, op = %other, "Ignoring client-only opcode");
                Vec::new()
            }
        }
    }

    fn on_hello(&mut self, d: &Value) -> Vec<SessionAction> {
        let interval_ms = d
            .get("heartbeat_interval")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL_MS);
        if interval_ms < MIN_HEARTBEAT_INTERVAL_MS {
            warn!(shard_id = self.shard_id, interval_ms, "Heartbeat interval too short, raising it");
        }
        let interval = Duration::from_millis(interval_ms.max(MIN_HEARTBEAT_INTERVAL_MS));
        self.heartbeat_interval = Some(interval);
        self.ack_pending = false;

        let mut actions = vec![SessionAction::StartHeartbeat(interval)];
        match self.token {
            Some(ref token) => {
                self.status = ShardStatus::Resuming;
                actions.push(SessionAction::Resume {
                    session_id: token.session_id.clone(),
                    seq: self.seq,
                });
            }
            None => {
                self.status = ShardStatus::Identifying;
                actions.push(SessionAction::Identify);
            }
        }
        actions
    }

    fn on_heartbeat_ack(&mut self, now: Instant) {
        if let Some(sent) = self.last_heartbeat_sent {
            if self.latency.len() == LATENCY_SAMPLES {
                self.latency.pop_front();
            }
            self.latency.push_back(now.saturating_duration_since(sent));
        }
        self.ack_pending = false;
        self.last_heartbeat_ack = Some(now);
    }

    fn on_dispatch(&mut self, payload: GatewayPayload) -> Vec<SessionAction> {
        if let Some(s) = payload.s {
            self.seq = Some(s);
        }
        let name = payload.t.unwrap_or_default();

        match name.as_str() {
            "READY" => {
                let session_id = payload
                    .d
                    .get("session_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let resume_url = payload
                    .d
                    .get("resume_gateway_url")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                self.token = Some(ResumeToken {
                    session_id: session_id.clone(),
                    resume_url,
                });
                self.status = ShardStatus::Connected;
                vec![SessionAction::Ready {
                    session_id,
                    data: payload.d,
                }]
            }
            "RESUMED" => {
                self.status = ShardStatus::Connected;
                vec![SessionAction::Resumed]
            }
            _ if self.disabled_events.contains(&name) => Vec::new(),
            _ => vec![SessionAction::Dispatch {
                name,
                seq: payload.s,
                data: payload.d,
            }],
        }
    }

    /// Heartbeat timer fired
    pub fn heartbeat_tick(&mut self, now: Instant) -> SessionAction {
        if self.ack_pending {
            warn!(
                shard_id = self.shard_id,
                resumable = self.is_resumable(),
                "Heartbeat ACK missed, reconnecting"
            );
            self.ack_pending = false;
            self.status = ShardStatus::Reconnecting;
            return SessionAction::Reconnect {
                resume: self.is_resumable(),
            };
        }
        self.ack_pending = true;
        self.last_heartbeat_sent = Some(now);
        SessionAction::Send(protocol::heartbeat(self.seq))
    }

    /// Socket closed by the provider or the transport
    pub fn on_close(&mut self, code: Option<u16>) -> SessionAction {
        self.heartbeat_interval = None;
        self.ack_pending = false;

        let Some(code) = code else {
            self.status = ShardStatus::Reconnecting;
            return SessionAction::Reconnect {
                resume: self.is_resumable(),
            };
        };

        match classify_close(code) {
            CloseAction::Fatal => {
                self.status = ShardStatus::Idle;
                SessionAction::Stop {
                    code,
                    reason: protocol::close_reason(code),
                }
            }
            CloseAction::Reidentify => {
                self.token = None;
                self.seq = None;
                self.status = ShardStatus::Reconnecting;
                SessionAction::Reconnect { resume: false }
            }
            CloseAction::Resume => {
                self.status = ShardStatus::Reconnecting;
                SessionAction::Reconnect {
                    resume: self.is_resumable(),
                }
            }
        }
    }

    /// Connection gave up or was destroyed
    pub fn set_idle(&mut self) {
        self.status = ShardStatus::Idle;
        self.heartbeat_interval = None;
        self.ack_pending = false;
    }

    /// Transport dropped and reconnects are exhausted or pending
    pub fn set_disconnected(&mut self) {
        self.status = ShardStatus::Disconnected;
    }
}
