//! Gateway wire protocol
//!
//! Op codes, close codes, the payload envelope and builders for the frames
//! a client sends (identify, resume, heartbeat, presence update).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Gateway operation codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Server dispatches an event (server only)
    Dispatch = 0,
    /// Heartbeat (client/server)
    Heartbeat = 1,
    /// Start a new session (client only)
    Identify = 2,
    /// Update the client's presence (client only)
    PresenceUpdate = 3,
    /// Join/leave voice channels (client only)
    VoiceStateUpdate = 4,
    /// Resume a previous session (client only)
    Resume = 6,
    /// Server asks the client to reconnect and resume (server only)
    Reconnect = 7,
    /// Request guild member chunks (client only)
    RequestGuildMembers = 8,
    /// Session was invalidated (server only)
    InvalidSession = 9,
    /// Sent right after connecting, carries the heartbeat interval (server only)
    Hello = 10,
    /// Heartbeat acknowledged (server only)
    HeartbeatAck = 11,
}

impl OpCode {
    /// Create an `OpCode` from a raw integer value
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Dispatch),
            1 => Some(Self::Heartbeat),
            2 => Some(Self::Identify),
            3 => Some(Self::PresenceUpdate),
            4 => Some(Self::VoiceStateUpdate),
            6 => Some(Self::Resume),
            7 => Some(Self::Reconnect),
            8 => Some(Self::RequestGuildMembers),
            9 => Some(Self::InvalidSession),
            10 => Some(Self::Hello),
            11 => Some(Self::HeartbeatAck),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dispatch => "Dispatch",
            Self::Heartbeat => "Heartbeat",
            Self::Identify => "Identify",
            Self::PresenceUpdate => "PresenceUpdate",
            Self::VoiceStateUpdate => "VoiceStateUpdate",
            Self::Resume => "Resume",
            Self::Reconnect => "Reconnect",
            Self::RequestGuildMembers => "RequestGuildMembers",
            Self::InvalidSession => "InvalidSession",
            Self::Hello => "Hello",
            Self::HeartbeatAck => "HeartbeatAck",
        }
    }
}

impl std::fmt::Display for OpCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u8())
    }
}

/// What the client does after the provider closes the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Reconnect and resume the session
    Resume,
    /// Reconnect with a fresh identify
    Reidentify,
    /// Stop; the failure needs a process-level decision
    Fatal,
}

/// Gateway close codes sent by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    UnknownError = 4000,
    UnknownOpcode = 4001,
    DecodeError = 4002,
    NotAuthenticated = 4003,
    AuthenticationFailed = 4004,
    AlreadyAuthenticated = 4005,
    InvalidSequence = 4007,
    RateLimited = 4008,
    SessionTimedOut = 4009,
    InvalidShard = 4010,
    ShardingRequired = 4011,
    InvalidApiVersion = 4012,
    InvalidIntents = 4013,
    DisallowedIntents = 4014,
}

impl CloseCode {
    #[must_use]
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSequence),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimedOut),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub const fn description(self) -> &'static str {
        match self {
            Self::UnknownError => "Unknown error",
            Self::UnknownOpcode => "Unknown opcode",
            Self::DecodeError => "Decode error",
            Self::NotAuthenticated => "Not authenticated",
            Self::AuthenticationFailed => "Authentication failed",
            Self::AlreadyAuthenticated => "Already authenticated",
            Self::InvalidSequence => "Invalid sequence number",
            Self::RateLimited => "Rate limited",
            Self::SessionTimedOut => "Session timed out",
            Self::InvalidShard => "Invalid shard",
            Self::ShardingRequired => "Sharding required",
            Self::InvalidApiVersion => "Invalid API version",
            Self::InvalidIntents => "Invalid intents",
            Self::DisallowedIntents => "Disallowed intents",
        }
    }

    #[must_use]
    pub const fn action(self) -> CloseAction {
        match self {
            Self::AuthenticationFailed
            | Self::InvalidShard
            | Self::ShardingRequired
            | Self::InvalidApiVersion
            | Self::InvalidIntents
            | Self::DisallowedIntents => CloseAction::Fatal,
            Self::InvalidSequence | Self::SessionTimedOut => CloseAction::Reidentify,
            _ => CloseAction::Resume,
        }
    }
}

/// Classify a raw close code. Codes outside the provider range resume.
pub fn classify_close(code: u16) -> CloseAction {
    CloseCode::from_u16(code).map_or(CloseAction::Resume, CloseCode::action)
}

/// Human-readable reason for a raw close code
pub fn close_reason(code: u16) -> &'static str {
    CloseCode::from_u16(code).map_or("Connection closed", CloseCode::description)
}

/// Gateway payload envelope: `{ op, d, s, t }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    pub op: u8,
    #[serde(default)]
    pub d: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

impl GatewayPayload {
    pub fn new(op: OpCode, d: Value) -> Self {
        Self {
            op: op.as_u8(),
            d,
            s: None,
            t: None,
        }
    }

    pub fn opcode(&self) -> Option<OpCode> {
        OpCode::from_u8(self.op)
    }

    /// Parse a decoded message into the envelope
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("op".to_string(), Value::from(self.op));
        map.insert("d".to_string(), self.d.clone());
        if let Some(s) = self.s {
            map.insert("s".to_string(), Value::from(s));
        }
        if let Some(ref t) = self.t {
            map.insert("t".to_string(), Value::from(t.clone()));
        }
        Value::Object(map)
    }
}

bitflags! {
    /// Gateway intents
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Intents: u64 {
        const GUILDS = 1 << 0;
        const GUILD_MEMBERS = 1 << 1;
        const GUILD_BANS = 1 << 2;
        const GUILD_EMOJIS = 1 << 3;
        const GUILD_INTEGRATIONS = 1 << 4;
        const GUILD_WEBHOOKS = 1 << 5;
        const GUILD_INVITES = 1 << 6;
        const GUILD_VOICE_STATES = 1 << 7;
        const GUILD_PRESENCES = 1 << 8;
        const GUILD_MESSAGES = 1 << 9;
        const GUILD_MESSAGE_REACTIONS = 1 << 10;
        const GUILD_MESSAGE_TYPING = 1 << 11;
        const DIRECT_MESSAGES = 1 << 12;
        const DIRECT_MESSAGE_REACTIONS = 1 << 13;
        const DIRECT_MESSAGE_TYPING = 1 << 14;
    }
}

impl Intents {
    /// All intents except the privileged ones and typing
    pub fn non_privileged() -> Self {
        Self::all()
            - Self::GUILD_MEMBERS
            - Self::GUILD_PRESENCES
            - Self::GUILD_MESSAGE_TYPING
            - Self::DIRECT_MESSAGE_TYPING
    }

    /// Exactly the given intents
    pub fn only(intents: &[Intents]) -> Self {
        intents.iter().fold(Self::empty(), |acc, i| acc | *i)
    }

    /// Every intent except the given ones
    pub fn except(intents: &[Intents]) -> Self {
        Self::all() - Self::only(intents)
    }
}

impl Default for Intents {
    fn default() -> Self {
        Self::non_privileged()
    }
}

/// Connection properties sent with identify
fn connection_properties() -> Value {
    json!({
        "os": std::env::consts::OS,
        "browser": env!("CARGO_PKG_NAME"),
        "device": env!("CARGO_PKG_NAME"),
    })
}

/// Identify parameters that do not change between reconnects
#[derive(Debug, Clone)]
pub struct IdentifyParams {
    pub token: String,
    pub intents: Intents,
    pub large_threshold: u16,
    pub presence: Option<Value>,
    /// Per-payload compression (distinct from transport compression)
    pub payload_compression: bool,
}

/// Build an op 2 identify frame
pub fn identify(params: &IdentifyParams, shard_id: u32, shard_count: u32) -> GatewayPayload {
    let mut d = json!({
        "token": params.token,
        "properties": connection_properties(),
        "compress": params.payload_compression,
        "large_threshold": params.large_threshold,
        "shard": [shard_id, shard_count],
        "intents": params.intents.bits(),
    });
    if let (Some(presence), Some(obj)) = (params.presence.as_ref(), d.as_object_mut()) {
        obj.insert("presence".to_string(), presence.clone());
    }
    GatewayPayload::new(OpCode::Identify, d)
}

/// Build an op 6 resume frame
pub fn resume(token: &str, session_id: &str, seq: Option<u64>) -> GatewayPayload {
    GatewayPayload::new(
        OpCode::Resume,
        json!({
            "token": token,
            "session_id": session_id,
            "seq": seq,
        }),
    )
}

/// Build an op 1 heartbeat frame carrying the last sequence number
pub fn heartbeat(seq: Option<u64>) -> GatewayPayload {
    GatewayPayload::new(OpCode::Heartbeat, seq.map_or(Value::Null, Value::from))
}

/// Build an op 3 presence update frame
pub fn presence_update(presence: Value) -> GatewayPayload {
    GatewayPayload::new(OpCode::PresenceUpdate, presence)
}
