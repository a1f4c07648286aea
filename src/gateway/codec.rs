//! Pluggable gateway wire encodings
//!
//! A codec turns raw frame bytes into a structured message and back. The
//! text encoding is always available; the binary one is probed at connect
//! time through [`Encoding::codec`].

use crate::error::CodecError;
use crate::gateway::etf::EtfCodec;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// Wire encoding of gateway frames
pub trait Codec: Send + Sync {
    /// Encoding name for the gateway query string
    fn name(&self) -> &'static str;

    /// Decode one complete frame
    fn decode(&self, data: &[u8]) -> Result<Value, CodecError>;

    /// Encode one message
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;

    /// Wrap encoded bytes in the frame type this encoding travels in
    fn frame(&self, value: &Value) -> Result<Message, CodecError>;
}

/// Encoding selectable through configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Json,
    Etf,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Self::Json => JsonCodec::NAME,
            Self::Etf => EtfCodec::NAME,
        }
    }

    /// Build the codec, failing fast when the environment cannot run it
    pub fn codec(self) -> Result<Box<dyn Codec>, CodecError> {
        match self {
            Self::Json => Ok(Box::new(JsonCodec)),
            Self::Etf => {
                EtfCodec::supported()?;
                Ok(Box::new(EtfCodec::new()))
            }
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "etf" => Ok(Self::Etf),
            _ => Err(CodecError::Unsupported {
                name: "encoding",
                reason: format!("unknown encoding '{s}'"),
            }),
        }
    }
}

/// Human-readable JSON text frames
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl JsonCodec {
    pub const NAME: &'static str = "json";
}

impl Codec for JsonCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn decode(&self, data: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::decode(Self::NAME, e.to_string()))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError::encode(Self::NAME, e.to_string()))
    }

    fn frame(&self, value: &Value) -> Result<Message, CodecError> {
        let text = serde_json::to_string(value)
            .map_err(|e| CodecError::encode(Self::NAME, e.to_string()))?;
        Ok(Message::Text(text))
    }
}
