//! Gateway session management
//!
//! One socket per shard, driven by a pure session state machine, started
//! and supervised by a [`ShardManager`].

pub mod codec;
pub mod compression;
pub mod connection;
pub mod etf;
pub mod identify;
pub mod manager;
pub mod protocol;
pub mod session;
pub mod state;

pub use codec::{Codec, Encoding, JsonCodec};
pub use compression::{Compression, Decompressor, ZlibStream};
pub use connection::{GatewayConnection, ShardCommand, ShardEvent};
pub use etf::EtfCodec;
pub use identify::IdentifyGate;
pub use manager::{GatewayBotInfo, GatewayManager, ShardManager};
pub use protocol::{GatewayPayload, Intents, OpCode};
pub use session::{ShardSession, ShardStatus};
pub use state::{ShardRegistry, ShardSnapshot, ShardSummary};
