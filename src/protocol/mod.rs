//! Wire protocol: record framing, body codecs and the clustered
//! message layout shared by the peer server and outbound connections.

pub mod codec;
pub mod frame;
pub mod message;

pub use codec::{Body, CodecRegistry, MessageCodec, PING_CODEC_ID};
pub use frame::{encode_record, RecordParser, PONG};
pub use message::{ClusteredMessage, Headers};
