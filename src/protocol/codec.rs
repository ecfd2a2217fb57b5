//! Message body codecs
//!
//! The codec table maps a codec identity (a 1-byte id for the system
//! codecs, a name carried on the wire for user codecs) to the encoder
//! and decoder for a message body. Codec id 0 is the reserved PING
//! identity: a payload carrying it is a keepalive, not user traffic,
//! and is answered with the out-of-band PONG byte instead of being
//! delivered.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Reserved codec id for keepalive PING payloads.
pub const PING_CODEC_ID: u8 = 0;
/// System codec id for raw byte bodies.
pub const BUFFER_CODEC_ID: u8 = 1;
/// System codec id for UTF-8 string bodies.
pub const STRING_CODEC_ID: u8 = 2;
/// System codec id for JSON bodies.
pub const JSON_CODEC_ID: u8 = 3;
/// Codec id marking a user codec; the codec name follows on the wire.
pub const USER_CODEC_ID: u8 = 255;

/// A message body in its decoded form
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// Keepalive payload; carries no data
    Ping,
    /// Raw bytes
    Buffer(Bytes),
    /// UTF-8 text
    Text(String),
    /// JSON value
    Json(serde_json::Value),
}

impl Body {
    /// The system codec id matching this body's shape.
    pub fn system_codec_id(&self) -> u8 {
        match self {
            Body::Ping => PING_CODEC_ID,
            Body::Buffer(_) => BUFFER_CODEC_ID,
            Body::Text(_) => STRING_CODEC_ID,
            Body::Json(_) => JSON_CODEC_ID,
        }
    }
}

/// Encoder/decoder pair for user-defined body encodings
///
/// User codecs see the body as raw bytes; whatever structure they give
/// those bytes is their own business. The name travels on the wire so
/// the receiving node can find the matching decoder.
pub trait MessageCodec: Send + Sync {
    /// Wire name of this codec; must be unique per registry.
    fn name(&self) -> &str;

    /// Encode a buffer body onto the wire.
    fn encode(&self, body: &Bytes, buf: &mut BytesMut) -> Result<()>;

    /// Decode a wire payload back into a buffer body.
    fn decode(&self, payload: Bytes) -> Result<Bytes>;
}

/// Lookup table from codec identity to encoder/decoder
pub struct CodecRegistry {
    user: RwLock<HashMap<String, Arc<dyn MessageCodec>>>,
}

impl CodecRegistry {
    /// Create a registry holding only the system codecs.
    pub fn new() -> Self {
        Self {
            user: RwLock::new(HashMap::new()),
        }
    }

    /// Register a user codec under its name.
    pub fn register(&self, codec: Arc<dyn MessageCodec>) -> Result<()> {
        let name = codec.name().to_string();
        let mut user = self.user.write();
        if user.contains_key(&name) {
            return Err(Error::DuplicateCodec(name));
        }
        user.insert(name, codec);
        Ok(())
    }

    /// Remove a user codec.
    pub fn unregister(&self, name: &str) {
        self.user.write().remove(name);
    }

    /// Look up a user codec by its wire name.
    pub fn lookup(&self, name: &str) -> Result<Arc<dyn MessageCodec>> {
        self.user
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownCodec(name.to_string()))
    }

    /// Encode a body with the system codec matching its shape, or with
    /// the named user codec when `codec_name` is given.
    pub fn encode_body(
        &self,
        body: &Body,
        codec_name: Option<&str>,
        buf: &mut BytesMut,
    ) -> Result<()> {
        if let Some(name) = codec_name {
            let bytes = match body {
                Body::Buffer(b) => b,
                other => {
                    return Err(Error::InvalidMessage(format!(
                        "user codec '{}' requires a buffer body, got {:?}",
                        name, other
                    )))
                }
            };
            return self.lookup(name)?.encode(bytes, buf);
        }
        match body {
            Body::Ping => {}
            Body::Buffer(b) => buf.extend_from_slice(b),
            Body::Text(s) => buf.extend_from_slice(s.as_bytes()),
            Body::Json(v) => {
                let encoded = serde_json::to_vec(v)
                    .map_err(|e| Error::InvalidMessage(format!("json encode: {e}")))?;
                buf.extend_from_slice(&encoded);
            }
        }
        Ok(())
    }

    /// Decode a wire payload given its codec identity.
    pub fn decode_body(
        &self,
        codec_id: u8,
        codec_name: Option<&str>,
        payload: Bytes,
    ) -> Result<Body> {
        match codec_id {
            PING_CODEC_ID => Ok(Body::Ping),
            BUFFER_CODEC_ID => Ok(Body::Buffer(payload)),
            STRING_CODEC_ID => {
                let s = std::str::from_utf8(&payload)
                    .map_err(|e| Error::InvalidMessage(format!("invalid utf-8 body: {e}")))?;
                Ok(Body::Text(s.to_string()))
            }
            JSON_CODEC_ID => {
                let v = serde_json::from_slice(&payload)
                    .map_err(|e| Error::InvalidMessage(format!("json decode: {e}")))?;
                Ok(Body::Json(v))
            }
            USER_CODEC_ID => {
                let name = codec_name.ok_or_else(|| {
                    Error::InvalidMessage("user codec id without codec name".into())
                })?;
                Ok(Body::Buffer(self.lookup(name)?.decode(payload)?))
            }
            other => Err(Error::InvalidMessage(format!("unknown codec id {other}"))),
        }
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ReverseCodec;

    impl MessageCodec for ReverseCodec {
        fn name(&self) -> &str {
            "reverse"
        }

        fn encode(&self, body: &Bytes, buf: &mut BytesMut) -> Result<()> {
            buf.extend(body.iter().rev());
            Ok(())
        }

        fn decode(&self, payload: Bytes) -> Result<Bytes> {
            Ok(payload.iter().rev().copied().collect::<Vec<u8>>().into())
        }
    }

    #[test]
    fn body_maps_to_system_codec_ids() {
        assert_eq!(Body::Ping.system_codec_id(), PING_CODEC_ID);
        assert_eq!(Body::Buffer(Bytes::new()).system_codec_id(), BUFFER_CODEC_ID);
        assert_eq!(Body::Text(String::new()).system_codec_id(), STRING_CODEC_ID);
        assert_eq!(
            Body::Json(serde_json::json!({})).system_codec_id(),
            JSON_CODEC_ID
        );
    }

    #[test]
    fn system_codecs_roundtrip() {
        let registry = CodecRegistry::new();
        let bodies = [
            Body::Ping,
            Body::Buffer(Bytes::from_static(b"\x00\x01\x02")),
            Body::Text("héllo".into()),
            Body::Json(serde_json::json!({"x": 1, "y": ["a", null]})),
        ];
        for body in bodies {
            let mut buf = BytesMut::new();
            registry.encode_body(&body, None, &mut buf).unwrap();
            let decoded = registry
                .decode_body(body.system_codec_id(), None, buf.freeze())
                .unwrap();
            assert_eq!(decoded, body);
        }
    }

    #[test]
    fn user_codec_roundtrip_and_duplicate() {
        let registry = CodecRegistry::new();
        registry.register(Arc::new(ReverseCodec)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(ReverseCodec)),
            Err(Error::DuplicateCodec(_))
        ));

        let body = Body::Buffer(Bytes::from_static(b"abc"));
        let mut buf = BytesMut::new();
        registry.encode_body(&body, Some("reverse"), &mut buf).unwrap();
        assert_eq!(buf.as_ref(), b"cba");

        let decoded = registry
            .decode_body(USER_CODEC_ID, Some("reverse"), buf.freeze())
            .unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn unknown_codec_name_is_an_error() {
        let registry = CodecRegistry::new();
        assert!(matches!(
            registry.lookup("nope"),
            Err(Error::UnknownCodec(_))
        ));
        assert!(registry
            .decode_body(USER_CODEC_ID, Some("nope"), Bytes::new())
            .is_err());
    }

    #[test]
    fn invalid_utf8_string_body_is_an_error() {
        let registry = CodecRegistry::new();
        let payload = Bytes::from_static(&[0xFF, 0xFE]);
        assert!(registry
            .decode_body(STRING_CODEC_ID, None, payload)
            .is_err());
    }

    #[test]
    fn unregister_removes_codec() {
        let registry = CodecRegistry::new();
        registry.register(Arc::new(ReverseCodec)).unwrap();
        registry.unregister("reverse");
        assert!(registry.lookup("reverse").is_err());
    }
}
