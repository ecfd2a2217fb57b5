//! Clustered message representation and wire layout
//!
//! Wire payload layout (inside one framed record):
//!
//! ```text
//! u8      wire version (currently 1)
//! u8      codec id (0 = ping, 1 = buffer, 2 = string, 3 = json,
//!                   255 = user codec)
//! [user]  u16_be codec name length || codec name
//! u8      flags (bit0 = point-to-point send, bit1 = reply address present)
//! u32_be  address length || address
//! [reply] u32_be reply address length || reply address
//! u32_be  sender host length || sender host
//! u32_be  sender port
//! u32_be  header count, then per header:
//!         u32_be key length || key || u32_be value length || value
//! body    remainder of the record, codec-encoded
//! ```
//!
//! Decoding sets `from_wire`, which marks the message as a re-entry:
//! the router delivers such messages locally and never federates them
//! again.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::cluster::node::NodeAddress;
use crate::error::{Error, Result};
use crate::protocol::codec::{Body, CodecRegistry, USER_CODEC_ID};

const WIRE_VERSION: u8 = 1;

const FLAG_SEND: u8 = 0b0000_0001;
const FLAG_REPLY: u8 = 0b0000_0010;

/// Address used by keepalive ping records.
pub(crate) const PING_ADDRESS: &str = "ping";

/// Ordered string headers carried by every message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Create an empty header set
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a header entry
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// First value for a key, if any
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the header set is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A message travelling over the clustered bus
#[derive(Debug, Clone)]
pub struct ClusteredMessage {
    /// Node that originated the message
    pub sender: NodeAddress,
    /// Logical destination address
    pub address: String,
    /// One-shot address for replies, when the sender expects one
    pub reply_address: Option<String>,
    /// Message headers
    pub headers: Headers,
    /// Decoded body
    pub body: Body,
    /// User codec name; `None` selects the system codec for the body shape
    pub codec_name: Option<String>,
    /// Point-to-point send (true) vs publish (false)
    pub is_send: bool,
    /// Set when this message was decoded from the wire
    pub from_wire: bool,
}

impl ClusteredMessage {
    /// Create an outgoing message.
    pub fn new(
        sender: NodeAddress,
        address: impl Into<String>,
        body: Body,
        is_send: bool,
    ) -> Self {
        Self {
            sender,
            address: address.into(),
            reply_address: None,
            headers: Headers::new(),
            body,
            codec_name: None,
            is_send,
            from_wire: false,
        }
    }

    /// Create a keepalive ping originating at `sender`.
    pub fn ping(sender: NodeAddress) -> Self {
        Self::new(sender, PING_ADDRESS, Body::Ping, true)
    }

    /// Whether this payload carries the reserved PING codec identity.
    pub fn is_ping(&self) -> bool {
        matches!(self.body, Body::Ping)
    }

    /// The codec id written on the wire for this message.
    fn wire_codec_id(&self) -> u8 {
        if self.codec_name.is_some() {
            USER_CODEC_ID
        } else {
            self.body.system_codec_id()
        }
    }

    /// Encode the message into a wire payload (without length framing).
    pub fn encode(&self, codecs: &CodecRegistry) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64 + self.address.len());
        buf.put_u8(WIRE_VERSION);
        buf.put_u8(self.wire_codec_id());
        if let Some(name) = &self.codec_name {
            buf.put_u16(name.len() as u16);
            buf.put_slice(name.as_bytes());
        }

        let mut flags = 0u8;
        if self.is_send {
            flags |= FLAG_SEND;
        }
        if self.reply_address.is_some() {
            flags |= FLAG_REPLY;
        }
        buf.put_u8(flags);

        put_string(&mut buf, &self.address);
        if let Some(reply) = &self.reply_address {
            put_string(&mut buf, reply);
        }
        put_string(&mut buf, &self.sender.host);
        buf.put_u32(u32::from(self.sender.port));

        buf.put_u32(self.headers.len() as u32);
        for (k, v) in self.headers.iter() {
            put_string(&mut buf, k);
            put_string(&mut buf, v);
        }

        codecs.encode_body(&self.body, self.codec_name.as_deref(), &mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode a wire payload. The result carries `from_wire = true`.
    pub fn decode(mut payload: Bytes, codecs: &CodecRegistry) -> Result<Self> {
        if payload.remaining() < 3 {
            return Err(Error::InvalidMessage("payload too short".into()));
        }
        let version = payload.get_u8();
        if version != WIRE_VERSION {
            return Err(Error::InvalidMessage(format!(
                "unsupported wire version {version}"
            )));
        }

        let codec_id = payload.get_u8();
        let codec_name = if codec_id == USER_CODEC_ID {
            if payload.remaining() < 2 {
                return Err(Error::InvalidMessage("truncated codec name".into()));
            }
            let len = payload.get_u16() as usize;
            Some(take_utf8(&mut payload, len, "codec name")?)
        } else {
            None
        };

        if payload.remaining() < 1 {
            return Err(Error::InvalidMessage("missing flags".into()));
        }
        let flags = payload.get_u8();

        let address = get_string(&mut payload, "address")?;
        let reply_address = if flags & FLAG_REPLY != 0 {
            Some(get_string(&mut payload, "reply address")?)
        } else {
            None
        };
        let sender_host = get_string(&mut payload, "sender host")?;
        if payload.remaining() < 4 {
            return Err(Error::InvalidMessage("truncated sender port".into()));
        }
        let sender_port = payload.get_u32();
        let sender_port = u16::try_from(sender_port)
            .map_err(|_| Error::InvalidMessage(format!("sender port {sender_port} out of range")))?;

        if payload.remaining() < 4 {
            return Err(Error::InvalidMessage("truncated header count".into()));
        }
        let header_count = payload.get_u32() as usize;
        let mut headers = Headers::new();
        for _ in 0..header_count {
            let key = get_string(&mut payload, "header key")?;
            let value = get_string(&mut payload, "header value")?;
            headers.add(key, value);
        }

        let body = codecs.decode_body(codec_id, codec_name.as_deref(), payload)?;

        Ok(Self {
            sender: NodeAddress::new(sender_host, sender_port),
            address,
            reply_address,
            headers,
            body,
            codec_name,
            is_send: flags & FLAG_SEND != 0,
            from_wire: true,
        })
    }
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_u32(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_string(payload: &mut Bytes, what: &str) -> Result<String> {
    if payload.remaining() < 4 {
        return Err(Error::InvalidMessage(format!("truncated {what} length")));
    }
    let len = payload.get_u32() as usize;
    take_utf8(payload, len, what)
}

fn take_utf8(payload: &mut Bytes, len: usize, what: &str) -> Result<String> {
    if payload.remaining() < len {
        return Err(Error::InvalidMessage(format!("truncated {what}")));
    }
    let bytes = payload.split_to(len);
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::InvalidMessage(format!("invalid utf-8 in {what}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::codec::{Body, JSON_CODEC_ID, PING_CODEC_ID};

    fn sender() -> NodeAddress {
        NodeAddress::new("10.0.0.1", 4000)
    }

    #[test]
    fn roundtrip_send_with_reply_and_headers() {
        let codecs = CodecRegistry::new();
        let mut msg = ClusteredMessage::new(
            sender(),
            "orders.create",
            Body::Json(serde_json::json!({"id": 7})),
            true,
        );
        msg.reply_address = Some("d3b07384-d9a7-4e1c-8a9f-000000000000".into());
        msg.headers.add("trace-id", "abc123");
        msg.headers.add("retry", "0");

        let wire = msg.encode(&codecs).unwrap();
        let decoded = ClusteredMessage::decode(wire, &codecs).unwrap();

        assert_eq!(decoded.sender, sender());
        assert_eq!(decoded.address, "orders.create");
        assert_eq!(decoded.reply_address.as_deref(), msg.reply_address.as_deref());
        assert_eq!(decoded.headers, msg.headers);
        assert_eq!(decoded.body, msg.body);
        assert!(decoded.is_send);
        assert!(decoded.from_wire);
    }

    #[test]
    fn roundtrip_publish_without_reply() {
        let codecs = CodecRegistry::new();
        let msg = ClusteredMessage::new(
            sender(),
            "ticker",
            Body::Text("tick".into()),
            false,
        );
        let decoded = ClusteredMessage::decode(msg.encode(&codecs).unwrap(), &codecs).unwrap();
        assert!(!decoded.is_send);
        assert!(decoded.reply_address.is_none());
        assert_eq!(decoded.body, Body::Text("tick".into()));
    }

    #[test]
    fn ping_is_recognised_after_decode() {
        let codecs = CodecRegistry::new();
        let ping = ClusteredMessage::ping(sender());
        let wire = ping.encode(&codecs).unwrap();
        assert_eq!(wire[1], PING_CODEC_ID);

        let decoded = ClusteredMessage::decode(wire, &codecs).unwrap();
        assert!(decoded.is_ping());
        assert!(decoded.from_wire);
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let codecs = CodecRegistry::new();
        let msg = ClusteredMessage::new(sender(), "a", Body::Text("x".into()), true);
        let wire = msg.encode(&codecs).unwrap();

        // The body is the record remainder, so every cut strictly inside
        // the fixed fields must fail cleanly. Body length here is 1.
        let fixed_len = wire.len() - 1;
        for cut in 0..fixed_len {
            assert!(
                ClusteredMessage::decode(wire.slice(..cut), &codecs).is_err(),
                "cut at {cut} should not decode"
            );
        }
        // Cutting the 1-byte body yields an empty but valid text body.
        let short = ClusteredMessage::decode(wire.slice(..fixed_len), &codecs).unwrap();
        assert_eq!(short.body, Body::Text(String::new()));
    }

    #[test]
    fn bad_version_is_rejected() {
        let codecs = CodecRegistry::new();
        let msg = ClusteredMessage::new(sender(), "a", Body::Text("x".into()), true);
        let mut wire = BytesMut::from(msg.encode(&codecs).unwrap().as_ref());
        wire[0] = 99;
        assert!(ClusteredMessage::decode(wire.freeze(), &codecs).is_err());
    }

    #[test]
    fn json_codec_id_on_wire() {
        let codecs = CodecRegistry::new();
        let msg = ClusteredMessage::new(sender(), "a", Body::Json(serde_json::json!(1)), true);
        let wire = msg.encode(&codecs).unwrap();
        assert_eq!(wire[1], JSON_CODEC_ID);
    }

    #[test]
    fn headers_lookup() {
        let mut headers = Headers::new();
        headers.add("a", "1");
        headers.add("a", "2");
        headers.add("b", "3");
        assert_eq!(headers.get("a"), Some("1"));
        assert_eq!(headers.get("b"), Some("3"));
        assert_eq!(headers.get("c"), None);
        assert_eq!(headers.len(), 3);
    }
}
