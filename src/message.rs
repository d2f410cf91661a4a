//! Message, Chunk, and the two wire message kinds (spec §3).

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;

/// An 8-character printable message identifier generated by the device RNG.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId(String);

impl MessageId {
    pub const LEN: usize = 8;

    pub fn generate(rng: &mut impl Rng) -> Self {
        let id: String = rng
            .sample_iter(&Alphanumeric)
            .take(Self::LEN)
            .map(char::from)
            .collect();
        MessageId(id)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == Self::LEN && raw.chars().all(|c| c.is_ascii_graphic()) {
            Some(MessageId(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A JSON message: `{"header":{"name":N,"messageId":M}[,"payload":P]}`.
#[derive(Debug, Clone, PartialEq)]
pub struct JsonMessage {
    pub name: String,
    pub message_id: MessageId,
    pub payload: Option<Value>,
}

impl JsonMessage {
    pub fn new(name: impl Into<String>, message_id: MessageId, payload: Option<Value>) -> Self {
        JsonMessage { name: name.into(), message_id, payload }
    }

    /// Serialize to the exact wire form, with no trailing terminator.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = String::with_capacity(64);
        out.push_str(r#"{"header":{"name":"#);
        out.push_str(&serde_json::to_string(&self.name).unwrap());
        out.push_str(r#","messageId":"#);
        out.push_str(&serde_json::to_string(self.message_id.as_str()).unwrap());
        out.push('}');
        if let Some(payload) = &self.payload {
            out.push_str(r#","payload":"#);
            out.push_str(&payload.to_string());
        }
        out.push('}');
        out.into_bytes()
    }

    pub fn size(&self) -> usize {
        self.serialize().len()
    }

    /// Parses the wire form `{"header":{"name":N,"messageId":M}[,"payload":P]}`
    /// back into a `JsonMessage`, the inverse of [`JsonMessage::serialize`]
    /// (spec §8 "Round-trip: for any JSON message M, parse(serialize(M)) == M").
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let value: Value = serde_json::from_slice(bytes).ok()?;
        let header = value.get("header")?;
        let name = header.get("name")?.as_str()?.to_string();
        let raw_id = header.get("messageId")?.as_str()?;
        let message_id = MessageId::parse(raw_id)?;
        let payload = value.get("payload").cloned();
        Some(JsonMessage { name, message_id, payload })
    }
}

/// A binary message record: `length:u32 LE | type:u8 | count:u8 | reserved(2) | data`.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryMessage {
    pub msg_type: u8,
    pub count: u8,
    pub data: Vec<u8>,
}

impl BinaryMessage {
    pub fn new(msg_type: u8, count: u8, data: Vec<u8>) -> Self {
        BinaryMessage { msg_type, count, data }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.data.len());
        out.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        out.push(self.msg_type);
        out.push(self.count);
        out.extend_from_slice(&[0u8, 0u8]);
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse one binary-message record from the front of `buf`, returning
    /// the message and the number of bytes consumed.
    pub fn parse(buf: &[u8]) -> Option<(Self, usize)> {
        if buf.len() < 8 {
            return None;
        }
        let length = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let msg_type = buf[4];
        let count = buf[5];
        // buf[6..8] reserved, expected zero; tolerated either way on read.
        let total = 8 + length;
        if buf.len() < total {
            return None;
        }
        let data = buf[8..total].to_vec();
        Some((BinaryMessage { msg_type, count, data }, total))
    }

    pub fn size(&self) -> usize {
        self.data.len() + 8
    }
}

/// Either concrete message kind, carried by a [`Chunk`].
#[derive(Debug, Clone)]
pub enum Message {
    Json(JsonMessage),
    Binary(BinaryMessage),
}

impl Message {
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Message::Json(m) => m.serialize(),
            Message::Binary(m) => m.serialize(),
        }
    }

    pub fn size(&self) -> usize {
        match self {
            Message::Json(m) => m.size(),
            Message::Binary(m) => m.size(),
        }
    }
}

/// The unit the Regulator manages: a Message plus its cached serialized size.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub message: Message,
    pub size: usize,
}

impl Chunk {
    pub fn new(message: Message) -> Self {
        let size = message.size();
        Chunk { message, size }
    }
}
