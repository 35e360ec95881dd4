use std::{collections::BTreeMap, fmt};

use base64::{Engine, engine::general_purpose::STANDARD};
use bincode::{
    Decode, Encode,
    de::{Decoder, read::Reader},
    error::{AllowedEnumVariants, DecodeError},
};
use chrono::Local;

/// Structured key-value body carried by every [`Message`].
pub type Payload = BTreeMap<String, Value>;

pub const STATUS_OK: &str = "OK";
pub const STATUS_ERROR: &str = "ERROR";

/// Deepest `List`/`Map` nesting accepted when decoding a [`Value`].
pub const MAX_NESTING_DEPTH: usize = 64;

/// Byte strings are read in chunks of this size so a declared length is never
/// allocated ahead of the data that backs it.
const READ_CHUNK_SIZE: usize = 4096;

static VALUE_VARIANTS: AllowedEnumVariants = AllowedEnumVariants::Range { min: 0, max: 7 };

/// Routing tag of a [`Message`].
///
/// Tags travel as text on the wire. A tag outside the known vocabulary decodes into
/// [`MessageKind::Other`] so the receiver can log and skip it instead of failing the stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Register,
    Login,
    Logout,
    Query,
    QueryResult,
    GetMetadata,
    ServerMessage,
    Error,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Register => "REGISTER",
            MessageKind::Login => "LOGIN",
            MessageKind::Logout => "LOGOUT",
            MessageKind::Query => "QUERY",
            MessageKind::QueryResult => "QUERY_RESULT",
            MessageKind::GetMetadata => "GET_METADATA",
            MessageKind::ServerMessage => "SERVER_MESSAGE",
            MessageKind::Error => "ERROR",
            MessageKind::Other(tag) => tag,
        }
    }
}

impl From<&str> for MessageKind {
    fn from(value: &str) -> Self {
        match value {
            "REGISTER" => MessageKind::Register,
            "LOGIN" => MessageKind::Login,
            "LOGOUT" => MessageKind::Logout,
            "QUERY" => MessageKind::Query,
            "QUERY_RESULT" => MessageKind::QueryResult,
            "GET_METADATA" => MessageKind::GetMetadata,
            "SERVER_MESSAGE" => MessageKind::ServerMessage,
            "ERROR" => MessageKind::Error,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single payload value. Binary data is kept as raw bytes; the codec writes an
/// explicit byte length in front of it, so any byte sequence round-trips.
///
/// Decoding is written by hand: nesting is capped at [`MAX_NESTING_DEPTH`] and byte
/// strings grow only as their bytes are read.
#[derive(Debug, Clone, PartialEq, Encode)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Payload> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// JSON rendering used when payloads are persisted. Bytes become base64 text.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Text(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => serde_json::Value::String(STANDARD.encode(b)),
            Value::List(items) => items.iter().map(Value::to_json).collect(),
            Value::Map(map) => payload_to_json(map),
        }
    }
}

impl<Context> Decode<Context> for Value {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        decode_value(decoder, 0)
    }
}
bincode::impl_borrow_decode!(Value);

fn decode_value<D: Decoder>(decoder: &mut D, depth: usize) -> Result<Value, DecodeError> {
    let variant = u32::decode(decoder)?;
    let value = match variant {
        0 => Value::Null,
        1 => Value::Bool(bool::decode(decoder)?),
        2 => Value::Int(i64::decode(decoder)?),
        3 => Value::Float(f64::decode(decoder)?),
        4 => Value::Text(decode_text(decoder)?),
        5 => Value::Bytes(decode_bytes(decoder)?),
        6 | 7 if depth >= MAX_NESTING_DEPTH => {
            return Err(DecodeError::Other("value nesting too deep"));
        }
        6 => {
            let len = usize::decode(decoder)?;
            let mut items = Vec::new();
            for _ in 0..len {
                items.push(decode_value(decoder, depth + 1)?);
            }
            Value::List(items)
        }
        7 => Value::Map(decode_entries(decoder, depth + 1)?),
        found => {
            return Err(DecodeError::UnexpectedVariant {
                type_name: "Value",
                allowed: &VALUE_VARIANTS,
                found,
            });
        }
    };
    Ok(value)
}

fn decode_entries<D: Decoder>(decoder: &mut D, depth: usize) -> Result<Payload, DecodeError> {
    let len = usize::decode(decoder)?;
    let mut entries = Payload::new();
    for _ in 0..len {
        let key = decode_text(decoder)?;
        let value = decode_value(decoder, depth)?;
        entries.insert(key, value);
    }
    Ok(entries)
}

/// Decodes a top-level payload map.
pub(super) fn decode_payload<D: Decoder>(decoder: &mut D) -> Result<Payload, DecodeError> {
    decode_entries(decoder, 0)
}

pub(super) fn decode_text<D: Decoder>(decoder: &mut D) -> Result<String, DecodeError> {
    String::from_utf8(decode_bytes(decoder)?).map_err(|e| DecodeError::Utf8 {
        inner: e.utf8_error(),
    })
}

fn decode_bytes<D: Decoder>(decoder: &mut D) -> Result<Vec<u8>, DecodeError> {
    let len = usize::decode(decoder)?;
    decoder.claim_bytes_read(len)?;

    let mut bytes = Vec::with_capacity(len.min(READ_CHUNK_SIZE));
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    while bytes.len() < len {
        let want = (len - bytes.len()).min(READ_CHUNK_SIZE);
        decoder.reader().read(&mut chunk[..want])?;
        bytes.extend_from_slice(&chunk[..want]);
    }
    Ok(bytes)
}

pub fn payload_to_json(payload: &Payload) -> serde_json::Value {
    serde_json::Value::Object(
        payload
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::Int(i64::try_from(value).unwrap_or(i64::MAX))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(value: Vec<Value>) -> Self {
        Value::List(value)
    }
}

impl From<Payload> for Value {
    fn from(value: Payload) -> Self {
        Value::Map(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Typed envelope exchanged between clients and the server. Immutable once built;
/// the builder methods consume and return `self`.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    kind: MessageKind,
    payload: Payload,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            payload: Payload::new(),
        }
    }

    pub fn with_payload(kind: MessageKind, payload: Payload) -> Self {
        Self { kind, payload }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// `ERROR {status: ERROR, message}`.
    pub fn error(message: impl Into<String>) -> Self {
        Message::new(MessageKind::Error)
            .with("status", STATUS_ERROR)
            .with("message", message.into())
    }

    /// `SERVER_MESSAGE {timestamp, message}` stamped with the local time.
    pub fn server_notice(text: &str) -> Self {
        Message::new(MessageKind::ServerMessage)
            .with("timestamp", Local::now().to_rfc3339())
            .with("message", text)
    }

    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Text field lookup; empty strings count as missing.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }

    pub fn status(&self) -> Option<&str> {
        self.text("status")
    }

    pub fn is_ok(&self) -> bool {
        self.status() == Some(STATUS_OK)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tags_are_stable() {
        for kind in [
            MessageKind::Register,
            MessageKind::Login,
            MessageKind::Logout,
            MessageKind::Query,
            MessageKind::QueryResult,
            MessageKind::GetMetadata,
            MessageKind::ServerMessage,
            MessageKind::Error,
        ] {
            assert_eq!(MessageKind::from(kind.as_str()), kind);
        }
    }

    #[test]
    fn unknown_tag_is_preserved() {
        let kind = MessageKind::from("CLIENT_LIST");
        assert_eq!(kind, MessageKind::Other("CLIENT_LIST".to_string()));
        assert_eq!(kind.to_string(), "CLIENT_LIST");
    }

    #[test]
    fn error_message_shape() {
        let msg = Message::error("Login failed: invalid credentials");
        assert_eq!(msg.kind(), &MessageKind::Error);
        assert_eq!(msg.status(), Some(STATUS_ERROR));
        assert_eq!(
            msg.text("message"),
            Some("Login failed: invalid credentials")
        );
        assert!(!msg.is_ok());
    }

    #[test]
    fn empty_text_counts_as_missing() {
        let msg = Message::new(MessageKind::Login).with("email", "");
        assert_eq!(msg.text("email"), None);
    }

    #[test]
    fn bytes_render_as_base64_json() {
        let msg = Message::new(MessageKind::Query)
            .with("query_type", "histogram")
            .with("raw", vec![0u8, 255, 16])
            .with("limit", 3i64);

        let json = payload_to_json(msg.payload());
        assert_eq!(json["query_type"], "histogram");
        assert_eq!(json["raw"], "AP8Q");
        assert_eq!(json["limit"], 3);
    }

    #[test]
    fn oversized_usize_saturates() {
        assert_eq!(Value::from(usize::MAX), Value::Int(i64::MAX));
        assert_eq!(Value::from(7usize), Value::Int(7));
    }

    #[test]
    fn optional_values_become_null() {
        let none: Option<&str> = None;
        assert_eq!(Value::from(none), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".to_string()));
    }
}
