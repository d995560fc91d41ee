use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;
use uuid::Uuid;

use super::{ConnectionId, MessageId, TunnelId};
use crate::error::{Result, SubwayError};

/// Value keys used by the control messages.
pub mod keys {
    pub const DOMAIN: &str = "domain";
    pub const PORT: &str = "port";
    pub const TUNNEL_ID: &str = "tunnel_id";
    pub const CONNECTION_ID: &str = "connection_id";
    pub const URL: &str = "url";
    pub const SUCCESS: &str = "success";
    pub const MESSAGE: &str = "message";
}

/// Control message codes. Unrecognized numbers decode as [`MessageCode::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum MessageCode {
    #[default]
    Unknown,
    CreateWebTunnel,
    CreateTcpTunnel,
    CloseTunnel,
    CloseConnection,
    NewConnection,
    ConnectionClosedNotification,
    TunnelClosedNotification,
}

impl From<i32> for MessageCode {
    fn from(code: i32) -> Self {
        match code {
            1000 => MessageCode::CreateWebTunnel,
            1001 => MessageCode::CreateTcpTunnel,
            1002 => MessageCode::CloseTunnel,
            1003 => MessageCode::CloseConnection,
            1004 => MessageCode::NewConnection,
            2000 => MessageCode::ConnectionClosedNotification,
            2001 => MessageCode::TunnelClosedNotification,
            _ => MessageCode::Unknown,
        }
    }
}

impl From<MessageCode> for i32 {
    fn from(code: MessageCode) -> Self {
        match code {
            MessageCode::Unknown => 0,
            MessageCode::CreateWebTunnel => 1000,
            MessageCode::CreateTcpTunnel => 1001,
            MessageCode::CloseTunnel => 1002,
            MessageCode::CloseConnection => 1003,
            MessageCode::NewConnection => 1004,
            MessageCode::ConnectionClosedNotification => 2000,
            MessageCode::TunnelClosedNotification => 2001,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MessageType {
    /// Expects exactly one response.
    #[default]
    Message,
    Response,
    /// Fire-and-forget.
    Notification,
}

/// Loosely-typed scalar carried in [`Message::values`].
///
/// Peers are free to send numbers as strings and booleans as `"True"`,
/// so the accessors coerce rather than reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    /// Boolean reading; anything unparsable is `false`.
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Text(s) => s.trim().eq_ignore_ascii_case("true"),
            Value::Null | Value::Float(_) => false,
        }
    }

    /// Integer reading; anything unparsable is `0`.
    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(i) => *i,
            Value::Text(s) => s.trim().parse().unwrap_or(0),
            Value::Bool(_) | Value::Null | Value::Float(_) => 0,
        }
    }

    /// Id reading; anything unparsable is the nil id.
    pub fn as_id<I: From<Uuid>>(&self) -> I {
        let id = match self {
            Value::Text(s) => Uuid::parse_str(s.trim()).unwrap_or(Uuid::nil()),
            _ => Uuid::nil(),
        };
        I::from(id)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<u16> for Value {
    fn from(i: u16) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<TunnelId> for Value {
    fn from(id: TunnelId) -> Self {
        Value::Text(id.to_string())
    }
}

impl From<ConnectionId> for Value {
    fn from(id: ConnectionId) -> Self {
        Value::Text(id.to_string())
    }
}

/// A control message, sent as one JSON text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub code: MessageCode,
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub id: MessageId,
    #[serde(default)]
    pub values: HashMap<String, Value>,
}

impl Message {
    /// A request that expects a response.
    pub fn request(code: MessageCode) -> Self {
        Self {
            code,
            kind: MessageType::Message,
            id: MessageId::new(),
            values: HashMap::new(),
        }
    }

    pub fn notification(code: MessageCode) -> Self {
        Self {
            kind: MessageType::Notification,
            ..Self::request(code)
        }
    }

    /// Builder-style value insertion.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.values.insert(key.to_string(), value.into());
        self
    }

    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.value(key).map(Value::to_string)
    }

    pub fn flag(&self, key: &str) -> bool {
        self.value(key).map(Value::as_bool).unwrap_or(false)
    }

    pub fn int(&self, key: &str) -> i64 {
        self.value(key).map(Value::as_int).unwrap_or(0)
    }

    pub fn id_value<I: From<Uuid>>(&self, key: &str) -> I {
        match self.value(key) {
            Some(v) => v.as_id(),
            None => I::from(Uuid::nil()),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A message of type `Response`, answering the request with the same id.
#[derive(Debug, Clone, PartialEq)]
pub struct Response(Message);

impl Response {
    pub fn new(request_id: MessageId, success: bool, message: impl Into<String>) -> Self {
        Self(Message {
            code: MessageCode::Unknown,
            kind: MessageType::Response,
            id: request_id,
            values: HashMap::new(),
        })
        .with(keys::SUCCESS, success)
        .with(keys::MESSAGE, message.into())
    }

    pub fn ok(request_id: MessageId, message: impl Into<String>) -> Self {
        Self::new(request_id, true, message)
    }

    pub fn failed(request_id: MessageId, message: impl Into<String>) -> Self {
        Self::new(request_id, false, message)
    }

    pub fn with(self, key: &str, value: impl Into<Value>) -> Self {
        Self(self.0.with(key, value))
    }

    pub fn success(&self) -> bool {
        self.0.flag(keys::SUCCESS)
    }

    pub fn message(&self) -> String {
        self.0.text(keys::MESSAGE).unwrap_or_default()
    }

    /// Converts a failed response into [`SubwayError::Rejected`].
    pub fn into_result(self) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(SubwayError::Rejected(self.message()))
        }
    }

    pub fn into_message(self) -> Message {
        self.0
    }
}

impl Deref for Response {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.0
    }
}

impl TryFrom<Message> for Response {
    type Error = SubwayError;

    fn try_from(message: Message) -> Result<Self> {
        match message.kind {
            MessageType::Response => Ok(Self(message)),
            other => Err(SubwayError::Protocol(format!(
                "expected a response, got {:?}",
                other
            ))),
        }
    }
}
