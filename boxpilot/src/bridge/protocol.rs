//! Wire protocol types for controller-supervisor communication.
//!
//! Two message shapes share one channel:
//! - **RPC**: [`Request`] / [`Response`], correlated by `id`
//! - **Events**: unsolicited [`Event`]s pushed by the supervisor, tagged by `event`

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// JSON object payload used for `params` and `result`.
pub type Object = Map<String, Value>;

/// Method names understood by the supervisor.
pub mod method {
    pub const START: &str = "start";
    pub const STOP: &str = "stop";
    pub const RESTART: &str = "restart";
    pub const STATUS: &str = "status";
    pub const SET_CONFIG: &str = "setConfig";
    pub const SHUTDOWN: &str = "shutdown";
    pub const VERSION: &str = "version";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: String,
    /// Missing and `null` both mean no parameters.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub params: Object,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Object, D::Error> {
    Ok(Option::<Object>::deserialize(deserializer)?.unwrap_or_default())
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Object) -> Self {
        Self {
            id,
            method: method.into(),
            params,
        }
    }

    /// String parameter, treating an empty string as absent.
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Object>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: u64, result: Object) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Unsolicited supervisor notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Event {
    Status { running: bool },
    Log { stream: LogStream, message: String },
    Error { message: String },
}

/// Any line that can appear on the channel.
///
/// Classification: `event` present means an [`Event`]; otherwise `id` plus
/// `method` is a [`Request`] and `id` without `method` is a [`Response`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl Message {
    pub fn classify(object: Object) -> Result<Self, serde_json::Error> {
        let is_event = object.contains_key("event");
        let has_id = object.contains_key("id");
        let has_method = object.contains_key("method");
        let value = Value::Object(object);

        match (is_event, has_id, has_method) {
            (true, _, _) => serde_json::from_value(value).map(Self::Event),
            (false, true, true) => serde_json::from_value(value).map(Self::Request),
            (false, true, false) => serde_json::from_value(value).map(Self::Response),
            (false, false, _) => Err(serde_json::Error::custom(
                "message has neither `id` nor `event`",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = Object::deserialize(deserializer)?;
        Self::classify(object).map_err(D::Error::custom)
    }
}

impl Serialize for Message {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(req) => req.serialize(serializer),
            Self::Response(resp) => resp.serialize(serializer),
            Self::Event(event) => event.serialize(serializer),
        }
    }
}

/// Builds an [`Object`] from a `json!` literal; non-objects become empty.
pub fn object(value: Value) -> Object {
    match value {
        Value::Object(map) => map,
        _ => Object::new(),
    }
}
