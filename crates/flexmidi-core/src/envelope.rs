//! Envelope schemas carried inside Flex Data runs.
//!
//! Field names are the protocol: `{v,ts,corr,intent,body}` for commands,
//! `{ack,progress?,success?,error?}` for replies and
//! `{v,ev,id?,ct?,seq,frag?,ts?,data?}` for stream events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Intent used for every reply the bridge emits.
pub const REPLY_INTENT: &str = "flex.reply";

/// Intent carrying control-plane traffic (resend requests) for the bridge.
pub const CTRL_INTENT: &str = "flex.ctrl";

/// Stream event name carrying control-plane traffic.
pub const CTRL_EVENT: &str = "ctrl";

/// Correlation id used when a reply cannot be tied to its request.
pub const UNKNOWN_CORR: &str = "unknown";

/// Current envelope version.
pub const ENVELOPE_VERSION: i64 = 1;

// ── JSON values ───────────────────────────────────────────────────────────────

/// A JSON value with a stable encoding. Objects keep their keys sorted, so
/// equal values always serialize to identical bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum JsonValue {
    #[default]
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    Array(Vec<JsonValue>),
    Object(BTreeMap<String, JsonValue>),
}

impl JsonValue {
    pub fn object<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, JsonValue)>,
        K: Into<String>,
    {
        JsonValue::Object(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        match self {
            JsonValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsonValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JsonValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsonValue::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, JsonValue::Null)
    }

    /// Convert any serializable value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(JsonValue::from)
    }

    /// Interpret this value as `T`.
    pub fn deserialize_into<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(serde_json::Value::from(self.clone()))
    }
}

impl From<serde_json::Value> for JsonValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => JsonValue::Null,
            serde_json::Value::Bool(b) => JsonValue::Bool(b),
            serde_json::Value::Number(n) => JsonValue::Number(n),
            serde_json::Value::String(s) => JsonValue::String(s),
            serde_json::Value::Array(items) => {
                JsonValue::Array(items.into_iter().map(JsonValue::from).collect())
            }
            serde_json::Value::Object(map) => {
                JsonValue::Object(map.into_iter().map(|(k, v)| (k, JsonValue::from(v))).collect())
            }
        }
    }
}

impl From<JsonValue> for serde_json::Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => serde_json::Value::Null,
            JsonValue::Bool(b) => serde_json::Value::Bool(b),
            JsonValue::Number(n) => serde_json::Value::Number(n),
            JsonValue::String(s) => serde_json::Value::String(s),
            JsonValue::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            JsonValue::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for JsonValue {
    fn from(b: bool) -> Self {
        JsonValue::Bool(b)
    }
}

impl From<&str> for JsonValue {
    fn from(s: &str) -> Self {
        JsonValue::String(s.to_string())
    }
}

impl From<String> for JsonValue {
    fn from(s: String) -> Self {
        JsonValue::String(s)
    }
}

impl From<u64> for JsonValue {
    fn from(n: u64) -> Self {
        JsonValue::Number(n.into())
    }
}

impl From<i64> for JsonValue {
    fn from(n: i64) -> Self {
        JsonValue::Number(n.into())
    }
}

// ── Command envelope ──────────────────────────────────────────────────────────

/// A request (or reply) travelling between two services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: i64,
    /// Milliseconds since the Unix epoch.
    pub ts: u64,
    /// Caller-chosen correlation id, stable across request, ack and reply.
    pub corr: String,
    /// Logical route, e.g. "llm.chat".
    pub intent: String,
    pub body: JsonValue,
}

impl CommandEnvelope {
    pub fn new(corr: impl Into<String>, intent: impl Into<String>, body: JsonValue) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            ts: now_millis(),
            corr: corr.into(),
            intent: intent.into(),
            body,
        }
    }

    /// Wrap a reply for the given correlation id.
    pub fn reply(corr: impl Into<String>, reply: &Reply) -> Self {
        Self::new(corr, REPLY_INTENT, reply.to_body())
    }

    pub fn is_reply(&self) -> bool {
        self.intent == REPLY_INTENT
    }

    pub fn is_ctrl(&self) -> bool {
        self.intent == CTRL_INTENT
    }

    /// Parse the body as a reply. Only meaningful for `flex.reply` envelopes.
    pub fn as_reply(&self) -> Option<Reply> {
        if !self.is_reply() {
            return None;
        }
        Reply::from_body(&self.body)
    }
}

// ── Reply ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Reply {
    pub ack: bool,
    /// Fraction complete in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Reply {
    pub fn ack() -> Self {
        Self {
            ack: true,
            ..Self::default()
        }
    }

    pub fn success() -> Self {
        Self {
            ack: true,
            success: Some(true),
            ..Self::default()
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ack: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 1.0));
        self
    }

    pub fn to_body(&self) -> JsonValue {
        let mut obj = BTreeMap::new();
        obj.insert("ack".to_string(), JsonValue::Bool(self.ack));
        if let Some(p) = self.progress.and_then(serde_json::Number::from_f64) {
            obj.insert("progress".to_string(), JsonValue::Number(p));
        }
        if let Some(s) = self.success {
            obj.insert("success".to_string(), JsonValue::Bool(s));
        }
        if let Some(e) = &self.error {
            obj.insert("error".to_string(), JsonValue::String(e.clone()));
        }
        JsonValue::Object(obj)
    }

    pub fn from_body(body: &JsonValue) -> Option<Self> {
        body.deserialize_into().ok()
    }
}

// ── Stream envelope ───────────────────────────────────────────────────────────

/// Index and count of one fragment of a split payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub i: u32,
    pub n: u32,
}

impl Fragment {
    pub fn is_last(&self) -> bool {
        self.i + 1 >= self.n
    }
}

/// One event on a stream session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub v: i64,
    pub ev: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Content type of `data`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ct: Option<String>,
    /// Sender-monotonic sequence number.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frag: Option<Fragment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl StreamEnvelope {
    pub fn new(ev: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            v: ENVELOPE_VERSION,
            ev: ev.into(),
            id: None,
            ct: None,
            seq: 0,
            frag: None,
            ts: None,
            data: Some(data.into()),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn is_ctrl(&self) -> bool {
        self.ev == CTRL_EVENT
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
