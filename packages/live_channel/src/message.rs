//! Framed channel messages.
//!
//! Wire format: a JSON array `[join_ref, ref, topic, event, payload]`.
//! Refs travel as text; an absent ref is written as the string `"null"`.
//!
//! A decoded [`Frame`] keeps the payload as raw JSON. [`Message`] is the
//! typed view of a frame, one variant per event name this client speaks.

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::bootstrap::{JoinCredentials, Topic};
use crate::error::ChannelError;

pub const PHX_JOIN: &str = "phx_join";
pub const PHX_REPLY: &str = "phx_reply";
pub const EVENT: &str = "event";

/// Status value of a successful reply.
pub const STATUS_OK: &str = "ok";

/// Bytes left unescaped in form values and query parameters: ASCII
/// alphanumerics and `- _ . ~`.
pub(crate) const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const FRAME_LEN: usize = 5;

/// One unit of wire transmission.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub join_ref: Option<String>,
    pub msg_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

/// Encode a frame as JSON text, coercing both refs to strings.
pub fn encode(
    join_ref: Option<&str>,
    seq: u64,
    topic: &str,
    event: &str,
    payload: &Value,
) -> String {
    Value::Array(vec![
        Value::String(join_ref.unwrap_or("null").to_string()),
        Value::String(seq.to_string()),
        Value::String(topic.to_string()),
        Value::String(event.to_string()),
        payload.clone(),
    ])
    .to_string()
}

/// Decode JSON text into a frame.
///
/// Fails unless the text is a JSON array of at least five elements with a
/// string topic and event. Elements past the fifth are ignored.
pub fn decode(text: &str) -> Result<Frame, ChannelError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ChannelError::malformed(format!("invalid json: {e}")))?;
    let Value::Array(mut items) = value else {
        return Err(ChannelError::malformed("expected a json array"));
    };
    if items.len() < FRAME_LEN {
        return Err(ChannelError::malformed(format!(
            "expected {FRAME_LEN} elements, got {}",
            items.len()
        )));
    }

    Ok(Frame {
        join_ref: reference(&items[0], "join_ref")?,
        msg_ref: reference(&items[1], "ref")?,
        topic: text_field(&items[2], "topic")?,
        event: text_field(&items[3], "event")?,
        payload: items.swap_remove(4),
    })
}

/// True iff the frame is a `phx_reply` whose payload has `status: "ok"`.
pub fn is_successful_reply(frame: &Frame) -> bool {
    frame.event == PHX_REPLY
        && frame.payload.get("status").and_then(Value::as_str) == Some(STATUS_OK)
}

fn reference(value: &Value, position: &str) -> Result<Option<String>, ChannelError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(ChannelError::malformed(format!(
            "{position} must be a string, number or null, got {other}"
        ))),
    }
}

fn text_field(value: &Value, position: &str) -> Result<String, ChannelError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ChannelError::malformed(format!("{position} must be a string")))
}

impl Frame {
    pub fn encode(&self) -> String {
        Value::Array(vec![
            Value::String(self.join_ref.clone().unwrap_or_else(|| "null".into())),
            Value::String(self.msg_ref.clone().unwrap_or_else(|| "null".into())),
            Value::String(self.topic.clone()),
            Value::String(self.event.clone()),
            self.payload.clone(),
        ])
        .to_string()
    }

    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        decode(text)
    }

    pub fn is_successful_reply(&self) -> bool {
        is_successful_reply(self)
    }

    /// The numeric sequence number, when the ref is one.
    pub fn seq(&self) -> Option<u64> {
        self.msg_ref.as_deref().and_then(|r| r.parse().ok())
    }

    pub fn message(&self) -> Message {
        Message::from_frame(self)
    }
}

// =============================================================================
// Typed payloads
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinParams {
    #[serde(rename = "_csrf_token")]
    pub csrf_token: String,
    #[serde(rename = "_mounts")]
    pub mounts: u32,
}

/// Payload of `phx_join`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct JoinPayload {
    pub url: String,
    pub params: JoinParams,
    pub session: String,
    #[serde(rename = "static")]
    pub static_token: String,
}

impl JoinPayload {
    pub fn new(url: impl Into<String>, credentials: &JoinCredentials) -> Self {
        Self {
            url: url.into(),
            params: JoinParams {
                csrf_token: credentials.csrf_token.clone(),
                mounts: 0,
            },
            session: credentials.session_token.clone(),
            static_token: credentials.static_token.clone(),
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "url": self.url,
            "params": {
                "_csrf_token": self.params.csrf_token,
                "_mounts": self.params.mounts,
            },
            "session": self.session,
            "static": self.static_token,
        })
    }
}

/// Payload of an `event` push describing a form submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FormEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub event: String,
    /// URL-encoded `key=value` pair.
    pub value: String,
}

impl FormEvent {
    pub const KIND: &'static str = "form";

    pub fn new(event: impl Into<String>, field: &str, content: &str) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            event: event.into(),
            value: form_value(field, content),
        }
    }

    fn to_value(&self) -> Value {
        json!({
            "type": self.kind,
            "event": self.event,
            "value": self.value,
        })
    }
}

/// `key=value` with both sides percent-encoded.
pub fn form_value(field: &str, content: &str) -> String {
    format!(
        "{}={}",
        utf8_percent_encode(field, COMPONENT),
        utf8_percent_encode(content, COMPONENT)
    )
}

/// Payload of `phx_reply`. Any payload is accepted; a missing or non-string
/// status is `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: Option<String>,
    pub response: Value,
}

impl Reply {
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            status: payload
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            response: payload.get("response").cloned().unwrap_or(Value::Null),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status.as_deref() == Some(STATUS_OK)
    }

    pub fn check(&self) -> Result<(), ChannelError> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(ChannelError::ReplyStatusMismatch {
                status: self.status.clone(),
            })
        }
    }
}

/// Typed view of a frame, keyed on its event name.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Join(JoinPayload),
    Form(FormEvent),
    Reply(Reply),
    /// Anything else, passed through undecoded.
    Other { event: String, payload: Value },
}

impl Message {
    pub fn from_frame(frame: &Frame) -> Self {
        let other = || Self::Other {
            event: frame.event.clone(),
            payload: frame.payload.clone(),
        };
        match frame.event.as_str() {
            PHX_REPLY => Self::Reply(Reply::from_payload(&frame.payload)),
            PHX_JOIN => JoinPayload::deserialize(&frame.payload)
                .map(Self::Join)
                .unwrap_or_else(|_| other()),
            EVENT => match FormEvent::deserialize(&frame.payload) {
                Ok(form) if form.kind == FormEvent::KIND => Self::Form(form),
                _ => other(),
            },
            _ => other(),
        }
    }

    pub fn event_name(&self) -> &str {
        match self {
            Self::Join(_) => PHX_JOIN,
            Self::Form(_) => EVENT,
            Self::Reply(_) => PHX_REPLY,
            Self::Other { event, .. } => event,
        }
    }

    pub fn payload(&self) -> Value {
        match self {
            Self::Join(join) => join.to_value(),
            Self::Form(form) => form.to_value(),
            Self::Reply(reply) => {
                let mut payload = json!({ "response": reply.response });
                if let Some(status) = &reply.status {
                    payload["status"] = Value::String(status.clone());
                }
                payload
            }
            Self::Other { payload, .. } => payload.clone(),
        }
    }

    pub fn into_frame(self, join_ref: Option<&str>, seq: u64, topic: &Topic) -> Frame {
        Frame {
            join_ref: join_ref.map(str::to_string),
            msg_ref: Some(seq.to_string()),
            topic: topic.to_string(),
            event: self.event_name().to_string(),
            payload: self.payload(),
        }
    }
}

/// The first message on every connection.
pub fn join_frame(
    topic: &Topic,
    endpoint_url: &str,
    credentials: &JoinCredentials,
    seq: u64,
) -> Frame {
    Message::Join(JoinPayload::new(endpoint_url, credentials)).into_frame(None, seq, topic)
}

/// A form submission carrying `content` under `field`.
pub fn form_event_frame(
    topic: &Topic,
    seq: u64,
    event: &str,
    field: &str,
    content: &str,
) -> Frame {
    Message::Form(FormEvent::new(event, field, content)).into_frame(None, seq, topic)
}
