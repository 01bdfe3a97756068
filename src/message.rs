//! Broker message type: immutable body plus a mutable envelope.
//!
//! The envelope carries the system fields a broker routes on (message id,
//! correlation id, subject, content type, addressing fields) and an ordered
//! set of application properties. Rule actions mutate a *copy* of the
//! envelope during dispatch; the body is never touched.

use std::fmt;
use std::time::Duration;

/// A scalar application-property value.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl PropertyValue {
    /// String rendering used for correlation-filter comparison.
    pub fn as_text(&self) -> String {
        match self {
            PropertyValue::String(s) => s.clone(),
            PropertyValue::Int(n) => n.to_string(),
            PropertyValue::Float(f) => f.to_string(),
            PropertyValue::Bool(b) => b.to_string(),
        }
    }

    /// Numeric view, if this value is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Int(n) => Some(*n as f64),
            PropertyValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        PropertyValue::String(s.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        PropertyValue::String(s)
    }
}

impl From<i64> for PropertyValue {
    fn from(n: i64) -> Self {
        PropertyValue::Int(n)
    }
}

impl From<f64> for PropertyValue {
    fn from(f: f64) -> Self {
        PropertyValue::Float(f)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        PropertyValue::Bool(b)
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

/// A message as handed to the broker by a sender.
///
/// The body is an opaque byte sequence. Application properties keep their
/// insertion order so filter evaluation and round-trips are deterministic.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub subject: Option<String>,
    pub content_type: Option<String>,
    pub to: Option<String>,
    pub reply_to: Option<String>,
    pub reply_to_session_id: Option<String>,
    pub session_id: Option<String>,
    pub application_properties: Vec<(String, PropertyValue)>,
    /// Per-message TTL. When absent, the target entity's default applies.
    pub time_to_live: Option<Duration>,
}

impl Message {
    /// Creates a message with the given body and an empty envelope.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// Looks up an application property by key.
    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.application_properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Sets an application property, replacing an existing value for the key.
    pub fn set_property(&mut self, key: impl Into<String>, value: PropertyValue) {
        let key = key.into();
        match self.application_properties.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.application_properties.push((key, value)),
        }
    }

    /// Resolves a system field by its filter-language name (`sys.<name>`,
    /// case-insensitive). Returns `None` for unset or unknown fields.
    pub fn system_field(&self, name: &str) -> Option<String> {
        let field = match name.to_ascii_lowercase().as_str() {
            "messageid" => &self.message_id,
            "correlationid" => &self.correlation_id,
            "subject" | "label" => &self.subject,
            "contenttype" => &self.content_type,
            "to" => &self.to,
            "replyto" => &self.reply_to,
            "replytosessionid" => &self.reply_to_session_id,
            "sessionid" => &self.session_id,
            _ => return None,
        };
        field.clone()
    }

    /// Writes a system field by its filter-language name. Returns `false`
    /// for fields that cannot be set (unknown names and the message id,
    /// which is the message's identity).
    pub fn set_system_field(&mut self, name: &str, value: String) -> bool {
        match name.to_ascii_lowercase().as_str() {
            "correlationid" => self.correlation_id = Some(value),
            "subject" | "label" => self.subject = Some(value),
            "contenttype" => self.content_type = Some(value),
            "to" => self.to = Some(value),
            "replyto" => self.reply_to = Some(value),
            "replytosessionid" => self.reply_to_session_id = Some(value),
            "sessionid" => self.session_id = Some(value),
            _ => return false,
        }
        true
    }

    /// True if `name` is a settable system field (used to validate rule
    /// actions at creation time).
    pub fn is_settable_system_field(name: &str) -> bool {
        matches!(
            name.to_ascii_lowercase().as_str(),
            "correlationid"
                | "subject"
                | "label"
                | "contenttype"
                | "to"
                | "replyto"
                | "replytosessionid"
                | "sessionid"
        )
    }
}

/// Builder for [`Message`].
#[derive(Debug, Default)]
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    pub fn body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.message.body = body.into();
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.message.message_id = Some(id.into());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.message.correlation_id = Some(id.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.message.subject = Some(subject.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.message.content_type = Some(content_type.into());
        self
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.message.to = Some(to.into());
        self
    }

    pub fn reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.message.reply_to = Some(reply_to.into());
        self
    }

    pub fn reply_to_session_id(mut self, id: impl Into<String>) -> Self {
        self.message.reply_to_session_id = Some(id.into());
        self
    }

    pub fn session_id(mut self, id: impl Into<String>) -> Self {
        self.message.session_id = Some(id.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<PropertyValue>) -> Self {
        self.message
            .application_properties
            .push((key.into(), value.into()));
        self
    }

    pub fn time_to_live(mut self, ttl: Duration) -> Self {
        self.message.time_to_live = Some(ttl);
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
