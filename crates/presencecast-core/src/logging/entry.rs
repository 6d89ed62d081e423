//! One line of a node's JSONL log

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single log record.
///
/// Records are self-contained so files from several nodes can be merged and
/// sorted by `ts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 with milliseconds, UTC
    pub ts: String,

    /// trace, debug, info, warn or error
    pub level: String,

    /// Instance name of the node that wrote the record
    pub node: String,

    /// Module path, e.g. `presencecast_core::presence::state`
    pub target: String,

    pub msg: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,

    /// Enclosing spans, outermost first, joined with ` > `
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogRecord {
    /// Create a record stamped with the current time.
    pub fn new(
        level: impl Into<String>,
        node: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            node: node.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// A structured field rendered as a string, if present.
    pub fn field(&self, name: &str) -> Option<String> {
        let value = self.fields.as_ref()?.get(name)?;
        Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Serialize to one JSON line without the newline.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
