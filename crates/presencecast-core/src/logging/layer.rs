//! tracing Layer writing to a node's JSONL file

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::LogRecord;
use super::writer::NodeLogWriter;
use crate::error::{TransportError, TransportResult};

/// Writes every event it sees to the node's JSONL file.
pub struct JsonlLayer {
    writer: Arc<NodeLogWriter>,
}

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, node: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(NodeLogWriter::new(logs_dir, node)?),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn node(&self) -> &str {
        self.writer.node()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut record = LogRecord::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.node(),
            metadata.target(),
            visitor.message.unwrap_or_default(),
        );
        if !visitor.fields.is_empty() {
            record = record.with_fields(serde_json::Value::Object(visitor.fields));
        }
        if let Some(scope) = ctx.event_scope(event) {
            let spans: Vec<&str> = scope.from_root().map(|span| span.name()).collect();
            if !spans.is_empty() {
                record = record.with_span(spans.join(" > "));
            }
        }

        // A failed log write must not take the node down
        let _ = self.writer.write(&record);
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl FieldVisitor {
    fn put(&mut self, field: &Field, value: serde_json::Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(buf, "{:?}", value);
        if field.name() == "message" {
            self.message = Some(buf);
        } else {
            self.put(field, serde_json::Value::String(buf));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.put(field, serde_json::Value::String(value.to_string()));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.put(field, serde_json::Value::Number(n));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.put(field, serde_json::Value::String(value.to_string()));
    }
}

/// Console plus JSONL subscriber for one node.
pub struct LoggingBuilder {
    logs_dir: PathBuf,
    node: String,
    console: bool,
    filter: Option<String>,
}

impl LoggingBuilder {
    pub fn new(logs_dir: impl Into<PathBuf>, node: impl Into<String>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            node: node.into(),
            console: true,
            filter: None,
        }
    }

    /// Only write the JSONL file.
    pub fn no_console(mut self) -> Self {
        self.console = false;
        self
    }

    /// Directive for the filter, e.g. `presencecast_core=debug`.
    ///
    /// `RUST_LOG` wins when set.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// The JSONL layer alone, for manual composition.
    pub fn build_layer(&self) -> std::io::Result<JsonlLayer> {
        JsonlLayer::new(&self.logs_dir, &self.node)
    }

    /// Install the global subscriber; returns the log file path.
    pub fn init(self) -> TransportResult<PathBuf> {
        let layer = self.build_layer()?;
        let path = layer.log_path().to_path_buf();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.filter.as_deref().unwrap_or("info")));
        let console = self.console.then(tracing_subscriber::fmt::layer);

        tracing_subscriber::registry()
            .with(filter)
            .with(layer)
            .with(console)
            .try_init()
            .map_err(|e| TransportError::InvalidConfig(format!("logging already initialised: {}", e)))?;
        Ok(path)
    }
}
