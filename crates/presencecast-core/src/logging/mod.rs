//! Per-node JSONL logging
//!
//! Several nodes often run side by side on one host (tests, demos, a
//! multi-interface bridge), so each node writes its own append-only JSONL
//! file keyed by its instance name:
//!
//! ```text
//! logs/
//! └── raw/
//!     ├── 2026-10-16_node-7.jsonl
//!     └── 2026-10-16_node-12.jsonl
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use presencecast_core::logging::LoggingBuilder;
//!
//! LoggingBuilder::new("./logs", "node-7")
//!     .with_filter("presencecast_core=debug")
//!     .init()?;
//! ```
//!
//! Structured fields (`node_id`, `session`, `seq`, ...) land under `fields`:
//!
//! ```bash
//! jq 'select(.fields.node_id == "12")' logs/raw/*.jsonl
//! cat logs/raw/*.jsonl | jq -s 'sort_by(.ts)'
//! ```

pub mod entry;
pub mod layer;
pub mod writer;

pub use entry::LogRecord;
pub use layer::{JsonlLayer, LoggingBuilder};
pub use writer::{read_records, NodeLogWriter};
