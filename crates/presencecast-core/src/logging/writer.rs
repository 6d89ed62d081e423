//! Append-only JSONL file per node

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use super::entry::LogRecord;

/// Appends records to `logs/raw/<date>_<node>.jsonl`.
pub struct NodeLogWriter {
    node: String,
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl NodeLogWriter {
    /// Open (creating directories as needed) today's file for `node`.
    pub fn new(logs_dir: impl AsRef<Path>, node: impl Into<String>) -> std::io::Result<Self> {
        let node = node.into();
        let raw_dir = logs_dir.as_ref().join("raw");
        fs::create_dir_all(&raw_dir)?;

        let date = chrono::Local::now().format("%Y-%m-%d");
        let path = raw_dir.join(format!("{}_{}.jsonl", date, node));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            node,
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and flush.
    pub fn write(&self, record: &LogRecord) -> std::io::Result<()> {
        let line = record
            .to_json_line()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()
    }

    pub fn flush(&self) -> std::io::Result<()> {
        self.writer.lock().flush()
    }
}

impl Drop for NodeLogWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// Read every record under `logs_dir/raw`, optionally for one node, sorted
/// by timestamp. Unparseable lines are skipped.
pub fn read_records(logs_dir: impl AsRef<Path>, node: Option<&str>) -> std::io::Result<Vec<LogRecord>> {
    let raw_dir = logs_dir.as_ref().join("raw");
    if !raw_dir.exists() {
        return Ok(Vec::new());
    }

    let mut records = Vec::new();
    for entry in fs::read_dir(&raw_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|f| f.to_str()) else {
            continue;
        };
        if !name.ends_with(".jsonl") {
            continue;
        }
        if let Some(node) = node {
            if !name.ends_with(&format!("_{}.jsonl", node)) {
                continue;
            }
        }
        let content = fs::read_to_string(&path)?;
        records.extend(
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .filter_map(|line| LogRecord::from_json_line(line).ok()),
        );
    }

    records.sort_by(|a, b| a.ts.cmp(&b.ts));
    Ok(records)
}
