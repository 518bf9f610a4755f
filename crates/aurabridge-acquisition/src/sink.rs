//! Sink contract and the CSV sink used for every signal.
//!
//! A sink is bound to one output file. Rows may be written only while it is
//! open, and each open is closed exactly once: `close_file` on a closed sink
//! is a no-op.

use crate::lock;
use aurabridge_core::{Error, Result};
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One cell of a row.
#[derive(Clone, Debug, PartialEq)]
pub enum Field {
    Float(f64),
    Int(i64),
    Text(String),
    Bool(bool),
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Float(v) => write!(f, "{}", v),
            Field::Int(v) => write!(f, "{}", v),
            Field::Bool(v) => f.write_str(if *v { "1" } else { "0" }),
            Field::Text(s) if s.contains([',', '"', '\n', '\r']) => {
                write!(f, "\"{}\"", s.replace('"', "\"\""))
            }
            Field::Text(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Field::Float(v)
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Field::Int(v)
    }
}

impl From<u64> for Field {
    fn from(v: u64) -> Self {
        Field::Int(v as i64)
    }
}

impl From<bool> for Field {
    fn from(v: bool) -> Self {
        Field::Bool(v)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Field::Text(v.to_string())
    }
}

impl From<String> for Field {
    fn from(v: String) -> Self {
        Field::Text(v)
    }
}

/// Append-only row writer bound to one file.
pub trait Sink: Send {
    /// Create (truncate) the file and write its header.
    fn create_new_file(&mut self) -> Result<()>;

    /// Append one row. `timestamp` is session-relative seconds; `None` for
    /// rows without a time column.
    fn write(&mut self, timestamp: Option<f64>, fields: &[Field]) -> Result<()>;

    /// Flush and close. Closing a closed sink does nothing.
    fn close_file(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    fn path(&self) -> &Path;
}

/// Builds sinks for the session controller.
pub trait SinkFactory: Send + Sync {
    fn create(&self, path: &Path, header: &[String]) -> Result<Box<dyn Sink>>;
}

/// Comma-separated file with a header line.
pub struct CsvSink {
    path: PathBuf,
    header: Vec<String>,
    writer: Option<BufWriter<File>>,
    rows: u64,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>, header: Vec<String>) -> Self {
        Self {
            path: path.into(),
            header,
            writer: None,
            rows: 0,
        }
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }
}

impl Sink for CsvSink {
    fn create_new_file(&mut self) -> Result<()> {
        if self.writer.is_some() {
            return Err(Error::Sink(format!(
                "{} is already open",
                self.path.display()
            )));
        }
        let mut writer = BufWriter::new(File::create(&self.path)?);
        if !self.header.is_empty() {
            writeln!(writer, "{}", self.header.join(","))?;
        }
        self.writer = Some(writer);
        self.rows = 0;
        debug!(path = %self.path.display(), "Sink opened");
        Ok(())
    }

    fn write(&mut self, timestamp: Option<f64>, fields: &[Field]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            Error::Sink(format!("write to closed sink {}", self.path.display()))
        })?;
        let cells: Vec<String> = timestamp
            .map(|ts| format!("{:.3}", ts))
            .into_iter()
            .chain(fields.iter().map(Field::to_string))
            .collect();
        writeln!(writer, "{}", cells.join(","))?;
        self.rows += 1;
        Ok(())
    }

    fn close_file(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
            debug!(path = %self.path.display(), rows = self.rows, "Sink closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.writer.is_some()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CsvSink {
    fn drop(&mut self) {
        if let Err(e) = self.close_file() {
            warn!(path = %self.path.display(), error = %e, "Failed to close sink on drop");
        }
    }
}

/// Default factory producing [`CsvSink`]s.
#[derive(Clone, Copy, Debug, Default)]
pub struct CsvSinkFactory;

impl SinkFactory for CsvSinkFactory {
    fn create(&self, path: &Path, header: &[String]) -> Result<Box<dyn Sink>> {
        Ok(Box::new(CsvSink::new(path, header.to_vec())))
    }
}

/// Shared handle to a sink. The controller keeps one clone so it can close
/// every sink on stop; the owning worker writes through another.
#[derive(Clone)]
pub struct SinkHandle {
    inner: Arc<Mutex<Box<dyn Sink>>>,
    path: PathBuf,
}

impl SinkHandle {
    pub fn new(sink: Box<dyn Sink>) -> Self {
        let path = sink.path().to_path_buf();
        Self {
            inner: Arc::new(Mutex::new(sink)),
            path,
        }
    }

    pub fn open(&self) -> Result<()> {
        lock(&self.inner).create_new_file()
    }

    pub fn write(&self, timestamp: Option<f64>, fields: &[Field]) -> Result<()> {
        lock(&self.inner).write(timestamp, fields)
    }

    pub fn close(&self) -> Result<()> {
        lock(&self.inner).close_file()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.inner).is_open()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Guard that closes the sink when dropped, on every exit path of a worker.
    pub fn close_on_drop(&self) -> CloseOnDrop {
        CloseOnDrop(self.clone())
    }
}

/// Closes its sink on drop.
pub struct CloseOnDrop(SinkHandle);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        if let Err(e) = self.0.close() {
            warn!(path = %self.0.path().display(), error = %e, "Failed to close sink");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn header(cols: &[&str]) -> Vec<String> {
        cols.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn writes_header_and_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p_pointer.csv");
        let mut sink = CsvSink::new(&path, header(&["timestamp", "x", "y", "clicked"]));
        sink.create_new_file().unwrap();
        sink.write(
            Some(0.12345),
            &[Field::Int(10), Field::Int(20), Field::Bool(true)],
        )
        .unwrap();
        sink.close_file().unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "timestamp,x,y,clicked\n0.123,10,20,1\n");
    }

    #[test]
    fn rows_without_timestamp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.csv");
        let mut sink = CsvSink::new(&path, header(&["a", "b"]));
        sink.create_new_file().unwrap();
        sink.write(None, &[Field::Float(1.5), Field::Float(-2.0)])
            .unwrap();
        sink.close_file().unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().nth(1), Some("1.5,-2"));
    }

    #[test]
    fn write_while_closed_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut sink = CsvSink::new(dir.path().join("x.csv"), vec![]);
        assert!(matches!(sink.write(Some(0.0), &[]), Err(Error::Sink(_))));
        sink.create_new_file().unwrap();
        sink.close_file().unwrap();
        assert!(sink.write(Some(0.0), &[]).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let handle = SinkHandle::new(Box::new(CsvSink::new(dir.path().join("k.csv"), vec![])));
        handle.open().unwrap();
        assert!(handle.is_open());
        {
            let _guard = handle.close_on_drop();
        }
        assert!(!handle.is_open());
        handle.close().unwrap();
    }

    #[test]
    fn text_fields_are_quoted() {
        assert_eq!(Field::from("a,b").to_string(), "\"a,b\"");
        assert_eq!(Field::from("say \"hi\"").to_string(), "\"say \"\"hi\"\"\"");
        assert_eq!(Field::from("happy").to_string(), "happy");
    }
}
