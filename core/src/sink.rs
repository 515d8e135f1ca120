//! Persisted line output
//!
//! A [`LogSink`] receives every completed line after it has been published.
//! Failures are reported back to the controller, which logs them and carries
//! on; a broken log file never ends a session.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, LineWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Append-with-newline line destination
pub trait LogSink: Send {
    /// Append `line` followed by a newline
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Flush and release resources. Called once when the sink is replaced or
    /// the controller stops.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Line-buffered append-only log file
pub struct FileSink {
    path: PathBuf,
    writer: Option<LineWriter<File>>,
}

impl FileSink {
    /// Open `path` for appending, creating it and its parent directories
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!("Appending log lines to {}", path.display());
        Ok(Self {
            path,
            writer: Some(LineWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileSink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "log file closed"))?;
        writer.write_all(line.as_bytes())?;
        writer.write_all(b"\n")
    }

    fn close(&mut self) -> io::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// In-memory sink; clones share the same line buffer
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every line written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl LogSink for MemorySink {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_file_sink_creates_parents_and_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("nested").join("device.log");

        let mut sink = FileSink::open(&path).unwrap();
        sink.write_line("first").unwrap();
        sink.write_line("second").unwrap();
        sink.close().unwrap();

        let mut again = FileSink::open(&path).unwrap();
        again.write_line("third").unwrap();
        drop(again);

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "first\nsecond\nthird\n");
    }

    #[test]
    fn test_file_sink_lines_visible_before_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("live.log");

        let mut sink = FileSink::open(&path).unwrap();
        sink.write_line("streaming").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "streaming\n");
        assert_eq!(sink.path(), path.as_path());
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempdir().unwrap();
        let mut sink = FileSink::open(dir.path().join("x.log")).unwrap();
        sink.close().unwrap();
        assert!(sink.write_line("late").is_err());
        assert!(sink.close().is_ok());
    }

    #[test]
    fn test_memory_sink_shares_buffer() {
        let sink = MemorySink::new();
        let mut writer = sink.clone();
        writer.write_line("a").unwrap();
        writer.write_line("b").unwrap();
        writer.close().unwrap();

        assert_eq!(sink.lines(), vec!["a", "b"]);
        assert!(sink.is_closed());
    }
}
