//! Payload Source/Sink Adapter
//!
//! Bridges the engine to persistent storage: when this process is the data
//! source, a [`PayloadSource`] streams the payload out; when receiving, a
//! [`PayloadSink`] accumulates chunks. The store behind them is pluggable —
//! [`FileStore`] spills to representation-named files, [`MemoryStore`]
//! backs tests and the configured inline text.
//!
//! Contract notes: a source's total length is captured at open and stays
//! fixed for the transfer's duration; sink creation is idempotent-on-type
//! (the engine reuses an open sink for the same representation).

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Readable payload handle with its fixed total length.
pub struct PayloadSource {
    reader: Box<dyn Read + Send>,
    /// Total byte length, fixed at open time (no mid-transfer re-stat).
    pub total: u64,
}

impl PayloadSource {
    /// Wrap a reader with its known length.
    pub fn new(reader: Box<dyn Read + Send>, total: u64) -> Self {
        Self { reader, total }
    }

    /// Read up to `buf.len()` bytes; 0 means end of stream.
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl std::fmt::Debug for PayloadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSource")
            .field("total", &self.total)
            .finish()
    }
}

/// Writable payload handle tagged with its representation.
pub struct PayloadSink {
    /// Representation this sink was opened for
    pub representation: String,
    writer: Box<dyn Write + Send>,
}

impl PayloadSink {
    /// Wrap a writer for the given representation.
    pub fn new(representation: String, writer: Box<dyn Write + Send>) -> Self {
        Self {
            representation,
            writer,
        }
    }

    /// Append one chunk.
    pub fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)
    }

    /// Flush and drop the handle.
    pub fn close(mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl std::fmt::Debug for PayloadSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadSink")
            .field("representation", &self.representation)
            .finish()
    }
}

/// Storage behind the engine's source and sink ends.
pub trait PayloadStore: Send {
    /// Length of the payload available for `representation`, if any.
    ///
    /// Drives the TARGETS capability answer and the INCR threshold
    /// decision without holding a handle open.
    fn source_len(&self, representation: &str) -> Option<u64>;

    /// Open the payload for reading; `None` when nothing backs this
    /// representation (the request will be refused).
    fn open_source(&self, representation: &str) -> io::Result<Option<PayloadSource>>;

    /// Open a sink for received data.
    fn open_sink(&self, representation: &str) -> io::Result<PayloadSink>;
}

/// File-backed store spilling payloads into a directory.
///
/// Received transfers land in files named by inferred representation
/// (`test.png`, `test.jpg`, ...); outgoing payloads are served from the
/// same names.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn spill_path(&self, representation: &str) -> PathBuf {
        let name = match representation {
            "image/png" => "test.png",
            "image/jpeg" => "test.jpg",
            "image/bmp" => "test.bmp",
            "STRING" | "UTF8_STRING" | "TEXT" | "text/plain" => "test.txt",
            "text/html" => "test.html",
            other => return self.dir.join(format!("test.{}", other.replace('/', "."))),
        };
        self.dir.join(name)
    }
}

impl PayloadStore for FileStore {
    fn source_len(&self, representation: &str) -> Option<u64> {
        std::fs::metadata(self.spill_path(representation))
            .ok()
            .filter(|m| m.is_file())
            .map(|m| m.len())
    }

    fn open_source(&self, representation: &str) -> io::Result<Option<PayloadSource>> {
        let path = self.spill_path(representation);
        match File::open(&path) {
            Ok(file) => {
                let total = file.metadata()?.len();
                debug!("serving '{}' from {} ({} bytes)", representation, path.display(), total);
                Ok(Some(PayloadSource::new(Box::new(file), total)))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn open_sink(&self, representation: &str) -> io::Result<PayloadSink> {
        let path = self.spill_path(representation);
        debug!("spilling '{}' to {}", representation, path.display());
        let file = File::create(&path)?;
        Ok(PayloadSink::new(representation.to_string(), Box::new(file)))
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    sources: HashMap<String, Vec<u8>>,
    sinks: HashMap<String, Vec<u8>>,
}

/// In-memory store for tests and inline text payloads.
///
/// Clones share the same tables, so a test can hand one clone to the
/// engine and inspect received bytes through another.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload served for `representation`.
    pub fn insert(&self, representation: &str, data: Vec<u8>) {
        self.inner
            .lock()
            .sources
            .insert(representation.to_string(), data);
    }

    /// Bytes received so far for `representation`.
    pub fn received(&self, representation: &str) -> Option<Vec<u8>> {
        self.inner.lock().sinks.get(representation).cloned()
    }
}

/// Writer end that appends into the shared sink table.
struct MemoryWriter {
    inner: Arc<Mutex<MemoryInner>>,
    representation: String,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner
            .lock()
            .sinks
            .entry(self.representation.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PayloadStore for MemoryStore {
    fn source_len(&self, representation: &str) -> Option<u64> {
        self.inner
            .lock()
            .sources
            .get(representation)
            .map(|d| d.len() as u64)
    }

    fn open_source(&self, representation: &str) -> io::Result<Option<PayloadSource>> {
        let data = match self.inner.lock().sources.get(representation) {
            Some(d) => d.clone(),
            None => return Ok(None),
        };
        let total = data.len() as u64;
        Ok(Some(PayloadSource::new(Box::new(Cursor::new(data)), total)))
    }

    fn open_sink(&self, representation: &str) -> io::Result<PayloadSink> {
        // A fresh sink truncates; chunk appends go through the writer.
        self.inner
            .lock()
            .sinks
            .insert(representation.to_string(), Vec::new());
        Ok(PayloadSink::new(
            representation.to_string(),
            Box::new(MemoryWriter {
                inner: Arc::clone(&self.inner),
                representation: representation.to_string(),
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.insert("image/png", vec![7, 8, 9]);

        assert_eq!(store.source_len("image/png"), Some(3));
        assert_eq!(store.source_len("image/bmp"), None);

        let mut source = store.open_source("image/png").unwrap().unwrap();
        assert_eq!(source.total, 3);
        let mut buf = [0u8; 8];
        assert_eq!(source.read_chunk(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], &[7, 8, 9]);

        let mut sink = store.open_sink("image/bmp").unwrap();
        sink.write_chunk(&[1, 2]).unwrap();
        sink.write_chunk(&[3]).unwrap();
        sink.close().unwrap();
        assert_eq!(store.received("image/bmp").unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_file_store_spill_and_serve() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path());

        assert!(store.open_source("image/png").unwrap().is_none());

        let mut sink = store.open_sink("image/png").unwrap();
        sink.write_chunk(b"pngdata").unwrap();
        sink.close().unwrap();

        assert_eq!(store.source_len("image/png"), Some(7));
        let mut source = store.open_source("image/png").unwrap().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 4];
        loop {
            let n = source.read_chunk(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        assert_eq!(out, b"pngdata");
    }

    #[test]
    fn test_file_store_names_by_representation() {
        let store = FileStore::new("/var/lib/xseld");
        assert_eq!(
            store.spill_path("image/jpeg"),
            PathBuf::from("/var/lib/xseld/test.jpg")
        );
        assert_eq!(
            store.spill_path("application/x-qt-image"),
            PathBuf::from("/var/lib/xseld/test.application.x-qt-image")
        );
    }
}
