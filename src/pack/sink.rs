//! Byte sinks for the emitted pack stream.
//!
//! The writer only needs `write(bytes)`; any error aborts the emission.
//! Three adapters cover the emit entry points: an in-memory buffer, a
//! generic stream for transports, and a file sink that stages into a
//! temporary file and publishes atomically on commit. A failed or
//! abandoned file sink removes its staging file on drop, so no partial
//! pack is ever visible at the target path.

use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

/// Destination for emitted pack bytes.
pub trait PackSink {
    /// Appends `bytes` to the stream.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl PackSink for Vec<u8> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Adapter writing the pack to any [`io::Write`] transport.
pub struct StreamSink<'a, W: Write> {
    inner: &'a mut W,
}

impl<'a, W: Write> StreamSink<'a, W> {
    /// Wraps a transport.
    pub fn new(inner: &'a mut W) -> Self {
        Self { inner }
    }
}

impl<W: Write> PackSink for StreamSink<'_, W> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_all(bytes)
    }
}

/// File sink with atomic publication.
///
/// Bytes accumulate in a temporary file next to the target path; `commit`
/// persists it under the final name in one rename. Dropping the sink
/// without committing removes the staging file.
pub struct FileSink {
    staging: NamedTempFile,
    target: PathBuf,
}

impl FileSink {
    /// Opens a staging file in the target's directory.
    pub fn create(target: &Path) -> io::Result<Self> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let staging = tempfile::Builder::new()
            .prefix(".tmp-pack-")
            .tempfile_in(dir)?;
        Ok(Self {
            staging,
            target: target.to_path_buf(),
        })
    }

    /// Flushes and atomically publishes the staging file at the target
    /// path.
    pub fn commit(mut self) -> io::Result<()> {
        self.staging.flush()?;
        self.staging
            .persist(&self.target)
            .map(drop)
            .map_err(|err| err.error)
    }
}

impl PackSink for FileSink {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.staging.write_all(bytes)
    }
}
