//! Raw copy of every ingested GRIB2 message.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

/// Append-only concatenation of GRIB2 messages.
///
/// A mirror is itself a valid GRIB2 file and can be unpacked again with
/// [`unpack_mirror`](crate::unpack_mirror).
#[derive(Debug)]
pub struct Mirror {
    path: PathBuf,
    writer: BufWriter<File>,
    messages: usize,
    bytes: u64,
}

impl Mirror {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        debug!(path = %path.display(), "Created GRIB mirror");
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            messages: 0,
            bytes: 0,
        })
    }

    pub fn append(&mut self, message: &[u8]) -> std::io::Result<()> {
        self.writer.write_all(message)?;
        self.messages += 1;
        self.bytes += message.len() as u64;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn messages(&self) -> usize {
        self.messages
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }

    /// Flush buffered messages and sync the file to disk.
    pub fn close(mut self) -> std::io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        debug!(
            path = %self.path.display(),
            messages = self.messages,
            bytes = self.bytes,
            "Closed GRIB mirror"
        );
        Ok(())
    }
}
