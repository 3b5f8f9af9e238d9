//! Scratch destinations that hold a response while it is being captured.
//!
//! A sink lives for exactly one capture. Dropping it releases the buffer or
//! deletes the backing file, so every exit path of a capture cleans up.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use tracing::debug;

/// Where a store spills captured responses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SpillMedium {
    #[default]
    Memory,
    /// Anonymous temp files under this directory.
    File(PathBuf),
}

impl SpillMedium {
    pub fn create(&self) -> io::Result<Box<dyn TempSink>> {
        match self {
            SpillMedium::Memory => Ok(Box::new(MemTempSink::default())),
            SpillMedium::File(dir) => Ok(Box::new(FileTempSink::new_in(dir)?)),
        }
    }
}

pub trait TempSink: Write + Send {
    /// Bytes written so far.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Everything written so far as an immutable payload.
    fn to_bytes(&mut self) -> io::Result<Bytes>;
}

#[derive(Debug, Default)]
pub struct MemTempSink {
    buffer: Vec<u8>,
}

impl Write for MemTempSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl TempSink for MemTempSink {
    fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn to_bytes(&mut self) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(&self.buffer))
    }
}

/// Sink backed by an unnamed temp file; the OS reclaims it when dropped.
#[derive(Debug)]
pub struct FileTempSink {
    file: File,
    written: u64,
}

impl FileTempSink {
    pub fn new_in(dir: &Path) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let file = tempfile::tempfile_in(dir)?;
        debug!(dir = %dir.display(), "opened file spill sink");
        Ok(Self { file, written: 0 })
    }
}

impl Write for FileTempSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.file.write(buf)?;
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl TempSink for FileTempSink {
    fn len(&self) -> u64 {
        self.written
    }

    fn to_bytes(&mut self) -> io::Result<Bytes> {
        self.file.flush()?;
        self.file.seek(SeekFrom::Start(0))?;
        let mut buffer = Vec::with_capacity(self.written as usize);
        self.file.read_to_end(&mut buffer)?;
        self.file.seek(SeekFrom::End(0))?;
        Ok(Bytes::from(buffer))
    }
}
