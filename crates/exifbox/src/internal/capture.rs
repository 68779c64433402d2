use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::Arc,
};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWrite;
use tracing::{debug, warn};
use wasmtime_wasi::{
    cli::{IsTerminal, StdoutStream},
    p2::{OutputStream, Pollable, StreamError, StreamResult},
};

use crate::{
    TRACE_TARGET_GUEST,
    alloc::{HostBuf, SharedAllocator},
};

const WRITE_CHUNK: usize = 1024 * 1024;
const MAX_LOG_LINE: usize = 4096;

/// Anonymous scratch file receiving guest stdout.
///
/// The file is unlinked from its directory at creation, so it disappears with
/// the last handle. Host and guest share one file description; truncating
/// and rewinding here also moves the guest's write position.
pub struct Capture {
    file: Arc<Mutex<File>>,
}

impl Capture {
    pub fn new(scratch_dir: &Path) -> io::Result<Self> {
        let file = tempfile::tempfile_in(scratch_dir)?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn stdout(&self) -> CaptureOutput {
        CaptureOutput {
            file: Arc::clone(&self.file),
        }
    }

    /// Truncate to empty and rewind.
    pub fn clear(&self) -> io::Result<()> {
        let mut file = self.file.lock();
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Read everything the guest wrote since the last [`Capture::clear`].
    pub fn read(&self, alloc: &SharedAllocator) -> io::Result<HostBuf> {
        let mut file = self.file.lock();
        let size = match file.seek(SeekFrom::End(0)) {
            Ok(size) => size,
            Err(e) => {
                warn!(error = %e, "captured output channel is not seekable");
                return Ok(HostBuf::empty(alloc));
            }
        };
        let size = usize::try_from(size)
            .map_err(|_| io::Error::new(io::ErrorKind::FileTooLarge, "captured output too large"))?;
        if size == 0 {
            return Ok(HostBuf::empty(alloc));
        }
        file.seek(SeekFrom::Start(0))?;

        let mut buf = HostBuf::zeroed(alloc, size).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "host allocation failed")
        })?;
        let filled = read_to_fill(&mut *file, buf.as_mut_slice())?;
        buf.truncate(filled);
        Ok(buf)
    }
}

/// Read until `dst` is full or EOF; returns the number of bytes read.
pub fn read_to_fill(src: &mut impl Read, dst: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < dst.len() {
        match src.read(&mut dst[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

pub struct CaptureOutput {
    file: Arc<Mutex<File>>,
}

impl StdoutStream for CaptureOutput {
    fn async_stream(&self) -> Box<dyn AsyncWrite + Send + Sync> {
        match self.file.lock().try_clone() {
            Ok(file) => Box::new(tokio::fs::File::from_std(file)),
            Err(e) => {
                warn!(error = %e, "failed to clone captured output handle");
                Box::new(tokio::io::sink())
            }
        }
    }

    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(CaptureStream {
            file: Arc::clone(&self.file),
        })
    }
}

impl IsTerminal for CaptureOutput {
    fn is_terminal(&self) -> bool {
        false
    }
}

struct CaptureStream {
    file: Arc<Mutex<File>>,
}

#[async_trait::async_trait]
impl Pollable for CaptureStream {
    async fn ready(&mut self) {}
}

impl OutputStream for CaptureStream {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        self.file
            .lock()
            .write_all(&bytes)
            .map_err(|e| StreamError::LastOperationFailed(e.into()))
    }

    fn flush(&mut self) -> StreamResult<()> {
        self.file
            .lock()
            .flush()
            .map_err(|e| StreamError::LastOperationFailed(e.into()))
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(WRITE_CHUNK)
    }
}

/// Routes guest stderr into `tracing`, one event per line.
pub struct GuestLog;

impl StdoutStream for GuestLog {
    fn async_stream(&self) -> Box<dyn AsyncWrite + Send + Sync> {
        // Preview2 uses `p2_stream` for stdout/stderr; this is a best-effort sink.
        Box::new(tokio::io::sink())
    }

    fn p2_stream(&self) -> Box<dyn OutputStream> {
        Box::new(GuestLogStream { line: Vec::new() })
    }
}

impl IsTerminal for GuestLog {
    fn is_terminal(&self) -> bool {
        false
    }
}

struct GuestLogStream {
    line: Vec<u8>,
}

impl GuestLogStream {
    fn emit(&mut self) {
        if !self.line.is_empty() {
            let text = String::from_utf8_lossy(&self.line);
            debug!(target: TRACE_TARGET_GUEST, stream = "stderr", "{}", text.trim_end());
            self.line.clear();
        }
    }
}

#[async_trait::async_trait]
impl Pollable for GuestLogStream {
    async fn ready(&mut self) {}
}

impl OutputStream for GuestLogStream {
    fn write(&mut self, bytes: Bytes) -> StreamResult<()> {
        for chunk in bytes.split_inclusive(|b| *b == b'\n') {
            self.line.extend_from_slice(chunk);
            if chunk.ends_with(b"\n") || self.line.len() >= MAX_LOG_LINE {
                self.emit();
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> StreamResult<()> {
        self.emit();
        Ok(())
    }

    fn check_write(&mut self) -> StreamResult<usize> {
        Ok(MAX_LOG_LINE)
    }
}

impl Drop for GuestLogStream {
    fn drop(&mut self) {
        self.emit();
    }
}
