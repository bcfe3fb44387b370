#![forbid(unsafe_code)]
//! Byte-device abstraction for peekfs.
//!
//! The core never seeks: all I/O goes through a positional `read_at`
//! interface, so a single device can back any number of concurrent
//! readers without shared cursor state.

use pfs_error::{PfsError, Result};
use pfs_types::{ByteOffset, SECTOR_SIZE, u64_to_usize};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use tracing::trace;

/// Random-access byte source of known length (pread semantics).
///
/// Implementations must be position-stateless: `read_at` on a shared
/// reference must not disturb any other in-flight read.
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`, returning the count read.
    ///
    /// A return of 0 with a non-empty `buf` means end of device.
    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize>;

    /// Read exactly `buf.len()` bytes at `offset`.
    ///
    /// Short reads from the underlying source are retried until the buffer
    /// is full; this is the only retried action in the core. Hitting end
    /// of device first fails with an `UnexpectedEof` I/O error.
    fn read_exact_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0_usize;
        while filled < buf.len() {
            let pos = offset
                .checked_add(filled as u64)
                .ok_or_else(|| offset_overflow("read_exact_at"))?;
            let n = self.read_at(pos, &mut buf[filled..])?;
            if n == 0 {
                return Err(PfsError::io(
                    "read_exact_at",
                    io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!(
                            "device ended at {} while reading {} bytes at {offset}",
                            pos,
                            buf.len()
                        ),
                    ),
                ));
            }
            filled += n;
        }
        Ok(())
    }
}

fn offset_overflow(op: &'static str) -> PfsError {
    PfsError::io(
        op,
        io::Error::new(io::ErrorKind::InvalidInput, "byte offset overflows u64"),
    )
}

impl<D: ByteDevice + ?Sized> ByteDevice for &D {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }
}

impl<D: ByteDevice + ?Sized> ByteDevice for Arc<D> {
    fn len_bytes(&self) -> u64 {
        (**self).len_bytes()
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        (**self).read_at(offset, buf)
    }
}

/// Read `len` bytes at `offset` through whole 512-byte sectors.
///
/// The read is widened to `[align_down(offset), align_up(offset + len))`
/// and the requested range sliced back out, so the underlying source only
/// ever sees sector-aligned fragments.
pub fn read_sector_aligned(dev: &dyn ByteDevice, offset: ByteOffset, len: usize) -> Result<Vec<u8>> {
    let start = offset
        .align_down(SECTOR_SIZE)
        .ok_or_else(|| offset_overflow("read_sector_aligned"))?;
    let end = offset
        .checked_add(len as u64)
        .and_then(|e| e.align_up(SECTOR_SIZE))
        .ok_or_else(|| offset_overflow("read_sector_aligned"))?;

    let span = u64_to_usize(end.0 - start.0, "sector_span")
        .map_err(|_| offset_overflow("read_sector_aligned"))?;
    let intra = u64_to_usize(offset.0 - start.0, "sector_intra")
        .map_err(|_| offset_overflow("read_sector_aligned"))?;

    trace!(
        target: "pfs::block",
        event = "read_sector_aligned",
        offset = offset.0,
        len,
        span_start = start.0,
        span_len = span,
    );

    let mut buf = vec![0_u8; span];
    dev.read_exact_at(start, &mut buf)?;
    buf.drain(..intra);
    buf.truncate(len);
    Ok(buf)
}

/// File-backed device using `pread` (no shared seek position).
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref()).map_err(|e| PfsError::io("open", e))?;
        let len = file
            .metadata()
            .map_err(|e| PfsError::io("metadata", e))?
            .len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }

    /// Wrap an already-open file, trusting its current metadata length.
    pub fn from_file(file: File) -> Result<Self> {
        let len = file
            .metadata()
            .map_err(|e| PfsError::io("metadata", e))?
            .len();
        Ok(Self {
            file: Arc::new(file),
            len,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        self.file
            .read_at(buf, offset.0)
            .map_err(|e| PfsError::io("read_at", e))
    }
}

/// Whole-image-in-memory device. The workhorse for tests and small images.
#[derive(Debug, Clone)]
pub struct MemoryByteDevice {
    bytes: Arc<Vec<u8>>,
}

impl MemoryByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }
}

impl ByteDevice for MemoryByteDevice {
    fn len_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read_at(&self, offset: ByteOffset, buf: &mut [u8]) -> Result<usize> {
        let Ok(start) = offset.to_usize() else {
            return Ok(0);
        };
        if start >= self.bytes.len() {
            return Ok(0);
        }
        let available = &self.bytes[start..];
        let n = buf.len().min(available.len());
        buf[..n].copy_from_slice(&available[..n]);
        Ok(n)
    }
}
