use std::io::{Error, ErrorKind, Result};
use std::sync::Arc;

/// Trait abstracting random read access to cdb files.
///
/// Implementations must support positional reads without mutating shared
/// state, so a single source can serve concurrent lookups.
pub trait CdbReader {
    /// Reads `length` bytes starting at `offset` and forwards them to `f`.
    ///
    /// Implementations must return an `ErrorKind::UnexpectedEof` error
    /// whenever the requested range cannot be satisfied in full.
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>;
}

fn out_of_range(offset: u64, length: u64, size: usize) -> Error {
    Error::new(
        ErrorKind::UnexpectedEof,
        format!(
            "read of {} bytes at offset {} exceeds source length {}",
            length, offset, size
        ),
    )
}

impl CdbReader for [u8] {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= self.len() as u64)
            .ok_or_else(|| out_of_range(offset, length, self.len()))?;
        f(&self[offset as usize..end as usize])
    }
}

impl CdbReader for Vec<u8> {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        self.as_slice().read_exact_at(offset, length, f)
    }
}

impl<T: CdbReader + ?Sized> CdbReader for &T {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        (**self).read_exact_at(offset, length, f)
    }
}

impl<T: CdbReader + ?Sized> CdbReader for Arc<T> {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        (**self).read_exact_at(offset, length, f)
    }
}

#[cfg(unix)]
impl CdbReader for std::fs::File {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        use std::os::unix::fs::FileExt;

        let mut buffer = vec![0u8; length as usize];
        FileExt::read_exact_at(self, &mut buffer, offset)?;
        f(&buffer)
    }
}

#[cfg(windows)]
impl CdbReader for std::fs::File {
    fn read_exact_at<F, R>(&self, offset: u64, length: u64, f: F) -> Result<R>
    where
        F: FnOnce(&[u8]) -> Result<R>,
    {
        use std::os::windows::fs::FileExt;

        let mut buffer = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buffer.len() {
            let n = self.seek_read(&mut buffer[filled..], offset + filled as u64)?;
            if n == 0 {
                return Err(Error::new(
                    ErrorKind::UnexpectedEof,
                    "Failed to read enough bytes",
                ));
            }
            filled += n;
        }
        f(&buffer)
    }
}
