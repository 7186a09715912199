use std::io::Result;
use std::sync::{Arc, Mutex};

/// Trait representing positional writers suitable for cdb construction.
///
/// Records and hash tables are written front to back; the header is written
/// last at offset zero, so implementations must allow overwriting bytes that
/// were reserved earlier.
pub trait CdbWriter {
    /// Writes all of `data` at the given absolute `offset`.
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()>;
}

/// Growable in-memory sink. Gaps left by writes past the end are zero-filled.
impl CdbWriter for Mutex<Vec<u8>> {
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        let mut buffer = self
            .lock()
            .map_err(|_| std::io::Error::other("in-memory cdb buffer poisoned"))?;
        let start = offset as usize;
        let end = start + data.len();
        if buffer.len() < end {
            buffer.resize(end, 0);
        }
        buffer[start..end].copy_from_slice(data);
        Ok(())
    }
}

impl<T: CdbWriter + ?Sized> CdbWriter for &T {
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        (**self).write_all_at(data, offset)
    }
}

impl<T: CdbWriter + ?Sized> CdbWriter for Arc<T> {
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        (**self).write_all_at(data, offset)
    }
}

#[cfg(unix)]
impl CdbWriter for std::fs::File {
    fn write_all_at(&self, data: &[u8], offset: u64) -> Result<()> {
        std::os::unix::fs::FileExt::write_all_at(self, data, offset)
    }
}

#[cfg(windows)]
impl CdbWriter for std::fs::File {
    fn write_all_at(&self, mut data: &[u8], mut offset: u64) -> Result<()> {
        use std::os::windows::fs::FileExt;

        while !data.is_empty() {
            let n = self.seek_write(data, offset)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "failed to write whole buffer",
                ));
            }
            data = &data[n..];
            offset += n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_overwrite() {
        let sink = Mutex::new(Vec::new());
        sink.write_all_at(b"world", 6).unwrap();
        sink.write_all_at(b"hello ", 0).unwrap();
        sink.write_all_at(b"W", 6).unwrap();
        assert_eq!(sink.into_inner().unwrap(), b"hello World");
    }

    #[test]
    fn test_file_overwrite() {
        use crate::CdbReader;

        let file = tempfile::tempfile().unwrap();
        file.write_all_at(b"abcdef", 4).unwrap();
        file.write_all_at(b"0123", 0).unwrap();
        let got = file.read_exact_at(0, 10, |d| Ok(d.to_vec())).unwrap();
        assert_eq!(got, b"0123abcdef");
    }
}
