use std::borrow::Borrow;
use std::io::{BufRead, BufWriter, Error, ErrorKind, Result, Write};

use tracing::{debug, trace};

use crate::dump::DumpParser;
use crate::{
    CdbHeader, CdbInfo, CdbRecordHeader, CdbSlot, CdbTable, CdbWriter, PAIR_SIZE, TABLE_COUNT,
    hash,
};

/// Builder type for emitting cdb files from key-value streams.
///
/// Records are written to the output as they arrive; only a `(hash,
/// position)` pair per record is kept in memory until the hash tables are
/// laid out at the end. The header is written last, so the output must be a
/// [`CdbWriter`] that supports writing at arbitrary offsets.
///
/// Each builder instance is consumed by a single call to [`build`](Self::build)
/// or [`build_from_dump`](Self::build_from_dump). If either returns an error
/// the partially written output is not a valid database and must be discarded.
#[derive(Debug, Clone)]
pub struct CdbBuilder {
    writer_buffer_size: usize,
}

impl Default for CdbBuilder {
    fn default() -> Self {
        Self {
            writer_buffer_size: 16 << 20, // 16 MiB
        }
    }
}

impl CdbBuilder {
    /// Adjusts the capacity of the buffered writer used while streaming data.
    pub fn with_writer_buffer_size(mut self, size: usize) -> Self {
        self.writer_buffer_size = size;
        self
    }

    /// Consumes the builder and writes a cdb to `writer` from `entries`.
    ///
    /// Records keep their arrival order in the file. Duplicate keys are stored
    /// as independent records and are returned by lookups in that order.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying writer reports an IO failure, or
    /// `ErrorKind::InvalidInput` once the file would grow past 4 GiB.
    ///
    /// # Examples
    ///
    /// ```
    /// use constdb::CdbBuilder;
    /// use std::sync::Mutex;
    ///
    /// # fn main() -> std::io::Result<()> {
    /// let data = [("it", "1"), ("works", "2")];
    /// let buffer = Mutex::new(Vec::new());
    /// let info = CdbBuilder::default().build(&buffer, data.iter())?;
    /// assert_eq!(info.record_count, 2);
    /// # Ok(())
    /// # }
    /// ```
    pub fn build<W, K, V>(
        self,
        writer: &W,
        entries: impl IntoIterator<Item = impl Borrow<(K, V)>>,
    ) -> Result<CdbInfo>
    where
        W: CdbWriter + ?Sized,
        K: AsRef<[u8]>,
        V: AsRef<[u8]>,
    {
        let mut tables = TableBuilder::new(writer, self.writer_buffer_size);
        for entry in entries {
            let (key, value) = entry.borrow();
            tables.push(key.as_ref(), value.as_ref())?;
        }
        tables.finish()
    }

    /// Consumes the builder and writes a cdb from an interchange text stream.
    ///
    /// The input uses the `+klen,vlen:key->value` line format and must end
    /// with an empty line; see [`DumpParser`].
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`build`](Self::build), plus any parse
    /// error reported by [`DumpParser`].
    pub fn build_from_dump<W, B>(self, writer: &W, input: B) -> Result<CdbInfo>
    where
        W: CdbWriter + ?Sized,
        B: BufRead,
    {
        let mut tables = TableBuilder::new(writer, self.writer_buffer_size);
        for record in DumpParser::new(input) {
            let (key, value) = record?;
            tables.push(&key, &value)?;
        }
        tables.finish()
    }
}

/// Rejects positions that do not fit the 32-bit offsets of the format.
fn check_limit(end: u64) -> Result<()> {
    if end > u32::MAX as u64 {
        return Err(Error::new(
            ErrorKind::InvalidInput,
            "cdb database full: files are limited to 4 GiB",
        ));
    }
    Ok(())
}

fn checked_length(data: &[u8]) -> Result<u32> {
    u32::try_from(data.len()).map_err(|_| {
        Error::new(
            ErrorKind::InvalidInput,
            format!("cdb field of {} bytes exceeds 4 GiB", data.len()),
        )
    })
}

/// Incremental state of one build: the write cursor plus the hash entries of
/// every table in arrival order.
struct TableBuilder<'a, W: CdbWriter + ?Sized> {
    writer: &'a W,
    output: BufWriter<CdbWriterWrapper<'a, W>>,
    position: u64,
    tables: Vec<Vec<CdbSlot>>,
}

impl<'a, W: CdbWriter + ?Sized> TableBuilder<'a, W> {
    fn new(writer: &'a W, buffer_size: usize) -> Self {
        let position = CdbHeader::SIZE as u64;
        TableBuilder {
            writer,
            output: BufWriter::with_capacity(
                buffer_size,
                CdbWriterWrapper {
                    inner: writer,
                    offset: position,
                },
            ),
            position,
            tables: vec![Vec::new(); TABLE_COUNT],
        }
    }

    fn push(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let record = CdbRecordHeader {
            key_length: checked_length(key)?,
            value_length: checked_length(value)?,
        };
        let position = self.position;
        let end = position + record.record_length();
        check_limit(end)?;

        self.output.write_all(&record.serialize())?;
        self.output.write_all(key)?;
        self.output.write_all(value)?;

        let hash = hash(key);
        self.tables[hash as usize % TABLE_COUNT].push(CdbSlot {
            hash,
            position: position as u32,
        });
        self.position = end;
        trace!(position, hash, "wrote record");
        Ok(())
    }

    fn finish(mut self) -> Result<CdbInfo> {
        let mut header = CdbHeader::default();
        let tables = std::mem::take(&mut self.tables);
        for (index, entries) in tables.into_iter().enumerate() {
            let slot_count = entries.len() * 2;
            let end = self.position + slot_count as u64 * PAIR_SIZE;
            check_limit(end)?;

            let mut slots = vec![CdbSlot::default(); slot_count];
            for entry in entries {
                let mut slot = ((entry.hash as usize) / TABLE_COUNT) % slot_count;
                while !slots[slot].is_empty() {
                    slot += 1;
                    if slot == slot_count {
                        slot = 0;
                    }
                }
                slots[slot] = entry;
            }
            for slot in &slots {
                self.output.write_all(&slot.serialize())?;
            }

            header.tables[index] = CdbTable {
                position: self.position as u32,
                slots: slot_count as u32,
            };
            self.position = end;
        }
        self.output.flush()?;
        self.writer.write_all_at(&header.serialize(), 0)?;

        let info = CdbInfo::from_header(&header);
        debug!(
            records = info.record_count,
            file_length = info.file_length,
            occupied_tables = info.occupied_tables,
            "finished cdb build"
        );
        Ok(info)
    }
}

/// Thin wrapper implementing [`std::io::Write`] in terms of [`CdbWriter`].
///
/// Each write lands at the next consecutive offset, so a `BufWriter` on top
/// turns many small record writes into a few large positional writes.
struct CdbWriterWrapper<'a, W: CdbWriter + ?Sized> {
    inner: &'a W,
    offset: u64,
}

impl<W: CdbWriter + ?Sized> Write for CdbWriterWrapper<'_, W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.inner.write_all_at(buf, self.offset)?;
        self.offset += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::*;

    #[derive(Debug)]
    struct MemoryWriter {
        data: Mutex<Vec<u8>>,
        limit: u64,
        writes: AtomicUsize,
    }

    impl MemoryWriter {
        fn new(limit: u64) -> Self {
            Self {
                data: Mutex::new(Vec::new()),
                limit,
                writes: AtomicUsize::new(0),
            }
        }
    }

    impl CdbWriter for MemoryWriter {
        fn write_all_at(&self, data: &[u8], offset: u64) -> std::io::Result<()> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            if offset + data.len() as u64 > self.limit {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "Write exceeds limit",
                ));
            }
            self.data.write_all_at(data, offset)
        }
    }

    fn build_bytes<K: AsRef<[u8]>, V: AsRef<[u8]>>(entries: &[(K, V)]) -> Vec<u8> {
        let buffer = Mutex::new(Vec::new());
        CdbBuilder::default().build(&buffer, entries.iter()).unwrap();
        buffer.into_inner().unwrap()
    }

    fn pair(data: &[u8], offset: u64) -> (u32, u32) {
        let offset = offset as usize;
        decode_pair(&data[offset..offset + 8]).unwrap()
    }

    /// Checks the structural invariants of a built file.
    fn check_invariants(data: &[u8], record_count: u64) {
        let header = CdbHeader::deserialize(data).unwrap();
        let total: u64 = header.tables.iter().map(|t| t.slots as u64).sum();
        assert_eq!(total, 2 * record_count);

        for (index, table) in header.tables.iter().enumerate() {
            let mut occupied = 0;
            for slot in 0..table.slots as u64 {
                let (slot_hash, position) = pair(data, table.position as u64 + slot * 8);
                if position == 0 {
                    continue;
                }
                occupied += 1;
                assert_eq!(slot_hash as usize % TABLE_COUNT, index);
                let (key_length, _) = pair(data, position as u64);
                let key_start = position as usize + 8;
                let key = &data[key_start..key_start + key_length as usize];
                assert_eq!(hash(key), slot_hash);
            }
            assert_eq!(occupied * 2, table.slots);
        }
    }

    #[test]
    fn test_single_record_layout() {
        let data = build_bytes(&[("a", "1")]);
        assert_eq!(data.len(), 2048 + 10 + 16);

        // hash("a") = 177604 = 693 * 256 + 196
        let index = 196;
        for (i, table) in CdbHeader::deserialize(&data).unwrap().tables.iter().enumerate() {
            match i.cmp(&index) {
                std::cmp::Ordering::Less => assert_eq!((table.position, table.slots), (2058, 0)),
                std::cmp::Ordering::Equal => assert_eq!((table.position, table.slots), (2058, 2)),
                std::cmp::Ordering::Greater => {
                    assert_eq!((table.position, table.slots), (2074, 0))
                }
            }
        }

        assert_eq!(&data[2048..2058], &[1, 0, 0, 0, 1, 0, 0, 0, b'a', b'1']);
        // 693 % 2 == 1: the entry lands in the second slot.
        assert_eq!(pair(&data, 2058), (0, 0));
        assert_eq!(pair(&data, 2066), (177604, 2048));
    }

    #[test]
    fn test_zero_records() {
        let data = build_bytes::<&str, &str>(&[]);
        assert_eq!(data.len(), CdbHeader::SIZE);
        let header = CdbHeader::deserialize(&data).unwrap();
        for table in header.tables.iter() {
            assert_eq!(table.slots, 0);
            assert_eq!(table.position, 2048);
        }
    }

    /// Appends two bytes to `prefix` so the key hashes into `table` with its
    /// probe starting at `home` in a table of `slots` slots.
    ///
    /// The first byte shifts bits 8..13 of the hash through 33 consecutive
    /// values, which covers every residue of a power-of-two `slots` up to 32.
    /// The second byte only touches the low byte, which picks the table.
    fn crowded_key(prefix: &str, table: u8, home: u32, slots: u32) -> Vec<u8> {
        let mut key = prefix.as_bytes().to_vec();
        key.extend_from_slice(&[0, 0]);
        let last = key.len() - 1;
        for shift in 0..=255u8 {
            key[last - 1] = shift;
            key[last] = 0;
            let h = hash(&key);
            if (h >> 8) % slots == home {
                key[last] = h as u8 ^ table;
                return key;
            }
        }
        panic!("no key with prefix {prefix:?} starts at slot {home}");
    }

    #[test]
    fn test_invariants_with_collisions() {
        // Eight keys per table, all starting at the last of 16 slots, so seven
        // of them wrap around to the front of the table.
        let mut entries = Vec::new();
        for table in 0..4u8 {
            for i in 0..8 {
                let key = crowded_key(&format!("key-{table}-{i}"), table, 15, 16);
                assert_eq!(hash(&key) % 256, table as u32);
                entries.push((key, format!("value {table}-{i}").into_bytes()));
            }
        }
        let data = build_bytes(&entries);
        check_invariants(&data, entries.len() as u64);

        let header = CdbHeader::deserialize(&data).unwrap();
        let mut wrapped = 0;
        for (index, table) in header.tables.iter().enumerate() {
            if index >= 4 {
                assert_eq!(table.slots, 0);
                continue;
            }
            assert_eq!(table.slots, 16);
            for slot in 0..table.slots {
                let (slot_hash, position) = pair(&data, table.position as u64 + slot as u64 * 8);
                if position != 0 && slot < (slot_hash >> 8) % table.slots {
                    wrapped += 1;
                }
            }
        }
        assert_eq!(wrapped, 4 * 7);

        let cdb = Cdb::new(data);
        for (key, value) in &entries {
            assert_eq!(cdb.get(key).unwrap().as_ref(), Some(value));
        }
    }

    #[test]
    fn test_duplicates_and_empty_fields() {
        let entries = [("k", "1"), ("k", "2"), ("", ""), ("k", "")];
        let buffer = Mutex::new(Vec::new());
        let info = CdbBuilder::default().build(&buffer, entries.iter()).unwrap();
        assert_eq!(info.record_count, 4);
        let data = buffer.into_inner().unwrap();
        assert_eq!(info.file_length, data.len() as u64);
        check_invariants(&data, 4);
    }

    #[test]
    fn test_deterministic_and_dump_equivalent() {
        let entries: Vec<(String, String)> = (0..500)
            .map(|i| (format!("{}", i % 97), format!("v{i}")))
            .collect();
        let first = build_bytes(&entries);
        let second = build_bytes(&entries);
        assert_eq!(first, second);

        let mut text = Vec::new();
        for (k, v) in &entries {
            dump::write_record(&mut text, k.as_bytes(), v.as_bytes()).unwrap();
        }
        dump::write_end(&mut text).unwrap();

        let buffer = Mutex::new(Vec::new());
        let info = CdbBuilder::default()
            .with_writer_buffer_size(64)
            .build_from_dump(&buffer, text.as_slice())
            .unwrap();
        assert_eq!(info.record_count, 500);
        assert_eq!(buffer.into_inner().unwrap(), first);
    }

    #[test]
    fn test_malformed_dump() {
        let buffer = Mutex::new(Vec::new());
        let err = CdbBuilder::default()
            .build_from_dump(&buffer, &b"+1,1:a->1\n"[..])
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_shorter_write() {
        // 100 records of 13 bytes, 200 slots of 8 bytes and the header.
        const SUFFICIENT_CAPACITY: u64 = 2048 + 1300 + 1600;
        const INSUFFICIENT_CAPACITY: u64 = SUFFICIENT_CAPACITY - 1;

        let entries = || (0..100).map(|i| (format!("{i:04}"), "v"));

        let writer = MemoryWriter::new(SUFFICIENT_CAPACITY);
        let info = CdbBuilder::default()
            .with_writer_buffer_size(256)
            .build(&writer, entries())
            .unwrap();
        assert_eq!(info.file_length, SUFFICIENT_CAPACITY);
        check_invariants(&writer.data.lock().unwrap(), 100);

        let writer = MemoryWriter::new(INSUFFICIENT_CAPACITY);
        CdbBuilder::default()
            .with_writer_buffer_size(256)
            .build(&writer, entries())
            .unwrap_err();
        // The header is never written once the body fails.
        assert!(writer.data.lock().unwrap().iter().take(2048).all(|&b| b == 0));
        assert!(writer.writes.load(Ordering::Relaxed) > 1);
    }

    #[test]
    fn test_size_limit() {
        super::check_limit(u32::MAX as u64).unwrap();
        let err = super::check_limit(u32::MAX as u64 + 1).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidInput);
    }
}
