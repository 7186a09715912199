use std::fs::File;
use std::io::{Error, ErrorKind, Read, Result, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::warn;

use crate::{
    CdbHeader, CdbInfo, CdbReader, CdbRecordHeader, CdbSlot, CdbTable, PAIR_SIZE, TABLE_COUNT,
    dump, hash,
};

/// Immutable multi-valued hash map backed by a cdb file.
///
/// A `Cdb` wraps any [`CdbReader`] (a file, an in-memory buffer, a shared
/// handle) and answers lookups with a handful of positional reads: one for
/// the header entry, one per probed slot and one per candidate record. No
/// state is cached between calls, so a `Cdb` can be shared freely between
/// threads as long as its reader can.
///
/// Not-found is reported as `Ok(None)` (or the end of an iterator); errors are
/// reserved for IO failures and truncated or corrupt files.
#[derive(Debug)]
pub struct Cdb<R: CdbReader> {
    reader: R,
}

impl Cdb<File> {
    /// Opens the database file at `path` for reading.
    ///
    /// The file handle is owned by the returned value and closed when it is
    /// dropped.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Cdb::new(File::open(path)?))
    }
}

impl<R: CdbReader> Cdb<R> {
    /// Wraps `reader`, which must hold a complete cdb file.
    pub fn new(reader: R) -> Self {
        Cdb { reader }
    }

    /// Returns a reference to the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Consumes the map and returns the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    /// Returns `true` if at least one value is stored under `key`.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        Ok(self.values(key).next_section()?.is_some())
    }

    /// Returns a copy of the first value stored under `key`.
    ///
    /// # Examples
    ///
    /// ```
    /// use constdb::{Cdb, CdbBuilder};
    /// use std::sync::Mutex;
    ///
    /// # fn main() -> std::io::Result<()> {
    /// let buffer = Mutex::new(Vec::new());
    /// CdbBuilder::default().build(&buffer, [("apple", "red"), ("apple", "green")])?;
    ///
    /// let cdb = Cdb::new(buffer.into_inner().unwrap());
    /// assert_eq!(cdb.get(b"apple")?, Some(b"red".to_vec()));
    /// assert_eq!(cdb.get(b"pear")?, None);
    /// # Ok(())
    /// # }
    /// ```
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.values(key).next_bytes()
    }

    /// Returns a view of the first value stored under `key` without copying it.
    pub fn get_section(&self, key: &[u8]) -> Result<Option<CdbSection<'_, R>>> {
        self.values(key).next_section()
    }

    /// Creates an iterator over every value stored under `key`, in the order
    /// the values were written.
    ///
    /// The iterator borrows `key` and performs no IO until it is advanced.
    pub fn values<'k>(&self, key: &'k [u8]) -> CdbValues<'_, 'k, R> {
        CdbValues {
            cdb: self,
            key,
            state: ProbeState::Pending,
        }
    }

    /// Creates an iterator over all records in file order.
    ///
    /// Records are yielded as [`CdbSection`] pairs pointing into the file, in
    /// exactly the order they were written, duplicates included. The scan
    /// covers the record region only and never touches the hash tables.
    pub fn records(&self) -> CdbRecords<'_, R> {
        CdbRecords {
            cdb: self,
            position: CdbHeader::SIZE as u64,
            end: None,
        }
    }

    /// Creates an iterator over all records in file order, copying each key
    /// and value.
    ///
    /// # Examples
    ///
    /// ```
    /// use constdb::{Cdb, CdbBuilder};
    /// use std::sync::Mutex;
    ///
    /// # fn main() -> std::io::Result<()> {
    /// let buffer = Mutex::new(Vec::new());
    /// CdbBuilder::default().build(&buffer, [("a", "1"), ("b", "2"), ("a", "3")])?;
    ///
    /// let cdb = Cdb::new(buffer.into_inner().unwrap());
    /// let all = cdb.iter().collect::<std::io::Result<Vec<_>>>()?;
    /// assert_eq!(all.len(), 3);
    /// assert_eq!(all[2], (b"a".to_vec(), b"3".to_vec()));
    /// # Ok(())
    /// # }
    /// ```
    pub fn iter(&self) -> CdbIter<'_, R> {
        CdbIter {
            records: self.records(),
        }
    }

    /// Calls `f` with a key and value view for every record in file order.
    ///
    /// Iteration stops at the first error returned by `f` or by the reader,
    /// and that error is returned.
    pub fn for_each_section<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(CdbSection<'_, R>, CdbSection<'_, R>) -> Result<()>,
    {
        for record in self.records() {
            let (key, value) = record?;
            f(key, value).inspect_err(|e| warn!("record traversal aborted: {}", e))?;
        }
        Ok(())
    }

    /// Calls `f` with the key and value bytes of every record in file order.
    ///
    /// The slices are only valid for the duration of each call.
    pub fn for_each_bytes<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        self.for_each_section(|key, value| {
            key.with_bytes(|key| value.with_bytes(|value| f(key, value)))
        })
    }

    /// Writes every record to `out` in the interchange text format, followed
    /// by the end marker.
    ///
    /// Feeding the output to [`CdbBuilder::build_from_dump`](crate::CdbBuilder::build_from_dump)
    /// reproduces this file byte for byte.
    pub fn dump<W: Write + ?Sized>(&self, out: &mut W) -> Result<()> {
        self.for_each_bytes(|key, value| dump::write_record(&mut *out, key, value))?;
        dump::write_end(out)
    }

    /// Reads the header and summarizes the table layout.
    pub fn info(&self) -> Result<CdbInfo> {
        let header = self
            .reader
            .read_exact_at(0, CdbHeader::SIZE as u64, CdbHeader::deserialize)?;
        Ok(CdbInfo::from_header(&header))
    }

    fn read_pair_at<T>(&self, offset: u64, decode: fn(&[u8]) -> Result<T>) -> Result<T> {
        self.reader.read_exact_at(offset, PAIR_SIZE, decode)
    }

    fn read_table(&self, index: usize) -> Result<CdbTable> {
        self.read_pair_at(CdbHeader::entry_offset(index), CdbTable::deserialize)
    }

    /// Returns the header of the record at `position` if its key is `key`.
    fn match_record(&self, position: u64, key: &[u8]) -> Result<Option<CdbRecordHeader>> {
        let record = self.read_pair_at(position, CdbRecordHeader::deserialize)?;
        if record.key_length as usize != key.len() {
            return Ok(None);
        }
        let matches = self
            .reader
            .read_exact_at(position + PAIR_SIZE, key.len() as u64, |stored| {
                Ok(stored == key)
            })?;
        Ok(matches.then_some(record))
    }
}

enum ProbeState {
    Pending,
    Scanning(Probe),
    Exhausted,
}

struct Probe {
    hash: u32,
    table_position: u64,
    table_slots: u32,
    slot: u32,
    visited: u32,
}

/// Iterator over the values stored under one key.
///
/// Created by [`Cdb::values`]. Each step walks the key's hash table from
/// where the previous step stopped, so values come back in write order.
/// Once every slot of the table has been visited, or an error has been
/// returned, the iterator is exhausted.
///
/// A single `CdbValues` must not be advanced from several threads at once;
/// create one per thread instead.
pub struct CdbValues<'a, 'k, R: CdbReader> {
    cdb: &'a Cdb<R>,
    key: &'k [u8],
    state: ProbeState,
}

impl<'a, R: CdbReader> CdbValues<'a, '_, R> {
    /// Advances to the next value and returns a view of it, or `None` once
    /// the key has no more values.
    pub fn next_section(&mut self) -> Result<Option<CdbSection<'a, R>>> {
        let result = self.advance();
        if !matches!(result, Ok(Some(_))) {
            self.state = ProbeState::Exhausted;
        }
        result
    }

    /// Advances to the next value and returns a copy of it.
    pub fn next_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        self.next_section()?.map(|section| section.to_vec()).transpose()
    }

    fn start(&self) -> Result<ProbeState> {
        let hash = hash(self.key);
        let table = self.cdb.read_table(hash as usize % TABLE_COUNT)?;
        if table.slots == 0 {
            return Ok(ProbeState::Exhausted);
        }
        Ok(ProbeState::Scanning(Probe {
            hash,
            table_position: table.position as u64,
            table_slots: table.slots,
            slot: (hash / TABLE_COUNT as u32) % table.slots,
            visited: 0,
        }))
    }

    fn advance(&mut self) -> Result<Option<CdbSection<'a, R>>> {
        if let ProbeState::Pending = self.state {
            self.state = self.start()?;
        }
        let cdb = self.cdb;
        let ProbeState::Scanning(probe) = &mut self.state else {
            return Ok(None);
        };

        while probe.visited < probe.table_slots {
            let offset = probe.table_position + probe.slot as u64 * PAIR_SIZE;
            let slot = cdb.read_pair_at(offset, CdbSlot::deserialize)?;
            probe.visited += 1;
            probe.slot += 1;
            if probe.slot == probe.table_slots {
                probe.slot = 0;
            }

            if slot.is_empty() || slot.hash != probe.hash {
                continue;
            }
            let position = slot.position as u64;
            let Some(record) = cdb.match_record(position, self.key)? else {
                continue;
            };
            return Ok(Some(CdbSection::new(
                &cdb.reader,
                position + PAIR_SIZE + record.key_length as u64,
                record.value_length as u64,
            )));
        }
        Ok(None)
    }
}

impl<R: CdbReader> Iterator for CdbValues<'_, '_, R> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_bytes().transpose()
    }
}

/// Iterator over all records of a [`Cdb`] as section pairs.
///
/// Created by [`Cdb::records`]. The end of the record region is taken from
/// the position of the first hash table, which immediately follows the last
/// record.
pub struct CdbRecords<'a, R: CdbReader> {
    cdb: &'a Cdb<R>,
    position: u64,
    end: Option<u64>,
}

impl<'a, R: CdbReader> CdbRecords<'a, R> {
    fn advance(&mut self) -> Result<Option<(CdbSection<'a, R>, CdbSection<'a, R>)>> {
        let cdb = self.cdb;
        let end = match self.end {
            Some(end) => end,
            None => {
                let end = cdb.read_table(0)?.position as u64;
                if end < CdbHeader::SIZE as u64 {
                    return Err(Error::new(
                        ErrorKind::InvalidData,
                        format!("record region ends at {end}, inside the header"),
                    ));
                }
                self.end = Some(end);
                end
            }
        };
        if self.position >= end {
            return Ok(None);
        }

        let record = cdb.read_pair_at(self.position, CdbRecordHeader::deserialize)?;
        let next = self.position + record.record_length();
        if next > end {
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!(
                    "record at offset {} overruns the record region ending at {}",
                    self.position, end
                ),
            ));
        }
        let key_offset = self.position + PAIR_SIZE;
        let value_offset = key_offset + record.key_length as u64;
        self.position = next;
        Ok(Some((
            CdbSection::new(&cdb.reader, key_offset, record.key_length as u64),
            CdbSection::new(&cdb.reader, value_offset, record.value_length as u64),
        )))
    }
}

impl<'a, R: CdbReader> Iterator for CdbRecords<'a, R> {
    type Item = Result<(CdbSection<'a, R>, CdbSection<'a, R>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let result = self.advance();
        if result.is_err() {
            // Stop after reporting the failure.
            self.end = Some(0);
        }
        result.transpose()
    }
}

/// Iterator over all records of a [`Cdb`] as owned byte vectors.
///
/// Created by [`Cdb::iter`].
pub struct CdbIter<'a, R: CdbReader> {
    records: CdbRecords<'a, R>,
}

impl<R: CdbReader> Iterator for CdbIter<'_, R> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let record = self.records.next()?;
        Some(record.and_then(|(key, value)| Ok((key.to_vec()?, value.to_vec()?))))
    }
}

/// A bounded view of `length` bytes at `offset` in a [`CdbReader`].
///
/// Implements [`Read`] and [`Seek`] relative to the start of the section, so
/// large values can be streamed without materializing them.
pub struct CdbSection<'a, R: CdbReader> {
    reader: &'a R,
    offset: u64,
    length: u64,
    cursor: u64,
}

impl<'a, R: CdbReader> CdbSection<'a, R> {
    fn new(reader: &'a R, offset: u64, length: u64) -> Self {
        CdbSection {
            reader,
            offset,
            length,
            cursor: 0,
        }
    }

    /// Absolute offset of the section in the file.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Passes the whole section to `f`, without copying when the reader
    /// supports it.
    pub fn with_bytes<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&[u8]) -> Result<T>,
    {
        self.reader.read_exact_at(self.offset, self.length, f)
    }

    /// Copies the whole section into a new vector.
    pub fn to_vec(&self) -> Result<Vec<u8>> {
        self.with_bytes(|data| Ok(data.to_vec()))
    }
}

impl<R: CdbReader> std::fmt::Debug for CdbSection<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdbSection")
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("cursor", &self.cursor)
            .finish()
    }
}

impl<R: CdbReader> Read for CdbSection<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let remaining = self.length.saturating_sub(self.cursor);
        let n = remaining.min(buf.len() as u64);
        if n == 0 {
            return Ok(0);
        }
        self.reader
            .read_exact_at(self.offset + self.cursor, n, |data| {
                buf[..data.len()].copy_from_slice(data);
                Ok(())
            })?;
        self.cursor += n;
        Ok(n as usize)
    }
}

impl<R: CdbReader> Seek for CdbSection<'_, R> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::End(n) => self.length.checked_add_signed(n),
            SeekFrom::Current(n) => self.cursor.checked_add_signed(n),
        };
        match target {
            Some(target) => {
                self.cursor = target;
                Ok(target)
            }
            None => Err(Error::new(
                ErrorKind::InvalidInput,
                "invalid seek to a negative or overflowing position",
            )),
        }
    }
}
