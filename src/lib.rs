//! Build-once, read-many constant databases in the cdb file format.
//!
//! A cdb file is a two-level static hash table: a 2048-byte header of 256
//! `(position, slots)` pairs, the records in write order, and 256
//! open-addressed hash tables. A successful lookup costs about two random
//! reads and a miss about one. Keys may map to several values, which come
//! back in write order. Files are never modified after construction, so any
//! number of readers can share one without locking.
//!
//! [`CdbBuilder`] turns a record stream (or its textual dump) into a file,
//! [`CdbStreamWriter`] accepts records one at a time while a background
//! thread builds, and [`Cdb`] answers lookups over any [`CdbReader`].
//!
//! ```
//! use constdb::{Cdb, CdbBuilder};
//! use std::sync::Mutex;
//!
//! # fn main() -> std::io::Result<()> {
//! let entries = [("one", "1"), ("two", "2"), ("two", "22")];
//! let buffer = Mutex::new(Vec::new());
//! CdbBuilder::default().build(&buffer, entries.iter())?;
//!
//! let cdb = Cdb::new(buffer.into_inner().unwrap());
//! assert_eq!(cdb.get(b"one")?, Some(b"1".to_vec()));
//! let twos = cdb.values(b"two").collect::<std::io::Result<Vec<_>>>()?;
//! assert_eq!(twos, vec![b"2".to_vec(), b"22".to_vec()]);
//! assert!(!cdb.exists(b"three")?);
//! # Ok(())
//! # }
//! ```
mod hasher;
pub use hasher::{CdbBuildHasher, CdbHasher, HASH_SEED, hash};

mod meta;
pub use meta::{
    CdbHeader, CdbInfo, CdbRecordHeader, CdbSlot, CdbTable, PAIR_SIZE, TABLE_COUNT, decode_pair,
};

mod reader;
pub use reader::CdbReader;

mod writer;
pub use writer::CdbWriter;

pub mod dump;
pub use dump::DumpParser;

mod cdb;
pub use cdb::{Cdb, CdbIter, CdbRecords, CdbSection, CdbValues};

mod builder;
pub use builder::CdbBuilder;

mod stream;
pub use stream::CdbStreamWriter;
