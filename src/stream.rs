use std::io::{BufReader, Error, ErrorKind, Read, Result};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::{CdbBuilder, CdbInfo, CdbWriter, dump};

/// Incremental writer that builds a cdb one record at a time.
///
/// Table construction needs the whole record stream before it can size the
/// hash tables, so the [`CdbBuilder`] runs on a background thread and reads
/// the interchange text format from a rendezvous channel. Every
/// [`write`](Self::write) hands one encoded record to that thread and blocks
/// until the thread has taken it.
///
/// The first failure of the background build is kept: it is returned from
/// the next `write` or from [`close`](Self::close), and again from every call
/// after that without touching the output. A failed or unclosed output is
/// not a valid database and must be discarded.
///
/// # Examples
///
/// ```
/// use constdb::{Cdb, CdbStreamWriter};
/// use std::sync::{Arc, Mutex};
///
/// # fn main() -> std::io::Result<()> {
/// let buffer = Arc::new(Mutex::new(Vec::new()));
/// let mut writer = CdbStreamWriter::new(buffer.clone())?;
/// writer.write(b"key", b"first")?;
/// writer.write(b"key", b"second")?;
/// writer.close()?;
///
/// let cdb = Cdb::new(buffer.lock().unwrap().clone());
/// let values = cdb.values(b"key").collect::<std::io::Result<Vec<_>>>()?;
/// assert_eq!(values, vec![b"first".to_vec(), b"second".to_vec()]);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CdbStreamWriter {
    sender: Option<SyncSender<Vec<u8>>>,
    handle: Option<JoinHandle<Result<CdbInfo>>>,
    failure: Option<Failure>,
}

#[derive(Debug, Clone)]
struct Failure {
    kind: ErrorKind,
    message: String,
}

impl Failure {
    fn to_error(&self) -> Error {
        Error::new(self.kind, self.message.clone())
    }
}

impl CdbStreamWriter {
    /// Starts a background build into `writer` with default settings.
    pub fn new<W>(writer: W) -> Result<Self>
    where
        W: CdbWriter + Send + 'static,
    {
        Self::with_builder(CdbBuilder::default(), writer)
    }

    /// Starts a background build into `writer` using `builder`.
    ///
    /// # Errors
    ///
    /// Returns an error if the background thread cannot be spawned.
    pub fn with_builder<W>(builder: CdbBuilder, writer: W) -> Result<Self>
    where
        W: CdbWriter + Send + 'static,
    {
        let (sender, receiver) = sync_channel(0);
        let handle = std::thread::Builder::new()
            .name("cdb-builder".to_string())
            .spawn(move || {
                let input = BufReader::new(ChannelReader::new(receiver));
                builder.build_from_dump(&writer, input)
            })?;
        debug!("started background cdb build");
        Ok(CdbStreamWriter {
            sender: Some(sender),
            handle: Some(handle),
            failure: None,
        })
    }

    /// Appends one record.
    ///
    /// Blocks until the background builder has accepted the previous record.
    ///
    /// # Errors
    ///
    /// Returns the background build's error if it has failed.
    pub fn write(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.check()?;
        self.send(dump::encode_record(key, value))
    }

    /// Ends the record stream and waits for the database to be finalized.
    ///
    /// # Errors
    ///
    /// Returns the background build's error, if any.
    pub fn close(mut self) -> Result<CdbInfo> {
        self.check()?;
        let mut marker = Vec::new();
        dump::write_end(&mut marker)?;
        self.send(marker)?;
        match self.join() {
            Ok(info) => {
                debug!(records = info.record_count, "closed cdb stream writer");
                Ok(info)
            }
            Err(e) => Err(self.record_failure(e)),
        }
    }

    fn check(&mut self) -> Result<()> {
        if let Some(failure) = &self.failure {
            return Err(failure.to_error());
        }
        if self.handle.as_ref().is_some_and(|h| h.is_finished()) {
            return Err(self.fail_from_builder());
        }
        Ok(())
    }

    fn send(&mut self, data: Vec<u8>) -> Result<()> {
        let sent = match &self.sender {
            Some(sender) => sender.send(data).is_ok(),
            None => false,
        };
        if sent {
            return Ok(());
        }
        // The builder stopped receiving, which only happens once it has failed.
        Err(self.fail_from_builder())
    }

    /// Disconnects the channel and collects the builder's result.
    fn join(&mut self) -> Result<CdbInfo> {
        self.sender.take();
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(Error::other("cdb builder thread panicked"))),
            None => Err(Error::other("cdb builder is no longer running")),
        }
    }

    fn fail_from_builder(&mut self) -> Error {
        let error = match self.join() {
            Ok(_) => Error::new(
                ErrorKind::BrokenPipe,
                "cdb builder finished before the stream was closed",
            ),
            Err(e) => e,
        };
        self.record_failure(error)
    }

    fn record_failure(&mut self, error: Error) -> Error {
        warn!("cdb stream writer failed: {}", error);
        let failure = Failure {
            kind: error.kind(),
            message: error.to_string(),
        };
        self.failure = Some(failure);
        error
    }
}

impl Drop for CdbStreamWriter {
    fn drop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        // Without the end marker the builder fails on end of input.
        if let Err(e) = self.join() {
            warn!("discarded unclosed cdb stream writer: {}", e);
        }
    }
}

/// Adapts the receiving end of the record channel to [`Read`].
///
/// A disconnected channel reads as end of input.
struct ChannelReader {
    receiver: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    position: usize,
}

impl ChannelReader {
    fn new(receiver: Receiver<Vec<u8>>) -> Self {
        ChannelReader {
            receiver,
            chunk: Vec::new(),
            position: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        while self.position == self.chunk.len() {
            match self.receiver.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.position = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.position);
        buf[..n].copy_from_slice(&self.chunk[self.position..self.position + n]);
        self.position += n;
        Ok(n)
    }
}
