//! Append-only decision log
//!
//! Makes transaction outcomes durable so a restarted node can tell which
//! transactions reached a decision. Entries are never rewritten or reordered.
//! Entry format: [MAGIC][SEQUENCE][TX_ID][BODY_LEN][BODY][CRC32]
//!
//! The body is a bincode-encoded record chosen by the owner of the log
//! (participants and the coordinator log different record types).

use crate::common::types::TxId;
use crate::common::utils::lock;
use crate::common::{crc32, Error, LogSyncPolicy, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const LOG_MAGIC: [u8; 4] = [0x44, 0x4C, 0x47, 0x31]; // "DLG1"

/// Upper bound on one record body, guards against garbage lengths
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// One durable log entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry<T> {
    pub sequence: u64,
    pub tx_id: TxId,
    pub record: T,
}

struct LogWriter {
    writer: BufWriter<File>,
    next_sequence: u64,
    /// Set after a failed append; the log refuses further writes
    failed: bool,
}

pub struct DecisionLog<T> {
    path: PathBuf,
    inner: Mutex<LogWriter>,
    sync_policy: LogSyncPolicy,
    _record: PhantomData<fn() -> T>,
}

impl<T> DecisionLog<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Open or create a log file.
    ///
    /// A torn or corrupt tail left by a crash is cut off so that new entries
    /// follow the last valid one.
    pub fn open(path: impl AsRef<Path>, sync_policy: LogSyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let (next_sequence, valid_len) = Self::scan(&path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        if file.metadata()?.len() > valid_len {
            tracing::warn!(
                "Truncating decision log {} to {} bytes after corrupted tail",
                path.display(),
                valid_len
            );
            file.set_len(valid_len)?;
        }

        Ok(Self {
            path,
            inner: Mutex::new(LogWriter {
                writer: BufWriter::new(file),
                next_sequence,
                failed: false,
            }),
            sync_policy,
            _record: PhantomData,
        })
    }

    /// Next sequence number and length of the valid prefix.
    fn scan(path: &Path) -> Result<(u64, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut next_sequence = 0;
        let mut valid_len = 0u64;

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((entry, len))) => {
                    next_sequence = next_sequence.max(entry.sequence + 1);
                    valid_len += len;
                }
                Ok(None) => break,
                Err(_) => break,
            }
        }

        Ok((next_sequence, valid_len))
    }

    /// Append a record and make it durable according to the sync policy.
    /// Returns the sequence number assigned to the entry.
    ///
    /// Any failure is reported as [`Error::LogFailure`] and permanently
    /// disables the log.
    pub fn write(&self, tx_id: TxId, record: &T) -> Result<u64> {
        let body = bincode::serialize(record)?;
        if body.len() > MAX_BODY_LEN {
            return Err(Error::LogFailure(format!(
                "record of {} bytes exceeds limit",
                body.len()
            )));
        }

        let mut inner = lock(&self.inner);
        if inner.failed {
            return Err(Error::LogFailure("log disabled by an earlier failure".into()));
        }

        let sequence = inner.next_sequence;
        match Self::append(&mut inner.writer, sequence, tx_id, &body, self.sync_policy) {
            Ok(()) => {
                inner.next_sequence += 1;
                Ok(sequence)
            }
            Err(e) => {
                inner.failed = true;
                tracing::error!("Decision log {} write failed: {}", self.path.display(), e);
                Err(Error::LogFailure(e.to_string()))
            }
        }
    }

    fn append(
        writer: &mut BufWriter<File>,
        sequence: u64,
        tx_id: TxId,
        body: &[u8],
        sync_policy: LogSyncPolicy,
    ) -> std::io::Result<()> {
        let header = Self::checksum_input(sequence, tx_id, body.len() as u32);

        writer.write_all(&LOG_MAGIC)?;
        writer.write_all(&header)?;
        writer.write_all(body)?;

        let mut checksum_data = header.to_vec();
        checksum_data.extend_from_slice(body);
        writer.write_all(&crc32(&checksum_data).to_le_bytes())?;

        match sync_policy {
            LogSyncPolicy::Always => {
                writer.flush()?;
                writer.get_ref().sync_data()?;
            }
            LogSyncPolicy::Flush => writer.flush()?,
            LogSyncPolicy::Never => {}
        }
        Ok(())
    }

    fn checksum_input(sequence: u64, tx_id: TxId, body_len: u32) -> [u8; 20] {
        let mut header = [0u8; 20];
        header[0..8].copy_from_slice(&sequence.to_le_bytes());
        header[8..16].copy_from_slice(&tx_id.to_le_bytes());
        header[16..20].copy_from_slice(&body_len.to_le_bytes());
        header
    }

    /// Every entry in append order.
    ///
    /// Reading stops at the first corrupt entry, which can only be a torn
    /// tail written after the last successful append.
    pub fn read_all(&self) -> Result<Vec<LogEntry<T>>> {
        {
            let mut inner = lock(&self.inner);
            if !inner.failed {
                inner.writer.flush()?;
            }
        }

        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();

        loop {
            match Self::read_entry(&mut reader) {
                Ok(Some((entry, _))) => entries.push(entry),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("Decision log replay stopped at corrupted entry: {}", e);
                    break;
                }
            }
        }

        Ok(entries)
    }

    /// Read a single entry and its encoded length.
    fn read_entry<R: Read>(reader: &mut R) -> Result<Option<(LogEntry<T>, u64)>> {
        let mut magic = [0u8; 4];
        match reader.read_exact(&mut magic) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        if magic != LOG_MAGIC {
            return Err(Error::Corrupted("invalid log magic".into()));
        }

        let mut header = [0u8; 20];
        reader.read_exact(&mut header)?;
        let sequence = le_u64(&header[0..8]);
        let tx_id = le_u64(&header[8..16]);
        let body_len = le_u32(&header[16..20]) as usize;

        if body_len > MAX_BODY_LEN {
            return Err(Error::Corrupted(format!("body length {}", body_len)));
        }

        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);

        let mut checksum_data = header.to_vec();
        checksum_data.extend_from_slice(&body);
        let computed = crc32(&checksum_data);
        if computed != stored {
            return Err(Error::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let record = bincode::deserialize(&body)?;
        let len = (LOG_MAGIC.len() + header.len() + body_len + checksum_bytes.len()) as u64;

        Ok(Some((
            LogEntry {
                sequence,
                tx_id,
                record,
            },
            len,
        )))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn next_sequence(&self) -> u64 {
        lock(&self.inner).next_sequence
    }
}

fn le_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}
