//! Append-only journal of store mutations.
//!
//! Each record has the following on-disk format (big-endian):
//!
//! ```text
//! +----------+----------+----------+----------+----------+
//! | magic    | kind     | reserved | length   | crc32c   |
//! | 4 bytes  | 1 byte   | 3 bytes  | 4 bytes  | 4 bytes  |
//! +----------+----------+----------+----------+----------+
//! | payload                                              |
//! | length bytes                                         |
//! +------------------------------------------------------+
//! ```
//!
//! A record cut short by a crash is dropped when the journal is opened. A
//! complete record whose checksum does not match is reported as corruption.

use crate::error::StorageError;
use crate::record::{ClientRecord, QueuedMessage};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use msgrelay_protocol::{ClientId, MessageType, CLIENT_ID_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub(crate) const JOURNAL_FILE: &str = "relay.log";

/// Magic bytes for journal records: "RJNL"
const JOURNAL_MAGIC: [u8; 4] = *b"RJNL";

const RECORD_HEADER_SIZE: usize = 16;

const KIND_REGISTER: u8 = 1;
const KIND_QUEUE: u8 = 2;
const KIND_DELETE: u8 = 3;

/// id + source + target + type
const QUEUE_PREFIX_SIZE: usize = 4 + 2 * CLIENT_ID_SIZE + 1;

/// One store mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum JournalEntry {
    RegisterClient(ClientRecord),
    QueueMessage(QueuedMessage),
    /// Messages removed together after one delivery.
    DeleteMessages(Vec<u32>),
}

impl JournalEntry {
    fn kind(&self) -> u8 {
        match self {
            JournalEntry::RegisterClient(_) => KIND_REGISTER,
            JournalEntry::QueueMessage(_) => KIND_QUEUE,
            JournalEntry::DeleteMessages(_) => KIND_DELETE,
        }
    }

    fn encode_payload(&self) -> Result<BytesMut, StorageError> {
        match self {
            JournalEntry::RegisterClient(record) => {
                Ok(BytesMut::from(&serde_json::to_vec(record)?[..]))
            }
            JournalEntry::QueueMessage(message) => {
                // Content is stored raw; it can be large.
                let mut buf = BytesMut::with_capacity(QUEUE_PREFIX_SIZE + message.content.len());
                buf.put_u32(message.id);
                buf.put_slice(message.source.as_bytes());
                buf.put_slice(message.target.as_bytes());
                buf.put_u8(message.message_type.0);
                buf.put_slice(&message.content);
                Ok(buf)
            }
            JournalEntry::DeleteMessages(ids) => {
                let mut buf = BytesMut::with_capacity(4 + 4 * ids.len());
                buf.put_u32(ids.len() as u32);
                for id in ids {
                    buf.put_u32(*id);
                }
                Ok(buf)
            }
        }
    }

    /// Encodes the entry as a complete record.
    pub(crate) fn encode(&self) -> Result<BytesMut, StorageError> {
        let payload = self.encode_payload()?;
        let length = u32::try_from(payload.len()).map_err(|_| {
            StorageError::InvalidRecord(format!("journal record of {} bytes", payload.len()))
        })?;

        let mut buf = BytesMut::with_capacity(RECORD_HEADER_SIZE + payload.len());
        buf.put_slice(&JOURNAL_MAGIC);
        buf.put_u8(self.kind());
        buf.put_slice(&[0u8; 3]);
        buf.put_u32(length);
        buf.put_u32(crc32c::crc32c(&payload));
        buf.put_slice(&payload);
        Ok(buf)
    }

    /// Decodes the record at the start of `buf`.
    ///
    /// Returns the entry and its size on disk, or `None` if `buf` ends before
    /// the record does.
    pub(crate) fn decode(buf: &[u8], offset: u64) -> Result<Option<(Self, usize)>, StorageError> {
        if buf.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        if buf[..4] != JOURNAL_MAGIC {
            return Err(corrupt(offset, "invalid record magic"));
        }

        let kind = buf[4];
        let mut header = &buf[8..RECORD_HEADER_SIZE];
        let length = header.get_u32() as usize;
        let crc_expected = header.get_u32();

        let total = RECORD_HEADER_SIZE + length;
        if buf.len() < total {
            return Ok(None);
        }

        let payload = &buf[RECORD_HEADER_SIZE..total];
        let crc_actual = crc32c::crc32c(payload);
        if crc_actual != crc_expected {
            return Err(corrupt(
                offset,
                &format!(
                    "checksum mismatch (expected {:08x}, got {:08x})",
                    crc_expected, crc_actual
                ),
            ));
        }

        let entry = Self::decode_payload(kind, payload).map_err(|reason| corrupt(offset, &reason))?;
        Ok(Some((entry, total)))
    }

    fn decode_payload(kind: u8, mut payload: &[u8]) -> Result<Self, String> {
        match kind {
            KIND_REGISTER => serde_json::from_slice(payload)
                .map(JournalEntry::RegisterClient)
                .map_err(|e| e.to_string()),
            KIND_QUEUE => {
                if payload.len() < QUEUE_PREFIX_SIZE {
                    return Err(format!("queue record of {} bytes", payload.len()));
                }
                let id = payload.get_u32();
                let source = take_client_id(&mut payload)?;
                let target = take_client_id(&mut payload)?;
                let message_type = MessageType(payload.get_u8());
                Ok(JournalEntry::QueueMessage(QueuedMessage {
                    id,
                    source,
                    target,
                    message_type,
                    content: Bytes::copy_from_slice(payload),
                }))
            }
            KIND_DELETE => {
                if payload.len() < 4 {
                    return Err("delete record without count".to_string());
                }
                let count = payload.get_u32() as usize;
                if payload.len() != count * 4 {
                    return Err(format!(
                        "delete record for {} ids holds {} bytes",
                        count,
                        payload.len()
                    ));
                }
                Ok(JournalEntry::DeleteMessages(
                    (0..count).map(|_| payload.get_u32()).collect(),
                ))
            }
            other => Err(format!("unknown record kind {}", other)),
        }
    }
}

fn take_client_id(payload: &mut &[u8]) -> Result<ClientId, String> {
    let id = ClientId::from_slice(&payload[..CLIENT_ID_SIZE]).map_err(|e| e.to_string())?;
    payload.advance(CLIENT_ID_SIZE);
    Ok(id)
}

fn corrupt(offset: u64, reason: &str) -> StorageError {
    StorageError::Corruption(format!("journal record at offset {}: {}", offset, reason))
}

/// The open journal file.
pub(crate) struct Journal {
    file: File,
    path: PathBuf,
    size: u64,
}

impl Journal {
    /// Opens or creates the journal in `dir` and returns it with the entries
    /// it holds, oldest first.
    pub(crate) fn open(dir: &Path) -> Result<(Self, Vec<JournalEntry>), StorageError> {
        let path = dir.join(JOURNAL_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let mut entries = Vec::new();
        let mut offset = 0usize;
        while offset < data.len() {
            match JournalEntry::decode(&data[offset..], offset as u64)? {
                Some((entry, size)) => {
                    entries.push(entry);
                    offset += size;
                }
                None => break,
            }
        }

        if offset < data.len() {
            tracing::warn!(
                "Dropping {} bytes of incomplete record at the end of {}",
                data.len() - offset,
                path.display()
            );
            file.set_len(offset as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(offset as u64))?;

        Ok((
            Self {
                file,
                path,
                size: offset as u64,
            },
            entries,
        ))
    }

    /// Appends one record and syncs it to disk.
    ///
    /// On failure the file is cut back to its previous length, so the entry
    /// is either fully recorded or absent.
    pub(crate) fn append(&mut self, entry: &JournalEntry) -> Result<(), StorageError> {
        let encoded = entry.encode()?;

        let written = self
            .file
            .write_all(&encoded)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = written {
            let size = self.size;
            let trimmed = self
                .file
                .set_len(size)
                .and_then(|_| self.file.seek(SeekFrom::Start(size)).map(|_| ()));
            if let Err(trim) = trimmed {
                tracing::error!(
                    "Cannot trim {} after a failed append: {}",
                    self.path.display(),
                    trim
                );
            }
            return Err(e.into());
        }

        self.size += encoded.len() as u64;
        Ok(())
    }

    /// Empties the journal once its entries are in a snapshot.
    pub(crate) fn reset(&mut self) -> Result<(), StorageError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.sync_all()?;
        self.size = 0;
        Ok(())
    }

    /// Current file size in bytes.
    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}
