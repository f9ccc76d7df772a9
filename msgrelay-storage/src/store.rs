//! Client registry and message queue storage.
//!
//! A persistent store keeps two files in its directory:
//!
//! - `relay.log`: an append-only journal with one record per mutation, synced
//!   before the mutation becomes visible.
//! - `relay.json`: a snapshot of the whole state, written when the journal
//!   grows past the compaction threshold and on open. Its first line is the
//!   crc32c of the JSON body as 8 hex digits.
//!
//! Opening replays the journal on top of the snapshot. Replay is idempotent,
//! so a crash between writing a snapshot and emptying the journal is harmless.

use crate::error::StorageError;
use crate::journal::{Journal, JournalEntry};
use crate::record::{ClientRecord, NewMessage, QueuedMessage};
use msgrelay_protocol::{ClientId, PublicKey};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "relay.json";

/// Journal size that triggers a snapshot (64 MiB).
pub const DEFAULT_COMPACT_THRESHOLD: u64 = 64 * 1024 * 1024;

/// Persistence interface used by the request handlers.
///
/// Implementations must be safe to call from many connection tasks at once.
/// Every mutation is atomic with respect to every other call.
pub trait RelayStore: Send + Sync {
    /// Returns whether a client with this name is registered.
    fn client_name_exists(&self, name: &str) -> Result<bool, StorageError>;

    /// Returns whether a client with this id is registered.
    fn client_id_exists(&self, id: &ClientId) -> Result<bool, StorageError>;

    /// Inserts a new client. Fails if the name or id is already taken.
    fn insert_client(&self, record: ClientRecord) -> Result<(), StorageError>;

    fn public_key(&self, id: &ClientId) -> Result<Option<PublicKey>, StorageError>;

    /// Lists `(id, name)` for every client in registration order.
    fn list_clients(&self) -> Result<Vec<(ClientId, String)>, StorageError>;

    /// Queues a message and returns its newly assigned id.
    fn insert_message(&self, message: NewMessage) -> Result<u32, StorageError>;

    /// Lists the messages queued for `target`, oldest first.
    fn pending_for(&self, target: &ClientId) -> Result<Vec<QueuedMessage>, StorageError>;

    /// Removes a batch of messages in one step: either all of them that are
    /// queued are removed, or none are. Ids that are not queued are skipped.
    /// Returns how many were removed.
    fn delete_messages(&self, ids: &[u32]) -> Result<usize, StorageError>;

    fn stats(&self) -> StoreStats;
}

/// Row counts, for logs and metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub clients: usize,
    pub queued_messages: usize,
}

/// Serialized form of the whole store.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedState {
    next_message_id: u32,
    clients: Vec<ClientRecord>,
    messages: Vec<QueuedMessage>,
}

#[derive(Debug)]
struct State {
    /// Clients in registration order.
    clients: Vec<ClientRecord>,
    by_id: HashMap<ClientId, usize>,
    names: HashSet<String>,
    /// Queued messages keyed by id; id order is arrival order.
    messages: BTreeMap<u32, QueuedMessage>,
    next_message_id: u32,
}

impl Default for State {
    fn default() -> Self {
        Self {
            clients: Vec::new(),
            by_id: HashMap::new(),
            names: HashSet::new(),
            messages: BTreeMap::new(),
            next_message_id: 1,
        }
    }
}

impl State {
    fn from_persisted(persisted: PersistedState) -> Result<Self, StorageError> {
        let mut state = State::default();
        for record in persisted.clients {
            state.add_client(record)?;
        }
        for message in persisted.messages {
            state.messages.insert(message.id, message);
        }

        let after_last = state
            .messages
            .keys()
            .next_back()
            .map(|id| id.saturating_add(1))
            .unwrap_or(1);
        state.next_message_id = persisted.next_message_id.max(after_last).max(1);
        Ok(state)
    }

    fn to_persisted(&self) -> PersistedState {
        PersistedState {
            next_message_id: self.next_message_id,
            clients: self.clients.clone(),
            messages: self.messages.values().cloned().collect(),
        }
    }

    fn check_new_client(&self, record: &ClientRecord) -> Result<(), StorageError> {
        record.validate()?;
        if self.names.contains(&record.name) {
            return Err(StorageError::NameTaken(record.name.clone()));
        }
        if self.by_id.contains_key(&record.id) {
            return Err(StorageError::DuplicateClient(record.id));
        }
        Ok(())
    }

    fn add_client(&mut self, record: ClientRecord) -> Result<(), StorageError> {
        self.check_new_client(&record)?;
        self.names.insert(record.name.clone());
        self.by_id.insert(record.id, self.clients.len());
        self.clients.push(record);
        Ok(())
    }

    /// Replays one journal entry. Entries already reflected in the state are
    /// no-ops.
    fn apply(&mut self, entry: JournalEntry) -> Result<(), StorageError> {
        match entry {
            JournalEntry::RegisterClient(record) => {
                if !self.by_id.contains_key(&record.id) {
                    self.add_client(record)?;
                }
            }
            JournalEntry::QueueMessage(message) => {
                self.next_message_id = self
                    .next_message_id
                    .max(message.id.saturating_add(1));
                self.messages.insert(message.id, message);
            }
            JournalEntry::DeleteMessages(ids) => {
                for id in ids {
                    self.messages.remove(&id);
                }
            }
        }
        Ok(())
    }
}

/// On-disk side of a persistent store.
struct Disk {
    dir: PathBuf,
    journal: Journal,
    compact_threshold: u64,
}

impl Disk {
    /// Folds the journal into a fresh snapshot.
    fn compact(&mut self, state: &State) -> Result<(), StorageError> {
        write_snapshot(&self.dir, state)?;
        self.journal.reset()
    }
}

/// In-memory store with optional journaled persistence.
pub struct Storage {
    state: RwLock<State>,
    /// Only locked while the state write lock is held.
    disk: Option<Mutex<Disk>>,
}

impl Storage {
    /// Creates a store that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(State::default()),
            disk: None,
        }
    }

    /// Opens or creates a persistent store in `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut state = match load_snapshot(&dir.join(STATE_FILE))? {
            Some(persisted) => State::from_persisted(persisted)?,
            None => State::default(),
        };

        let (journal, entries) = Journal::open(&dir)?;
        let replayed = entries.len();
        for entry in entries {
            state.apply(entry)?;
        }

        let mut disk = Disk {
            dir,
            journal,
            compact_threshold: DEFAULT_COMPACT_THRESHOLD,
        };
        if replayed > 0 {
            disk.compact(&state)?;
        }

        tracing::info!(
            "Storage opened at {}: {} clients, {} queued messages ({} journal entries replayed)",
            disk.dir.display(),
            state.clients.len(),
            state.messages.len(),
            replayed
        );

        Ok(Self {
            state: RwLock::new(state),
            disk: Some(Mutex::new(disk)),
        })
    }

    /// Sets the journal size in bytes at which a snapshot is written.
    pub fn with_compact_threshold(mut self, bytes: u64) -> Self {
        if let Some(disk) = self.disk.as_mut() {
            disk.get_mut().compact_threshold = bytes;
        }
        self
    }

    /// Returns whether mutations are written to disk.
    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    /// Records a mutation before it is applied. Must be called with the
    /// state write lock held.
    fn record(&self, entry: &JournalEntry) -> Result<(), StorageError> {
        match &self.disk {
            Some(disk) => disk.lock().journal.append(entry),
            None => Ok(()),
        }
    }

    /// Writes a snapshot once the journal is large enough. The mutation is
    /// already durable, so a failure here is only logged.
    fn maybe_compact(&self, state: &State) {
        let Some(disk) = &self.disk else {
            return;
        };
        let mut disk = disk.lock();
        if disk.journal.size() < disk.compact_threshold {
            return;
        }

        let journal_size = disk.journal.size();
        match disk.compact(state) {
            Ok(()) => tracing::debug!("Compacted {} byte journal into snapshot", journal_size),
            Err(e) => tracing::error!("Snapshot failed, journal kept: {}", e),
        }
    }
}

fn load_snapshot(path: &Path) -> Result<Option<PersistedState>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }

    let data = fs::read(path)?;
    let newline = data
        .iter()
        .position(|b| *b == b'\n')
        .ok_or_else(|| StorageError::Corruption("missing checksum line".to_string()))?;
    let expected = std::str::from_utf8(&data[..newline])
        .map_err(|_| StorageError::Corruption("unreadable checksum line".to_string()))?
        .trim()
        .to_string();
    let body = &data[newline + 1..];

    let actual = format!("{:08x}", crc32c::crc32c(body));
    if actual != expected {
        return Err(StorageError::Corruption(format!(
            "{} checksum mismatch: expected {}, got {}",
            path.display(),
            expected,
            actual
        )));
    }

    Ok(Some(serde_json::from_slice(body)?))
}

/// Writes the snapshot through a temporary file renamed into place, so a
/// crash leaves either the old or the new snapshot.
fn write_snapshot(dir: &Path, state: &State) -> Result<(), StorageError> {
    let body = serde_json::to_vec(&state.to_persisted())?;
    let checksum = format!("{:08x}\n", crc32c::crc32c(&body));

    let path = dir.join(STATE_FILE);
    let tmp_path = dir.join(format!("{}.tmp", STATE_FILE));
    {
        let mut file = File::create(&tmp_path)?;
        file.write_all(checksum.as_bytes())?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    fs::rename(&tmp_path, &path)?;
    Ok(())
}

impl RelayStore for Storage {
    fn client_name_exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.state.read().names.contains(name))
    }

    fn client_id_exists(&self, id: &ClientId) -> Result<bool, StorageError> {
        Ok(self.state.read().by_id.contains_key(id))
    }

    fn insert_client(&self, record: ClientRecord) -> Result<(), StorageError> {
        let mut state = self.state.write();
        state.check_new_client(&record)?;
        self.record(&JournalEntry::RegisterClient(record.clone()))?;

        let id = record.id;
        state.add_client(record)?;
        self.maybe_compact(&state);

        tracing::debug!("Stored client {}", id);
        Ok(())
    }

    fn public_key(&self, id: &ClientId) -> Result<Option<PublicKey>, StorageError> {
        let state = self.state.read();
        Ok(state
            .by_id
            .get(id)
            .map(|idx| state.clients[*idx].public_key.clone()))
    }

    fn list_clients(&self) -> Result<Vec<(ClientId, String)>, StorageError> {
        Ok(self
            .state
            .read()
            .clients
            .iter()
            .map(|c| (c.id, c.name.clone()))
            .collect())
    }

    fn insert_message(&self, message: NewMessage) -> Result<u32, StorageError> {
        message.validate()?;

        let mut state = self.state.write();
        let id = state.next_message_id;
        let next = id.checked_add(1).ok_or(StorageError::MessageIdsExhausted)?;

        let queued = QueuedMessage::from_new(id, message);
        self.record(&JournalEntry::QueueMessage(queued.clone()))?;

        state.messages.insert(id, queued);
        state.next_message_id = next;
        self.maybe_compact(&state);

        tracing::debug!("Queued message {}", id);
        Ok(id)
    }

    fn pending_for(&self, target: &ClientId) -> Result<Vec<QueuedMessage>, StorageError> {
        Ok(self
            .state
            .read()
            .messages
            .values()
            .filter(|m| m.target == *target)
            .cloned()
            .collect())
    }

    fn delete_messages(&self, ids: &[u32]) -> Result<usize, StorageError> {
        let mut state = self.state.write();
        let queued: BTreeSet<u32> = ids
            .iter()
            .copied()
            .filter(|id| state.messages.contains_key(id))
            .collect();
        if queued.is_empty() {
            return Ok(0);
        }

        let queued: Vec<u32> = queued.into_iter().collect();
        self.record(&JournalEntry::DeleteMessages(queued.clone()))?;

        for id in &queued {
            state.messages.remove(id);
        }
        self.maybe_compact(&state);
        Ok(queued.len())
    }

    fn stats(&self) -> StoreStats {
        let state = self.state.read();
        StoreStats {
            clients: state.clients.len(),
            queued_messages: state.messages.len(),
        }
    }
}
