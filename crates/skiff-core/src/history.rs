use crate::secrets::{SecretError, SecretStore};
use crate::store::{ServerStore, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const META_CONSOLE_HISTORY: &str = "console_history";

/// Oldest entries fall off once a server's history exceeds this.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Secret(#[from] SecretError),
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    key: String,
    ciphertext: String,
}

/// One decrypted history row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub key: String,
    pub command: String,
}

/// Per-server cache of previously executed console commands, most recent
/// first, keyed by a content hash so each distinct command text appears at
/// most once. Command text is encrypted at rest.
///
/// Every mutation rewrites the whole list under `console_history`; callers
/// with concurrent writers must serialize per server (the dispatcher's
/// per-server lock does this).
pub struct CommandHistory<'a> {
    store: &'a ServerStore,
    secrets: &'a SecretStore,
}

impl<'a> CommandHistory<'a> {
    pub fn new(store: &'a ServerStore, secrets: &'a SecretStore) -> Self {
        CommandHistory { store, secrets }
    }

    /// Stable key for a command text: sha256 hex of the bytes.
    pub fn content_key(command_text: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(command_text.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Insert at the most-recent position, removing any existing entry with
    /// the same key first, then trim to [`HISTORY_LIMIT`]. Returns the key.
    pub fn record(&self, id: &Uuid, command_text: &str) -> Result<String, HistoryError> {
        let key = Self::content_key(command_text);
        let mut entries = self.read(id)?;
        entries.retain(|e| e.key != key);
        entries.insert(
            0,
            StoredEntry {
                key: key.clone(),
                ciphertext: self.secrets.encrypt(command_text)?,
            },
        );
        entries.truncate(HISTORY_LIMIT);
        self.write(id, &entries)?;
        Ok(key)
    }

    /// Most-recent-first. Entries that fail to decrypt (rotated key) are
    /// skipped rather than failing the whole listing.
    pub fn list(&self, id: &Uuid) -> Result<Vec<HistoryEntry>, HistoryError> {
        let mut out = Vec::new();
        for entry in self.read(id)? {
            if let Ok(command) = self.secrets.decrypt(&entry.ciphertext) {
                out.push(HistoryEntry {
                    key: entry.key,
                    command,
                });
            }
        }
        Ok(out)
    }

    /// Idempotent; removing an absent key is a no-op.
    pub fn remove(&self, id: &Uuid, key: &str) -> Result<(), HistoryError> {
        let mut entries = self.read(id)?;
        let before = entries.len();
        entries.retain(|e| e.key != key);
        if entries.len() != before {
            self.write(id, &entries)?;
        }
        Ok(())
    }

    pub fn clear(&self, id: &Uuid) -> Result<(), HistoryError> {
        self.store.delete_meta(id, META_CONSOLE_HISTORY)?;
        Ok(())
    }

    fn read(&self, id: &Uuid) -> Result<Vec<StoredEntry>, HistoryError> {
        let raw = self.store.get_meta(id, META_CONSOLE_HISTORY)?;
        Ok(raw
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default())
    }

    fn write(&self, id: &Uuid, entries: &[StoredEntry]) -> Result<(), HistoryError> {
        if entries.is_empty() {
            self.store.delete_meta(id, META_CONSOLE_HISTORY)?;
        } else {
            let raw = serde_json::to_string(entries).unwrap_or_else(|_| "[]".into());
            self.store.set_meta(id, META_CONSOLE_HISTORY, &raw)?;
        }
        Ok(())
    }
}
