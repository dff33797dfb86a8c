//! In-memory [`PlayerStore`] used by tests and local tooling.
//!
//! Applies exactly the same revision rules as the `SQLite` gateway, so
//! lifecycle tests can run without a database file. [`MemoryStore::external_write`]
//! simulates another writer touching a row behind the session's back.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use rpgvault_types::{PlayerData, PlayerId, PlayerRecord, RecordSnapshot};

use crate::error::StoreError;
use crate::player_store::{PlayerStore, SaveAck};

#[derive(Debug, Clone)]
struct StoredRow {
    data: PlayerData,
    revision: u64,
    saved_at: DateTime<Utc>,
}

impl StoredRow {
    fn to_record(&self, player_id: PlayerId) -> PlayerRecord {
        PlayerRecord::from_stored(player_id, self.data.clone(), self.revision, self.saved_at)
    }
}

/// A [`PlayerStore`] holding rows in a mutex-guarded map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<PlayerId, StoredRow>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn rows(&self) -> MutexGuard<'_, HashMap<PlayerId, StoredRow>> {
        self.rows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The stored record for `player_id`, if any.
    pub fn stored(&self, player_id: PlayerId) -> Option<PlayerRecord> {
        self.rows().get(&player_id).map(|row| row.to_record(player_id))
    }

    /// The stored revision for `player_id`, if any.
    pub fn stored_revision(&self, player_id: PlayerId) -> Option<u64> {
        self.rows().get(&player_id).map(|row| row.revision)
    }

    /// Number of stored rows.
    pub fn len(&self) -> usize {
        self.rows().len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows().is_empty()
    }

    /// Insert a row directly, bypassing the revision check.
    pub fn seed(&self, record: &PlayerRecord) {
        self.rows().insert(
            record.player_id(),
            StoredRow {
                data: record.data().clone(),
                revision: record.revision(),
                saved_at: Utc::now(),
            },
        );
    }

    /// Modify a stored row as a foreign writer would, bumping its revision.
    ///
    /// Returns the new stored revision, or `None` if the row does not exist.
    pub fn external_write(
        &self,
        player_id: PlayerId,
        f: impl FnOnce(&mut PlayerData),
    ) -> Option<u64> {
        let mut rows = self.rows();
        let row = rows.get_mut(&player_id)?;
        f(&mut row.data);
        row.revision = row.revision.saturating_add(1);
        row.saved_at = Utc::now();
        Some(row.revision)
    }
}

impl PlayerStore for MemoryStore {
    async fn load(&self, player_id: PlayerId) -> Result<Option<PlayerRecord>, StoreError> {
        Ok(self.stored(player_id))
    }

    async fn save(&self, snapshot: &RecordSnapshot) -> Result<SaveAck, StoreError> {
        let saved_at = Utc::now();
        let mut rows = self.rows();
        if let Some(existing) = rows
            .get(&snapshot.player_id)
            .filter(|row| row.revision > snapshot.base_revision)
        {
            if existing.revision == snapshot.revision && existing.data == snapshot.data {
                return Ok(SaveAck {
                    revision: existing.revision,
                    saved_at: existing.saved_at,
                });
            }
            return Err(StoreError::Conflict {
                stored_revision: existing.revision,
                base_revision: snapshot.base_revision,
            });
        }
        rows.insert(
            snapshot.player_id,
            StoredRow {
                data: snapshot.data.clone(),
                revision: snapshot.revision,
                saved_at,
            },
        );
        Ok(SaveAck {
            revision: snapshot.revision,
            saved_at,
        })
    }

    async fn create_default(
        &self,
        player_id: PlayerId,
        name: &str,
    ) -> Result<PlayerRecord, StoreError> {
        let now = Utc::now();
        let mut rows = self.rows();
        let row = rows.entry(player_id).or_insert_with(|| StoredRow {
            data: PlayerData::new_default(name, now),
            revision: 0,
            saved_at: now,
        });
        Ok(row.to_record(player_id))
    }
}
