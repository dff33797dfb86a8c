//! The player data cache: one authoritative in-memory record per online
//! player.
//!
//! The cache is owned by the coordinator and only ever touched on the tick
//! thread, so it has no internal locking. Gameplay reads and writes go
//! through [`PlayerCache::get`] and [`PlayerCache::update`], which only
//! accept entries in the [`EntryState::Active`] state.

use std::collections::HashMap;
use std::time::Instant;

use rpgvault_types::{PlayerData, PlayerId, PlayerRecord, RecordError, RecordSnapshot, SessionId};

/// Errors returned by cache accessors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// The player has no cache entry.
    #[error("player {player_id} is not in the cache")]
    NotFound {
        /// The player.
        player_id: PlayerId,
    },

    /// The entry exists but is not usable by gameplay.
    #[error("player {player_id} is not ready ({state:?})")]
    NotReady {
        /// The player.
        player_id: PlayerId,
        /// The entry's current state.
        state: EntryState,
    },

    /// The mutation itself was rejected; nothing was committed.
    #[error(transparent)]
    Record(#[from] RecordError),
}

/// Lifecycle state of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    /// Load or create-default in flight.
    Loading,
    /// Loaded and in use by gameplay.
    Active,
    /// Player left; waiting for the final save.
    Saving,
    /// Player left while loading; waiting for the stale load to arrive.
    Evicting,
}

/// A reconnection that arrived while the previous session was saving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejoin {
    /// The new session.
    pub session: SessionId,
    /// Name supplied with the new join.
    pub name: String,
}

/// One player's entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub(crate) epoch: u64,
    pub(crate) state: EntryState,
    pub(crate) session: SessionId,
    pub(crate) name: String,
    pub(crate) record: Option<PlayerRecord>,
    pub(crate) load_op: Option<crate::bridge::OperationId>,
    pub(crate) saves_in_flight: usize,
    pub(crate) submitted_revision: u64,
    pub(crate) persisted_revision: Option<u64>,
    pub(crate) ephemeral: bool,
    pub(crate) write_fenced: bool,
    pub(crate) leave_deadline: Option<Instant>,
    pub(crate) rejoin: Option<Rejoin>,
    pub(crate) final_save_deferred: bool,
    pub(crate) load_deferred: bool,
    pub(crate) durability_lost: bool,
}

impl CacheEntry {
    /// A new entry waiting for its first load.
    pub fn loading(session: SessionId, name: &str) -> Self {
        Self {
            epoch: 0,
            state: EntryState::Loading,
            session,
            name: name.to_owned(),
            record: None,
            load_op: None,
            saves_in_flight: 0,
            submitted_revision: 0,
            persisted_revision: None,
            ephemeral: false,
            write_fenced: false,
            leave_deadline: None,
            rejoin: None,
            final_save_deferred: false,
            load_deferred: false,
            durability_lost: false,
        }
    }

    /// Tag the entry with the coordinator's creation counter.
    #[must_use]
    pub(crate) const fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> EntryState {
        self.state
    }

    /// The session the entry belongs to.
    pub const fn session(&self) -> SessionId {
        self.session
    }

    /// Name supplied at join.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The record, once loaded (in any state).
    pub const fn record(&self) -> Option<&PlayerRecord> {
        self.record.as_ref()
    }

    /// Saves submitted and not yet completed.
    pub const fn saves_in_flight(&self) -> usize {
        self.saves_in_flight
    }

    /// Revision the next save will use as its base.
    pub const fn submitted_revision(&self) -> u64 {
        self.submitted_revision
    }

    /// Highest revision acknowledged by the store in this session.
    pub const fn persisted_revision(&self) -> Option<u64> {
        self.persisted_revision
    }

    /// Whether the record is a stand-in after a failed load.
    pub const fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// Whether the record lost a revision conflict and is never saved.
    pub const fn is_write_fenced(&self) -> bool {
        self.write_fenced
    }

    /// A reconnection waiting for the final save.
    pub const fn rejoin(&self) -> Option<&Rejoin> {
        self.rejoin.as_ref()
    }

    /// Whether this entry's record may be written back.
    pub const fn is_persistable(&self) -> bool {
        self.record.is_some() && !self.ephemeral && !self.write_fenced
    }

    /// Whether the record has changes the store has not acknowledged.
    pub fn has_unsaved_changes(&self) -> bool {
        self.record.as_ref().is_some_and(|record| {
            record.is_dirty() || self.persisted_revision.is_none_or(|p| p < record.revision())
        })
    }

    /// Record a submitted save of the snapshot at `revision`.
    pub(crate) const fn note_save_submitted(&mut self, revision: u64) {
        self.submitted_revision = revision;
        self.saves_in_flight = self.saves_in_flight.saturating_add(1);
    }

    /// Record a finished save (successful or not).
    pub(crate) const fn note_save_finished(&mut self) {
        self.saves_in_flight = self.saves_in_flight.saturating_sub(1);
    }
}

/// Mapping of online players to their entries.
#[derive(Debug, Default)]
pub struct PlayerCache {
    entries: HashMap<PlayerId, CacheEntry>,
}

impl PlayerCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in any state.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The record of an active player.
    pub fn get(&self, player_id: PlayerId) -> Option<&PlayerRecord> {
        self.entries
            .get(&player_id)
            .filter(|entry| entry.state == EntryState::Active)
            .and_then(|entry| entry.record.as_ref())
    }

    /// The entry for `player_id` in any state.
    pub fn entry(&self, player_id: PlayerId) -> Option<&CacheEntry> {
        self.entries.get(&player_id)
    }

    pub(crate) fn entry_mut(&mut self, player_id: PlayerId) -> Option<&mut CacheEntry> {
        self.entries.get_mut(&player_id)
    }

    /// Insert or replace the entry for `player_id`, returning the old one.
    pub fn put(&mut self, player_id: PlayerId, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(player_id, entry)
    }

    /// Remove and return the entry for `player_id`.
    pub fn remove(&mut self, player_id: PlayerId) -> Option<CacheEntry> {
        self.entries.remove(&player_id)
    }

    /// Iterate over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (PlayerId, &CacheEntry)> {
        self.entries.iter().map(|(id, entry)| (*id, entry))
    }

    /// Players whose entry is in `state`.
    pub fn ids_in_state(&self, state: EntryState) -> Vec<PlayerId> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.state == state)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Apply a gameplay mutation to an active record.
    ///
    /// The record's revision is bumped and it is marked dirty.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] or [`CacheError::NotReady`] when the
    /// player has no active record.
    pub fn update<R>(
        &mut self,
        player_id: PlayerId,
        f: impl FnOnce(&mut PlayerData) -> R,
    ) -> Result<R, CacheError> {
        Ok(self.active_record_mut(player_id)?.mutate(f))
    }

    /// Apply a fallible gameplay mutation to an active record.
    ///
    /// Nothing is committed when `f` fails.
    ///
    /// # Errors
    ///
    /// As [`PlayerCache::update`], plus [`CacheError::Record`] when `f`
    /// fails.
    pub fn try_update<R>(
        &mut self,
        player_id: PlayerId,
        f: impl FnOnce(&mut PlayerData) -> Result<R, RecordError>,
    ) -> Result<R, CacheError> {
        Ok(self.active_record_mut(player_id)?.try_mutate(f)?)
    }

    /// Force the record to be saved on the next sweep.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::NotFound`] when the player has no record.
    pub fn mark_dirty(&mut self, player_id: PlayerId) -> Result<(), CacheError> {
        let record = self
            .entries
            .get_mut(&player_id)
            .and_then(|entry| entry.record.as_mut())
            .ok_or(CacheError::NotFound { player_id })?;
        record.mark_dirty();
        Ok(())
    }

    /// Snapshot a persistable record for saving and clear its dirty flag.
    ///
    /// The snapshot's base revision is the entry's submitted revision.
    /// Returns `None` for missing, ephemeral, or write-fenced records.
    pub fn snapshot_for_save(&mut self, player_id: PlayerId) -> Option<RecordSnapshot> {
        let entry = self.entries.get_mut(&player_id)?;
        if !entry.is_persistable() {
            return None;
        }
        let base = entry.submitted_revision;
        let record = entry.record.as_mut()?;
        let snapshot = record.snapshot(base);
        record.clear_dirty();
        Some(snapshot)
    }

    /// Active, dirty, persistable entries with no save already queued.
    pub fn sweep_candidates(&self) -> Vec<PlayerId> {
        let mut ids: Vec<PlayerId> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry.state == EntryState::Active
                    && entry.is_persistable()
                    && entry.saves_in_flight == 0
                    && entry.record.as_ref().is_some_and(PlayerRecord::is_dirty)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    fn active_record_mut(&mut self, player_id: PlayerId) -> Result<&mut PlayerRecord, CacheError> {
        let entry = self
            .entries
            .get_mut(&player_id)
            .ok_or(CacheError::NotFound { player_id })?;
        if entry.state != EntryState::Active {
            return Err(CacheError::NotReady {
                player_id,
                state: entry.state,
            });
        }
        entry.record.as_mut().ok_or(CacheError::NotReady {
            player_id,
            state: entry.state,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use rpgvault_types::{keys, progression};

    use super::*;

    fn active(cache: &mut PlayerCache) -> PlayerId {
        let id = PlayerId::new();
        let mut entry = CacheEntry::loading(SessionId::new(), "Steve");
        entry.state = EntryState::Active;
        entry.record = Some(PlayerRecord::new(
            id,
            PlayerData::new_default("Steve", Utc::now()),
        ));
        cache.put(id, entry);
        id
    }

    #[test]
    fn loading_entries_are_not_visible_to_gameplay() {
        let mut cache = PlayerCache::new();
        let id = PlayerId::new();
        cache.put(id, CacheEntry::loading(SessionId::new(), "Alex"));

        assert!(cache.get(id).is_none());
        let err = cache.update(id, |d| d.set_integer(keys::CURRENCY, 1)).unwrap_err();
        assert_eq!(
            err,
            CacheError::NotReady {
                player_id: id,
                state: EntryState::Loading
            }
        );
        assert!(matches!(
            cache.update(PlayerId::new(), |_| ()),
            Err(CacheError::NotFound { .. })
        ));
    }

    #[test]
    fn update_bumps_revision() {
        let mut cache = PlayerCache::new();
        let id = active(&mut cache);
        cache.update(id, |d| d.set_integer(keys::CURRENCY, 100)).unwrap();
        let record = cache.get(id).unwrap();
        assert_eq!(record.revision(), 1);
        assert!(record.is_dirty());
    }

    #[test]
    fn failed_try_update_commits_nothing() {
        let mut cache = PlayerCache::new();
        let id = active(&mut cache);
        let err = cache
            .try_update(id, |d| progression::add_currency(d, -5))
            .unwrap_err();
        assert!(matches!(
            err,
            CacheError::Record(RecordError::InsufficientCurrency { .. })
        ));
        assert_eq!(cache.get(id).unwrap().revision(), 0);
    }

    #[test]
    fn snapshot_clears_dirty_and_uses_submitted_base() {
        let mut cache = PlayerCache::new();
        let id = active(&mut cache);
        cache.update(id, |d| d.set_integer(keys::CURRENCY, 1)).unwrap();
        cache.update(id, |d| d.set_integer(keys::CURRENCY, 2)).unwrap();

        let first = cache.snapshot_for_save(id).unwrap();
        assert_eq!((first.revision, first.base_revision), (2, 0));
        assert!(!cache.get(id).unwrap().is_dirty());
        cache.entry_mut(id).unwrap().note_save_submitted(first.revision);

        cache.update(id, |d| d.set_integer(keys::CURRENCY, 3)).unwrap();
        let second = cache.snapshot_for_save(id).unwrap();
        assert_eq!((second.revision, second.base_revision), (3, 2));
    }

    #[test]
    fn sweep_skips_clean_queued_ephemeral_and_fenced() {
        let mut cache = PlayerCache::new();
        let clean = active(&mut cache);
        let dirty = active(&mut cache);
        let queued = active(&mut cache);
        let ephemeral = active(&mut cache);
        let fenced = active(&mut cache);
        for id in [dirty, queued, ephemeral, fenced] {
            cache.update(id, |d| d.set_integer(keys::MANA, 10)).unwrap();
        }
        cache.entry_mut(queued).unwrap().note_save_submitted(0);
        cache.entry_mut(ephemeral).unwrap().ephemeral = true;
        cache.entry_mut(fenced).unwrap().write_fenced = true;

        assert_eq!(cache.sweep_candidates(), vec![dirty]);
        assert!(cache.snapshot_for_save(ephemeral).is_none());
        assert!(cache.snapshot_for_save(fenced).is_none());
        assert!(cache.get(clean).is_some());
    }

    #[test]
    fn unsaved_changes_tracks_acknowledged_revision() {
        let mut cache = PlayerCache::new();
        let id = active(&mut cache);
        cache.update(id, |d| d.set_integer(keys::CURRENCY, 9)).unwrap();
        let snap = cache.snapshot_for_save(id).unwrap();

        let entry = cache.entry_mut(id).unwrap();
        assert!(entry.has_unsaved_changes());
        entry.persisted_revision = Some(snap.revision);
        assert!(!entry.has_unsaved_changes());
    }
}
