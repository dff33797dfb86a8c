//! Session lifecycle coordination.
//!
//! The [`Coordinator`] owns the [`PlayerCache`] and the [`Bridge`] and runs
//! entirely on the tick thread. It reacts to [`HostEvent`]s, applies storage
//! completions at the start of every tick, runs the periodic autosave sweep,
//! and enforces the leave grace period.
//!
//! # Entry lifecycle
//!
//! ```text
//!            join                load ok / create ok
//!   NONE ----------> LOADING ------------------------> ACTIVE
//!                      |  leave                          |  leave / shutdown
//!                      v                                 v
//!                   EVICTING --(stale load arrives)--> SAVING --(ack, exhaustion,
//!                                                        |        grace expiry)--> GONE
//!                                                        | join
//!                                                        v
//!                                         load queued behind the save
//! ```
//!
//! A save conflict either rebases the session on the stored revision (when
//! the in-memory copy is newer) or write-fences it so it is never saved
//! again. Every lost write is recorded as a [`DurabilityFailure`].

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rpgvault_db::{PlayerStore, StoreError};
use rpgvault_types::{
    EquipmentSlot, LevelChange, PlayerData, PlayerId, PlayerRecord, RecordError, SessionId, Stat,
    progression,
};
use rust_decimal::Decimal;

use crate::bridge::{
    Bridge, BridgeError, Completion, OperationId, OperationKind, OperationOutput, OperationPayload,
};
use crate::cache::{CacheEntry, CacheError, EntryState, PlayerCache, Rejoin};
use crate::config::LifecycleConfig;
use crate::host::{
    CoordinatorEvent, HostEvent, LeaveReason, PlayerDataView, ShutdownReport, TickHandler,
};

// =============================================================================
// Errors and failure records
// =============================================================================

/// Errors returned by gameplay operations on the coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    /// The player has no usable record, or the mutation was rejected.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A save could not be queued.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

/// Why a write never reached the durable store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The stored revision was ahead of the session's copy.
    Conflict {
        /// Revision held by the store.
        stored_revision: u64,
    },
    /// Retries ran out or the error was not retryable.
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// The final error.
        error: String,
    },
    /// The leave grace period passed before the final save finished.
    GraceExpired,
    /// The shutdown flush timed out before the final save finished.
    ShutdownTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict { stored_revision } => {
                write!(f, "conflict with stored revision {stored_revision}")
            }
            Self::Exhausted { attempts, error } => {
                write!(f, "failed after {attempts} attempts: {error}")
            }
            Self::GraceExpired => f.write_str("leave grace period expired"),
            Self::ShutdownTimeout => f.write_str("shutdown flush timed out"),
        }
    }
}

/// A write that was lost, kept for operational follow-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurabilityFailure {
    /// The player affected.
    pub player_id: PlayerId,
    /// In-memory revision that was not persisted.
    pub revision: u64,
    /// What went wrong.
    pub reason: FailureReason,
    /// When the failure was recorded.
    pub at: DateTime<Utc>,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Drives join, leave, autosave, and shutdown for every online player.
pub struct Coordinator<S: PlayerStore> {
    bridge: Bridge<S>,
    cache: PlayerCache,
    lifecycle: LifecycleConfig,
    /// Entry epoch each outstanding operation was submitted for.
    op_epochs: HashMap<OperationId, u64>,
    next_epoch: u64,
    events: Vec<CoordinatorEvent>,
    failures: Vec<DurabilityFailure>,
    last_sweep_tick: u64,
    shutting_down: bool,
    tally: ShutdownReport,
}

impl<S: PlayerStore> Coordinator<S> {
    /// Create a coordinator with an empty cache.
    pub fn new(bridge: Bridge<S>, lifecycle: LifecycleConfig) -> Self {
        Self::with_cache(bridge, PlayerCache::new(), lifecycle)
    }

    /// Create a coordinator that takes ownership of `cache`.
    pub fn with_cache(bridge: Bridge<S>, cache: PlayerCache, lifecycle: LifecycleConfig) -> Self {
        Self {
            bridge,
            cache,
            lifecycle,
            op_epochs: HashMap::new(),
            next_epoch: 0,
            events: Vec::new(),
            failures: Vec::new(),
            last_sweep_tick: 0,
            shutting_down: false,
            tally: ShutdownReport::default(),
        }
    }

    /// The player cache (read-only).
    pub const fn cache(&self) -> &PlayerCache {
        &self.cache
    }

    /// The storage bridge.
    pub const fn bridge(&self) -> &Bridge<S> {
        &self.bridge
    }

    /// The durable store behind the bridge.
    pub fn store(&self) -> &S {
        self.bridge.store()
    }

    /// Lifecycle timing in effect.
    pub const fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    /// Writes that never reached the store.
    ///
    /// A grace or shutdown timeout is dropped again when the save it gave
    /// up on is acknowledged later.
    pub fn failures(&self) -> &[DurabilityFailure] {
        &self.failures
    }

    /// Take the events raised since the last call.
    pub fn drain_events(&mut self) -> Vec<CoordinatorEvent> {
        std::mem::take(&mut self.events)
    }

    /// Whether [`Coordinator::shutdown`] has started.
    pub const fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    /// Whether no storage operation is outstanding.
    pub fn is_idle(&self) -> bool {
        self.bridge.is_idle()
    }

    /// Shut the worker runtime down.
    pub fn close(self, timeout: Duration) {
        self.bridge.close(timeout);
    }

    // -------------------------------------------------------------------------
    // Host boundary
    // -------------------------------------------------------------------------

    /// Apply one host notification.
    pub fn handle_event(&mut self, event: HostEvent) {
        match event {
            HostEvent::Join {
                player_id,
                session,
                name,
            } => self.join(player_id, session, &name),
            HostEvent::Leave { player_id, reason } => self.leave(player_id, reason),
            HostEvent::Shutdown => {
                let report = self.shutdown(self.lifecycle.shutdown_timeout());
                self.events.push(CoordinatorEvent::ShutdownComplete(report));
            }
        }
    }

    /// A player connected.
    pub fn join(&mut self, player_id: PlayerId, session: SessionId, name: &str) {
        if self.shutting_down {
            tracing::warn!(player_id = %player_id, "Join ignored during shutdown");
            return;
        }

        let Some(entry) = self.cache.entry_mut(player_id) else {
            self.next_epoch = self.next_epoch.saturating_add(1);
            let entry = CacheEntry::loading(session, name).with_epoch(self.next_epoch);
            self.cache.put(player_id, entry);
            tracing::info!(player_id = %player_id, session = %session, "Player joined; loading record");
            self.submit_fetch(player_id, OperationPayload::Load);
            return;
        };

        match entry.state {
            EntryState::Loading => {
                entry.session = session;
                name.clone_into(&mut entry.name);
                tracing::debug!(player_id = %player_id, session = %session, "Join while loading; session replaced");
            }
            EntryState::Evicting => {
                entry.state = EntryState::Loading;
                entry.session = session;
                name.clone_into(&mut entry.name);
                tracing::debug!(player_id = %player_id, session = %session, "Rejoined before the pending load arrived");
            }
            EntryState::Active => {
                entry.session = session;
                name.clone_into(&mut entry.name);
                if let Some(record) = entry.record.as_mut().filter(|r| r.data().name != name) {
                    record.mutate(|data| name.clone_into(&mut data.name));
                }
                tracing::warn!(player_id = %player_id, session = %session, "Duplicate join; session replaced");
                self.events.push(CoordinatorEvent::PlayerReady {
                    player_id,
                    session,
                    created: false,
                });
            }
            EntryState::Saving => {
                entry.rejoin = Some(Rejoin {
                    session,
                    name: name.to_owned(),
                });
                let needs_load = entry.load_op.is_none() && !entry.load_deferred;
                tracing::info!(
                    player_id = %player_id,
                    session = %session,
                    saves_in_flight = entry.saves_in_flight,
                    "Player rejoined during final save; reload queued behind it"
                );
                if needs_load {
                    self.submit_fetch(player_id, OperationPayload::Load);
                }
            }
        }
    }

    /// A player disconnected.
    pub fn leave(&mut self, player_id: PlayerId, reason: LeaveReason) {
        let Some(entry) = self.cache.entry_mut(player_id) else {
            tracing::debug!(player_id = %player_id, reason = %reason, "Leave for player without a cache entry");
            return;
        };

        match entry.state {
            EntryState::Loading => {
                tracing::info!(player_id = %player_id, reason = %reason, "Player left before the record loaded");
                if entry.load_op.is_some() {
                    entry.state = EntryState::Evicting;
                } else {
                    self.cache.remove(player_id);
                }
                self.events.push(CoordinatorEvent::SessionEnded {
                    player_id,
                    clean: true,
                });
            }
            EntryState::Evicting => {}
            EntryState::Saving => {
                if entry.rejoin.take().is_some() {
                    entry.load_deferred = false;
                    tracing::info!(player_id = %player_id, reason = %reason, "Player left again before the reload");
                }
                self.maybe_finish(player_id);
            }
            EntryState::Active => {
                tracing::info!(player_id = %player_id, reason = %reason, "Player left; saving record");
                let deadline = deadline_after(self.lifecycle.leave_grace());
                self.begin_final_save(player_id, deadline);
            }
        }
    }

    /// Flush every active record and wait up to `timeout` for the saves.
    ///
    /// Loads are no longer accepted once this starts. Calling it again
    /// returns the first report.
    pub fn shutdown(&mut self, timeout: Duration) -> ShutdownReport {
        if self.shutting_down {
            return self.tally;
        }
        self.shutting_down = true;
        self.bridge.begin_shutdown();
        let deadline = deadline_after(timeout);

        self.process_completions();

        let online = self.cache.ids_in_state(EntryState::Active);
        tracing::info!(
            online = online.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Flushing player records before shutdown"
        );
        for player_id in online {
            self.begin_final_save(player_id, deadline);
        }
        for state in [EntryState::Loading, EntryState::Evicting] {
            for player_id in self.cache.ids_in_state(state) {
                self.cache.remove(player_id);
            }
        }
        for player_id in self.cache.ids_in_state(EntryState::Saving) {
            if let Some(entry) = self.cache.entry_mut(player_id) {
                entry.rejoin = None;
                entry.load_deferred = false;
            }
            self.maybe_finish(player_id);
        }

        loop {
            if self.cache.ids_in_state(EntryState::Saving).is_empty() {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if self.bridge.wait_for_completion(remaining) {
                self.process_completions();
                self.retry_deferred();
            }
        }

        let unfinished = self.cache.ids_in_state(EntryState::Saving);
        for &player_id in &unfinished {
            let revision = self.record_revision(player_id);
            self.record_failure(player_id, revision, FailureReason::ShutdownTimeout);
            self.cache.remove(player_id);
            self.events.push(CoordinatorEvent::SessionEnded {
                player_id,
                clean: false,
            });
        }
        self.tally.unfinished = unfinished.len();

        tracing::info!(
            saved = self.tally.saved,
            failed = self.tally.failed,
            unfinished = self.tally.unfinished,
            "Shutdown flush finished"
        );
        self.tally
    }

    /// Run one tick: apply completions, retry deferred work, autosave, and
    /// expire overdue leaves.
    pub fn process_tick(&mut self, tick: u64) {
        self.process_completions();
        if self.shutting_down {
            return;
        }
        self.retry_deferred();

        let interval = self.lifecycle.autosave_interval_ticks;
        if interval > 0 && tick.saturating_sub(self.last_sweep_tick) >= interval {
            self.last_sweep_tick = tick;
            self.sweep();
        }

        self.expire_leaves(Instant::now());
    }

    // -------------------------------------------------------------------------
    // Gameplay surface
    // -------------------------------------------------------------------------

    /// What gameplay may see of a player right now.
    pub fn player_data(&self, player_id: PlayerId) -> PlayerDataView<'_> {
        let Some(entry) = self.cache.entry(player_id) else {
            return PlayerDataView::Offline;
        };
        match (entry.state, entry.record.as_ref()) {
            (EntryState::Active, Some(record)) => PlayerDataView::Ready(record),
            (EntryState::Loading | EntryState::Active, _) => PlayerDataView::NotReady,
            (EntryState::Saving, _) if entry.rejoin.is_some() => PlayerDataView::NotReady,
            (EntryState::Saving | EntryState::Evicting, _) => PlayerDataView::Offline,
        }
    }

    /// Apply an arbitrary mutation to an active record.
    pub fn update<R>(
        &mut self,
        player_id: PlayerId,
        f: impl FnOnce(&mut PlayerData) -> R,
    ) -> Result<R, CoordinatorError> {
        Ok(self.cache.update(player_id, f)?)
    }

    /// Apply a fallible mutation to an active record.
    pub fn try_update<R>(
        &mut self,
        player_id: PlayerId,
        f: impl FnOnce(&mut PlayerData) -> Result<R, RecordError>,
    ) -> Result<R, CoordinatorError> {
        Ok(self.cache.try_update(player_id, f)?)
    }

    /// Grant experience, raising a [`CoordinatorEvent::LevelUp`] per level.
    pub fn add_experience(
        &mut self,
        player_id: PlayerId,
        amount: u64,
    ) -> Result<Vec<LevelChange>, CoordinatorError> {
        if amount == 0 {
            self.require_active(player_id)?;
            return Ok(Vec::new());
        }
        let changes = self
            .cache
            .update(player_id, |data| progression::add_experience(data, amount))?;
        for change in &changes {
            self.announce_level(player_id, *change);
        }
        Ok(changes)
    }

    /// Add (or with a negative delta, spend) currency. Returns the balance.
    pub fn add_currency(&mut self, player_id: PlayerId, delta: i64) -> Result<i64, CoordinatorError> {
        self.try_update(player_id, |data| progression::add_currency(data, delta))
    }

    /// Set the level directly (clamped), resetting experience.
    pub fn set_level(
        &mut self,
        player_id: PlayerId,
        level: u32,
    ) -> Result<Option<LevelChange>, CoordinatorError> {
        let change = self
            .cache
            .update(player_id, |data| progression::set_level(data, level))?;
        if let Some(change) = change.filter(|c| c.to > c.from) {
            self.announce_level(player_id, change);
        }
        Ok(change)
    }

    /// Set one base stat.
    pub fn set_stat(
        &mut self,
        player_id: PlayerId,
        stat: Stat,
        value: Decimal,
    ) -> Result<(), CoordinatorError> {
        self.update(player_id, |data| progression::set_stat(data, stat, value))
    }

    /// Put `amount` of `item` into the player's bag.
    pub fn give_item(
        &mut self,
        player_id: PlayerId,
        item: &str,
        amount: u32,
    ) -> Result<(), CoordinatorError> {
        self.try_update(player_id, |data| data.inventory.add_item(item, amount))
    }

    /// Take `amount` of `item` out of the player's bag.
    pub fn take_item(
        &mut self,
        player_id: PlayerId,
        item: &str,
        amount: u32,
    ) -> Result<(), CoordinatorError> {
        self.try_update(player_id, |data| data.inventory.remove_item(item, amount))
    }

    /// Equip an item from the bag, returning whatever was displaced.
    pub fn equip(
        &mut self,
        player_id: PlayerId,
        slot: EquipmentSlot,
        item: &str,
    ) -> Result<Option<String>, CoordinatorError> {
        self.try_update(player_id, |data| data.inventory.equip(slot, item))
    }

    /// Move the item in `slot` back into the bag.
    pub fn unequip(
        &mut self,
        player_id: PlayerId,
        slot: EquipmentSlot,
    ) -> Result<Option<String>, CoordinatorError> {
        self.try_update(player_id, |data| data.inventory.unequip(slot))
    }

    /// Queue a save of an active record now instead of waiting for the sweep.
    ///
    /// Returns `None` when there is nothing to save.
    pub fn request_save(
        &mut self,
        player_id: PlayerId,
    ) -> Result<Option<OperationId>, CoordinatorError> {
        self.require_active(player_id)?;
        let dirty = self
            .cache
            .get(player_id)
            .is_some_and(PlayerRecord::is_dirty);
        if !dirty {
            return Ok(None);
        }
        Ok(self.submit_save(player_id, false)?)
    }

    // -------------------------------------------------------------------------
    // Submissions
    // -------------------------------------------------------------------------

    fn submit_fetch(&mut self, player_id: PlayerId, payload: OperationPayload) {
        let Some(epoch) = self.cache.entry(player_id).map(|entry| entry.epoch) else {
            return;
        };
        let result = self.bridge.submit(player_id, payload);
        let Some(entry) = self.cache.entry_mut(player_id) else {
            return;
        };
        match result {
            Ok(op) => {
                entry.load_op = Some(op);
                entry.load_deferred = false;
                self.op_epochs.insert(op, epoch);
            }
            Err(BridgeError::Busy { queued, .. }) => {
                entry.load_deferred = true;
                tracing::debug!(player_id = %player_id, queued, "Load deferred; player queue full");
            }
            Err(err) => {
                entry.load_deferred = false;
                tracing::warn!(player_id = %player_id, error = %err, "Load could not be submitted");
            }
        }
    }

    /// Snapshot and submit a save. A rejected submission leaves the record
    /// dirty; for a final save it is retried on the next tick.
    fn submit_save(
        &mut self,
        player_id: PlayerId,
        final_save: bool,
    ) -> Result<Option<OperationId>, BridgeError> {
        let Some(snapshot) = self.cache.snapshot_for_save(player_id) else {
            return Ok(None);
        };
        let revision = snapshot.revision;
        let base_revision = snapshot.base_revision;
        let result = self
            .bridge
            .submit(player_id, OperationPayload::Save(Box::new(snapshot)));
        let Some(entry) = self.cache.entry_mut(player_id) else {
            return result.map(Some);
        };

        match result {
            Ok(op) => {
                entry.note_save_submitted(revision);
                if final_save {
                    entry.final_save_deferred = false;
                }
                self.op_epochs.insert(op, entry.epoch);
                tracing::debug!(
                    player_id = %player_id,
                    op = %op,
                    revision,
                    base_revision,
                    final_save,
                    "Save submitted"
                );
                Ok(Some(op))
            }
            Err(err) => {
                if let Some(record) = entry.record.as_mut() {
                    record.mark_dirty();
                }
                if final_save {
                    entry.final_save_deferred = true;
                }
                tracing::debug!(player_id = %player_id, revision, error = %err, "Save not queued");
                Err(err)
            }
        }
    }

    fn begin_final_save(&mut self, player_id: PlayerId, deadline: Instant) {
        let Some(entry) = self.cache.entry_mut(player_id) else {
            return;
        };
        entry.state = EntryState::Saving;
        entry.leave_deadline = Some(deadline);

        if !entry.is_persistable() {
            tracing::warn!(
                player_id = %player_id,
                ephemeral = entry.ephemeral,
                write_fenced = entry.write_fenced,
                "Record is not persistable; discarding session state"
            );
            self.finish(player_id, false);
            return;
        }

        if entry.record.as_ref().is_some_and(PlayerRecord::is_dirty)
            && let Err(err) = self.submit_save(player_id, true)
        {
            tracing::debug!(player_id = %player_id, error = %err, "Final save deferred");
        }
        self.maybe_finish(player_id);
    }

    fn sweep(&mut self) {
        let candidates = self.cache.sweep_candidates();
        if candidates.is_empty() {
            return;
        }
        let mut submitted: usize = 0;
        for &player_id in &candidates {
            if matches!(self.submit_save(player_id, false), Ok(Some(_))) {
                submitted = submitted.saturating_add(1);
            }
        }
        tracing::debug!(candidates = candidates.len(), submitted, "Autosave sweep");
    }

    fn retry_deferred(&mut self) {
        let mut saves = Vec::new();
        let mut loads = Vec::new();
        for (player_id, entry) in self.cache.iter() {
            if entry.final_save_deferred && entry.state == EntryState::Saving {
                saves.push(player_id);
            }
            if entry.load_deferred {
                loads.push(player_id);
            }
        }
        for player_id in saves {
            if self.submit_save(player_id, true).is_ok() {
                self.maybe_finish(player_id);
            }
        }
        for player_id in loads {
            self.submit_fetch(player_id, OperationPayload::Load);
        }
    }

    fn expire_leaves(&mut self, now: Instant) {
        let expired: Vec<PlayerId> = self
            .cache
            .iter()
            .filter(|(_, entry)| {
                entry.state == EntryState::Saving
                    && entry.rejoin.is_none()
                    && entry.leave_deadline.is_some_and(|deadline| now >= deadline)
            })
            .map(|(player_id, _)| player_id)
            .collect();

        for player_id in expired {
            let revision = self.record_revision(player_id);
            self.record_failure(player_id, revision, FailureReason::GraceExpired);
            self.finish(player_id, false);
        }
    }

    // -------------------------------------------------------------------------
    // Completions
    // -------------------------------------------------------------------------

    fn process_completions(&mut self) {
        for completion in self.bridge.drain_completions() {
            self.handle_completion(completion);
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        let Some(epoch) = self.op_epochs.remove(&completion.op_id) else {
            tracing::warn!(
                player_id = %completion.player_id,
                op = %completion.op_id,
                "Completion for an unknown operation"
            );
            return;
        };
        let current = self
            .cache
            .entry(completion.player_id)
            .is_some_and(|entry| entry.epoch == epoch);

        match completion.kind {
            OperationKind::Load | OperationKind::Create if current => self.on_fetched(completion),
            OperationKind::Load | OperationKind::Create => {
                tracing::debug!(
                    player_id = %completion.player_id,
                    op = %completion.op_id,
                    "Discarding load for an ended session"
                );
            }
            OperationKind::Save { revision, .. } if current => self.on_saved(completion, revision),
            OperationKind::Save { revision, .. } => self.on_orphan_save(completion, revision),
        }
    }

    fn on_fetched(&mut self, completion: Completion) {
        let Completion {
            op_id,
            player_id,
            kind,
            attempts,
            outcome,
        } = completion;
        let Some(entry) = self.cache.entry_mut(player_id) else {
            return;
        };
        if entry.load_op != Some(op_id) {
            tracing::debug!(player_id = %player_id, op = %op_id, "Superseded load result discarded");
            return;
        }
        entry.load_op = None;

        match entry.state {
            EntryState::Evicting => {
                self.cache.remove(player_id);
                tracing::debug!(player_id = %player_id, "Discarded load for a player who already left");
                return;
            }
            EntryState::Saving if entry.rejoin.is_none() => {
                tracing::debug!(player_id = %player_id, "Reload no longer needed");
                self.maybe_finish(player_id);
                return;
            }
            EntryState::Active => return,
            EntryState::Loading | EntryState::Saving => {}
        }

        let name = entry
            .rejoin
            .as_ref()
            .map_or_else(|| entry.name.clone(), |rejoin| rejoin.name.clone());

        match outcome {
            Ok(OperationOutput::Loaded(Some(record))) => self.install(player_id, record, false),
            Ok(OperationOutput::Created(record)) => self.install(player_id, record, true),
            Ok(OperationOutput::Loaded(None)) => {
                tracing::info!(player_id = %player_id, "No stored record; creating defaults");
                self.submit_fetch(player_id, OperationPayload::Create { name });
            }
            Ok(OperationOutput::Saved(_)) => {
                tracing::warn!(player_id = %player_id, kind = kind.label(), "Unexpected save output for a load");
            }
            Err(err) => self.install_fallback(player_id, &err, attempts),
        }
    }

    /// Make a loaded (or created) record active.
    ///
    /// On a reconnect the previous session's record is kept when it is
    /// newer than the stored copy, so an unsaved final state is not lost.
    fn install(&mut self, player_id: PlayerId, stored: PlayerRecord, created: bool) {
        let Some(entry) = self.cache.entry_mut(player_id) else {
            return;
        };
        if let Some(rejoin) = entry.rejoin.take() {
            entry.session = rejoin.session;
            entry.name = rejoin.name;
        }

        let stored_revision = stored.revision();
        let mut record = match entry.record.take() {
            Some(previous) if previous.revision() > stored_revision => {
                tracing::warn!(
                    player_id = %player_id,
                    stored_revision,
                    revision = previous.revision(),
                    "Keeping newer in-memory record over the stored copy"
                );
                previous
            }
            _ => stored,
        };
        let name = entry.name.clone();
        record.mutate(|data| {
            data.name = name;
            data.last_login = Utc::now();
            data.ensure_all_stats();
        });

        let revision = record.revision();
        entry.record = Some(record);
        entry.submitted_revision = stored_revision;
        entry.persisted_revision = Some(stored_revision);
        entry.state = EntryState::Active;
        entry.leave_deadline = None;
        entry.final_save_deferred = false;
        entry.load_deferred = false;
        entry.durability_lost = false;
        let session = entry.session;

        tracing::info!(
            player_id = %player_id,
            session = %session,
            stored_revision,
            revision,
            created,
            "Player record ready"
        );
        self.events.push(CoordinatorEvent::PlayerReady {
            player_id,
            session,
            created,
        });
    }

    /// Loading failed after retries.
    fn install_fallback(&mut self, player_id: PlayerId, err: &StoreError, attempts: u32) {
        let Some(entry) = self.cache.entry_mut(player_id) else {
            return;
        };
        if let Some(rejoin) = entry.rejoin.take() {
            entry.session = rejoin.session;
            entry.name = rejoin.name;
        }
        let session = entry.session;
        entry.state = EntryState::Active;
        entry.leave_deadline = None;
        entry.final_save_deferred = false;
        entry.load_deferred = false;

        if let Some(record) = entry.record.as_mut() {
            record.mark_dirty();
            tracing::warn!(
                player_id = %player_id,
                attempts,
                error = %err,
                "Reload failed; keeping the previous session's record"
            );
            self.events.push(CoordinatorEvent::PlayerReady {
                player_id,
                session,
                created: false,
            });
            return;
        }

        entry.record = Some(PlayerRecord::new(
            player_id,
            PlayerData::new_default(&entry.name, Utc::now()),
        ));
        entry.ephemeral = true;
        tracing::error!(
            player_id = %player_id,
            attempts,
            error_kind = err.kind(),
            error = %err,
            "Load failed; using a temporary record that will not be saved"
        );
        self.events.push(CoordinatorEvent::LoadFailed {
            player_id,
            session,
            error: err.to_string(),
        });
    }

    fn on_saved(&mut self, completion: Completion, revision: u64) {
        let Completion {
            player_id,
            attempts,
            outcome,
            ..
        } = completion;
        let Some(entry) = self.cache.entry_mut(player_id) else {
            return;
        };
        entry.note_save_finished();

        match outcome {
            Ok(OperationOutput::Saved(ack)) => {
                entry.persisted_revision = Some(
                    entry
                        .persisted_revision
                        .map_or(ack.revision, |p| p.max(ack.revision)),
                );
                if let Some(record) = entry.record.as_mut() {
                    record.record_saved(ack.saved_at);
                }
                tracing::debug!(player_id = %player_id, revision = ack.revision, attempts, "Record saved");
            }
            Ok(_) => {
                tracing::warn!(player_id = %player_id, "Unexpected output for a save");
            }
            Err(StoreError::Conflict {
                stored_revision,
                base_revision,
            }) => self.on_conflict(player_id, revision, stored_revision, base_revision),
            Err(err) => {
                if entry.state == EntryState::Active {
                    if let Some(record) = entry.record.as_mut() {
                        record.mark_dirty();
                    }
                } else {
                    entry.durability_lost = true;
                }
                self.record_failure(
                    player_id,
                    revision,
                    FailureReason::Exhausted {
                        attempts,
                        error: err.to_string(),
                    },
                );
            }
        }

        self.maybe_finish(player_id);
    }

    fn on_conflict(
        &mut self,
        player_id: PlayerId,
        revision: u64,
        stored_revision: u64,
        base_revision: u64,
    ) {
        let Some(entry) = self.cache.entry_mut(player_id) else {
            return;
        };
        let current = entry.record.as_ref().map_or(0, PlayerRecord::revision);

        if current > stored_revision {
            entry.submitted_revision = stored_revision;
            if let Some(record) = entry.record.as_mut() {
                record.mark_dirty();
            }
            let resave = entry.state == EntryState::Saving;
            tracing::warn!(
                player_id = %player_id,
                revision,
                base_revision,
                stored_revision,
                current,
                "Stored record moved; rebasing on the stored revision"
            );
            if resave && let Err(err) = self.submit_save(player_id, true) {
                tracing::debug!(player_id = %player_id, error = %err, "Rebased final save deferred");
            }
            return;
        }

        entry.write_fenced = true;
        entry.durability_lost = true;
        if let Some(record) = entry.record.as_mut() {
            record.clear_dirty();
        }
        self.record_failure(
            player_id,
            revision,
            FailureReason::Conflict { stored_revision },
        );
    }

    fn on_orphan_save(&mut self, completion: Completion, revision: u64) {
        match completion.outcome {
            Ok(_) => self.resolve_late_save(completion.player_id, revision),
            Err(StoreError::Conflict {
                stored_revision, ..
            }) => self.record_failure(
                completion.player_id,
                revision,
                FailureReason::Conflict { stored_revision },
            ),
            Err(err) => self.record_failure(
                completion.player_id,
                revision,
                FailureReason::Exhausted {
                    attempts: completion.attempts,
                    error: err.to_string(),
                },
            ),
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// End a SAVING session once nothing is left to wait for.
    fn maybe_finish(&mut self, player_id: PlayerId) {
        let Some(entry) = self.cache.entry(player_id) else {
            return;
        };
        let waiting_for_load = entry.load_op.is_some() && !self.shutting_down;
        if entry.state != EntryState::Saving
            || entry.saves_in_flight > 0
            || entry.final_save_deferred
            || entry.rejoin.is_some()
            || waiting_for_load
        {
            return;
        }
        let clean = !entry.durability_lost;
        self.finish(player_id, clean);
    }

    fn finish(&mut self, player_id: PlayerId, clean: bool) {
        let Some(entry) = self.cache.remove(player_id) else {
            return;
        };
        if self.shutting_down {
            if clean {
                self.tally.saved = self.tally.saved.saturating_add(1);
            } else {
                self.tally.failed = self.tally.failed.saturating_add(1);
            }
        }

        let revision = entry.record.as_ref().map_or(0, PlayerRecord::revision);
        if clean {
            tracing::info!(player_id = %player_id, revision, "Session ended; record saved");
        } else {
            tracing::warn!(player_id = %player_id, revision, "Session ended without a durable final save");
        }
        self.events.push(CoordinatorEvent::SessionEnded { player_id, clean });
    }

    fn record_failure(&mut self, player_id: PlayerId, revision: u64, reason: FailureReason) {
        tracing::warn!(
            player_id = %player_id,
            revision,
            reason = %reason,
            "Durability failure"
        );
        self.failures.push(DurabilityFailure {
            player_id,
            revision,
            reason,
            at: Utc::now(),
        });
    }

    /// A final save that outlived its session landed after all. Failures
    /// recorded for it because the wait ran out no longer apply.
    fn resolve_late_save(&mut self, player_id: PlayerId, revision: u64) {
        let before = self.failures.len();
        self.failures.retain(|failure| {
            !(failure.player_id == player_id
                && failure.revision <= revision
                && matches!(
                    failure.reason,
                    FailureReason::GraceExpired | FailureReason::ShutdownTimeout
                ))
        });
        let resolved = before.saturating_sub(self.failures.len());
        tracing::info!(
            player_id = %player_id,
            revision,
            resolved,
            "Save acknowledged after the session ended"
        );
    }

    fn record_revision(&self, player_id: PlayerId) -> u64 {
        self.cache
            .entry(player_id)
            .and_then(CacheEntry::record)
            .map_or(0, PlayerRecord::revision)
    }

    fn require_active(&self, player_id: PlayerId) -> Result<(), CacheError> {
        let entry = self
            .cache
            .entry(player_id)
            .ok_or(CacheError::NotFound { player_id })?;
        if entry.state == EntryState::Active && entry.record.is_some() {
            Ok(())
        } else {
            Err(CacheError::NotReady {
                player_id,
                state: entry.state,
            })
        }
    }

    fn announce_level(&mut self, player_id: PlayerId, change: LevelChange) {
        tracing::info!(player_id = %player_id, from = change.from, to = change.to, "Level up");
        self.events.push(CoordinatorEvent::LevelUp {
            player_id,
            from: change.from,
            to: change.to,
        });
    }
}

impl<S: PlayerStore> TickHandler for Coordinator<S> {
    fn on_tick(&mut self, tick: u64) {
        self.process_tick(tick);
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::arithmetic_side_effects)]
mod tests {
    use rpgvault_db::MemoryStore;

    use super::*;
    use crate::bridge::build_worker_runtime;
    use crate::config::BridgeConfig;
    use crate::retry::RetryPolicy;

    fn coordinator() -> Coordinator<MemoryStore> {
        let runtime = build_worker_runtime(1).unwrap();
        let bridge = Bridge::new(
            runtime,
            MemoryStore::new(),
            &BridgeConfig::default(),
            RetryPolicy::no_retry(),
        );
        Coordinator::new(bridge, LifecycleConfig::default())
    }

    fn pump_until(
        coord: &mut Coordinator<MemoryStore>,
        done: impl Fn(&Coordinator<MemoryStore>) -> bool,
    ) {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut tick = 0;
        while !done(coord) && Instant::now() < deadline {
            tick += 1;
            coord.on_tick(tick);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn unknown_player_is_offline() {
        let coord = coordinator();
        assert_eq!(coord.player_data(PlayerId::new()), PlayerDataView::Offline);
    }

    #[test]
    fn join_is_not_ready_until_loaded() {
        let mut coord = coordinator();
        let id = PlayerId::new();
        coord.join(id, SessionId::new(), "Steve");
        assert!(matches!(
            coord.add_currency(id, 10),
            Err(CoordinatorError::Cache(CacheError::NotReady { .. }))
        ));

        pump_until(&mut coord, |c| c.player_data(id).ready().is_some());
        let record = coord.player_data(id).ready().unwrap();
        assert_eq!(record.data().name, "Steve");
        assert_eq!(record.data().level(), 1);

        let events = coord.drain_events();
        assert!(events.contains(&CoordinatorEvent::PlayerReady {
            player_id: id,
            session: coord.cache().entry(id).unwrap().session(),
            created: true,
        }));
    }

    #[test]
    fn experience_raises_level_events() {
        let mut coord = coordinator();
        let id = PlayerId::new();
        coord.join(id, SessionId::new(), "Alex");
        pump_until(&mut coord, |c| c.player_data(id).ready().is_some());
        coord.drain_events();

        let changes = coord.add_experience(id, 100).unwrap();
        assert_eq!(changes, vec![LevelChange { from: 1, to: 2 }]);
        assert_eq!(
            coord.drain_events(),
            vec![CoordinatorEvent::LevelUp {
                player_id: id,
                from: 1,
                to: 2
            }]
        );
        assert!(coord.add_experience(id, 0).unwrap().is_empty());
    }

    #[test]
    fn leave_of_unknown_player_is_ignored() {
        let mut coord = coordinator();
        coord.leave(PlayerId::new(), LeaveReason::Quit);
        assert!(coord.drain_events().is_empty());
        assert!(coord.cache().is_empty());
    }

    #[test]
    fn join_after_shutdown_is_ignored() {
        let mut coord = coordinator();
        let report = coord.shutdown(Duration::from_millis(100));
        assert!(report.is_clean());
        coord.join(PlayerId::new(), SessionId::new(), "Late");
        assert!(coord.cache().is_empty());
    }

    #[test]
    fn failure_reason_display() {
        let reason = FailureReason::Conflict { stored_revision: 7 };
        assert_eq!(reason.to_string(), "conflict with stored revision 7");
        assert_eq!(
            FailureReason::GraceExpired.to_string(),
            "leave grace period expired"
        );
    }
}
