//! Join/leave/save lifecycle tests driving the coordinator on a plain thread.
//!
//! The store is an in-memory [`MemoryStore`] wrapped with injectable
//! latency and failures, plus a journal of the calls it received.

#![allow(
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    clippy::arithmetic_side_effects,
    clippy::indexing_slicing
)]

use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use rpgvault_core::bridge::build_worker_runtime;
use rpgvault_core::config::{BridgeConfig, LifecycleConfig};
use rpgvault_core::{
    Bridge, BridgeError, Coordinator, CoordinatorError, CoordinatorEvent, FailureReason,
    HostEvent, LeaveReason, PlayerDataView, RetryPolicy, ShutdownReport, TickHandler,
};
use rpgvault_db::{MemoryStore, PlayerStore, SaveAck, StoreError};
use rpgvault_types::{PlayerId, PlayerRecord, RecordSnapshot, SessionId, keys};

// =============================================================================
// Fault-injecting store
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Load,
    Create,
    SaveDone { revision: u64 },
}

#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    load_delay_ms: AtomicU64,
    save_delay_ms: AtomicU64,
    failing_loads: AtomicU32,
    failing_saves: AtomicU32,
    /// Saves that commit and then report a timeout anyway.
    timeouts_after_commit: AtomicU32,
    active_saves: AtomicUsize,
    max_active_saves: AtomicUsize,
    journal: Mutex<Vec<Call>>,
}

impl FaultyStore {
    fn note(&self, call: Call) {
        self.journal.lock().unwrap().push(call);
    }

    fn journal(&self) -> Vec<Call> {
        self.journal.lock().unwrap().clone()
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

fn injected() -> StoreError {
    StoreError::Transient {
        message: String::from("injected failure"),
    }
}

impl PlayerStore for FaultyStore {
    async fn load(&self, player_id: PlayerId) -> Result<Option<PlayerRecord>, StoreError> {
        self.note(Call::Load);
        let delay = self.load_delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        if take_one(&self.failing_loads) {
            return Err(injected());
        }
        self.inner.load(player_id).await
    }

    async fn save(&self, snapshot: &RecordSnapshot) -> Result<SaveAck, StoreError> {
        let active = self.active_saves.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active_saves.fetch_max(active, Ordering::SeqCst);

        let delay = self.save_delay_ms.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        let result = if take_one(&self.failing_saves) {
            Err(injected())
        } else {
            self.inner.save(snapshot).await
        };

        self.active_saves.fetch_sub(1, Ordering::SeqCst);
        if result.is_ok() {
            self.note(Call::SaveDone {
                revision: snapshot.revision,
            });
            if take_one(&self.timeouts_after_commit) {
                return Err(StoreError::Timeout { elapsed_ms: delay });
            }
        }
        result
    }

    async fn create_default(
        &self,
        player_id: PlayerId,
        name: &str,
    ) -> Result<PlayerRecord, StoreError> {
        self.note(Call::Create);
        self.inner.create_default(player_id, name).await
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    coord: Coordinator<FaultyStore>,
    tick: u64,
    events: Vec<CoordinatorEvent>,
}

fn lifecycle() -> LifecycleConfig {
    LifecycleConfig {
        autosave_interval_ticks: 0,
        leave_grace_ms: 2_000,
        shutdown_timeout_ms: 2_000,
    }
}

impl Harness {
    fn new(store: FaultyStore) -> Self {
        Self::with_lifecycle(store, lifecycle())
    }

    fn with_lifecycle(store: FaultyStore, lifecycle: LifecycleConfig) -> Self {
        let config = BridgeConfig {
            worker_threads: 2,
            ..BridgeConfig::default()
        };
        let runtime = build_worker_runtime(config.worker_threads).unwrap();
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let bridge = Bridge::new(runtime, store, &config, policy);
        Self {
            coord: Coordinator::new(bridge, lifecycle),
            tick: 0,
            events: Vec::new(),
        }
    }

    fn store(&self) -> &FaultyStore {
        self.coord.store()
    }

    /// Tick until `done` holds, collecting events. Returns whether it held.
    fn pump_until(&mut self, done: impl Fn(&Self) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if done(self) {
                return true;
            }
            self.tick += 1;
            self.coord.on_tick(self.tick);
            self.events.extend(self.coord.drain_events());
            std::thread::sleep(Duration::from_millis(2));
        }
        done(self)
    }

    fn join(&mut self, player_id: PlayerId) -> SessionId {
        let session = SessionId::new();
        self.coord.handle_event(HostEvent::Join {
            player_id,
            session,
            name: String::from("Steve"),
        });
        session
    }

    fn join_ready(&mut self, player_id: PlayerId) -> SessionId {
        let session = self.join(player_id);
        assert!(self.pump_until(|h| h.ready(player_id)));
        session
    }

    fn leave(&mut self, player_id: PlayerId) {
        self.coord.handle_event(HostEvent::Leave {
            player_id,
            reason: LeaveReason::Quit,
        });
        self.events.extend(self.coord.drain_events());
    }

    fn ready(&self, player_id: PlayerId) -> bool {
        self.coord.player_data(player_id).ready().is_some()
    }

    fn currency(&self, player_id: PlayerId) -> i64 {
        self.coord
            .player_data(player_id)
            .ready()
            .expect("player ready")
            .data()
            .currency()
    }

    fn stored_currency(&self, player_id: PlayerId) -> Option<i64> {
        self.store()
            .inner
            .stored(player_id)
            .map(|record| record.data().currency())
    }

    fn session_ended(&self, player_id: PlayerId) -> Option<bool> {
        self.events.iter().find_map(|event| match event {
            CoordinatorEvent::SessionEnded {
                player_id: id,
                clean,
            } if *id == player_id => Some(*clean),
            _ => None,
        })
    }

    fn saves_in_flight(&self, player_id: PlayerId) -> usize {
        self.coord
            .cache()
            .entry(player_id)
            .map_or(0, |entry| entry.saves_in_flight())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[test]
fn currency_survives_leave_and_rejoin() {
    let mut h = Harness::new(FaultyStore::default());
    let id = PlayerId::new();

    h.join_ready(id);
    assert!(h.events.iter().any(|e| matches!(
        e,
        CoordinatorEvent::PlayerReady { created: true, .. }
    )));
    assert_eq!(h.currency(id), 0);

    assert_eq!(h.coord.add_currency(id, 100).unwrap(), 100);
    h.leave(id);
    assert!(h.pump_until(|h| h.session_ended(id).is_some()));
    assert_eq!(h.session_ended(id), Some(true));
    assert_eq!(h.coord.player_data(id), PlayerDataView::Offline);
    assert_eq!(h.stored_currency(id), Some(100));

    h.events.clear();
    h.join_ready(id);
    assert_eq!(h.currency(id), 100);
    assert!(h.events.iter().any(|e| matches!(
        e,
        CoordinatorEvent::PlayerReady { created: false, .. }
    )));
}

#[test]
fn reconnect_during_save_loads_after_the_save() {
    let store = FaultyStore::default();
    store.save_delay_ms.store(80, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();

    h.join_ready(id);
    h.coord.add_currency(id, 100).unwrap();
    h.leave(id);
    let second = h.join(id);
    assert_eq!(h.coord.player_data(id), PlayerDataView::NotReady);

    assert!(h.pump_until(|h| h.ready(id)));
    assert_eq!(h.currency(id), 100);
    assert_eq!(h.coord.cache().entry(id).unwrap().session(), second);

    let journal = h.store().journal();
    let saved = journal
        .iter()
        .position(|c| matches!(c, Call::SaveDone { .. }))
        .expect("final save ran");
    let reload = journal
        .iter()
        .rposition(|c| *c == Call::Load)
        .expect("reload ran");
    assert!(reload > saved, "reload must follow the final save: {journal:?}");
}

#[test]
fn conflict_with_newer_stored_revision_is_not_overwritten() {
    let mut h = Harness::new(FaultyStore::default());
    let id = PlayerId::new();
    h.join_ready(id);

    for _ in 0..5 {
        h.store()
            .inner
            .external_write(id, |data| data.set_integer(keys::CURRENCY, 999));
    }
    assert_eq!(h.store().inner.stored_revision(id), Some(5));

    h.coord.add_currency(id, 10).unwrap();
    assert!(h.coord.request_save(id).unwrap().is_some());
    assert!(h.pump_until(|h| !h.coord.failures().is_empty()));

    let failure = &h.coord.failures()[0];
    assert_eq!(failure.player_id, id);
    assert_eq!(
        failure.reason,
        FailureReason::Conflict { stored_revision: 5 }
    );
    assert_eq!(h.store().inner.stored_revision(id), Some(5));
    assert_eq!(h.stored_currency(id), Some(999));

    // The fenced session keeps playing but is never written again.
    assert!(h.coord.cache().entry(id).unwrap().is_write_fenced());
    h.coord.add_currency(id, 1).unwrap();
    assert!(h.coord.request_save(id).unwrap().is_none());

    h.leave(id);
    assert_eq!(h.session_ended(id), Some(false));
    assert_eq!(h.stored_currency(id), Some(999));
}

#[test]
fn conflict_with_older_stored_revision_rebases() {
    let mut h = Harness::new(FaultyStore::default());
    let id = PlayerId::new();
    h.join_ready(id);

    h.store()
        .inner
        .external_write(id, |data| data.set_integer(keys::CURRENCY, 7));
    for _ in 0..3 {
        h.coord.add_currency(id, 50).unwrap();
    }
    let revision = h.coord.player_data(id).ready().unwrap().revision();
    assert_eq!(revision, 4);

    h.coord.request_save(id).unwrap();
    assert!(h.pump_until(|h| {
        h.saves_in_flight(id) == 0 && h.coord.cache().get(id).is_some_and(PlayerRecord::is_dirty)
    }));
    assert_eq!(h.coord.cache().entry(id).unwrap().submitted_revision(), 1);

    h.coord.request_save(id).unwrap();
    assert!(h.pump_until(|h| h.store().inner.stored_revision(id) == Some(revision)));
    assert_eq!(h.stored_currency(id), Some(150));
    assert!(h.coord.failures().is_empty());
}

#[test]
fn save_retried_after_a_lost_acknowledgement_is_not_a_conflict() {
    let store = FaultyStore::default();
    store.timeouts_after_commit.store(1, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();
    h.join_ready(id);

    h.coord.add_currency(id, 60).unwrap();
    h.coord.add_currency(id, 40).unwrap();
    let revision = h.coord.player_data(id).ready().unwrap().revision();
    assert!(h.coord.request_save(id).unwrap().is_some());
    assert!(h.pump_until(|h| h.coord.is_idle()));

    assert!(h.coord.failures().is_empty(), "{:?}", h.coord.failures());
    let entry = h.coord.cache().entry(id).unwrap();
    assert!(!entry.is_write_fenced());
    assert_eq!(entry.persisted_revision(), Some(revision));
    assert_eq!(h.store().inner.stored_revision(id), Some(revision));

    // Later progress is still saved.
    h.coord.add_currency(id, 50).unwrap();
    assert!(h.coord.request_save(id).unwrap().is_some());
    h.leave(id);
    assert!(h.pump_until(|h| h.session_ended(id).is_some()));
    assert_eq!(h.session_ended(id), Some(true));
    assert_eq!(h.stored_currency(id), Some(150));
}

#[test]
fn saves_for_one_player_never_overlap() {
    let store = FaultyStore::default();
    store.save_delay_ms.store(100, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();
    h.join_ready(id);

    h.coord.add_currency(id, 1).unwrap();
    assert!(h.coord.request_save(id).unwrap().is_some());
    h.coord.add_currency(id, 1).unwrap();
    assert!(h.coord.request_save(id).unwrap().is_some());
    h.coord.add_currency(id, 1).unwrap();

    let err = h.coord.request_save(id).unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Bridge(BridgeError::Busy { queued: 2, .. })
    ));
    assert!(h.coord.cache().get(id).unwrap().is_dirty());

    assert!(h.pump_until(|h| h.coord.is_idle()));
    assert_eq!(h.store().max_active_saves.load(Ordering::SeqCst), 1);

    h.coord.request_save(id).unwrap();
    assert!(h.pump_until(|h| h.coord.is_idle()));
    assert_eq!(h.stored_currency(id), Some(3));
}

#[test]
fn mutation_during_save_is_not_lost() {
    let store = FaultyStore::default();
    store.save_delay_ms.store(60, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();
    h.join_ready(id);

    h.coord.add_currency(id, 1).unwrap();
    h.coord.request_save(id).unwrap();
    h.coord.add_currency(id, 5).unwrap();

    assert!(h.pump_until(|h| h.saves_in_flight(id) == 0));
    assert_eq!(h.stored_currency(id), Some(1));
    assert!(h.coord.cache().get(id).unwrap().is_dirty());

    h.coord.request_save(id).unwrap();
    assert!(h.pump_until(|h| h.coord.is_idle()));
    assert_eq!(h.stored_currency(id), Some(6));
    assert!(!h.coord.cache().get(id).unwrap().is_dirty());
}

#[test]
fn autosave_sweep_persists_dirty_records() {
    let config = LifecycleConfig {
        autosave_interval_ticks: 3,
        ..lifecycle()
    };
    let mut h = Harness::with_lifecycle(FaultyStore::default(), config);
    let id = PlayerId::new();
    h.join_ready(id);

    h.coord.add_currency(id, 42).unwrap();
    assert!(h.pump_until(|h| h.stored_currency(id) == Some(42)));
    assert!(h.pump_until(|h| h.coord.is_idle()));
    assert!(!h.coord.cache().get(id).unwrap().is_dirty());
}

#[test]
fn leave_with_a_full_queue_retries_the_final_save() {
    let store = FaultyStore::default();
    store.save_delay_ms.store(60, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();
    h.join_ready(id);

    h.coord.add_currency(id, 1).unwrap();
    h.coord.request_save(id).unwrap();
    h.coord.add_currency(id, 1).unwrap();
    h.coord.request_save(id).unwrap();
    h.coord.add_currency(id, 1).unwrap();

    // Both queue slots are taken, so the final save cannot be queued yet.
    h.leave(id);
    assert_eq!(h.saves_in_flight(id), 2);
    assert_eq!(h.session_ended(id), None);

    assert!(h.pump_until(|h| h.session_ended(id).is_some()));
    assert_eq!(h.session_ended(id), Some(true));
    assert_eq!(h.stored_currency(id), Some(3));
    assert_eq!(h.store().max_active_saves.load(Ordering::SeqCst), 1);
    let saves = h
        .store()
        .journal()
        .iter()
        .filter(|c| matches!(c, Call::SaveDone { .. }))
        .count();
    assert_eq!(saves, 3);
    assert!(h.coord.failures().is_empty());
}

#[test]
fn rejoin_after_a_failed_final_save_keeps_the_newer_record() {
    let store = FaultyStore::default();
    store.save_delay_ms.store(30, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();
    h.join_ready(id);

    h.coord.add_currency(id, 100).unwrap();
    h.store().failing_saves.store(3, Ordering::SeqCst);
    h.leave(id);
    let second = h.join(id);

    assert!(h.pump_until(|h| h.ready(id)));
    assert_eq!(h.coord.cache().entry(id).unwrap().session(), second);
    assert_eq!(h.currency(id), 100);
    assert_eq!(h.stored_currency(id), Some(0));
    assert!(matches!(
        h.coord.failures()[0].reason,
        FailureReason::Exhausted { attempts: 3, .. }
    ));
    assert_eq!(h.session_ended(id), None);

    // The kept record is still dirty and reaches the store on the next save.
    assert!(h.coord.cache().get(id).unwrap().is_dirty());
    assert!(h.coord.request_save(id).unwrap().is_some());
    assert!(h.pump_until(|h| h.stored_currency(id) == Some(100)));
}

#[test]
fn rejoin_before_a_discarded_load_arrives_gives_one_session() {
    let store = FaultyStore::default();
    store.load_delay_ms.store(60, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();

    h.join(id);
    h.leave(id);
    assert_eq!(h.session_ended(id), Some(true));
    let second = h.join(id);
    assert_eq!(h.coord.player_data(id), PlayerDataView::NotReady);

    assert!(h.pump_until(|h| h.ready(id)));
    assert!(h.pump_until(|h| h.coord.is_idle()));
    assert_eq!(h.coord.cache().len(), 1);
    assert_eq!(h.coord.cache().entry(id).unwrap().session(), second);
    let ready: Vec<_> = h
        .events
        .iter()
        .filter(|e| matches!(e, CoordinatorEvent::PlayerReady { .. }))
        .collect();
    assert_eq!(
        ready,
        vec![&CoordinatorEvent::PlayerReady {
            player_id: id,
            session: second,
            created: true,
        }]
    );
    assert_eq!(h.store().journal(), vec![Call::Load, Call::Create]);
}

#[test]
fn leave_while_loading_discards_the_load() {
    let store = FaultyStore::default();
    store.load_delay_ms.store(80, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();

    h.join(id);
    assert_eq!(h.coord.player_data(id), PlayerDataView::NotReady);
    h.leave(id);
    assert_eq!(h.session_ended(id), Some(true));
    assert_eq!(h.coord.player_data(id), PlayerDataView::Offline);

    assert!(h.pump_until(|h| h.coord.is_idle() && h.coord.cache().is_empty()));
    assert_eq!(h.store().journal(), vec![Call::Load]);
    assert!(h.store().inner.is_empty());
}

#[test]
fn load_failure_gives_an_ephemeral_record() {
    let store = FaultyStore::default();
    store.failing_loads.store(10, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();

    h.join(id);
    assert!(h.pump_until(|h| h.ready(id)));
    assert!(h.events.iter().any(|e| matches!(
        e,
        CoordinatorEvent::LoadFailed { player_id, .. } if *player_id == id
    )));
    assert!(h.coord.cache().entry(id).unwrap().is_ephemeral());

    h.coord.add_currency(id, 5).unwrap();
    h.leave(id);
    assert_eq!(h.session_ended(id), Some(false));
    assert!(h.pump_until(|h| h.coord.is_idle()));
    assert!(h.store().inner.is_empty());
}

#[test]
fn exhausted_save_is_recorded_and_retried_later() {
    let store = FaultyStore::default();
    store.failing_saves.store(3, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();
    h.join_ready(id);

    h.coord.add_currency(id, 20).unwrap();
    h.coord.request_save(id).unwrap();
    assert!(h.pump_until(|h| !h.coord.failures().is_empty()));
    assert!(matches!(
        h.coord.failures()[0].reason,
        FailureReason::Exhausted { attempts: 3, .. }
    ));
    assert!(h.coord.cache().get(id).unwrap().is_dirty());
    assert_eq!(h.stored_currency(id), Some(0));

    h.coord.request_save(id).unwrap();
    assert!(h.pump_until(|h| h.stored_currency(id) == Some(20)));
}

#[test]
fn leave_grace_expiry_ends_the_session_uncleanly() {
    let store = FaultyStore::default();
    store.save_delay_ms.store(400, Ordering::SeqCst);
    let config = LifecycleConfig {
        leave_grace_ms: 30,
        ..lifecycle()
    };
    let mut h = Harness::with_lifecycle(store, config);
    let id = PlayerId::new();
    h.join_ready(id);

    h.coord.add_currency(id, 9).unwrap();
    h.leave(id);
    assert!(h.pump_until(|h| h.session_ended(id).is_some()));
    assert_eq!(h.session_ended(id), Some(false));
    assert!(
        h.coord
            .failures()
            .iter()
            .any(|f| f.reason == FailureReason::GraceExpired)
    );

    // The save itself still completes in the background, which clears the
    // failure again.
    assert!(h.pump_until(|h| h.coord.is_idle()));
    assert_eq!(h.stored_currency(id), Some(9));
    assert!(h.coord.failures().is_empty());
}

#[test]
fn shutdown_flushes_every_online_player() {
    let mut h = Harness::new(FaultyStore::default());
    let a = PlayerId::new();
    let b = PlayerId::new();
    h.join_ready(a);
    h.join_ready(b);
    h.coord.add_currency(a, 11).unwrap();
    h.coord.add_currency(b, 22).unwrap();

    h.coord.handle_event(HostEvent::Shutdown);
    let events = h.coord.drain_events();
    assert!(events.contains(&CoordinatorEvent::ShutdownComplete(ShutdownReport {
        saved: 2,
        failed: 0,
        unfinished: 0,
    })));
    assert_eq!(h.stored_currency(a), Some(11));
    assert_eq!(h.stored_currency(b), Some(22));
    assert!(h.coord.cache().is_empty());

    h.join(PlayerId::new());
    assert!(h.coord.cache().is_empty());
}

#[test]
fn shutdown_timeout_reports_unfinished_saves() {
    let store = FaultyStore::default();
    store.save_delay_ms.store(1_000, Ordering::SeqCst);
    let mut h = Harness::new(store);
    let id = PlayerId::new();
    h.join_ready(id);
    h.coord.add_currency(id, 1).unwrap();

    let report = h.coord.shutdown(Duration::from_millis(50));
    assert_eq!(report.unfinished, 1);
    assert!(!report.is_clean());
    assert!(
        h.coord
            .failures()
            .iter()
            .any(|f| f.player_id == id && f.reason == FailureReason::ShutdownTimeout)
    );
}
