//! Async execution bridge between the tick thread and the storage workers.
//!
//! The bridge owns a dedicated multi-threaded tokio runtime that plays the
//! role of the worker pool. A semaphore with one permit per worker bounds
//! concurrent gateway calls (and therefore open database connections).
//!
//! # Protocol
//!
//! ```text
//! tick thread                         worker pool
//!   submit(player, payload) ----+
//!     per-player FIFO queue     |
//!     head dispatched --------->+--> acquire permit
//!                                    gateway call (timeout, retry)
//!   drain_completions() <------------ completion channel
//!     next queued op dispatched
//! ```
//!
//! Ordering is per player, not global: only the head of a player's queue is
//! ever running, and the next operation is dispatched when the head's
//! completion is drained on the tick thread. A queue holds at most
//! `per_player_queue_bound` operations (in flight plus pending); further
//! submissions fail with [`BridgeError::Busy`].
//!
//! Nothing here blocks the tick thread except [`Bridge::wait_for_completion`]
//! and [`Bridge::block_on`], which exist for startup and the shutdown flush.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rpgvault_db::{PlayerStore, SaveAck, StoreError};
use rpgvault_types::{PlayerId, PlayerRecord, RecordSnapshot};
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::config::BridgeConfig;
use crate::retry::{RetryPolicy, run_with_retry, with_timeout};

// =============================================================================
// Errors
// =============================================================================

/// Errors returned synchronously by [`Bridge::submit`].
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// The player's queue is full; the caller should coalesce or try later.
    #[error("player {player_id} already has {queued} queued storage operations")]
    Busy {
        /// The player whose queue is full.
        player_id: PlayerId,
        /// Operations currently queued for that player.
        queued: usize,
    },

    /// The bridge is shutting down and no longer accepts loads.
    #[error("bridge is shutting down")]
    ShuttingDown,

    /// The worker runtime could not be built.
    #[error("failed to build worker runtime: {source}")]
    Runtime {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },
}

// =============================================================================
// Operations
// =============================================================================

/// Handle identifying one submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl OperationId {
    /// The raw sequence number.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationPayload {
    /// Load the stored record.
    Load,
    /// Insert a default record for a new player.
    Create {
        /// Display name for the new record.
        name: String,
    },
    /// Persist an immutable snapshot.
    Save(Box<RecordSnapshot>),
}

impl OperationPayload {
    /// The kind of this payload.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Load => OperationKind::Load,
            Self::Create { .. } => OperationKind::Create,
            Self::Save(snapshot) => OperationKind::Save {
                revision: snapshot.revision,
                base_revision: snapshot.base_revision,
            },
        }
    }
}

/// Kind of an operation, as reported on its completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// A load.
    Load,
    /// A create-default.
    Create,
    /// A save of the snapshot at `revision`.
    Save {
        /// The snapshot's in-memory revision.
        revision: u64,
        /// The snapshot's base revision.
        base_revision: u64,
    },
}

impl OperationKind {
    /// Short label used in structured log fields.
    pub const fn label(self) -> &'static str {
        match self {
            Self::Load => "load",
            Self::Create => "create",
            Self::Save { .. } => "save",
        }
    }
}

/// A queued operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOperation {
    /// Completion handle.
    pub id: OperationId,
    /// Target player.
    pub player_id: PlayerId,
    /// What to do.
    pub payload: OperationPayload,
}

/// Successful result of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    /// Result of a load (`None` when the player has no stored row).
    Loaded(Option<PlayerRecord>),
    /// The row stored after a create-default.
    Created(PlayerRecord),
    /// A durable write acknowledgement.
    Saved(SaveAck),
}

/// Outcome of an operation, delivered on the tick thread.
#[derive(Debug)]
pub struct Completion {
    /// Handle returned by [`Bridge::submit`].
    pub op_id: OperationId,
    /// Target player.
    pub player_id: PlayerId,
    /// Kind of the operation.
    pub kind: OperationKind,
    /// Attempts made (1 when the first attempt succeeded).
    pub attempts: u32,
    /// Final result after retries.
    pub outcome: Result<OperationOutput, StoreError>,
}

#[derive(Debug, Default)]
struct PlayerQueue {
    in_flight: Option<OperationId>,
    pending: VecDeque<PendingOperation>,
}

impl PlayerQueue {
    fn len(&self) -> usize {
        self.pending.len().saturating_add(usize::from(self.in_flight.is_some()))
    }
}

// =============================================================================
// Bridge
// =============================================================================

/// Build the worker runtime with `worker_threads` threads.
///
/// The host uses the runtime for startup work (connect, schema) before
/// handing it to [`Bridge::new`].
///
/// # Errors
///
/// Returns [`BridgeError::Runtime`] if the runtime cannot be built.
pub fn build_worker_runtime(worker_threads: usize) -> Result<Runtime, BridgeError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads.max(1))
        .thread_name("rpgvault-worker")
        .enable_all()
        .build()?;
    Ok(runtime)
}

/// Worker pool plus submission and completion protocol.
pub struct Bridge<S: PlayerStore> {
    runtime: Runtime,
    store: Arc<S>,
    permits: Arc<Semaphore>,
    policy: RetryPolicy,
    operation_timeout: Duration,
    queue_bound: usize,
    cancel: CancellationToken,
    completions_tx: UnboundedSender<Completion>,
    completions_rx: UnboundedReceiver<Completion>,
    ready: VecDeque<Completion>,
    queues: HashMap<PlayerId, PlayerQueue>,
    next_op: u64,
    accepting_loads: bool,
}

impl<S: PlayerStore> Bridge<S> {
    /// Create a bridge that runs gateway calls against `store`.
    pub fn new(runtime: Runtime, store: S, config: &BridgeConfig, policy: RetryPolicy) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let workers = config.worker_threads.max(1);
        tracing::info!(
            workers,
            queue_bound = config.per_player_queue_bound,
            operation_timeout_ms = config.operation_timeout_ms,
            max_attempts = policy.max_attempts(),
            "Storage bridge ready"
        );
        Self {
            runtime,
            store: Arc::new(store),
            permits: Arc::new(Semaphore::new(workers)),
            policy,
            operation_timeout: config.operation_timeout(),
            queue_bound: config.per_player_queue_bound.max(1),
            cancel: CancellationToken::new(),
            completions_tx,
            completions_rx,
            ready: VecDeque::new(),
            queues: HashMap::new(),
            next_op: 0,
            accepting_loads: true,
        }
    }

    /// The store the workers call.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Submit an operation for `player_id`.
    ///
    /// The operation starts immediately when the player's queue is empty and
    /// otherwise waits behind the earlier ones.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Busy`] when the player's queue is full and
    /// [`BridgeError::ShuttingDown`] for loads and creates submitted after
    /// [`Bridge::begin_shutdown`].
    pub fn submit(
        &mut self,
        player_id: PlayerId,
        payload: OperationPayload,
    ) -> Result<OperationId, BridgeError> {
        if !self.accepting_loads && !matches!(payload, OperationPayload::Save(_)) {
            return Err(BridgeError::ShuttingDown);
        }

        let queued = self.queued_for(player_id);
        if queued >= self.queue_bound {
            return Err(BridgeError::Busy { player_id, queued });
        }

        self.next_op = self.next_op.saturating_add(1);
        let id = OperationId(self.next_op);
        let op = PendingOperation {
            id,
            player_id,
            payload,
        };

        tracing::debug!(
            player_id = %player_id,
            op = %id,
            kind = op.payload.kind().label(),
            queued,
            "Storage operation submitted"
        );

        let queue = self.queues.entry(player_id).or_default();
        if queue.in_flight.is_none() {
            queue.in_flight = Some(id);
            self.dispatch(op);
        } else {
            queue.pending.push_back(op);
        }
        Ok(id)
    }

    /// Operations queued for `player_id` (in flight plus pending).
    pub fn queued_for(&self, player_id: PlayerId) -> usize {
        self.queues.get(&player_id).map_or(0, PlayerQueue::len)
    }

    /// The operation currently running for `player_id`, if any.
    pub fn in_flight_for(&self, player_id: PlayerId) -> Option<OperationId> {
        self.queues.get(&player_id).and_then(|q| q.in_flight)
    }

    /// Whether no operation is queued for any player.
    pub fn is_idle(&self) -> bool {
        self.queues.is_empty() && self.ready.is_empty()
    }

    /// Take every completion that has arrived, without blocking.
    ///
    /// For each completion the player's next queued operation is dispatched.
    pub fn drain_completions(&mut self) -> Vec<Completion> {
        let mut drained: Vec<Completion> = self.ready.drain(..).collect();
        loop {
            match self.completions_rx.try_recv() {
                Ok(completion) => drained.push(completion),
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
        for completion in &drained {
            self.advance_queue(completion.player_id, completion.op_id);
        }
        drained
    }

    /// Block until at least one completion is available or `timeout` passes.
    ///
    /// Returns `true` when a completion is ready for
    /// [`Bridge::drain_completions`]. Only the shutdown flush calls this.
    pub fn wait_for_completion(&mut self, timeout: Duration) -> bool {
        if !self.ready.is_empty() {
            return true;
        }
        let received = self
            .runtime
            .block_on(tokio::time::timeout(timeout, self.completions_rx.recv()));
        match received {
            Ok(Some(completion)) => {
                self.ready.push_back(completion);
                true
            }
            Ok(None) | Err(_) => false,
        }
    }

    /// Stop accepting loads and cut short any load waiting in retry backoff.
    ///
    /// Saves are unaffected and always run to completion.
    pub fn begin_shutdown(&mut self) {
        if self.accepting_loads {
            self.accepting_loads = false;
            self.cancel.cancel();
            tracing::info!("Storage bridge no longer accepting loads");
        }
    }

    /// Run a future to completion on the worker runtime, blocking the caller.
    ///
    /// For startup and teardown only; never call from a tick.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    /// Shut the worker runtime down, waiting up to `timeout` for tasks.
    pub fn close(self, timeout: Duration) {
        let unfinished = self.queues.len();
        self.runtime.shutdown_timeout(timeout);
        tracing::info!(players_with_queued_ops = unfinished, "Storage bridge closed");
    }

    fn advance_queue(&mut self, player_id: PlayerId, completed: OperationId) {
        let Some(queue) = self.queues.get_mut(&player_id) else {
            return;
        };
        if queue.in_flight != Some(completed) {
            tracing::warn!(
                player_id = %player_id,
                op = %completed,
                "Completion does not match the in-flight operation"
            );
            return;
        }
        queue.in_flight = None;
        match queue.pending.pop_front() {
            Some(next) => {
                queue.in_flight = Some(next.id);
                self.dispatch(next);
            }
            None => {
                self.queues.remove(&player_id);
            }
        }
    }

    fn dispatch(&self, op: PendingOperation) {
        let store = Arc::clone(&self.store);
        let permits = Arc::clone(&self.permits);
        let tx = self.completions_tx.clone();
        let policy = self.policy;
        let timeout = self.operation_timeout;
        let cancel = self.cancel.clone();

        self.runtime.spawn(async move {
            let kind = op.payload.kind();
            let (attempts, outcome) = execute(
                store.as_ref(),
                permits.as_ref(),
                &policy,
                timeout,
                &cancel,
                op.player_id,
                &op.payload,
            )
            .await;

            if let Err(ref err) = outcome {
                tracing::warn!(
                    player_id = %op.player_id,
                    op = %op.id,
                    kind = kind.label(),
                    attempts,
                    error_kind = err.kind(),
                    error = %err,
                    "Storage operation failed"
                );
            }

            let completion = Completion {
                op_id: op.id,
                player_id: op.player_id,
                kind,
                attempts,
                outcome,
            };
            if tx.send(completion).is_err() {
                tracing::debug!(op = %op.id, "Bridge dropped before completion was delivered");
            }
        });
    }
}

/// Run one operation with a worker permit, timeout, and retry.
async fn execute<S: PlayerStore>(
    store: &S,
    permits: &Semaphore,
    policy: &RetryPolicy,
    timeout: Duration,
    cancel: &CancellationToken,
    player_id: PlayerId,
    payload: &OperationPayload,
) -> (u32, Result<OperationOutput, StoreError>) {
    match payload {
        OperationPayload::Load => {
            let (attempts, result) = run_with_retry(policy, Some(cancel), move || {
                guarded(permits, timeout, store.load(player_id))
            })
            .await;
            (attempts, result.map(OperationOutput::Loaded))
        }
        OperationPayload::Create { name } => {
            let name = name.as_str();
            let (attempts, result) = run_with_retry(policy, Some(cancel), move || {
                guarded(permits, timeout, store.create_default(player_id, name))
            })
            .await;
            (attempts, result.map(OperationOutput::Created))
        }
        OperationPayload::Save(snapshot) => {
            let snapshot: &RecordSnapshot = snapshot;
            let (attempts, result) = run_with_retry(policy, None, move || {
                guarded(permits, timeout, store.save(snapshot))
            })
            .await;
            (attempts, result.map(OperationOutput::Saved))
        }
    }
}

/// Hold a worker permit for the duration of one bounded gateway call.
async fn guarded<T>(
    permits: &Semaphore,
    timeout: Duration,
    call: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    let _permit = permits.acquire().await.map_err(|e| StoreError::Transient {
        message: format!("worker pool closed: {e}"),
    })?;
    with_timeout(timeout, call).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::arithmetic_side_effects)]
mod tests {
    use std::time::Instant;

    use chrono::Utc;
    use rpgvault_db::MemoryStore;
    use rpgvault_types::{PlayerData, keys};

    use super::*;

    fn bridge() -> Bridge<MemoryStore> {
        let config = BridgeConfig {
            worker_threads: 2,
            ..BridgeConfig::default()
        };
        let runtime = build_worker_runtime(2).unwrap();
        Bridge::new(runtime, MemoryStore::new(), &config, RetryPolicy::no_retry())
    }

    fn wait_all(bridge: &mut Bridge<MemoryStore>, expected: usize) -> Vec<Completion> {
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut out = Vec::new();
        while out.len() < expected && Instant::now() < deadline {
            bridge.wait_for_completion(Duration::from_millis(50));
            out.extend(bridge.drain_completions());
        }
        out
    }

    fn snapshot(id: PlayerId, currency: i64) -> OperationPayload {
        let mut record = PlayerRecord::new(id, PlayerData::new_default("Steve", Utc::now()));
        record.mutate(|d| d.set_integer(keys::CURRENCY, currency));
        OperationPayload::Save(Box::new(record.snapshot(0)))
    }

    #[test]
    fn load_of_unknown_player_completes_with_none() {
        let mut bridge = bridge();
        let id = PlayerId::new();
        let op = bridge.submit(id, OperationPayload::Load).unwrap();

        let done = wait_all(&mut bridge, 1);
        assert_eq!(done.len(), 1);
        let completion = done.into_iter().next().unwrap();
        assert_eq!(completion.op_id, op);
        assert_eq!(completion.attempts, 1);
        assert!(matches!(
            completion.outcome,
            Ok(OperationOutput::Loaded(None))
        ));
        assert!(bridge.is_idle());
    }

    #[test]
    fn queue_bound_rejects_third_operation() {
        let mut bridge = bridge();
        let id = PlayerId::new();
        bridge.submit(id, snapshot(id, 1)).unwrap();
        bridge.submit(id, OperationPayload::Load).unwrap();

        let err = bridge.submit(id, OperationPayload::Load).unwrap_err();
        assert!(matches!(err, BridgeError::Busy { queued: 2, .. }));

        // Other players are unaffected.
        assert!(bridge.submit(PlayerId::new(), OperationPayload::Load).is_ok());
        wait_all(&mut bridge, 3);
    }

    #[test]
    fn operations_for_one_player_complete_in_submission_order() {
        let mut bridge = bridge();
        let id = PlayerId::new();
        let save = bridge.submit(id, snapshot(id, 100)).unwrap();
        let load = bridge.submit(id, OperationPayload::Load).unwrap();
        assert_eq!(bridge.in_flight_for(id), Some(save));

        let done = wait_all(&mut bridge, 2);
        let order: Vec<OperationId> = done.iter().map(|c| c.op_id).collect();
        assert_eq!(order, vec![save, load]);

        let loaded = done.into_iter().nth(1).unwrap();
        match loaded.outcome {
            Ok(OperationOutput::Loaded(Some(record))) => {
                assert_eq!(record.data().currency(), 100);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn shutdown_rejects_loads_but_accepts_saves() {
        let mut bridge = bridge();
        bridge.begin_shutdown();
        let id = PlayerId::new();
        assert!(matches!(
            bridge.submit(id, OperationPayload::Load),
            Err(BridgeError::ShuttingDown)
        ));
        assert!(bridge.submit(id, snapshot(id, 5)).is_ok());
        assert_eq!(wait_all(&mut bridge, 1).len(), 1);
        assert_eq!(bridge.store().stored_revision(id), Some(1));
    }
}
