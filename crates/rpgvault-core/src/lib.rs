//! Tick-thread coordination for asynchronous player persistence.
//!
//! This crate connects a single-threaded game loop to the durable store
//! without ever blocking a tick: storage calls run on a bounded worker pool
//! and their outcomes come back as values drained at the start of each tick.
//!
//! # Modules
//!
//! - [`config`] -- Configuration loading from `rpgvault.yaml` into
//!   strongly-typed structs.
//! - [`retry`] -- Bounded exponential backoff and per-call timeouts.
//! - [`bridge`] -- Worker pool, per-player FIFO queues, and the completion
//!   channel.
//! - [`cache`] -- One authoritative in-memory record per online player.
//! - [`host`] -- Events and views exchanged with the host server.
//! - [`coordinator`] -- [`Coordinator`]: join, leave, autosave, and shutdown.
//!
//! [`Coordinator`]: coordinator::Coordinator

pub mod bridge;
pub mod cache;
pub mod config;
pub mod coordinator;
pub mod host;
pub mod retry;

pub use bridge::{Bridge, BridgeError, OperationId, build_worker_runtime};
pub use cache::{CacheError, EntryState, PlayerCache};
pub use config::{ConfigError, VaultConfig};
pub use coordinator::{Coordinator, CoordinatorError, DurabilityFailure, FailureReason};
pub use host::{
    CoordinatorEvent, HostEvent, LeaveReason, PlayerDataView, ShutdownReport, TickHandler,
};
pub use retry::RetryPolicy;
