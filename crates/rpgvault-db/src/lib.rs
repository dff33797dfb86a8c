//! Data layer for rpgvault: schema manager and storage gateway.
//!
//! The durable store is a local `SQLite` file. Every call in this crate is
//! I/O-bound and is only ever issued from the worker pool, never from the
//! tick thread.
//!
//! # Architecture
//!
//! ```text
//! Startup
//!     |
//!     +-- SqlitePool::connect --> ensure_schema (fatal on error)
//!
//! Worker pool
//!     |
//!     +-- PlayerStore::load / save / create_default
//!         |-- SqliteStore   (player_records table)
//!         +-- MemoryStore   (tests)
//! ```
//!
//! # Modules
//!
//! - [`sqlite`] -- `SQLite` connection pool and configuration
//! - [`schema`] -- Version marker and numbered migrations
//! - [`player_store`] -- The `PlayerStore` gateway trait and `SQLite` implementation
//! - [`memory_store`] -- In-memory gateway used by tests
//! - [`error`] -- Gateway, schema, and pool error types

pub mod error;
pub mod memory_store;
pub mod player_store;
pub mod schema;
pub mod sqlite;

// Re-export primary types for convenience.
pub use error::{DbError, SchemaError, StoreError};
pub use memory_store::MemoryStore;
pub use player_store::{PlayerStore, SaveAck, SqliteStore};
pub use schema::{SchemaReport, TARGET_VERSION, ensure_schema};
pub use sqlite::{SqliteConfig, SqlitePool};
