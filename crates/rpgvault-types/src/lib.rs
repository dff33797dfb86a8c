//! Shared player-record types for the rpgvault persistence bridge.
//!
//! This crate owns the data model that flows between the tick thread, the
//! worker pool, and the durable store. It performs no I/O.
//!
//! # Modules
//!
//! - [`ids`] -- Type-safe UUID wrappers for player and session identifiers
//! - [`enums`] -- Core stats and equipment slots
//! - [`inventory`] -- Item stacks and equipped items
//! - [`record`] -- `PlayerRecord`, `PlayerData`, and `RecordSnapshot`
//! - [`progression`] -- Experience curve, levels, currency, and stat rules
//! - [`error`] -- Errors raised by record mutations

pub mod enums;
pub mod error;
pub mod ids;
pub mod inventory;
pub mod progression;
pub mod record;

// Re-export all public types at crate root for convenience.
pub use enums::{EquipmentSlot, Stat, UnknownStat};
pub use error::RecordError;
pub use ids::{PlayerId, SessionId};
pub use inventory::{Inventory, MAX_STACKS};
pub use progression::{LevelChange, MAX_LEVEL, MIN_LEVEL};
pub use record::{AttributeValue, PlayerData, PlayerRecord, RecordSnapshot, keys};
