//! Error types for record-level mutations.
//!
//! Gameplay mutations on a [`PlayerData`](crate::PlayerData) never panic;
//! anything that would overflow, underflow, or break an inventory limit is
//! reported through [`RecordError`] and the mutation is not committed.

/// Errors that can occur while mutating player data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// A quantity of zero was passed where a positive amount is required.
    #[error("invalid quantity 0 for item {item}")]
    InvalidQuantity {
        /// The item key.
        item: String,
    },

    /// Attempted to remove more of an item than the inventory holds.
    #[error("insufficient items: wanted {requested} of {item} but only have {available}")]
    InsufficientItems {
        /// The item key.
        item: String,
        /// The quantity the caller attempted to remove.
        requested: u32,
        /// The quantity actually held.
        available: u32,
    },

    /// Adding a new item stack would exceed the stack limit.
    #[error("inventory full: {capacity} distinct stacks already held")]
    InventoryFull {
        /// The maximum number of distinct stacks.
        capacity: usize,
    },

    /// A stack quantity would overflow `u32`.
    #[error("quantity overflow for item {item}")]
    QuantityOverflow {
        /// The item key.
        item: String,
    },

    /// A currency change would take the balance below zero.
    #[error("insufficient currency: balance {balance}, change {delta}")]
    InsufficientCurrency {
        /// Balance before the change.
        balance: i64,
        /// The attempted change.
        delta: i64,
    },

    /// An arithmetic overflow occurred.
    #[error("arithmetic overflow: {context}")]
    ArithmeticOverflow {
        /// Description of what was being computed.
        context: String,
    },
}
