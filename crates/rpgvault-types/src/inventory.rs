//! Inventory and equipment held by a player.
//!
//! Items are kept as stacks keyed by item key with a `u32` quantity. The
//! number of distinct stacks is bounded by [`MAX_STACKS`]. Equipment maps a
//! slot to the key of the item occupying it; equipping moves one unit out of
//! the bag and unequipping moves it back.
//!
//! Every operation uses checked arithmetic and either applies completely or
//! leaves the inventory untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::enums::EquipmentSlot;
use crate::error::RecordError;

/// Maximum number of distinct item stacks a player can carry.
pub const MAX_STACKS: usize = 64;

/// A player's bag and equipped items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    /// Item key -> quantity. Keys with quantity zero are never stored.
    #[serde(default)]
    items: BTreeMap<String, u32>,
    /// Slot -> equipped item key.
    #[serde(default)]
    equipment: BTreeMap<EquipmentSlot, String>,
}

impl Inventory {
    /// Create an empty inventory.
    pub const fn new() -> Self {
        Self {
            items: BTreeMap::new(),
            equipment: BTreeMap::new(),
        }
    }

    /// All item stacks in the bag.
    pub const fn items(&self) -> &BTreeMap<String, u32> {
        &self.items
    }

    /// All equipped items.
    pub const fn equipment(&self) -> &BTreeMap<EquipmentSlot, String> {
        &self.equipment
    }

    /// Quantity of `item` in the bag (0 when absent).
    pub fn quantity(&self, item: &str) -> u32 {
        self.items.get(item).copied().unwrap_or(0)
    }

    /// Item equipped in `slot`, if any.
    pub fn equipped(&self, slot: EquipmentSlot) -> Option<&str> {
        self.equipment.get(&slot).map(String::as_str)
    }

    /// Add `amount` units of `item` to the bag.
    ///
    /// Fails on a zero amount, when a new stack would exceed [`MAX_STACKS`],
    /// or when the stack quantity would overflow.
    pub fn add_item(&mut self, item: &str, amount: u32) -> Result<(), RecordError> {
        if amount == 0 {
            return Err(RecordError::InvalidQuantity {
                item: item.to_owned(),
            });
        }

        let current = self.items.get(item).copied();
        if current.is_none() && self.items.len() >= MAX_STACKS {
            return Err(RecordError::InventoryFull {
                capacity: MAX_STACKS,
            });
        }

        let updated = current
            .unwrap_or(0)
            .checked_add(amount)
            .ok_or_else(|| RecordError::QuantityOverflow {
                item: item.to_owned(),
            })?;
        self.items.insert(item.to_owned(), updated);
        Ok(())
    }

    /// Remove `amount` units of `item` from the bag.
    ///
    /// Removes the stack entirely when the quantity reaches zero.
    pub fn remove_item(&mut self, item: &str, amount: u32) -> Result<(), RecordError> {
        if amount == 0 {
            return Err(RecordError::InvalidQuantity {
                item: item.to_owned(),
            });
        }

        let available = self.quantity(item);
        let remaining = available
            .checked_sub(amount)
            .ok_or_else(|| RecordError::InsufficientItems {
                item: item.to_owned(),
                requested: amount,
                available,
            })?;

        if remaining == 0 {
            self.items.remove(item);
        } else {
            self.items.insert(item.to_owned(), remaining);
        }
        Ok(())
    }

    /// Equip one unit of `item` from the bag into `slot`.
    ///
    /// Whatever previously occupied the slot goes back into the bag and is
    /// returned. On failure the inventory is unchanged.
    pub fn equip(&mut self, slot: EquipmentSlot, item: &str) -> Result<Option<String>, RecordError> {
        let mut next = self.clone();
        next.remove_item(item, 1)?;
        let previous = next.equipment.insert(slot, item.to_owned());
        if let Some(ref prev) = previous {
            next.add_item(prev, 1)?;
        }
        *self = next;
        Ok(previous)
    }

    /// Move the item in `slot` back into the bag and return its key.
    ///
    /// Returns `Ok(None)` when the slot is empty. On failure (bag full) the
    /// item stays equipped.
    pub fn unequip(&mut self, slot: EquipmentSlot) -> Result<Option<String>, RecordError> {
        let Some(item) = self.equipment.get(&slot).cloned() else {
            return Ok(None);
        };
        self.add_item(&item, 1)?;
        self.equipment.remove(&slot);
        Ok(Some(item))
    }
}
