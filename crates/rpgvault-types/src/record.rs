//! The player record and its save snapshot.
//!
//! A [`PlayerRecord`] is the authoritative in-memory copy of one online
//! player's data. Its payload, [`PlayerData`], can only be changed through
//! [`PlayerRecord::mutate`] or [`PlayerRecord::try_mutate`], both of which
//! bump the revision and set the dirty flag. This is what makes the
//! revision a reliable staleness detector: it strictly increases on every
//! committed mutation.
//!
//! A [`RecordSnapshot`] is the immutable copy handed to the storage layer.
//! It carries both the in-memory revision at submission time and the base
//! revision the session believes is durably stored, which lets the store
//! detect a stale write.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::enums::Stat;
use crate::ids::PlayerId;
use crate::inventory::Inventory;

/// Well-known attribute keys.
pub mod keys {
    /// Character level (integer, 1..=100).
    pub const LEVEL: &str = "level";
    /// Experience towards the next level (integer).
    pub const EXPERIENCE: &str = "experience";
    /// Currency balance (integer, never negative).
    pub const CURRENCY: &str = "currency";
    /// Current health (integer).
    pub const HEALTH: &str = "health";
    /// Current mana (integer).
    pub const MANA: &str = "mana";
}

/// Default health for a new character.
pub const DEFAULT_HEALTH: i64 = 100;

/// Default mana for a new character.
pub const DEFAULT_MANA: i64 = 50;

// ---------------------------------------------------------------------------
// Attribute values
// ---------------------------------------------------------------------------

/// A named attribute value.
///
/// Serialized with an explicit tag so that a decimal (which serializes as a
/// string) is never confused with text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// A whole number (levels, currency, experience).
    Integer(i64),
    /// A fixed-point number.
    Decimal(Decimal),
    /// Free-form text (titles, faction names).
    Text(String),
}

impl AttributeValue {
    /// Return the integer value, if this is an integer.
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Return the decimal value, if this is a decimal.
    pub const fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Self::Decimal(v) => Some(*v),
            _ => None,
        }
    }

    /// Return the text value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(v) => Some(v),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// PlayerData
// ---------------------------------------------------------------------------

/// The gameplay payload of a player record.
///
/// Everything a gameplay mutation may touch lives here. Identity and
/// bookkeeping (revision, dirty flag, save time) live on [`PlayerRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerData {
    /// Last known display name.
    pub name: String,
    /// Named attributes (see [`keys`]).
    pub attributes: BTreeMap<String, AttributeValue>,
    /// Base core stats.
    pub stats: BTreeMap<Stat, Decimal>,
    /// Bag and equipment.
    pub inventory: Inventory,
    /// When the player first joined.
    pub first_login: DateTime<Utc>,
    /// When the player most recently joined.
    pub last_login: DateTime<Utc>,
}

impl PlayerData {
    /// Build the data of a brand-new level 1 character.
    pub fn new_default(name: &str, now: DateTime<Utc>) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(keys::LEVEL.to_owned(), AttributeValue::Integer(1));
        attributes.insert(keys::EXPERIENCE.to_owned(), AttributeValue::Integer(0));
        attributes.insert(keys::CURRENCY.to_owned(), AttributeValue::Integer(0));
        attributes.insert(
            keys::HEALTH.to_owned(),
            AttributeValue::Integer(DEFAULT_HEALTH),
        );
        attributes.insert(keys::MANA.to_owned(), AttributeValue::Integer(DEFAULT_MANA));

        let stats = Stat::ALL
            .into_iter()
            .map(|stat| (stat, stat.default_value()))
            .collect();

        Self {
            name: name.to_owned(),
            attributes,
            stats,
            inventory: Inventory::new(),
            first_login: now,
            last_login: now,
        }
    }

    /// Fill in any stat missing from a stored record with its default.
    ///
    /// Records written by an older build may predate a stat.
    pub fn ensure_all_stats(&mut self) {
        for stat in Stat::ALL {
            self.stats.entry(stat).or_insert_with(|| stat.default_value());
        }
    }

    /// Integer attribute `key`, if present and an integer.
    pub fn integer(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(AttributeValue::as_integer)
    }

    /// Set integer attribute `key`.
    pub fn set_integer(&mut self, key: &str, value: i64) {
        self.attributes
            .insert(key.to_owned(), AttributeValue::Integer(value));
    }

    /// Text attribute `key`, if present and text.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(AttributeValue::as_text)
    }

    /// Set text attribute `key`.
    pub fn set_text(&mut self, key: &str, value: &str) {
        self.attributes
            .insert(key.to_owned(), AttributeValue::Text(value.to_owned()));
    }

    /// Current level, clamped into `u32` (1 when absent or invalid).
    pub fn level(&self) -> u32 {
        self.integer(keys::LEVEL)
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v >= 1)
            .unwrap_or(1)
    }

    /// Experience towards the next level (0 when absent or negative).
    pub fn experience(&self) -> u64 {
        self.integer(keys::EXPERIENCE)
            .and_then(|v| u64::try_from(v).ok())
            .unwrap_or(0)
    }

    /// Currency balance (0 when absent).
    pub fn currency(&self) -> i64 {
        self.integer(keys::CURRENCY).unwrap_or(0)
    }

    /// Base value of `stat`, falling back to its default.
    pub fn stat(&self, stat: Stat) -> Decimal {
        self.stats
            .get(&stat)
            .copied()
            .unwrap_or_else(|| stat.default_value())
    }
}

// ---------------------------------------------------------------------------
// PlayerRecord
// ---------------------------------------------------------------------------

/// The authoritative in-memory record of one player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerRecord {
    player_id: PlayerId,
    data: PlayerData,
    revision: u64,
    dirty: bool,
    last_saved_at: Option<DateTime<Utc>>,
}

impl PlayerRecord {
    /// Wrap fresh data at revision 0 (nothing stored yet, clean).
    pub const fn new(player_id: PlayerId, data: PlayerData) -> Self {
        Self {
            player_id,
            data,
            revision: 0,
            dirty: false,
            last_saved_at: None,
        }
    }

    /// Rebuild a record exactly as the durable store holds it.
    pub const fn from_stored(
        player_id: PlayerId,
        data: PlayerData,
        revision: u64,
        saved_at: DateTime<Utc>,
    ) -> Self {
        Self {
            player_id,
            data,
            revision,
            dirty: false,
            last_saved_at: Some(saved_at),
        }
    }

    /// The player this record belongs to.
    pub const fn player_id(&self) -> PlayerId {
        self.player_id
    }

    /// Read access to the gameplay payload.
    pub const fn data(&self) -> &PlayerData {
        &self.data
    }

    /// Current revision.
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Whether the record has mutations not yet submitted for save.
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// When the last acknowledged save happened.
    pub const fn last_saved_at(&self) -> Option<DateTime<Utc>> {
        self.last_saved_at
    }

    /// Apply a mutation to the payload.
    ///
    /// The revision is bumped and the record marked dirty.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut PlayerData) -> R) -> R {
        let out = f(&mut self.data);
        self.commit();
        out
    }

    /// Apply a fallible mutation.
    ///
    /// The closure works on a copy; only an `Ok` result is committed (and
    /// only then does the revision move). An `Err` leaves the record exactly
    /// as it was.
    pub fn try_mutate<R, E>(
        &mut self,
        f: impl FnOnce(&mut PlayerData) -> Result<R, E>,
    ) -> Result<R, E> {
        let mut working = self.data.clone();
        let out = f(&mut working)?;
        self.data = working;
        self.commit();
        Ok(out)
    }

    /// Set the dirty flag without changing the payload.
    ///
    /// Used to force a re-save, e.g. after a failed or rebased write.
    pub const fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Clear the dirty flag. Called when a snapshot is submitted for save.
    pub const fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    /// Record an acknowledged save.
    pub const fn record_saved(&mut self, at: DateTime<Utc>) {
        self.last_saved_at = Some(at);
    }

    /// Take an immutable snapshot for saving.
    ///
    /// `base_revision` is the revision the caller believes is durably
    /// stored. It is clamped so it never exceeds the record's own revision.
    pub fn snapshot(&self, base_revision: u64) -> RecordSnapshot {
        RecordSnapshot {
            player_id: self.player_id,
            data: self.data.clone(),
            revision: self.revision,
            base_revision: base_revision.min(self.revision),
            taken_at: Utc::now(),
        }
    }

    const fn commit(&mut self) {
        self.revision = self.revision.saturating_add(1);
        self.dirty = true;
    }
}

// ---------------------------------------------------------------------------
// RecordSnapshot
// ---------------------------------------------------------------------------

/// An immutable copy of a record taken at save-submission time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    /// The player the snapshot belongs to.
    pub player_id: PlayerId,
    /// Copy of the payload.
    pub data: PlayerData,
    /// In-memory revision at submission.
    pub revision: u64,
    /// Revision the session believes is durably stored.
    pub base_revision: u64,
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
}
