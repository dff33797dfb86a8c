//! Enumeration types for player records.
//!
//! The stat set and equipment slots are fixed by the game design; stored
//! records serialize them as `snake_case` strings so the JSON columns in the
//! durable store stay readable.

use core::fmt;
use core::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Core stats
// ---------------------------------------------------------------------------

/// A core character statistic.
///
/// Stats are base values owned by the player record. Derived combat values
/// (critical chance, damage reduction, ...) are computed by gameplay code
/// from these and are never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stat {
    // --- Offensive ---
    /// Increases physical damage and carrying capacity.
    Strength,
    /// Increases attack speed, critical hit chance, and evasion.
    Agility,
    /// Increases magical damage and spell effectiveness.
    Intelligence,

    // --- Defensive ---
    /// Reduces incoming physical damage.
    Defense,
    /// Increases maximum health.
    Vitality,
    /// Increases maximum mana and mana regeneration.
    Wisdom,

    // --- Other ---
    /// Influences rare drops and other random events.
    Luck,
    /// Affects detection range and accuracy.
    Perception,
}

impl Stat {
    /// Every stat, in declaration order.
    pub const ALL: [Self; 8] = [
        Self::Strength,
        Self::Agility,
        Self::Intelligence,
        Self::Defense,
        Self::Vitality,
        Self::Wisdom,
        Self::Luck,
        Self::Perception,
    ];

    /// Human-readable stat name.
    pub const fn display_name(self) -> &'static str {
        match self {
            Self::Strength => "Strength",
            Self::Agility => "Agility",
            Self::Intelligence => "Intelligence",
            Self::Defense => "Defense",
            Self::Vitality => "Vitality",
            Self::Wisdom => "Wisdom",
            Self::Luck => "Luck",
            Self::Perception => "Perception",
        }
    }

    /// Lowercase identifier used in commands and serialized records.
    pub const fn key(self) -> &'static str {
        match self {
            Self::Strength => "strength",
            Self::Agility => "agility",
            Self::Intelligence => "intelligence",
            Self::Defense => "defense",
            Self::Vitality => "vitality",
            Self::Wisdom => "wisdom",
            Self::Luck => "luck",
            Self::Perception => "perception",
        }
    }

    /// Base value a freshly created character starts with.
    ///
    /// Every stat starts at 10, except Vitality (12) and Wisdom (11).
    pub const fn default_value(self) -> Decimal {
        match self {
            Self::Vitality => Decimal::from_parts(12, 0, 0, false, 0),
            Self::Wisdom => Decimal::from_parts(11, 0, 0, false, 0),
            _ => Decimal::TEN,
        }
    }
}

impl fmt::Display for Stat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Error returned when a string does not name a [`Stat`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown stat: {0}")]
pub struct UnknownStat(pub String);

impl FromStr for Stat {
    type Err = UnknownStat;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|stat| stat.key() == wanted)
            .ok_or_else(|| UnknownStat(s.to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Equipment
// ---------------------------------------------------------------------------

/// A slot an item can be equipped into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EquipmentSlot {
    /// Helmets and hoods.
    Head,
    /// Body armor.
    Chest,
    /// Leg armor.
    Legs,
    /// Boots.
    Feet,
    /// Primary weapon or tool.
    MainHand,
    /// Shield, off-hand weapon, or talisman.
    OffHand,
}
