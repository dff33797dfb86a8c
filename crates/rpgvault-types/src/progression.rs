//! Level, experience, currency, and stat rules.
//!
//! The experience curve is `floor(100 * L^1.5)` XP to advance from level `L`
//! to `L + 1`, computed exactly in integers as `isqrt(10000 * L^3)`. Levels
//! run from [`MIN_LEVEL`] to [`MAX_LEVEL`]; at the cap, experience is
//! discarded.
//!
//! These functions operate on a [`PlayerData`] so they can be called from
//! inside [`PlayerRecord::mutate`](crate::PlayerRecord::mutate) or
//! [`PlayerRecord::try_mutate`](crate::PlayerRecord::try_mutate).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::enums::Stat;
use crate::error::RecordError;
use crate::record::{PlayerData, keys};

/// Lowest attainable level.
pub const MIN_LEVEL: u32 = 1;

/// Highest attainable level.
pub const MAX_LEVEL: u32 = 100;

/// A single level transition produced by a progression change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelChange {
    /// Level before the change.
    pub from: u32,
    /// Level after the change.
    pub to: u32,
}

/// XP required to advance from `level` to `level + 1`.
///
/// Returns `None` at or above [`MAX_LEVEL`].
pub fn xp_for_next_level(level: u32) -> Option<u64> {
    if level >= MAX_LEVEL {
        return None;
    }
    let level = u64::from(level.max(MIN_LEVEL));
    level
        .checked_pow(3)
        .and_then(|cube| cube.checked_mul(10_000))
        .map(u64::isqrt)
}

/// Add `amount` experience, levelling up as many times as it covers.
///
/// Remaining XP carries over into the next level. Returns every level
/// transition in order (empty when no level was gained). An `amount` of zero
/// is ignored. At [`MAX_LEVEL`] stored experience is reset to zero.
pub fn add_experience(data: &mut PlayerData, amount: u64) -> Vec<LevelChange> {
    let mut changes = Vec::new();
    if amount == 0 {
        return changes;
    }

    let mut level = data.level().min(MAX_LEVEL);
    let mut xp = data.experience().saturating_add(amount);

    while let Some(needed) = xp_for_next_level(level) {
        if xp < needed {
            break;
        }
        xp = xp.saturating_sub(needed);
        let next = level.saturating_add(1);
        changes.push(LevelChange {
            from: level,
            to: next,
        });
        level = next;
    }

    if level >= MAX_LEVEL {
        xp = 0;
    }

    data.set_integer(keys::LEVEL, i64::from(level));
    data.set_integer(keys::EXPERIENCE, i64::try_from(xp).unwrap_or(i64::MAX));
    changes
}

/// Set the level directly, clamped into `[MIN_LEVEL, MAX_LEVEL]`.
///
/// Experience towards the next level is reset. Returns the transition when
/// the level actually changed.
pub fn set_level(data: &mut PlayerData, level: u32) -> Option<LevelChange> {
    let from = data.level();
    let to = level.clamp(MIN_LEVEL, MAX_LEVEL);
    data.set_integer(keys::LEVEL, i64::from(to));
    data.set_integer(keys::EXPERIENCE, 0);
    (from != to).then_some(LevelChange { from, to })
}

/// Apply a signed currency change and return the new balance.
///
/// Fails without changing anything if the balance would go negative or
/// overflow.
pub fn add_currency(data: &mut PlayerData, delta: i64) -> Result<i64, RecordError> {
    let balance = data.currency();
    let updated = balance
        .checked_add(delta)
        .ok_or_else(|| RecordError::ArithmeticOverflow {
            context: format!("currency {balance} + {delta}"),
        })?;
    if updated < 0 {
        return Err(RecordError::InsufficientCurrency { balance, delta });
    }
    data.set_integer(keys::CURRENCY, updated);
    Ok(updated)
}

/// Overwrite the base value of `stat`.
pub fn set_stat(data: &mut PlayerData, stat: Stat, value: Decimal) {
    data.stats.insert(stat, value);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn data() -> PlayerData {
        PlayerData::new_default("Steve", Utc::now())
    }

    #[test]
    fn xp_curve_values() {
        assert_eq!(xp_for_next_level(1), Some(100));
        assert_eq!(xp_for_next_level(2), Some(282));
        assert_eq!(xp_for_next_level(4), Some(800));
        assert_eq!(xp_for_next_level(99), Some(98_503));
        assert_eq!(xp_for_next_level(MAX_LEVEL), None);
    }

    #[test]
    fn zero_experience_is_ignored() {
        let mut d = data();
        assert!(add_experience(&mut d, 0).is_empty());
        assert_eq!(d.experience(), 0);
    }

    #[test]
    fn experience_carries_over_multiple_levels() {
        let mut d = data();
        // 100 (1->2) + 282 (2->3) + 18 left over
        let changes = add_experience(&mut d, 400);
        assert_eq!(
            changes,
            vec![
                LevelChange { from: 1, to: 2 },
                LevelChange { from: 2, to: 3 },
            ]
        );
        assert_eq!(d.level(), 3);
        assert_eq!(d.experience(), 18);
    }

    #[test]
    fn experience_below_threshold_accumulates() {
        let mut d = data();
        assert!(add_experience(&mut d, 60).is_empty());
        assert!(add_experience(&mut d, 30).is_empty());
        assert_eq!(d.experience(), 90);
        assert_eq!(add_experience(&mut d, 10).len(), 1);
        assert_eq!(d.experience(), 0);
    }

    #[test]
    fn max_level_discards_experience() {
        let mut d = data();
        set_level(&mut d, MAX_LEVEL);
        assert!(add_experience(&mut d, 1_000_000).is_empty());
        assert_eq!(d.level(), MAX_LEVEL);
        assert_eq!(d.experience(), 0);
    }

    #[test]
    fn set_level_clamps() {
        let mut d = data();
        assert_eq!(set_level(&mut d, 0), None);
        assert_eq!(d.level(), MIN_LEVEL);
        assert_eq!(
            set_level(&mut d, 500),
            Some(LevelChange {
                from: 1,
                to: MAX_LEVEL
            })
        );
    }

    #[test]
    fn currency_never_goes_negative() {
        let mut d = data();
        assert_eq!(add_currency(&mut d, 100).unwrap(), 100);
        let err = add_currency(&mut d, -150).unwrap_err();
        assert_eq!(
            err,
            RecordError::InsufficientCurrency {
                balance: 100,
                delta: -150
            }
        );
        assert_eq!(d.currency(), 100);
        assert_eq!(add_currency(&mut d, -100).unwrap(), 0);
    }

    #[test]
    fn currency_overflow_rejected() {
        let mut d = data();
        add_currency(&mut d, i64::MAX).unwrap();
        assert!(matches!(
            add_currency(&mut d, 1),
            Err(RecordError::ArithmeticOverflow { .. })
        ));
    }

    #[test]
    fn set_stat_overwrites() {
        let mut d = data();
        set_stat(&mut d, Stat::Luck, Decimal::from(25));
        assert_eq!(d.stat(Stat::Luck), Decimal::from(25));
    }
}
