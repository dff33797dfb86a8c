//! Storage gateway for player records.
//!
//! [`PlayerStore`] is the narrow data-access surface the worker pool calls.
//! Each method is one bounded, transactional operation; none of them keeps a
//! reference to the record it was handed. [`SqliteStore`] is the production
//! implementation.
//!
//! # Revision check
//!
//! `save` only writes when the stored revision is not ahead of the
//! snapshot's `base_revision`:
//!
//! ```text
//! UPDATE ... WHERE player_id = ? AND revision <= base_revision
//!   1 row  -> written
//!   0 rows -> SELECT revision
//!               row exists -> Conflict { stored, base }
//!               no row     -> INSERT (first save of a new player)
//! ```

use std::future::Future;

use chrono::{DateTime, Utc};
use rpgvault_types::{PlayerData, PlayerId, PlayerRecord, RecordSnapshot};
use sqlx::SqlitePool as InnerPool;
use uuid::Uuid;

use crate::error::StoreError;
use crate::sqlite::SqlitePool;

/// Acknowledgement of a durable write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveAck {
    /// Revision now held by the durable store.
    pub revision: u64,
    /// When the write committed.
    pub saved_at: DateTime<Utc>,
}

/// Data-access operations on the durable player store.
///
/// Implementations must be safe to call from several worker tasks at once.
/// Calls for the same player are never issued concurrently by the bridge.
pub trait PlayerStore: Send + Sync + 'static {
    /// Load the stored record, or `None` if the player has never been saved.
    fn load(
        &self,
        player_id: PlayerId,
    ) -> impl Future<Output = Result<Option<PlayerRecord>, StoreError>> + Send;

    /// Persist a snapshot.
    ///
    /// Fails with [`StoreError::Conflict`] when the stored revision is ahead
    /// of `snapshot.base_revision`; the stored row is left untouched.
    fn save(
        &self,
        snapshot: &RecordSnapshot,
    ) -> impl Future<Output = Result<SaveAck, StoreError>> + Send;

    /// Insert a default record for a new player and return the stored row.
    ///
    /// If a row already exists it is returned unchanged.
    fn create_default(
        &self,
        player_id: PlayerId,
        name: &str,
    ) -> impl Future<Output = Result<PlayerRecord, StoreError>> + Send;
}

// =============================================================================
// SQLite implementation
// =============================================================================

/// [`PlayerStore`] backed by the `player_records` table.
#[derive(Clone)]
pub struct SqliteStore {
    pool: InnerPool,
}

impl SqliteStore {
    /// Create a store bound to a connection pool.
    ///
    /// The schema must already be current (see
    /// [`ensure_schema`](crate::schema::ensure_schema)).
    pub fn new(pool: &SqlitePool) -> Self {
        Self {
            pool: pool.pool().clone(),
        }
    }

    /// Return a reference to the underlying pool.
    pub const fn pool(&self) -> &InnerPool {
        &self.pool
    }
}

impl PlayerStore for SqliteStore {
    async fn load(&self, player_id: PlayerId) -> Result<Option<PlayerRecord>, StoreError> {
        let row: Option<PlayerRow> = sqlx::query_as(
            r"SELECT player_id, player_name, attributes, stats, inventory,
                     revision, first_login, last_login, saved_at
              FROM player_records
              WHERE player_id = ?",
        )
        .bind(player_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PlayerRow::into_record).transpose()
    }

    async fn save(&self, snapshot: &RecordSnapshot) -> Result<SaveAck, StoreError> {
        let columns = EncodedData::encode(&snapshot.data)?;
        let id = snapshot.player_id.to_string();
        let revision = to_db_revision(snapshot.revision)?;
        let base_revision = to_db_revision(snapshot.base_revision)?;
        let saved_at = Utc::now();

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r"UPDATE player_records SET
                player_name = ?, attributes = ?, stats = ?, inventory = ?,
                revision = ?, first_login = ?, last_login = ?, saved_at = ?
              WHERE player_id = ? AND revision <= ?",
        )
        .bind(&snapshot.data.name)
        .bind(&columns.attributes)
        .bind(&columns.stats)
        .bind(&columns.inventory)
        .bind(revision)
        .bind(snapshot.data.first_login)
        .bind(snapshot.data.last_login)
        .bind(saved_at)
        .bind(&id)
        .bind(base_revision)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let stored: Option<StoredVersion> = sqlx::query_as(
                r"SELECT revision, player_name, attributes, stats, inventory, saved_at
                  FROM player_records
                  WHERE player_id = ?",
            )
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(stored) = stored {
                // A retry of a save whose commit already landed.
                if stored.revision == revision && stored.matches(&snapshot.data.name, &columns) {
                    return Ok(SaveAck {
                        revision: snapshot.revision,
                        saved_at: stored.saved_at,
                    });
                }
                return Err(StoreError::Conflict {
                    stored_revision: from_db_revision(stored.revision)?,
                    base_revision: snapshot.base_revision,
                });
            }

            sqlx::query(
                r"INSERT INTO player_records
                  (player_id, player_name, attributes, stats, inventory,
                   revision, first_login, last_login, saved_at)
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(&snapshot.data.name)
            .bind(&columns.attributes)
            .bind(&columns.stats)
            .bind(&columns.inventory)
            .bind(revision)
            .bind(snapshot.data.first_login)
            .bind(snapshot.data.last_login)
            .bind(saved_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            player_id = %snapshot.player_id,
            revision = snapshot.revision,
            base_revision = snapshot.base_revision,
            "Saved player record"
        );

        Ok(SaveAck {
            revision: snapshot.revision,
            saved_at,
        })
    }

    async fn create_default(
        &self,
        player_id: PlayerId,
        name: &str,
    ) -> Result<PlayerRecord, StoreError> {
        let now = Utc::now();
        let data = PlayerData::new_default(name, now);
        let columns = EncodedData::encode(&data)?;
        let id = player_id.to_string();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r"INSERT INTO player_records
              (player_id, player_name, attributes, stats, inventory,
               revision, first_login, last_login, saved_at)
              VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?)
              ON CONFLICT (player_id) DO NOTHING",
        )
        .bind(&id)
        .bind(&data.name)
        .bind(&columns.attributes)
        .bind(&columns.stats)
        .bind(&columns.inventory)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row: PlayerRow = sqlx::query_as(
            r"SELECT player_id, player_name, attributes, stats, inventory,
                     revision, first_login, last_login, saved_at
              FROM player_records
              WHERE player_id = ?",
        )
        .bind(&id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        if inserted.rows_affected() == 0 {
            tracing::debug!(player_id = %player_id, "Default record already present");
        } else {
            tracing::info!(player_id = %player_id, name, "Created default player record");
        }

        row.into_record()
    }
}

// =============================================================================
// Row mapping
// =============================================================================

/// A row from the `player_records` table.
#[derive(Debug, Clone, sqlx::FromRow)]
struct PlayerRow {
    player_id: String,
    player_name: String,
    attributes: String,
    stats: String,
    inventory: String,
    revision: i64,
    first_login: DateTime<Utc>,
    last_login: DateTime<Utc>,
    saved_at: DateTime<Utc>,
}

impl PlayerRow {
    fn into_record(self) -> Result<PlayerRecord, StoreError> {
        let uuid = Uuid::parse_str(&self.player_id).map_err(|e| StoreError::Schema {
            message: format!("invalid player_id {}: {e}", self.player_id),
        })?;

        let mut data = PlayerData {
            name: self.player_name,
            attributes: serde_json::from_str(&self.attributes)?,
            stats: serde_json::from_str(&self.stats)?,
            inventory: serde_json::from_str(&self.inventory)?,
            first_login: self.first_login,
            last_login: self.last_login,
        };
        data.ensure_all_stats();

        Ok(PlayerRecord::from_stored(
            PlayerId(uuid),
            data,
            from_db_revision(self.revision)?,
            self.saved_at,
        ))
    }
}

/// JSON-encoded payload columns.
/// The stored columns a save compares against when its update matched
/// no row.
#[derive(sqlx::FromRow)]
struct StoredVersion {
    revision: i64,
    player_name: String,
    attributes: String,
    stats: String,
    inventory: String,
    saved_at: DateTime<Utc>,
}

impl StoredVersion {
    fn matches(&self, name: &str, columns: &EncodedData) -> bool {
        self.player_name == name
            && self.attributes == columns.attributes
            && self.stats == columns.stats
            && self.inventory == columns.inventory
    }
}

struct EncodedData {
    attributes: String,
    stats: String,
    inventory: String,
}

impl EncodedData {
    fn encode(data: &PlayerData) -> Result<Self, StoreError> {
        Ok(Self {
            attributes: serde_json::to_string(&data.attributes)?,
            stats: serde_json::to_string(&data.stats)?,
            inventory: serde_json::to_string(&data.inventory)?,
        })
    }
}

fn to_db_revision(revision: u64) -> Result<i64, StoreError> {
    i64::try_from(revision).map_err(|e| StoreError::Constraint {
        message: format!("revision {revision} out of range: {e}"),
    })
}

fn from_db_revision(revision: i64) -> Result<u64, StoreError> {
    u64::try_from(revision).map_err(|e| StoreError::Schema {
        message: format!("stored revision {revision} is negative: {e}"),
    })
}
