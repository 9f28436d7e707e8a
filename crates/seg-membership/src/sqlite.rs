//! SQLite Membership Store Implementation
//!
//! Embedded store for single-node deployments and development. Foreign keys
//! are enforced (sqlx enables them on every connection).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::entity::{from_millis, to_millis, Membership, Segment};
use crate::error::{Result, SegmentError};
use crate::store::{is_unique_violation, MembershipStore, MembershipTableConfig};

/// SQLite implementation of MembershipStore
pub struct SqliteMembershipStore {
    pool: SqlitePool,
    tables: MembershipTableConfig,
}

impl SqliteMembershipStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            tables: MembershipTableConfig::default(),
        }
    }

    pub fn with_config(pool: SqlitePool, tables: MembershipTableConfig) -> Self {
        Self { pool, tables }
    }

    /// Private in-memory database with the schema applied.
    ///
    /// Every pooled connection to `sqlite::memory:` opens its own database,
    /// so the pool is pinned to a single connection that never expires.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let store = Self::new(pool);
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_membership(
        &self,
        user_id: i64,
        segment: &str,
        expires_at: Option<i64>,
    ) -> Result<()> {
        // The WHERE clause keeps SQLite from reading ON CONFLICT as a join constraint
        let query = format!(
            "INSERT INTO {m} (user_id, segment_id, expires_at, created_at) \
             SELECT ?, segment_id, ?, ? FROM {s} WHERE name = ? \
             ON CONFLICT (user_id, segment_id) DO UPDATE SET expires_at = excluded.expires_at \
             RETURNING segment_id",
            m = self.tables.memberships_table,
            s = self.tables.segments_table,
        );

        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(expires_at)
            .bind(to_millis(Utc::now()))
            .bind(segment)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(_) => {
                debug!(user_id, segment, expires_at, "Inserted membership");
                Ok(())
            }
            None => Err(SegmentError::segment_not_found(segment)),
        }
    }

    fn parse_membership(row: &sqlx::sqlite::SqliteRow) -> Result<Membership> {
        let expires_at: Option<i64> = row.try_get("expires_at")?;
        Ok(Membership {
            user_id: row.try_get("user_id")?,
            segment_name: row.try_get("name")?,
            expires_at: expires_at.map(from_millis).transpose()?,
        })
    }
}

#[async_trait]
impl MembershipStore for SqliteMembershipStore {
    async fn create_segment(&self, name: &str) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (name, created_at) VALUES (?, ?)",
            self.tables.segments_table
        );

        sqlx::query(&query)
            .bind(name)
            .bind(to_millis(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    SegmentError::conflict(name)
                } else {
                    SegmentError::Store(e)
                }
            })?;

        Ok(())
    }

    async fn delete_segment(&self, name: &str) -> Result<bool> {
        let query = format!("DELETE FROM {} WHERE name = ?", self.tables.segments_table);

        let result = sqlx::query(&query).bind(name).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_segment(&self, name: &str) -> Result<Option<Segment>> {
        let query = format!(
            "SELECT segment_id, name, created_at FROM {} WHERE name = ?",
            self.tables.segments_table
        );

        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Segment> {
            Ok(Segment {
                id: row.try_get("segment_id")?,
                name: row.try_get("name")?,
                created_at: from_millis(row.try_get("created_at")?)?,
            })
        })
        .transpose()
    }

    async fn delete_segment_memberships(&self, name: &str) -> Result<u64> {
        let query = format!(
            "DELETE FROM {m} WHERE segment_id IN (SELECT segment_id FROM {s} WHERE name = ?)",
            m = self.tables.memberships_table,
            s = self.tables.segments_table,
        );

        let result = sqlx::query(&query).bind(name).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    async fn insert_permanent_membership(&self, user_id: i64, segment: &str) -> Result<()> {
        self.insert_membership(user_id, segment, None).await
    }

    async fn insert_timed_membership(
        &self,
        user_id: i64,
        segment: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.insert_membership(user_id, segment, Some(to_millis(expires_at)))
            .await
    }

    async fn delete_membership(&self, user_id: i64, segment: &str) -> Result<u64> {
        let query = format!(
            "DELETE FROM {m} WHERE user_id = ? \
             AND segment_id IN (SELECT segment_id FROM {s} WHERE name = ?)",
            m = self.tables.memberships_table,
            s = self.tables.segments_table,
        );

        let result = sqlx::query(&query)
            .bind(user_id)
            .bind(segment)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_membership(
        &self,
        user_id: i64,
        segment: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<u64> {
        let query = format!(
            "DELETE FROM {m} WHERE user_id = ? \
             AND segment_id IN (SELECT segment_id FROM {s} WHERE name = ?) \
             AND expires_at IS NOT NULL AND expires_at <= ?",
            m = self.tables.memberships_table,
            s = self.tables.segments_table,
        );

        let result = sqlx::query(&query)
            .bind(user_id)
            .bind(segment)
            .bind(to_millis(expires_at))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn count_segment_members(&self, name: &str) -> Result<u64> {
        let query = format!(
            "SELECT COUNT(*) AS members FROM {m} m JOIN {s} s ON s.segment_id = m.segment_id \
             WHERE s.name = ?",
            m = self.tables.memberships_table,
            s = self.tables.segments_table,
        );

        let row = sqlx::query(&query).bind(name).fetch_one(&self.pool).await?;
        let members: i64 = row.try_get("members")?;
        Ok(members.max(0) as u64)
    }

    async fn find_user_memberships(&self, user_id: i64) -> Result<Vec<Membership>> {
        let query = format!(
            "SELECT m.user_id, s.name, m.expires_at FROM {m} m \
             JOIN {s} s ON s.segment_id = m.segment_id \
             WHERE m.user_id = ? ORDER BY s.name",
            m = self.tables.memberships_table,
            s = self.tables.segments_table,
        );

        let rows = sqlx::query(&query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::parse_membership).collect()
    }

    async fn find_timed_memberships(&self) -> Result<Vec<Membership>> {
        let query = format!(
            "SELECT m.user_id, s.name, m.expires_at FROM {m} m \
             JOIN {s} s ON s.segment_id = m.segment_id \
             WHERE m.expires_at IS NOT NULL ORDER BY m.expires_at ASC",
            m = self.tables.memberships_table,
            s = self.tables.segments_table,
        );

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_membership).collect()
    }

    async fn delete_expired_memberships(&self, now: DateTime<Utc>) -> Result<u64> {
        let query = format!(
            "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at <= ?",
            self.tables.memberships_table
        );

        let result = sqlx::query(&query)
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn init_schema(&self) -> Result<()> {
        let m = &self.tables.memberships_table;
        let s = &self.tables.segments_table;

        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {s} (
                    segment_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    name TEXT NOT NULL UNIQUE,
                    created_at INTEGER NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {m} (
                    user_id INTEGER NOT NULL,
                    segment_id INTEGER NOT NULL REFERENCES {s}(segment_id),
                    expires_at INTEGER,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (user_id, segment_id)
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{m}_expires_at ON {m}(expires_at) \
                 WHERE expires_at IS NOT NULL"
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!(
            segments_table = %s,
            memberships_table = %m,
            "Initialized SQLite membership schema"
        );

        Ok(())
    }
}
