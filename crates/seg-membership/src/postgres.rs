//! PostgreSQL Membership Store Implementation

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::entity::{from_millis, to_millis, Membership, Segment};
use crate::error::{Result, SegmentError};
use crate::store::{is_unique_violation, MembershipStore, MembershipTableConfig};

/// PostgreSQL implementation of MembershipStore
pub struct PostgresMembershipStore {
    pool: PgPool,
    tables: MembershipTableConfig,
}

impl PostgresMembershipStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            tables: MembershipTableConfig::default(),
        }
    }

    pub fn with_config(pool: PgPool, tables: MembershipTableConfig) -> Self {
        Self { pool, tables }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lookup and insert in one statement; no returned row means the segment
    /// does not exist.
    async fn insert_membership(
        &self,
        user_id: i64,
        segment: &str,
        expires_at: Option<i64>,
    ) -> Result<()> {
        let query = format!(
            "INSERT INTO {m} (user_id, segment_id, expires_at, created_at) \
             SELECT $1::BIGINT, segment_id, $3::BIGINT, $4::BIGINT FROM {s} WHERE name = $2 \
             ON CONFLICT (user_id, segment_id) DO UPDATE SET expires_at = EXCLUDED.expires_at \
             RETURNING segment_id",
            m = self.tables.memberships_table,
            s = self.tables.segments_table,
        );

        let row = sqlx::query(&query)
            .bind(user_id)
            .bind(segment)
            .bind(expires_at)
            .bind(to_millis(Utc::now()))
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

    fn parse_membership(row: &sqlx::postgres::PgRow) -> Result<Membership> {
        let expires_at: Option<i64> = row.try_get("expires_at")?;
        Ok(Membership {
            user_id: row.try_get("user_id")?,
            segment_name: row.try_get("name")?,
            expires_at: expires_at.map(from_millis).transpose()?,
        })
    }
}

#[async_trait]
impl MembershipStore for PostgresMembershipStore {
    async fn create_segment(&self, name: &str) -> Result<()> {
        let query = format!(
            "INSERT INTO {} (name, created_at) VALUES ($1, $2)",
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
        let query = format!("DELETE FROM {} WHERE name = $1", self.tables.segments_table);

        let result = sqlx::query(&query).bind(name).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_segment(&self, name: &str) -> Result<Option<Segment>> {
        let query = format!(
            "SELECT segment_id, name, created_at FROM {} WHERE name = $1",
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
            "DELETE FROM {m} WHERE segment_id IN (SELECT segment_id FROM {s} WHERE name = $1)",
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
            "DELETE FROM {m} WHERE user_id = $1 \
             AND segment_id IN (SELECT segment_id FROM {s} WHERE name = $2)",
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
            "DELETE FROM {m} WHERE user_id = $1 \
             AND segment_id IN (SELECT segment_id FROM {s} WHERE name = $2) \
             AND expires_at IS NOT NULL AND expires_at <= $3",
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
             WHERE s.name = $1",
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
             WHERE m.user_id = $1 ORDER BY s.name",
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
            "DELETE FROM {} WHERE expires_at IS NOT NULL AND expires_at <= $1",
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
                    segment_id BIGSERIAL PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    created_at BIGINT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {m} (
                    user_id BIGINT NOT NULL,
                    segment_id BIGINT NOT NULL REFERENCES {s}(segment_id),
                    expires_at BIGINT,
                    created_at BIGINT NOT NULL,
                    PRIMARY KEY (user_id, segment_id)
                )"
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_expires_at ON {m}(expires_at) \
                 WHERE expires_at IS NOT NULL",
                m.replace('.', "_")
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS idx_{}_segment_id ON {m}(segment_id)",
                m.replace('.', "_")
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!(
            segments_table = %s,
            memberships_table = %m,
            "Initialized PostgreSQL membership schema"
        );

        Ok(())
    }
}
