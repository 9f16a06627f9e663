use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePool, Row};

use super::{
    CachedChunkRow, ChunkSourceRow, DailyPointRow, HourlyTokenRow, MembershipRow, Storage,
};

/// SQLite-backed storage. Chosen because the durable state here is entirely
/// upsert-and-sweep with no cross-table joins under contention, which a
/// single-writer embedded database handles without the operational cost of
/// a standalone server.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options: sqlx::sqlite::SqliteConnectOptions = database_url.parse()?;
        let pool = SqlitePool::connect_with(options.create_if_missing(true)).await?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS daily_points (
                point_hash TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                dead_drop TEXT NOT NULL,
                relay_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (point_hash, peer_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_daily_points_expiry ON daily_points(expires_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS hourly_tokens (
                token_hash TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                relay_id TEXT NOT NULL,
                expires_at INTEGER NOT NULL,
                PRIMARY KEY (token_hash, peer_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_hourly_tokens_expiry ON hourly_tokens(expires_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunk_sources (
                chunk_id TEXT NOT NULL,
                peer_id TEXT NOT NULL,
                announced_at INTEGER NOT NULL,
                PRIMARY KEY (chunk_id, peer_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunk_sources_announced ON chunk_sources(announced_at)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunk_cache (
                chunk_id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                data BLOB NOT NULL,
                cached_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL,
                access_count INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS membership (
                server_id TEXT PRIMARY KEY,
                endpoint TEXT NOT NULL,
                status TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn to_epoch(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn upsert_daily_point(&self, row: DailyPointRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_points (point_hash, peer_id, dead_drop, relay_id, expires_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(point_hash, peer_id) DO UPDATE SET
                dead_drop = excluded.dead_drop,
                relay_id = excluded.relay_id,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&row.point_hash)
        .bind(&row.peer_id)
        .bind(&row.dead_drop)
        .bind(&row.relay_id)
        .bind(to_epoch(row.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sweep_daily_points(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM daily_points WHERE expires_at <= ?")
            .bind(to_epoch(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_hourly_token(&self, row: HourlyTokenRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO hourly_tokens (token_hash, peer_id, relay_id, expires_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(token_hash, peer_id) DO UPDATE SET
                relay_id = excluded.relay_id,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(&row.token_hash)
        .bind(&row.peer_id)
        .bind(&row.relay_id)
        .bind(to_epoch(row.expires_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn sweep_hourly_tokens(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM hourly_tokens WHERE expires_at <= ?")
            .bind(to_epoch(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_chunk_source(&self, row: ChunkSourceRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_sources (chunk_id, peer_id, announced_at)
            VALUES (?, ?, ?)
            ON CONFLICT(chunk_id, peer_id) DO UPDATE SET announced_at = excluded.announced_at
            "#,
        )
        .bind(&row.chunk_id)
        .bind(&row.peer_id)
        .bind(to_epoch(row.announced_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove_chunk_sources_for_peer(&self, peer_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM chunk_sources WHERE peer_id = ?")
            .bind(peer_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_chunk_sources(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_sources WHERE announced_at <= ?")
            .bind(to_epoch(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_cached_chunk(&self, row: CachedChunkRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chunk_cache (chunk_id, channel_id, data, cached_at, last_accessed, access_count)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                data = excluded.data,
                cached_at = excluded.cached_at,
                last_accessed = excluded.last_accessed,
                access_count = excluded.access_count
            "#,
        )
        .bind(&row.chunk_id)
        .bind(&row.channel_id)
        .bind(&row.data)
        .bind(to_epoch(row.cached_at))
        .bind(to_epoch(row.last_accessed))
        .bind(row.access_count)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch_cached_chunk(&self, chunk_id: &str, accessed_at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE chunk_cache SET last_accessed = ?, access_count = access_count + 1 WHERE chunk_id = ?")
            .bind(to_epoch(accessed_at))
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn evict_cached_chunk(&self, chunk_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM chunk_cache WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn sweep_cached_chunks(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM chunk_cache WHERE cached_at <= ?")
            .bind(to_epoch(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn upsert_membership(&self, row: MembershipRow) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO membership (server_id, endpoint, status)
            VALUES (?, ?, ?)
            ON CONFLICT(server_id) DO UPDATE SET
                endpoint = excluded.endpoint,
                status = excluded.status
            "#,
        )
        .bind(&row.server_id)
        .bind(&row.endpoint)
        .bind(&row.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn all_membership(&self) -> anyhow::Result<Vec<MembershipRow>> {
        let rows = sqlx::query("SELECT server_id, endpoint, status FROM membership")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|r| MembershipRow {
                server_id: r.get("server_id"),
                endpoint: r.get("endpoint"),
                status: r.get("status"),
            })
            .collect())
    }
}
