pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone)]
pub struct DailyPointRow {
    pub point_hash: String,
    pub peer_id: String,
    pub dead_drop: String,
    pub relay_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HourlyTokenRow {
    pub token_hash: String,
    pub peer_id: String,
    pub relay_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ChunkSourceRow {
    pub chunk_id: String,
    pub peer_id: String,
    pub announced_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CachedChunkRow {
    pub chunk_id: String,
    pub channel_id: String,
    pub data: Vec<u8>,
    pub cached_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub access_count: i64,
}

#[derive(Debug, Clone)]
pub struct MembershipRow {
    pub server_id: String,
    pub endpoint: String,
    pub status: String,
}

/// Durable state backing the rendezvous registry, the chunk relay, and the
/// federation membership table. Every write is an upsert on the primary key
/// documented alongside each row type; every sweep is a single batched
/// delete driven by the scheduling layer, never by a request handler.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn upsert_daily_point(&self, row: DailyPointRow) -> anyhow::Result<()>;
    async fn sweep_daily_points(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn upsert_hourly_token(&self, row: HourlyTokenRow) -> anyhow::Result<()>;
    async fn sweep_hourly_tokens(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn upsert_chunk_source(&self, row: ChunkSourceRow) -> anyhow::Result<()>;
    async fn remove_chunk_sources_for_peer(&self, peer_id: &str) -> anyhow::Result<()>;
    async fn sweep_chunk_sources(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn upsert_cached_chunk(&self, row: CachedChunkRow) -> anyhow::Result<()>;
    async fn touch_cached_chunk(&self, chunk_id: &str, accessed_at: DateTime<Utc>) -> anyhow::Result<()>;
    async fn evict_cached_chunk(&self, chunk_id: &str) -> anyhow::Result<()>;
    async fn sweep_cached_chunks(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;

    async fn upsert_membership(&self, row: MembershipRow) -> anyhow::Result<()>;
    async fn all_membership(&self) -> anyhow::Result<Vec<MembershipRow>>;
}
