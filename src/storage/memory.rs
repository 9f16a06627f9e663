use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    CachedChunkRow, ChunkSourceRow, DailyPointRow, HourlyTokenRow, MembershipRow, Storage,
};

/// In-memory `Storage` for unit tests that would rather not pay for a
/// SQLite connection per test. Mirrors the SQLite implementation's upsert
/// and sweep semantics exactly.
#[derive(Default)]
pub struct MemoryStorage {
    daily_points: Mutex<HashMap<(String, String), DailyPointRow>>,
    hourly_tokens: Mutex<HashMap<(String, String), HourlyTokenRow>>,
    chunk_sources: Mutex<HashMap<(String, String), ChunkSourceRow>>,
    chunk_cache: Mutex<HashMap<String, CachedChunkRow>>,
    membership: Mutex<HashMap<String, MembershipRow>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn upsert_daily_point(&self, row: DailyPointRow) -> anyhow::Result<()> {
        self.daily_points
            .lock()
            .insert((row.point_hash.clone(), row.peer_id.clone()), row);
        Ok(())
    }

    async fn sweep_daily_points(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut guard = self.daily_points.lock();
        let before = guard.len();
        guard.retain(|_, r| r.expires_at > now);
        Ok((before - guard.len()) as u64)
    }

    async fn upsert_hourly_token(&self, row: HourlyTokenRow) -> anyhow::Result<()> {
        self.hourly_tokens
            .lock()
            .insert((row.token_hash.clone(), row.peer_id.clone()), row);
        Ok(())
    }

    async fn sweep_hourly_tokens(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut guard = self.hourly_tokens.lock();
        let before = guard.len();
        guard.retain(|_, r| r.expires_at > now);
        Ok((before - guard.len()) as u64)
    }

    async fn upsert_chunk_source(&self, row: ChunkSourceRow) -> anyhow::Result<()> {
        self.chunk_sources
            .lock()
            .insert((row.chunk_id.clone(), row.peer_id.clone()), row);
        Ok(())
    }

    async fn remove_chunk_sources_for_peer(&self, peer_id: &str) -> anyhow::Result<()> {
        self.chunk_sources.lock().retain(|_, r| r.peer_id != peer_id);
        Ok(())
    }

    async fn sweep_chunk_sources(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut guard = self.chunk_sources.lock();
        let before = guard.len();
        guard.retain(|_, r| r.announced_at > now);
        Ok((before - guard.len()) as u64)
    }

    async fn upsert_cached_chunk(&self, row: CachedChunkRow) -> anyhow::Result<()> {
        self.chunk_cache.lock().insert(row.chunk_id.clone(), row);
        Ok(())
    }

    async fn touch_cached_chunk(&self, chunk_id: &str, accessed_at: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(row) = self.chunk_cache.lock().get_mut(chunk_id) {
            row.last_accessed = accessed_at;
            row.access_count += 1;
        }
        Ok(())
    }

    async fn evict_cached_chunk(&self, chunk_id: &str) -> anyhow::Result<()> {
        self.chunk_cache.lock().remove(chunk_id);
        Ok(())
    }

    async fn sweep_cached_chunks(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut guard = self.chunk_cache.lock();
        let before = guard.len();
        guard.retain(|_, r| r.cached_at > cutoff);
        Ok((before - guard.len()) as u64)
    }

    async fn upsert_membership(&self, row: MembershipRow) -> anyhow::Result<()> {
        self.membership.lock().insert(row.server_id.clone(), row);
        Ok(())
    }

    async fn all_membership(&self) -> anyhow::Result<Vec<MembershipRow>> {
        Ok(self.membership.lock().values().cloned().collect())
    }
}
