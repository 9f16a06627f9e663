//! Chunk relay: announce/request/push with a bounded LRU cache and
//! pending-request coalescing so concurrent pulls for the same chunk only
//! ever trigger one `chunk_pull`.

use ahash::{HashMap, HashMapExt};
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde_json::json;
use std::{sync::Arc, time::Instant};

use crate::{
    config::Chunk as ChunkConfig,
    error::ProtocolError,
    session::SessionRegistry,
    storage::{CachedChunkRow, ChunkSourceRow, Storage},
};

struct CacheEntry {
    channel_id: String,
    data: Vec<u8>,
    cached_at: Instant,
    last_accessed: Instant,
    access_count: u64,
}

#[derive(Default)]
struct Inner {
    cache: HashMap<String, CacheEntry>,
    sources: HashMap<String, Vec<(String, Instant)>>,
    pending: HashMap<String, Vec<String>>,
}

pub struct ChunkRelay {
    inner: RwLock<Inner>,
    storage: Arc<dyn Storage>,
    config: ChunkConfig,
}

impl ChunkRelay {
    pub fn new(storage: Arc<dyn Storage>, config: ChunkConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            storage,
            config,
        }
    }

    /// Registers `peer_id` as a source for each chunk, refreshing
    /// `announced_at` on repeats. Returns the number of entries accepted.
    pub async fn announce(&self, peer_id: &str, chunks: &[(String, String)]) -> usize {
        let now = Instant::now();
        let mut accepted = Vec::new();

        {
            let mut inner = self.inner.write();
            for (chunk_id, _channel_id) in chunks {
                if chunk_id.is_empty() {
                    continue;
                }
                let bucket = inner.sources.entry(chunk_id.clone()).or_default();
                if let Some(entry) = bucket.iter_mut().find(|(p, _)| p == peer_id) {
                    entry.1 = now;
                } else {
                    bucket.push((peer_id.to_string(), now));
                }
                accepted.push(chunk_id.clone());
            }
        }

        for chunk_id in &accepted {
            if let Err(err) = self
                .storage
                .upsert_chunk_source(ChunkSourceRow {
                    chunk_id: chunk_id.clone(),
                    peer_id: peer_id.to_string(),
                    announced_at: Utc::now(),
                })
                .await
            {
                log::warn!("failed to persist chunk source: {err}");
            }
        }

        accepted.len()
    }

    /// Serves from cache, coalesces into an in-flight pull, or dispatches a
    /// new pull to an online source. `sessions` is used only to find a
    /// live session for the chosen source and for the requester itself.
    pub async fn request(
        &self,
        sessions: &SessionRegistry,
        requester_session_id: &str,
        chunk_id: &str,
        channel_id: &str,
    ) -> Result<ChunkRequestOutcome, ProtocolError> {
        let cache_ttl = std::time::Duration::from_secs(self.config.cache_ttl_secs);
        let hit = {
            let mut inner = self.inner.write();
            match inner.cache.get(chunk_id).map(|entry| entry.cached_at.elapsed() >= cache_ttl) {
                Some(true) => {
                    inner.cache.remove(chunk_id);
                    None
                }
                Some(false) => {
                    let entry = inner.cache.get_mut(chunk_id).expect("checked above");
                    entry.last_accessed = Instant::now();
                    entry.access_count += 1;
                    Some(entry.data.clone())
                }
                None => None,
            }
        };

        if let Some(data) = hit {
            if let Err(err) = self.storage.touch_cached_chunk(chunk_id, Utc::now()).await {
                log::warn!("failed to persist cache touch: {err}");
            }
            return Ok(ChunkRequestOutcome::CacheHit(data));
        }

        let mut inner = self.inner.write();
        if let Some(pending) = inner.pending.get_mut(chunk_id) {
            if !pending.contains(&requester_session_id.to_string()) {
                pending.push(requester_session_id.to_string());
            }
            return Ok(ChunkRequestOutcome::Pulling);
        }

        let source_peer = inner
            .sources
            .get(chunk_id)
            .and_then(|peers| peers.iter().find(|(p, _)| sessions.get_by_code(p).is_some()))
            .map(|(p, _)| p.clone());

        let Some(source_peer) = source_peer else {
            return Err(ProtocolError::NoChunkSource(chunk_id.to_string()));
        };

        inner
            .pending
            .insert(chunk_id.to_string(), vec![requester_session_id.to_string()]);
        drop(inner);

        if let Some(source_session) = sessions.get_by_code(&source_peer) {
            source_session.tx.send(
                json!({
                    "type": "chunk_pull",
                    "chunkId": chunk_id,
                    "channelId": channel_id,
                })
                .to_string(),
            );
        }

        Ok(ChunkRequestOutcome::Pulling)
    }

    /// Decodes and caches `data`, evicting if necessary, registers `peer_id`
    /// as a source for the chunk, then serves every pending requester.
    /// Returns the number served.
    pub async fn push(
        &self,
        sessions: &SessionRegistry,
        peer_id: &str,
        chunk_id: &str,
        channel_id: &str,
        data_b64: &str,
    ) -> Result<usize, ProtocolError> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(data_b64)
            .map_err(|_| ProtocolError::MissingField("data"))?;

        if data.len() > self.config.max_payload_bytes {
            return Err(ProtocolError::ChunkTooLarge(self.config.max_payload_bytes));
        }

        let (requesters, evicted) = {
            let mut inner = self.inner.write();

            let evicted = if !inner.cache.contains_key(chunk_id) && inner.cache.len() >= self.config.cache_capacity {
                self.evict_one(&mut inner)
            } else {
                None
            };

            inner.cache.insert(
                chunk_id.to_string(),
                CacheEntry {
                    channel_id: channel_id.to_string(),
                    data: data.clone(),
                    cached_at: Instant::now(),
                    last_accessed: Instant::now(),
                    access_count: 0,
                },
            );

            let now = Instant::now();
            let bucket = inner.sources.entry(chunk_id.to_string()).or_default();
            if let Some(entry) = bucket.iter_mut().find(|(p, _)| p == peer_id) {
                entry.1 = now;
            } else {
                bucket.push((peer_id.to_string(), now));
            }

            (inner.pending.remove(chunk_id).unwrap_or_default(), evicted)
        };

        if let Some(evicted_id) = evicted {
            if let Err(err) = self.storage.evict_cached_chunk(&evicted_id).await {
                log::warn!("failed to persist cache eviction: {err}");
            }
        }

        let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
        let mut served = 0;
        for requester_id in &requesters {
            if let Some(session) = sessions.get(requester_id) {
                session.tx.send(
                    json!({
                        "type": "chunk_response",
                        "chunkId": chunk_id,
                        "source": "relay",
                        "data": encoded,
                    })
                    .to_string(),
                );
                served += 1;
            }
        }

        if let Err(err) = self
            .storage
            .upsert_cached_chunk(CachedChunkRow {
                chunk_id: chunk_id.to_string(),
                channel_id: channel_id.to_string(),
                data,
                cached_at: Utc::now(),
                last_accessed: Utc::now(),
                access_count: 0,
            })
            .await
        {
            log::warn!("failed to persist cached chunk: {err}");
        }

        if let Err(err) = self
            .storage
            .upsert_chunk_source(ChunkSourceRow {
                chunk_id: chunk_id.to_string(),
                peer_id: peer_id.to_string(),
                announced_at: Utc::now(),
            })
            .await
        {
            log::warn!("failed to persist chunk source for pusher: {err}");
        }

        Ok(served)
    }

    /// Evicts the entry with the oldest `last_accessed`, ties broken by
    /// lowest `access_count` then lowest `cached_at`. Caller already holds
    /// the write lock. Returns the evicted chunk id, if any, so the caller
    /// can mirror the removal in storage once the lock is released.
    fn evict_one(&self, inner: &mut Inner) -> Option<String> {
        let victim = inner
            .cache
            .iter()
            .min_by(|(_, a), (_, b)| {
                a.last_accessed
                    .cmp(&b.last_accessed)
                    .then(a.access_count.cmp(&b.access_count))
                    .then(a.cached_at.cmp(&b.cached_at))
            })
            .map(|(k, _)| k.clone());

        if let Some(victim) = &victim {
            inner.cache.remove(victim);
        }

        victim
    }

    pub async fn sweep(&self) -> anyhow::Result<()> {
        let cache_cutoff = Instant::now()
            .checked_sub(std::time::Duration::from_secs(self.config.cache_ttl_secs))
            .unwrap_or_else(Instant::now);
        let source_cutoff = Instant::now()
            .checked_sub(std::time::Duration::from_secs(self.config.source_ttl_secs))
            .unwrap_or_else(Instant::now);

        {
            let mut inner = self.inner.write();
            inner.cache.retain(|_, entry| entry.cached_at > cache_cutoff);
            for bucket in inner.sources.values_mut() {
                bucket.retain(|(_, announced_at)| *announced_at > source_cutoff);
            }
            inner.sources.retain(|_, v| !v.is_empty());
        }

        let now = Utc::now();
        self.storage
            .sweep_cached_chunks(now - ChronoDuration::seconds(self.config.cache_ttl_secs as i64))
            .await?;
        self.storage
            .sweep_chunk_sources(now - ChronoDuration::seconds(self.config.source_ttl_secs as i64))
            .await?;
        Ok(())
    }

    /// Removes `peer_id` as a source for every chunk. Leaves any pending
    /// request set untouched — see the open question on source disconnect
    /// during an in-flight pull.
    pub async fn remove_peer_sources(&self, peer_id: &str) -> anyhow::Result<()> {
        {
            let mut inner = self.inner.write();
            for bucket in inner.sources.values_mut() {
                bucket.retain(|(p, _)| p != peer_id);
            }
            inner.sources.retain(|_, v| !v.is_empty());
        }
        self.storage.remove_chunk_sources_for_peer(peer_id).await
    }

    /// Removes `requester_session_id` from every pending-request set.
    pub fn remove_pending_requester(&self, requester_session_id: &str) {
        let mut inner = self.inner.write();
        for bucket in inner.pending.values_mut() {
            bucket.retain(|r| r != requester_session_id);
        }
    }
}

pub enum ChunkRequestOutcome {
    CacheHit(Vec<u8>),
    Pulling,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{channel::Tx, SessionHandle};
    use crate::storage::memory::MemoryStorage;
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;

    fn default_config() -> ChunkConfig {
        ChunkConfig {
            max_payload_bytes: 4096,
            cache_capacity: 1000,
            cache_ttl_secs: 1800,
            source_ttl_secs: 3600,
            sweep_interval_secs: 300,
        }
    }

    fn session(id: &str) -> Arc<SessionHandle> {
        let (tx, _rx) = unbounded_channel();
        Arc::new(SessionHandle::new(id.to_string(), Tx(tx), 100, 30))
    }

    #[tokio::test]
    async fn cache_hit_skips_pull() {
        let relay = ChunkRelay::new(Arc::new(MemoryStorage::new()), default_config());
        let sessions = SessionRegistry::new();
        relay
            .push(&sessions, "pusher", "c1", "ch1", &base64::engine::general_purpose::STANDARD.encode(b"hello"))
            .await
            .unwrap();

        match relay.request(&sessions, "requester", "c1", "ch1").await.unwrap() {
            ChunkRequestOutcome::CacheHit(data) => assert_eq!(data, b"hello"),
            ChunkRequestOutcome::Pulling => panic!("expected cache hit"),
        }
    }

    #[tokio::test]
    async fn push_registers_pusher_as_source() {
        let relay = ChunkRelay::new(Arc::new(MemoryStorage::new()), default_config());
        let sessions = SessionRegistry::new();
        relay
            .push(&sessions, "PUSH01", "c1", "ch1", &base64::engine::general_purpose::STANDARD.encode(b"hello"))
            .await
            .unwrap();

        let sources = relay.inner.read().sources.get("c1").cloned().unwrap_or_default();
        assert!(sources.iter().any(|(p, _)| p == "PUSH01"));
    }

    #[tokio::test]
    async fn expired_cache_entry_is_treated_as_miss() {
        let mut config = default_config();
        config.cache_ttl_secs = 0;
        let relay = ChunkRelay::new(Arc::new(MemoryStorage::new()), config);
        let sessions = SessionRegistry::new();
        relay
            .push(&sessions, "pusher", "c1", "ch1", &base64::engine::general_purpose::STANDARD.encode(b"hello"))
            .await
            .unwrap();

        // cache_ttl_secs of 0 means any elapsed time already counts as expired.
        std::thread::sleep(std::time::Duration::from_millis(5));
        let err = relay.request(&sessions, "requester", "c1", "ch1").await.unwrap_err();
        assert!(matches!(err, ProtocolError::NoChunkSource(_)));
        assert!(relay.inner.read().cache.get("c1").is_none());
    }

    #[tokio::test]
    async fn dedups_concurrent_requesters_for_same_chunk() {
        let relay = ChunkRelay::new(Arc::new(MemoryStorage::new()), default_config());
        let sessions = SessionRegistry::new();
        let source = session("source");
        sessions.insert(source.clone());
        sessions.bind_code("SRC001", "source").unwrap();

        relay.announce("SRC001", &[("c1".to_string(), "ch1".to_string())]).await;

        let r1 = relay.request(&sessions, "r1", "c1", "ch1").await.unwrap();
        let r2 = relay.request(&sessions, "r2", "c1", "ch1").await.unwrap();
        assert!(matches!(r1, ChunkRequestOutcome::Pulling));
        assert!(matches!(r2, ChunkRequestOutcome::Pulling));

        let pending = relay.inner.read().pending.get("c1").cloned().unwrap();
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn push_over_max_payload_is_rejected() {
        let relay = ChunkRelay::new(Arc::new(MemoryStorage::new()), default_config());
        let sessions = SessionRegistry::new();
        let oversized = vec![0u8; 4097];
        let encoded = base64::engine::general_purpose::STANDARD.encode(&oversized);
        let err = relay.push(&sessions, "pusher", "c1", "ch1", &encoded).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ChunkTooLarge(4096)));
    }
}
