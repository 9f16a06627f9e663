//! Rendezvous registry: daily meeting points (with dead-drops) and hourly
//! live-match tokens. The hot, request-path-relevant rows live in memory
//! behind a `parking_lot` lock; every write is mirrored to `Storage`
//! *after* the lock is released, so a slow disk never blocks a registry
//! lock holder.

use ahash::{HashMap, HashMapExt};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::{
    config::Rendezvous as RendezvousConfig,
    session::SessionRegistry,
    storage::{DailyPointRow, HourlyTokenRow, Storage},
};

#[derive(Clone)]
struct DailyPointEntry {
    peer_id: String,
    dead_drop: String,
    relay_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
struct HourlyTokenEntry {
    peer_id: String,
    relay_id: String,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    daily_points: HashMap<String, Vec<DailyPointEntry>>,
    hourly_tokens: HashMap<String, Vec<HourlyTokenEntry>>,
}

pub struct RendezvousRegistry {
    inner: RwLock<Inner>,
    storage: Arc<dyn Storage>,
    config: RendezvousConfig,
}

pub struct RendezvousResult {
    pub dead_drops: HashMap<String, String>,
    pub live_matches: Vec<(String, String)>,
}

impl RendezvousRegistry {
    pub fn new(storage: Arc<dyn Storage>, config: RendezvousConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            storage,
            config,
        }
    }

    /// Registers this peer at every given point and token, returning the
    /// other peers' dead-drops (for points) and emitting `match` events to
    /// peers already waiting at a token (for tokens). Collection always
    /// observes the pre-existing rows, never the freshly-upserted self row.
    pub async fn register(
        &self,
        sessions: &SessionRegistry,
        peer_id: &str,
        points: &[String],
        tokens: &[String],
        dead_drops: &HashMap<String, String>,
        relay_id: &str,
    ) -> RendezvousResult {
        let now = Utc::now();
        let daily_expiry = now + ChronoDuration::seconds(self.config.daily_ttl_secs as i64);
        let hourly_expiry = now + ChronoDuration::seconds(self.config.hourly_ttl_secs as i64);

        let mut result = RendezvousResult {
            dead_drops: HashMap::new(),
            live_matches: Vec::new(),
        };

        for point in points {
            let dead_drop = dead_drops.get(point).cloned().unwrap_or_default();

            let others = {
                let mut inner = self.inner.write();
                let bucket = inner.daily_points.entry(point.clone()).or_default();

                let others: HashMap<String, String> = bucket
                    .iter()
                    .filter(|e| e.peer_id != peer_id)
                    .map(|e| (e.peer_id.clone(), e.dead_drop.clone()))
                    .collect();

                if let Some(existing) = bucket.iter_mut().find(|e| e.peer_id == peer_id) {
                    existing.dead_drop = dead_drop.clone();
                    existing.relay_id = relay_id.to_string();
                    existing.expires_at = daily_expiry;
                } else {
                    bucket.push(DailyPointEntry {
                        peer_id: peer_id.to_string(),
                        dead_drop: dead_drop.clone(),
                        relay_id: relay_id.to_string(),
                        expires_at: daily_expiry,
                    });
                }

                others
            };

            for (other_peer, drop) in others {
                result.dead_drops.insert(other_peer, drop);
            }

            if let Err(err) = self
                .storage
                .upsert_daily_point(DailyPointRow {
                    point_hash: point.clone(),
                    peer_id: peer_id.to_string(),
                    dead_drop,
                    relay_id: relay_id.to_string(),
                    expires_at: daily_expiry,
                })
                .await
            {
                log::warn!("failed to persist daily point: {err}");
            }
        }

        for token in tokens {
            let waiting = {
                let mut inner = self.inner.write();
                let bucket = inner.hourly_tokens.entry(token.clone()).or_default();

                let waiting: Vec<(String, String)> = bucket
                    .iter()
                    .filter(|e| e.peer_id != peer_id)
                    .map(|e| (e.peer_id.clone(), e.relay_id.clone()))
                    .collect();

                if let Some(existing) = bucket.iter_mut().find(|e| e.peer_id == peer_id) {
                    existing.relay_id = relay_id.to_string();
                    existing.expires_at = hourly_expiry;
                } else {
                    bucket.push(HourlyTokenEntry {
                        peer_id: peer_id.to_string(),
                        relay_id: relay_id.to_string(),
                        expires_at: hourly_expiry,
                    });
                }

                waiting
            };

            if let Err(err) = self
                .storage
                .upsert_hourly_token(HourlyTokenRow {
                    token_hash: token.clone(),
                    peer_id: peer_id.to_string(),
                    relay_id: relay_id.to_string(),
                    expires_at: hourly_expiry,
                })
                .await
            {
                log::warn!("failed to persist hourly token: {err}");
            }

            for (other_peer, other_relay) in &waiting {
                result.live_matches.push((other_peer.clone(), other_relay.clone()));
            }

            for (other_peer, _) in &waiting {
                if let Some(session) = sessions.get_by_code(other_peer) {
                    session.tx.send(
                        serde_json::json!({
                            "type": "match",
                            "peerId": peer_id,
                            "relayId": relay_id,
                        })
                        .to_string(),
                    );
                }
            }
        }

        result
    }

    /// Drops expired rows. Intended to be called from a periodic sweeper,
    /// never from a request handler.
    pub async fn sweep(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        {
            let mut inner = self.inner.write();
            for bucket in inner.daily_points.values_mut() {
                bucket.retain(|e| e.expires_at > now);
            }
            inner.daily_points.retain(|_, v| !v.is_empty());

            for bucket in inner.hourly_tokens.values_mut() {
                bucket.retain(|e| e.expires_at > now);
            }
            inner.hourly_tokens.retain(|_, v| !v.is_empty());
        }

        self.storage.sweep_daily_points(now).await?;
        self.storage.sweep_hourly_tokens(now).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    #[tokio::test]
    async fn dead_drop_round_trip_excludes_self() {
        let registry = RendezvousRegistry::new(Arc::new(MemoryStorage::new()), RendezvousConfig {
            daily_ttl_secs: 3600,
            hourly_ttl_secs: 3600,
            sweep_interval_secs: 300,
        });
        let sessions = SessionRegistry::new();

        let mut drops = HashMap::new();
        drops.insert("point1".to_string(), "x-drop".to_string());
        let result = registry
            .register(&sessions, "peerX", &["point1".to_string()], &[], &drops, "relay1")
            .await;
        assert!(result.dead_drops.is_empty());

        let mut drops_y = HashMap::new();
        drops_y.insert("point1".to_string(), "y-drop".to_string());
        let result = registry
            .register(&sessions, "peerY", &["point1".to_string()], &[], &drops_y, "relay1")
            .await;
        assert_eq!(result.dead_drops.get("peerX"), Some(&"x-drop".to_string()));

        let result = registry
            .register(&sessions, "peerX", &["point1".to_string()], &[], &drops, "relay1")
            .await;
        assert_eq!(result.dead_drops.get("peerY"), Some(&"y-drop".to_string()));
        assert_eq!(result.dead_drops.len(), 1);
    }
}
