//! Pairing registry and pair-request state machine. Requests are cleaned up
//! synchronously on accept/reject/disconnect and asynchronously by two
//! timers (warning, timeout) that carry only the request's key, per the
//! cyclic-reference note: a timer firing after the record is gone is a
//! harmless no-op rather than a dangling reference.

use ahash::{HashMap, HashMapExt};
use parking_lot::RwLock;
use serde_json::json;
use std::{sync::Arc, time::Instant};

use crate::{
    config::Pairing as PairingConfig,
    error::ProtocolError,
    protocol::is_valid_pairing_code,
    session::SessionRegistry,
};

type RequestKey = (String, String);

struct PendingRequest {
    from_public_key: String,
    warning_sent: bool,
}

#[derive(Default)]
struct Inner {
    requests: HashMap<RequestKey, PendingRequest>,
    fan_in: HashMap<String, usize>,
}

pub struct PairingRegistry {
    inner: RwLock<Inner>,
    config: PairingConfig,
}

impl PairingRegistry {
    pub fn new(config: PairingConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                requests: HashMap::new(),
                fan_in: HashMap::new(),
            }),
            config,
        }
    }

    /// Validates and registers `code` for `session_id`. Rejects a second
    /// registration by the same session and a code already owned by
    /// another live session.
    pub fn register(
        &self,
        sessions: &SessionRegistry,
        session_id: &str,
        code: &str,
        public_key: &str,
    ) -> Result<(), ProtocolError> {
        if !is_valid_pairing_code(code) {
            return Err(ProtocolError::MissingField("pairingCode"));
        }

        let session = sessions.get(session_id).ok_or(ProtocolError::NotRegistered)?;
        if session.is_registered() {
            return Err(ProtocolError::PairRequestRejected);
        }

        sessions
            .bind_code(code, session_id)
            .map_err(|_| ProtocolError::PairRequestRejected)?;

        *session.pairing_code.write() = Some(code.to_string());
        *session.public_key.write() = Some(public_key.to_string());
        Ok(())
    }

    /// `from_code` creates or replaces its outbound request to `to_code`.
    /// Spawns the warning/timeout timers on success.
    pub fn request(
        self: &Arc<Self>,
        sessions: &Arc<SessionRegistry>,
        from_code: &str,
        to_code: &str,
        from_public_key: &str,
    ) -> Result<(), ProtocolError> {
        if from_code == to_code || sessions.get_by_code(to_code).is_none() {
            return Err(ProtocolError::PairRequestRejected);
        }

        let key = (from_code.to_string(), to_code.to_string());
        {
            let mut inner = self.inner.write();
            let is_new = !inner.requests.contains_key(&key);
            if is_new {
                let count = inner.fan_in.entry(to_code.to_string()).or_insert(0);
                if *count >= self.config.max_fan_in {
                    return Err(ProtocolError::PairRequestRejected);
                }
                *count += 1;
            }
            inner.requests.insert(
                key.clone(),
                PendingRequest {
                    from_public_key: from_public_key.to_string(),
                    warning_sent: false,
                },
            );
        }

        if let Some(target) = sessions.get_by_code(to_code) {
            target.tx.send(
                json!({
                    "type": "pair_incoming",
                    "fromCode": from_code,
                    "fromPublicKey": from_public_key,
                    "expiresIn": self.config.request_timeout_ms,
                })
                .to_string(),
            );
        }

        self.schedule_timers(sessions.clone(), key);
        Ok(())
    }

    fn schedule_timers(self: &Arc<Self>, sessions: Arc<SessionRegistry>, key: RequestKey) {
        let warning_at = self
            .config
            .request_timeout_ms
            .saturating_sub(self.config.request_warning_before_ms);
        let timeout_ms = self.config.request_timeout_ms;

        let registry = self.clone();
        let sessions_for_warning = sessions.clone();
        let warning_key = key.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(warning_at)).await;
            registry.fire_warning(&sessions_for_warning, &warning_key);
        });

        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            registry.fire_timeout(&sessions, &key);
        });
    }

    fn fire_warning(&self, sessions: &SessionRegistry, key: &RequestKey) {
        let mut inner = self.inner.write();
        let Some(request) = inner.requests.get_mut(key) else {
            return;
        };
        if request.warning_sent {
            return;
        }
        request.warning_sent = true;
        drop(inner);

        let (from_code, to_code) = key;
        let frame = |peer_code: &str| {
            json!({
                "type": "pair_expiring",
                "peerCode": peer_code,
                "remainingSeconds": 30,
            })
            .to_string()
        };

        if let Some(from) = sessions.get_by_code(from_code) {
            from.tx.send(frame(to_code));
        }
        if let Some(to) = sessions.get_by_code(to_code) {
            to.tx.send(frame(from_code));
        }
    }

    fn fire_timeout(&self, sessions: &SessionRegistry, key: &RequestKey) {
        let removed = {
            let mut inner = self.inner.write();
            let removed = inner.requests.remove(key).is_some();
            if removed {
                if let Some(count) = inner.fan_in.get_mut(&key.1) {
                    *count = count.saturating_sub(1);
                }
            }
            removed
        };

        if !removed {
            return;
        }

        let (from_code, to_code) = key;
        if let Some(from) = sessions.get_by_code(from_code) {
            from.tx.send(
                json!({ "type": "pair_timeout", "peerCode": to_code }).to_string(),
            );
        }
    }

    /// `to_code`'s session accepts or rejects the outstanding request from
    /// `from_code`.
    pub fn respond(
        &self,
        sessions: &SessionRegistry,
        from_code: &str,
        to_code: &str,
        accepted: bool,
    ) -> Result<(), ProtocolError> {
        let key = (from_code.to_string(), to_code.to_string());
        let request = {
            let mut inner = self.inner.write();
            let request = inner
                .requests
                .remove(&key)
                .ok_or(ProtocolError::NoPendingPairRequest)?;
            if let Some(count) = inner.fan_in.get_mut(to_code) {
                *count = count.saturating_sub(1);
            }
            request
        };

        let requester = sessions.get_by_code(from_code);
        if accepted {
            let responder_key = sessions
                .get_by_code(to_code)
                .and_then(|s| s.public_key.read().clone());
            if let (Some(requester), Some(responder_key)) = (&requester, responder_key) {
                requester.tx.send(
                    json!({
                        "type": "pair_matched",
                        "peerCode": to_code,
                        "peerPublicKey": responder_key,
                        "isInitiator": true,
                    })
                    .to_string(),
                );
            }
            if let Some(responder) = sessions.get_by_code(to_code) {
                responder.tx.send(
                    json!({
                        "type": "pair_matched",
                        "peerCode": from_code,
                        "peerPublicKey": request.from_public_key,
                        "isInitiator": false,
                    })
                    .to_string(),
                );
            }
        } else if let Some(requester) = requester {
            requester.tx.send(
                json!({ "type": "pair_rejected", "peerCode": to_code }).to_string(),
            );
        }

        Ok(())
    }

    /// Routes an opaque signaling payload to whatever session currently
    /// owns `peer_code`, without inspecting it.
    pub fn forward_signal(&self, sessions: &SessionRegistry, peer_code: &str, frame: &str) {
        if let Some(target) = sessions.get_by_code(peer_code) {
            target.tx.send(frame.to_string());
        }
    }

    /// Purges every request touching `code`, decrementing fan-in counts.
    /// Called when a session with a bound code disconnects.
    pub fn cancel_for_code(&self, code: &str) {
        let mut inner = self.inner.write();
        let to_remove: Vec<RequestKey> = inner
            .requests
            .keys()
            .filter(|(from, to)| from == code || to == code)
            .cloned()
            .collect();

        for key in to_remove {
            inner.requests.remove(&key);
            if let Some(count) = inner.fan_in.get_mut(&key.1) {
                *count = count.saturating_sub(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{channel::Tx, SessionHandle};
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;

    fn session(id: &str) -> (Arc<SessionHandle>, tokio::sync::mpsc::UnboundedReceiver<crate::session::channel::ChannelSignal>) {
        let (tx, rx) = unbounded_channel();
        (Arc::new(SessionHandle::new(id.to_string(), Tx(tx), 100, 30)), rx)
    }

    #[test]
    fn fan_in_cap_rejects_eleventh_request() {
        let sessions = Arc::new(SessionRegistry::new());
        let registry = Arc::new(PairingRegistry::new(PairingConfig {
            request_timeout_ms: 120_000,
            request_warning_before_ms: 30_000,
            max_fan_in: 10,
        }));

        let (target, _rx) = session("target");
        sessions.insert(target.clone());
        sessions.bind_code("TARGET", "target").unwrap();
        *target.pairing_code.write() = Some("TARGET".to_string());

        for i in 0..10 {
            let code = format!("REQ{:03}", i);
            let (s, _rx) = session(&code);
            sessions.insert(s.clone());
            sessions.bind_code(&code, &code).unwrap();
            *s.pairing_code.write() = Some(code.clone());
            assert!(registry.request(&sessions, &code, "TARGET", "pk").is_ok());
        }

        let (eleventh, _rx) = session("eleventh");
        sessions.insert(eleventh);
        sessions.bind_code("ELEVENT", "eleventh").unwrap();
        assert!(registry.request(&sessions, "ELEVENT", "TARGET", "pk").is_err());
    }

    #[test]
    fn accept_emits_matched_to_both_sides_with_correct_initiator() {
        let sessions = Arc::new(SessionRegistry::new());
        let registry = PairingRegistry::new(PairingConfig {
            request_timeout_ms: 120_000,
            request_warning_before_ms: 30_000,
            max_fan_in: 10,
        });

        let (requester, mut requester_rx) = session("requester");
        *requester.pairing_code.write() = Some("FROMCD".to_string());
        sessions.insert(requester.clone());
        sessions.bind_code("FROMCD", "requester").unwrap();

        let (responder, mut responder_rx) = session("responder");
        *responder.pairing_code.write() = Some("TOCODE".to_string());
        *responder.public_key.write() = Some("pk-responder".to_string());
        sessions.insert(responder.clone());
        sessions.bind_code("TOCODE", "responder").unwrap();

        let arc_registry = Arc::new(registry);
        arc_registry
            .request(&sessions, "FROMCD", "TOCODE", "pk-requester")
            .unwrap();
        requester_rx.try_recv().ok();

        arc_registry
            .respond(&sessions, "FROMCD", "TOCODE", true)
            .unwrap();

        let to_requester = requester_rx.try_recv().unwrap();
        let to_responder = responder_rx.try_recv().unwrap();
        match (to_requester, to_responder) {
            (crate::session::channel::ChannelSignal::Body(a), crate::session::channel::ChannelSignal::Body(b)) => {
                assert!(a.contains("\"isInitiator\":true"));
                assert!(b.contains("\"isInitiator\":false"));
            }
            _ => panic!("expected body frames"),
        }
    }
}
