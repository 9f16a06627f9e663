//! Central dispatcher: decodes one frame, checks registration/rate-limit
//! gating, and routes to the subsystem that owns the operation. Mirrors
//! the teacher's tagged-dispatch `Hub::process` / `process_message` split,
//! generalized from a fixed STUN message kind to this protocol's `type`.

use serde_json::{json, Value};
use std::sync::Arc;

use crate::{
    attestation::AttestationGateway,
    channels::ChannelFanout,
    chunk::{ChunkRelay, ChunkRequestOutcome},
    config::Config,
    error::ProtocolError,
    federation::HashRing,
    pairing::PairingRegistry,
    protocol::{is_valid_public_key, Inbound},
    rendezvous::RendezvousRegistry,
    session::{SessionHandle, SessionRegistry},
};

pub struct Hub {
    pub config: Arc<Config>,
    pub sessions: Arc<SessionRegistry>,
    pub pairing: Arc<PairingRegistry>,
    pub rendezvous: Arc<RendezvousRegistry>,
    pub chunk: Arc<ChunkRelay>,
    pub channels: Arc<ChannelFanout>,
    pub federation: Arc<HashRing>,
    pub attestation: Arc<AttestationGateway>,
}

fn error_frame(err: ProtocolError) -> String {
    let mut frame = json!({ "type": "error", "message": err.to_string() });
    if let Some(code) = err.code() {
        frame["code"] = json!(code);
    }
    frame.to_string()
}

const KNOWN_TYPES: &[&str] = &[
    "register",
    "pair_request",
    "pair_response",
    "signal_forward",
    "ping",
    "heartbeat",
    "register_rendezvous",
    "channel-owner-register",
    "channel-subscribe",
    "upstream-message",
    "stream-start",
    "stream-frame",
    "stream-end",
    "chunk_announce",
    "chunk_request",
    "chunk_push",
    "attest_request",
    "attest_response",
];

const ALWAYS_ALLOWED: &[&str] = &["register", "ping", "attest_request", "attest_response"];

impl Hub {
    /// Handles one inbound text frame for `session_id`. Never panics and
    /// never returns an error to the caller — every failure path emits a
    /// structured frame on the session's own outbound channel.
    pub async fn dispatch(&self, session_id: &str, text: &str) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        session.touch();

        if !session.frame_limiter.check() {
            session.tx.send(error_frame(ProtocolError::RateLimited));
            return;
        }

        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                session.tx.send(error_frame(ProtocolError::InvalidJson));
                return;
            }
        };

        let Some(kind) = value.get("type").and_then(Value::as_str) else {
            session.tx.send(error_frame(ProtocolError::MissingField("type")));
            return;
        };

        if !KNOWN_TYPES.contains(&kind) {
            session.tx.send(error_frame(ProtocolError::UnknownMessageType));
            return;
        }

        if !session.is_registered() && !ALWAYS_ALLOWED.contains(&kind) {
            session.tx.send(error_frame(ProtocolError::NotRegistered));
            return;
        }

        let frame: Inbound = match serde_json::from_value(value) {
            Ok(f) => f,
            Err(_) => {
                session.tx.send(error_frame(ProtocolError::InvalidJson));
                return;
            }
        };

        self.dispatch_frame(&session, frame).await;
    }

    async fn dispatch_frame(&self, session: &Arc<SessionHandle>, frame: Inbound) {
        match frame {
            Inbound::Register { pairing_code, public_key } => self.handle_register(session, pairing_code, public_key),
            Inbound::PairRequest { target_code } => self.handle_pair_request(session, target_code),
            Inbound::PairResponse { target_code, accepted } => {
                self.handle_pair_response(session, target_code, accepted)
            }
            Inbound::SignalForward { peer_code, payload } => self.handle_signal_forward(session, peer_code, payload),
            Inbound::Ping => session.tx.send(json!({ "type": "pong", "serverTime": now_millis() }).to_string()),
            Inbound::Heartbeat => {
                session.tx.send(json!({ "type": "heartbeat_ack", "serverTime": now_millis() }).to_string())
            }
            Inbound::RegisterRendezvous { points, tokens, mut dead_drops, dead_drop, relay_id } => {
                if let Some(legacy) = dead_drop {
                    if let Some(point) = points.first() {
                        dead_drops.entry(point.clone()).or_insert(legacy);
                    }
                }
                self.handle_register_rendezvous(session, points, tokens, dead_drops, relay_id).await
            }
            Inbound::ChannelOwnerRegister { channel_id } => {
                self.channels.register_owner(&self.sessions, &session.id, &channel_id);
                session.tx.send(json!({ "type": "channel-owner-registered", "channelId": channel_id }).to_string());
            }
            Inbound::ChannelSubscribe { channel_id } => {
                self.channels.subscribe(&self.sessions, &session.id, &channel_id);
                session.tx.send(json!({ "type": "channel-subscribed", "channelId": channel_id }).to_string());
            }
            Inbound::UpstreamMessage { channel_id, message, ephemeral_public_key } => {
                self.handle_upstream_message(session, channel_id, message, ephemeral_public_key)
            }
            Inbound::StreamStart { channel_id, title } => self.handle_stream_start(session, channel_id, title),
            Inbound::StreamFrame { channel_id, frame } => {
                self.channels.stream_frame(&self.sessions, &session.id, &channel_id, frame)
            }
            Inbound::StreamEnd { channel_id } => self.handle_stream_end(session, channel_id),
            Inbound::ChunkAnnounce { peer_id, chunks } => self.handle_chunk_announce(session, peer_id, chunks).await,
            Inbound::ChunkRequest { chunk_id, channel_id } => {
                self.handle_chunk_request(session, chunk_id, channel_id).await
            }
            Inbound::ChunkPush { chunk_id, channel_id, data } => {
                self.handle_chunk_push(session, chunk_id, channel_id, data).await
            }
            Inbound::AttestRequest { build_token, device_id } => {
                self.handle_attest_request(session, build_token, device_id).await
            }
            Inbound::AttestResponse { nonce, responses } => self.handle_attest_response(session, nonce, responses).await,
        }
    }

    fn handle_register(&self, session: &Arc<SessionHandle>, pairing_code: String, public_key: String) {
        if !is_valid_public_key(&public_key) {
            session.tx.send(error_frame(ProtocolError::MissingField("publicKey")));
            return;
        }

        match self.pairing.register(&self.sessions, &session.id, &pairing_code, &public_key) {
            Ok(()) => {
                let redirects = self.federation.redirect_targets(std::slice::from_ref(&pairing_code));
                let mut body = json!({ "type": "registered", "pairingCode": pairing_code });
                if !redirects.is_empty() {
                    body["redirects"] = json!(redirects
                        .iter()
                        .map(|t| json!({ "serverId": t.server_id, "endpoint": t.endpoint, "hashes": t.hashes }))
                        .collect::<Vec<_>>());
                }
                session.tx.send(body.to_string());
            }
            Err(err) => session.tx.send(error_frame(err)),
        }
    }

    fn handle_pair_request(&self, session: &Arc<SessionHandle>, target_code: String) {
        let Some(from_code) = session.pairing_code.read().clone() else {
            session.tx.send(error_frame(ProtocolError::NotRegistered));
            return;
        };
        let from_public_key = session.public_key.read().clone().unwrap_or_default();

        if let Err(err) = self.pairing.request(&self.sessions, &from_code, &target_code, &from_public_key) {
            session.tx.send(
                json!({ "type": "pair_error", "error": err.to_string() }).to_string(),
            );
        }
    }

    fn handle_pair_response(&self, session: &Arc<SessionHandle>, target_code: String, accepted: bool) {
        let Some(to_code) = session.pairing_code.read().clone() else {
            session.tx.send(error_frame(ProtocolError::NotRegistered));
            return;
        };

        if let Err(err) = self.pairing.respond(&self.sessions, &target_code, &to_code, accepted) {
            session.tx.send(
                json!({ "type": "pair_error", "error": err.to_string() }).to_string(),
            );
        }
    }

    fn handle_signal_forward(&self, _session: &Arc<SessionHandle>, peer_code: String, payload: Value) {
        let frame = json!({ "type": "signal_forward", "payload": payload }).to_string();
        self.pairing.forward_signal(&self.sessions, &peer_code, &frame);
    }

    async fn handle_register_rendezvous(
        &self,
        session: &Arc<SessionHandle>,
        points: Vec<String>,
        tokens: Vec<String>,
        dead_drops: std::collections::HashMap<String, String>,
        relay_id: String,
    ) {
        let peer_id = session.pairing_code.read().clone().unwrap_or_else(|| session.id.clone());
        let result = self
            .rendezvous
            .register(&self.sessions, &peer_id, &points, &tokens, &dead_drops.into_iter().collect(), &relay_id)
            .await;

        session.tx.send(
            json!({
                "type": "rendezvous_result",
                "liveMatches": result.live_matches.iter().map(|(p, r)| json!({"peerId": p, "relayId": r})).collect::<Vec<_>>(),
                "deadDrops": result.dead_drops,
            })
            .to_string(),
        );
    }

    fn handle_upstream_message(
        &self,
        session: &Arc<SessionHandle>,
        channel_id: String,
        message: Value,
        ephemeral_public_key: String,
    ) {
        if !session.upstream_limiter.check() {
            session.tx.send(error_frame(ProtocolError::UpstreamRateLimited));
            return;
        }

        let message_id = message.get("id").cloned().unwrap_or(Value::Null);
        self.channels
            .upstream_message(&self.sessions, &channel_id, message, &ephemeral_public_key);
        session.tx.send(json!({ "type": "upstream-ack", "messageId": message_id }).to_string());
    }

    fn handle_stream_start(&self, session: &Arc<SessionHandle>, channel_id: String, title: Option<String>) {
        let stream_id = uuid::Uuid::new_v4().to_string();
        match self.channels.stream_start(&self.sessions, &session.id, &channel_id, &stream_id, title) {
            Ok(subscriber_count) => {
                session.tx.send(json!({ "type": "stream-started", "subscriberCount": subscriber_count }).to_string())
            }
            Err(err) => session.tx.send(error_frame(err)),
        }
    }

    fn handle_stream_end(&self, session: &Arc<SessionHandle>, channel_id: String) {
        match self.channels.stream_end(&self.sessions, &session.id, &channel_id) {
            Ok(()) => session.tx.send(json!({ "type": "stream-ended" }).to_string()),
            Err(err) => session.tx.send(error_frame(err)),
        }
    }

    async fn handle_chunk_announce(
        &self,
        session: &Arc<SessionHandle>,
        peer_id: String,
        chunks: Vec<crate::protocol::ChunkAnnounceEntry>,
    ) {
        if let Err(err) = self.attestation.check_chunk_permission(session) {
            session.tx.send(error_frame(err));
            return;
        }

        let entries: Vec<(String, String)> = chunks
            .into_iter()
            .map(|c| (c.chunk_id.unwrap_or_default(), c.channel_id))
            .collect();
        let registered = self.chunk.announce(&peer_id, &entries).await;
        session.tx.send(json!({ "type": "chunk_announce_ack", "registered": registered }).to_string());
    }

    async fn handle_chunk_request(&self, session: &Arc<SessionHandle>, chunk_id: String, channel_id: String) {
        if let Err(err) = self.attestation.check_chunk_permission(session) {
            session.tx.send(error_frame(err));
            return;
        }

        match self.chunk.request(&self.sessions, &session.id, &chunk_id, &channel_id).await {
            Ok(ChunkRequestOutcome::CacheHit(data)) => {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(data);
                session.tx.send(
                    json!({ "type": "chunk_response", "chunkId": chunk_id, "source": "cache", "data": encoded })
                        .to_string(),
                );
            }
            Ok(ChunkRequestOutcome::Pulling) => {
                session.tx.send(json!({ "type": "chunk_pulling", "chunkId": chunk_id }).to_string())
            }
            Err(err) => session.tx.send(json!({ "type": "chunk_error", "error": err.to_string() }).to_string()),
        }
    }

    async fn handle_chunk_push(&self, session: &Arc<SessionHandle>, chunk_id: String, channel_id: String, data: String) {
        if let Err(err) = self.attestation.check_chunk_permission(session) {
            session.tx.send(error_frame(err));
            return;
        }

        let peer_id = session.pairing_code.read().clone().unwrap_or_else(|| session.id.clone());
        match self.chunk.push(&self.sessions, &peer_id, &chunk_id, &channel_id, &data).await {
            Ok(served_count) => session.tx.send(
                json!({ "type": "chunk_push_ack", "chunkId": chunk_id, "cached": true, "servedCount": served_count })
                    .to_string(),
            ),
            Err(err) => session.tx.send(error_frame(err)),
        }
    }

    async fn handle_attest_request(&self, session: &Arc<SessionHandle>, build_token: String, device_id: String) {
        match self.attestation.request_challenge(session, &build_token, &device_id).await {
            Ok(frame) => session.tx.send(frame),
            Err(message) => session.tx.send(json!({ "type": "attest_error", "message": message }).to_string()),
        }
    }

    async fn handle_attest_response(
        &self,
        session: &Arc<SessionHandle>,
        nonce: String,
        responses: Vec<crate::protocol::AttestResponseEntry>,
    ) {
        if responses.is_empty() {
            session
                .tx
                .send(json!({ "type": "attest_failed", "message": "attestation responses must not be empty" }).to_string());
            session.tx.close();
            return;
        }

        match self.attestation.verify_response(session, &nonce, &responses).await {
            Ok(frame) => session.tx.send(frame),
            Err(message) => {
                session.tx.send(json!({ "type": "attest_failed", "message": message }).to_string());
                session.tx.close();
            }
        }
    }

    /// Called when a session's socket closes: unwinds everything it held
    /// across every registry.
    pub async fn remove_session(&self, session_id: &str) {
        let Some(session) = self.sessions.remove(session_id) else {
            return;
        };

        if let Some(code) = session.pairing_code.read().clone() {
            self.pairing.cancel_for_code(&code);
            if let Err(err) = self.chunk.remove_peer_sources(&code).await {
                log::warn!("failed to clear chunk sources for disconnecting peer: {err}");
            }
        }

        self.chunk.remove_pending_requester(session_id);
        self.channels.remove_session(&self.sessions, session_id);
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
