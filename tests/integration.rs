//! End-to-end scenarios driven straight through `Hub::dispatch`, the way a
//! client's JSON frames would arrive over the WebSocket in production.
//! These seed the test suite called out in the design's testable-properties
//! section: pairing happy path, fan-in cap, chunk dedup/cache, and the
//! upstream-queue flush-on-rebind ordering guarantee.

use std::sync::Arc;

use meetpoint_signal::{
    attestation::AttestationGateway,
    channels::ChannelFanout,
    chunk::ChunkRelay,
    config,
    federation::HashRing,
    hub::Hub,
    pairing::PairingRegistry,
    rendezvous::RendezvousRegistry,
    session::{channel::{ChannelSignal, Tx}, SessionHandle, SessionRegistry},
    storage::memory::MemoryStorage,
};
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

fn test_hub() -> Arc<Hub> {
    let federation = Arc::new(HashRing::new("local".to_string(), 16));
    federation.add_node("local", "127.0.0.1:8080");
    test_hub_with_federation(federation)
}

/// Like `test_hub`, but lets a test shape the ring membership before the
/// `Hub` is built — used to deterministically exercise the redirect path.
fn test_hub_with_federation(federation: Arc<HashRing>) -> Arc<Hub> {
    let storage: Arc<dyn meetpoint_signal::storage::Storage> = Arc::new(MemoryStorage::new());
    let sessions = Arc::new(SessionRegistry::new());

    Arc::new(Hub {
        sessions,
        pairing: Arc::new(PairingRegistry::new(config::Pairing {
            request_timeout_ms: 120_000,
            request_warning_before_ms: 30_000,
            max_fan_in: 10,
        })),
        rendezvous: Arc::new(RendezvousRegistry::new(
            storage.clone(),
            config::Rendezvous {
                daily_ttl_secs: 48 * 3600,
                hourly_ttl_secs: 3 * 3600,
                sweep_interval_secs: 300,
            },
        )),
        chunk: Arc::new(ChunkRelay::new(
            storage.clone(),
            config::Chunk {
                max_payload_bytes: 4096,
                cache_capacity: 1000,
                cache_ttl_secs: 1800,
                source_ttl_secs: 3600,
                sweep_interval_secs: 300,
            },
        )),
        channels: Arc::new(ChannelFanout::new(config::Channels {
            upstream_queue_capacity: 100,
            upstream_rate_per_min: 30,
        })),
        federation,
        attestation: Arc::new(AttestationGateway::new(config::Attestation {
            bootstrap_url: None,
            ..Default::default()
        })),
        config: Arc::new(test_config()),
    })
}

fn test_config() -> config::Config {
    toml::from_str("").unwrap()
}

/// Registers a fresh session under `hub`, returning its handle and a
/// receiver for every frame the server sends it (the server-announcement
/// frames sent at connect time in `Connection::new` are not replayed here,
/// since the harness calls `Hub::dispatch` directly rather than running a
/// real connection).
fn spawn_session(hub: &Hub) -> (Arc<SessionHandle>, UnboundedReceiver<ChannelSignal>) {
    let (tx, rx) = unbounded_channel();
    let id = uuid::Uuid::new_v4().to_string();
    let handle = Arc::new(SessionHandle::new(id, Tx(tx), 100, 30));
    hub.sessions.insert(handle.clone());
    (handle, rx)
}

async fn recv_json(rx: &mut UnboundedReceiver<ChannelSignal>) -> Value {
    match rx.recv().await.expect("expected a frame") {
        ChannelSignal::Body(body) => serde_json::from_str(&body).unwrap(),
        ChannelSignal::Close => panic!("expected a frame, got close"),
    }
}

fn frame(json: serde_json::Value) -> String {
    json.to_string()
}

/// Deterministic, distinct 6-character codes drawn from the pairing-code
/// alphabet (which excludes 0/O/1/I) so generated test codes never trip
/// `is_valid_pairing_code`.
fn pairing_code(i: usize) -> String {
    const ALPHA: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut n = i + 1_000;
    let mut s = String::new();
    for _ in 0..6 {
        s.push(ALPHA[n % ALPHA.len()] as char);
        n /= ALPHA.len();
    }
    s
}

#[tokio::test]
async fn pair_happy_path() {
    let hub = test_hub();
    let (a, mut a_rx) = spawn_session(&hub);
    let (b, mut b_rx) = spawn_session(&hub);

    hub.dispatch(&a.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "REQ234",
        "publicKey": base64_of(&[1u8; 32]),
    }))).await;
    assert_eq!(recv_json(&mut a_rx).await["type"], "registered");

    hub.dispatch(&b.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "TGT567",
        "publicKey": base64_of(&[2u8; 32]),
    }))).await;
    assert_eq!(recv_json(&mut b_rx).await["type"], "registered");

    hub.dispatch(&a.id, &frame(serde_json::json!({
        "type": "pair_request", "targetCode": "TGT567",
    }))).await;

    let incoming = recv_json(&mut b_rx).await;
    assert_eq!(incoming["type"], "pair_incoming");
    assert_eq!(incoming["fromCode"], "REQ234");
    assert_eq!(incoming["expiresIn"], 120000);

    hub.dispatch(&b.id, &frame(serde_json::json!({
        "type": "pair_response", "targetCode": "REQ234", "accepted": true,
    }))).await;

    let to_a = recv_json(&mut a_rx).await;
    assert_eq!(to_a["type"], "pair_matched");
    assert_eq!(to_a["peerCode"], "TGT567");
    assert_eq!(to_a["isInitiator"], true);

    let to_b = recv_json(&mut b_rx).await;
    assert_eq!(to_b["type"], "pair_matched");
    assert_eq!(to_b["peerCode"], "REQ234");
    assert_eq!(to_b["isInitiator"], false);
}

#[tokio::test]
async fn pair_fan_in_cap_rejects_eleventh() {
    let hub = test_hub();
    let (target, mut target_rx) = spawn_session(&hub);
    hub.dispatch(&target.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "TARGET",
        "publicKey": base64_of(&[0u8; 32]),
    }))).await;
    recv_json(&mut target_rx).await;

    for i in 0..10 {
        let (requester, mut rx) = spawn_session(&hub);
        let code = pairing_code(i);
        hub.dispatch(&requester.id, &frame(serde_json::json!({
            "type": "register", "pairingCode": code, "publicKey": base64_of(&[0u8; 32]),
        }))).await;
        recv_json(&mut rx).await;

        hub.dispatch(&requester.id, &frame(serde_json::json!({
            "type": "pair_request", "targetCode": "TARGET",
        }))).await;
        let incoming = recv_json(&mut target_rx).await;
        assert_eq!(incoming["type"], "pair_incoming");
    }

    let (eleventh, mut eleventh_rx) = spawn_session(&hub);
    hub.dispatch(&eleventh.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "ELEVEN", "publicKey": base64_of(&[0u8; 32]),
    }))).await;
    recv_json(&mut eleventh_rx).await;

    hub.dispatch(&eleventh.id, &frame(serde_json::json!({
        "type": "pair_request", "targetCode": "TARGET",
    }))).await;
    let rejected = recv_json(&mut eleventh_rx).await;
    assert_eq!(rejected["type"], "pair_error");
}

#[tokio::test]
async fn chunk_pull_dedup_then_cache_hit_for_next_requester() {
    let hub = test_hub();
    let (source, mut source_rx) = spawn_session(&hub);
    hub.dispatch(&source.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "SRCTAP", "publicKey": base64_of(&[0u8; 32]),
    }))).await;
    recv_json(&mut source_rx).await;

    hub.dispatch(&source.id, &frame(serde_json::json!({
        "type": "chunk_announce",
        "peerId": "SRCTAP",
        "chunks": [{"chunkId": "c1", "channelId": "ch1"}],
    }))).await;
    let ack = recv_json(&mut source_rx).await;
    assert_eq!(ack["registered"], 1);

    let (r1, mut r1_rx) = spawn_session(&hub);
    let (r2, mut r2_rx) = spawn_session(&hub);

    hub.dispatch(&r1.id, &frame(serde_json::json!({
        "type": "chunk_request", "chunkId": "c1", "channelId": "ch1",
    }))).await;
    // Source receives exactly one chunk_pull for the whole run.
    let pull = recv_json(&mut source_rx).await;
    assert_eq!(pull["type"], "chunk_pull");
    assert_eq!(recv_json(&mut r1_rx).await["type"], "chunk_pulling");

    hub.dispatch(&r2.id, &frame(serde_json::json!({
        "type": "chunk_request", "chunkId": "c1", "channelId": "ch1",
    }))).await;
    assert_eq!(recv_json(&mut r2_rx).await["type"], "chunk_pulling");
    assert!(source_rx.try_recv().is_err(), "no second chunk_pull should be sent");

    let data = base64_of(b"hello world chunk payload");
    hub.dispatch(&source.id, &frame(serde_json::json!({
        "type": "chunk_push", "chunkId": "c1", "channelId": "ch1", "data": data,
    }))).await;

    let to_r1 = recv_json(&mut r1_rx).await;
    let to_r2 = recv_json(&mut r2_rx).await;
    assert_eq!(to_r1["source"], "relay");
    assert_eq!(to_r2["source"], "relay");
    assert_eq!(to_r1["data"], to_r2["data"]);

    let push_ack = recv_json(&mut source_rx).await;
    assert_eq!(push_ack["servedCount"], 2);

    // A fresh requester now hits the cache — no further chunk_pull.
    let (r3, mut r3_rx) = spawn_session(&hub);
    hub.dispatch(&r3.id, &frame(serde_json::json!({
        "type": "chunk_request", "chunkId": "c1", "channelId": "ch1",
    }))).await;
    let cached = recv_json(&mut r3_rx).await;
    assert_eq!(cached["source"], "cache");
    assert!(source_rx.try_recv().is_err());
}

#[tokio::test]
async fn owner_offline_queues_upstream_then_flushes_in_order_on_rebind() {
    let hub = test_hub();

    let (subscriber, mut sub_rx) = spawn_session(&hub);
    hub.dispatch(&subscriber.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "SUBSCR", "publicKey": base64_of(&[0u8; 32]),
    }))).await;
    recv_json(&mut sub_rx).await;

    hub.dispatch(&subscriber.id, &frame(serde_json::json!({
        "type": "upstream-message",
        "channelId": "ch_up",
        "message": {"id": "up_queued"},
        "ephemeralPublicKey": "key123",
    }))).await;
    let ack = recv_json(&mut sub_rx).await;
    assert_eq!(ack["type"], "upstream-ack");
    assert_eq!(ack["messageId"], "up_queued");

    let (owner, mut owner_rx) = spawn_session(&hub);
    hub.dispatch(&owner.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "CHANEL", "publicKey": base64_of(&[0u8; 32]),
    }))).await;
    recv_json(&mut owner_rx).await;

    hub.dispatch(&owner.id, &frame(serde_json::json!({
        "type": "channel-owner-register", "channelId": "ch_up",
    }))).await;

    let queued = recv_json(&mut owner_rx).await;
    assert_eq!(queued["type"], "upstream-message");
    assert_eq!(queued["message"]["id"], "up_queued");

    let registered = recv_json(&mut owner_rx).await;
    assert_eq!(registered["type"], "channel-owner-registered");
}

#[tokio::test]
async fn registration_redirects_when_local_node_is_not_primary() {
    // "local" never joins the ring here, so every key's sole alive node is
    // "remote" and registration must always redirect there.
    let federation = Arc::new(HashRing::new("local".to_string(), 16));
    federation.add_node("remote", "10.0.0.2:9000");
    let hub = test_hub_with_federation(federation);

    let (a, mut a_rx) = spawn_session(&hub);
    hub.dispatch(&a.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "REDIRC", "publicKey": base64_of(&[0u8; 32]),
    }))).await;

    let registered = recv_json(&mut a_rx).await;
    assert_eq!(registered["type"], "registered");
    let redirects = registered["redirects"].as_array().expect("expected redirects");
    assert_eq!(redirects.len(), 1);
    assert_eq!(redirects[0]["serverId"], "remote");
    assert_eq!(redirects[0]["endpoint"], "10.0.0.2:9000");
    assert_eq!(redirects[0]["hashes"][0], "REDIRC");
}

#[tokio::test]
async fn rendezvous_dead_drop_round_trip_between_two_peers() {
    let hub = test_hub();

    let (peer_a, mut a_rx) = spawn_session(&hub);
    hub.dispatch(&peer_a.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "PEERAX", "publicKey": base64_of(&[0u8; 32]),
    }))).await;
    recv_json(&mut a_rx).await;

    let (peer_b, mut b_rx) = spawn_session(&hub);
    hub.dispatch(&peer_b.id, &frame(serde_json::json!({
        "type": "register", "pairingCode": "PEERBY", "publicKey": base64_of(&[0u8; 32]),
    }))).await;
    recv_json(&mut b_rx).await;

    // A is first at the meeting point: no one else is there yet.
    hub.dispatch(&peer_a.id, &frame(serde_json::json!({
        "type": "register_rendezvous",
        "points": ["point1"],
        "tokens": [],
        "deadDrops": {"point1": "x-drop"},
        "relayId": "relay1",
    }))).await;
    let a_result = recv_json(&mut a_rx).await;
    assert_eq!(a_result["type"], "rendezvous_result");
    assert_eq!(a_result["deadDrops"].as_object().unwrap().len(), 0);

    // B arrives at the same point and immediately learns A's dead-drop.
    hub.dispatch(&peer_b.id, &frame(serde_json::json!({
        "type": "register_rendezvous",
        "points": ["point1"],
        "tokens": [],
        "deadDrops": {"point1": "y-drop"},
        "relayId": "relay1",
    }))).await;
    let b_result = recv_json(&mut b_rx).await;
    assert_eq!(b_result["deadDrops"]["PEERAX"], "x-drop");

    // A re-registers and now learns B's dead-drop in return.
    hub.dispatch(&peer_a.id, &frame(serde_json::json!({
        "type": "register_rendezvous",
        "points": ["point1"],
        "tokens": [],
        "deadDrops": {"point1": "x-drop"},
        "relayId": "relay1",
    }))).await;
    let a_result2 = recv_json(&mut a_rx).await;
    assert_eq!(a_result2["deadDrops"]["PEERBY"], "y-drop");
}

fn base64_of(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
