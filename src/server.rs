//! Server bootstrap: binds the websocket listener, spawns one task per
//! connection, and spawns the periodic sweepers and bootstrap heartbeat
//! described in the scheduling section of the design. Shaped after
//! `turn-server/src/server/mod.rs::run`, which spawns one worker per
//! concern and logs what it started.

use anyhow::Result;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tungstenite::protocol::WebSocketConfig;

use crate::{config::Config, hub::Hub, session::connection::Connection};

pub async fn run(hub: Arc<Hub>) -> Result<()> {
    let listener = TcpListener::bind(hub.config.listen.addr).await?;
    log::info!("signaling server listening on {}", hub.config.listen.addr);

    spawn_sweepers(hub.clone());
    spawn_heartbeat(hub.clone());

    let ws_config = WebSocketConfig::default();
    loop {
        let (stream, addr) = listener.accept().await?;
        log::trace!("accepted connection from {addr}");
        let hub = hub.clone();
        tokio::spawn(Connection::launch(stream, hub, ws_config));
    }
}

fn spawn_sweepers(hub: Arc<Hub>) {
    let rendezvous_hub = hub.clone();
    let rendezvous_interval = hub.config.rendezvous.sweep_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(rendezvous_interval));
        loop {
            ticker.tick().await;
            if let Err(err) = rendezvous_hub.rendezvous.sweep().await {
                log::warn!("rendezvous sweep failed: {err}");
            }
        }
    });

    let chunk_hub = hub.clone();
    let chunk_interval = hub.config.chunk.sweep_interval_secs;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(chunk_interval));
        loop {
            ticker.tick().await;
            if let Err(err) = chunk_hub.chunk.sweep().await {
                log::warn!("chunk sweep failed: {err}");
            }
        }
    });

    if hub.attestation.is_enabled() {
        let attestation_hub = hub.clone();
        let attestation_interval = hub.config.attestation.sweep_interval_secs;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(attestation_interval));
            loop {
                ticker.tick().await;
                attestation_hub.attestation.sweep(&attestation_hub.sessions);
            }
        });
    }
}

/// Periodically announces this server's identity and alive status to the
/// bootstrap service so peers' hash rings stay current. A failed
/// heartbeat is logged and retried on the next tick, never fatal.
fn spawn_heartbeat(hub: Arc<Hub>) {
    let Some(base) = hub.config.attestation.bootstrap_url.clone() else {
        return;
    };

    let interval_ms = hub.config.heartbeat.interval_ms;
    let config: Arc<Config> = hub.config.clone();
    let public_key = hub.attestation.public_key_b64();
    let client = reqwest::Client::new();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
        loop {
            ticker.tick().await;
            let body = json!({
                "serverId": config.federation.server_id,
                "endpoint": config.federation.endpoint,
                "publicKey": public_key,
            });

            if let Err(err) = client.post(format!("{base}/servers")).json(&body).send().await {
                log::warn!("bootstrap heartbeat failed: {err}");
            }
        }
    });
}
