pub mod attestation;
pub mod channels;
pub mod chunk;
pub mod config;
pub mod error;
pub mod federation;
pub mod hub;
pub mod pairing;
pub mod protocol;
pub mod rendezvous;
pub mod server;
pub mod session;
pub mod storage;

use std::sync::Arc;

use config::Config;
use hub::Hub;
use storage::sqlite::SqliteStorage;

/// Wires every subsystem together from a loaded `Config` and runs the
/// server until the process is asked to stop. Kept separate from `main`
/// so integration tests can start a real server in-process, the way
/// `turn_server::server_main` does for the teacher's test suite.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let storage: Arc<dyn storage::Storage> = Arc::new(SqliteStorage::connect(&config.database_url).await?);

    let federation = Arc::new(federation::HashRing::new(
        config.federation.server_id.clone(),
        config.federation.virtual_nodes,
    ));

    // Rebuild the ring from whatever membership this server persisted last
    // time it ran, rather than starting from an empty ring.
    for row in storage.all_membership().await? {
        if row.status == "alive" {
            federation.add_node(&row.server_id, &row.endpoint);
        }
    }
    federation.add_node(&config.federation.server_id, &config.federation.endpoint);
    storage
        .upsert_membership(storage::MembershipRow {
            server_id: config.federation.server_id.clone(),
            endpoint: config.federation.endpoint.clone(),
            status: "alive".to_string(),
        })
        .await?;

    let hub = Arc::new(Hub {
        sessions: Arc::new(session::SessionRegistry::new()),
        pairing: Arc::new(pairing::PairingRegistry::new(config.pairing.clone())),
        rendezvous: Arc::new(rendezvous::RendezvousRegistry::new(storage.clone(), config.rendezvous.clone())),
        chunk: Arc::new(chunk::ChunkRelay::new(storage.clone(), config.chunk.clone())),
        channels: Arc::new(channels::ChannelFanout::new(config.channels.clone())),
        federation,
        attestation: Arc::new(attestation::AttestationGateway::new(config.attestation.clone())),
        config: config.clone(),
    });

    tokio::select! {
        result = server::run(hub) => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("received shutdown signal, stopping");
            Ok(())
        }
    }
}
