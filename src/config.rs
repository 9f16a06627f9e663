use clap::Parser;
use serde::Deserialize;
use std::{fs::read_to_string, net::SocketAddr};

#[derive(Deserialize, Debug, Clone)]
pub struct Listen {
    /// address this server binds its websocket listener to.
    #[serde(default = "Listen::addr")]
    pub addr: SocketAddr,
}

impl Listen {
    fn addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }
}

impl Default for Listen {
    fn default() -> Self {
        Self { addr: Self::addr() }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Federation {
    /// this server's own identity in the hash ring.
    #[serde(default = "Federation::server_id")]
    pub server_id: String,
    /// endpoint other servers should use to reach this one.
    #[serde(default = "Federation::endpoint")]
    pub endpoint: String,
    /// number of distinct servers a key is replicated to.
    #[serde(default = "Federation::replication_factor")]
    pub replication_factor: usize,
    /// virtual nodes placed on the ring per physical server.
    #[serde(default = "Federation::virtual_nodes")]
    pub virtual_nodes: usize,
}

impl Federation {
    fn server_id() -> String {
        "local".to_string()
    }

    fn endpoint() -> String {
        "127.0.0.1:8080".to_string()
    }

    fn replication_factor() -> usize {
        3
    }

    fn virtual_nodes() -> usize {
        100
    }
}

impl Default for Federation {
    fn default() -> Self {
        Self {
            server_id: Self::server_id(),
            endpoint: Self::endpoint(),
            replication_factor: Self::replication_factor(),
            virtual_nodes: Self::virtual_nodes(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Pairing {
    #[serde(default = "Pairing::request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "Pairing::request_warning_before_ms")]
    pub request_warning_before_ms: u64,
    #[serde(default = "Pairing::max_fan_in")]
    pub max_fan_in: usize,
}

impl Pairing {
    fn request_timeout_ms() -> u64 {
        120_000
    }

    fn request_warning_before_ms() -> u64 {
        30_000
    }

    fn max_fan_in() -> usize {
        10
    }
}

impl Default for Pairing {
    fn default() -> Self {
        Self {
            request_timeout_ms: Self::request_timeout_ms(),
            request_warning_before_ms: Self::request_warning_before_ms(),
            max_fan_in: Self::max_fan_in(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Rendezvous {
    #[serde(default = "Rendezvous::daily_ttl_secs")]
    pub daily_ttl_secs: u64,
    #[serde(default = "Rendezvous::hourly_ttl_secs")]
    pub hourly_ttl_secs: u64,
    #[serde(default = "Rendezvous::sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Rendezvous {
    fn daily_ttl_secs() -> u64 {
        48 * 3600
    }

    fn hourly_ttl_secs() -> u64 {
        3 * 3600
    }

    fn sweep_interval_secs() -> u64 {
        300
    }
}

impl Default for Rendezvous {
    fn default() -> Self {
        Self {
            daily_ttl_secs: Self::daily_ttl_secs(),
            hourly_ttl_secs: Self::hourly_ttl_secs(),
            sweep_interval_secs: Self::sweep_interval_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Chunk {
    #[serde(default = "Chunk::max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default = "Chunk::cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "Chunk::cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    #[serde(default = "Chunk::source_ttl_secs")]
    pub source_ttl_secs: u64,
    #[serde(default = "Chunk::sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Chunk {
    fn max_payload_bytes() -> usize {
        4096
    }

    fn cache_capacity() -> usize {
        1000
    }

    fn cache_ttl_secs() -> u64 {
        30 * 60
    }

    fn source_ttl_secs() -> u64 {
        3600
    }

    fn sweep_interval_secs() -> u64 {
        300
    }
}

impl Default for Chunk {
    fn default() -> Self {
        Self {
            max_payload_bytes: Self::max_payload_bytes(),
            cache_capacity: Self::cache_capacity(),
            cache_ttl_secs: Self::cache_ttl_secs(),
            source_ttl_secs: Self::source_ttl_secs(),
            sweep_interval_secs: Self::sweep_interval_secs(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Channels {
    #[serde(default = "Channels::upstream_queue_capacity")]
    pub upstream_queue_capacity: usize,
    #[serde(default = "Channels::upstream_rate_per_min")]
    pub upstream_rate_per_min: u32,
}

impl Channels {
    fn upstream_queue_capacity() -> usize {
        100
    }

    fn upstream_rate_per_min() -> u32 {
        30
    }
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            upstream_queue_capacity: Self::upstream_queue_capacity(),
            upstream_rate_per_min: Self::upstream_rate_per_min(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct Attestation {
    /// bootstrap attestation service. attestation is disabled if unset.
    #[serde(default)]
    pub bootstrap_url: Option<String>,
    #[serde(default = "Attestation::grace_period_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "Attestation::session_token_ttl_secs")]
    pub session_token_ttl_secs: u64,
    #[serde(default = "Attestation::sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// fixed seed for this server's Ed25519 identity keypair, useful for
    /// tests and for keeping the same identity across restarts.
    #[serde(default)]
    pub identity_key_seed: Option<String>,
}

impl Attestation {
    fn grace_period_ms() -> u64 {
        30_000
    }

    fn session_token_ttl_secs() -> u64 {
        3600
    }

    fn sweep_interval_secs() -> u64 {
        30
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct Session {
    #[serde(default = "Session::frame_rate_per_min")]
    pub frame_rate_per_min: u32,
    #[serde(default = "Session::max_connections_per_peer")]
    pub max_connections_per_peer: usize,
}

impl Session {
    fn frame_rate_per_min() -> u32 {
        100
    }

    fn max_connections_per_peer() -> usize {
        20
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            frame_rate_per_min: Self::frame_rate_per_min(),
            max_connections_per_peer: Self::max_connections_per_peer(),
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Clone)]
pub struct Heartbeat {
    #[serde(default = "Heartbeat::interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "Heartbeat::timeout_ms")]
    pub timeout_ms: u64,
}

impl Heartbeat {
    fn interval_ms() -> u64 {
        30_000
    }

    fn timeout_ms() -> u64 {
        90_000
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            interval_ms: Self::interval_ms(),
            timeout_ms: Self::timeout_ms(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(default)]
    pub listen: Listen,
    #[serde(default)]
    pub federation: Federation,
    #[serde(default)]
    pub pairing: Pairing,
    #[serde(default)]
    pub rendezvous: Rendezvous,
    #[serde(default)]
    pub chunk: Chunk,
    #[serde(default)]
    pub channels: Channels,
    #[serde(default)]
    pub attestation: Attestation,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub heartbeat: Heartbeat,
    #[serde(default)]
    pub log: Log,
    /// sqlite connection string for the durable storage layer.
    #[serde(default = "Config::database_url")]
    pub database_url: String,
}

impl Config {
    fn database_url() -> String {
        "sqlite://signaling.db".to_string()
    }
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
struct Cli {
    /// specify the configuration file path.
    #[arg(long)]
    config: Option<String>,

    /// override listen.addr.
    #[arg(long, env = "SIGNAL_LISTEN")]
    listen: Option<SocketAddr>,

    /// override attestation.bootstrap_url.
    #[arg(long, env = "SIGNAL_BOOTSTRAP_URL")]
    bootstrap_url: Option<String>,

    /// override log.level.
    #[arg(long, env = "SIGNAL_LOG_LEVEL")]
    log_level: Option<String>,
}

impl Config {
    /// Load command line parameters, if the configuration file path is
    /// specified, the configuration is read from the configuration file,
    /// otherwise the default configuration is used. CLI/env overrides are
    /// applied on top of the file.
    pub fn load() -> anyhow::Result<Self> {
        let cli = Cli::parse();
        let cfg_str = cli
            .config
            .as_ref()
            .map(read_to_string)
            .transpose()?
            .unwrap_or_default();

        let mut config: Config = toml::from_str(&cfg_str)?;

        if let Some(addr) = cli.listen {
            config.listen.addr = addr;
        }

        if let Some(url) = cli.bootstrap_url {
            config.attestation.bootstrap_url = Some(url);
        }

        if let Some(level) = cli.log_level {
            config.log.level = match level.to_lowercase().as_str() {
                "error" => LogLevel::Error,
                "warn" => LogLevel::Warn,
                "info" => LogLevel::Info,
                "debug" => LogLevel::Debug,
                "trace" => LogLevel::Trace,
                _ => LogLevel::Info,
            };
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_table() {
        let cfg: Config = toml::from_str("").unwrap();
        assert_eq!(cfg.pairing.max_fan_in, 10);
        assert_eq!(cfg.chunk.max_payload_bytes, 4096);
        assert_eq!(cfg.chunk.cache_capacity, 1000);
        assert_eq!(cfg.channels.upstream_queue_capacity, 100);
        assert_eq!(cfg.attestation.grace_period_ms, 30_000);
        assert!(cfg.attestation.bootstrap_url.is_none());
    }
}
