use std::sync::Arc;

use meetpoint_signal::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;
    meetpoint_signal::server_main(config).await
}
