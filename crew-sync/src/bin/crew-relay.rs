//! Development relay for crew-sync clients.
//!
//! Usage: `crew-relay [BIND_ADDR]`. Falls back to `$CREW_RELAY_ADDR`, then
//! `127.0.0.1:9090`. Log level follows `RUST_LOG`.

use crew_sync::server::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CREW_RELAY_ADDR").ok())
    {
        config.bind_addr = addr;
    }

    log::info!("Starting crew relay on {}...", config.bind_addr);
    RelayServer::new(config).run().await
}
