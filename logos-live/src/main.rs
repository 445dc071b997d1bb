use std::sync::Arc;

use log::{error, info};

use logos_live::document::InMemoryMap;
use logos_live::server::{ServerConfig, SessionServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!(
        "Starting {} on {} ({}x{} map)...",
        config.server_name, config.bind_addr, config.map_width, config.map_height
    );

    let map = Arc::new(InMemoryMap::new(
        config.server_name.clone(),
        config.map_width,
        config.map_height,
    ));

    let server = match SessionServer::new(config, map) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start server: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
