use std::env;

use poker_sync::server::{RoomServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig {
        bind_addr: env::var("POKER_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:9090".to_string()),
        broadcast_capacity: env::var("POKER_BROADCAST_CAPACITY")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| ServerConfig::default().broadcast_capacity),
    };

    let server = RoomServer::new(config);
    if let Err(e) = server.run().await {
        log::error!("server exited: {e}");
        std::process::exit(1);
    }
}
