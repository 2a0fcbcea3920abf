//! Chat relay server: accepts client connections and routes direct
//! messages between them by user id.

use async_std::prelude::*;
use async_std::{net, task};
use chat_relay::utils::{self, ChatResult};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod handler;
mod outbound;
mod registry;

use registry::Registry;

const DEFAULT_ADDRESS: &str = "0.0.0.0:34752";

fn main() -> ChatResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let address = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_ADDRESS.to_string());
    let registry = Arc::new(Registry::new());

    task::block_on(listen_for_connections(address, registry))
}

/// Accept connections forever, one handler task per client. A failed
/// bind is fatal; a failed accept only costs that one connection.
async fn listen_for_connections(
    addr: impl net::ToSocketAddrs,
    registry: Arc<Registry>,
) -> ChatResult<()> {
    let listener = net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);

    let mut new_connections = listener.incoming();
    loop {
        // `incoming` never yields `None`, so only the per-connection
        // `Result` needs handling here.
        match new_connections.next().await.unwrap() {
            Ok(socket) => {
                let registry = registry.clone();
                task::spawn(utils::log_error(handler::serve_connection(socket, registry)));
            }
            Err(err) => {
                error!("failed to accept a connection: {}", err);
            }
        }
    }
}
