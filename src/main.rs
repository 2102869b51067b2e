#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;

use dotenv::dotenv;
use poem::{Server, listener::TcpListener};
use ssh_gateway::gateway::{Gateway, GatewayConfig};
use ssh_gateway::server;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let config = GatewayConfig::from_env();
    let addr = config.listen_addr();
    info!(
        "Starting SSH gateway on {} (connect timeout {:?}, queue capacity {})",
        addr, config.connect_timeout, config.queue_capacity
    );

    let gateway = Arc::new(Gateway::from_config(config));

    info!("Clients connect at ws://{}/ws/<session>/ssh/<action>/<params>", addr);

    Server::new(TcpListener::bind(addr))
        .name("SSH Gateway")
        .run(server::app(gateway))
        .await?;

    Ok(())
}
