use anyhow::Context;
use confman::config::NodeConfig;
use confman::node::ConfmanNode;
use confman::store::MemoryStore;
use confman::transport::HttpTransport;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = env::args()
        .nth(1)
        .map(PathBuf::from)
        .context("usage: confman-node <config.json>")?;
    let config = NodeConfig::load(&config_path)?;

    let bind_addr = env::var("CONFMAN_BIND_ADDR").unwrap_or_else(|_| {
        config
            .member_addr(config.id())
            .expect("own node_id is in members")
            .to_string()
    });

    info!(
        node = %config.id(),
        members = ?config.members,
        data_path = %config.data_path.display(),
        "confman node starting"
    );

    let transport = Arc::new(HttpTransport::new(
        config.members.clone(),
        config.blob_store.cluster_token.clone(),
        config.request_timeout(),
    )?);
    let node = ConfmanNode::start(config, transport, Arc::new(MemoryStore::new())).await?;

    let app = confman::server::router(Arc::clone(&node));
    let addr: SocketAddr = bind_addr
        .parse()
        .with_context(|| format!("invalid bind address {bind_addr:?}"))?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
            node.shutdown();
        })
        .await?;
    Ok(())
}
