use std::sync::Arc;

use clap::Parser;
use node::config::Config;
use node::context::NodeContext;
use node::{http, recovery};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        tracing::error!(error = %e, "invalid configuration");
        return Err(e.into());
    }
    let node_id = config.node_id;
    let span = tracing::info_span!("node", node_id);
    let _guard = span.enter();

    let ctx = Arc::new(NodeContext::new(config).map_err(|e| {
        tracing::error!(error = %e, "failed to initialize node");
        e
    })?);

    ctx.membership
        .register(ctx.self_id, &ctx.config.advertise_addr)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "failed to register with membership registry");
            e
        })?;
    tracing::info!(address = %ctx.config.advertise_addr, "registered with membership registry");

    recovery::cold_start(&ctx).await?;

    let tcp_addr = std::net::SocketAddr::from(([0, 0, 0, 0], ctx.config.tcp_port()));
    let tcp_listener = TcpListener::bind(tcp_addr).await?;
    tracing::info!(%tcp_addr, "vote/heartbeat listener bound");
    let peer_listener = tokio::spawn(run_peer_listener(tcp_listener, ctx.election.clone()));

    let election_loop = tokio::spawn(ctx.election.clone().run());

    ctx.mark_ready();

    let http_addr = std::net::SocketAddr::from(([0, 0, 0, 0], ctx.config.http_port));
    let http_listener = TcpListener::bind(http_addr).await?;
    tracing::info!(%http_addr, "node http api listening");

    axum::serve(http_listener, http::router(ctx.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    peer_listener.abort();
    election_loop.abort();
    tracing::info!("node shut down");
    Ok(())
}

async fn run_peer_listener(listener: TcpListener, election: Arc<node::election::Election>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let election = election.clone();
                tokio::spawn(async move {
                    if let Err(e) = election.handle_connection(stream).await {
                        tracing::debug!(error = %e, "peer connection handling failed");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to accept peer connection");
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
