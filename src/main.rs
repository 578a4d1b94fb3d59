use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use gridlock::config::Config;
use gridlock::observability::{CONNECTIONS_ACTIVE, CONNECTIONS_REJECTED_TOTAL, CONNECTIONS_TOTAL};
use gridlock::tenant::TenantManager;
use gridlock::wire;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    gridlock::observability::init(config.metrics_port)?;
    let tls = config.tls_acceptor()?;

    std::fs::create_dir_all(&config.data_dir)?;
    let tenants = Arc::new(TenantManager::new(
        config.data_dir.clone(),
        config.compact_threshold,
    ));

    let addr = config.listen_addr();
    let listener = TcpListener::bind(&addr).await?;
    info!("gridlock listening on {addr}");
    config.log_summary();

    let permits = Arc::new(Semaphore::new(config.max_connections));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        error!("accept error: {e}");
                        continue;
                    }
                };
                let Ok(permit) = permits.clone().try_acquire_owned() else {
                    warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(CONNECTIONS_REJECTED_TOTAL).increment(1);
                    continue;
                };
                info!("connection from {peer}");
                spawn_session(socket, peer, permit, &tenants, &config, tls.clone());
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, no longer accepting");
                break;
            }
        }
    }

    // Every permit back in the pool means every session has closed.
    info!("draining connections (up to {:?})", config.drain_timeout);
    let all = config.max_connections as u32;
    match tokio::time::timeout(config.drain_timeout, permits.acquire_many(all)).await {
        Ok(_) => info!("all connections drained"),
        Err(_) => {
            let open = config.max_connections - permits.available_permits();
            warn!("drain timeout, {open} connections still open");
        }
    }

    info!("gridlock stopped");
    Ok(())
}

fn spawn_session(
    socket: tokio::net::TcpStream,
    peer: std::net::SocketAddr,
    permit: tokio::sync::OwnedSemaphorePermit,
    tenants: &Arc<TenantManager>,
    config: &Config,
    tls: Option<TlsAcceptor>,
) {
    metrics::counter!(CONNECTIONS_TOTAL).increment(1);
    metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0);
    let tenants = tenants.clone();
    let password = config.password.clone();
    tokio::spawn(async move {
        let _permit = permit;
        if let Err(e) = wire::process_connection(socket, tenants, password, tls).await {
            error!("connection error from {peer}: {e}");
        }
        metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
    });
}

/// Resolves on ctrl-c, or SIGTERM where the platform has it.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
                return;
            }
            Err(e) => warn!("SIGTERM handler unavailable, ctrl-c only: {e}"),
        }
    }
    let _ = tokio::signal::ctrl_c().await;
}
