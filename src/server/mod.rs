pub mod admin;
pub mod bootstrap;
mod state;

pub use state::AppState;

use crate::proxy;
use anyhow::Result;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Run the proxy server with graceful shutdown support.
///
/// The registry surface and the admin API share the listener; requests under
/// the admin base path branch off before registry path parsing. When
/// `shutdown` is notified the server stops accepting new connections and
/// waits up to `DRAIN_TIMEOUT` for in-flight requests to complete before
/// dropping them.
pub async fn run_server(state: AppState, shutdown: Arc<Notify>) -> Result<()> {
    let addr: SocketAddr = state.config.listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("server: listening, addr={}", addr);
    serve(listener, state, shutdown).await
}

/// Accept loop over an already-bound listener — split out so tests can bind
/// an ephemeral port first.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: Arc<Notify>) -> Result<()> {
    const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

    let admin_base = state.config.admin_base.clone();
    let admin_subtree = format!("{admin_base}/");

    let active_conns = Arc::new(AtomicI64::new(0));

    // Register for shutdown before the first accept so a signal arriving
    // while a connection is being dispatched is not lost.
    let shutdown_notified = shutdown.notified();
    tokio::pin!(shutdown_notified);

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = shutdown_notified.as_mut() => {
                info!("server: stop accepting new connections, draining...");
                break;
            }
        };

        let (stream, peer_addr) = match accepted {
            Ok(v) => {
                metrics::counter!(
                    "mirrorgate_connections_total",
                    "status" => "accepted",
                )
                .increment(1);
                v
            }
            Err(e) => {
                error!("server: accept failed, error={}", e);
                metrics::counter!(
                    "mirrorgate_connections_total",
                    "status" => "error",
                )
                .increment(1);
                continue;
            }
        };

        metrics::gauge!("mirrorgate_connections_active").increment(1.0);
        active_conns.fetch_add(1, Ordering::Relaxed);

        let state = state.clone();
        let active_conns = active_conns.clone();
        let admin_base = admin_base.clone();
        let admin_subtree = admin_subtree.clone();

        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let state_inner = state.clone();
            let svc = service_fn(move |req: Request<Incoming>| {
                let state = state_inner.clone();
                let is_admin = req.uri().path() == admin_base
                    || req.uri().path().starts_with(admin_subtree.as_str());
                async move {
                    if is_admin {
                        admin::handle_admin(req, state).await
                    } else {
                        proxy::handle_request(req, state, peer_addr).await
                    }
                }
            });

            if let Err(e) = auto::Builder::new(TokioExecutor::new())
                .http1()
                .keep_alive(true)
                .http2()
                .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                .serve_connection_with_upgrades(io, svc)
                .await
            {
                if !e.to_string().contains("connection closed") {
                    error!(
                        "server: connection error, peer={}, error={}",
                        peer_addr, e
                    );
                }
            }

            metrics::gauge!("mirrorgate_connections_active").decrement(1.0);
            active_conns.fetch_sub(1, Ordering::Relaxed);
        });
    }

    // Drain phase: wait for in-flight connections to finish (or time out).
    let active = active_conns.load(Ordering::Relaxed);
    if active > 0 {
        info!("server: waiting for {} active connections to drain", active);
        let drain = async {
            loop {
                if active_conns.load(Ordering::Relaxed) == 0 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        };
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("server: all connections drained"),
            Err(_) => {
                let remaining = active_conns.load(Ordering::Relaxed);
                info!(
                    "server: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    remaining
                );
            }
        }
    }

    Ok(())
}
