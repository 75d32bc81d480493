use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::server::{run_server, AppState};
use crate::store::Store;
use crate::traffic;
use crate::upstream::{build_probe_client, run_probe_round};
use anyhow::{Context, Result};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub listen: Option<String>,
}

/// Proxy lifecycle: init → load → probe/accounting loops → serve → shutdown.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();

    let mut config = ProxyConfig::load(&args.config_path)?;
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let metrics = Metrics::install();
    let store = Store::open(&config.data_dir, config.auth_secret.as_deref())
        .context("failed to open store")?;
    let state = AppState::new(config, store, metrics)?;

    let shutdown = Arc::new(Notify::new());
    start_probe_loop(&state, &shutdown);
    let consumer = start_traffic_consumer(&state, &shutdown);

    tracing::info!("server: starting, listen={}", state.config.listen);
    let server_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { run_server(state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    // Wait for the listener to drain, then for the final accounting flush.
    match server_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return Err(e),
        Err(e) => tracing::error!("server: task error: {}", e),
    }
    if let Err(e) = consumer.await {
        tracing::error!("traffic: consumer task error: {}", e);
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

/// Sleep for `duration`, but return `true` immediately if shutdown is
/// signalled. Returns `false` when the full duration elapsed normally.
async fn sleep_or_shutdown(duration: std::time::Duration, shutdown: &Notify) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown.notified() => true,
    }
}

/// The probe loop: an immediate first round (after a small random delay so a
/// fleet restart does not stampede the upstreams), then one round per
/// configured interval, plus on-demand rounds from the Admin API.
fn start_probe_loop(state: &AppState, shutdown: &Arc<Notify>) {
    let registry = state.registry.clone();
    let store = state.store.clone();
    let wake = state.probe_wake.clone();
    let cfg = state.config.probe.clone();
    let shutdown = shutdown.clone();

    tokio::spawn(async move {
        let client = build_probe_client();

        let initial_delay = std::time::Duration::from_millis(
            rand::thread_rng().gen_range(0..=cfg.jitter_secs.saturating_mul(1000)),
        );
        if sleep_or_shutdown(initial_delay, &shutdown).await {
            return;
        }

        loop {
            run_probe_round(&registry, &store, &client, &cfg).await;

            tokio::select! {
                _ = tokio::time::sleep(cfg.interval()) => {}
                _ = wake.notified() => {
                    tracing::info!("probe: immediate round triggered");
                }
                _ = shutdown.notified() => return,
            }
        }
    });
}

fn start_traffic_consumer(
    state: &AppState,
    shutdown: &Arc<Notify>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(traffic::run_consumer(
        state.traffic.clone(),
        state.store.clone(),
        state.config.traffic.clone(),
        shutdown.clone(),
    ))
}

async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

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
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }

    shutdown.notify_waiters();
}
