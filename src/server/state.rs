use crate::config::ProxyConfig;
use crate::metrics::Metrics;
use crate::store::Store;
use crate::token::TokenBroker;
use crate::traffic::TrafficQueue;
use crate::upstream::MirrorRegistry;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;

/// Shared proxy state, cheaply cloneable. One instance per process, handed
/// to every connection task; tests build their own around an in-memory
/// store.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub registry: MirrorRegistry,
    pub tokens: Arc<TokenBroker>,
    pub traffic: TrafficQueue,
    pub store: Store,
    pub metrics: Metrics,
    /// Admin `POST /probe` pokes the probe loop through this.
    pub probe_wake: Arc<Notify>,
}

impl AppState {
    /// Build state from config and an opened store: seed the mirror table on
    /// first start, then load the registry from it.
    pub fn new(config: ProxyConfig, store: Store, metrics: Metrics) -> Result<Self> {
        let existing = store.list_mirrors()?;
        if existing.is_empty() && !config.mirrors.is_empty() {
            for spec in &config.mirrors {
                store.insert_mirror(spec)?;
            }
            tracing::info!("store: seeded {} mirrors from config", config.mirrors.len());
        }

        let registry = MirrorRegistry::new(&config.default_prefix, config.upstream.clone());
        registry.load(&store.list_mirrors()?);
        tracing::info!("registry: loaded {} mirrors", registry.len());

        let tokens = Arc::new(TokenBroker::new(config.token_cache.clone()));
        let traffic = TrafficQueue::new(&config.traffic);

        Ok(Self {
            config: Arc::new(config),
            registry,
            tokens,
            traffic,
            store,
            metrics,
            probe_wake: Arc::new(Notify::new()),
        })
    }
}
