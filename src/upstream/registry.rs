use crate::config::{MirrorAuth, MirrorSpec, UpstreamConfig};
use crate::proxy::context::BoxBody;
use crate::store::StoredMirror;
use crate::upstream::Health;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

const HEALTH_UNKNOWN: u8 = 0;
const HEALTH_HEALTHY: u8 = 1;
const HEALTH_UNHEALTHY: u8 = 2;

/// Latency sentinel for "never measured / probe failed".
const LATENCY_NONE: u64 = u64::MAX;

/// Probe-owned runtime state. The prober is the only writer; the hot path
/// and the admin surface only read.
struct ProbeState {
    health: AtomicU8,
    latency_ms: AtomicU64,
    consecutive_failures: AtomicU32,
    last_probe_at: AtomicU64,
    probe_in_flight: AtomicBool,
}

/// Runtime representation of a configured upstream mirror.
///
/// The "live" counterpart of `MirrorSpec`: the declarative config rides in an
/// `ArcSwap` so the Admin API can patch it without disturbing probe state,
/// and each mirror owns a pooled hyper client so connection reuse is
/// per-upstream.
#[derive(Clone)]
pub struct Mirror {
    pub id: i64,
    config: Arc<ArcSwap<MirrorSpec>>,
    state: Arc<ProbeState>,
    http_client: Client<HttpsConnector<HttpConnector>, BoxBody>,
}

impl Mirror {
    fn new(stored: &StoredMirror, client_cfg: &UpstreamConfig) -> Self {
        Self {
            id: stored.id,
            config: Arc::new(ArcSwap::new(Arc::new(stored.spec.clone()))),
            state: Arc::new(ProbeState {
                health: AtomicU8::new(match stored.health {
                    Health::Unknown => HEALTH_UNKNOWN,
                    Health::Healthy => HEALTH_HEALTHY,
                    Health::Unhealthy => HEALTH_UNHEALTHY,
                }),
                latency_ms: AtomicU64::new(stored.latency_ms.unwrap_or(LATENCY_NONE)),
                consecutive_failures: AtomicU32::new(stored.consecutive_failures),
                last_probe_at: AtomicU64::new(stored.last_probe_at.unwrap_or(0)),
                probe_in_flight: AtomicBool::new(false),
            }),
            http_client: build_mirror_http_client(client_cfg),
        }
    }

    // ---- Config (admin writer) ----

    pub fn spec(&self) -> Arc<MirrorSpec> {
        self.config.load_full()
    }

    pub fn prefix(&self) -> String {
        self.config.load().prefix.clone()
    }

    pub fn enabled(&self) -> bool {
        self.config.load().enabled
    }

    /// Host header value the upstream expects.
    pub fn host_header(&self) -> String {
        let spec = self.config.load();
        match &spec.upstream_host {
            Some(host) => host.clone(),
            None => url_host(&spec.upstream_url).to_string(),
        }
    }

    pub fn http_client(&self) -> &Client<HttpsConnector<HttpConnector>, BoxBody> {
        &self.http_client
    }

    fn update_spec(&self, spec: MirrorSpec) {
        self.config.store(Arc::new(spec));
    }

    // ---- Health (prober writer) ----

    pub fn health(&self) -> Health {
        match self.state.health.load(Ordering::Acquire) {
            HEALTH_HEALTHY => Health::Healthy,
            HEALTH_UNHEALTHY => Health::Unhealthy,
            _ => Health::Unknown,
        }
    }

    pub fn latency_ms(&self) -> Option<u64> {
        match self.state.latency_ms.load(Ordering::Relaxed) {
            LATENCY_NONE => None,
            v => Some(v),
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn last_probe_at(&self) -> Option<u64> {
        match self.state.last_probe_at.load(Ordering::Relaxed) {
            0 => None,
            v => Some(v),
        }
    }

    /// A mirror is a selection candidate unless the operator disabled it or
    /// the breaker is open. `Unknown` stays in (ordered last).
    pub fn selectable(&self) -> bool {
        self.enabled() && self.health() != Health::Unhealthy
    }

    /// Claim the single probe slot for this mirror. Returns `false` when a
    /// probe is already in flight.
    pub fn begin_probe(&self) -> bool {
        self.state
            .probe_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_probe(&self) {
        self.state.probe_in_flight.store(false, Ordering::Release);
    }

    pub fn record_probe_success(&self, latency_ms: u64, probed_at: u64) {
        self.state.latency_ms.store(latency_ms, Ordering::Relaxed);
        self.state.consecutive_failures.store(0, Ordering::Relaxed);
        self.state.last_probe_at.store(probed_at, Ordering::Relaxed);
        self.state.health.store(HEALTH_HEALTHY, Ordering::Release);
    }

    /// Count a failed probe; trips the breaker at `failure_threshold`.
    /// Returns the new consecutive failure count.
    pub fn record_probe_failure(&self, failure_threshold: u32, probed_at: u64) -> u32 {
        self.state.latency_ms.store(LATENCY_NONE, Ordering::Relaxed);
        self.state.last_probe_at.store(probed_at, Ordering::Relaxed);
        let count = self
            .state
            .consecutive_failures
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        if count >= failure_threshold {
            self.state.health.store(HEALTH_UNHEALTHY, Ordering::Release);
        }
        count
    }
}

/// Admin-facing snapshot of a mirror. Credentials are redacted to the auth
/// kind and username.
#[derive(Debug, Serialize)]
pub struct MirrorView {
    pub id: i64,
    pub prefix: String,
    pub upstream_url: String,
    pub upstream_host: Option<String>,
    pub auth_kind: &'static str,
    pub auth_user: Option<String>,
    pub enabled: bool,
    pub health: Health,
    pub latency_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub last_probe_at: Option<u64>,
}

impl From<&Mirror> for MirrorView {
    fn from(mirror: &Mirror) -> Self {
        let spec = mirror.spec();
        let auth_user = match &spec.auth {
            MirrorAuth::Basic { username, .. } => Some(username.clone()),
            _ => None,
        };
        Self {
            id: mirror.id,
            prefix: spec.prefix.clone(),
            upstream_url: spec.upstream_url.clone(),
            upstream_host: spec.upstream_host.clone(),
            auth_kind: spec.auth.kind(),
            auth_user,
            enabled: spec.enabled,
            health: mirror.health(),
            latency_ms: mirror.latency_ms(),
            consecutive_failures: mirror.consecutive_failures(),
            last_probe_at: mirror.last_probe_at(),
        }
    }
}

/// Authoritative in-memory mirror set. Rebuilt from the store at startup,
/// patched in place on Admin API mutations. Prefixes are routing keys, not
/// identities: several mirrors may share one, and selection orders them.
#[derive(Clone)]
pub struct MirrorRegistry {
    mirrors: Arc<DashMap<i64, Mirror>>,
    by_prefix: Arc<DashMap<String, Vec<i64>>>,
    default_prefix: Arc<str>,
    client_cfg: UpstreamConfig,
}

impl MirrorRegistry {
    pub fn new(default_prefix: &str, client_cfg: UpstreamConfig) -> Self {
        Self {
            mirrors: Arc::new(DashMap::new()),
            by_prefix: Arc::new(DashMap::new()),
            default_prefix: Arc::from(default_prefix),
            client_cfg,
        }
    }

    pub fn load(&self, stored: &[StoredMirror]) {
        for row in stored {
            self.upsert(row);
        }
    }

    pub fn default_prefix(&self) -> &str {
        &self.default_prefix
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    pub fn get(&self, id: i64) -> Option<Mirror> {
        self.mirrors.get(&id).map(|entry| entry.value().clone())
    }

    pub fn is_known_prefix(&self, prefix: &str) -> bool {
        self.by_prefix
            .get(prefix)
            .map(|ids| !ids.is_empty())
            .unwrap_or(false)
    }

    /// Best mirror for a prefix, or `None` when nothing is selectable.
    pub fn get_by_prefix(&self, prefix: &str) -> Option<Mirror> {
        self.list_by_prefix(prefix, true).into_iter().next()
    }

    /// Mirrors for a prefix, best first: ascending probe latency, mirrors
    /// with no measurement last, ties broken on smallest id. When
    /// `only_enabled_healthy` is set (the hot-path default), disabled and
    /// unhealthy mirrors are excluded.
    pub fn list_by_prefix(&self, prefix: &str, only_enabled_healthy: bool) -> Vec<Mirror> {
        let ids = match self.by_prefix.get(prefix) {
            Some(ids) => ids.clone(),
            None => return Vec::new(),
        };

        let mut mirrors: Vec<Mirror> = ids
            .iter()
            .filter_map(|id| self.get(*id))
            .filter(|m| !only_enabled_healthy || m.selectable())
            .collect();

        mirrors.sort_by_key(|m| {
            (
                m.health() == Health::Unknown,
                m.latency_ms().unwrap_or(u64::MAX),
                m.id,
            )
        });
        mirrors
    }

    pub fn all(&self) -> Vec<Mirror> {
        let mut mirrors: Vec<Mirror> = self.mirrors.iter().map(|e| e.value().clone()).collect();
        mirrors.sort_by_key(|m| m.id);
        mirrors
    }

    /// Create or update from a stored row. Existing mirrors keep their probe
    /// state and pooled client; only the config snapshot is swapped.
    pub fn upsert(&self, stored: &StoredMirror) {
        if let Some(existing) = self.mirrors.get(&stored.id) {
            let old_prefix = existing.prefix();
            existing.update_spec(stored.spec.clone());
            drop(existing);
            if old_prefix != stored.spec.prefix {
                self.unindex(stored.id, &old_prefix);
                self.index(stored.id, &stored.spec.prefix);
            }
            return;
        }
        let mirror = Mirror::new(stored, &self.client_cfg);
        self.index(stored.id, &stored.spec.prefix);
        self.mirrors.insert(stored.id, mirror);
    }

    pub fn remove(&self, id: i64) -> bool {
        match self.mirrors.remove(&id) {
            Some((_, mirror)) => {
                self.unindex(id, &mirror.prefix());
                true
            }
            None => false,
        }
    }

    fn index(&self, id: i64, prefix: &str) {
        let mut ids = self.by_prefix.entry(prefix.to_string()).or_default();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }

    fn unindex(&self, id: i64, prefix: &str) {
        if let Some(mut ids) = self.by_prefix.get_mut(prefix) {
            ids.retain(|existing| *existing != id);
        }
        self.by_prefix.remove_if(prefix, |_, ids| ids.is_empty());
    }
}

/// Strip scheme and path from an upstream base URL, leaving `host[:port]`.
pub fn url_host(url: &str) -> &str {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    match rest.find('/') {
        Some(idx) => &rest[..idx],
        None => rest,
    }
}

/// Pooled hyper client for one mirror. Both `http://` and `https://`
/// upstreams are supported; TLS via rustls with webpki roots, HTTP/2
/// negotiated over ALPN.
fn build_mirror_http_client(
    cfg: &UpstreamConfig,
) -> Client<HttpsConnector<HttpConnector>, BoxBody> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_connect_timeout(Some(Duration::from_secs(cfg.connect_timeout_secs)));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(cfg.pool_idle_per_host)
        .build(https)
}
