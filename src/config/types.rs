use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level proxy configuration. Infrastructure settings only — the mirror
/// set itself lives in the store and is managed through the Admin API; the
/// `mirrors` list here is just the seed applied to an empty store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the proxy (and the admin surface under `admin_base`) binds to.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Directory holding the SQLite store and the generated secret key.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Base path the admin JSON API is mounted under.
    #[serde(default = "default_admin_base")]
    pub admin_base: String,

    /// Routing prefix used when the incoming path does not start with a
    /// known one.
    #[serde(default = "default_prefix")]
    pub default_prefix: String,

    #[serde(default)]
    pub probe: ProbeConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub token_cache: TokenCacheConfig,

    #[serde(default)]
    pub traffic: TrafficConfig,

    /// Operator secret the credential-encryption key is derived from.
    /// When unset, a random key is generated under `data_dir` on first start.
    #[serde(default)]
    pub auth_secret: Option<String>,

    /// Mirrors seeded into the store when it is empty (first start).
    #[serde(default)]
    pub mirrors: Vec<MirrorSpec>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            data_dir: default_data_dir(),
            admin_base: default_admin_base(),
            default_prefix: default_prefix(),
            probe: ProbeConfig::default(),
            upstream: UpstreamConfig::default(),
            token_cache: TokenCacheConfig::default(),
            traffic: TrafficConfig::default(),
            auth_secret: None,
            mirrors: Vec::new(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_admin_base() -> String {
    "/api".to_string()
}

fn default_prefix() -> String {
    "dockerhub".to_string()
}

/// Active health probe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Seconds between probe rounds.
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,

    /// Hard timeout for a single `GET /v2/` probe, seconds.
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,

    /// Consecutive failures before a mirror is excluded from selection.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Upper bound for the random start-up delay before the first
    /// scheduled round, seconds.
    #[serde(default = "default_probe_jitter")]
    pub jitter_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            timeout_secs: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            jitter_secs: default_probe_jitter(),
        }
    }
}

fn default_probe_interval() -> u64 {
    3600
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_failure_threshold() -> u32 {
    1
}

fn default_probe_jitter() -> u64 {
    30
}

/// Per-mirror HTTP client settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Time allowed for the upstream to produce response headers.
    #[serde(default = "default_header_timeout")]
    pub header_timeout_secs: u64,

    /// Idle cutoff while a response body is streaming. Total request time
    /// is uncapped — blobs are gigabytes.
    #[serde(default = "default_stream_idle_timeout")]
    pub stream_idle_timeout_secs: u64,

    /// Idle connections kept pooled per upstream host.
    #[serde(default = "default_pool_idle")]
    pub pool_idle_per_host: usize,

    /// Redirect hops followed in-proxy for GET/HEAD requests.
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            header_timeout_secs: default_header_timeout(),
            stream_idle_timeout_secs: default_stream_idle_timeout(),
            pool_idle_per_host: default_pool_idle(),
            max_redirects: default_max_redirects(),
        }
    }
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_header_timeout() -> u64 {
    10
}

fn default_stream_idle_timeout() -> u64 {
    60
}

fn default_pool_idle() -> usize {
    32
}

fn default_max_redirects() -> usize {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCacheConfig {
    #[serde(default = "default_token_capacity")]
    pub capacity: usize,

    /// Tokens within this many seconds of expiry are treated as expired.
    #[serde(default = "default_expiry_margin")]
    pub expiry_margin_secs: u64,

    /// Assumed lifetime when the realm omits `expires_in`.
    #[serde(default = "default_token_ttl")]
    pub default_ttl_secs: u64,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_token_capacity(),
            expiry_margin_secs: default_expiry_margin(),
            default_ttl_secs: default_token_ttl(),
        }
    }
}

fn default_token_capacity() -> usize {
    4096
}

fn default_expiry_margin() -> u64 {
    30
}

fn default_token_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficConfig {
    /// Bounded queue between the hot path and the store writer. When full,
    /// the oldest record is dropped — accounting never blocks a request.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Records written to the store per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Flush cadence when the batch does not fill up, seconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
        }
    }
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> u64 {
    1
}

/// How the proxy authenticates itself to an upstream mirror.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum MirrorAuth {
    /// Anonymous; 401 challenges are still answered via the token dance
    /// without credentials (public registries).
    #[default]
    None,
    /// Credentials presented on a `Basic` challenge and attached to token
    /// realm fetches.
    Basic { username: String, password: String },
    /// Follow the standard registry Bearer-token dance.
    BearerDelegated,
}

impl MirrorAuth {
    pub fn kind(&self) -> &'static str {
        match self {
            MirrorAuth::None => "none",
            MirrorAuth::Basic { .. } => "basic",
            MirrorAuth::BearerDelegated => "bearer-delegated",
        }
    }
}

/// Declarative description of an upstream mirror — the Admin API create body
/// and the config seed entry share this shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorSpec {
    /// Routing key: first path segment after `/v2/`. Several mirrors may
    /// share a prefix; selection orders them by probe latency.
    pub prefix: String,

    /// Absolute base URL, scheme + host, no trailing path.
    pub upstream_url: String,

    /// Host header the upstream expects; defaults to the URL host.
    #[serde(default)]
    pub upstream_host: Option<String>,

    #[serde(default)]
    pub auth: MirrorAuth,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}
