use crate::config::ProbeConfig;
use crate::store::Store;
use crate::upstream::registry::{Mirror, MirrorRegistry};
use futures_util::stream::{self, StreamExt};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Probes run concurrently across mirrors, bounded to keep a large mirror
/// list from bursting outbound connections.
const PROBE_CONCURRENCY: usize = 8;

/// Run a single probe round over every enabled mirror.
///
/// The caller owns scheduling — the bootstrap loop calls this on the
/// configured interval and on Admin API demand. At most one probe per mirror
/// is in flight at any time; overlapping rounds skip busy mirrors.
pub async fn run_probe_round(
    registry: &MirrorRegistry,
    store: &Store,
    client: &reqwest::Client,
    cfg: &ProbeConfig,
) {
    let mirrors: Vec<Mirror> = registry.all().into_iter().filter(|m| m.enabled()).collect();
    if mirrors.is_empty() {
        debug!("probe: no enabled mirrors, round skipped");
        return;
    }

    stream::iter(mirrors)
        .map(|mirror| {
            let client = client.clone();
            let store = store.clone();
            let cfg = cfg.clone();
            async move {
                probe_one(&client, &store, &mirror, &cfg).await;
            }
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<()>()
        .await;
}

/// Build the shared HTTP client used for probing. Per-request timeouts are
/// set at the call site from `ProbeConfig`.
pub fn build_probe_client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("failed to build probe client")
}

async fn probe_one(client: &reqwest::Client, store: &Store, mirror: &Mirror, cfg: &ProbeConfig) {
    if !mirror.begin_probe() {
        debug!("probe: already in flight, mirror_id={}, skipping", mirror.id);
        return;
    }

    let spec = mirror.spec();
    let url = format!("{}/v2/", spec.upstream_url);
    let prefix = spec.prefix.clone();

    let start = Instant::now();
    let result = client.get(&url).timeout(cfg.timeout()).send().await;
    let elapsed = start.elapsed();
    let probed_at = epoch_ms();

    // 200 and 401 both prove reachability: auth-required registries answer
    // the ping with a challenge.
    let healthy = matches!(&result, Ok(resp) if {
        let status = resp.status().as_u16();
        status == 200 || status == 401
    }) && elapsed < cfg.timeout();

    if healthy {
        let latency_ms = elapsed.as_millis() as u64;
        mirror.record_probe_success(latency_ms, probed_at);
        metrics::gauge!(
            "mirrorgate_mirror_health",
            "prefix" => prefix.clone(),
            "mirror_id" => mirror.id.to_string(),
        )
        .set(1.0);
        metrics::counter!(
            "mirrorgate_probe_total",
            "prefix" => prefix.clone(),
            "result" => "success",
        )
        .increment(1);
        debug!(
            "probe: check passed, mirror_id={}, prefix={}, latency_ms={}",
            mirror.id, prefix, latency_ms
        );
    } else {
        let failures = mirror.record_probe_failure(cfg.failure_threshold, probed_at);
        metrics::gauge!(
            "mirrorgate_mirror_health",
            "prefix" => prefix.clone(),
            "mirror_id" => mirror.id.to_string(),
        )
        .set(0.0);
        metrics::counter!(
            "mirrorgate_probe_total",
            "prefix" => prefix.clone(),
            "result" => "failure",
        )
        .increment(1);
        match result {
            Ok(resp) => warn!(
                "probe: check failed, mirror_id={}, prefix={}, status={}, consecutive_failures={}",
                mirror.id,
                prefix,
                resp.status().as_u16(),
                failures
            ),
            Err(e) => warn!(
                "probe: check failed, mirror_id={}, prefix={}, error={}, consecutive_failures={}",
                mirror.id, prefix, e, failures
            ),
        }
    }

    mirror.finish_probe();

    // Persist the result so health survives a restart. SQLite writes are
    // blocking; keep them off the async worker.
    let store = store.clone();
    let id = mirror.id;
    let health = mirror.health();
    let latency_ms = mirror.latency_ms();
    let failures = mirror.consecutive_failures();
    let persisted = tokio::task::spawn_blocking(move || {
        store.record_probe(id, health, latency_ms, failures, probed_at)
    })
    .await;
    match persisted {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("probe: failed to persist result, mirror_id={}, error={}", id, e),
        Err(e) => warn!("probe: persist task panicked, mirror_id={}, error={}", id, e),
    }
}

pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_millis() as u64
}
