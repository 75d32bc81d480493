pub mod challenge;

pub use challenge::{parse_www_authenticate, Challenge};

use crate::config::{MirrorAuth, TokenCacheConfig};
use crate::error::ProxyError;
use crate::upstream::Mirror;
use dashmap::DashMap;
use lru::LruCache;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cache key: `(mirror_id, scope)`. Scope-less challenges share one slot
/// per mirror under the empty string.
type TokenKey = (i64, String);

#[derive(Clone)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Token endpoint response body. Registries disagree on the field name.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// Obtains and caches Bearer tokens from upstream auth realms.
///
/// The cache is LRU-bounded and per-key single-flight: N concurrent 401s for
/// the same `(mirror, scope)` produce exactly one realm fetch; the rest wait
/// and read the cached token.
pub struct TokenBroker {
    cache: Mutex<LruCache<TokenKey, CachedToken>>,
    inflight: DashMap<TokenKey, Arc<tokio::sync::Mutex<()>>>,
    http: reqwest::Client,
    cfg: TokenCacheConfig,
}

impl TokenBroker {
    pub fn new(cfg: TokenCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(cfg.capacity.max(1)).unwrap();
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            inflight: DashMap::new(),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .no_proxy()
                .build()
                .expect("failed to build token realm client"),
            cfg,
        }
    }

    /// Resolve a Bearer token for a parsed challenge, from cache or by
    /// fetching the realm.
    pub async fn bearer_token(
        &self,
        mirror: &Mirror,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> Result<String, ProxyError> {
        let key: TokenKey = (mirror.id, scope.unwrap_or("").to_string());

        if let Some(token) = self.lookup(&key) {
            metrics::counter!("mirrorgate_token_cache_total", "result" => "hit").increment(1);
            return Ok(token);
        }
        metrics::counter!("mirrorgate_token_cache_total", "result" => "miss").increment(1);

        // Single-flight: first caller fetches, the rest queue on the per-key
        // lock and then hit the cache.
        let flight = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = flight.lock().await;

        if let Some(token) = self.lookup(&key) {
            metrics::counter!("mirrorgate_token_cache_total", "result" => "hit").increment(1);
            return Ok(token);
        }

        let result = self.fetch(mirror, realm, service, scope).await;
        if let Ok((ref token, ttl)) = result {
            self.insert(key.clone(), token.clone(), ttl);
        }
        drop(_guard);
        self.inflight.remove(&key);

        result.map(|(token, _)| token)
    }

    async fn fetch(
        &self,
        mirror: &Mirror,
        realm: &str,
        service: Option<&str>,
        scope: Option<&str>,
    ) -> Result<(String, Duration), ProxyError> {
        let mut request = self.http.get(realm);
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(service) = service {
            query.push(("service", service));
        }
        if let Some(scope) = scope {
            query.push(("scope", scope));
        }
        if !query.is_empty() {
            request = request.query(&query);
        }

        // Private registries issue tokens only to authenticated accounts.
        if let MirrorAuth::Basic { username, password } = &mirror.spec().auth {
            request = request.basic_auth(username, Some(password));
        }

        debug!("token: fetching, mirror_id={}, realm={}, scope={:?}", mirror.id, realm, scope);

        let response = request.send().await.map_err(|e| {
            metrics::counter!("mirrorgate_token_fetch_total", "result" => "error").increment(1);
            ProxyError::AuthFailure(format!("realm unreachable: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            metrics::counter!("mirrorgate_token_fetch_total", "result" => "rejected").increment(1);
            warn!(
                "token: realm rejected request, mirror_id={}, realm={}, status={}",
                mirror.id, realm, status
            );
            return Err(ProxyError::AuthFailure(format!(
                "realm returned {status}"
            )));
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            metrics::counter!("mirrorgate_token_fetch_total", "result" => "error").increment(1);
            ProxyError::AuthFailure(format!("malformed token response: {e}"))
        })?;

        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                metrics::counter!("mirrorgate_token_fetch_total", "result" => "error").increment(1);
                ProxyError::AuthFailure("token response had no token".to_string())
            })?;

        metrics::counter!("mirrorgate_token_fetch_total", "result" => "success").increment(1);
        let ttl = Duration::from_secs(body.expires_in.unwrap_or(self.cfg.default_ttl_secs));
        Ok((token, ttl))
    }

    /// Cached token if present and not within the expiry safety margin.
    fn lookup(&self, key: &TokenKey) -> Option<String> {
        let mut cache = self.cache.lock().unwrap();
        match cache.get(key) {
            Some(entry) => {
                let margin = Duration::from_secs(self.cfg.expiry_margin_secs);
                let fresh = entry
                    .expires_at
                    .checked_duration_since(Instant::now())
                    .map(|remaining| remaining > margin)
                    .unwrap_or(false);
                if fresh {
                    Some(entry.token.clone())
                } else {
                    cache.pop(key);
                    None
                }
            }
            None => None,
        }
    }

    fn insert(&self, key: TokenKey, token: String, ttl: Duration) {
        let entry = CachedToken {
            token,
            expires_at: Instant::now() + ttl,
        };
        self.cache.lock().unwrap().put(key, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(capacity: usize, margin_secs: u64) -> TokenBroker {
        TokenBroker::new(TokenCacheConfig {
            capacity,
            expiry_margin_secs: margin_secs,
            default_ttl_secs: 60,
        })
    }

    #[test]
    fn lookup_returns_fresh_tokens_only() {
        let b = broker(16, 30);
        let key = (1, "repository:library/nginx:pull".to_string());

        b.insert(key.clone(), "tok".to_string(), Duration::from_secs(300));
        assert_eq!(b.lookup(&key).as_deref(), Some("tok"));

        // Within the 30s safety margin the token counts as expired.
        b.insert(key.clone(), "tok".to_string(), Duration::from_secs(10));
        assert_eq!(b.lookup(&key), None);
        // And the stale entry is evicted.
        assert!(b.cache.lock().unwrap().is_empty());
    }

    #[test]
    fn cache_is_lru_bounded() {
        let b = broker(2, 0);
        b.insert((1, "a".into()), "t1".into(), Duration::from_secs(300));
        b.insert((1, "b".into()), "t2".into(), Duration::from_secs(300));
        b.insert((1, "c".into()), "t3".into(), Duration::from_secs(300));

        assert_eq!(b.lookup(&(1, "a".into())), None);
        assert_eq!(b.lookup(&(1, "b".into())).as_deref(), Some("t2"));
        assert_eq!(b.lookup(&(1, "c".into())).as_deref(), Some("t3"));
    }

    #[test]
    fn scopes_are_cached_independently() {
        let b = broker(16, 0);
        b.insert((1, "repository:a:pull".into()), "ta".into(), Duration::from_secs(300));
        b.insert((2, "repository:a:pull".into()), "tb".into(), Duration::from_secs(300));

        assert_eq!(b.lookup(&(1, "repository:a:pull".into())).as_deref(), Some("ta"));
        assert_eq!(b.lookup(&(2, "repository:a:pull".into())).as_deref(), Some("tb"));
        assert_eq!(b.lookup(&(1, "repository:b:pull".into())), None);
    }
}
