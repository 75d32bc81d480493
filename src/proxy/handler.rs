use crate::config::MirrorAuth;
use crate::error::ProxyError;
use crate::proxy::context::{full_body, BoxBody, BoxError, RequestContext};
use crate::routing::{self, PathKind, Route};
use crate::server::AppState;
use crate::token::{parse_www_authenticate, Challenge};
use crate::traffic::{CountingBody, Outcome, PendingRecord, TrafficRecord};
use crate::upstream::prober::epoch_ms;
use crate::upstream::registry::url_host;
use crate::upstream::{selector, Mirror};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use http::header::{
    HeaderName, HeaderValue, AUTHORIZATION, HOST, LOCATION, SET_COOKIE, WWW_AUTHENTICATE,
};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Handle one registry request through a phased lifecycle:
///
/// 1. PATH_PARSE    — registry v2 grammar, prefix extraction
/// 2. SELECT        — best-first candidate list for the prefix
/// 3. FORWARD       — rewrite + send, 401 handshake, redirect chase (with
///                    failover across candidates before any body bytes move)
/// 4. STREAM        — byte-counting pass-through back to the client
/// 5. LOG           — access line, metrics, traffic record
pub async fn handle_request(
    req: Request<Incoming>,
    state: AppState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    // Trust the left-most X-Forwarded-For entry when a fronting proxy set
    // one, otherwise use the TCP peer.
    let client_ip = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    let mut ctx = RequestContext::new(method.to_string(), path.clone(), client_ip);

    let route = match routing::parse_path(&path, query.as_deref(), |s| {
        state.registry.is_known_prefix(s)
    }) {
        Ok(route) => route,
        Err(e) => {
            debug!("proxy: rejected path, path={}, error={}", path, e);
            let resp = ctx.error_response(e.status(), e.label());
            record_local(&state, &ctx, e.status().as_u16());
            return Ok(resp);
        }
    };

    // Discovery ping is answered locally — no upstream traffic.
    if route.kind == PathKind::Ping {
        ctx.finalize_metrics(200);
        record_local(&state, &ctx, 200);
        return Ok(Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .header("docker-distribution-api-version", "registry/2.0")
            .body(full_body("{}"))
            .unwrap());
    }

    let prefix = route
        .prefix
        .clone()
        .unwrap_or_else(|| state.registry.default_prefix().to_string());
    ctx.prefix = prefix.clone();

    // First attempt goes to the selected best mirror; `NoUpstream` is the
    // 503 path. Failover re-reads the ordering below.
    let selected = match selector::select(&state.registry, &prefix) {
        Ok(mirror) => mirror,
        Err(e) => {
            warn!("proxy: no upstream, prefix={}, path={}", prefix, path);
            let resp = ctx.error_response(e.status(), e.label());
            record_local(&state, &ctx, e.status().as_u16());
            return Ok(resp);
        }
    };

    // Docker Hub's `library/` shortcut: bare names gain the implied
    // namespace when the hub (default) prefix routes the request.
    let repo_override = route.repository.as_deref().and_then(|repo| {
        if !repo.contains('/') && prefix == state.registry.default_prefix() {
            Some(format!("library/{repo}"))
        } else {
            None
        }
    });
    ctx.image_ref = route.image_ref(repo_override.as_deref());

    let (parts, client_body) = req.into_parts();
    // Only bodyless requests are replayable; uploads get a single attempt.
    let bodyless = parts.method == Method::GET || parts.method == Method::HEAD;
    let mut client_body = Some(client_body);

    // Failover walks the candidate ordering, skipping mirrors already tried
    // this request.
    let mut tried: Vec<i64> = Vec::new();
    let mut mirror = selected;
    loop {
        ctx.mirror_id = Some(mirror.id);
        let body = if bodyless { None } else { client_body.take() };

        match forward(&state, &mirror, &route, repo_override.as_deref(), &parts, body, &mut ctx).await {
            Ok(resp) => return Ok(stream_back(&state, &ctx, resp)),
            Err(ProxyError::UpstreamUnavailable(msg)) if bodyless => {
                tried.push(mirror.id);
                let next = selector::candidates(&state.registry, &prefix)
                    .into_iter()
                    .find(|m| !tried.contains(&m.id));
                match next {
                    Some(next) => {
                        warn!(
                            "proxy: failing over, prefix={}, mirror_id={}, attempt={}, error={}",
                            prefix,
                            mirror.id,
                            tried.len(),
                            msg
                        );
                        metrics::counter!(
                            "mirrorgate_failover_total",
                            "prefix" => prefix.clone(),
                        )
                        .increment(1);
                        mirror = next;
                        continue;
                    }
                    None => {
                        warn!(
                            "proxy: candidates exhausted, prefix={}, path={}, error={}",
                            prefix, path, msg
                        );
                        let resp =
                            ctx.error_response(StatusCode::BAD_GATEWAY, "upstream unavailable");
                        record_local(&state, &ctx, 502);
                        return Ok(resp);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "proxy: upstream error, prefix={}, mirror_id={}, path={}, error={}",
                    prefix, mirror.id, path, e
                );
                let resp = ctx.error_response(e.status(), e.label());
                record_local(&state, &ctx, e.status().as_u16());
                return Ok(resp);
            }
        }
    }
}

/// Forward one request to one mirror: URI rewrite, header scrub, the 401
/// auth handshake, and the redirect chase. Returns the upstream response
/// with its body untouched.
async fn forward(
    state: &AppState,
    mirror: &Mirror,
    route: &Route,
    repo_override: Option<&str>,
    parts: &http::request::Parts,
    body: Option<Incoming>,
    ctx: &mut RequestContext,
) -> Result<Response<Incoming>, ProxyError> {
    let spec = mirror.spec();

    let upstream_uri = format!(
        "{}{}",
        spec.upstream_url,
        route.upstream_path(repo_override)
    );

    let mut headers = parts.headers.clone();
    scrub_request_headers(&mut headers);
    // Clients never authenticate to the proxy; whatever they sent must not
    // leak upstream.
    headers.remove(AUTHORIZATION);
    if let Ok(host) = HeaderValue::from_str(&mirror.host_header()) {
        headers.insert(HOST, host);
    }

    let replayable = body.is_none();
    let first_body: BoxBody = match body {
        Some(incoming) => incoming.map_err(|e| -> BoxError { e.into() }).boxed(),
        None => crate::proxy::context::empty_body(),
    };

    let header_timeout = Duration::from_secs(state.config.upstream.header_timeout_secs);
    ctx.upstream_start = Some(Instant::now());

    let mut resp = send_once(mirror, &parts.method, &upstream_uri, &headers, first_body, header_timeout).await?;

    // Auth handshake: one retry with credentials, a second 401 passes
    // through untouched.
    if resp.status() == StatusCode::UNAUTHORIZED && replayable {
        let challenge = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_www_authenticate);

        match challenge {
            Some(Challenge::Basic) => {
                if let MirrorAuth::Basic { username, password } = &spec.auth {
                    let credentials = BASE64.encode(format!("{username}:{password}"));
                    if let Ok(value) = HeaderValue::from_str(&format!("Basic {credentials}")) {
                        debug!("proxy: answering basic challenge, mirror_id={}", mirror.id);
                        headers.insert(AUTHORIZATION, value);
                        resp = send_once(
                            mirror,
                            &parts.method,
                            &upstream_uri,
                            &headers,
                            crate::proxy::context::empty_body(),
                            header_timeout,
                        )
                        .await?;
                    }
                }
            }
            Some(Challenge::Bearer { realm, service, scope }) => {
                let token = state
                    .tokens
                    .bearer_token(mirror, &realm, service.as_deref(), scope.as_deref())
                    .await?;
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {token}")) {
                    debug!("proxy: answering bearer challenge, mirror_id={}", mirror.id);
                    headers.insert(AUTHORIZATION, value);
                    resp = send_once(
                        mirror,
                        &parts.method,
                        &upstream_uri,
                        &headers,
                        crate::proxy::context::empty_body(),
                        header_timeout,
                    )
                    .await?;
                }
            }
            None => {}
        }
    }

    // Blob storage commonly redirects to object-storage CDNs; the docker
    // daemon expects content, so chase redirects in-proxy for replayable
    // requests. Credentials never cross to a different host.
    let mut hops = 0;
    let mut current_uri = upstream_uri;
    while replayable
        && is_redirect(resp.status())
        && hops < state.config.upstream.max_redirects
    {
        let location = match resp
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|loc| resolve_redirect(&current_uri, loc))
        {
            Some(uri) => uri,
            None => break,
        };

        debug!(
            "proxy: following redirect, mirror_id={}, hop={}, location={}",
            mirror.id,
            hops + 1,
            location
        );

        let mut redirect_headers = headers.clone();
        if url_host(&location) != url_host(&current_uri) {
            redirect_headers.remove(AUTHORIZATION);
        }
        // Let the client derive Host from the redirect target.
        redirect_headers.remove(HOST);

        resp = send_once(
            mirror,
            &parts.method,
            &location,
            &redirect_headers,
            crate::proxy::context::empty_body(),
            header_timeout,
        )
        .await?;
        current_uri = location;
        hops += 1;
    }

    if resp.status().is_server_error() {
        return Err(ProxyError::UpstreamUnavailable(format!(
            "upstream returned {}",
            resp.status()
        )));
    }

    Ok(resp)
}

/// One request/response exchange against a mirror's pooled client, bounded
/// by the response-header timeout. The body stream itself is not covered —
/// that is the counting wrapper's idle cutoff.
async fn send_once(
    mirror: &Mirror,
    method: &Method,
    uri: &str,
    headers: &HeaderMap,
    body: BoxBody,
    header_timeout: Duration,
) -> Result<Response<Incoming>, ProxyError> {
    let mut builder = Request::builder().method(method.clone()).uri(uri);
    for (name, value) in headers {
        builder = builder.header(name, value);
    }
    let request = builder
        .body(body)
        .map_err(|e| ProxyError::Internal(format!("failed to build upstream request: {e}")))?;

    match tokio::time::timeout(header_timeout, mirror.http_client().request(request)).await {
        Ok(Ok(resp)) => Ok(resp),
        Ok(Err(e)) => Err(ProxyError::UpstreamUnavailable(e.to_string())),
        Err(_) => Err(ProxyError::UpstreamUnavailable(format!(
            "no response headers within {}s",
            header_timeout.as_secs()
        ))),
    }
}

/// Hand the upstream response back to the client: scrubbed headers, body
/// streamed through the byte-counting wrapper that also owns the traffic
/// record.
fn stream_back(state: &AppState, ctx: &RequestContext, resp: Response<Incoming>) -> Response<BoxBody> {
    let status = resp.status();
    let (parts, body) = resp.into_parts();

    let mut builder = Response::builder().status(status);
    for (name, value) in &parts.headers {
        if is_hop_header(name) || name == SET_COOKIE {
            continue;
        }
        builder = builder.header(name, value);
    }

    let pending = PendingRecord {
        queue: state.traffic.clone(),
        client_ip: ctx.client_ip.to_string(),
        method: ctx.method.clone(),
        path: ctx.path.clone(),
        mirror_id: ctx.mirror_id,
        upstream_status: status.as_u16(),
        image_ref: ctx.image_ref.clone(),
        start: ctx.start,
    };

    let counting = CountingBody::new(
        body.map_err(|e| -> BoxError { e.into() }).boxed(),
        pending,
        Duration::from_secs(state.config.upstream.stream_idle_timeout_secs),
    );

    ctx.finalize_metrics(status.as_u16());
    let upstream_ms = ctx
        .upstream_start
        .map(|s| s.elapsed().as_millis())
        .unwrap_or(0);
    tracing::info!(
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.path,
        status = status.as_u16(),
        prefix = %ctx.prefix,
        mirror_id = ctx.mirror_id,
        upstream_ms = %upstream_ms,
        "access"
    );

    builder.body(BodyExt::boxed(counting)).unwrap()
}

/// Emit the traffic record for a response the proxy built locally (ping,
/// errors) — there is no streamed body to settle it.
fn record_local(state: &AppState, ctx: &RequestContext, status: u16) {
    state.traffic.push(TrafficRecord {
        ts: epoch_ms(),
        client_ip: ctx.client_ip.to_string(),
        method: ctx.method.clone(),
        path: ctx.path.clone(),
        mirror_id: ctx.mirror_id,
        upstream_status: status,
        bytes_out: 0,
        duration_ms: ctx.start.elapsed().as_millis() as u64,
        image_ref: ctx.image_ref.clone(),
        outcome: Outcome::Complete,
    });
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Resolve a `Location` header against the URI that produced it. Absolute
/// URLs pass through; absolute paths inherit the scheme and host. Anything
/// else (relative references) is surfaced to the client instead of guessed.
fn resolve_redirect(base: &str, location: &str) -> Option<String> {
    if location.starts_with("http://") || location.starts_with("https://") {
        return Some(location.to_string());
    }
    if location.starts_with('/') {
        let scheme_end = base.find("://")? + 3;
        let host_end = base[scheme_end..]
            .find('/')
            .map(|i| scheme_end + i)
            .unwrap_or(base.len());
        return Some(format!("{}{}", &base[..host_end], location));
    }
    None
}

fn is_hop_header(name: &HeaderName) -> bool {
    static HOP_HEADERS: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "proxy-connection",
        "te",
        "trailers",
        "transfer-encoding",
        "upgrade",
    ];
    HOP_HEADERS.contains(&name.as_str())
}

fn scrub_request_headers(headers: &mut HeaderMap) {
    let hop: Vec<HeaderName> = headers
        .keys()
        .filter(|name| is_hop_header(name))
        .cloned()
        .collect();
    for name in hop {
        headers.remove(&name);
    }
}
