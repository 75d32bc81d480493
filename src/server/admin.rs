use super::AppState;
use crate::config::validate_mirror_spec;
use crate::proxy::context::{full_body, BoxBody};
use crate::store::MirrorPatch;
use crate::upstream::MirrorView;
use http::{Method, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Request, Response};
use serde::Serialize;
use std::sync::OnceLock;
use tracing::{info, warn};

/// Admin request bodies are small JSON documents; anything larger is a
/// client error.
const MAX_BODY_BYTES: usize = 64 * 1024;

const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;

/// Operator API mounted under the configured base path (default `/api`).
/// Mutations write the store first, then patch the in-memory registry, so a
/// crash between the two re-converges at the next startup load.
pub async fn handle_admin(
    req: Request<Incoming>,
    state: AppState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let rest = path
        .strip_prefix(state.config.admin_base.as_str())
        .map(|rest| rest.trim_matches('/').to_string())
        .unwrap_or_default();
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();
    let method = req.method().clone();

    match segments.as_slice() {
        ["healthz"] if method == Method::GET => Ok(json_ok(&serde_json::json!({"status": "ok"}))),

        ["metrics"] if method == Method::GET => Ok(Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(full_body(state.metrics.render()))
            .unwrap()),

        ["mirrors"] if method == Method::GET => {
            let views: Vec<MirrorView> = state.registry.all().iter().map(MirrorView::from).collect();
            Ok(json_ok(&views))
        }

        ["mirrors"] if method == Method::POST => create_mirror(req, state).await,

        ["mirrors", id] if method == Method::PATCH => match id.parse::<i64>() {
            Ok(id) => patch_mirror(req, state, id).await,
            Err(_) => Ok(error_response(StatusCode::BAD_REQUEST, "invalid mirror id")),
        },

        ["mirrors", id] if method == Method::DELETE => match id.parse::<i64>() {
            Ok(id) => delete_mirror(state, id).await,
            Err(_) => Ok(error_response(StatusCode::BAD_REQUEST, "invalid mirror id")),
        },

        ["mirrors", id, "toggle"] if method == Method::POST => match id.parse::<i64>() {
            Ok(id) => toggle_mirror(state, id).await,
            Err(_) => Ok(error_response(StatusCode::BAD_REQUEST, "invalid mirror id")),
        },

        ["probe"] if method == Method::POST => {
            info!("admin: probe round requested");
            state.probe_wake.notify_one();
            Ok(accepted())
        }

        // The mirror-list scraper is an external collaborator; accept the
        // trigger so tooling works even with no scraper wired in.
        ["scrape"] if method == Method::POST => {
            info!("admin: scrape requested, no scraper configured");
            Ok(accepted())
        }

        ["stats"] if method == Method::GET => {
            let store = state.store.clone();
            match tokio::task::spawn_blocking(move || store.stats()).await {
                Ok(Ok(stats)) => Ok(json_ok(&stats)),
                Ok(Err(e)) => Ok(store_error(&e)),
                Err(e) => Ok(join_error(&e)),
            }
        }

        ["history"] if method == Method::GET => {
            let limit = req
                .uri()
                .query()
                .and_then(|q| {
                    q.split('&')
                        .find_map(|kv| kv.strip_prefix("limit="))
                        .and_then(|v| v.parse::<usize>().ok())
                })
                .unwrap_or(DEFAULT_HISTORY_LIMIT)
                .clamp(1, MAX_HISTORY_LIMIT);
            let store = state.store.clone();
            match tokio::task::spawn_blocking(move || store.history(limit)).await {
                Ok(Ok(entries)) => Ok(json_ok(&entries)),
                Ok(Err(e)) => Ok(store_error(&e)),
                Err(e) => Ok(join_error(&e)),
            }
        }

        ["search"] if method == Method::GET => search_dockerhub(req).await,

        _ => Ok(error_response(StatusCode::NOT_FOUND, "not found")),
    }
}

async fn create_mirror(
    req: Request<Incoming>,
    state: AppState,
) -> Result<Response<BoxBody>, hyper::Error> {
    let spec = match read_json::<crate::config::MirrorSpec>(req).await? {
        Ok(spec) => spec,
        Err(resp) => return Ok(resp),
    };
    if let Err(e) = validate_mirror_spec(&spec) {
        return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string()));
    }

    let store = state.store.clone();
    let inserted = {
        let spec = spec.clone();
        tokio::task::spawn_blocking(move || store.insert_mirror(&spec)).await
    };
    match inserted {
        Ok(Ok(stored)) => {
            state.registry.upsert(&stored);
            info!("admin: mirror created, id={}, prefix={}", stored.id, stored.spec.prefix);
            let view = state.registry.get(stored.id).as_ref().map(MirrorView::from);
            Ok(json_with_status(StatusCode::CREATED, &view))
        }
        Ok(Err(e)) => Ok(store_error(&e)),
        Err(e) => Ok(join_error(&e)),
    }
}

async fn patch_mirror(
    req: Request<Incoming>,
    state: AppState,
    id: i64,
) -> Result<Response<BoxBody>, hyper::Error> {
    let patch = match read_json::<MirrorPatch>(req).await? {
        Ok(patch) => patch,
        Err(resp) => return Ok(resp),
    };

    // Validate the would-be spec before anything is written.
    let current = {
        let store = state.store.clone();
        match tokio::task::spawn_blocking(move || store.get_mirror(id)).await {
            Ok(Ok(Some(current))) => current,
            Ok(Ok(None)) => return Ok(error_response(StatusCode::NOT_FOUND, "no such mirror")),
            Ok(Err(e)) => return Ok(store_error(&e)),
            Err(e) => return Ok(join_error(&e)),
        }
    };
    if let Err(e) = validate_mirror_spec(&patch.apply(&current.spec)) {
        return Ok(error_response(StatusCode::BAD_REQUEST, &e.to_string()));
    }

    let store = state.store.clone();
    let updated = {
        let patch = patch.clone();
        tokio::task::spawn_blocking(move || store.update_mirror(id, &patch)).await
    };
    match updated {
        Ok(Ok(Some(stored))) => {
            state.registry.upsert(&stored);
            info!("admin: mirror updated, id={}", id);
            let view = state.registry.get(id).as_ref().map(MirrorView::from);
            Ok(json_ok(&view))
        }
        Ok(Ok(None)) => Ok(error_response(StatusCode::NOT_FOUND, "no such mirror")),
        Ok(Err(e)) => Ok(store_error(&e)),
        Err(e) => Ok(join_error(&e)),
    }
}

async fn delete_mirror(state: AppState, id: i64) -> Result<Response<BoxBody>, hyper::Error> {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.delete_mirror(id)).await {
        Ok(Ok(true)) => {
            state.registry.remove(id);
            info!("admin: mirror deleted, id={}", id);
            Ok(Response::builder()
                .status(StatusCode::NO_CONTENT)
                .body(crate::proxy::context::empty_body())
                .unwrap())
        }
        Ok(Ok(false)) => Ok(error_response(StatusCode::NOT_FOUND, "no such mirror")),
        Ok(Err(e)) => Ok(store_error(&e)),
        Err(e) => Ok(join_error(&e)),
    }
}

async fn toggle_mirror(state: AppState, id: i64) -> Result<Response<BoxBody>, hyper::Error> {
    let store = state.store.clone();
    match tokio::task::spawn_blocking(move || store.toggle_mirror(id)).await {
        Ok(Ok(Some(stored))) => {
            state.registry.upsert(&stored);
            info!("admin: mirror toggled, id={}, enabled={}", id, stored.spec.enabled);
            let view = state.registry.get(id).as_ref().map(MirrorView::from);
            Ok(json_ok(&view))
        }
        Ok(Ok(None)) => Ok(error_response(StatusCode::NOT_FOUND, "no such mirror")),
        Ok(Err(e)) => Ok(store_error(&e)),
        Err(e) => Ok(join_error(&e)),
    }
}

/// Thin passthrough to Docker Hub's search endpoint — a UI convenience, not
/// part of the registry surface.
async fn search_dockerhub(req: Request<Incoming>) -> Result<Response<BoxBody>, hyper::Error> {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    let client = CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build search client")
    });

    let query = req
        .uri()
        .query()
        .and_then(|q| q.split('&').find_map(|kv| kv.strip_prefix("q=")))
        .unwrap_or("");
    if query.is_empty() {
        return Ok(error_response(StatusCode::BAD_REQUEST, "missing query"));
    }

    let url = format!(
        "https://hub.docker.com/v2/search/repositories/?query={}&page_size=25",
        query
    );
    match client.get(&url).send().await {
        Ok(resp) => {
            let status = StatusCode::from_u16(resp.status().as_u16())
                .unwrap_or(StatusCode::BAD_GATEWAY);
            let body = resp.bytes().await.unwrap_or_default();
            Ok(Response::builder()
                .status(status)
                .header("content-type", "application/json")
                .body(full_body(body))
                .unwrap())
        }
        Err(e) => {
            warn!("admin: search passthrough failed, error={}", e);
            Ok(error_response(StatusCode::BAD_GATEWAY, "search unavailable"))
        }
    }
}

/// Collect and deserialize a small JSON request body. The Ok/Err layering
/// keeps hyper errors (client went away) separate from client mistakes.
async fn read_json<T: serde::de::DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<Result<T, Response<BoxBody>>, hyper::Error> {
    let body = req.into_body().collect().await?.to_bytes();
    if body.len() > MAX_BODY_BYTES {
        return Ok(Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request body too large",
        )));
    }
    match serde_json::from_slice(&body) {
        Ok(value) => Ok(Ok(value)),
        Err(e) => Ok(Err(error_response(
            StatusCode::BAD_REQUEST,
            &format!("invalid json: {e}"),
        ))),
    }
}

fn json_ok<T: Serialize>(value: &T) -> Response<BoxBody> {
    json_with_status(StatusCode::OK, value)
}

fn json_with_status<T: Serialize>(status: StatusCode, value: &T) -> Response<BoxBody> {
    let body = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(body))
        .unwrap()
}

fn accepted() -> Response<BoxBody> {
    Response::builder()
        .status(StatusCode::ACCEPTED)
        .body(crate::proxy::context::empty_body())
        .unwrap()
}

fn error_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(
            serde_json::json!({ "error": msg }).to_string(),
        ))
        .unwrap()
}

fn store_error(e: &crate::error::ProxyError) -> Response<BoxBody> {
    warn!("admin: store operation failed, error={}", e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "store error")
}

fn join_error(e: &tokio::task::JoinError) -> Response<BoxBody> {
    warn!("admin: store task panicked, error={}", e);
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
