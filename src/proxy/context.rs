use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use std::net::IpAddr;
use std::time::Instant;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, BoxError>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request context that flows through the proxy phases and carries what
/// the metrics and the traffic log need.
pub struct RequestContext {
    pub client_ip: IpAddr,
    pub method: String,
    pub path: String,
    /// Routing prefix label, filled once extraction ran.
    pub prefix: String,
    pub mirror_id: Option<i64>,
    pub image_ref: Option<String>,
    pub start: Instant,
    pub upstream_start: Option<Instant>,
}

impl RequestContext {
    pub fn new(method: String, path: String, client_ip: IpAddr) -> Self {
        Self {
            client_ip,
            method,
            path,
            prefix: String::new(),
            mirror_id: None,
            image_ref: None,
            start: Instant::now(),
            upstream_start: None,
        }
    }

    /// Build a JSON error response and record metrics in one place — the
    /// single exit point for all error paths.
    pub fn error_response(&self, status: StatusCode, msg: &str) -> hyper::Response<BoxBody> {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(status.as_u16());

        metrics::counter!(
            "mirrorgate_http_requests_total",
            "prefix" => self.prefix.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "mirrorgate_http_request_duration_seconds",
            "prefix" => self.prefix.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        hyper::Response::builder()
            .status(status)
            .header("content-type", "application/json")
            .body(full_body(serde_json::json!({ "error": msg }).to_string()))
            .unwrap()
    }

    /// Record final metrics once response headers are on the wire.
    pub fn finalize_metrics(&self, resp_status: u16) {
        let mut buf = itoa::Buffer::new();
        let status_str = buf.format(resp_status);

        metrics::counter!(
            "mirrorgate_http_requests_total",
            "prefix" => self.prefix.clone(),
            "method" => self.method.clone(),
            "status_code" => status_str.to_owned(),
        )
        .increment(1);

        metrics::histogram!(
            "mirrorgate_http_request_duration_seconds",
            "prefix" => self.prefix.clone(),
        )
        .record(self.start.elapsed().as_secs_f64());

        if let Some(upstream_start) = self.upstream_start {
            metrics::histogram!(
                "mirrorgate_upstream_request_duration_seconds",
                "prefix" => self.prefix.clone(),
            )
            .record(upstream_start.elapsed().as_secs_f64());
        }
    }
}
