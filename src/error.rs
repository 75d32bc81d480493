use http::StatusCode;
use std::fmt;

/// Proxy-side error taxonomy. Each kind maps to a fixed client outcome;
/// `UpstreamUnavailable` is the only kind recovered locally (failover), and
/// only before any response bytes have reached the client. Failures after
/// streaming starts never become one of these — they close the connection
/// and are recorded through the traffic outcome instead.
#[derive(Debug)]
pub enum ProxyError {
    /// No enabled, healthy mirror for the requested prefix.
    NoUpstream,
    /// Token realm unreachable, rejected our credentials, or returned garbage.
    AuthFailure(String),
    /// Transport error, header timeout, or 5xx before the response body
    /// started.
    UpstreamUnavailable(String),
    /// Malformed registry path or image reference.
    BadRequest(String),
    Store(String),
    Internal(String),
}

impl ProxyError {
    /// The HTTP status surfaced to the client for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::NoUpstream => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::AuthFailure(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used in JSON error bodies.
    pub fn label(&self) -> &'static str {
        match self {
            ProxyError::NoUpstream => "no upstream",
            ProxyError::AuthFailure(_) => "upstream auth failure",
            ProxyError::UpstreamUnavailable(_) => "upstream unavailable",
            ProxyError::BadRequest(_) => "bad request",
            ProxyError::Store(_) => "store error",
            ProxyError::Internal(_) => "internal error",
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::NoUpstream => write!(f, "no upstream available"),
            ProxyError::AuthFailure(msg) => write!(f, "upstream auth failure: {}", msg),
            ProxyError::UpstreamUnavailable(msg) => write!(f, "upstream unavailable: {}", msg),
            ProxyError::BadRequest(msg) => write!(f, "bad request: {}", msg),
            ProxyError::Store(msg) => write!(f, "store error: {}", msg),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}

impl From<rusqlite::Error> for ProxyError {
    fn from(e: rusqlite::Error) -> Self {
        ProxyError::Store(e.to_string())
    }
}
