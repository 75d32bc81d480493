use crate::error::ProxyError;
use crate::upstream::registry::{Mirror, MirrorRegistry};

/// Pick the best live mirror for a route prefix: lowest probe latency among
/// enabled, non-unhealthy mirrors; unknown-health mirrors last; smallest id
/// wins ties so selection is deterministic.
pub fn select(registry: &MirrorRegistry, prefix: &str) -> Result<Mirror, ProxyError> {
    registry
        .get_by_prefix(prefix)
        .ok_or(ProxyError::NoUpstream)
}

/// Full failover ordering for a prefix, best first.
pub fn candidates(registry: &MirrorRegistry, prefix: &str) -> Vec<Mirror> {
    registry.list_by_prefix(prefix, true)
}
