pub mod prober;
pub mod registry;
pub mod selector;

pub use prober::{build_probe_client, run_probe_round};
pub use registry::{Mirror, MirrorRegistry, MirrorView};
pub use selector::{candidates, select};

/// Probed health of a mirror. `Unknown` mirrors are selectable (last in
/// order) so a fresh deployment can serve traffic before the first round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Unknown,
    Healthy,
    Unhealthy,
}

impl Health {
    pub fn as_str(self) -> &'static str {
        match self {
            Health::Unknown => "unknown",
            Health::Healthy => "healthy",
            Health::Unhealthy => "unhealthy",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "healthy" => Health::Healthy,
            "unhealthy" => Health::Unhealthy,
            _ => Health::Unknown,
        }
    }
}

impl serde::Serialize for Health {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
