pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;
use std::time::Duration;

impl ProxyConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the proxy starts with zero configuration and an empty
    /// mirror set managed entirely through the Admin API.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: ProxyConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            ProxyConfig::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides. Durations accept humantime strings ("3600s",
    /// "1h") as well as bare seconds.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("LISTEN_ADDR") {
            self.listen = v;
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            self.data_dir = v.into();
        }
        if let Ok(v) = std::env::var("PROBE_INTERVAL") {
            self.probe.interval_secs = parse_duration_secs(&v, "PROBE_INTERVAL")?;
        }
        if let Ok(v) = std::env::var("PROBE_TIMEOUT") {
            self.probe.timeout_secs = parse_duration_secs(&v, "PROBE_TIMEOUT")?;
        }
        if let Ok(v) = std::env::var("MIRRORGATE_AUTH_SECRET") {
            self.auth_secret = Some(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen.is_empty() {
            anyhow::bail!("listen address cannot be empty");
        }
        if !self.admin_base.starts_with('/') || self.admin_base.len() < 2 {
            anyhow::bail!("admin_base must be a non-root absolute path, got {:?}", self.admin_base);
        }
        if self.probe.timeout_secs == 0 {
            anyhow::bail!("probe timeout must be positive");
        }
        if self.traffic.batch_size == 0 || self.traffic.queue_capacity == 0 {
            anyhow::bail!("traffic batch size and queue capacity must be positive");
        }
        for spec in &self.mirrors {
            validate_mirror_spec(spec)?;
        }
        Ok(())
    }
}

/// Shared by config validation and the Admin API create/update paths.
pub fn validate_mirror_spec(spec: &MirrorSpec) -> Result<()> {
    if spec.prefix.is_empty() {
        anyhow::bail!("mirror prefix cannot be empty");
    }
    if !spec
        .prefix
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
    {
        anyhow::bail!("mirror prefix {:?} must be lowercase alphanumeric with - or _", spec.prefix);
    }
    if !spec.upstream_url.starts_with("http://") && !spec.upstream_url.starts_with("https://") {
        anyhow::bail!("upstream_url {:?} must be an absolute http(s) URL", spec.upstream_url);
    }
    if spec.upstream_url.ends_with('/') {
        anyhow::bail!("upstream_url {:?} must not have a trailing slash", spec.upstream_url);
    }
    Ok(())
}

fn parse_duration_secs(value: &str, name: &str) -> Result<u64> {
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(secs);
    }
    match humantime::parse_duration(value) {
        Ok(d) => Ok(d.as_secs()),
        Err(e) => anyhow::bail!("invalid duration in {}: {:?} ({})", name, value, e),
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl TrafficConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}
