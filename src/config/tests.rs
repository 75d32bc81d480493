use super::*;
use std::path::Path;

#[test]
fn defaults_when_file_missing() {
    let cfg = ProxyConfig::load(Path::new("/nonexistent/mirrorgate.toml")).unwrap();
    assert_eq!(cfg.listen, "0.0.0.0:8000");
    assert_eq!(cfg.admin_base, "/api");
    assert_eq!(cfg.default_prefix, "dockerhub");
    assert_eq!(cfg.probe.interval_secs, 3600);
    assert_eq!(cfg.probe.timeout_secs, 10);
    assert_eq!(cfg.probe.failure_threshold, 1);
    assert_eq!(cfg.token_cache.capacity, 4096);
    assert!(cfg.mirrors.is_empty());
}

#[test]
fn parses_toml_with_mirror_seed() {
    let toml = r#"
        listen = "127.0.0.1:9000"

        [[mirrors]]
        prefix = "dockerhub"
        upstream_url = "https://registry-1.docker.io"
        upstream_host = "registry-1.docker.io"

        [[mirrors]]
        prefix = "harbor-a"
        upstream_url = "https://harbor.example"
        auth = { kind = "basic", username = "alice", password = "s3cret" }
    "#;
    let cfg: ProxyConfig = ::toml::from_str(toml).unwrap();
    cfg.validate().unwrap();

    assert_eq!(cfg.listen, "127.0.0.1:9000");
    assert_eq!(cfg.mirrors.len(), 2);
    assert_eq!(cfg.mirrors[0].prefix, "dockerhub");
    assert!(cfg.mirrors[0].enabled);
    assert_eq!(cfg.mirrors[0].auth, MirrorAuth::None);
    match &cfg.mirrors[1].auth {
        MirrorAuth::Basic { username, password } => {
            assert_eq!(username, "alice");
            assert_eq!(password, "s3cret");
        }
        other => panic!("expected basic auth, got {:?}", other),
    }
}

#[test]
fn parses_json_auth_variants() {
    let json = r#"{
        "mirrors": [
            {"prefix": "ghcr", "upstream_url": "https://ghcr.io",
             "auth": {"kind": "bearer-delegated"}},
            {"prefix": "quay", "upstream_url": "https://quay.io",
             "auth": {"kind": "none"}, "enabled": false}
        ]
    }"#;
    let cfg: ProxyConfig = serde_json::from_str(json).unwrap();
    assert_eq!(cfg.mirrors[0].auth, MirrorAuth::BearerDelegated);
    assert_eq!(cfg.mirrors[1].auth, MirrorAuth::None);
    assert!(!cfg.mirrors[1].enabled);
}

#[test]
fn rejects_bad_mirror_specs() {
    let bad_prefix = MirrorSpec {
        prefix: "Docker Hub".to_string(),
        upstream_url: "https://registry-1.docker.io".to_string(),
        upstream_host: None,
        auth: MirrorAuth::None,
        enabled: true,
    };
    assert!(validate_mirror_spec(&bad_prefix).is_err());

    let trailing_slash = MirrorSpec {
        prefix: "ghcr".to_string(),
        upstream_url: "https://ghcr.io/".to_string(),
        upstream_host: None,
        auth: MirrorAuth::None,
        enabled: true,
    };
    assert!(validate_mirror_spec(&trailing_slash).is_err());

    let relative_url = MirrorSpec {
        prefix: "ghcr".to_string(),
        upstream_url: "ghcr.io".to_string(),
        upstream_host: None,
        auth: MirrorAuth::None,
        enabled: true,
    };
    assert!(validate_mirror_spec(&relative_url).is_err());
}

#[test]
fn duration_env_values_accept_humantime_and_bare_seconds() {
    assert_eq!(super::parse_duration_secs("3600s", "X").unwrap(), 3600);
    assert_eq!(super::parse_duration_secs("1h", "X").unwrap(), 3600);
    assert_eq!(super::parse_duration_secs("45", "X").unwrap(), 45);
    assert!(super::parse_duration_secs("soon", "X").is_err());
}
