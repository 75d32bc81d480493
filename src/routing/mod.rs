use crate::error::ProxyError;
use regex::Regex;
use std::sync::OnceLock;

/// What the client is asking for, in registry terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathKind {
    /// `/v2/` discovery ping — answered locally.
    Ping,
    Catalog,
    TagsList,
    Manifest,
    Blob,
    BlobUpload,
}

/// A parsed client path: the routing prefix (if one matched), the repository
/// name as the upstream knows it, and the operation suffix to reassemble the
/// upstream path from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub kind: PathKind,
    /// Matched mirror prefix, stripped from the upstream path. `None` means
    /// the default prefix routes this request.
    pub prefix: Option<String>,
    pub repository: Option<String>,
    /// Path remainder after the repository (`manifests/latest`,
    /// `blobs/sha256:…`, `tags/list`, `blobs/uploads/…`, `_catalog`).
    pub suffix: String,
    /// Reference for accounting: tag or digest, when the operation has one.
    pub reference: Option<String>,
    pub query: Option<String>,
}

impl Route {
    /// Rebuild the upstream path, optionally substituting the repository
    /// (the Docker Hub `library/` shortcut is applied by the proxy after
    /// mirror selection).
    pub fn upstream_path(&self, repository: Option<&str>) -> String {
        let mut path = String::from("/v2/");
        if let Some(repo) = repository.or(self.repository.as_deref()) {
            path.push_str(repo);
            path.push('/');
        }
        path.push_str(&self.suffix);
        if let Some(ref q) = self.query {
            path.push('?');
            path.push_str(q);
        }
        path
    }

    /// `name:tag` / `name@digest` for the traffic log.
    pub fn image_ref(&self, repository: Option<&str>) -> Option<String> {
        let repo = repository.or(self.repository.as_deref())?;
        match (self.kind, &self.reference) {
            (PathKind::Manifest, Some(r)) if r.starts_with("sha256:") => {
                Some(format!("{repo}@{r}"))
            }
            (PathKind::Manifest, Some(r)) => Some(format!("{repo}:{r}")),
            _ => Some(repo.to_string()),
        }
    }
}

fn repo_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Distribution repository-name grammar.
        Regex::new(
            r"^[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*(?:/[a-z0-9]+(?:(?:\.|_|__|-+)[a-z0-9]+)*)*$",
        )
        .expect("repository regex compiles")
    })
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        // Tag or digest.
        Regex::new(r"^(?:[a-zA-Z0-9_][a-zA-Z0-9._-]{0,127}|[a-z0-9+._-]+:[a-fA-F0-9]{32,})$")
            .expect("reference regex compiles")
    })
}

/// Parse a client path (with optional query) into a `Route`.
///
/// `is_known_prefix` answers whether the first segment after `/v2/` names a
/// configured mirror prefix; when it does, the segment is stripped and the
/// remainder forms the upstream path.
pub fn parse_path(
    path: &str,
    query: Option<&str>,
    is_known_prefix: impl Fn(&str) -> bool,
) -> Result<Route, ProxyError> {
    let query = query.map(|q| q.to_string());

    let rest = match path.strip_prefix("/v2") {
        Some("") | Some("/") => {
            return Ok(Route {
                kind: PathKind::Ping,
                prefix: None,
                repository: None,
                suffix: String::new(),
                reference: None,
                query,
            })
        }
        Some(rest) => rest
            .strip_prefix('/')
            .ok_or_else(|| ProxyError::BadRequest(format!("unrecognized path {path:?}")))?,
        // Legacy convenience: `/<name>[:<tag>]` normalises to a manifest pull.
        None => return parse_legacy_shim(path, query, is_known_prefix),
    };

    let had_trailing_slash = rest.ends_with('/');
    let mut segments: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
    if segments.is_empty() || segments[0].is_empty() {
        return Err(ProxyError::BadRequest(format!("unrecognized path {path:?}")));
    }

    let prefix = if segments.len() > 1 && is_known_prefix(segments[0]) {
        Some(segments.remove(0).to_string())
    } else {
        None
    };

    if segments == ["_catalog"] {
        return Ok(Route {
            kind: PathKind::Catalog,
            prefix,
            repository: None,
            suffix: "_catalog".to_string(),
            reference: None,
            query,
        });
    }

    // Scan from the tail: the operation suffix is fixed-shape, everything
    // before it is the repository name (which may itself contain slashes).
    let n = segments.len();
    let (kind, repo_end, suffix, reference) = if n >= 3 && segments[n - 2] == "manifests" {
        (
            PathKind::Manifest,
            n - 2,
            format!("manifests/{}", segments[n - 1]),
            Some(segments[n - 1].to_string()),
        )
    } else if n >= 3 && segments[n - 2] == "tags" && segments[n - 1] == "list" {
        (PathKind::TagsList, n - 2, "tags/list".to_string(), None)
    } else if let Some(uploads_at) = find_blob_uploads(&segments) {
        // `POST …/blobs/uploads/` carries a significant trailing slash.
        let mut suffix = segments[uploads_at..].join("/");
        if had_trailing_slash {
            suffix.push('/');
        }
        (PathKind::BlobUpload, uploads_at, suffix, None)
    } else if n >= 3 && segments[n - 2] == "blobs" {
        (
            PathKind::Blob,
            n - 2,
            format!("blobs/{}", segments[n - 1]),
            Some(segments[n - 1].to_string()),
        )
    } else {
        return Err(ProxyError::BadRequest(format!("unrecognized path {path:?}")));
    };

    if repo_end == 0 {
        return Err(ProxyError::BadRequest(format!("missing repository in {path:?}")));
    }
    let repository = segments[..repo_end].join("/");
    if !repo_regex().is_match(&repository) {
        return Err(ProxyError::BadRequest(format!("invalid repository name {repository:?}")));
    }
    if let Some(ref r) = reference {
        if kind == PathKind::Manifest && !reference_regex().is_match(r) {
            return Err(ProxyError::BadRequest(format!("invalid reference {r:?}")));
        }
    }

    Ok(Route {
        kind,
        prefix,
        repository: Some(repository),
        suffix,
        reference,
        query,
    })
}

/// `…/blobs/uploads[/…]` — the uploads segment pair, wherever the repository
/// name ends.
fn find_blob_uploads(segments: &[&str]) -> Option<usize> {
    segments
        .windows(2)
        .position(|w| w == ["blobs", "uploads"])
}

fn parse_legacy_shim(
    path: &str,
    query: Option<String>,
    is_known_prefix: impl Fn(&str) -> bool,
) -> Result<Route, ProxyError> {
    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| ProxyError::BadRequest(format!("unrecognized path {path:?}")))?;
    if rest.is_empty() {
        return Err(ProxyError::BadRequest("empty image reference".to_string()));
    }

    let (name, tag) = match rest.rsplit_once(':') {
        Some((name, tag)) => (name, tag),
        None => (rest, "latest"),
    };

    let mut segments: Vec<&str> = name.split('/').collect();
    let prefix = if segments.len() > 1 && is_known_prefix(segments[0]) {
        Some(segments.remove(0).to_string())
    } else {
        None
    };

    let repository = segments.join("/");
    if !repo_regex().is_match(&repository) || !reference_regex().is_match(tag) {
        return Err(ProxyError::BadRequest(format!("invalid image reference {rest:?}")));
    }

    Ok(Route {
        kind: PathKind::Manifest,
        prefix,
        repository: Some(repository),
        suffix: format!("manifests/{tag}"),
        reference: Some(tag.to_string()),
        query,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known(prefix: &str) -> impl Fn(&str) -> bool + '_ {
        move |s| s == prefix
    }

    fn none_known(_: &str) -> bool {
        false
    }

    #[test]
    fn ping_paths() {
        for path in ["/v2/", "/v2"] {
            let route = parse_path(path, None, none_known).unwrap();
            assert_eq!(route.kind, PathKind::Ping);
        }
    }

    #[test]
    fn manifest_without_prefix_uses_default_routing() {
        let route = parse_path("/v2/library/nginx/manifests/latest", None, none_known).unwrap();
        assert_eq!(route.kind, PathKind::Manifest);
        assert_eq!(route.prefix, None);
        assert_eq!(route.repository.as_deref(), Some("library/nginx"));
        assert_eq!(route.upstream_path(None), "/v2/library/nginx/manifests/latest");
        assert_eq!(route.image_ref(None).as_deref(), Some("library/nginx:latest"));
    }

    #[test]
    fn known_prefix_is_stripped() {
        let route = parse_path("/v2/ghcr/owner/app/manifests/v1", None, known("ghcr")).unwrap();
        assert_eq!(route.prefix.as_deref(), Some("ghcr"));
        assert_eq!(route.repository.as_deref(), Some("owner/app"));
        assert_eq!(route.upstream_path(None), "/v2/owner/app/manifests/v1");
    }

    #[test]
    fn unknown_first_segment_stays_in_repository() {
        let route = parse_path("/v2/owner/app/manifests/v1", None, known("ghcr")).unwrap();
        assert_eq!(route.prefix, None);
        assert_eq!(route.repository.as_deref(), Some("owner/app"));
    }

    #[test]
    fn blob_and_tags_and_catalog() {
        let blob = parse_path(
            "/v2/library/nginx/blobs/sha256:0123456789abcdef0123456789abcdef",
            None,
            none_known,
        )
        .unwrap();
        assert_eq!(blob.kind, PathKind::Blob);
        assert_eq!(
            blob.upstream_path(None),
            "/v2/library/nginx/blobs/sha256:0123456789abcdef0123456789abcdef"
        );

        let tags = parse_path("/v2/library/nginx/tags/list", Some("n=50"), none_known).unwrap();
        assert_eq!(tags.kind, PathKind::TagsList);
        assert_eq!(tags.upstream_path(None), "/v2/library/nginx/tags/list?n=50");

        let catalog = parse_path("/v2/_catalog", None, none_known).unwrap();
        assert_eq!(catalog.kind, PathKind::Catalog);
        assert_eq!(catalog.upstream_path(None), "/v2/_catalog");

        let prefixed_catalog = parse_path("/v2/ghcr/_catalog", None, known("ghcr")).unwrap();
        assert_eq!(prefixed_catalog.prefix.as_deref(), Some("ghcr"));
        assert_eq!(prefixed_catalog.upstream_path(None), "/v2/_catalog");
    }

    #[test]
    fn blob_upload_paths() {
        let start = parse_path("/v2/owner/app/blobs/uploads/", None, none_known).unwrap();
        assert_eq!(start.kind, PathKind::BlobUpload);
        assert_eq!(start.repository.as_deref(), Some("owner/app"));
        assert_eq!(start.upstream_path(None), "/v2/owner/app/blobs/uploads/");

        let session = parse_path(
            "/v2/owner/app/blobs/uploads/abcd-1234",
            Some("digest=sha256:0123456789abcdef0123456789abcdef"),
            none_known,
        )
        .unwrap();
        assert_eq!(session.kind, PathKind::BlobUpload);
        assert_eq!(
            session.upstream_path(None),
            "/v2/owner/app/blobs/uploads/abcd-1234?digest=sha256:0123456789abcdef0123456789abcdef"
        );
    }

    #[test]
    fn manifest_digest_reference() {
        let route = parse_path(
            "/v2/library/nginx/manifests/sha256:0123456789abcdef0123456789abcdef",
            None,
            none_known,
        )
        .unwrap();
        assert_eq!(
            route.image_ref(None).as_deref(),
            Some("library/nginx@sha256:0123456789abcdef0123456789abcdef")
        );
    }

    #[test]
    fn library_shortcut_substitution() {
        let route = parse_path("/v2/nginx/manifests/latest", None, none_known).unwrap();
        assert_eq!(route.repository.as_deref(), Some("nginx"));
        assert_eq!(
            route.upstream_path(Some("library/nginx")),
            "/v2/library/nginx/manifests/latest"
        );
        assert_eq!(
            route.image_ref(Some("library/nginx")).as_deref(),
            Some("library/nginx:latest")
        );
    }

    #[test]
    fn legacy_shim_normalises_to_manifest() {
        let route = parse_path("/library/nginx:1.25", None, none_known).unwrap();
        assert_eq!(route.kind, PathKind::Manifest);
        assert_eq!(route.repository.as_deref(), Some("library/nginx"));
        assert_eq!(route.upstream_path(None), "/v2/library/nginx/manifests/1.25");

        let untagged = parse_path("/nginx", None, none_known).unwrap();
        assert_eq!(untagged.upstream_path(None), "/v2/nginx/manifests/latest");

        let prefixed = parse_path("/ghcr/owner/app:v2", None, known("ghcr")).unwrap();
        assert_eq!(prefixed.prefix.as_deref(), Some("ghcr"));
        assert_eq!(prefixed.upstream_path(None), "/v2/owner/app/manifests/v2");
    }

    #[test]
    fn malformed_paths_rejected() {
        for path in [
            "/v2/library/nginx/manifests",
            "/v2/manifests/latest",
            "/v2/UPPER/manifests/latest",
            "/v2/library/nginx/unknownop/x",
            "/v2/library/nginx/manifests/bad..ref!!",
        ] {
            assert!(
                matches!(parse_path(path, None, none_known), Err(ProxyError::BadRequest(_))),
                "path {path:?} should be rejected"
            );
        }
    }
}
