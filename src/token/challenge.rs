/// `Www-Authenticate` challenge as sent by registry upstreams.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    /// `Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull"`
    Bearer {
        realm: String,
        service: Option<String>,
        scope: Option<String>,
    },
    /// `Basic realm="harbor"`
    Basic,
}

/// Parse a `Www-Authenticate` header value. Returns `None` for schemes the
/// proxy cannot answer or a Bearer challenge missing its realm.
pub fn parse_www_authenticate(value: &str) -> Option<Challenge> {
    let value = value.trim();
    let (scheme, params) = match value.split_once(char::is_whitespace) {
        Some((scheme, rest)) => (scheme, rest),
        None => (value, ""),
    };

    if scheme.eq_ignore_ascii_case("basic") {
        return Some(Challenge::Basic);
    }
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for (key, val) in parse_params(params) {
        match key.to_ascii_lowercase().as_str() {
            "realm" => realm = Some(val),
            "service" => service = Some(val),
            "scope" => scope = Some(val),
            _ => {}
        }
    }

    realm.map(|realm| Challenge::Bearer {
        realm,
        service,
        scope,
    })
}

/// Split `k="v", k2=v2` auth params, honoring quoted values with embedded
/// commas and backslash escapes.
fn parse_params(input: &str) -> Vec<(String, String)> {
    let mut params = Vec::new();
    let mut chars = input.chars().peekable();

    loop {
        // Skip separators.
        while matches!(chars.peek(), Some(c) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut key = String::new();
        for c in chars.by_ref() {
            if c == '=' {
                break;
            }
            key.push(c);
        }

        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            let mut escaped = false;
            for c in chars.by_ref() {
                if escaped {
                    value.push(c);
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    break;
                } else {
                    value.push(c);
                }
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c == ',' {
                    break;
                }
                value.push(c);
                chars.next();
            }
        }

        let key = key.trim().to_string();
        if !key.is_empty() {
            params.push((key, value.trim().to_string()));
        }
    }

    params
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dockerhub_bearer_challenge() {
        let header = r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/nginx:pull""#;
        assert_eq!(
            parse_www_authenticate(header),
            Some(Challenge::Bearer {
                realm: "https://auth.docker.io/token".to_string(),
                service: Some("registry.docker.io".to_string()),
                scope: Some("repository:library/nginx:pull".to_string()),
            })
        );
    }

    #[test]
    fn parses_bearer_without_scope() {
        let header = r#"Bearer realm="https://ghcr.io/token",service="ghcr.io""#;
        match parse_www_authenticate(header) {
            Some(Challenge::Bearer { realm, service, scope }) => {
                assert_eq!(realm, "https://ghcr.io/token");
                assert_eq!(service.as_deref(), Some("ghcr.io"));
                assert_eq!(scope, None);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn parses_basic_challenge() {
        assert_eq!(parse_www_authenticate(r#"Basic realm="harbor""#), Some(Challenge::Basic));
        assert_eq!(parse_www_authenticate("basic"), Some(Challenge::Basic));
    }

    #[test]
    fn bearer_without_realm_is_rejected() {
        assert_eq!(parse_www_authenticate(r#"Bearer service="x""#), None);
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        assert_eq!(parse_www_authenticate("Negotiate"), None);
    }

    #[test]
    fn unquoted_values_and_spacing_are_tolerated() {
        let header = "Bearer realm=https://auth.example/token , service=reg.example";
        match parse_www_authenticate(header) {
            Some(Challenge::Bearer { realm, service, .. }) => {
                assert_eq!(realm, "https://auth.example/token");
                assert_eq!(service.as_deref(), Some("reg.example"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn quoted_value_may_contain_commas() {
        let header = r#"Bearer realm="https://auth.example/token",scope="repository:a/b:pull,push""#;
        match parse_www_authenticate(header) {
            Some(Challenge::Bearer { scope, .. }) => {
                assert_eq!(scope.as_deref(), Some("repository:a/b:pull,push"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
