//! Route table and prefix matcher
//!
//! The table is built once from configuration and never mutated afterwards,
//! so it can be shared across request handlers without locking.
//!
//! Matching rules:
//! - a prefix matches when the path continues with `/` or ends right after it
//!   (a prefix that itself ends with `/` already carries the boundary)
//! - the longest matching prefix wins, earlier rules win ties
//! - the matched prefix is replaced by the rule's rewrite prefix; the rest of
//!   the path and the query string are kept as-is

use crate::error::ConfigError;
use axum::http::HeaderValue;
use std::collections::HashSet;
use url::Url;

/// Routing rule as read from configuration, before validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Label used in logs and metrics (defaults to the public prefix)
    pub name: Option<String>,
    /// Externally visible path prefix
    pub public_prefix: String,
    /// Absolute base URL of the upstream service
    pub upstream_base_url: String,
    /// Prefix substituted for the public prefix before forwarding
    pub internal_rewrite_prefix: String,
    pub description: Option<String>,
}

impl RouteSpec {
    pub fn new(
        public_prefix: impl Into<String>,
        upstream_base_url: impl Into<String>,
        internal_rewrite_prefix: impl Into<String>,
    ) -> Self {
        Self {
            name: None,
            public_prefix: public_prefix.into(),
            upstream_base_url: upstream_base_url.into(),
            internal_rewrite_prefix: internal_rewrite_prefix.into(),
            description: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn label(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.public_prefix.clone())
    }
}

/// A validated upstream base URL
#[derive(Debug, Clone)]
pub struct Upstream {
    /// `scheme://authority[/base-path]` without a trailing slash
    base: String,
    /// Value for the outbound `Host` header
    authority: HeaderValue,
}

impl Upstream {
    /// Parse and validate an upstream base URL for the given route label
    pub fn parse(route: &str, raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::MissingUpstream {
                route: route.to_string(),
            });
        }

        let invalid = |message: &str| ConfigError::InvalidUpstream {
            route: route.to_string(),
            url: raw.to_string(),
            message: message.to_string(),
        };

        let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(invalid("scheme must be http or https"));
        }
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("must not contain a query or fragment"));
        }

        // `Url::port` is None when the port is the scheme default.
        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let base = format!(
            "{}://{}{}",
            url.scheme(),
            authority,
            url.path().trim_end_matches('/')
        );
        let authority = HeaderValue::from_str(&authority).map_err(|e| invalid(&e.to_string()))?;

        Ok(Self { base, authority })
    }

    /// Base URL without a trailing slash
    pub fn base(&self) -> &str {
        &self.base
    }

    /// `Host` header value for requests to this upstream
    pub fn host_header(&self) -> &HeaderValue {
        &self.authority
    }

    /// Full target URL for a rewritten path (which may carry a query string)
    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base, path_and_query)
    }
}

/// A validated routing rule
#[derive(Debug, Clone)]
pub struct RouteRule {
    name: String,
    public_prefix: String,
    internal_rewrite_prefix: String,
    upstream: Upstream,
    description: Option<String>,
}

impl RouteRule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_prefix(&self) -> &str {
        &self.public_prefix
    }

    pub fn internal_rewrite_prefix(&self) -> &str {
        &self.internal_rewrite_prefix
    }

    pub fn upstream(&self) -> &Upstream {
        &self.upstream
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// Returns the remainder of `path` after the public prefix, if this rule matches
    fn strip<'p>(&self, path: &'p str) -> Option<&'p str> {
        let rest = path.strip_prefix(self.public_prefix.as_str())?;
        if rest.is_empty() || rest.starts_with('/') || self.public_prefix.ends_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    fn rewrite(&self, suffix: &str) -> String {
        let prefix = self.internal_rewrite_prefix.as_str();
        let path = if suffix.is_empty() {
            prefix.to_string()
        } else if suffix.starts_with('/') {
            format!("{}{}", prefix.trim_end_matches('/'), suffix)
        } else if prefix.ends_with('/') {
            format!("{}{}", prefix, suffix)
        } else {
            format!("{}/{}", prefix, suffix)
        };

        if path.is_empty() {
            "/".to_string()
        } else {
            path
        }
    }
}

/// Outcome of matching a request path against the table
#[derive(Debug)]
pub enum MatchResult<'a> {
    Matched(Matched<'a>),
    NoMatch,
}

/// A selected rule together with the path to send upstream
#[derive(Debug)]
pub struct Matched<'a> {
    pub rule: &'a RouteRule,
    /// Rewritten path, including the original query string if any
    pub rewritten_path: String,
}

impl Matched<'_> {
    /// Absolute URL of the outbound request
    pub fn target_url(&self) -> String {
        self.rule.upstream.url_for(&self.rewritten_path)
    }
}

/// Immutable, ordered collection of routing rules
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
}

impl RouteTable {
    /// Validate the configured rules and build the table, preserving input order.
    ///
    /// Fails on an empty or relative public prefix, a duplicated public prefix,
    /// or an upstream URL that is missing, empty, or not an absolute http(s) URL.
    pub fn build<I>(specs: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = RouteSpec>,
    {
        let mut seen = HashSet::new();
        let mut rules = Vec::new();

        for spec in specs {
            let label = spec.label();
            validate_prefix(&label, &spec.public_prefix)?;
            if !seen.insert(spec.public_prefix.clone()) {
                return Err(ConfigError::DuplicatePrefix {
                    prefix: spec.public_prefix,
                });
            }

            let upstream = Upstream::parse(&label, &spec.upstream_base_url)?;
            let rewrite = spec.internal_rewrite_prefix.trim();
            let internal_rewrite_prefix = if rewrite.is_empty() || rewrite.starts_with('/') {
                rewrite.to_string()
            } else {
                format!("/{}", rewrite)
            };

            rules.push(RouteRule {
                name: label,
                public_prefix: spec.public_prefix,
                internal_rewrite_prefix,
                upstream,
                description: spec.description,
            });
        }

        Ok(Self { rules })
    }

    /// Find the rule for a request path (optionally followed by `?query`)
    pub fn match_path(&self, path_and_query: &str) -> MatchResult<'_> {
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path_and_query, None),
        };

        let mut best: Option<(&RouteRule, &str)> = None;
        for rule in &self.rules {
            let Some(suffix) = rule.strip(path) else {
                continue;
            };
            // Strictly longer only, so the earliest rule keeps a tie.
            let longer = best
                .map(|(current, _)| rule.public_prefix.len() > current.public_prefix.len())
                .unwrap_or(true);
            if longer {
                best = Some((rule, suffix));
            }
        }

        match best {
            Some((rule, suffix)) => {
                let mut rewritten_path = rule.rewrite(suffix);
                if let Some(query) = query {
                    rewritten_path.push('?');
                    rewritten_path.push_str(query);
                }
                MatchResult::Matched(Matched {
                    rule,
                    rewritten_path,
                })
            }
            None => MatchResult::NoMatch,
        }
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Check the shape of a public prefix
pub(crate) fn validate_prefix(route: &str, prefix: &str) -> Result<(), ConfigError> {
    if prefix.is_empty() {
        return Err(ConfigError::EmptyPrefix {
            route: route.to_string(),
        });
    }
    if !prefix.starts_with('/') {
        return Err(ConfigError::RelativePrefix {
            prefix: prefix.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_table() -> RouteTable {
        RouteTable::build(vec![
            RouteSpec::new("/identity-cell/auth", "http://auth:9000", "/api/v1/auth"),
            RouteSpec::new(
                "/identity-cell/accounts",
                "http://accounts:9001",
                "/api/v1/accounts",
            ),
        ])
        .unwrap()
    }

    fn rewritten(table: &RouteTable, path: &str) -> Option<String> {
        match table.match_path(path) {
            MatchResult::Matched(m) => Some(m.rewritten_path),
            MatchResult::NoMatch => None,
        }
    }

    fn matched_prefix(table: &RouteTable, path: &str) -> Option<String> {
        match table.match_path(path) {
            MatchResult::Matched(m) => Some(m.rule.public_prefix().to_string()),
            MatchResult::NoMatch => None,
        }
    }

    #[test]
    fn test_exact_prefix_rewrites_to_rewrite_prefix() {
        let table = identity_table();
        for rule in table.rules() {
            assert_eq!(
                rewritten(&table, rule.public_prefix()).as_deref(),
                Some(rule.internal_rewrite_prefix())
            );
        }
    }

    #[test]
    fn test_subpath_is_appended() {
        let table = identity_table();
        for rule in table.rules() {
            let path = format!("{}/x", rule.public_prefix());
            assert_eq!(
                rewritten(&table, &path),
                Some(format!("{}/x", rule.internal_rewrite_prefix()))
            );
        }
    }

    #[test]
    fn test_prefix_without_separator_does_not_match() {
        let table = identity_table();
        assert_eq!(rewritten(&table, "/identity-cell/authx"), None);
        assert_eq!(rewritten(&table, "/identity-cell/accountsx/1"), None);
        assert_eq!(rewritten(&table, "/identity-cell"), None);
        assert_eq!(rewritten(&table, "/"), None);
    }

    #[test]
    fn test_trailing_slash_and_query_preserved() {
        let table = identity_table();
        assert_eq!(
            rewritten(&table, "/identity-cell/auth/").as_deref(),
            Some("/api/v1/auth/")
        );
        assert_eq!(
            rewritten(&table, "/identity-cell/auth/login?x=1").as_deref(),
            Some("/api/v1/auth/login?x=1")
        );
        assert_eq!(
            rewritten(&table, "/identity-cell/auth?next=%2Fhome&a=b").as_deref(),
            Some("/api/v1/auth?next=%2Fhome&a=b")
        );
        assert_eq!(
            rewritten(&table, "/identity-cell/accounts/?").as_deref(),
            Some("/api/v1/accounts/?")
        );
    }

    #[test]
    fn test_query_does_not_affect_boundary() {
        let table = identity_table();
        assert_eq!(
            matched_prefix(&table, "/identity-cell/auth?x=1").as_deref(),
            Some("/identity-cell/auth")
        );
        assert_eq!(rewritten(&table, "/identity-cell/authx?x=1"), None);
    }

    #[test]
    fn test_longest_prefix_wins() {
        let table = RouteTable::build(vec![
            RouteSpec::new("/a", "http://one:80", "/one"),
            RouteSpec::new("/a/b", "http://two:80", "/two"),
        ])
        .unwrap();

        assert_eq!(matched_prefix(&table, "/a/b/c").as_deref(), Some("/a/b"));
        assert_eq!(rewritten(&table, "/a/b/c").as_deref(), Some("/two/c"));
        assert_eq!(matched_prefix(&table, "/a/bc").as_deref(), Some("/a"));
        assert_eq!(matched_prefix(&table, "/a").as_deref(), Some("/a"));
    }

    #[test]
    fn test_longest_prefix_wins_regardless_of_order() {
        let table = RouteTable::build(vec![
            RouteSpec::new("/a/b", "http://two:80", "/two"),
            RouteSpec::new("/a", "http://one:80", "/one"),
        ])
        .unwrap();

        assert_eq!(matched_prefix(&table, "/a/b/c").as_deref(), Some("/a/b"));
        assert_eq!(matched_prefix(&table, "/a/c").as_deref(), Some("/a"));
    }

    #[test]
    fn test_equal_length_tie_goes_to_earliest_rule() {
        // build() rejects identical prefixes, so assemble the rules directly.
        let first = RouteTable::build(vec![
            RouteSpec::new("/x", "http://first:80", "/first").with_name("first")
        ])
        .unwrap();
        let second = RouteTable::build(vec![
            RouteSpec::new("/x", "http://second:80", "/second").with_name("second")
        ])
        .unwrap();
        let table = RouteTable {
            rules: vec![first.rules[0].clone(), second.rules[0].clone()],
        };

        match table.match_path("/x/y") {
            MatchResult::Matched(m) => {
                assert_eq!(m.rule.name(), "first");
                assert_eq!(m.rewritten_path, "/first/y");
            }
            MatchResult::NoMatch => panic!("expected a match"),
        }
    }

    #[test]
    fn test_trailing_slash_prefix() {
        let table = RouteTable::build(vec![
            RouteSpec::new("/x/", "http://first:80", "/first").with_name("first"),
            RouteSpec::new("/x/y", "http://second:80", "/second").with_name("second"),
        ])
        .unwrap();

        match table.match_path("/x/y/1") {
            MatchResult::Matched(m) => assert_eq!(m.rule.name(), "second"),
            MatchResult::NoMatch => panic!("expected a match"),
        }
        match table.match_path("/x/q") {
            MatchResult::Matched(m) => {
                assert_eq!(m.rule.name(), "first");
                assert_eq!(m.rewritten_path, "/first/q");
            }
            MatchResult::NoMatch => panic!("expected a match"),
        }
        assert_eq!(rewritten(&table, "/x"), None);
    }

    #[test]
    fn test_root_prefix_matches_everything() {
        let table = RouteTable::build(vec![
            RouteSpec::new("/", "http://catchall:80", "/"),
            RouteSpec::new("/api", "http://api:80", "/internal"),
        ])
        .unwrap();

        assert_eq!(matched_prefix(&table, "/anything/here").as_deref(), Some("/"));
        assert_eq!(rewritten(&table, "/anything/here").as_deref(), Some("/anything/here"));
        assert_eq!(rewritten(&table, "/").as_deref(), Some("/"));
        assert_eq!(matched_prefix(&table, "/api/v").as_deref(), Some("/api"));
    }

    #[test]
    fn test_empty_rewrite_prefix_strips() {
        let table =
            RouteTable::build(vec![RouteSpec::new("/svc", "http://svc:80", "")]).unwrap();
        assert_eq!(rewritten(&table, "/svc").as_deref(), Some("/"));
        assert_eq!(rewritten(&table, "/svc/users").as_deref(), Some("/users"));
    }

    #[test]
    fn test_rewrite_prefix_normalized() {
        let table = RouteTable::build(vec![
            RouteSpec::new("/a", "http://a:80", "api/v1"),
            RouteSpec::new("/b", "http://b:80", "/api/v2/"),
        ])
        .unwrap();
        assert_eq!(rewritten(&table, "/a/x").as_deref(), Some("/api/v1/x"));
        assert_eq!(rewritten(&table, "/b/x").as_deref(), Some("/api/v2/x"));
        assert_eq!(rewritten(&table, "/b").as_deref(), Some("/api/v2/"));
    }

    #[test]
    fn test_build_preserves_order() {
        let table = identity_table();
        let prefixes: Vec<_> = table.rules().iter().map(|r| r.public_prefix()).collect();
        assert_eq!(prefixes, vec!["/identity-cell/auth", "/identity-cell/accounts"]);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_build_rejects_duplicate_prefix() {
        let result = RouteTable::build(vec![
            RouteSpec::new("/identity-cell/auth", "http://auth:9000", "/api/v1/auth"),
            RouteSpec::new("/identity-cell/auth", "http://other:9000", "/api/v2/auth"),
        ]);
        assert!(matches!(result, Err(ConfigError::DuplicatePrefix { .. })));
    }

    #[test]
    fn test_build_rejects_missing_upstream() {
        let result = RouteTable::build(vec![RouteSpec::new("/a", "", "/x")]);
        assert!(matches!(result, Err(ConfigError::MissingUpstream { .. })));

        let result = RouteTable::build(vec![RouteSpec::new("/a", "   ", "/x")]);
        assert!(matches!(result, Err(ConfigError::MissingUpstream { .. })));
    }

    #[test]
    fn test_build_rejects_malformed_upstream() {
        for url in [
            "auth:9000",
            "not a url",
            "/relative/path",
            "ftp://auth:21",
            "http://auth:9000/?x=1",
        ] {
            let result = RouteTable::build(vec![RouteSpec::new("/a", url, "/x")]);
            assert!(
                matches!(result, Err(ConfigError::InvalidUpstream { .. })),
                "{} should be rejected",
                url
            );
        }
    }

    #[test]
    fn test_build_rejects_bad_prefix() {
        let result = RouteTable::build(vec![RouteSpec::new("", "http://a:80", "/x")]);
        assert!(matches!(result, Err(ConfigError::EmptyPrefix { .. })));

        let result = RouteTable::build(vec![RouteSpec::new(
            "identity-cell/api/v1/auth",
            "http://a:80",
            "/x",
        )]);
        assert!(matches!(result, Err(ConfigError::RelativePrefix { .. })));
    }

    #[test]
    fn test_upstream_parse() {
        let upstream = Upstream::parse("auth", "http://auth:9000").unwrap();
        assert_eq!(upstream.base(), "http://auth:9000");
        assert_eq!(upstream.host_header(), "auth:9000");

        let upstream = Upstream::parse("auth", "http://auth:9000/").unwrap();
        assert_eq!(upstream.base(), "http://auth:9000");

        let upstream = Upstream::parse("auth", "https://auth.internal").unwrap();
        assert_eq!(upstream.base(), "https://auth.internal");
        assert_eq!(upstream.host_header(), "auth.internal");

        let upstream = Upstream::parse("auth", "http://auth:80/base/").unwrap();
        assert_eq!(upstream.base(), "http://auth/base");
        assert_eq!(
            upstream.url_for("/api/v1/auth/login?x=1"),
            "http://auth/base/api/v1/auth/login?x=1"
        );
    }

    #[test]
    fn test_target_url() {
        let table = RouteTable::build(vec![RouteSpec::new(
            "/identity-cell/auth",
            "http://auth:9000",
            "/api/v1/auth",
        )])
        .unwrap();

        match table.match_path("/identity-cell/auth/login?x=1") {
            MatchResult::Matched(m) => {
                assert_eq!(m.target_url(), "http://auth:9000/api/v1/auth/login?x=1")
            }
            MatchResult::NoMatch => panic!("expected a match"),
        }
    }
}
