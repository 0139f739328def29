//! Cache key construction and invalidation-pattern matching (spec §4.9:
//! `"<module>:<endpoint>:<sorted-kv-params>"`).

/// Build a cache key from a module, an endpoint, and a set of query
/// parameters. Parameters are sorted by key so callers don't need to agree
/// on an ordering convention.
pub fn build_key(module: &str, endpoint: &str, params: &[(&str, &str)]) -> String {
    let mut sorted = params.to_vec();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let params_str = sorted.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join(",");
    format!("{module}:{endpoint}:{params_str}")
}

/// One of the three invalidation modes spec §4.9 names: a full key, a
/// `<module>:<endpoint>:*` prefix, or a `<module>:*` prefix.
pub enum InvalidationTarget {
    Key(String),
    Prefix(String),
}

impl InvalidationTarget {
    /// Parse a caller-supplied pattern: a trailing `*` marks it a prefix.
    pub fn parse(pattern: &str) -> Self {
        match pattern.strip_suffix('*') {
            Some(prefix) => InvalidationTarget::Prefix(prefix.to_string()),
            None => InvalidationTarget::Key(pattern.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorts_params_regardless_of_call_order() {
        let a = build_key("monitor", "metrics", &[("b", "2"), ("a", "1")]);
        let b = build_key("monitor", "metrics", &[("a", "1"), ("b", "2")]);
        assert_eq!(a, b);
        assert_eq!(a, "monitor:metrics:a=1,b=2");
    }

    #[test]
    fn parses_module_endpoint_prefix() {
        match InvalidationTarget::parse("monitor:metrics:*") {
            InvalidationTarget::Prefix(prefix) => assert_eq!(prefix, "monitor:metrics:"),
            InvalidationTarget::Key(_) => panic!("expected prefix"),
        }
    }

    #[test]
    fn parses_module_wide_prefix() {
        match InvalidationTarget::parse("monitor:*") {
            InvalidationTarget::Prefix(prefix) => assert_eq!(prefix, "monitor:"),
            InvalidationTarget::Key(_) => panic!("expected prefix"),
        }
    }

    #[test]
    fn parses_full_key() {
        match InvalidationTarget::parse("monitor:metrics:a=1") {
            InvalidationTarget::Key(key) => assert_eq!(key, "monitor:metrics:a=1"),
            InvalidationTarget::Prefix(_) => panic!("expected key"),
        }
    }
}
