//! Route pattern matching.
//!
//! Patterns are path globs: `:param` and `*` each match exactly one segment,
//! and a final `*` segment matches the rest of the path (one or more
//! segments). When several enabled routes match, the first-registered one
//! wins; overlapping patterns are a configuration error the gateway does not
//! try to detect.

/// Returns true when `path` matches the glob `pattern`.
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let pattern_segs: Vec<&str> = segments(pattern);
    let path_segs: Vec<&str> = segments(path);

    let mut i = 0;
    for (idx, seg) in pattern_segs.iter().enumerate() {
        let is_last = idx == pattern_segs.len() - 1;

        if *seg == "*" && is_last {
            // Trailing wildcard swallows the remainder, at least one segment.
            return i < path_segs.len();
        }

        let Some(actual) = path_segs.get(i) else {
            return false;
        };

        if *seg == "*" || seg.starts_with(':') {
            i += 1;
            continue;
        }

        if seg != actual {
            return false;
        }
        i += 1;
    }

    i == path_segs.len()
}

fn segments(path: &str) -> Vec<&str> {
    path.trim_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_match_exactly() {
        assert!(pattern_matches("/orders", "/orders"));
        assert!(pattern_matches("/orders", "/orders/"));
        assert!(!pattern_matches("/orders", "/orders/42"));
        assert!(!pattern_matches("/orders", "/invoices"));
    }

    #[test]
    fn param_placeholder_matches_one_segment() {
        assert!(pattern_matches("/orders/:id", "/orders/42"));
        assert!(pattern_matches("/orders/:id/items", "/orders/42/items"));
        assert!(!pattern_matches("/orders/:id", "/orders"));
        assert!(!pattern_matches("/orders/:id", "/orders/42/items"));
    }

    #[test]
    fn mid_pattern_star_matches_one_segment() {
        assert!(pattern_matches("/v1/*/status", "/v1/orders/status"));
        assert!(!pattern_matches("/v1/*/status", "/v1/orders/42/status"));
    }

    #[test]
    fn trailing_star_matches_remainder() {
        assert!(pattern_matches("/v1/*", "/v1/orders"));
        assert!(pattern_matches("/v1/*", "/v1/orders/42/items"));
        assert!(!pattern_matches("/v1/*", "/v1"));
        assert!(!pattern_matches("/v1/*", "/v2/orders"));
    }

    #[test]
    fn root_star_matches_everything_nonempty() {
        assert!(pattern_matches("/*", "/anything"));
        assert!(pattern_matches("/*", "/a/b/c"));
        assert!(!pattern_matches("/*", "/"));
    }
}
