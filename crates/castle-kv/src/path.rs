//! Key path helpers
//!
//! Keys are forward-slash separated absolute paths. Helpers here never
//! touch the store.

/// Normalize a key: leading slash, no trailing slash, no empty segments
#[must_use]
pub fn normalize(key: &str) -> String {
    let parts: Vec<&str> = key.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return "/".to_string();
    }
    let mut out = String::with_capacity(key.len() + 1);
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// Join a base key with a relative path
#[must_use]
pub fn join(base: &str, rel: &str) -> String {
    normalize(&format!("{base}/{rel}"))
}

/// Last path segment of a key (`/a/b/c` -> `c`)
#[must_use]
pub fn leaf(key: &str) -> &str {
    let trimmed = key.trim_end_matches('/');
    trimmed.rsplit('/').next().unwrap_or(trimmed)
}

/// Parent of a key (`/a/b/c` -> `/a/b`, `/a` -> `/`)
#[must_use]
pub fn parent(key: &str) -> String {
    let key = normalize(key);
    match key.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(idx) => key[..idx].to_string(),
    }
}

/// Prefix that all descendants of `key` start with
#[must_use]
pub fn descendant_prefix(key: &str) -> String {
    if key == "/" {
        "/".to_string()
    } else {
        format!("{key}/")
    }
}

/// True if `key` is `base` or lies beneath it
#[must_use]
pub fn is_within(key: &str, base: &str) -> bool {
    key == base || key.starts_with(&descendant_prefix(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("castle//services/"), "/castle/services");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), "/");
    }

    #[test]
    fn test_leaf_and_parent() {
        assert_eq!(leaf("/castle/services/ceph/osd"), "osd");
        assert_eq!(leaf("/castle/a/"), "a");
        assert_eq!(parent("/castle/services/ceph"), "/castle/services");
        assert_eq!(parent("/castle"), "/");
        assert_eq!(join("/castle/nodes", "a/heartbeat"), "/castle/nodes/a/heartbeat");
    }

    #[test]
    fn test_is_within() {
        assert!(is_within("/a/b", "/a"));
        assert!(is_within("/a", "/a"));
        assert!(!is_within("/ab", "/a"));
        assert!(is_within("/x", "/"));
    }
}
