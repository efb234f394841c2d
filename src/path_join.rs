//! URL path joining.
//!
//! Combines the backend base path with a request path so that exactly one
//! slash separates the two fragments. When either side carries a distinct
//! percent-escaped form, the slash decision is made on the escaped forms and
//! both representations are recomputed together so they never drift apart.

/// A URL path in its plain form, optionally paired with a distinct
/// percent-escaped form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlPath {
    pub plain: String,
    pub escaped: Option<String>,
}

impl UrlPath {
    pub fn plain(path: impl Into<String>) -> Self {
        Self {
            plain: path.into(),
            escaped: None,
        }
    }

    pub fn with_escaped(plain: impl Into<String>, escaped: impl Into<String>) -> Self {
        Self {
            plain: plain.into(),
            escaped: Some(escaped.into()),
        }
    }

    /// The escaped form, falling back to the plain form when the two are
    /// identical.
    pub fn escaped_or_plain(&self) -> &str {
        self.escaped.as_deref().unwrap_or(&self.plain)
    }
}

/// Join two path fragments with exactly one separating slash.
///
/// Both fragments empty yields the empty string.
pub fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{}{}", a, &b[1..]),
        (false, false) => {
            if a.is_empty() && b.is_empty() {
                String::new()
            } else {
                format!("{}/{}", a, b)
            }
        }
        _ => format!("{}{}", a, b),
    }
}

/// Join a base path with a request path, escaping-aware.
///
/// When neither side has a distinct escaped form the result is a plain join.
/// Otherwise the escaped forms decide where the slash goes and both the plain
/// and escaped outputs are produced from the same decision.
pub fn join(base: &UrlPath, request: &UrlPath) -> UrlPath {
    if base.escaped.is_none() && request.escaped.is_none() {
        return UrlPath::plain(single_joining_slash(&base.plain, &request.plain));
    }

    let a = base.escaped_or_plain();
    let b = request.escaped_or_plain();
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');

    let (plain, escaped) = match (a_slash, b_slash) {
        (true, true) => (
            format!("{}{}", base.plain, &request.plain[1..]),
            format!("{}{}", a, &b[1..]),
        ),
        (false, false) => (
            format!("{}/{}", base.plain, request.plain),
            format!("{}/{}", a, b),
        ),
        _ => (
            format!("{}{}", base.plain, request.plain),
            format!("{}{}", a, b),
        ),
    };

    UrlPath::with_escaped(plain, escaped)
}

/// Concatenate two query strings with `&` when both are non-empty.
pub fn merge_queries(base: Option<&str>, request: Option<&str>) -> Option<String> {
    match (base.filter(|q| !q.is_empty()), request.filter(|q| !q.is_empty())) {
        (Some(a), Some(b)) => Some(format!("{}&{}", a, b)),
        (Some(a), None) => Some(a.to_string()),
        (None, Some(b)) => Some(b.to_string()),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[test]
    fn test_single_joining_slash() {
        assert_eq!(single_joining_slash("/a/", "/b"), "/a/b");
        assert_eq!(single_joining_slash("/a", "b"), "/a/b");
        assert_eq!(single_joining_slash("/a/", "b"), "/a/b");
        assert_eq!(single_joining_slash("/a", "/b"), "/a/b");
        assert_eq!(single_joining_slash("", ""), "");
    }

    #[test]
    fn test_join_plain() {
        let joined = join(&UrlPath::plain("/container"), &UrlPath::plain("/app/x.js"));
        assert_eq!(joined.plain, "/container/app/x.js");
        assert!(joined.escaped.is_none());
    }

    #[test]
    fn test_join_escaped_side_drives_slash_decision() {
        let base = UrlPath::with_escaped("/my container", "/my%20container");
        let joined = join(&base, &UrlPath::plain("file.txt"));
        assert_eq!(joined.plain, "/my container/file.txt");
        assert_eq!(joined.escaped.as_deref(), Some("/my%20container/file.txt"));
    }

    #[test]
    fn test_join_escaped_both_slashed() {
        let base = UrlPath::with_escaped("/a b/", "/a%20b/");
        let req = UrlPath::with_escaped("/c d", "/c%20d");
        let joined = join(&base, &req);
        assert_eq!(joined.plain, "/a b/c d");
        assert_eq!(joined.escaped.as_deref(), Some("/a%20b/c%20d"));
    }

    #[test]
    fn test_merge_queries() {
        assert_eq!(
            merge_queries(Some("restype=container"), Some("v=1")).as_deref(),
            Some("restype=container&v=1")
        );
        assert_eq!(merge_queries(Some("a=1"), None).as_deref(), Some("a=1"));
        assert_eq!(merge_queries(None, Some("b=2")).as_deref(), Some("b=2"));
        assert_eq!(merge_queries(None, None), None);
        assert_eq!(merge_queries(Some(""), Some("")), None);
    }

    /// Non-empty fragments always end up separated by exactly one slash.
    #[quickcheck]
    fn prop_exactly_one_separating_slash(a: String, b: String) -> bool {
        if a.is_empty() || b.is_empty() {
            return true;
        }
        let a = a.replace('/', "");
        let b = b.replace('/', "");
        if a.is_empty() || b.is_empty() {
            return true;
        }
        for (base, req) in [
            (a.clone(), b.clone()),
            (format!("{}/", a), b.clone()),
            (a.clone(), format!("/{}", b)),
            (format!("{}/", a), format!("/{}", b)),
        ] {
            if single_joining_slash(&base, &req) != format!("{}/{}", a, b) {
                return false;
            }
        }
        true
    }
}
