//! Content source descriptors and the keys derived from them

use std::fmt;

/// Source type used when the identifier is a content hash
pub const DEFAULT_SOURCE_TYPE: &str = "default";

/// Requested transformation of a content path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mod {
    /// One of the configured mod names
    pub kind: String,
    /// Normalized sub-path the modification applies to
    pub path: String,
    /// Free-form parameters given after `:` in the mod specifier
    pub extra: String,
}

/// A requested content item plus its forwarding mode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// `"default"` or the configured mod name used as a direct route
    pub kind: String,
    /// Content identifier taken from the first path segment
    pub info_hash: String,
    /// Normalized path within the content, always starts with `/`
    pub path: String,
    /// Opaque access token from the query string, not validated here
    pub token: String,
    pub modifier: Option<Mod>,
}

impl Source {
    /// Cache key for this source. Depends on everything but the token.
    pub fn key(&self) -> SourceKey {
        SourceKey {
            info_hash: self.info_hash.clone(),
            kind: self.kind.clone(),
            modifier: self.modifier.as_ref().map(|m| ModKey {
                path: self.path.clone(),
                kind: m.kind.clone(),
                extra: m.extra.clone(),
            }),
        }
    }
}

/// Structured cache key for a [`Source`].
///
/// Fields are compared individually, so `("ab", "cdefault")` and
/// `("abc", "default")` never collide the way a concatenated string would.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    info_hash: String,
    kind: String,
    modifier: Option<ModKey>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ModKey {
    path: String,
    kind: String,
    extra: String,
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.info_hash, self.kind)?;
        if let Some(m) = &self.modifier {
            write!(f, "|{}|{}|{}", m.path, m.kind, m.extra)?;
        }
        Ok(())
    }
}

/// Key of a proxy pool entry: the source key plus the caller's invoke flag
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub source: SourceKey,
    pub invoke: bool,
}

impl PoolKey {
    pub fn new(source: &Source, invoke: bool) -> Self {
        Self {
            source: source.key(),
            invoke,
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.source, self.invoke)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(info_hash: &str, path: &str, modifier: Option<Mod>) -> Source {
        Source {
            kind: DEFAULT_SOURCE_TYPE.to_string(),
            info_hash: info_hash.to_string(),
            path: path.to_string(),
            token: String::new(),
            modifier,
        }
    }

    fn resize(extra: &str) -> Mod {
        Mod {
            kind: "resize".to_string(),
            path: "/".to_string(),
            extra: extra.to_string(),
        }
    }

    #[test]
    fn test_key_ignores_token() {
        let mut a = source("abc12", "/a.mp4", None);
        let mut b = a.clone();
        a.token = "t1".to_string();
        b.token = "t2".to_string();
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_ignores_path_without_mod() {
        let a = source("abc12", "/a.mp4", None);
        let b = source("abc12", "/b.mp4", None);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn test_key_includes_path_and_mod_fields() {
        let a = source("abc12", "/a.png", Some(resize("200")));
        let b = source("abc12", "/b.png", Some(resize("200")));
        let c = source("abc12", "/a.png", Some(resize("300")));
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
        assert_eq!(a.key(), source("abc12", "/a.png", Some(resize("200"))).key());
    }

    #[test]
    fn test_key_has_no_boundary_collisions() {
        let mut a = source("ab", "/", None);
        a.kind = "cdefault".to_string();
        let b = source("abc", "/", None);
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn test_key_display() {
        let s = source("abc12", "/pic.png", Some(resize("200")));
        assert_eq!(s.key().to_string(), "abc12|default|/pic.png|resize|200");
        assert_eq!(PoolKey::new(&s, true).to_string(), "abc12|default|/pic.png|resize|200|true");
    }

    #[test]
    fn test_pool_key_distinguishes_invoke() {
        let s = source("abc12", "/", None);
        assert_ne!(PoolKey::new(&s, true), PoolKey::new(&s, false));
    }
}
