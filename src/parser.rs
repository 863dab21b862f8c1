//! Routing-key parser
//!
//! Turns a request path such as `/0123456789abcdef/images/pic.png~resize:200/crop`
//! into a [`Source`]: the content identifier, the normalized path inside the
//! content, and an optional [`Mod`] taken from the last `~` segment.

use crate::error::GatewayError;
use crate::resolver::ModRegistry;
use crate::source::{Mod, Source, DEFAULT_SOURCE_TYPE};
use std::sync::Arc;

/// Minimum length of the hex run an identifier must contain
const MIN_HASH_RUN: usize = 5;

/// Query parameter carrying the access token
const TOKEN_PARAM: &str = "token";

/// Parses request paths into sources
#[derive(Clone)]
pub struct RouteParser {
    mods: Arc<dyn ModRegistry>,
}

impl RouteParser {
    pub fn new(mods: Arc<dyn ModRegistry>) -> Self {
        Self { mods }
    }

    /// Parse an already percent-decoded path and the raw query string
    pub fn parse(&self, path: &str, query: Option<&str>) -> Result<Source, GatewayError> {
        let trimmed = path.strip_prefix('/').unwrap_or(path);
        if trimmed.is_empty() {
            return Err(GatewayError::InvalidRequest("empty url".to_string()));
        }

        let (identifier, rest) = match trimmed.split_once('/') {
            Some((identifier, rest)) => (identifier, Some(rest)),
            None => (trimmed, None),
        };
        if identifier.is_empty() {
            return Err(GatewayError::InvalidRequest("empty hash".to_string()));
        }

        let kind = if self.mods.is_mod(identifier) {
            identifier.to_string()
        } else if contains_hex_run(identifier) {
            DEFAULT_SOURCE_TYPE.to_string()
        } else {
            return Err(GatewayError::InvalidHash(identifier.to_string()));
        };

        let path = clean_path(&format!("/{}", rest.unwrap_or("")));
        let (path, modifier) = self.extract_mod(&path);

        Ok(Source {
            kind,
            info_hash: identifier.to_string(),
            path,
            token: query
                .and_then(|q| query_param(q, TOKEN_PARAM))
                .unwrap_or_default(),
            modifier,
        })
    }

    /// Split off the last `~mod[:extra][/path]` suffix.
    ///
    /// An unrecognized mod name yields no mod but still truncates the path.
    fn extract_mod(&self, path: &str) -> (String, Option<Mod>) {
        let Some(index) = path.rfind('~') else {
            return (path.to_string(), None);
        };

        let prefix = match &path[..index] {
            "" => "/".to_string(),
            p => p.to_string(),
        };
        let suffix = &path[index + 1..];

        let (spec, mod_path) = match suffix.split_once('/') {
            Some((spec, mod_path)) => (spec, Some(mod_path)),
            None => (suffix, None),
        };
        let (kind, extra) = spec.split_once(':').unwrap_or((spec, ""));

        if !self.mods.is_mod(kind) {
            return (prefix, None);
        }

        let modifier = Mod {
            kind: kind.to_string(),
            path: clean_path(&format!("/{}", mod_path.unwrap_or(""))),
            extra: extra.to_string(),
        };
        (prefix, Some(modifier))
    }
}

/// True if the identifier contains a run of at least five lowercase hex
/// characters anywhere in it. This is a substring check, not a full match.
fn contains_hex_run(identifier: &str) -> bool {
    let mut run = 0;
    for c in identifier.chars() {
        if c.is_ascii_digit() || ('a'..='f').contains(&c) {
            run += 1;
            if run >= MIN_HASH_RUN {
                return true;
            }
        } else {
            run = 0;
        }
    }
    false
}

/// Lexically normalize a rooted path: collapse slashes, resolve `.` and `..`
pub fn clean_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

/// First value of a query parameter, form-decoded. Invalid UTF-8 escapes
/// decode lossily instead of hiding the pair.
pub fn query_param(query: &str, name: &str) -> Option<String> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}
