//! Resource identifiers
//!
//! A `ResId` is an absolute path split into decoded segments plus a set of
//! string-valued query parameters. The first segment names the resource;
//! the remaining segments are typed arguments decoded against the
//! resource's declared segment types.

use std::collections::BTreeMap;
use std::fmt;

use url::Url;

use crate::types::{Error, ErrorKind, Result};
use crate::util::is_privileged_name;

/// String-valued query parameters, kept sorted so formatting is
/// deterministic.
pub type Params = BTreeMap<String, String>;

/// Parsed resource identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResId {
    path: Vec<String>,
    pub params: Params,
}

impl ResId {
    /// Build an identifier from a resource name and pre-rendered path
    /// segments.
    pub fn new(name: &str, segments: Vec<String>) -> Self {
        let mut path = Vec::with_capacity(segments.len() + 1);
        path.push(name.to_string());
        path.extend(segments);
        ResId { path, params: Params::new() }
    }

    /// Parse an identifier from a path-and-query string. Fails with
    /// BadRequest unless the path is absolute.
    pub fn parse(s: &str) -> Result<ResId> {
        // Split query off before decoding; '?' never appears encoded in
        // the path part.
        let (path_part, query_part) = match s.find('?') {
            Some(i) => (&s[..i], Some(&s[i + 1..])),
            None => (s, None),
        };
        let path_part = match path_part.find("://") {
            // Full URL: strip scheme and host.
            Some(i) => {
                let rest = &path_part[i + 3..];
                match rest.find('/') {
                    Some(j) => &rest[j..],
                    None => "/",
                }
            }
            None => path_part,
        };
        if !path_part.starts_with('/') {
            return Err(Error::bad_request(format!("must absolute url. {}", s)));
        }
        let mut path = Vec::new();
        for seg in path_part[1..].split('/') {
            let decoded = urlencoding::decode(seg)
                .map_err(|e| Error::with_cause(ErrorKind::BadRequest, "parse url error", e))?;
            path.push(decoded.into_owned());
        }
        let mut params = Params::new();
        if let Some(q) = query_part {
            for pair in q.split('&') {
                if pair.is_empty() {
                    continue;
                }
                let (k, v) = match pair.find('=') {
                    Some(i) => (&pair[..i], &pair[i + 1..]),
                    None => (pair, ""),
                };
                let k = urlencoding::decode(k)
                    .map_err(|e| Error::with_cause(ErrorKind::BadRequest, "parse url error", e))?;
                let v = urlencoding::decode(v)
                    .map_err(|e| Error::with_cause(ErrorKind::BadRequest, "parse url error", e))?;
                // First value wins for repeated keys.
                params.entry(k.into_owned()).or_insert_with(|| v.into_owned());
            }
        }
        Ok(ResId { path, params })
    }

    /// Resource name (first path segment).
    pub fn name(&self) -> &str {
        &self.path[0]
    }

    /// Raw path segments after the resource name.
    pub fn segments(&self) -> &[String] {
        &self.path[1..]
    }

    pub fn num_segments(&self) -> usize {
        self.path.len() - 1
    }

    /// Raw segment at `index` (0-based, after the resource name).
    pub fn raw_segment(&self, index: usize) -> Option<&str> {
        self.path.get(index + 1).map(|s| s.as_str())
    }

    /// Whether the identifier names a privileged resource.
    pub fn is_privileged(&self) -> bool {
        is_privileged_name(&self.path[0])
    }

    /// Format as an absolute path with sorted, percent-encoded query
    /// parameters.
    pub fn format(&self) -> String {
        let mut out = String::new();
        for seg in &self.path {
            out.push('/');
            out.push_str(&urlencoding::encode(seg));
        }
        if !self.params.is_empty() {
            out.push('?');
            let pairs: Vec<String> = self
                .params
                .iter()
                .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
                .collect();
            out.push_str(&pairs.join("&"));
        }
        out
    }

    /// Absolute URL adopting the base's scheme and host.
    pub fn url_with_base(&self, base: &Url) -> Url {
        let mut u = base.clone();
        u.set_path("");
        u.set_query(None);
        u.set_fragment(None);
        u.join(&self.format()).unwrap_or(u)
    }
}

impl fmt::Display for ResId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}
