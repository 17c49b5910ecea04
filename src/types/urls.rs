//! Validated peer and client URL lists.

use rand::Rng;
use std::fmt;
use thiserror::Error;
use url::Url;

/// Validation failures for URL lists.
#[derive(Debug, Error)]
pub enum UrlsError {
    #[error("no URLs given")]
    NoUrls,

    #[error("empty URL given")]
    EmptyUrl,

    #[error("URL {url:?} is malformed: {source}")]
    Malformed {
        url: String,
        source: url::ParseError,
    },

    #[error("URL scheme must be http or https: {url:?}")]
    BadScheme { url: String },

    #[error("URL {url:?} is missing a host")]
    MissingHost { url: String },

    #[error("URL address {url:?} does not have the form host:port")]
    MissingPort { url: String },

    #[error("URL {url:?} must not contain a path")]
    PathNotAllowed { url: String },
}

/// An ordered list of validated `http`/`https` URLs.
///
/// Order is preserved for display and wire output; identifier derivation
/// sorts the host list internally, so only the set matters there.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Urls(Vec<Url>);

impl Urls {
    /// An empty list, allowed only for client URLs.
    pub fn empty() -> Urls {
        Urls(Vec::new())
    }

    /// Parses and validates a non-empty list of URL strings.
    ///
    /// Each URL must be `http` or `https`, carry an explicit `host:port`
    /// address and no path.
    pub fn parse<I, S>(urls: I) -> Result<Urls, UrlsError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = Vec::new();
        for raw in urls {
            let raw = raw.as_ref();
            if raw.is_empty() {
                return Err(UrlsError::EmptyUrl);
            }
            let u = Url::parse(raw).map_err(|source| UrlsError::Malformed {
                url: raw.to_string(),
                source,
            })?;
            if u.scheme() != "http" && u.scheme() != "https" {
                return Err(UrlsError::BadScheme {
                    url: raw.to_string(),
                });
            }
            if u.host_str().is_none() {
                return Err(UrlsError::MissingHost {
                    url: raw.to_string(),
                });
            }
            if u.port().is_none() {
                return Err(UrlsError::MissingPort {
                    url: raw.to_string(),
                });
            }
            if u.path() != "/" && !u.path().is_empty() {
                return Err(UrlsError::PathNotAllowed {
                    url: raw.to_string(),
                });
            }
            out.push(u);
        }
        if out.is_empty() {
            return Err(UrlsError::NoUrls);
        }
        Ok(Urls(out))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[Url] {
        &self.0
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Url> {
        self.0.iter()
    }

    /// `host:port` addresses in list order.
    pub fn hosts(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|u| {
                // Validation guarantees host and explicit port are present.
                let host = u.host_str().unwrap_or_default();
                match u.port() {
                    Some(p) => format!("{}:{}", host, p),
                    None => host.to_string(),
                }
            })
            .collect()
    }

    /// The user-visible string form of each URL, in list order.
    pub fn string_slice(&self) -> Vec<String> {
        self.0.iter().map(url_to_string).collect()
    }

    /// A uniformly random element; panics on an empty list.
    pub fn pick_random(&self) -> &Url {
        let i = rand::thread_rng().gen_range(0..self.0.len());
        &self.0[i]
    }
}

impl fmt::Display for Urls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.string_slice().join(","))
    }
}

impl<'a> IntoIterator for &'a Urls {
    type Item = &'a Url;
    type IntoIter = std::slice::Iter<'a, Url>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Renders a URL the way the operator wrote it: `Url` normalizes a bare
/// authority to end in `/`, which must not leak into wire or store output.
pub(crate) fn url_to_string(u: &Url) -> String {
    let s = u.as_str();
    if u.path() == "/" && u.query().is_none() && u.fragment().is_none() {
        if let Some(trimmed) = s.strip_suffix('/') {
            return trimmed.to_string();
        }
    }
    s.to_string()
}
