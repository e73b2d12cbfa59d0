use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Canonical ledger key of an image.
///
/// Absolute URLs are normalised (scheme and host lowercased, default port and
/// fragment dropped), anything else is kept as trimmed text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(raw: &str) -> Self {
        let raw = raw.trim();
        match Url::parse(raw) {
            Ok(mut url) if url.has_host() => {
                url.set_fragment(None);
                Self(url.into())
            }
            _ => Self(raw.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn domain(&self) -> Option<String> {
        Url::parse(&self.0)
            .ok()
            .and_then(|url| url.host_str().map(str::to_ascii_lowercase))
    }

    /// Last non-empty path segment's extension, lowercased
    pub fn extension(&self) -> Option<String> {
        let url = Url::parse(&self.0).ok()?;
        let segment = url.path_segments()?.filter(|s| !s.is_empty()).last()?;
        let (_, ext) = segment.rsplit_once('.')?;
        if ext.is_empty() || ext.len() > 5 || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
            return None;
        }
        Some(ext.to_ascii_lowercase())
    }

    /// Whether this image comes from `domain` or one of its subdomains
    pub fn is_from(&self, domain: &str) -> bool {
        let domain = domain.trim().trim_start_matches('.').to_ascii_lowercase();
        if domain.is_empty() {
            return false;
        }
        match self.domain() {
            Some(host) => {
                host == domain
                    || host
                        .strip_suffix(domain.as_str())
                        .map_or(false, |rest| rest.ends_with('.'))
            }
            None => false,
        }
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
