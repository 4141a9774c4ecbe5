//! Source fetchers.
//!
//! A [`Fetcher`] is picked from the source location when it is constructed;
//! unsupported schemes fail right there. `fetch` is blocking and bounded by
//! the configured timeout and payload limit. The last payload is kept in
//! memory and reused unless `force_reload` is set.

mod file;
#[cfg(feature = "subs_http")]
mod http;

pub use file::FileFetcher;
#[cfg(feature = "subs_http")]
pub use http::HttpFetcher;

use std::io::{self, Read};

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::model::{FormatHint, SourceDescriptor};

/// Which kind of fetcher a location resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetcherKind {
    File,
    Http,
    /// `api+http(s)://` endpoints returning JSON.
    Api,
}

impl FetcherKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Http => "http",
            Self::Api => "api",
        }
    }

    /// Resolve a location to a fetcher kind and the location to actually read.
    pub fn resolve(location: &str) -> Result<(Self, String), FetchError> {
        let Some((scheme, rest)) = location.split_once("://") else {
            return Ok((Self::File, location.to_string()));
        };
        match scheme.to_ascii_lowercase().as_str() {
            "file" => Ok((Self::File, rest.to_string())),
            "http" | "https" => Ok((Self::Http, location.to_string())),
            "api+http" | "api+https" => {
                let inner = &location["api+".len()..];
                Ok((Self::Api, inner.to_string()))
            }
            other => Err(FetchError::UnsupportedScheme {
                scheme: other.to_string(),
                location: location.to_string(),
            }),
        }
    }
}

/// Compile-time registry of fetchers.
#[derive(Debug)]
pub enum Fetcher {
    File(FileFetcher),
    #[cfg(feature = "subs_http")]
    Http(HttpFetcher),
}

impl Fetcher {
    /// Pick a fetcher for `source`. Unsupported schemes are rejected here.
    pub fn for_source(source: &SourceDescriptor, cfg: &FetchConfig) -> Result<Self, FetchError> {
        let (kind, target) = FetcherKind::resolve(&source.location)?;
        match kind {
            FetcherKind::File => Ok(Self::File(FileFetcher::new(target, cfg.size_limit))),
            #[cfg(feature = "subs_http")]
            FetcherKind::Http | FetcherKind::Api => Ok(Self::Http(HttpFetcher::new(
                source,
                target,
                kind == FetcherKind::Api,
                cfg,
            )?)),
            #[cfg(not(feature = "subs_http"))]
            FetcherKind::Http | FetcherKind::Api => Err(FetchError::UnsupportedScheme {
                scheme: kind.as_str().to_string(),
                location: source.location.clone(),
            }),
        }
    }

    pub fn kind(&self) -> FetcherKind {
        match self {
            Self::File(_) => FetcherKind::File,
            #[cfg(feature = "subs_http")]
            Self::Http(h) => h.kind(),
        }
    }

    /// Format to assume when the source declares `auto`.
    pub fn default_format(&self) -> FormatHint {
        match self.kind() {
            FetcherKind::Api => FormatHint::Json,
            _ => FormatHint::Auto,
        }
    }

    pub fn fetch(&self, force_reload: bool) -> Result<Vec<u8>, FetchError> {
        match self {
            Self::File(f) => f.fetch(force_reload),
            #[cfg(feature = "subs_http")]
            Self::Http(h) => h.fetch(force_reload),
        }
    }
}

/// Read at most `limit` bytes. Returns `None` as soon as the reader yields more,
/// without buffering the rest.
pub(crate) fn read_limited<R: Read>(reader: R, limit: u64) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let mut limited = reader.take(limit.saturating_add(1));
    limited.read_to_end(&mut buf)?;
    if buf.len() as u64 > limit {
        return Ok(None);
    }
    Ok(Some(buf))
}
