use parking_lot::Mutex;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, USER_AGENT};
use std::io;
use std::time::Duration;
use tracing::{debug, warn};

use super::{read_limited, FetcherKind};
use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::model::SourceDescriptor;

/// Blocking HTTP(S) fetcher. Also serves `api+http(s)` endpoints, which only
/// differ by asking for JSON.
#[derive(Debug)]
pub struct HttpFetcher {
    url: String,
    api: bool,
    user_agent: Option<String>,
    headers: Vec<(String, String)>,
    timeout: Duration,
    size_limit: u64,
    client: Client,
    cache: Mutex<Option<Vec<u8>>>,
}

impl HttpFetcher {
    pub fn new(
        source: &SourceDescriptor,
        url: String,
        api: bool,
        cfg: &FetchConfig,
    ) -> Result<Self, FetchError> {
        // an explicit empty override disables the header entirely
        let user_agent = match source.user_agent.as_deref() {
            Some("") => None,
            Some(ua) => Some(ua.to_string()),
            None if cfg.user_agent.is_empty() => None,
            None => Some(cfg.user_agent.clone()),
        };
        let timeout = cfg.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self {
            url,
            api,
            user_agent,
            headers: source
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout,
            size_limit: cfg.size_limit,
            client,
            cache: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> FetcherKind {
        if self.api {
            FetcherKind::Api
        } else {
            FetcherKind::Http
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn fetch(&self, force_reload: bool) -> Result<Vec<u8>, FetchError> {
        if !force_reload {
            if let Some(cached) = self.cache.lock().as_ref() {
                debug!(url = %self.url, "http fetch served from cache");
                return Ok(cached.clone());
            }
        }

        let mut req = self.client.get(&self.url);
        if let Some(ua) = &self.user_agent {
            req = req.header(USER_AGENT, ua.as_str());
        }
        if self.api {
            req = req.header(ACCEPT, "application/json");
        }
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }

        let resp = req.send().map_err(|e| self.request_error(e))?;
        let status = resp.status();
        if !status.is_success() {
            warn!(url = %self.url, status = status.as_u16(), "subscription fetch rejected");
            return Err(FetchError::Http {
                location: self.url.clone(),
                status: status.as_u16(),
            });
        }
        if let Some(len) = resp.content_length() {
            if len > self.size_limit {
                warn!(url = %self.url, content_length = len, limit = self.size_limit, "declared body exceeds limit");
                return Err(self.too_large());
            }
        }

        let data = read_limited(resp, self.size_limit)
            .map_err(|e| self.body_error(e))?
            .ok_or_else(|| self.too_large())?;
        debug!(url = %self.url, bytes = data.len(), "subscription fetched");
        *self.cache.lock() = Some(data.clone());
        Ok(data)
    }

    fn too_large(&self) -> FetchError {
        FetchError::TooLarge {
            location: self.url.clone(),
            limit: self.size_limit,
        }
    }

    fn request_error(&self, e: reqwest::Error) -> FetchError {
        if e.is_timeout() {
            FetchError::Timeout {
                location: self.url.clone(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Connect {
                location: self.url.clone(),
                message: e.to_string(),
            }
        }
    }

    fn body_error(&self, e: io::Error) -> FetchError {
        if e.kind() == io::ErrorKind::TimedOut {
            FetchError::Timeout {
                location: self.url.clone(),
                timeout: self.timeout,
            }
        } else {
            FetchError::Io {
                location: self.url.clone(),
                source: e,
            }
        }
    }
}
