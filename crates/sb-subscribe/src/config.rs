//! Pipeline configuration.
//!
//! Everything deserializes with defaults, so an empty JSON object is a valid
//! config. Environment variables are applied on top with
//! [`SubsConfig::with_env_overrides`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::export::ExportTarget;
use crate::model::ProtocolKind;
use crate::util::env::{env_bool, env_parse, env_secs_min1, env_string};

pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_FETCH_SIZE_LIMIT: u64 = 2 * 1024 * 1024;
pub const DEFAULT_USER_AGENT: &str = "ClashMeta/1.0";
pub const DEFAULT_SINGBOX_BIN: &str = "sing-box";
pub const DEFAULT_CACHE_ENTRIES: usize = 64;

pub const ENV_FETCH_TIMEOUT: &str = "SB_SUBS_FETCH_TIMEOUT";
pub const ENV_FETCH_SIZE_LIMIT: &str = "SB_SUBS_FETCH_SIZE_LIMIT";
pub const ENV_USER_AGENT: &str = "SB_SUBS_USER_AGENT";
pub const ENV_EXCLUSIONS: &str = "SB_SUBS_EXCLUSIONS";
pub const ENV_SINGBOX_BIN: &str = "SB_SUBS_SINGBOX_BIN";
pub const ENV_SKIP_VERSION_CHECK: &str = "SB_SUBS_SKIP_VERSION_CHECK";
pub const ENV_CACHE_ENTRIES: &str = "SB_SUBS_CACHE_ENTRIES";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Seconds; applies to connect and the whole body read.
    pub timeout_secs: u64,
    /// Hard cap on payload bytes.
    pub size_limit: u64,
    /// Sent when the source descriptor gives no override.
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            size_limit: DEFAULT_FETCH_SIZE_LIMIT,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FetchConfig {
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.timeout_secs = env_secs_min1(ENV_FETCH_TIMEOUT, self.timeout_secs);
        self.size_limit = env_parse(ENV_FETCH_SIZE_LIMIT, self.size_limit);
        if let Some(ua) = env_string(ENV_USER_AGENT) {
            self.user_agent = ua;
        }
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TagFilterConfig {
    /// Keep only tags matching any of these patterns (empty keeps all).
    pub include: Vec<String>,
    /// Drop tags matching any of these patterns.
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub tag_normalizer: bool,
    pub enrichment: bool,
    pub tag_filter: Option<TagFilterConfig>,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            tag_normalizer: true,
            enrichment: true,
            tag_filter: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRangeConfig {
    pub min: u16,
    pub max: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessConfig {
    pub dedup: bool,
    /// Keep only ports inside this range.
    pub port_range: Option<PortRangeConfig>,
    /// Keep only these protocols (empty keeps all).
    pub protocols: Vec<ProtocolKind>,
    /// Drop tags matching any of these patterns.
    pub exclude_tags: Vec<String>,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            dedup: true,
            port_range: None,
            protocols: Vec::new(),
            exclude_tags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub target: ExportTarget,
    /// Binary probed for its version before choosing outbound syntax.
    pub singbox_bin: String,
    pub skip_version_check: bool,
    /// Add an `auto` urltest group over every exported server.
    pub urltest_group: bool,
    /// Template whose `inbounds`/`route`/`log`/`dns` sections are passed through.
    pub template: Option<serde_json::Value>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            target: ExportTarget::SingBox,
            singbox_bin: DEFAULT_SINGBOX_BIN.to_string(),
            skip_version_check: false,
            urltest_group: false,
            template: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubsConfig {
    pub fetch: FetchConfig,
    pub middleware: MiddlewareConfig,
    pub postprocess: PostprocessConfig,
    pub export: ExportConfig,
    /// `None` disables the persistent exclusion filter.
    pub exclusions_path: Option<PathBuf>,
    /// Results kept per manager; the oldest is evicted past this. 0 disables caching.
    pub cache_entries: usize,
}

impl Default for SubsConfig {
    fn default() -> Self {
        Self {
            fetch: FetchConfig::default(),
            middleware: MiddlewareConfig::default(),
            postprocess: PostprocessConfig::default(),
            export: ExportConfig::default(),
            exclusions_path: None,
            cache_entries: DEFAULT_CACHE_ENTRIES,
        }
    }
}

impl SubsConfig {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    /// Defaults with the environment applied, including the default exclusion path.
    pub fn from_env() -> Self {
        let mut cfg = Self::default().with_env_overrides();
        if cfg.exclusions_path.is_none() {
            cfg.exclusions_path = default_exclusions_path();
        }
        cfg
    }

    pub fn with_env_overrides(mut self) -> Self {
        self.fetch = self.fetch.with_env_overrides();
        if let Some(p) = env_string(ENV_EXCLUSIONS) {
            self.exclusions_path = Some(PathBuf::from(p));
        }
        if let Some(bin) = env_string(ENV_SINGBOX_BIN) {
            self.export.singbox_bin = bin;
        }
        if env_bool(ENV_SKIP_VERSION_CHECK) {
            self.export.skip_version_check = true;
        }
        self.cache_entries = env_parse(ENV_CACHE_ENTRIES, self.cache_entries);
        self
    }
}

/// `$SB_SUBS_EXCLUSIONS`, else `$HOME/.config/sb-subscribe/exclusions.json`.
pub fn default_exclusions_path() -> Option<PathBuf> {
    if let Some(p) = env_string(ENV_EXCLUSIONS) {
        return Some(PathBuf::from(p));
    }
    let home = env_string("HOME").or_else(|| env_string("USERPROFILE"))?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join("sb-subscribe")
            .join("exclusions.json"),
    )
}
