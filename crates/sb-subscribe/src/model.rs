//! Canonical data model shared by every pipeline stage.
//!
//! A subscription is decoded into [`ServerRecord`]s. Protocol specific fields
//! live in the [`Protocol`] tagged union; cross-cutting enrichment data lives
//! in the typed [`Enrichment`] side table that every record carries.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PipelineError;

/// Declared encoding of a subscription body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatHint {
    /// Sniff the payload.
    #[default]
    Auto,
    /// Base64 wrapped URI list (v2rayN style).
    Base64,
    /// Plain URI list, one server per line.
    UriList,
    /// sing-box style JSON with an `outbounds` array.
    Json,
    /// Clash YAML with a `proxies` sequence.
    Clash,
}

impl FormatHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Base64 => "base64",
            Self::UriList => "uri_list",
            Self::Json => "json",
            Self::Clash => "clash",
        }
    }
}

impl fmt::Display for FormatHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FormatHint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "auto" => Ok(Self::Auto),
            "base64" | "b64" => Ok(Self::Base64),
            "uri_list" | "uri-list" | "urilist" | "plain" => Ok(Self::UriList),
            "json" | "singbox" | "sing-box" | "url_json" => Ok(Self::Json),
            "clash" | "yaml" | "clash_yaml" => Ok(Self::Clash),
            other => Err(format!("unknown subscription format `{other}`")),
        }
    }
}

/// Where a subscription lives and how to read it. Built once per invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// URI (`https://`, `file://`, `api+https://`) or a local path.
    pub location: String,
    #[serde(default)]
    pub format: FormatHint,
    /// `None` uses the configured default; `Some("")` sends no User-Agent at all.
    #[serde(default)]
    pub user_agent: Option<String>,
    /// Extra request headers for remote sources.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl SourceDescriptor {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
            format: FormatHint::Auto,
            user_agent: None,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_format(mut self, format: FormatHint) -> Self {
        self.format = format;
        self
    }

    pub fn with_user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Protocol tag of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Shadowsocks,
    Vmess,
    Vless,
    Trojan,
    Tuic,
    Hysteria2,
    Wireguard,
    Http,
    Socks,
    /// Sentinel for entries that failed to decode.
    Invalid,
}

impl ProtocolKind {
    pub const ALL: [ProtocolKind; 10] = [
        Self::Shadowsocks,
        Self::Vmess,
        Self::Vless,
        Self::Trojan,
        Self::Tuic,
        Self::Hysteria2,
        Self::Wireguard,
        Self::Http,
        Self::Socks,
        Self::Invalid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shadowsocks => "shadowsocks",
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Trojan => "trojan",
            Self::Tuic => "tuic",
            Self::Hysteria2 => "hysteria2",
            Self::Wireguard => "wireguard",
            Self::Http => "http",
            Self::Socks => "socks",
            Self::Invalid => "invalid",
        }
    }

    /// Resolve the names used by sing-box, Clash and URI schemes.
    pub fn from_alias(s: &str) -> Option<Self> {
        let k = match s.trim().to_ascii_lowercase().as_str() {
            "ss" | "shadowsocks" => Self::Shadowsocks,
            "vmess" => Self::Vmess,
            "vless" => Self::Vless,
            "trojan" => Self::Trojan,
            "tuic" => Self::Tuic,
            "hysteria2" | "hy2" => Self::Hysteria2,
            "wireguard" | "wg" => Self::Wireguard,
            "http" | "https" => Self::Http,
            "socks" | "socks5" | "socks5h" => Self::Socks,
            _ => return None,
        };
        Some(k)
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A literal option value as it appeared in the source.
///
/// Optional fields keep their literal so that `0`, `false` and `""` survive
/// all the way to export; only an absent field is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Scalar {
    /// Interpret a textual literal (`"0"` → `Int(0)`, `"false"` → `Bool(false)`).
    pub fn from_literal(s: &str) -> Self {
        let t = s.trim();
        match t {
            "true" => return Self::Bool(true),
            "false" => return Self::Bool(false),
            _ => {}
        }
        if let Ok(i) = t.parse::<i64>() {
            return Self::Int(i);
        }
        Self::Str(s.to_string())
    }

    pub fn from_json(v: &serde_json::Value) -> Option<Self> {
        match v {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::String(s) => Some(Self::from_literal(s)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Str(s) => serde_json::Value::String(s.clone()),
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Int(i) => u64::try_from(*i).ok(),
            Self::Str(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int(i) => Some(*i != 0),
            Self::Str(s) => match s.trim() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            },
            Self::Float(_) => None,
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

/// TLS settings shared by the stream protocols.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insecure: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alpn: Vec<String>,
    /// uTLS fingerprint (`chrome`, `firefox`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reality: Option<RealityOptions>,
}

impl TlsOptions {
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RealityOptions {
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_id: Option<String>,
}

/// V2Ray style transport layered under vmess/vless/trojan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Ws {
        path: Option<String>,
        host: Option<String>,
    },
    Grpc {
        service_name: Option<String>,
    },
    Http {
        path: Option<String>,
        host: Vec<String>,
    },
    HttpUpgrade {
        path: Option<String>,
        host: Option<String>,
    },
}

impl Transport {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ws { .. } => "ws",
            Self::Grpc { .. } => "grpc",
            Self::Http { .. } => "http",
            Self::HttpUpgrade { .. } => "httpupgrade",
        }
    }

    /// Build from the `type`/`net` name plus path/host/service fields.
    /// Returns `None` for plain tcp.
    pub fn from_parts(
        kind: &str,
        path: Option<String>,
        host: Option<String>,
        service_name: Option<String>,
    ) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "ws" | "websocket" => Some(Self::Ws { path, host }),
            "grpc" => Some(Self::Grpc { service_name }),
            "h2" | "http" => Some(Self::Http {
                path,
                host: host
                    .map(|h| {
                        h.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            }),
            "httpupgrade" => Some(Self::HttpUpgrade { path, host }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShadowsocksOpts {
    pub method: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_opts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_over_tcp: Option<Scalar>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmessOpts {
    pub uuid: String,
    /// 加密方式 (auto, aes-128-gcm, chacha20-poly1305, none)
    pub security: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alter_id: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VlessOpts {
    pub uuid: String,
    /// 流控模式 (xtls-rprx-vision)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub packet_encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrojanOpts {
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuicOpts {
    pub uuid: String,
    pub password: String,
    /// 拥塞控制算法 (bbr, cubic, new_reno)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub congestion_control: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub udp_relay_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero_rtt_handshake: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Hysteria2Opts {
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obfs_password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_mbps: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down_mbps: Option<Scalar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireguardOpts {
    pub private_key: String,
    pub peer_public_key: String,
    #[serde(default)]
    pub local_address: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_shared_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<Scalar>,
    /// Persistent keepalive interval, kept as the source literal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<Scalar>,
}

/// Shared by `http` and `socks` servers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProxyAuthOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsOptions>,
}

/// Diagnostic payload of an entry that could not be decoded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidEntry {
    /// The offending line or entry, truncated.
    pub raw: String,
    pub reason: String,
}

/// Protocol specific part of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum Protocol {
    Shadowsocks(ShadowsocksOpts),
    Vmess(VmessOpts),
    Vless(VlessOpts),
    Trojan(TrojanOpts),
    Tuic(TuicOpts),
    Hysteria2(Hysteria2Opts),
    Wireguard(WireguardOpts),
    Http(ProxyAuthOpts),
    Socks(ProxyAuthOpts),
    Invalid(InvalidEntry),
}

impl Protocol {
    pub fn kind(&self) -> ProtocolKind {
        match self {
            Self::Shadowsocks(_) => ProtocolKind::Shadowsocks,
            Self::Vmess(_) => ProtocolKind::Vmess,
            Self::Vless(_) => ProtocolKind::Vless,
            Self::Trojan(_) => ProtocolKind::Trojan,
            Self::Tuic(_) => ProtocolKind::Tuic,
            Self::Hysteria2(_) => ProtocolKind::Hysteria2,
            Self::Wireguard(_) => ProtocolKind::Wireguard,
            Self::Http(_) => ProtocolKind::Http,
            Self::Socks(_) => ProtocolKind::Socks,
            Self::Invalid(_) => ProtocolKind::Invalid,
        }
    }

    pub fn tls(&self) -> Option<&TlsOptions> {
        match self {
            Self::Vmess(o) => o.tls.as_ref(),
            Self::Vless(o) => o.tls.as_ref(),
            Self::Trojan(o) => o.tls.as_ref(),
            Self::Tuic(o) => o.tls.as_ref(),
            Self::Hysteria2(o) => o.tls.as_ref(),
            Self::Http(o) | Self::Socks(o) => o.tls.as_ref(),
            _ => None,
        }
    }

    pub fn transport(&self) -> Option<&Transport> {
        match self {
            Self::Vmess(o) => o.transport.as_ref(),
            Self::Vless(o) => o.transport.as_ref(),
            Self::Trojan(o) => o.transport.as_ref(),
            _ => None,
        }
    }

    /// The credential that distinguishes two servers on the same endpoint.
    fn secret(&self) -> &str {
        match self {
            Self::Shadowsocks(o) => &o.password,
            Self::Vmess(o) => &o.uuid,
            Self::Vless(o) => &o.uuid,
            Self::Trojan(o) => &o.password,
            Self::Tuic(o) => &o.uuid,
            Self::Hysteria2(o) => &o.password,
            Self::Wireguard(o) => &o.peer_public_key,
            Self::Http(o) | Self::Socks(o) => o.username.as_deref().unwrap_or(""),
            Self::Invalid(o) => &o.raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencyClass {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionStrength {
    None,
    Weak,
    Standard,
    Strong,
}

/// Derived, non-identity metadata. Never feeds back into identity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_class: Option<LatencyClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_level: Option<SecurityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_strength: Option<EncryptionStrength>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One proxy server after parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub address: String,
    pub port: u16,
    /// Display tag; rewritten by the tag normalizer.
    pub tag: String,
    /// Tag as decoded from the source. Identity is derived from it.
    #[serde(default)]
    pub origin_tag: String,
    #[serde(flatten)]
    pub protocol: Protocol,
    /// Source keys not promoted to typed fields (`name`, `label`, unknown query params).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Enrichment::is_empty")]
    pub enrichment: Enrichment,
    /// Validation problems attached in tolerant mode.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<String>,
}

impl ServerRecord {
    pub fn new(protocol: Protocol, address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
            tag: String::new(),
            origin_tag: String::new(),
            protocol,
            meta: BTreeMap::new(),
            enrichment: Enrichment::default(),
            issues: Vec::new(),
        }
    }

    /// Sentinel for an entry that failed to decode.
    pub fn invalid(raw: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut raw: String = raw.into();
        if raw.chars().count() > 256 {
            raw = raw.chars().take(256).collect();
        }
        Self::new(
            Protocol::Invalid(InvalidEntry {
                raw,
                reason: reason.into(),
            }),
            "",
            0,
        )
    }

    /// Set both the display tag and the origin tag.
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        self.origin_tag = tag.clone();
        self.tag = tag;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn kind(&self) -> ProtocolKind {
        self.protocol.kind()
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.protocol, Protocol::Invalid(_))
    }

    /// Decode diagnostic of a sentinel record.
    pub fn diagnostic(&self) -> Option<&str> {
        match &self.protocol {
            Protocol::Invalid(e) => Some(&e.reason),
            _ => None,
        }
    }

    /// Text that identity is derived from: the origin tag, else the address.
    pub fn identity_text(&self) -> &str {
        if self.origin_tag.trim().is_empty() {
            &self.address
        } else {
            &self.origin_tag
        }
    }

    /// Stable identity used for dedup and exclusion matching.
    pub fn identity(&self) -> String {
        identity_hash(self.identity_text(), self.kind(), self.port)
    }

    /// Short content hash over endpoint and credential; independent of tags.
    pub fn content_id(&self) -> String {
        let mut h = blake3::Hasher::new();
        h.update(self.kind().as_str().as_bytes());
        h.update(b"|");
        h.update(self.address.as_bytes());
        h.update(b"|");
        h.update(self.port.to_string().as_bytes());
        h.update(b"|");
        h.update(self.protocol.secret().as_bytes());
        let hex = h.finalize().to_hex();
        hex.as_str()[..12].to_string()
    }
}

/// sha256 hex over `tag|protocol|port`.
pub fn identity_hash(tag: &str, protocol: ProtocolKind, port: u16) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tag.as_bytes());
    hasher.update(b"|");
    hasher.update(protocol.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(port.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Run-wide policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Abort on the first structural violation.
    Strict,
    /// Repair or annotate, never abort on a per-record issue.
    #[default]
    Tolerant,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Tolerant => "tolerant",
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "tolerant" | "" => Ok(Self::Tolerant),
            other => Err(format!("unknown mode `{other}`")),
        }
    }
}

/// Pipeline stage, used to label errors and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    RawValidation,
    Detect,
    Parse,
    RecordValidation,
    Middleware,
    PostProcess,
    Exclusion,
    Export,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::RawValidation => "raw_validation",
            Self::Detect => "detect",
            Self::Parse => "parse",
            Self::RecordValidation => "record_validation",
            Self::Middleware => "middleware",
            Self::PostProcess => "postprocess",
            Self::Exclusion => "exclusion",
            Self::Export => "export",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagLevel {
    Info,
    Warn,
}

/// Non-fatal note accumulated during a run (repairs, skips, warnings).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagLevel,
    pub stage: Stage,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Per-run settings plus the diagnostics side channel.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    pub mode: Mode,
    pub verbosity: u8,
    /// Bypass both the fetcher payload cache and the manager result cache.
    pub force_reload: bool,
    diagnostics: Vec<Diagnostic>,
}

impl RunContext {
    pub fn new(mode: Mode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    pub fn strict() -> Self {
        Self::new(Mode::Strict)
    }

    pub fn tolerant() -> Self {
        Self::new(Mode::Tolerant)
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_force_reload(mut self, force: bool) -> Self {
        self.force_reload = force;
        self
    }

    pub fn is_tolerant(&self) -> bool {
        self.mode == Mode::Tolerant
    }

    pub fn warn(&mut self, stage: Stage, message: impl Into<String>) {
        self.push(DiagLevel::Warn, stage, None, message.into());
    }

    pub fn warn_for(&mut self, stage: Stage, tag: &str, message: impl Into<String>) {
        self.push(DiagLevel::Warn, stage, Some(tag.to_string()), message.into());
    }

    pub fn info(&mut self, stage: Stage, message: impl Into<String>) {
        self.push(DiagLevel::Info, stage, None, message.into());
    }

    fn push(&mut self, level: DiagLevel, stage: Stage, tag: Option<String>, message: String) {
        self.diagnostics.push(Diagnostic {
            level,
            stage,
            message,
            tag,
        });
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics
            .iter()
            .filter(|d| d.level == DiagLevel::Warn)
    }

    pub fn take_diagnostics(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diagnostics)
    }

    /// Cache-relevant part of the context. Diagnostics and `force_reload` are excluded.
    pub fn signature(&self) -> String {
        format!("mode={};v={}", self.mode.as_str(), self.verbosity)
    }
}

/// What a pipeline invocation hands back to the caller.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineResult {
    pub success: bool,
    pub records: Vec<ServerRecord>,
    /// Serialized target document, set by `export`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<serde_json::Value>,
    pub errors: Vec<PipelineError>,
    pub diagnostics: Vec<Diagnostic>,
}

impl PipelineResult {
    pub fn succeeded(
        records: Vec<ServerRecord>,
        errors: Vec<PipelineError>,
        diagnostics: Vec<Diagnostic>,
    ) -> Self {
        Self {
            success: true,
            records,
            document: None,
            errors,
            diagnostics,
        }
    }

    /// A failed run never carries records.
    pub fn failed(errors: Vec<PipelineError>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            success: false,
            records: Vec::new(),
            document: None,
            errors,
            diagnostics,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
