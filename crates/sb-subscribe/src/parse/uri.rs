//! Share-link grammars (`ss://`, `vmess://`, `vless://`, ...).
//!
//! [`parse_uri`] is strict and returns an [`EntryError`]; [`parse_line`]
//! never fails and turns the error into an `invalid` sentinel.

use std::collections::BTreeMap;

use super::{b64, fields, EntryError};
use crate::model::{
    Hysteria2Opts, Protocol, ProxyAuthOpts, RealityOptions, Scalar, ServerRecord,
    ShadowsocksOpts, TlsOptions, Transport, TrojanOpts, TuicOpts, VlessOpts, VmessOpts,
    WireguardOpts,
};

pub const KNOWN_SCHEMES: &[&str] = &[
    "ss", "vmess", "vless", "trojan", "tuic", "hysteria2", "hy2", "wireguard", "wg", "http",
    "https", "socks", "socks5", "socks5h",
];

/// `true` if the line starts with a supported `scheme://`.
pub fn has_known_scheme(line: &str) -> bool {
    line.split_once("://")
        .is_some_and(|(s, _)| KNOWN_SCHEMES.contains(&s.to_ascii_lowercase().as_str()))
}

/// Decode one line; failures become a sentinel carrying the reason.
pub fn parse_line(line: &str) -> ServerRecord {
    parse_uri(line).unwrap_or_else(|e| ServerRecord::invalid(line, e.to_string()))
}

pub fn parse_uri(line: &str) -> Result<ServerRecord, EntryError> {
    let line = line.trim();
    let (scheme, body) = line.split_once("://").ok_or(EntryError::NotUri)?;
    if scheme.is_empty() || !scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+') {
        return Err(EntryError::NotUri);
    }
    match scheme.to_ascii_lowercase().as_str() {
        "ss" => parse_ss(body),
        "vmess" => parse_vmess(body),
        "vless" => parse_vless(body),
        "trojan" => parse_trojan(body),
        "tuic" => parse_tuic(body),
        "hysteria2" | "hy2" => parse_hysteria2(body),
        "wireguard" | "wg" => parse_wireguard(body),
        "http" => parse_proxy(body, false, false),
        "https" => parse_proxy(body, false, true),
        "socks" | "socks5" | "socks5h" => parse_proxy(body, true, false),
        other => Err(EntryError::UnsupportedScheme(other.to_string())),
    }
}

/// Pieces of `userinfo@host:port/?query#fragment`.
struct Link {
    userinfo: Option<String>,
    host: String,
    port: u16,
    query: Query,
    tag: Option<String>,
}

impl Link {
    fn split(body: &str) -> Result<Self, EntryError> {
        let (main, frag) = split_fragment(body);
        let tag = frag.map(|f| pct(f, "fragment")).transpose()?;
        let (main, query) = main.split_once('?').unwrap_or((main, ""));
        let query = Query::parse(query)?;
        let (userinfo, hostport) = match main.rsplit_once('@') {
            Some((u, h)) => (Some(pct(u, "userinfo")?), h),
            None => (None, main),
        };
        let (host, port) = split_host_port(hostport)?;
        Ok(Self {
            userinfo,
            host,
            port,
            query,
            tag,
        })
    }

    /// Assemble the record; leftover query keys land in `meta`.
    fn finish(self, protocol: Protocol) -> ServerRecord {
        let mut rec = ServerRecord::new(protocol, self.host, self.port);
        if let Some(tag) = self.tag.filter(|t| !t.trim().is_empty()) {
            rec = rec.with_tag(tag);
        }
        rec.meta = self.query.into_rest();
        rec
    }
}

/// Query parameters consumed as they are promoted to typed fields.
#[derive(Default)]
struct Query(BTreeMap<String, String>);

impl Query {
    fn parse(q: &str) -> Result<Self, EntryError> {
        let mut map = BTreeMap::new();
        for pair in q.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            map.insert(pct(k, "query key")?, pct(v, "query value")?);
        }
        Ok(Self(map))
    }

    /// Remove and return the first key present.
    fn take(&mut self, keys: &[&str]) -> Option<String> {
        let mut found = None;
        for k in keys {
            if let Some(v) = self.0.remove(*k) {
                found.get_or_insert(v);
            }
        }
        found
    }

    fn take_non_empty(&mut self, keys: &[&str]) -> Option<String> {
        self.take(keys).filter(|v| !v.trim().is_empty())
    }

    fn take_flag(&mut self, keys: &[&str]) -> Option<bool> {
        self.take(keys).and_then(|v| Scalar::from_literal(&v).as_bool())
    }

    fn into_rest(self) -> BTreeMap<String, String> {
        self.0
    }

    /// TLS block from `sni`/`alpn`/`fp`/`allowInsecure`/reality keys.
    fn take_tls(&mut self, enabled: bool) -> TlsOptions {
        let mut tls = TlsOptions {
            enabled,
            server_name: self.take(&["sni", "peer", "servername"]),
            insecure: self.take_flag(&["allowInsecure", "insecure", "allow_insecure"]),
            alpn: self
                .take(&["alpn"])
                .map(|a| fields::split_list(&a))
                .unwrap_or_default(),
            fingerprint: self.take(&["fp", "fingerprint"]),
            reality: None,
        };
        if let Some(pbk) = self.take_non_empty(&["pbk", "publicKey"]) {
            tls.reality = Some(RealityOptions {
                public_key: pbk,
                short_id: self.take(&["sid", "shortId"]),
            });
        }
        tls
    }

    fn take_transport(&mut self) -> Option<Transport> {
        let kind = self.take(&["type", "network"])?;
        let path = self.take(&["path"]);
        let host = self.take(&["host"]);
        let service = self.take(&["serviceName", "service_name"]);
        self.take(&["headerType"]);
        Transport::from_parts(&kind, path, host, service)
    }
}

fn split_fragment(body: &str) -> (&str, Option<&str>) {
    match body.split_once('#') {
        Some((m, f)) => (m, Some(f)),
        None => (body, None),
    }
}

fn pct(s: &str, what: &'static str) -> Result<String, EntryError> {
    urlencoding::decode(s)
        .map(|c| c.into_owned())
        .map_err(|_| EntryError::Percent(what))
}

/// `host:port`, `[v6]:port`; a trailing `/` is tolerated.
fn split_host_port(hp: &str) -> Result<(String, u16), EntryError> {
    let hp = hp.trim().trim_end_matches('/');
    let (host, port) = if let Some(rest) = hp.strip_prefix('[') {
        let (h, tail) = rest
            .split_once(']')
            .ok_or_else(|| EntryError::Malformed(format!("unterminated IPv6 literal in `{hp}`")))?;
        (h, tail.strip_prefix(':'))
    } else {
        match hp.rsplit_once(':') {
            Some((h, p)) => (h, Some(p)),
            None => (hp, None),
        }
    };
    if host.is_empty() {
        return Err(EntryError::Missing("host"));
    }
    let port = port.ok_or(EntryError::Missing("port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| EntryError::Port(port.to_string()))?;
    Ok((host.to_string(), port))
}

fn credentials(raw: &str, what: &'static str) -> Result<(String, String), EntryError> {
    let text = if raw.contains(':') {
        raw.to_string()
    } else {
        b64::decode_text(raw).ok_or(EntryError::Base64(what))?
    };
    let (a, b) = text
        .split_once(':')
        .ok_or_else(|| EntryError::Malformed(format!("{what} is not `user:secret`")))?;
    Ok((a.to_string(), b.to_string()))
}

fn parse_ss(body: &str) -> Result<ServerRecord, EntryError> {
    let (main, _) = split_fragment(body);
    let main = main.split_once('?').map_or(main, |(m, _)| m);
    let mut link = if main.contains('@') {
        Link::split(body)?
    } else {
        // legacy: ss://BASE64(method:password@host:port)#tag
        let decoded = b64::decode_text(main.trim_end_matches('/'))
            .ok_or(EntryError::Base64("shadowsocks body"))?;
        let rest = &body[main.len()..];
        Link::split(&format!("{decoded}{rest}"))?
    };
    let userinfo = link.userinfo.take().ok_or(EntryError::Missing("credentials"))?;
    let (method, password) = credentials(&userinfo, "shadowsocks userinfo")?;
    let (plugin, plugin_opts) = match link.query.take(&["plugin"]) {
        Some(p) => match p.split_once(';') {
            Some((name, opts)) => (Some(name.to_string()), Some(opts.to_string())),
            None => (Some(p), None),
        },
        None => (None, None),
    };
    let udp_over_tcp = link
        .query
        .take(&["uot", "udp-over-tcp", "udp_over_tcp"])
        .map(|v| Scalar::from_literal(&v));
    Ok(link.finish(Protocol::Shadowsocks(ShadowsocksOpts {
        method,
        password,
        plugin,
        plugin_opts,
        udp_over_tcp,
    })))
}

fn parse_vmess(body: &str) -> Result<ServerRecord, EntryError> {
    let (main, frag) = split_fragment(body);
    let decoded = b64::decode_text(main).ok_or(EntryError::Base64("vmess body"))?;
    let value: serde_json::Value =
        serde_json::from_str(&decoded).map_err(|e| EntryError::Json(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| EntryError::Json("vmess body is not an object".into()))?;

    // v2rayN writes every key; blank values mean unset here
    let net = fields::non_empty(obj, &["net"]).unwrap_or_else(|| "tcp".into());
    let path = fields::non_empty(obj, &["path"]);
    let host = fields::non_empty(obj, &["host"]);
    // v2rayN carries the grpc service name in `path`
    let transport = Transport::from_parts(&net, path.clone(), host.clone(), path);
    let tls = match fields::non_empty(obj, &["tls"]).as_deref() {
        Some("tls") | Some("xtls") | Some("reality") => Some(TlsOptions {
            enabled: true,
            server_name: fields::non_empty(obj, &["sni"]).or(host),
            insecure: fields::flag(obj, &["allowInsecure", "skip-cert-verify"]),
            alpn: fields::list(obj, &["alpn"]),
            fingerprint: fields::non_empty(obj, &["fp"]),
            reality: fields::non_empty(obj, &["pbk"]).map(|public_key| RealityOptions {
                public_key,
                short_id: fields::text(obj, &["sid"]),
            }),
        }),
        _ => None,
    };
    let opts = VmessOpts {
        uuid: fields::text(obj, &["id"]).unwrap_or_default(),
        security: fields::non_empty(obj, &["scy", "security"]).unwrap_or_else(|| "auto".into()),
        alter_id: fields::scalar(obj, &["aid"]),
        packet_encoding: None,
        tls,
        transport,
    };
    let mut rec = ServerRecord::new(
        Protocol::Vmess(opts),
        fields::text(obj, &["add"]).unwrap_or_default(),
        fields::port(obj, &["port"])?,
    );
    let tag = match fields::non_empty(obj, &["ps"]) {
        Some(ps) => Some(ps),
        None => frag.map(|f| pct(f, "fragment")).transpose()?,
    };
    if let Some(tag) = tag.filter(|t| !t.trim().is_empty()) {
        rec = rec.with_tag(tag);
    }
    Ok(rec)
}

fn parse_vless(body: &str) -> Result<ServerRecord, EntryError> {
    let mut link = Link::split(body)?;
    let uuid = link.userinfo.take().ok_or(EntryError::Missing("uuid"))?;
    let q = &mut link.query;
    let security = q.take(&["security"]).unwrap_or_default().to_ascii_lowercase();
    let tls = match security.as_str() {
        "tls" | "xtls" | "reality" => Some(q.take_tls(true)),
        _ => None,
    };
    q.take(&["encryption"]);
    let opts = VlessOpts {
        uuid,
        flow: q.take(&["flow"]),
        packet_encoding: q.take(&["packetEncoding", "packet_encoding"]),
        transport: q.take_transport(),
        tls,
    };
    Ok(link.finish(Protocol::Vless(opts)))
}

fn parse_trojan(body: &str) -> Result<ServerRecord, EntryError> {
    let mut link = Link::split(body)?;
    let password = link.userinfo.take().ok_or(EntryError::Missing("password"))?;
    let q = &mut link.query;
    let tls = match q.take(&["security"]).as_deref() {
        Some("none") => None,
        _ => Some(q.take_tls(true)),
    };
    let opts = TrojanOpts {
        password,
        transport: q.take_transport(),
        tls,
    };
    Ok(link.finish(Protocol::Trojan(opts)))
}

fn parse_tuic(body: &str) -> Result<ServerRecord, EntryError> {
    let mut link = Link::split(body)?;
    let userinfo = link.userinfo.take().ok_or(EntryError::Missing("uuid"))?;
    let (uuid, password) = userinfo
        .split_once(':')
        .map(|(u, p)| (u.to_string(), p.to_string()))
        .unwrap_or((userinfo, String::new()));
    let q = &mut link.query;
    let opts = TuicOpts {
        uuid,
        password,
        congestion_control: q.take(&["congestion_control", "congestion-control"]),
        udp_relay_mode: q.take(&["udp_relay_mode", "udp-relay-mode"]),
        zero_rtt_handshake: q
            .take(&["zero_rtt_handshake", "reduce_rtt"])
            .map(|v| Scalar::from_literal(&v)),
        heartbeat: q.take(&["heartbeat"]).map(|v| Scalar::from_literal(&v)),
        tls: Some(q.take_tls(true)),
    };
    Ok(link.finish(Protocol::Tuic(opts)))
}

fn parse_hysteria2(body: &str) -> Result<ServerRecord, EntryError> {
    let mut link = Link::split(body)?;
    let password = link.userinfo.take().unwrap_or_default();
    let q = &mut link.query;
    let opts = Hysteria2Opts {
        password,
        obfs: q.take(&["obfs"]),
        obfs_password: q.take(&["obfs-password", "obfs_password"]),
        up_mbps: q.take(&["upmbps", "up"]).map(|v| Scalar::from_literal(&v)),
        down_mbps: q.take(&["downmbps", "down"]).map(|v| Scalar::from_literal(&v)),
        tls: Some(q.take_tls(true)),
    };
    Ok(link.finish(Protocol::Hysteria2(opts)))
}

fn parse_wireguard(body: &str) -> Result<ServerRecord, EntryError> {
    let mut link = Link::split(body)?;
    let private_key = link.userinfo.take().unwrap_or_default();
    let q = &mut link.query;
    let reserved = match q.take_non_empty(&["reserved"]) {
        Some(r) => Some(fields::parse_reserved(&r).ok_or_else(|| {
            EntryError::Malformed(format!("invalid reserved bytes `{r}`"))
        })?),
        None => None,
    };
    let opts = WireguardOpts {
        private_key,
        peer_public_key: q
            .take(&["publickey", "public_key", "peer_public_key", "publicKey"])
            .unwrap_or_default(),
        local_address: q
            .take(&["address", "ip", "local_address"])
            .map(|a| fields::split_list(&a))
            .unwrap_or_default(),
        pre_shared_key: q.take(&["presharedkey", "pre_shared_key", "psk"]),
        reserved,
        mtu: q.take(&["mtu"]).map(|v| Scalar::from_literal(&v)),
        keepalive: q
            .take(&["keepalive", "persistent_keepalive_interval"])
            .map(|v| Scalar::from_literal(&v)),
    };
    Ok(link.finish(Protocol::Wireguard(opts)))
}

fn parse_proxy(body: &str, socks: bool, tls: bool) -> Result<ServerRecord, EntryError> {
    let mut link = Link::split(body)?;
    let (username, password) = match link.userinfo.take().filter(|u| !u.is_empty()) {
        Some(u) if u.contains(':') => credentials(&u, "proxy userinfo")
            .map(|(a, b)| (Some(a), Some(b)))?,
        Some(u) => match credentials(&u, "proxy userinfo") {
            Ok((a, b)) => (Some(a), Some(b)),
            Err(_) => (Some(u), None),
        },
        None => (None, None),
    };
    let tls = tls.then(|| link.query.take_tls(true));
    let opts = ProxyAuthOpts {
        username,
        password,
        tls,
    };
    let protocol = if socks {
        Protocol::Socks(opts)
    } else {
        Protocol::Http(opts)
    };
    Ok(link.finish(protocol))
}
