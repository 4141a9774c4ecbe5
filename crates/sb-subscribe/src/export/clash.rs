//! Clash (mihomo) proxy builders, same shape as the sing-box ones.

use serde_json::{json, Map, Value};

use crate::error::ExportError;
use crate::model::{Protocol, ProxyAuthOpts, Scalar, ServerRecord, TlsOptions, Transport};

pub const SELECT_GROUP: &str = "PROXY";
pub const URLTEST_GROUP: &str = "auto";

struct Proxy(Map<String, Value>);

impl Proxy {
    fn new(ty: &str, name: &str, rec: &ServerRecord) -> Self {
        let mut m = Map::new();
        m.insert("name".into(), name.into());
        m.insert("type".into(), ty.into());
        m.insert("server".into(), rec.address.clone().into());
        m.insert("port".into(), rec.port.into());
        Self(m)
    }

    fn put(&mut self, key: &str, v: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), v.into());
        self
    }

    fn opt<V: Into<Value>>(&mut self, key: &str, v: Option<V>) -> &mut Self {
        if let Some(v) = v {
            self.put(key, v);
        }
        self
    }

    fn opt_scalar(&mut self, key: &str, v: Option<&Scalar>) -> &mut Self {
        self.opt(key, v.map(Scalar::to_json))
    }

    /// `tls`/`sni`/`skip-cert-verify`/`alpn`/fingerprint/reality keys.
    fn tls(&mut self, t: Option<&TlsOptions>, sni_key: &str, with_flag: bool) -> &mut Self {
        let Some(t) = t else { return self };
        if with_flag {
            self.put("tls", t.enabled);
        }
        self.opt(sni_key, t.server_name.clone())
            .opt("skip-cert-verify", t.insecure)
            .opt("client-fingerprint", t.fingerprint.clone());
        if !t.alpn.is_empty() {
            self.put("alpn", t.alpn.clone());
        }
        if let Some(r) = &t.reality {
            let mut ro = Map::new();
            ro.insert("public-key".into(), r.public_key.clone().into());
            if let Some(sid) = &r.short_id {
                ro.insert("short-id".into(), sid.clone().into());
            }
            self.put("reality-opts", Value::Object(ro));
        }
        self
    }

    fn transport(&mut self, t: Option<&Transport>) -> &mut Self {
        let Some(t) = t else { return self };
        match t {
            Transport::Ws { path, host } | Transport::HttpUpgrade { path, host } => {
                let mut o = Map::new();
                if let Some(p) = path {
                    o.insert("path".into(), p.clone().into());
                }
                if let Some(h) = host {
                    o.insert("headers".into(), json!({ "Host": h }));
                }
                if matches!(t, Transport::HttpUpgrade { .. }) {
                    o.insert("v2ray-http-upgrade".into(), true.into());
                }
                self.put("network", "ws").put("ws-opts", Value::Object(o))
            }
            Transport::Grpc { service_name } => {
                let mut o = Map::new();
                if let Some(s) = service_name {
                    o.insert("grpc-service-name".into(), s.clone().into());
                }
                self.put("network", "grpc").put("grpc-opts", Value::Object(o))
            }
            Transport::Http { path, host } => {
                let mut o = Map::new();
                if let Some(p) = path {
                    o.insert("path".into(), p.clone().into());
                }
                if !host.is_empty() {
                    o.insert("host".into(), host.clone().into());
                }
                self.put("network", "h2").put("h2-opts", Value::Object(o))
            }
        }
    }

    fn done(&mut self) -> Value {
        Value::Object(std::mem::take(&mut self.0))
    }
}

fn missing(rec: &ServerRecord, field: &'static str) -> ExportError {
    ExportError::MissingField {
        protocol: rec.kind(),
        tag: rec.tag.clone(),
        field,
    }
}

fn require(rec: &ServerRecord, field: &'static str, v: &str) -> Result<(), ExportError> {
    if v.trim().is_empty() {
        Err(missing(rec, field))
    } else {
        Ok(())
    }
}

/// `mode=websocket;host=x` → `{mode: websocket, host: x}`
fn plugin_opts(s: &str) -> Value {
    let m: Map<String, Value> = s
        .split(';')
        .filter(|kv| !kv.is_empty())
        .map(|kv| match kv.split_once('=') {
            Some((k, v)) => (k.to_string(), Value::from(v)),
            None => (kv.to_string(), Value::Bool(true)),
        })
        .collect();
    Value::Object(m)
}

pub fn build_proxy(rec: &ServerRecord, name: &str) -> Result<Value, ExportError> {
    require(rec, "server", &rec.address)?;
    if rec.port == 0 {
        return Err(missing(rec, "port"));
    }
    let v = match &rec.protocol {
        Protocol::Shadowsocks(o) => {
            require(rec, "cipher", &o.method)?;
            require(rec, "password", &o.password)?;
            Proxy::new("ss", name, rec)
                .put("cipher", o.method.clone())
                .put("password", o.password.clone())
                .opt("plugin", o.plugin.clone())
                .opt("plugin-opts", o.plugin_opts.as_deref().map(plugin_opts))
                .opt_scalar("udp-over-tcp", o.udp_over_tcp.as_ref())
                .done()
        }
        Protocol::Vmess(o) => {
            require(rec, "uuid", &o.uuid)?;
            Proxy::new("vmess", name, rec)
                .put("uuid", o.uuid.clone())
                .put(
                    "alterId",
                    o.alter_id.as_ref().map_or(Value::from(0), Scalar::to_json),
                )
                .put("cipher", o.security.clone())
                .opt("packet-encoding", o.packet_encoding.clone())
                .tls(o.tls.as_ref(), "servername", true)
                .transport(o.transport.as_ref())
                .done()
        }
        Protocol::Vless(o) => {
            require(rec, "uuid", &o.uuid)?;
            Proxy::new("vless", name, rec)
                .put("uuid", o.uuid.clone())
                .opt("flow", o.flow.clone())
                .opt("packet-encoding", o.packet_encoding.clone())
                .tls(o.tls.as_ref(), "servername", true)
                .transport(o.transport.as_ref())
                .done()
        }
        Protocol::Trojan(o) => {
            require(rec, "password", &o.password)?;
            Proxy::new("trojan", name, rec)
                .put("password", o.password.clone())
                .tls(o.tls.as_ref(), "sni", false)
                .transport(o.transport.as_ref())
                .done()
        }
        Protocol::Tuic(o) => {
            require(rec, "uuid", &o.uuid)?;
            Proxy::new("tuic", name, rec)
                .put("uuid", o.uuid.clone())
                .put("password", o.password.clone())
                .opt("congestion-controller", o.congestion_control.clone())
                .opt("udp-relay-mode", o.udp_relay_mode.clone())
                .opt_scalar("reduce-rtt", o.zero_rtt_handshake.as_ref())
                .opt_scalar("heartbeat-interval", o.heartbeat.as_ref())
                .tls(o.tls.as_ref(), "sni", false)
                .done()
        }
        Protocol::Hysteria2(o) => {
            require(rec, "password", &o.password)?;
            Proxy::new("hysteria2", name, rec)
                .put("password", o.password.clone())
                .opt("obfs", o.obfs.clone())
                .opt("obfs-password", o.obfs_password.clone())
                .opt_scalar("up", o.up_mbps.as_ref())
                .opt_scalar("down", o.down_mbps.as_ref())
                .tls(o.tls.as_ref(), "sni", false)
                .done()
        }
        Protocol::Wireguard(o) => {
            require(rec, "private-key", &o.private_key)?;
            require(rec, "public-key", &o.peer_public_key)?;
            let strip = |a: &String| a.split('/').next().unwrap_or_default().to_string();
            let v4 = o.local_address.iter().find(|a| !a.contains(':')).map(strip);
            let v6 = o.local_address.iter().find(|a| a.contains(':')).map(strip);
            Proxy::new("wireguard", name, rec)
                .put("private-key", o.private_key.clone())
                .put("public-key", o.peer_public_key.clone())
                .opt("ip", v4)
                .opt("ipv6", v6)
                .opt("pre-shared-key", o.pre_shared_key.clone())
                .opt("reserved", o.reserved.clone())
                .opt_scalar("mtu", o.mtu.as_ref())
                .opt_scalar("persistent-keepalive", o.keepalive.as_ref())
                .put("udp", true)
                .done()
        }
        Protocol::Http(o) => auth(&mut Proxy::new("http", name, rec), o),
        Protocol::Socks(o) => auth(&mut Proxy::new("socks5", name, rec), o),
        Protocol::Invalid(_) => return Err(missing(rec, "type")),
    };
    Ok(v)
}

fn auth(p: &mut Proxy, o: &ProxyAuthOpts) -> Value {
    p.opt("username", o.username.clone())
        .opt("password", o.password.clone());
    if let Some(t) = &o.tls {
        p.put("tls", t.enabled)
            .opt("sni", t.server_name.clone())
            .opt("skip-cert-verify", t.insecure);
    }
    p.done()
}

/// `proxies`, a `PROXY` selector (plus optional `auto` url-test) and rules.
pub fn document(proxies: Vec<Value>, names: &[String], urltest: bool, rules: Vec<String>) -> Value {
    let mut groups = Vec::new();
    let mut choices: Vec<String> = Vec::with_capacity(names.len() + 2);
    if urltest {
        choices.push(URLTEST_GROUP.to_string());
    }
    choices.extend(names.iter().cloned());
    choices.push("DIRECT".to_string());
    groups.push(json!({ "name": SELECT_GROUP, "type": "select", "proxies": choices }));
    if urltest {
        groups.push(json!({
            "name": URLTEST_GROUP,
            "type": "url-test",
            "proxies": names,
            "url": super::singbox::URLTEST_URL,
            "interval": 300,
        }));
    }
    let mut all_rules = rules;
    all_rules.push(format!("MATCH,{SELECT_GROUP}"));
    json!({
        "proxies": proxies,
        "proxy-groups": groups,
        "rules": all_rules,
    })
}
