//! sing-box outbound builders and document assembly.
//!
//! Optional fields are emitted whenever the record has them, including falsy
//! literals (`0`, `false`, `""`); only absent fields are left out.

use serde_json::{json, Map, Value};
use std::collections::HashSet;

use super::version::SyntaxMode;
use crate::error::ExportError;
use crate::model::{
    Protocol, ProtocolKind, ProxyAuthOpts, Scalar, ServerRecord, TlsOptions, Transport,
};

pub const DIRECT_TAG: &str = "direct";
pub const BLOCK_TAG: &str = "block";
pub const DNS_TAG: &str = "dns-out";
pub const URLTEST_TAG: &str = "auto";
pub const URLTEST_URL: &str = "https://www.gstatic.com/generate_204";

/// Outbound tags the document reserves for itself.
pub const RESERVED_TAGS: [&str; 4] = [DIRECT_TAG, BLOCK_TAG, DNS_TAG, URLTEST_TAG];

/// Small builder over a JSON object.
struct Out(Map<String, Value>);

impl Out {
    fn new(ty: &str, tag: &str, rec: &ServerRecord) -> Self {
        let mut m = Map::new();
        m.insert("type".into(), ty.into());
        m.insert("tag".into(), tag.into());
        m.insert("server".into(), rec.address.clone().into());
        m.insert("server_port".into(), rec.port.into());
        Self(m)
    }

    fn put(&mut self, key: &str, v: impl Into<Value>) -> &mut Self {
        self.0.insert(key.to_string(), v.into());
        self
    }

    fn opt_str(&mut self, key: &str, v: Option<&String>) -> &mut Self {
        if let Some(v) = v {
            self.put(key, v.clone());
        }
        self
    }

    fn opt_scalar(&mut self, key: &str, v: Option<&Scalar>) -> &mut Self {
        if let Some(v) = v {
            self.put(key, v.to_json());
        }
        self
    }

    fn opt_value(&mut self, key: &str, v: Option<Value>) -> &mut Self {
        if let Some(v) = v {
            self.put(key, v);
        }
        self
    }

    fn done(&mut self) -> Value {
        Value::Object(std::mem::take(&mut self.0))
    }
}

fn require(rec: &ServerRecord, field: &'static str, value: &str) -> Result<(), ExportError> {
    if value.trim().is_empty() {
        return Err(ExportError::MissingField {
            protocol: rec.kind(),
            tag: rec.tag.clone(),
            field,
        });
    }
    Ok(())
}

/// One outbound for `rec`, tagged `tag`.
pub fn build_outbound(rec: &ServerRecord, tag: &str) -> Result<Value, ExportError> {
    require(rec, "server", &rec.address)?;
    if rec.port == 0 {
        return Err(ExportError::MissingField {
            protocol: rec.kind(),
            tag: rec.tag.clone(),
            field: "server_port",
        });
    }
    let out = match &rec.protocol {
        Protocol::Shadowsocks(o) => {
            require(rec, "method", &o.method)?;
            require(rec, "password", &o.password)?;
            Out::new("shadowsocks", tag, rec)
                .put("method", o.method.clone())
                .put("password", o.password.clone())
                .opt_str("plugin", o.plugin.as_ref())
                .opt_str("plugin_opts", o.plugin_opts.as_ref())
                .opt_scalar("udp_over_tcp", o.udp_over_tcp.as_ref())
                .done()
        }
        Protocol::Vmess(o) => {
            require(rec, "uuid", &o.uuid)?;
            Out::new("vmess", tag, rec)
                .put("uuid", o.uuid.clone())
                .put("security", o.security.clone())
                .opt_scalar("alter_id", o.alter_id.as_ref())
                .opt_str("packet_encoding", o.packet_encoding.as_ref())
                .opt_value("tls", o.tls.as_ref().map(tls))
                .opt_value("transport", o.transport.as_ref().map(transport))
                .done()
        }
        Protocol::Vless(o) => {
            require(rec, "uuid", &o.uuid)?;
            Out::new("vless", tag, rec)
                .put("uuid", o.uuid.clone())
                .opt_str("flow", o.flow.as_ref())
                .opt_str("packet_encoding", o.packet_encoding.as_ref())
                .opt_value("tls", o.tls.as_ref().map(tls))
                .opt_value("transport", o.transport.as_ref().map(transport))
                .done()
        }
        Protocol::Trojan(o) => {
            require(rec, "password", &o.password)?;
            Out::new("trojan", tag, rec)
                .put("password", o.password.clone())
                .opt_value("tls", o.tls.as_ref().map(tls))
                .opt_value("transport", o.transport.as_ref().map(transport))
                .done()
        }
        Protocol::Tuic(o) => {
            require(rec, "uuid", &o.uuid)?;
            Out::new("tuic", tag, rec)
                .put("uuid", o.uuid.clone())
                .put("password", o.password.clone())
                .opt_str("congestion_control", o.congestion_control.as_ref())
                .opt_str("udp_relay_mode", o.udp_relay_mode.as_ref())
                .opt_scalar("zero_rtt_handshake", o.zero_rtt_handshake.as_ref())
                .opt_scalar("heartbeat", o.heartbeat.as_ref())
                .opt_value("tls", o.tls.as_ref().map(tls))
                .done()
        }
        Protocol::Hysteria2(o) => {
            require(rec, "password", &o.password)?;
            let obfs = o.obfs.as_ref().map(|ty| {
                let mut m = Map::new();
                m.insert("type".into(), ty.clone().into());
                if let Some(pw) = &o.obfs_password {
                    m.insert("password".into(), pw.clone().into());
                }
                Value::Object(m)
            });
            Out::new("hysteria2", tag, rec)
                .put("password", o.password.clone())
                .opt_value("obfs", obfs)
                .opt_scalar("up_mbps", o.up_mbps.as_ref())
                .opt_scalar("down_mbps", o.down_mbps.as_ref())
                .opt_value("tls", o.tls.as_ref().map(tls))
                .done()
        }
        Protocol::Wireguard(o) => {
            require(rec, "private_key", &o.private_key)?;
            require(rec, "peer_public_key", &o.peer_public_key)?;
            Out::new("wireguard", tag, rec)
                .put("private_key", o.private_key.clone())
                .put("peer_public_key", o.peer_public_key.clone())
                .put("local_address", o.local_address.clone())
                .opt_str("pre_shared_key", o.pre_shared_key.as_ref())
                .opt_value("reserved", o.reserved.clone().map(Value::from))
                .opt_scalar("mtu", o.mtu.as_ref())
                .opt_scalar("persistent_keepalive_interval", o.keepalive.as_ref())
                .done()
        }
        Protocol::Http(o) => auth(&mut Out::new("http", tag, rec), o),
        Protocol::Socks(o) => auth(Out::new("socks", tag, rec).put("version", "5"), o),
        Protocol::Invalid(e) => {
            return Err(ExportError::MissingField {
                protocol: ProtocolKind::Invalid,
                tag: if rec.tag.is_empty() { e.raw.clone() } else { rec.tag.clone() },
                field: "protocol",
            })
        }
    };
    Ok(out)
}

fn auth(out: &mut Out, o: &ProxyAuthOpts) -> Value {
    out.opt_str("username", o.username.as_ref())
        .opt_str("password", o.password.as_ref())
        .opt_value("tls", o.tls.as_ref().map(tls))
        .done()
}

fn tls(t: &TlsOptions) -> Value {
    let mut m = Map::new();
    m.insert("enabled".into(), t.enabled.into());
    if let Some(sn) = &t.server_name {
        m.insert("server_name".into(), sn.clone().into());
    }
    if let Some(i) = t.insecure {
        m.insert("insecure".into(), i.into());
    }
    if !t.alpn.is_empty() {
        m.insert("alpn".into(), t.alpn.clone().into());
    }
    if let Some(fp) = &t.fingerprint {
        m.insert("utls".into(), json!({ "enabled": true, "fingerprint": fp }));
    }
    if let Some(r) = &t.reality {
        let mut rm = Map::new();
        rm.insert("enabled".into(), true.into());
        rm.insert("public_key".into(), r.public_key.clone().into());
        if let Some(sid) = &r.short_id {
            rm.insert("short_id".into(), sid.clone().into());
        }
        m.insert("reality".into(), Value::Object(rm));
    }
    Value::Object(m)
}

fn transport(t: &Transport) -> Value {
    let mut m = Map::new();
    m.insert("type".into(), t.kind().into());
    match t {
        Transport::Ws { path, host } | Transport::HttpUpgrade { path, host } => {
            if let Some(p) = path {
                m.insert("path".into(), p.clone().into());
            }
            if let Some(h) = host {
                if matches!(t, Transport::Ws { .. }) {
                    m.insert("headers".into(), json!({ "Host": h }));
                } else {
                    m.insert("host".into(), h.clone().into());
                }
            }
        }
        Transport::Grpc { service_name } => {
            if let Some(s) = service_name {
                m.insert("service_name".into(), s.clone().into());
            }
        }
        Transport::Http { path, host } => {
            if let Some(p) = path {
                m.insert("path".into(), p.clone().into());
            }
            if !host.is_empty() {
                m.insert("host".into(), host.clone().into());
            }
        }
    }
    Value::Object(m)
}

/// `direct`, `block` and `dns-out`, appended to every document.
pub fn service_outbounds() -> Vec<Value> {
    vec![
        json!({ "type": "direct", "tag": DIRECT_TAG }),
        json!({ "type": "block", "tag": BLOCK_TAG }),
        json!({ "type": "dns", "tag": DNS_TAG }),
    ]
}

pub fn urltest_outbound(tags: &[String]) -> Value {
    json!({
        "type": "urltest",
        "tag": URLTEST_TAG,
        "outbounds": tags,
        "url": URLTEST_URL,
        "interval": "3m",
    })
}

/// Rewrite a route rule between `outbound: block/dns-out` and `action: reject/hijack-dns`.
pub fn translate_rule(rule: &Value, syntax: SyntaxMode) -> Value {
    let Some(obj) = rule.as_object() else {
        return rule.clone();
    };
    let mut obj = obj.clone();
    match syntax {
        SyntaxMode::Modern => {
            let action = match obj.get("outbound").and_then(Value::as_str) {
                Some(BLOCK_TAG) => Some("reject"),
                Some(DNS_TAG) => Some("hijack-dns"),
                _ => None,
            };
            if let Some(a) = action {
                obj.remove("outbound");
                obj.insert("action".into(), a.into());
            }
        }
        SyntaxMode::Legacy => {
            let outbound = match obj.get("action").and_then(Value::as_str) {
                Some("reject") => Some(BLOCK_TAG),
                Some("hijack-dns") => Some(DNS_TAG),
                Some("route") => None,
                _ => return Value::Object(obj),
            };
            obj.remove("action");
            if let Some(o) = outbound {
                obj.insert("outbound".into(), o.into());
            }
        }
    }
    Value::Object(obj)
}

fn dns_rule(syntax: SyntaxMode) -> Value {
    match syntax {
        SyntaxMode::Legacy => json!({ "protocol": "dns", "outbound": DNS_TAG }),
        SyntaxMode::Modern => json!({ "protocol": "dns", "action": "hijack-dns" }),
    }
}

/// Route section: DNS rule, template and caller rules (translated), private
/// ranges direct, then `final`.
pub fn route(
    syntax: SyntaxMode,
    template_route: Option<&Value>,
    extra_routes: &[Value],
    final_tag: &str,
) -> Value {
    let mut route = template_route
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    let template_rules = route
        .remove("rules")
        .and_then(|r| r.as_array().cloned())
        .unwrap_or_default();

    let mut rules = vec![dns_rule(syntax)];
    rules.extend(
        template_rules
            .iter()
            .chain(extra_routes)
            .map(|r| translate_rule(r, syntax)),
    );
    rules.push(json!({ "ip_is_private": true, "outbound": DIRECT_TAG }));
    route.insert("rules".into(), Value::Array(rules));
    route
        .entry("final")
        .or_insert_with(|| Value::from(final_tag));
    Value::Object(route)
}

/// Allocate an outbound tag that does not clash with reserved or earlier tags.
pub fn unique_tag(base: &str, taken: &mut HashSet<String>) -> String {
    let mut tag = base.to_string();
    let mut n = 1;
    while RESERVED_TAGS.contains(&tag.as_str()) || taken.contains(&tag) {
        tag = format!("{base} ({n})");
        n += 1;
    }
    taken.insert(tag.clone());
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        Hysteria2Opts, RealityOptions, ShadowsocksOpts, VlessOpts, WireguardOpts,
    };

    #[test]
    fn wireguard_emits_falsy_literals() {
        let rec = ServerRecord::new(
            Protocol::Wireguard(WireguardOpts {
                private_key: "priv".into(),
                peer_public_key: "pub".into(),
                local_address: vec!["10.0.0.2/32".into()],
                mtu: Some(Scalar::from_literal("0")),
                keepalive: Some(Scalar::from_literal("false")),
                reserved: Some(vec![0, 0, 0]),
                ..Default::default()
            }),
            "wg.example.com",
            51820,
        );
        let v = build_outbound(&rec, "wg").unwrap();
        assert_eq!(v["mtu"], json!(0));
        assert_eq!(v["persistent_keepalive_interval"], json!(false));
        assert_eq!(v["reserved"], json!([0, 0, 0]));
        assert!(v.get("pre_shared_key").is_none());
    }

    #[test]
    fn missing_mandatory_field_is_error() {
        let rec = ServerRecord::new(
            Protocol::Shadowsocks(ShadowsocksOpts {
                method: "aes-256-gcm".into(),
                ..Default::default()
            }),
            "h",
            1,
        )
        .with_tag("s");
        match build_outbound(&rec, "s") {
            Err(ExportError::MissingField { field, .. }) => assert_eq!(field, "password"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn vless_reality_and_hy2_obfs() {
        let rec = ServerRecord::new(
            Protocol::Vless(VlessOpts {
                uuid: "u".into(),
                flow: Some("xtls-rprx-vision".into()),
                tls: Some(TlsOptions {
                    enabled: true,
                    server_name: Some("x.com".into()),
                    fingerprint: Some("chrome".into()),
                    reality: Some(RealityOptions {
                        public_key: "pk".into(),
                        short_id: Some(String::new()),
                    }),
                    ..Default::default()
                }),
                transport: Some(Transport::Ws {
                    path: Some("/".into()),
                    host: Some("cdn".into()),
                }),
                ..Default::default()
            }),
            "1.2.3.4",
            443,
        );
        let v = build_outbound(&rec, "r").unwrap();
        assert_eq!(v["tls"]["reality"]["short_id"], json!(""));
        assert_eq!(v["tls"]["utls"]["fingerprint"], "chrome");
        assert_eq!(v["transport"]["headers"]["Host"], "cdn");

        let hy = ServerRecord::new(
            Protocol::Hysteria2(Hysteria2Opts {
                password: "p".into(),
                obfs: Some("salamander".into()),
                obfs_password: Some("o".into()),
                up_mbps: Some(Scalar::Int(0)),
                ..Default::default()
            }),
            "h",
            443,
        );
        let v = build_outbound(&hy, "h").unwrap();
        assert_eq!(v["obfs"], json!({"type": "salamander", "password": "o"}));
        assert_eq!(v["up_mbps"], json!(0));
    }

    #[test]
    fn rule_translation_both_ways() {
        let legacy = json!({ "domain_suffix": ["ads.example"], "outbound": "block" });
        let modern = translate_rule(&legacy, SyntaxMode::Modern);
        assert_eq!(modern, json!({ "domain_suffix": ["ads.example"], "action": "reject" }));
        assert_eq!(translate_rule(&modern, SyntaxMode::Legacy), legacy);
        let passthrough = json!({ "domain": ["x"], "outbound": "direct" });
        assert_eq!(translate_rule(&passthrough, SyntaxMode::Modern), passthrough);
        assert_eq!(translate_rule(&passthrough, SyntaxMode::Legacy), passthrough);
    }

    #[test]
    fn route_keeps_template_final_and_orders_rules() {
        let tpl = json!({ "rules": [{ "outbound": "dns-out", "port": 53 }], "auto_detect_interface": true });
        let r = route(SyntaxMode::Modern, Some(&tpl), &[json!({"domain": ["a"], "outbound": "direct"})], "auto");
        let rules = r["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0]["action"], "hijack-dns");
        assert_eq!(rules[1], json!({ "port": 53, "action": "hijack-dns" }));
        assert_eq!(rules[3]["ip_is_private"], true);
        assert_eq!(r["final"], "auto");
        assert_eq!(r["auto_detect_interface"], true);
    }

    #[test]
    fn unique_tags_avoid_reserved_names() {
        let mut taken = HashSet::new();
        assert_eq!(unique_tag("direct", &mut taken), "direct (1)");
        assert_eq!(unique_tag("a", &mut taken), "a");
        assert_eq!(unique_tag("a", &mut taken), "a (1)");
    }
}
