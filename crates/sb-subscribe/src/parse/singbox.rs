//! sing-box JSON subscriptions: `{"outbounds": [...]}` or a bare array.

use serde::Deserialize;
use serde_json::Value;

use super::fields::{self, Obj};
use super::EntryError;
use crate::error::ParseError;
use crate::model::{
    Hysteria2Opts, Protocol, ProxyAuthOpts, RealityOptions, ServerRecord, ShadowsocksOpts,
    TlsOptions, Transport, TrojanOpts, TuicOpts, VlessOpts, VmessOpts, WireguardOpts,
};

/// Outbound types that route traffic instead of describing a server.
const SERVICE_TYPES: &[&str] = &["direct", "block", "dns", "selector", "urltest"];

#[derive(Deserialize)]
#[serde(untagged)]
enum SBoxDoc {
    Full {
        #[serde(default)]
        outbounds: Vec<Value>,
    },
    Bare(Vec<Value>),
}

pub fn parse(raw: &[u8]) -> Result<Vec<ServerRecord>, ParseError> {
    let text = String::from_utf8_lossy(raw);
    let doc = read_document(text.trim_start_matches('\u{feff}'))
        .and_then(|v| serde_json::from_value::<SBoxDoc>(v).map_err(|e| e.to_string()))
        .map_err(|message| ParseError::Container {
            format: "json",
            message,
        })?;
    let outbounds = match doc {
        SBoxDoc::Full { outbounds } | SBoxDoc::Bare(outbounds) => outbounds,
    };
    Ok(outbounds
        .iter()
        .filter(|v| !is_service(v))
        .map(|v| {
            outbound_to_record(v).unwrap_or_else(|e| ServerRecord::invalid(v.to_string(), e.to_string()))
        })
        .collect())
}

fn is_service(v: &Value) -> bool {
    v.get("type")
        .and_then(Value::as_str)
        .is_some_and(|t| SERVICE_TYPES.contains(&t))
}

/// Map one outbound object onto a record.
pub fn outbound_to_record(v: &Value) -> Result<ServerRecord, EntryError> {
    let obj = v
        .as_object()
        .ok_or_else(|| EntryError::Json("outbound is not an object".into()))?;
    let ty = fields::non_empty(obj, &["type"]).ok_or(EntryError::Missing("type"))?;

    // 1.11+ wireguard endpoints keep the server inside `peers`
    let peer = obj
        .get("peers")
        .and_then(Value::as_array)
        .and_then(|p| p.first())
        .and_then(Value::as_object);
    let endpoint = peer.unwrap_or(obj);

    let protocol = match ty.as_str() {
        "shadowsocks" => Protocol::Shadowsocks(ShadowsocksOpts {
            method: fields::text(obj, &["method"]).unwrap_or_default(),
            password: fields::text(obj, &["password"]).unwrap_or_default(),
            plugin: fields::text(obj, &["plugin"]),
            plugin_opts: fields::text(obj, &["plugin_opts"]),
            udp_over_tcp: fields::scalar(obj, &["udp_over_tcp"]),
        }),
        "vmess" => Protocol::Vmess(VmessOpts {
            uuid: fields::text(obj, &["uuid"]).unwrap_or_default(),
            security: fields::non_empty(obj, &["security"]).unwrap_or_else(|| "auto".into()),
            alter_id: fields::scalar(obj, &["alter_id"]),
            packet_encoding: fields::text(obj, &["packet_encoding"]),
            tls: tls(obj),
            transport: transport(obj),
        }),
        "vless" => Protocol::Vless(VlessOpts {
            uuid: fields::text(obj, &["uuid"]).unwrap_or_default(),
            flow: fields::text(obj, &["flow"]),
            packet_encoding: fields::text(obj, &["packet_encoding"]),
            tls: tls(obj),
            transport: transport(obj),
        }),
        "trojan" => Protocol::Trojan(TrojanOpts {
            password: fields::text(obj, &["password"]).unwrap_or_default(),
            tls: tls(obj),
            transport: transport(obj),
        }),
        "tuic" => Protocol::Tuic(TuicOpts {
            uuid: fields::text(obj, &["uuid"]).unwrap_or_default(),
            password: fields::text(obj, &["password"]).unwrap_or_default(),
            congestion_control: fields::text(obj, &["congestion_control"]),
            udp_relay_mode: fields::text(obj, &["udp_relay_mode"]),
            zero_rtt_handshake: fields::scalar(obj, &["zero_rtt_handshake"]),
            heartbeat: fields::scalar(obj, &["heartbeat"]),
            tls: tls(obj),
        }),
        "hysteria2" => {
            let obfs = fields::object(obj, "obfs");
            Protocol::Hysteria2(Hysteria2Opts {
                password: fields::text(obj, &["password"]).unwrap_or_default(),
                obfs: obfs.and_then(|o| fields::text(o, &["type"])),
                obfs_password: obfs.and_then(|o| fields::text(o, &["password"])),
                up_mbps: fields::scalar(obj, &["up_mbps"]),
                down_mbps: fields::scalar(obj, &["down_mbps"]),
                tls: tls(obj),
            })
        }
        "wireguard" => Protocol::Wireguard(WireguardOpts {
            private_key: fields::text(obj, &["private_key"]).unwrap_or_default(),
            peer_public_key: fields::text(endpoint, &["public_key", "peer_public_key"])
                .unwrap_or_default(),
            local_address: fields::list(obj, &["local_address", "address"]),
            pre_shared_key: fields::text(endpoint, &["pre_shared_key"]),
            reserved: fields::reserved(endpoint, &["reserved"])?,
            mtu: fields::scalar(obj, &["mtu"]),
            keepalive: fields::scalar(endpoint, &["persistent_keepalive_interval"]),
        }),
        "http" => Protocol::Http(auth(obj)),
        "socks" => Protocol::Socks(auth(obj)),
        other => return Err(EntryError::UnsupportedType(other.to_string())),
    };

    let mut rec = ServerRecord::new(
        protocol,
        fields::text(endpoint, &["server", "address"]).unwrap_or_default(),
        fields::port(endpoint, &["server_port", "port"])?,
    );
    if let Some(tag) = fields::non_empty(obj, &["tag"]) {
        rec = rec.with_tag(tag);
    }
    for key in ["name", "label"] {
        if let Some(v) = fields::non_empty(obj, &[key]) {
            rec.meta.insert(key.to_string(), v);
        }
    }
    Ok(rec)
}

fn auth(obj: &Obj) -> ProxyAuthOpts {
    ProxyAuthOpts {
        username: fields::text(obj, &["username"]),
        password: fields::text(obj, &["password"]),
        tls: tls(obj),
    }
}

fn tls(obj: &Obj) -> Option<TlsOptions> {
    let t = fields::object(obj, "tls")?;
    let utls = fields::object(t, "utls");
    let reality = fields::object(t, "reality")
        .filter(|r| fields::flag(r, &["enabled"]).unwrap_or(true))
        .and_then(|r| {
            Some(RealityOptions {
                public_key: fields::non_empty(r, &["public_key"])?,
                short_id: fields::text(r, &["short_id"]),
            })
        });
    Some(TlsOptions {
        enabled: fields::flag(t, &["enabled"]).unwrap_or(false),
        server_name: fields::text(t, &["server_name"]),
        insecure: fields::flag(t, &["insecure"]),
        alpn: fields::list(t, &["alpn"]),
        fingerprint: utls.and_then(|u| fields::text(u, &["fingerprint"])),
        reality,
    })
}

fn transport(obj: &Obj) -> Option<Transport> {
    let t = fields::object(obj, "transport")?;
    let kind = fields::non_empty(t, &["type"])?;
    let host = fields::object(t, "headers")
        .and_then(|h| fields::text(h, &["Host", "host"]))
        .or_else(|| {
            let hosts = fields::list(t, &["host"]);
            (!hosts.is_empty()).then(|| hosts.join(","))
        });
    Transport::from_parts(
        &kind,
        fields::text(t, &["path"]),
        host,
        fields::text(t, &["service_name"]),
    )
}

/// JSON with comments and trailing commas, as sing-box itself accepts.
pub(super) fn read_document(text: &str) -> Result<Value, String> {
    json5::from_str::<Value>(text).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProtocolKind, Scalar};

    const DOC: &str = r#"{
      // exported by a panel
      "outbounds": [
        { "type": "selector", "tag": "proxy", "outbounds": ["a"] },
        { "type": "vless", "tag": "a", "server": "1.2.3.4", "server_port": 443,
          "uuid": "b831381d-6324-4d53-ad4f-8cda48b30811", "flow": "xtls-rprx-vision",
          "tls": { "enabled": true, "server_name": "x.com",
                   "utls": { "enabled": true, "fingerprint": "chrome" },
                   "reality": { "enabled": true, "public_key": "pk", "short_id": "" } } },
        { "type": "vmess", "tag": "b", "server": "b.example.com", "server_port": "8080",
          "uuid": "u", "transport": { "type": "ws", "path": "/ws", "headers": { "Host": "cdn" } } },
        /* wg with falsy literals */
        { "type": "wireguard", "tag": "wg", "server": "9.9.9.9", "server_port": 51820,
          "private_key": "k", "peer_public_key": "p", "local_address": ["10.0.0.2/32"],
          "mtu": 0, "reserved": [0, 0, 0] },
        { "type": "shadowtls", "tag": "s", "server": "x", "server_port": 1 },
        { "type": "direct", "tag": "direct" },
      ],
    }"#;

    #[test]
    fn parses_outbounds_and_skips_service_entries() {
        let records = parse(DOC.as_bytes()).unwrap();
        let kinds: Vec<_> = records.iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ProtocolKind::Vless,
                ProtocolKind::Vmess,
                ProtocolKind::Wireguard,
                ProtocolKind::Invalid
            ]
        );
        let Protocol::Vless(v) = &records[0].protocol else { panic!() };
        let tls = v.tls.as_ref().unwrap();
        assert_eq!(tls.fingerprint.as_deref(), Some("chrome"));
        assert_eq!(tls.reality.as_ref().unwrap().short_id.as_deref(), Some(""));
        assert_eq!(records[1].port, 8080);
        assert_eq!(
            records[1].protocol.transport(),
            Some(&Transport::Ws {
                path: Some("/ws".into()),
                host: Some("cdn".into())
            })
        );
        let Protocol::Wireguard(w) = &records[2].protocol else { panic!() };
        assert_eq!(w.mtu, Some(Scalar::Int(0)));
        assert!(records[3].diagnostic().unwrap().contains("shadowtls"));
    }

    #[test]
    fn wireguard_peers_layout() {
        let v = serde_json::json!({
            "type": "wireguard", "tag": "wg2", "private_key": "k", "address": ["172.16.0.2/32"],
            "peers": [{ "address": "engage.example.com", "port": 2408, "public_key": "pub",
                        "reserved": [1, 2, 3], "persistent_keepalive_interval": 0 }]
        });
        let r = outbound_to_record(&v).unwrap();
        assert_eq!((r.address.as_str(), r.port), ("engage.example.com", 2408));
        let Protocol::Wireguard(w) = &r.protocol else { panic!() };
        assert_eq!(w.peer_public_key, "pub");
        assert_eq!(w.keepalive, Some(Scalar::Int(0)));
        assert_eq!(w.local_address, vec!["172.16.0.2/32".to_string()]);
    }

    #[test]
    fn bare_array_and_bad_container() {
        let r = parse(br#"[{"type":"trojan","tag":"t","server":"h","server_port":443,"password":"p"}]"#)
            .unwrap();
        assert_eq!(r.len(), 1);
        assert!(matches!(
            parse(b"{ not json").unwrap_err(),
            ParseError::Container { format: "json", .. }
        ));
    }

    #[test]
    fn commented_document_keeps_url_strings() {
        let v = read_document(r#"{"url": "http://x//y", /* c */ "a": [1, 2,], // tail
        }"#)
        .unwrap();
        assert_eq!(v["url"], "http://x//y");
        assert_eq!(v["a"], serde_json::json!([1, 2]));
    }
}
