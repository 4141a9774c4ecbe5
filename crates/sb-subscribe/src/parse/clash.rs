//! Clash / mihomo YAML: only the `proxies` sequence is read.

use serde::Deserialize;
use serde_json::Value;

use super::fields::{self, Obj};
use super::EntryError;
use crate::error::ParseError;
use crate::model::{
    Hysteria2Opts, Protocol, ProxyAuthOpts, RealityOptions, ServerRecord, ShadowsocksOpts,
    TlsOptions, Transport, TrojanOpts, TuicOpts, VlessOpts, VmessOpts, WireguardOpts,
};

#[derive(Deserialize)]
struct ClashDoc {
    #[serde(default)]
    proxies: Vec<serde_yaml::Value>,
}

/// Cheap sniff: a top-level `proxies:` key.
pub fn looks_like_clash(text: &str) -> bool {
    text.lines().any(|l| l.starts_with("proxies:"))
}

pub fn parse(raw: &[u8]) -> Result<Vec<ServerRecord>, ParseError> {
    let text = String::from_utf8_lossy(raw);
    let doc: ClashDoc = serde_yaml::from_str(&text).map_err(|e| ParseError::Container {
        format: "clash",
        message: e.to_string(),
    })?;
    Ok(doc
        .proxies
        .iter()
        .map(|y| {
            let v = serde_json::to_value(y)
                .map_err(|e| EntryError::Malformed(format!("unsupported yaml value: {e}")));
            v.and_then(|v| proxy_to_record(&v)).unwrap_or_else(|e| {
                let raw = serde_yaml::to_string(y).unwrap_or_default();
                ServerRecord::invalid(raw.trim(), e.to_string())
            })
        })
        .collect())
}

/// Map one Clash proxy mapping onto a record.
pub fn proxy_to_record(v: &Value) -> Result<ServerRecord, EntryError> {
    let obj = v
        .as_object()
        .ok_or_else(|| EntryError::Malformed("proxy entry is not a mapping".into()))?;
    let ty = fields::non_empty(obj, &["type"]).ok_or(EntryError::Missing("type"))?;

    let protocol = match ty.to_ascii_lowercase().as_str() {
        "ss" => {
            let plugin_opts = obj.get("plugin-opts").and_then(Value::as_object).map(plugin_opts);
            Protocol::Shadowsocks(ShadowsocksOpts {
                method: fields::text(obj, &["cipher"]).unwrap_or_default(),
                password: fields::text(obj, &["password"]).unwrap_or_default(),
                plugin: fields::text(obj, &["plugin"]),
                plugin_opts,
                udp_over_tcp: fields::scalar(obj, &["udp-over-tcp"]),
            })
        }
        "vmess" => Protocol::Vmess(VmessOpts {
            uuid: fields::text(obj, &["uuid"]).unwrap_or_default(),
            security: fields::non_empty(obj, &["cipher"]).unwrap_or_else(|| "auto".into()),
            alter_id: fields::scalar(obj, &["alterId", "alter-id"]),
            packet_encoding: fields::text(obj, &["packet-encoding"]),
            tls: stream_tls(obj),
            transport: transport(obj),
        }),
        "vless" => Protocol::Vless(VlessOpts {
            uuid: fields::text(obj, &["uuid"]).unwrap_or_default(),
            flow: fields::text(obj, &["flow"]),
            packet_encoding: fields::text(obj, &["packet-encoding"]),
            tls: stream_tls(obj),
            transport: transport(obj),
        }),
        "trojan" => Protocol::Trojan(TrojanOpts {
            password: fields::text(obj, &["password"]).unwrap_or_default(),
            tls: Some(tls(obj)),
            transport: transport(obj),
        }),
        "tuic" => Protocol::Tuic(TuicOpts {
            uuid: fields::text(obj, &["uuid"]).unwrap_or_default(),
            password: fields::text(obj, &["password"]).unwrap_or_default(),
            congestion_control: fields::text(obj, &["congestion-controller"]),
            udp_relay_mode: fields::text(obj, &["udp-relay-mode"]),
            zero_rtt_handshake: fields::scalar(obj, &["reduce-rtt"]),
            heartbeat: fields::scalar(obj, &["heartbeat-interval"]),
            tls: Some(tls(obj)),
        }),
        "hysteria2" | "hy2" => Protocol::Hysteria2(Hysteria2Opts {
            password: fields::text(obj, &["password", "auth"]).unwrap_or_default(),
            obfs: fields::text(obj, &["obfs"]),
            obfs_password: fields::text(obj, &["obfs-password"]),
            up_mbps: fields::scalar(obj, &["up"]),
            down_mbps: fields::scalar(obj, &["down"]),
            tls: Some(tls(obj)),
        }),
        "wireguard" | "wg" => {
            let mut local_address = fields::list(obj, &["ip"]);
            local_address.extend(fields::list(obj, &["ipv6"]));
            Protocol::Wireguard(WireguardOpts {
                private_key: fields::text(obj, &["private-key"]).unwrap_or_default(),
                peer_public_key: fields::text(obj, &["public-key"]).unwrap_or_default(),
                local_address,
                pre_shared_key: fields::text(obj, &["pre-shared-key"]),
                reserved: fields::reserved(obj, &["reserved"])?,
                mtu: fields::scalar(obj, &["mtu"]),
                keepalive: fields::scalar(obj, &["persistent-keepalive"]),
            })
        }
        "http" => Protocol::Http(auth(obj)),
        "socks5" | "socks" => Protocol::Socks(auth(obj)),
        other => return Err(EntryError::UnsupportedType(other.to_string())),
    };

    let mut rec = ServerRecord::new(
        protocol,
        fields::text(obj, &["server"]).unwrap_or_default(),
        fields::port(obj, &["port"])?,
    );
    if let Some(name) = fields::non_empty(obj, &["name"]) {
        rec = rec.with_tag(name);
    }
    Ok(rec)
}

fn auth(obj: &Obj) -> ProxyAuthOpts {
    ProxyAuthOpts {
        username: fields::text(obj, &["username"]),
        password: fields::text(obj, &["password"]),
        tls: fields::flag(obj, &["tls"])
            .unwrap_or(false)
            .then(|| tls(obj)),
    }
}

/// vmess/vless only carry TLS when `tls: true` or reality is configured.
fn stream_tls(obj: &Obj) -> Option<TlsOptions> {
    let on = fields::flag(obj, &["tls"]).unwrap_or(false) || obj.contains_key("reality-opts");
    on.then(|| tls(obj))
}

fn tls(obj: &Obj) -> TlsOptions {
    TlsOptions {
        enabled: true,
        server_name: fields::text(obj, &["sni", "servername"]),
        insecure: fields::flag(obj, &["skip-cert-verify"]),
        alpn: fields::list(obj, &["alpn"]),
        fingerprint: fields::text(obj, &["client-fingerprint", "fingerprint"]),
        reality: fields::object(obj, "reality-opts").and_then(|r| {
            Some(RealityOptions {
                public_key: fields::non_empty(r, &["public-key"])?,
                short_id: fields::text(r, &["short-id"]),
            })
        }),
    }
}

fn transport(obj: &Obj) -> Option<Transport> {
    let network = fields::non_empty(obj, &["network"])?;
    match network.as_str() {
        "ws" => {
            let o = fields::object(obj, "ws-opts");
            Some(Transport::Ws {
                path: o.and_then(|o| fields::text(o, &["path"])),
                host: o
                    .and_then(|o| fields::object(o, "headers"))
                    .and_then(|h| fields::text(h, &["Host", "host"])),
            })
        }
        "grpc" => Some(Transport::Grpc {
            service_name: fields::object(obj, "grpc-opts")
                .and_then(|o| fields::text(o, &["grpc-service-name"])),
        }),
        "h2" | "http" => {
            let o = fields::object(obj, "h2-opts").or_else(|| fields::object(obj, "http-opts"));
            Some(Transport::Http {
                path: o.and_then(|o| {
                    fields::list(o, &["path"])
                        .into_iter()
                        .next()
                        .or_else(|| fields::text(o, &["path"]))
                }),
                host: o.map(|o| fields::list(o, &["host"])).unwrap_or_default(),
            })
        }
        other => Transport::from_parts(other, None, None, None),
    }
}

/// `{mode: websocket, host: x}` → `mode=websocket;host=x`
fn plugin_opts(o: &Obj) -> String {
    o.keys()
        .filter_map(|k| fields::text(o, &[k.as_str()]).map(|v| format!("{k}={v}")))
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ProtocolKind, Scalar};

    const DOC: &str = r#"
port: 7890
proxies:
  - name: "HK 01"
    type: ss
    server: hk.example.com
    port: 8388
    cipher: aes-256-gcm
    password: "pw"
    plugin: obfs
    plugin-opts: { mode: http, host: bing.com }
  - { name: vm, type: vmess, server: 1.1.1.1, port: 443, uuid: u, alterId: 0, cipher: auto,
      tls: true, network: ws, ws-opts: { path: /ray, headers: { Host: cdn.example.com } } }
  - { name: re, type: vless, server: 2.2.2.2, port: 443, uuid: u2, flow: xtls-rprx-vision,
      reality-opts: { public-key: pbk, short-id: "01" }, client-fingerprint: chrome }
  - { name: wg, type: wireguard, server: 3.3.3.3, port: 51820, private-key: k, public-key: p,
      ip: 172.16.0.2/32, mtu: 0, reserved: [0, 0, 0] }
  - { name: weird, type: snell, server: 4.4.4.4, port: 1 }
rules:
  - MATCH,DIRECT
"#;

    #[test]
    fn sniff() {
        assert!(looks_like_clash(DOC));
        assert!(!looks_like_clash("ss://abc@1.1.1.1:1"));
    }

    #[test]
    fn maps_proxies() {
        let records = parse(DOC.as_bytes()).unwrap();
        assert_eq!(records.len(), 5);
        assert_eq!(records[0].tag, "HK 01");
        let Protocol::Shadowsocks(ss) = &records[0].protocol else { panic!() };
        assert_eq!(ss.plugin_opts.as_deref(), Some("host=bing.com;mode=http"));

        let Protocol::Vmess(vm) = &records[1].protocol else { panic!() };
        assert_eq!(vm.alter_id, Some(Scalar::Int(0)));
        assert_eq!(vm.transport.as_ref().map(Transport::kind), Some("ws"));

        let Protocol::Vless(vl) = &records[2].protocol else { panic!() };
        let tls = vl.tls.as_ref().unwrap();
        assert_eq!(tls.reality.as_ref().unwrap().short_id.as_deref(), Some("01"));

        let Protocol::Wireguard(wg) = &records[3].protocol else { panic!() };
        assert_eq!(wg.mtu, Some(Scalar::Int(0)));
        assert_eq!(wg.reserved, Some(vec![0, 0, 0]));

        assert_eq!(records[4].kind(), ProtocolKind::Invalid);
    }

    #[test]
    fn malformed_yaml_is_container_error() {
        let err = parse(b"proxies: [ { name: a").unwrap_err();
        assert!(matches!(err, ParseError::Container { format: "clash", .. }));
    }
}
