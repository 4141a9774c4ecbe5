use super::Middleware;
use crate::model::{
    EncryptionStrength, Enrichment, LatencyClass, Protocol, RunContext, SecurityLevel,
    ServerRecord,
};

/// Derived classification buckets plus a content id. Never touches identity fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct Enricher;

impl Enricher {
    pub fn classify(rec: &ServerRecord) -> Enrichment {
        Enrichment {
            server_id: Some(rec.content_id()),
            latency_class: Some(latency_class(rec)),
            security_level: Some(security_level(rec)),
            encryption_strength: Some(encryption_strength(rec)),
        }
    }
}

impl Middleware for Enricher {
    fn name(&self) -> &'static str {
        "enrichment"
    }

    /// Skips batches where every record is already enriched.
    fn can_process(&self, records: &[ServerRecord]) -> bool {
        records.iter().any(|r| r.enrichment.is_empty())
    }

    fn process(&self, records: &mut Vec<ServerRecord>, _ctx: &mut RunContext) {
        for rec in records.iter_mut().filter(|r| r.enrichment.is_empty()) {
            rec.enrichment = Self::classify(rec);
        }
    }
}

fn ss_2022(method: &str) -> bool {
    method.starts_with("2022-")
}

fn ss_stream(method: &str) -> bool {
    method.ends_with("-ctr")
        || method.ends_with("-cfb")
        || matches!(method, "rc4-md5" | "chacha20-ietf" | "xchacha20")
}

/// Extra hops (CDN transports, plugins) push the estimate up.
fn latency_class(rec: &ServerRecord) -> LatencyClass {
    let base = match &rec.protocol {
        Protocol::Tuic(_) | Protocol::Hysteria2(_) | Protocol::Wireguard(_) => 0,
        _ => 1,
    };
    let layered = rec.protocol.transport().is_some()
        || matches!(&rec.protocol, Protocol::Shadowsocks(o) if o.plugin.as_deref().is_some_and(|p| !p.is_empty()));
    match base + usize::from(layered) {
        0 => LatencyClass::Low,
        1 => LatencyClass::Medium,
        _ => LatencyClass::High,
    }
}

fn security_level(rec: &ServerRecord) -> SecurityLevel {
    let tls = rec.protocol.tls().filter(|t| t.enabled);
    if tls.is_some_and(|t| t.insecure == Some(true)) {
        return SecurityLevel::Low;
    }
    match &rec.protocol {
        Protocol::Wireguard(_) => SecurityLevel::High,
        Protocol::Shadowsocks(o) if ss_2022(&o.method) => SecurityLevel::High,
        Protocol::Shadowsocks(o) if ss_stream(&o.method) || o.method == "none" => {
            SecurityLevel::Low
        }
        Protocol::Shadowsocks(_) => SecurityLevel::Medium,
        Protocol::Vmess(o) if o.alter_id.as_ref().and_then(|a| a.as_u64()).unwrap_or(0) > 0 => {
            SecurityLevel::Low
        }
        Protocol::Http(_) | Protocol::Socks(_) if tls.is_none() => SecurityLevel::Low,
        _ if tls.is_some_and(|t| t.reality.is_some()) => SecurityLevel::High,
        Protocol::Tuic(_) | Protocol::Hysteria2(_) => SecurityLevel::High,
        _ if tls.is_some() => SecurityLevel::Medium,
        _ => SecurityLevel::Low,
    }
}

fn encryption_strength(rec: &ServerRecord) -> EncryptionStrength {
    let tls = rec.protocol.tls().is_some_and(|t| t.enabled);
    match &rec.protocol {
        Protocol::Wireguard(_) => EncryptionStrength::Strong,
        Protocol::Shadowsocks(o) => match o.method.as_str() {
            "none" | "plain" => EncryptionStrength::None,
            m if ss_2022(m) => EncryptionStrength::Strong,
            m if ss_stream(m) => EncryptionStrength::Weak,
            _ => EncryptionStrength::Standard,
        },
        Protocol::Vmess(o) => match o.security.as_str() {
            "none" | "zero" if !tls => EncryptionStrength::None,
            "aes-128-ctr" => EncryptionStrength::Weak,
            _ => EncryptionStrength::Standard,
        },
        Protocol::Http(_) | Protocol::Socks(_) | Protocol::Vless(_) | Protocol::Trojan(_)
            if !tls =>
        {
            EncryptionStrength::None
        }
        _ if rec.protocol.tls().is_some_and(|t| t.reality.is_some()) => {
            EncryptionStrength::Strong
        }
        Protocol::Invalid(_) => EncryptionStrength::None,
        _ => EncryptionStrength::Standard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        RealityOptions, Scalar, ShadowsocksOpts, TlsOptions, Transport, VlessOpts, VmessOpts,
    };

    fn ss(method: &str) -> ServerRecord {
        ServerRecord::new(
            Protocol::Shadowsocks(ShadowsocksOpts {
                method: method.into(),
                password: "pw".into(),
                ..Default::default()
            }),
            "1.1.1.1",
            8388,
        )
        .with_tag("s")
    }

    #[test]
    fn buckets() {
        let e = Enricher::classify(&ss("2022-blake3-aes-256-gcm"));
        assert_eq!(e.encryption_strength, Some(EncryptionStrength::Strong));
        assert_eq!(e.security_level, Some(SecurityLevel::High));
        assert_eq!(e.latency_class, Some(LatencyClass::Medium));
        assert_eq!(e.server_id.as_deref().map(str::len), Some(12));

        let e = Enricher::classify(&ss("rc4-md5"));
        assert_eq!(e.encryption_strength, Some(EncryptionStrength::Weak));
        assert_eq!(e.security_level, Some(SecurityLevel::Low));

        let reality = ServerRecord::new(
            Protocol::Vless(VlessOpts {
                uuid: "u".into(),
                tls: Some(TlsOptions {
                    enabled: true,
                    reality: Some(RealityOptions {
                        public_key: "k".into(),
                        short_id: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            "h",
            443,
        );
        let e = Enricher::classify(&reality);
        assert_eq!(e.security_level, Some(SecurityLevel::High));
        assert_eq!(e.encryption_strength, Some(EncryptionStrength::Strong));

        let legacy = ServerRecord::new(
            Protocol::Vmess(VmessOpts {
                uuid: "u".into(),
                security: "auto".into(),
                alter_id: Some(Scalar::Int(64)),
                transport: Some(Transport::Grpc { service_name: None }),
                ..Default::default()
            }),
            "h",
            443,
        );
        let e = Enricher::classify(&legacy);
        assert_eq!(e.security_level, Some(SecurityLevel::Low));
        assert_eq!(e.latency_class, Some(LatencyClass::High));
    }

    #[test]
    fn identity_is_untouched() {
        let mut records = vec![ss("aes-256-gcm")];
        let before = records[0].identity();
        let mut ctx = RunContext::tolerant();
        assert!(Enricher.can_process(&records));
        Enricher.process(&mut records, &mut ctx);
        assert_eq!(records[0].identity(), before);
        assert!(!Enricher.can_process(&records));
    }
}
