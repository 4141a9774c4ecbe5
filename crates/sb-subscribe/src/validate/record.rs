use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::RepairPolicy;
use crate::error::ValidationError;
use crate::model::{Protocol, RunContext, ServerRecord, Stage, TlsOptions};
use crate::parse::b64;

const SS_METHODS: &[&str] = &[
    "none",
    "plain",
    "aes-128-gcm",
    "aes-192-gcm",
    "aes-256-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
    "aes-128-ctr",
    "aes-192-ctr",
    "aes-256-ctr",
    "aes-128-cfb",
    "aes-192-cfb",
    "aes-256-cfb",
    "rc4-md5",
    "chacha20-ietf",
    "xchacha20",
];

const VMESS_SECURITY: &[&str] = &[
    "auto",
    "none",
    "zero",
    "aes-128-gcm",
    "chacha20-poly1305",
    "aes-128-ctr",
];

const VLESS_FLOWS: &[&str] = &["xtls-rprx-vision", "xtls-rprx-vision-udp443"];

fn uuid_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}$")
            .ok()
    })
    .as_ref()
}

/// Structural requirements every record shares.
pub fn check_required(rec: &ServerRecord) -> Result<(), ValidationError> {
    if let Protocol::Invalid(e) = &rec.protocol {
        return Err(ValidationError::InvalidRecord {
            reason: e.reason.clone(),
        });
    }
    if rec.port == 0 {
        return Err(ValidationError::MissingField {
            tag: rec.tag.clone(),
            field: "port",
        });
    }
    if rec.address.trim().is_empty() {
        return Err(ValidationError::MissingIdentifier {
            protocol: rec.kind(),
        });
    }
    Ok(())
}

/// Protocol specific mandatory fields. Empty means the record is fine.
pub fn check_protocol(rec: &ServerRecord) -> Vec<String> {
    let mut issues = Vec::new();
    let blank = |s: &str| s.trim().is_empty();
    match &rec.protocol {
        Protocol::Shadowsocks(o) => {
            if blank(&o.method) {
                issues.push("missing cipher method".to_string());
            } else if !SS_METHODS.contains(&o.method.to_ascii_lowercase().as_str()) {
                issues.push(format!("unsupported cipher method `{}`", o.method));
            }
            if blank(&o.password) && o.method != "none" && o.method != "plain" {
                issues.push("missing password".into());
            }
        }
        Protocol::Vmess(o) => {
            check_uuid(&o.uuid, &mut issues);
            if !VMESS_SECURITY.contains(&o.security.as_str()) {
                issues.push(format!("unsupported vmess security `{}`", o.security));
            }
            check_tls(o.tls.as_ref(), &mut issues);
        }
        Protocol::Vless(o) => {
            check_uuid(&o.uuid, &mut issues);
            if let Some(flow) = o.flow.as_deref().filter(|f| !blank(*f)) {
                if !VLESS_FLOWS.contains(&flow) {
                    issues.push(format!("unsupported vless flow `{flow}`"));
                }
            }
            check_tls(o.tls.as_ref(), &mut issues);
        }
        Protocol::Trojan(o) => {
            if blank(&o.password) {
                issues.push("missing password".into());
            }
            check_tls(o.tls.as_ref(), &mut issues);
        }
        Protocol::Tuic(o) => {
            check_uuid(&o.uuid, &mut issues);
            if blank(&o.password) {
                issues.push("missing password".into());
            }
        }
        Protocol::Hysteria2(o) => {
            if blank(&o.password) {
                issues.push("missing password".into());
            }
            if o.obfs.as_deref().is_some_and(|s| !blank(s))
                && o.obfs_password.as_deref().map_or(true, blank)
            {
                issues.push("obfs enabled without obfs password".into());
            }
        }
        Protocol::Wireguard(o) => {
            check_wg_key("private key", &o.private_key, &mut issues);
            check_wg_key("peer public key", &o.peer_public_key, &mut issues);
            if let Some(psk) = o.pre_shared_key.as_deref().filter(|k| !blank(*k)) {
                check_wg_key("pre-shared key", psk, &mut issues);
            }
            if o.local_address.is_empty() {
                issues.push("missing local address".into());
            }
            if o.reserved.as_ref().is_some_and(|r| r.len() != 3) {
                issues.push("reserved must be exactly 3 bytes".into());
            }
        }
        Protocol::Http(o) | Protocol::Socks(o) => {
            if o.password.is_some() && o.username.is_none() {
                issues.push("password given without username".into());
            }
        }
        Protocol::Invalid(e) => issues.push(e.reason.clone()),
    }
    issues
}

fn check_uuid(uuid: &str, issues: &mut Vec<String>) {
    if uuid.trim().is_empty() {
        issues.push("missing uuid".into());
    } else if uuid_re().is_some_and(|re| !re.is_match(uuid.trim())) {
        issues.push(format!("malformed uuid `{uuid}`"));
    }
}

fn check_tls(tls: Option<&TlsOptions>, issues: &mut Vec<String>) {
    let Some(t) = tls else { return };
    if let Some(r) = &t.reality {
        if r.public_key.trim().is_empty() {
            issues.push("reality enabled without public key".into());
        }
        if !t.enabled {
            issues.push("reality requires tls".into());
        }
    }
}

/// WireGuard keys are 32 raw bytes in base64.
fn check_wg_key(what: &str, key: &str, issues: &mut Vec<String>) {
    if key.trim().is_empty() {
        issues.push(format!("missing {what}"));
        return;
    }
    match b64::decode_auto(key) {
        Some(bytes) if bytes.len() == 32 => {}
        _ => issues.push(format!("{what} is not a 32 byte base64 key")),
    }
}

/// Records that passed the record stage, plus the ones dropped on the way.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub records: Vec<ServerRecord>,
    /// Reason for every discarded record, with its tag (or raw text) when known.
    pub discarded: Vec<(Option<String>, ValidationError)>,
    pub repaired: usize,
    pub annotated: usize,
}

/// Record-stage validator driven by a [`RepairPolicy`].
#[derive(Debug, Clone)]
pub struct RecordValidator {
    policy: RepairPolicy,
}

impl RecordValidator {
    pub fn new(policy: RepairPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RepairPolicy {
        &self.policy
    }

    /// Validate a batch. Under a strict policy the first violation is returned as `Err`.
    pub fn validate(
        &self,
        records: Vec<ServerRecord>,
        ctx: &mut RunContext,
    ) -> Result<ValidationReport, ValidationError> {
        let mut report = ValidationReport::default();
        for mut rec in records {
            match check_required(&rec) {
                Ok(()) => {}
                Err(ValidationError::MissingIdentifier { protocol }) => {
                    match self.policy.repair_identifier(&rec) {
                        Some((rule, value)) => {
                            let msg = format!(
                                "address missing, repaired via {} to `{value}`",
                                rule.as_str()
                            );
                            warn!(protocol = %protocol, rule = rule.as_str(), "{msg}");
                            ctx.warn_for(Stage::RecordValidation, &rec.tag, msg);
                            rec.address = value;
                            report.repaired += 1;
                        }
                        None => return Err(ValidationError::MissingIdentifier { protocol }),
                    }
                }
                Err(e) if self.policy.discards_unusable() => {
                    let who = label(&rec);
                    warn!(record = %who, error = %e, "record discarded");
                    ctx.warn_for(Stage::RecordValidation, &who, format!("discarded: {e}"));
                    report.discarded.push((Some(who), e));
                    continue;
                }
                Err(e) => return Err(e),
            }

            let issues = check_protocol(&rec);
            if !issues.is_empty() {
                if !self.policy.annotates_protocol_issues() {
                    return Err(ValidationError::Protocol {
                        tag: rec.tag.clone(),
                        protocol: rec.kind(),
                        issues,
                    });
                }
                debug!(tag = %rec.tag, issues = ?issues, "record annotated");
                ctx.warn_for(
                    Stage::RecordValidation,
                    &rec.tag,
                    format!("{} validation: {}", rec.kind(), issues.join("; ")),
                );
                rec.issues.extend(issues);
                report.annotated += 1;
            }
            report.records.push(rec);
        }
        Ok(report)
    }
}

fn label(rec: &ServerRecord) -> String {
    match &rec.protocol {
        Protocol::Invalid(e) if rec.tag.is_empty() => e.raw.clone(),
        _ => rec.tag.clone(),
    }
}
