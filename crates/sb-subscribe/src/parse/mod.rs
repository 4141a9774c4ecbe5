//! Format detection and decoders.
//!
//! [`detect`] picks a [`Parser`] from the declared hint or by sniffing the
//! payload. Every parser returns one record per entry: entries that fail to
//! decode come back as `invalid` sentinels carrying the reason, so one broken
//! line never costs the rest of the batch.

pub mod b64;
#[cfg(feature = "subs_clash")]
pub mod clash;
mod fields;
pub mod singbox;
pub mod uri;

use thiserror::Error;
use tracing::debug;

use crate::error::ParseError;
use crate::model::{FormatHint, ServerRecord};

/// Why a single entry could not be decoded. Becomes the sentinel's diagnostic.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntryError {
    #[error("unsupported scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("unsupported outbound type `{0}`")]
    UnsupportedType(String),
    #[error("line is not a proxy URI")]
    NotUri,
    #[error("base64 decoding failed for {0}")]
    Base64(&'static str),
    #[error("json decoding failed: {0}")]
    Json(String),
    #[error("percent-decoding failed for {0}")]
    Percent(&'static str),
    #[error("missing {0}")]
    Missing(&'static str),
    #[error("invalid port `{0}`")]
    Port(String),
    #[error("{0}")]
    Malformed(String),
}

/// Compile-time registry of decoders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parser {
    Base64,
    UriList,
    SingBoxJson,
    #[cfg(feature = "subs_clash")]
    Clash,
}

impl Parser {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Base64 => "base64",
            Self::UriList => "uri_list",
            Self::SingBoxJson => "json",
            #[cfg(feature = "subs_clash")]
            Self::Clash => "clash",
        }
    }

    /// Parser for an explicit hint; `None` for `auto` (or a compiled-out format).
    pub fn for_hint(hint: FormatHint) -> Option<Self> {
        match hint {
            FormatHint::Auto => None,
            FormatHint::Base64 => Some(Self::Base64),
            FormatHint::UriList => Some(Self::UriList),
            FormatHint::Json => Some(Self::SingBoxJson),
            #[cfg(feature = "subs_clash")]
            FormatHint::Clash => Some(Self::Clash),
            #[cfg(not(feature = "subs_clash"))]
            FormatHint::Clash => None,
        }
    }

    /// Decode one subscription body. Only container-level failure is an error.
    pub fn parse(&self, raw: &[u8]) -> Result<Vec<ServerRecord>, ParseError> {
        let records = match self {
            Self::Base64 => {
                let text = String::from_utf8_lossy(raw);
                let decoded = b64::decode_text(strip_bom(&text)).ok_or_else(|| {
                    ParseError::Container {
                        format: "base64",
                        message: "body is not valid base64 text".into(),
                    }
                })?;
                parse_lines(&decoded)
            }
            Self::UriList => parse_lines(&String::from_utf8_lossy(raw)),
            Self::SingBoxJson => singbox::parse(raw)?,
            #[cfg(feature = "subs_clash")]
            Self::Clash => clash::parse(raw)?,
        };
        debug!(
            parser = self.name(),
            records = records.len(),
            invalid = records.iter().filter(|r| r.is_invalid()).count(),
            "subscription decoded"
        );
        Ok(records)
    }
}

/// Choose a decoder: the declared hint first, then content sniffing.
pub fn detect(raw: &[u8], hint: FormatHint) -> Result<Parser, ParseError> {
    if let Some(p) = Parser::for_hint(hint) {
        return Ok(p);
    }
    if hint != FormatHint::Auto {
        return Err(ParseError::NoDecoder { hint });
    }

    let text = String::from_utf8_lossy(raw);
    let t = strip_bom(&text).trim();

    if let Ok(v) = singbox::read_document(t) {
        if v.is_array() || v.get("outbounds").is_some_and(|o| o.is_array()) {
            return Ok(Parser::SingBoxJson);
        }
    }
    #[cfg(feature = "subs_clash")]
    if clash::looks_like_clash(t) {
        return Ok(Parser::Clash);
    }
    if t.lines().any(|l| uri::has_known_scheme(l.trim())) {
        return Ok(Parser::UriList);
    }
    if let Some(decoded) = b64::decode_text(t) {
        if decoded.lines().any(|l| uri::has_known_scheme(l.trim())) {
            return Ok(Parser::Base64);
        }
    }
    Err(ParseError::NoDecoder { hint })
}

fn strip_bom(s: &str) -> &str {
    s.strip_prefix('\u{feff}').unwrap_or(s)
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("//") || line.starts_with(';')
}

/// One record per non-empty, non-comment line.
fn parse_lines(text: &str) -> Vec<ServerRecord> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !is_comment(l))
        .map(uri::parse_line)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;

    const SS: &str = "ss://YWVzLTI1Ni1nY206dGVzdA==@1.2.3.4:8388#TestNode";
    const TROJAN: &str = "trojan://password123@server.com:443?sni=example.com#MyTrojan";

    #[test]
    fn hint_wins_over_sniffing() {
        assert_eq!(detect(b"whatever", FormatHint::UriList).unwrap(), Parser::UriList);
        assert_eq!(detect(b"{}", FormatHint::Base64).unwrap(), Parser::Base64);
    }

    #[test]
    fn sniffs_singbox_json() {
        let j = br#"{ "outbounds": [ { "type": "direct", "tag": "direct" } ] }"#;
        assert_eq!(detect(j, FormatHint::Auto).unwrap(), Parser::SingBoxJson);
        let commented = b"// exported\n{ \"outbounds\": [], }";
        assert_eq!(detect(commented, FormatHint::Auto).unwrap(), Parser::SingBoxJson);
    }

    #[test]
    fn sniffs_plain_and_base64_uri_lists() {
        let plain = format!("{SS}\n{TROJAN}\n");
        assert_eq!(detect(plain.as_bytes(), FormatHint::Auto).unwrap(), Parser::UriList);
        let wrapped = base64::engine::general_purpose::STANDARD.encode(plain);
        assert_eq!(detect(wrapped.as_bytes(), FormatHint::Auto).unwrap(), Parser::Base64);
    }

    #[cfg(feature = "subs_clash")]
    #[test]
    fn sniffs_clash() {
        let y = "port: 7890\nproxies:\n  - { name: a, type: ss, server: 1.1.1.1, port: 1 }\n";
        assert_eq!(detect(y.as_bytes(), FormatHint::Auto).unwrap(), Parser::Clash);
    }

    #[test]
    fn unknown_payload_has_no_decoder() {
        let err = detect(b"<html>nope</html>", FormatHint::Auto).unwrap_err();
        assert!(matches!(err, ParseError::NoDecoder { .. }));
        // a JSON object without outbounds is not a subscription either
        assert!(detect(br#"{"status":"ok"}"#, FormatHint::Auto).is_err());
    }

    #[test]
    fn malformed_lines_become_sentinels() {
        let body = format!("{SS}\nvmess://!!!notbase64\n\n# comment\n{TROJAN}\nhello world\n");
        let records = Parser::UriList.parse(body.as_bytes()).unwrap();
        assert_eq!(records.len(), 4);
        let invalid: Vec<_> = records.iter().filter(|r| r.is_invalid()).collect();
        assert_eq!(invalid.len(), 2);
        assert!(invalid.iter().all(|r| !r.diagnostic().unwrap_or("").is_empty()));
        assert_eq!(records[0].tag, "TestNode");
        assert_eq!(records[2].tag, "MyTrojan");
    }

    #[test]
    fn base64_container_failure_is_parse_error() {
        let err = Parser::Base64.parse(b"***not base64***").unwrap_err();
        assert!(matches!(err, ParseError::Container { format: "base64", .. }));
    }
}
