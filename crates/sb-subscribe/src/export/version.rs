//! sing-box version probe.
//!
//! Outbound syntax depends on the installed binary: from 1.11.0 on, DNS
//! hijacking and blocking are rule actions instead of special outbounds.

use std::fmt;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SingBoxVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SingBoxVersion {
    /// First release with rule-action syntax.
    pub const MODERN_SYNTAX: Self = Self::new(1, 11, 0);

    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse `sing-box version 1.11.4`, `v1.10.0-beta.3` or a bare `1.9`.
    pub fn parse(output: &str) -> Option<Self> {
        output
            .split_whitespace()
            .map(|w| w.trim_start_matches('v'))
            .find_map(Self::parse_token)
    }

    fn parse_token(tok: &str) -> Option<Self> {
        let core = tok.split(['-', '+']).next()?;
        let mut parts = core.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(major, minor, patch))
    }
}

impl fmt::Display for SingBoxVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Which outbound/route syntax to emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyntaxMode {
    /// `dns-out` / `block` outbounds referenced from rules.
    Legacy,
    /// `hijack-dns` / `reject` rule actions.
    Modern,
}

impl SyntaxMode {
    pub fn for_version(v: SingBoxVersion) -> Self {
        if v < SingBoxVersion::MODERN_SYNTAX {
            Self::Legacy
        } else {
            Self::Modern
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run `{bin} version`: {source}")]
    Spawn {
        bin: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{bin} version` exited with {status}")]
    Exit { bin: String, status: String },
    #[error("unrecognized version output: {0}")]
    Unparsable(String),
}

/// Asks the target binary for its version.
pub trait VersionProbe: Send + Sync + fmt::Debug {
    fn probe(&self) -> Result<SingBoxVersion, ProbeError>;
}

/// Runs `<bin> version`.
#[derive(Debug, Clone)]
pub struct CommandProbe {
    bin: String,
}

impl CommandProbe {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

impl VersionProbe for CommandProbe {
    fn probe(&self) -> Result<SingBoxVersion, ProbeError> {
        let out = Command::new(&self.bin)
            .arg("version")
            .output()
            .map_err(|source| ProbeError::Spawn {
                bin: self.bin.clone(),
                source,
            })?;
        if !out.status.success() {
            return Err(ProbeError::Exit {
                bin: self.bin.clone(),
                status: out.status.to_string(),
            });
        }
        let text = String::from_utf8_lossy(&out.stdout);
        let first = text.lines().next().unwrap_or_default();
        SingBoxVersion::parse(first).ok_or_else(|| ProbeError::Unparsable(first.to_string()))
    }
}

/// Fixed answer; `None` behaves like a missing binary.
#[derive(Debug, Clone, Copy)]
pub struct StaticProbe(pub Option<SingBoxVersion>);

impl VersionProbe for StaticProbe {
    fn probe(&self) -> Result<SingBoxVersion, ProbeError> {
        self.0
            .ok_or_else(|| ProbeError::Unparsable("no version configured".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_outputs() {
        assert_eq!(
            SingBoxVersion::parse("sing-box version 1.11.4"),
            Some(SingBoxVersion::new(1, 11, 4))
        );
        assert_eq!(
            SingBoxVersion::parse("sing-box version v1.10.0-beta.3"),
            Some(SingBoxVersion::new(1, 10, 0))
        );
        assert_eq!(SingBoxVersion::parse("1.9"), Some(SingBoxVersion::new(1, 9, 0)));
        assert_eq!(SingBoxVersion::parse("no digits here"), None);
    }

    #[test]
    fn threshold() {
        assert_eq!(
            SyntaxMode::for_version(SingBoxVersion::new(1, 10, 7)),
            SyntaxMode::Legacy
        );
        assert_eq!(
            SyntaxMode::for_version(SingBoxVersion::new(1, 11, 0)),
            SyntaxMode::Modern
        );
        assert_eq!(
            SyntaxMode::for_version(SingBoxVersion::new(2, 0, 0)),
            SyntaxMode::Modern
        );
    }

    #[test]
    fn missing_binary_is_spawn_error() {
        let p = CommandProbe::new("/nonexistent/sing-box-binary");
        assert!(matches!(p.probe(), Err(ProbeError::Spawn { .. })));
    }
}
