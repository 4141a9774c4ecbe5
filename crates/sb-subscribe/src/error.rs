//! Typed errors for every pipeline stage.
//!
//! Stage errors stay typed inside the crate; [`PipelineError`] is the
//! serializable form handed back to callers inside a `PipelineResult`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::model::{FormatHint, ProtocolKind, Stage};

#[derive(Debug, Error)]
pub enum FetchError {
    /// Raised when the fetcher is constructed, never deferred to fetch time.
    #[error("unsupported source scheme `{scheme}` in {location}")]
    UnsupportedScheme { scheme: String, location: String },

    #[error("failed to read {location}: {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error("fetching {location} timed out after {timeout:?}")]
    Timeout { location: String, timeout: Duration },

    #[error("connection to {location} failed: {message}")]
    Connect { location: String, message: String },

    #[error("{location} answered HTTP {status}")]
    Http { location: String, status: u16 },

    #[error("payload from {location} exceeds the {limit} byte limit")]
    TooLarge { location: String, limit: u64 },

    #[error("failed to build http client: {0}")]
    Client(String),
}

/// Container level decode failure. Per-entry problems become sentinel records instead.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("no decoder recognizes this payload (hint: {hint})")]
    NoDecoder { hint: FormatHint },

    #[error("{format} container is malformed: {message}")]
    Container {
        format: &'static str,
        message: String,
    },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("subscription payload is empty")]
    EmptyPayload,

    #[error("payload is not a recognizable container: {0}")]
    Unrecognized(String),

    #[error("{protocol} record has no address, tag or name to identify it")]
    MissingIdentifier { protocol: ProtocolKind },

    #[error("record `{tag}` is missing required field `{field}`")]
    MissingField { tag: String, field: &'static str },

    #[error("entry could not be decoded: {reason}")]
    InvalidRecord { reason: String },

    #[error("{protocol} record `{tag}` failed validation: {}", issues.join("; "))]
    Protocol {
        tag: String,
        protocol: ProtocolKind,
        issues: Vec<String>,
    },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unsupported export target `{0}`")]
    UnsupportedTarget(String),

    #[error("{protocol} outbound `{tag}` is missing mandatory field `{field}`")]
    MissingField {
        protocol: ProtocolKind,
        tag: String,
        field: &'static str,
    },

    #[error("invalid template: {0}")]
    Template(String),

    #[error("failed to render document: {0}")]
    Render(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("exclusion store {path} io error: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("exclusion store {path} is corrupt: {message}")]
    Corrupt { path: PathBuf, message: String },

    #[error("exclusion store {path} has schema version {found}, newer than supported {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("failed to serialize exclusion store: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Umbrella error for callers that drive stages directly.
#[derive(Debug, Error)]
pub enum SubsError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SubsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Fetch(_) => ErrorKind::Fetch,
            Self::Parse(_) => ErrorKind::Parse,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Export(_) => ErrorKind::Export,
            Self::Store(_) => ErrorKind::Store,
            Self::Config(_) => ErrorKind::Config,
        }
    }
}

impl From<regex::Error> for SubsError {
    fn from(e: regex::Error) -> Self {
        Self::Config(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Fetch,
    Parse,
    Validation,
    Export,
    Store,
    Config,
}

/// Structured, serializable error carried in a pipeline result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineError {
    pub kind: ErrorKind,
    pub stage: Stage,
    pub message: String,
    /// Display tag of the record concerned, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl PipelineError {
    pub fn new(kind: ErrorKind, stage: Stage, message: impl Into<String>) -> Self {
        Self {
            kind,
            stage,
            message: message.into(),
            tag: None,
        }
    }

    pub fn from_error(stage: Stage, err: &SubsError) -> Self {
        Self::new(err.kind(), stage, err.to_string())
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

impl From<(Stage, SubsError)> for PipelineError {
    fn from((stage, err): (Stage, SubsError)) -> Self {
        Self::from_error(stage, &err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_error_keeps_kind_and_stage() {
        let e = SubsError::from(FetchError::TooLarge {
            location: "https://x".into(),
            limit: 10,
        });
        let pe = PipelineError::from_error(Stage::Fetch, &e);
        assert_eq!(pe.kind, ErrorKind::Fetch);
        assert_eq!(pe.stage, Stage::Fetch);
        assert!(pe.message.contains("10 byte limit"));
    }

    #[test]
    fn protocol_validation_message_lists_issues() {
        let e = ValidationError::Protocol {
            tag: "a".into(),
            protocol: ProtocolKind::Shadowsocks,
            issues: vec!["missing password".into(), "bad method".into()],
        };
        assert_eq!(
            e.to_string(),
            "shadowsocks record `a` failed validation: missing password; bad method"
        );
    }

    #[test]
    fn serializes_snake_case() {
        let pe = PipelineError::new(ErrorKind::Validation, Stage::RecordValidation, "x")
            .with_tag("t");
        let v = serde_json::to_value(&pe).unwrap();
        assert_eq!(v["kind"], "validation");
        assert_eq!(v["stage"], "record_validation");
        assert_eq!(v["tag"], "t");
    }
}
