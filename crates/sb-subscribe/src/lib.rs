//! Subscription ingestion pipeline.
//!
//! 订阅处理流水线：拉取、识别格式、解析、校验、中间件、后处理、排除、导出。
//!
//! Callers build a [`SourceDescriptor`] and a [`RunContext`], then call
//! [`run`] for records or [`export`] for a client configuration document.
//! Both entry points configure themselves from the environment; use
//! [`SubscriptionManager`] directly to keep its result cache across calls.

pub mod config;
pub mod error;
pub mod exclusions;
pub mod export;
pub mod fetch;
pub mod manager;
pub mod middleware;
pub mod model;
pub mod parse;
pub mod postprocess;
pub mod util;
pub mod validate;

pub use config::SubsConfig;
pub use error::{
    ErrorKind, ExportError, FetchError, ParseError, PipelineError, StoreError, SubsError,
    ValidationError,
};
pub use exclusions::{ExclusionEntry, ExclusionRegistry, ExclusionStore, SharedStore};
pub use export::{ExportManager, ExportOptions, ExportTarget};
pub use manager::SubscriptionManager;
pub use model::{
    FormatHint, Mode, PipelineResult, Protocol, ProtocolKind, RunContext, ServerRecord,
    SourceDescriptor, Stage,
};

use serde_json::Value;

fn configured() -> Result<SubscriptionManager, PipelineResult> {
    SubscriptionManager::from_env().map_err(|e| {
        PipelineResult::failed(vec![PipelineError::from_error(Stage::Fetch, &e)], Vec::new())
    })
}

/// Process one subscription into records.
pub fn run(source: &SourceDescriptor, ctx: &mut RunContext) -> PipelineResult {
    match configured() {
        Ok(mut m) => m.run(source, ctx),
        Err(failed) => failed,
    }
}

/// Process one subscription and export it for `target`.
pub fn export(
    source: &SourceDescriptor,
    exclusions: &[String],
    extra_routes: &[Value],
    ctx: &mut RunContext,
    target: ExportTarget,
    skip_version_check: bool,
) -> PipelineResult {
    match configured() {
        Ok(mut m) => m.export(source, exclusions, extra_routes, ctx, target, skip_version_check),
        Err(failed) => failed,
    }
}
