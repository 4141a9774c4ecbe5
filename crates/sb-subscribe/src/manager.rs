//! Subscription orchestrator.
//!
//! 订阅编排器：按顺序驱动 fetch → 校验 → 解析 → 中间件 → 后处理 → 排除 → 导出，
//! 并在实例内缓存结果。
//!
//! [`SubscriptionManager`] is the only component that knows the whole stage
//! order. Results are cached per instance, keyed by everything that can change
//! the outcome; failed fetches are never cached. The cache holds at most
//! `cache_entries` results and evicts the oldest first; a source's fetcher goes
//! with its last cached result.

use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SubsConfig;
use crate::error::{ErrorKind, PipelineError, SubsError};
use crate::exclusions::{ExclusionStore, SharedStore};
use crate::export::{ExportManager, ExportOptions, ExportTarget, VersionProbe};
use crate::fetch::Fetcher;
use crate::middleware::MiddlewareChain;
use crate::model::{PipelineResult, RunContext, ServerRecord, SourceDescriptor, Stage};
use crate::parse;
use crate::postprocess::PostProcessorChain;
use crate::validate::{validate_raw, RecordValidator, RepairPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    source: SourceDescriptor,
    exclusions: Vec<String>,
    routes: String,
    signature: String,
    store: Option<Vec<String>>,
    export: Option<(ExportTarget, bool, bool, String)>,
}

/// Outcome of the stages before export: records plus non-fatal errors, or the
/// errors that aborted the run.
type StageOutcome = Result<(Vec<ServerRecord>, Vec<PipelineError>), Vec<PipelineError>>;

#[derive(Debug)]
pub struct SubscriptionManager {
    config: SubsConfig,
    middleware: MiddlewareChain,
    postprocess: PostProcessorChain,
    exclusions: Option<SharedStore>,
    exporter: ExportManager,
    fetchers: HashMap<SourceDescriptor, Fetcher>,
    cache: HashMap<CacheKey, (u64, PipelineResult)>,
    seq: u64,
}

impl SubscriptionManager {
    /// Build the chains from `config`. Only bad filter patterns fail here.
    pub fn new(config: SubsConfig) -> Result<Self, SubsError> {
        let middleware = MiddlewareChain::from_config(&config.middleware)?;
        let postprocess = PostProcessorChain::from_config(&config.postprocess)?;
        let exclusions = config
            .exclusions_path
            .as_ref()
            .map(|p| Arc::new(parking_lot::Mutex::new(ExclusionStore::new(p.clone()))));
        let exporter = ExportManager::from_config(&config.export);
        Ok(Self {
            config,
            middleware,
            postprocess,
            exclusions,
            exporter,
            fetchers: HashMap::new(),
            cache: HashMap::new(),
            seq: 0,
        })
    }

    pub fn from_env() -> Result<Self, SubsError> {
        Self::new(SubsConfig::from_env())
    }

    pub fn config(&self) -> &SubsConfig {
        &self.config
    }

    /// Use a shared store handle, e.g. one handed out by an `ExclusionRegistry`.
    pub fn with_exclusions(mut self, store: SharedStore) -> Self {
        self.exclusions = Some(store);
        self.cache.clear();
        self
    }

    pub fn without_exclusions(mut self) -> Self {
        self.exclusions = None;
        self.cache.clear();
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn VersionProbe>) -> Self {
        self.exporter = ExportManager::new(probe);
        self
    }

    pub fn with_middleware(mut self, chain: MiddlewareChain) -> Self {
        self.middleware = chain;
        self.cache.clear();
        self
    }

    pub fn with_postprocess(mut self, chain: PostProcessorChain) -> Self {
        self.postprocess = chain;
        self.cache.clear();
        self
    }

    pub fn exclusions(&self) -> Option<&SharedStore> {
        self.exclusions.as_ref()
    }

    pub fn middleware_mut(&mut self) -> &mut MiddlewareChain {
        self.cache.clear();
        &mut self.middleware
    }

    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.fetchers.clear();
    }

    pub fn cached_results(&self) -> usize {
        self.cache.len()
    }

    /// Forget every cached result and the fetcher for `source`. Returns how many results went.
    pub fn invalidate(&mut self, source: &SourceDescriptor) -> usize {
        let before = self.cache.len();
        self.cache.retain(|k, _| &k.source != source);
        self.fetchers.remove(source);
        before - self.cache.len()
    }

    /// fetch → raw validation → detect → parse → record validation →
    /// middleware → postprocess → exclusion filter.
    pub fn run(&mut self, source: &SourceDescriptor, ctx: &mut RunContext) -> PipelineResult {
        let key = self.cache_key(source, &[], &[], ctx, None);
        if let Some(hit) = self.cached(&key, ctx) {
            return hit;
        }
        let before = ctx.diagnostics().len();
        let result = match self.process(source, ctx) {
            Ok((records, errors)) => {
                info!(
                    source = %source.location,
                    mode = ctx.mode.as_str(),
                    records = records.len(),
                    errors = errors.len(),
                    "subscription processed"
                );
                PipelineResult::succeeded(records, errors, ctx.diagnostics()[before..].to_vec())
            }
            Err(errors) => {
                warn!(source = %source.location, errors = errors.len(), "subscription run failed");
                PipelineResult::failed(errors, ctx.diagnostics()[before..].to_vec())
            }
        };
        self.store_result(key, &result);
        result
    }

    /// `run` followed by export, with target and version check overriding the config.
    pub fn export(
        &mut self,
        source: &SourceDescriptor,
        exclusions: &[String],
        extra_routes: &[Value],
        ctx: &mut RunContext,
        target: ExportTarget,
        skip_version_check: bool,
    ) -> PipelineResult {
        let mut opts = ExportOptions::from_config(&self.config.export);
        opts.target = target;
        opts.skip_version_check = opts.skip_version_check || skip_version_check;
        self.export_with(source, exclusions, extra_routes, ctx, &opts)
    }

    pub fn export_with(
        &mut self,
        source: &SourceDescriptor,
        exclusions: &[String],
        extra_routes: &[Value],
        ctx: &mut RunContext,
        opts: &ExportOptions,
    ) -> PipelineResult {
        let key = self.cache_key(source, exclusions, extra_routes, ctx, Some(opts));
        if let Some(hit) = self.cached(&key, ctx) {
            return hit;
        }
        let mut result = self.run(source, ctx);
        if result.success {
            let before = ctx.diagnostics().len();
            match self
                .exporter
                .export(&result.records, exclusions, extra_routes, ctx, opts)
            {
                Ok(doc) => {
                    result.diagnostics.extend_from_slice(&ctx.diagnostics()[before..]);
                    result.document = Some(doc);
                }
                Err(e) => {
                    warn!(target_format = %opts.target, error = %e, "export failed");
                    let mut errors = std::mem::take(&mut result.errors);
                    errors.push(PipelineError::from_error(Stage::Export, &SubsError::from(e)));
                    let mut diagnostics = std::mem::take(&mut result.diagnostics);
                    diagnostics.extend_from_slice(&ctx.diagnostics()[before..]);
                    result = PipelineResult::failed(errors, diagnostics);
                }
            }
        }
        self.store_result(key, &result);
        result
    }

    fn cached(&self, key: &CacheKey, ctx: &RunContext) -> Option<PipelineResult> {
        if ctx.force_reload {
            return None;
        }
        let (_, hit) = self.cache.get(key)?;
        debug!(source = %key.source.location, "result served from cache");
        Some(hit.clone())
    }

    fn store_result(&mut self, key: CacheKey, result: &PipelineResult) {
        let cap = self.config.cache_entries;
        if cap == 0 || result.errors.iter().any(|e| e.kind == ErrorKind::Fetch) {
            return;
        }
        while self.cache.len() >= cap && !self.cache.contains_key(&key) {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|(_, (seq, _))| *seq)
                .map(|(k, _)| k.clone());
            let Some(oldest) = oldest else { break };
            self.cache.remove(&oldest);
            if !self.cache.keys().any(|k| k.source == oldest.source) {
                self.fetchers.remove(&oldest.source);
            }
            debug!(source = %oldest.source.location, "cached result evicted");
        }
        self.seq += 1;
        self.cache.insert(key, (self.seq, result.clone()));
    }

    /// Drop fetchers whose source has no cached result, e.g. after failed runs.
    fn make_room_for_fetcher(&mut self) {
        if self.fetchers.len() < self.config.cache_entries.max(1) {
            return;
        }
        let live: HashSet<&SourceDescriptor> = self.cache.keys().map(|k| &k.source).collect();
        self.fetchers.retain(|s, _| live.contains(s));
    }

    fn cache_key(
        &self,
        source: &SourceDescriptor,
        exclusions: &[String],
        extra_routes: &[Value],
        ctx: &RunContext,
        export: Option<&ExportOptions>,
    ) -> CacheKey {
        let mut exclusions = exclusions.to_vec();
        exclusions.sort();
        exclusions.dedup();
        let store = self.exclusions.as_ref().and_then(|s| {
            let entries = s.lock().list_all().ok()?;
            Some(entries.into_iter().map(|e| e.id).collect())
        });
        CacheKey {
            source: source.clone(),
            exclusions,
            routes: Value::Array(extra_routes.to_vec()).to_string(),
            signature: ctx.signature(),
            store,
            export: export.map(|o| {
                (
                    o.target,
                    o.skip_version_check,
                    o.urltest_group,
                    o.template.as_ref().map(Value::to_string).unwrap_or_default(),
                )
            }),
        }
    }

    fn process(&mut self, source: &SourceDescriptor, ctx: &mut RunContext) -> StageOutcome {
        if !self.fetchers.contains_key(source) {
            self.make_room_for_fetcher();
        }
        let fetcher = match self.fetchers.entry(source.clone()) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => match Fetcher::for_source(source, &self.config.fetch) {
                Ok(f) => e.insert(f),
                Err(err) => return Err(vec![fail(Stage::Fetch, err)]),
            },
        };
        let raw = fetcher
            .fetch(ctx.force_reload)
            .map_err(|e| vec![fail(Stage::Fetch, e)])?;
        let hint = match source.format {
            crate::model::FormatHint::Auto => fetcher.default_format(),
            declared => declared,
        };
        debug!(source = %source.location, bytes = raw.len(), %hint, "payload fetched");

        if let Err(e) = validate_raw(&raw) {
            return degrade(Stage::RawValidation, e, ctx);
        }
        let parser = match parse::detect(&raw, hint) {
            Ok(p) => p,
            Err(e) => return degrade(Stage::Detect, e, ctx),
        };
        let records = match parser.parse(&raw) {
            Ok(r) => r,
            Err(e) => return degrade(Stage::Parse, e, ctx),
        };

        let validator = RecordValidator::new(RepairPolicy::for_mode(ctx.mode));
        let report = validator
            .validate(records, ctx)
            .map_err(|e| vec![fail(Stage::RecordValidation, e)])?;
        let mut errors: Vec<PipelineError> = report
            .discarded
            .into_iter()
            .map(|(tag, e)| {
                let pe = fail(Stage::RecordValidation, e);
                match tag {
                    Some(t) => pe.with_tag(t),
                    None => pe,
                }
            })
            .collect();
        let mut records = report.records;

        self.middleware.run(&mut records, ctx);
        let records = self.postprocess.run(records, ctx);

        let Some(store) = &self.exclusions else {
            return Ok((records, errors));
        };
        let listed = store.lock().list_all();
        match listed {
            Ok(entries) => {
                let ids: HashSet<&str> = entries.iter().map(|e| e.id.as_str()).collect();
                let (kept, dropped): (Vec<_>, Vec<_>) = records
                    .into_iter()
                    .partition(|r| !ids.contains(r.identity().as_str()));
                for r in &dropped {
                    debug!(tag = %r.tag, "excluded by store");
                    ctx.info(Stage::Exclusion, format!("`{}` excluded", r.tag));
                }
                Ok((kept, errors))
            }
            Err(e) if ctx.is_tolerant() => {
                warn!(error = %e, "exclusion store unavailable, not filtering");
                ctx.warn(Stage::Exclusion, format!("exclusion store unavailable: {e}"));
                errors.push(fail(Stage::Exclusion, e));
                Ok((records, errors))
            }
            Err(e) => Err(vec![fail(Stage::Exclusion, e)]),
        }
    }
}

fn fail(stage: Stage, err: impl Into<SubsError>) -> PipelineError {
    PipelineError::from_error(stage, &err.into())
}

/// Strict runs abort; tolerant runs succeed with no records and the error kept.
fn degrade(stage: Stage, err: impl Into<SubsError>, ctx: &mut RunContext) -> StageOutcome {
    let pe = fail(stage, err);
    if ctx.is_tolerant() {
        warn!(stage = stage.as_str(), error = %pe.message, "no records salvaged");
        ctx.warn(stage, pe.message.clone());
        Ok((Vec::new(), vec![pe]))
    } else {
        Err(vec![pe])
    }
}
