//! Batch-scope transforms run between validation and postprocessing.
//!
//! Stages are a closed set ([`MiddlewareStage`]) behind the [`Middleware`]
//! trait. [`MiddlewareChain`] runs them in order, each individually gated.

mod enrich;
mod filter;
mod tag;

pub use enrich::Enricher;
pub use filter::TagFilter;
pub use tag::{clean_tag, TagNormalizer};

use tracing::debug;

use crate::config::MiddlewareConfig;
use crate::error::SubsError;
use crate::model::{RunContext, ServerRecord};

pub trait Middleware {
    fn name(&self) -> &'static str;

    /// Whether the batch needs this stage at all.
    fn can_process(&self, records: &[ServerRecord]) -> bool {
        !records.is_empty()
    }

    fn process(&self, records: &mut Vec<ServerRecord>, ctx: &mut RunContext);
}

#[derive(Debug, Clone)]
pub enum MiddlewareStage {
    TagNormalizer(TagNormalizer),
    Enrichment(Enricher),
    TagFilter(TagFilter),
}

impl Middleware for MiddlewareStage {
    fn name(&self) -> &'static str {
        match self {
            Self::TagNormalizer(m) => m.name(),
            Self::Enrichment(m) => m.name(),
            Self::TagFilter(m) => m.name(),
        }
    }

    fn can_process(&self, records: &[ServerRecord]) -> bool {
        match self {
            Self::TagNormalizer(m) => m.can_process(records),
            Self::Enrichment(m) => m.can_process(records),
            Self::TagFilter(m) => m.can_process(records),
        }
    }

    fn process(&self, records: &mut Vec<ServerRecord>, ctx: &mut RunContext) {
        match self {
            Self::TagNormalizer(m) => m.process(records, ctx),
            Self::Enrichment(m) => m.process(records, ctx),
            Self::TagFilter(m) => m.process(records, ctx),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    stage: MiddlewareStage,
    enabled: bool,
}

/// Ordered, gated middleware stages.
#[derive(Debug, Clone, Default)]
pub struct MiddlewareChain {
    slots: Vec<Slot>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalizer then enrichment, both enabled.
    pub fn standard() -> Self {
        Self::new()
            .with(MiddlewareStage::TagNormalizer(TagNormalizer))
            .with(MiddlewareStage::Enrichment(Enricher))
    }

    pub fn from_config(cfg: &MiddlewareConfig) -> Result<Self, SubsError> {
        let mut chain = Self::standard();
        chain.set_enabled("tag_normalizer", cfg.tag_normalizer);
        chain.set_enabled("enrichment", cfg.enrichment);
        if let Some(f) = &cfg.tag_filter {
            chain.push(MiddlewareStage::TagFilter(TagFilter::new(&f.include, &f.exclude)?));
        }
        Ok(chain)
    }

    pub fn with(mut self, stage: MiddlewareStage) -> Self {
        self.push(stage);
        self
    }

    pub fn push(&mut self, stage: MiddlewareStage) {
        self.slots.push(Slot {
            stage,
            enabled: true,
        });
    }

    /// Returns `false` if no stage has that name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        let mut found = false;
        for slot in self.slots.iter_mut().filter(|s| s.stage.name() == name) {
            slot.enabled = enabled;
            found = true;
        }
        found
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.slots
            .iter()
            .any(|s| s.enabled && s.stage.name() == name)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|s| s.stage.name()).collect()
    }

    pub fn run(&self, records: &mut Vec<ServerRecord>, ctx: &mut RunContext) {
        for slot in &self.slots {
            if !slot.enabled {
                continue;
            }
            if !slot.stage.can_process(records) {
                debug!(stage = slot.stage.name(), "middleware skipped");
                continue;
            }
            let before = records.len();
            slot.stage.process(records, ctx);
            debug!(
                stage = slot.stage.name(),
                before,
                after = records.len(),
                "middleware applied"
            );
        }
    }
}
