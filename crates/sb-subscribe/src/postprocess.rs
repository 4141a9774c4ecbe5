//! Batch transforms after middleware: dedup and filters.
//!
//! Chains compose by concatenation; processors run in declared order and
//! preserve the relative order of surviving records.

use regex::Regex;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::config::PostprocessConfig;
use crate::error::SubsError;
use crate::model::{ProtocolKind, RunContext, ServerRecord, Stage};

pub type Predicate = Arc<dyn Fn(&ServerRecord) -> bool + Send + Sync>;

/// Keep-predicate of a filter processor.
#[derive(Clone)]
pub enum FilterRule {
    /// Keep ports in `min..=max`.
    PortRange { min: u16, max: u16 },
    /// Keep only these protocols.
    Protocols(Vec<ProtocolKind>),
    /// Drop display tags matching the pattern.
    ExcludeTag(Regex),
    /// Keep records the closure accepts.
    Custom { name: String, keep: Predicate },
}

impl FilterRule {
    pub fn custom(
        name: impl Into<String>,
        keep: impl Fn(&ServerRecord) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Custom {
            name: name.into(),
            keep: Arc::new(keep),
        }
    }

    pub fn keeps(&self, rec: &ServerRecord) -> bool {
        match self {
            Self::PortRange { min, max } => (*min..=*max).contains(&rec.port),
            Self::Protocols(kinds) => kinds.contains(&rec.kind()),
            Self::ExcludeTag(re) => !re.is_match(&rec.tag),
            Self::Custom { keep, .. } => keep(rec),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::PortRange { min, max } => format!("port_range({min}-{max})"),
            Self::Protocols(kinds) => {
                let names: Vec<_> = kinds.iter().map(ProtocolKind::as_str).collect();
                format!("protocols({})", names.join(","))
            }
            Self::ExcludeTag(re) => format!("exclude_tag({})", re.as_str()),
            Self::Custom { name, .. } => format!("custom({name})"),
        }
    }
}

impl fmt::Debug for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

#[derive(Debug, Clone)]
pub enum PostProcessor {
    /// Drop repeated identities, first occurrence wins.
    Dedup,
    Filter(FilterRule),
}

impl PostProcessor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dedup => "dedup",
            Self::Filter(_) => "filter",
        }
    }

    pub fn apply(&self, records: Vec<ServerRecord>, ctx: &mut RunContext) -> Vec<ServerRecord> {
        match self {
            Self::Dedup => dedup(records, ctx),
            Self::Filter(rule) => {
                let before = records.len();
                let kept: Vec<_> = records.into_iter().filter(|r| rule.keeps(r)).collect();
                if kept.len() != before {
                    ctx.info(
                        Stage::PostProcess,
                        format!("{} dropped {} record(s)", rule.describe(), before - kept.len()),
                    );
                }
                kept
            }
        }
    }
}

/// Identity dedup preserving order of survivors.
pub fn dedup(records: Vec<ServerRecord>, ctx: &mut RunContext) -> Vec<ServerRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    let mut out = Vec::with_capacity(records.len());
    for rec in records {
        if seen.insert(rec.identity()) {
            out.push(rec);
        } else {
            debug!(tag = %rec.tag, "duplicate identity dropped");
            ctx.info(
                Stage::PostProcess,
                format!("duplicate of an earlier record dropped: `{}`", rec.tag),
            );
        }
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct PostProcessorChain {
    processors: Vec<PostProcessor>,
}

impl PostProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(cfg: &PostprocessConfig) -> Result<Self, SubsError> {
        let mut chain = Self::new();
        if cfg.dedup {
            chain.push(PostProcessor::Dedup);
        }
        if let Some(r) = cfg.port_range {
            chain.push(PostProcessor::Filter(FilterRule::PortRange {
                min: r.min,
                max: r.max,
            }));
        }
        if !cfg.protocols.is_empty() {
            chain.push(PostProcessor::Filter(FilterRule::Protocols(
                cfg.protocols.clone(),
            )));
        }
        for pat in &cfg.exclude_tags {
            chain.push(PostProcessor::Filter(FilterRule::ExcludeTag(Regex::new(pat)?)));
        }
        Ok(chain)
    }

    pub fn with(mut self, p: PostProcessor) -> Self {
        self.push(p);
        self
    }

    pub fn push(&mut self, p: PostProcessor) {
        self.processors.push(p);
    }

    /// Append another chain's processors after this one's.
    pub fn concat(mut self, other: PostProcessorChain) -> Self {
        self.processors.extend(other.processors);
        self
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn run(&self, mut records: Vec<ServerRecord>, ctx: &mut RunContext) -> Vec<ServerRecord> {
        for p in &self.processors {
            let before = records.len();
            records = p.apply(records, ctx);
            debug!(stage = p.name(), before, after = records.len(), "postprocessor applied");
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortRangeConfig;
    use crate::model::{Protocol, ProxyAuthOpts, TrojanOpts};

    fn socks(tag: &str, port: u16) -> ServerRecord {
        ServerRecord::new(Protocol::Socks(ProxyAuthOpts::default()), "h", port).with_tag(tag)
    }

    #[test]
    fn dedup_keeps_first_and_order() {
        let mut a2 = socks("a", 1);
        a2.address = "other".into();
        let records = vec![socks("a", 1), socks("b", 2), a2, socks("c", 3), socks("b", 2)];
        let out = dedup(records, &mut RunContext::tolerant());
        let tags: Vec<_> = out.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["a", "b", "c"]);
        assert_eq!(out[0].address, "h");
        let again = dedup(out.clone(), &mut RunContext::tolerant());
        assert_eq!(again, out);
    }

    #[test]
    fn filters_compose_by_concatenation() {
        let by_port = PostProcessorChain::new().with(PostProcessor::Filter(FilterRule::PortRange {
            min: 1000,
            max: 2000,
        }));
        let by_proto = PostProcessorChain::new().with(PostProcessor::Filter(FilterRule::Protocols(
            vec![ProtocolKind::Socks],
        )));
        let chain = by_port.concat(by_proto).with(PostProcessor::Filter(FilterRule::custom(
            "no-z",
            |r| !r.tag.starts_with('z'),
        )));
        assert_eq!(chain.len(), 3);
        let trojan = ServerRecord::new(Protocol::Trojan(TrojanOpts::default()), "h", 1500);
        let records = vec![socks("a", 1500), socks("b", 80), trojan, socks("zz", 1999)];
        let out = chain.run(records, &mut RunContext::tolerant());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].tag, "a");
    }

    #[test]
    fn from_config() {
        let cfg = PostprocessConfig {
            dedup: true,
            port_range: Some(PortRangeConfig { min: 1, max: 100 }),
            protocols: vec![],
            exclude_tags: vec!["^ad".into()],
        };
        let chain = PostProcessorChain::from_config(&cfg).unwrap();
        assert_eq!(chain.len(), 3);
        let bad = PostprocessConfig {
            exclude_tags: vec!["[".into()],
            ..Default::default()
        };
        assert!(PostProcessorChain::from_config(&bad).is_err());
    }
}
