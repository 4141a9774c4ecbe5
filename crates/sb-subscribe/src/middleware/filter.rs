use regex::Regex;
use tracing::debug;

use super::Middleware;
use crate::error::SubsError;
use crate::model::{RunContext, ServerRecord, Stage};

/// Include/exclude regular expressions over display tags.
#[derive(Debug, Clone)]
pub struct TagFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TagFilter {
    pub fn new<S: AsRef<str>>(include: &[S], exclude: &[S]) -> Result<Self, SubsError> {
        let compile = |pats: &[S]| -> Result<Vec<Regex>, SubsError> {
            pats.iter()
                .map(|p| Regex::new(p.as_ref()).map_err(SubsError::from))
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn keeps(&self, tag: &str) -> bool {
        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(tag));
        included && !self.exclude.iter().any(|r| r.is_match(tag))
    }
}

impl Middleware for TagFilter {
    fn name(&self) -> &'static str {
        "tag_filter"
    }

    fn can_process(&self, records: &[ServerRecord]) -> bool {
        !records.is_empty() && !(self.include.is_empty() && self.exclude.is_empty())
    }

    fn process(&self, records: &mut Vec<ServerRecord>, ctx: &mut RunContext) {
        records.retain(|r| {
            let keep = self.keeps(&r.tag);
            if !keep {
                debug!(tag = %r.tag, "dropped by tag filter");
                ctx.info(Stage::Middleware, format!("tag filter dropped `{}`", r.tag));
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_then_exclude() {
        let f = TagFilter::new(&["^HK", "^JP"], &["(?i)test"]).unwrap();
        assert!(f.keeps("HK 01"));
        assert!(f.keeps("JP-2"));
        assert!(!f.keeps("US 1"));
        assert!(!f.keeps("HK Test"));
        let none: [&str; 0] = [];
        assert!(TagFilter::new(&none, &none).unwrap().keeps("anything"));
    }
}
