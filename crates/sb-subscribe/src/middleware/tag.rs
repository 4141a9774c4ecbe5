use std::collections::HashSet;

use super::Middleware;
use crate::model::{RunContext, ServerRecord, Stage};

/// Assigns every record a clean display tag, unique within the batch.
///
/// 优先级: meta `name` > meta `label` > meta `tag` > 已有 tag >
/// `{protocol}-{address}` > `{protocol}-{content id}`.
/// Collisions get ` (n)` suffixes in encounter order.
#[derive(Debug, Clone, Copy, Default)]
pub struct TagNormalizer;

impl TagNormalizer {
    fn base_tag(rec: &ServerRecord) -> String {
        let from_meta = ["name", "label", "tag"]
            .iter()
            .filter_map(|k| rec.meta.get(*k))
            .map(|v| clean_tag(v))
            .find(|v| !v.is_empty());
        if let Some(t) = from_meta {
            return t;
        }
        let existing = clean_tag(&rec.tag);
        if !existing.is_empty() {
            return existing;
        }
        let by_address = clean_tag(&rec.address);
        if !by_address.is_empty() {
            return format!("{}-{}", rec.kind(), by_address);
        }
        format!("{}-{}", rec.kind(), rec.content_id())
    }
}

impl Middleware for TagNormalizer {
    fn name(&self) -> &'static str {
        "tag_normalizer"
    }

    fn process(&self, records: &mut Vec<ServerRecord>, ctx: &mut RunContext) {
        let mut assigned: HashSet<String> = HashSet::with_capacity(records.len());
        for rec in records.iter_mut() {
            let base = Self::base_tag(rec);
            let mut tag = base.clone();
            let mut n = 1usize;
            while assigned.contains(&tag) {
                tag = format!("{base} ({n})");
                n += 1;
            }
            if tag != base {
                ctx.info(
                    Stage::Middleware,
                    format!("duplicate tag `{base}` renamed to `{tag}`"),
                );
            }
            assigned.insert(tag.clone());
            rec.tag = tag;
        }
    }
}

/// Strip control characters and collapse whitespace runs.
pub fn clean_tag(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, ProxyAuthOpts};

    fn rec(tag: &str, addr: &str) -> ServerRecord {
        ServerRecord::new(Protocol::Socks(ProxyAuthOpts::default()), addr, 1080).with_tag(tag)
    }

    fn run(records: &mut Vec<ServerRecord>) {
        TagNormalizer.process(records, &mut RunContext::tolerant());
    }

    #[test]
    fn cleans_control_chars_and_whitespace() {
        assert_eq!(clean_tag("  HK\t\t01 \u{7}\n"), "HK 01");
        assert_eq!(clean_tag("\u{1b}[31m"), "[31m");
    }

    #[test]
    fn priority_order() {
        let mut records = vec![
            rec("t", "a").with_meta("label", "L").with_meta("name", "N"),
            rec("t2", "a").with_meta("label", "L"),
            rec("", "host.example"),
            rec("", ""),
        ];
        run(&mut records);
        assert_eq!(records[0].tag, "N");
        assert_eq!(records[1].tag, "L");
        assert_eq!(records[2].tag, "socks-host.example");
        assert!(records[3].tag.starts_with("socks-"));
        assert_eq!(records[3].tag.len(), "socks-".len() + 12);
    }

    #[test]
    fn collisions_get_incrementing_suffixes() {
        let mut records = vec![rec("A", "1"), rec("A", "2"), rec("A", "3"), rec("B", "4")];
        run(&mut records);
        let tags: Vec<_> = records.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["A", "A (1)", "A (2)", "B"]);
        // origin tags and identity are untouched
        assert_eq!(records[1].origin_tag, "A");
    }

    #[test]
    fn suffix_skips_tags_already_taken() {
        let mut records = vec![rec("A (1)", "1"), rec("A", "2"), rec("A", "3")];
        run(&mut records);
        let tags: Vec<_> = records.iter().map(|r| r.tag.as_str()).collect();
        assert_eq!(tags, vec!["A (1)", "A", "A (2)"]);
    }

    #[test]
    fn idempotent_on_unique_batch() {
        let mut records = vec![rec("x", "1"), rec("y", "2"), rec("x", "3")];
        run(&mut records);
        let once = records.clone();
        run(&mut records);
        assert_eq!(records, once);
    }
}
