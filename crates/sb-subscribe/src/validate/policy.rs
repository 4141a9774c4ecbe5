use crate::model::{Mode, ServerRecord};

/// One way of filling in a missing address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepairRule {
    /// Copy the display tag.
    IdentifierFromTag,
    /// Copy the `name` (or `label`) metadata.
    IdentifierFromName,
    /// `{protocol}-{content id}`; always succeeds.
    IdentifierPlaceholder,
}

impl RepairRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdentifierFromTag => "identifier_from_tag",
            Self::IdentifierFromName => "identifier_from_name",
            Self::IdentifierPlaceholder => "identifier_placeholder",
        }
    }

    fn apply(&self, rec: &ServerRecord) -> Option<String> {
        let non_blank = |s: &str| (!s.trim().is_empty()).then(|| s.trim().to_string());
        match self {
            Self::IdentifierFromTag => non_blank(rec.tag.as_str()),
            Self::IdentifierFromName => ["name", "label"]
                .iter()
                .find_map(|k| rec.meta.get(*k).and_then(|v| non_blank(v.as_str()))),
            Self::IdentifierPlaceholder => Some(format!("{}-{}", rec.kind(), rec.content_id())),
        }
    }
}

/// What the record stage may repair, annotate or must reject.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairPolicy {
    mode: Mode,
    rules: Vec<RepairRule>,
}

impl RepairPolicy {
    pub fn for_mode(mode: Mode) -> Self {
        let rules = match mode {
            Mode::Tolerant => vec![
                RepairRule::IdentifierFromTag,
                RepairRule::IdentifierFromName,
                RepairRule::IdentifierPlaceholder,
            ],
            Mode::Strict => Vec::new(),
        };
        Self { mode, rules }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_tolerant(&self) -> bool {
        self.mode == Mode::Tolerant
    }

    pub fn rules(&self) -> &[RepairRule] {
        &self.rules
    }

    pub fn with_rule(mut self, rule: RepairRule) -> Self {
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
        self
    }

    pub fn without_rule(mut self, rule: RepairRule) -> Self {
        self.rules.retain(|r| *r != rule);
        self
    }

    /// First rule that yields an address for `rec`.
    pub fn repair_identifier(&self, rec: &ServerRecord) -> Option<(RepairRule, String)> {
        self.rules
            .iter()
            .find_map(|rule| rule.apply(rec).map(|v| (*rule, v)))
    }

    /// Protocol issues are kept as annotations instead of failing the run.
    pub fn annotates_protocol_issues(&self) -> bool {
        self.is_tolerant()
    }

    /// Undecodable or port-less records are dropped with a reason instead of failing the run.
    pub fn discards_unusable(&self) -> bool {
        self.is_tolerant()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, TrojanOpts};

    fn nameless() -> ServerRecord {
        ServerRecord::new(
            Protocol::Trojan(TrojanOpts {
                password: "pw".into(),
                ..Default::default()
            }),
            "",
            443,
        )
    }

    #[test]
    fn strict_repairs_nothing() {
        let p = RepairPolicy::for_mode(Mode::Strict);
        assert!(p.repair_identifier(&nameless().with_tag("t")).is_none());
        assert!(!p.annotates_protocol_issues());
    }

    #[test]
    fn tolerant_priority_tag_then_name_then_placeholder() {
        let p = RepairPolicy::for_mode(Mode::Tolerant);
        let (rule, v) = p.repair_identifier(&nameless().with_tag("edge-1")).unwrap();
        assert_eq!((rule, v.as_str()), (RepairRule::IdentifierFromTag, "edge-1"));

        let (rule, v) = p
            .repair_identifier(&nameless().with_meta("name", "from-name"))
            .unwrap();
        assert_eq!((rule, v.as_str()), (RepairRule::IdentifierFromName, "from-name"));

        let (rule, v) = p.repair_identifier(&nameless()).unwrap();
        assert_eq!(rule, RepairRule::IdentifierPlaceholder);
        assert!(v.starts_with("trojan-"));
        assert_eq!(v, p.repair_identifier(&nameless()).unwrap().1);
    }

    #[test]
    fn rules_can_be_removed() {
        let p = RepairPolicy::for_mode(Mode::Tolerant).without_rule(RepairRule::IdentifierPlaceholder);
        assert!(p.repair_identifier(&nameless()).is_none());
        let p = RepairPolicy::for_mode(Mode::Strict).with_rule(RepairRule::IdentifierFromTag);
        assert!(p.repair_identifier(&nameless().with_tag("x")).is_some());
    }
}
