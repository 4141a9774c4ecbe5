use proptest::prelude::*;
use sb_subscribe::middleware::{Middleware, TagNormalizer};
use sb_subscribe::model::{Protocol, ProxyAuthOpts, ShadowsocksOpts};
use sb_subscribe::parse::Parser;
use sb_subscribe::postprocess::dedup;
use sb_subscribe::{RunContext, ServerRecord};
use std::collections::{HashMap, HashSet};

const VALID: &str = "ss://YWVzLTI1Ni1nY206cHcx@1.1.1.1";
const MALFORMED: [&str; 5] = [
    "ss://%%%bad",
    "vmess://@@@",
    "hysteria://x@y:1",
    "plain words here",
    "vless://id@host:99999",
];

fn socks(tag: &str, port: u16) -> ServerRecord {
    ServerRecord::new(Protocol::Socks(ProxyAuthOpts::default()), "10.0.0.1", port).with_tag(tag)
}

fn ss(tag: &str, port: u16) -> ServerRecord {
    ServerRecord::new(
        Protocol::Shadowsocks(ShadowsocksOpts {
            method: "aes-256-gcm".into(),
            password: "pw".into(),
            ..Default::default()
        }),
        "1.1.1.1",
        port,
    )
    .with_tag(tag)
}

fn normalize(records: &mut Vec<ServerRecord>) {
    TagNormalizer.process(records, &mut RunContext::tolerant());
}

proptest! {
    #[test]
    fn parse_returns_one_record_per_entry(pattern in prop::collection::vec(any::<bool>(), 0..40)) {
        let lines: Vec<String> = pattern
            .iter()
            .enumerate()
            .map(|(i, ok)| {
                if *ok {
                    format!("{VALID}:{}#n{i}", 1000 + i)
                } else {
                    MALFORMED[i % MALFORMED.len()].to_string()
                }
            })
            .collect();
        let records = Parser::UriList.parse(lines.join("\n").as_bytes()).unwrap();

        let n = pattern.iter().filter(|ok| **ok).count();
        prop_assert_eq!(records.len(), pattern.len());
        let invalid: Vec<_> = records.iter().filter(|r| r.is_invalid()).collect();
        prop_assert_eq!(invalid.len(), pattern.len() - n);
        for r in invalid {
            prop_assert!(!r.diagnostic().unwrap_or_default().is_empty());
        }
    }

    #[test]
    fn uri_lines_never_abort_the_batch(
        lines in prop::collection::vec("(ss|vmess|vless|trojan|tuic|hy2|wg|socks5|http)://[ -~]{0,40}", 1..20)
    ) {
        let records = Parser::UriList.parse(lines.join("\n").as_bytes()).unwrap();
        prop_assert_eq!(records.len(), lines.len());
    }

    #[test]
    fn normalized_tags_are_unique(tags in prop::collection::vec("[a-c]{1,2}", 0..30)) {
        let mut records: Vec<_> = tags.iter().enumerate().map(|(i, t)| socks(t, i as u16 + 1)).collect();
        normalize(&mut records);

        let assigned: HashSet<&str> = records.iter().map(|r| r.tag.as_str()).collect();
        prop_assert_eq!(assigned.len(), records.len());

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for t in &tags {
            *counts.entry(t.as_str()).or_default() += 1;
        }
        for (orig, rec) in tags.iter().zip(&records) {
            if counts[orig.as_str()] == 1 {
                prop_assert_eq!(&rec.tag, orig);
            }
        }

        let once: Vec<String> = records.iter().map(|r| r.tag.clone()).collect();
        normalize(&mut records);
        let twice: Vec<String> = records.iter().map(|r| r.tag.clone()).collect();
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn dedup_is_idempotent_and_keeps_first(
        items in prop::collection::vec(("[a-d]", 1u16..4, any::<u8>()), 0..40)
    ) {
        // the password differs per item, identity does not look at it
        let records: Vec<_> = items
            .iter()
            .map(|(t, port, pw)| {
                let mut r = ss(t, *port);
                if let Protocol::Shadowsocks(o) = &mut r.protocol {
                    o.password = format!("pw{pw}");
                }
                r
            })
            .collect();

        let mut ctx = RunContext::tolerant();
        let once = dedup(records.clone(), &mut ctx);
        let twice = dedup(once.clone(), &mut ctx);
        prop_assert_eq!(&once, &twice);

        let mut first: Vec<&ServerRecord> = Vec::new();
        let mut seen = HashSet::new();
        for r in &records {
            if seen.insert(r.identity()) {
                first.push(r);
            }
        }
        prop_assert_eq!(once.len(), first.len());
        for (a, b) in once.iter().zip(first) {
            prop_assert_eq!(a, b);
        }
    }
}
