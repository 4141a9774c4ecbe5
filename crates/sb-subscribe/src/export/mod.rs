//! Export stage: turns the final record set into a client configuration document.
//!
//! 导出阶段：把最终的节点列表序列化为目标客户端的配置文档。
//!
//! A record that cannot be expressed in the target schema is skipped with a
//! warning; the export itself only fails for an unusable target or template.

pub mod clash;
pub mod singbox;
pub mod version;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ExportConfig;
use crate::error::ExportError;
use crate::model::{RunContext, ServerRecord, Stage};

pub use version::{CommandProbe, ProbeError, SingBoxVersion, StaticProbe, SyntaxMode, VersionProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportTarget {
    #[default]
    SingBox,
    Clash,
    V2Ray,
}

impl ExportTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingBox => "singbox",
            Self::Clash => "clash",
            Self::V2Ray => "v2ray",
        }
    }

    /// Serialize a document produced for this target.
    pub fn render(&self, doc: &Value) -> Result<String, ExportError> {
        match self {
            Self::SingBox => {
                serde_json::to_string_pretty(doc).map_err(|e| ExportError::Render(e.to_string()))
            }
            #[cfg(feature = "subs_clash")]
            Self::Clash => serde_yaml::to_string(doc).map_err(|e| ExportError::Render(e.to_string())),
            #[cfg(not(feature = "subs_clash"))]
            Self::Clash => Err(ExportError::UnsupportedTarget(
                "clash (built without subs_clash)".into(),
            )),
            Self::V2Ray => Err(ExportError::UnsupportedTarget(self.as_str().into())),
        }
    }
}

impl fmt::Display for ExportTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportTarget {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "singbox" | "sing-box" | "sing_box" => Ok(Self::SingBox),
            "clash" | "mihomo" | "clash-meta" => Ok(Self::Clash),
            "v2ray" | "xray" => Ok(Self::V2Ray),
            other => Err(ExportError::UnsupportedTarget(other.to_string())),
        }
    }
}

/// Per-call export settings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExportOptions {
    pub target: ExportTarget,
    pub skip_version_check: bool,
    pub urltest_group: bool,
    /// Sections other than `outbounds` (sing-box) or `proxies` (Clash) are kept.
    pub template: Option<Value>,
}

impl ExportOptions {
    pub fn new(target: ExportTarget) -> Self {
        Self {
            target,
            ..Default::default()
        }
    }

    pub fn from_config(cfg: &ExportConfig) -> Self {
        Self {
            target: cfg.target,
            skip_version_check: cfg.skip_version_check,
            urltest_group: cfg.urltest_group,
            template: cfg.template.clone(),
        }
    }

    pub fn with_skip_version_check(mut self, skip: bool) -> Self {
        self.skip_version_check = skip;
        self
    }

    pub fn with_urltest_group(mut self, on: bool) -> Self {
        self.urltest_group = on;
        self
    }

    pub fn with_template(mut self, template: Value) -> Self {
        self.template = Some(template);
        self
    }
}

fn default_singbox_template() -> Map<String, Value> {
    let v = json!({
        "log": { "level": "info", "timestamp": true },
        "inbounds": [{
            "type": "mixed",
            "tag": "mixed-in",
            "listen": "127.0.0.1",
            "listen_port": 7890
        }]
    });
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

fn default_clash_template() -> Map<String, Value> {
    let v = json!({
        "mixed-port": 7890,
        "allow-lan": false,
        "mode": "rule",
        "log-level": "info"
    });
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}

pub struct ExportManager {
    probe: Arc<dyn VersionProbe>,
}

impl fmt::Debug for ExportManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportManager")
            .field("probe", &self.probe)
            .finish()
    }
}

impl ExportManager {
    pub fn new(probe: Arc<dyn VersionProbe>) -> Self {
        Self { probe }
    }

    pub fn from_config(cfg: &ExportConfig) -> Self {
        Self::new(Arc::new(CommandProbe::new(cfg.singbox_bin.clone())))
    }

    /// Outbound syntax to emit. A failed probe falls back to modern syntax.
    pub fn syntax(&self, skip_version_check: bool, ctx: &mut RunContext) -> SyntaxMode {
        if skip_version_check {
            debug!("version check skipped, using modern syntax");
            return SyntaxMode::Modern;
        }
        match self.probe.probe() {
            Ok(v) => {
                let mode = SyntaxMode::for_version(v);
                debug!(version = %v, ?mode, "sing-box version probed");
                if mode == SyntaxMode::Legacy {
                    ctx.info(
                        Stage::Export,
                        format!("sing-box {v} predates {}, using legacy syntax", SingBoxVersion::MODERN_SYNTAX),
                    );
                }
                mode
            }
            Err(e) => {
                warn!(error = %e, "version probe failed, assuming modern syntax");
                ctx.warn(
                    Stage::Export,
                    format!("version probe failed ({e}), assuming modern syntax"),
                );
                SyntaxMode::Modern
            }
        }
    }

    /// Build the target document.
    ///
    /// `exclusions` holds identities or display tags to leave out; `extra_routes`
    /// are route rules (sing-box objects or Clash rule strings) placed after
    /// the template's own rules.
    pub fn export(
        &self,
        records: &[ServerRecord],
        exclusions: &[String],
        extra_routes: &[Value],
        ctx: &mut RunContext,
        opts: &ExportOptions,
    ) -> Result<Value, ExportError> {
        if opts.target == ExportTarget::V2Ray {
            return Err(ExportError::UnsupportedTarget(opts.target.as_str().into()));
        }
        let template = match &opts.template {
            None => None,
            Some(Value::Object(m)) => Some(m.clone()),
            Some(other) => {
                return Err(ExportError::Template(format!(
                    "expected a JSON object, got {}",
                    kind_of(other)
                )))
            }
        };

        let excluded: HashSet<&str> = exclusions.iter().map(String::as_str).collect();
        let mut usable = Vec::with_capacity(records.len());
        for rec in records {
            if excluded.contains(rec.identity().as_str()) || excluded.contains(rec.tag.as_str()) {
                debug!(tag = %rec.tag, "excluded from export");
                ctx.info(Stage::Export, format!("`{}` excluded", rec.tag));
                continue;
            }
            if !rec.issues.is_empty() {
                warn!(tag = %rec.tag, issues = ?rec.issues, "skipping record with validation issues");
                ctx.warn_for(
                    Stage::Export,
                    &rec.tag,
                    format!("skipped: {}", rec.issues.join("; ")),
                );
                continue;
            }
            usable.push(rec);
        }

        let doc = match opts.target {
            ExportTarget::Clash => self.clash_document(&usable, extra_routes, ctx, opts, template),
            _ => self.singbox_document(&usable, extra_routes, ctx, opts, template),
        };
        info!(
            target_format = %opts.target,
            records = records.len(),
            exported = usable.len(),
            "export finished"
        );
        Ok(doc)
    }

    fn singbox_document(
        &self,
        records: &[&ServerRecord],
        extra_routes: &[Value],
        ctx: &mut RunContext,
        opts: &ExportOptions,
        template: Option<Map<String, Value>>,
    ) -> Value {
        let syntax = self.syntax(opts.skip_version_check, ctx);
        let mut taken = HashSet::new();
        let mut tags = Vec::with_capacity(records.len());
        let mut outbounds = Vec::with_capacity(records.len() + 4);
        for rec in records {
            let tag = singbox::unique_tag(&display_tag(rec), &mut taken);
            match singbox::build_outbound(rec, &tag) {
                Ok(v) => {
                    outbounds.push(v);
                    tags.push(tag);
                }
                Err(e) => {
                    taken.remove(&tag);
                    warn!(tag = %tag, error = %e, "outbound skipped");
                    ctx.warn_for(Stage::Export, &tag, format!("outbound skipped: {e}"));
                }
            }
        }

        let urltest = opts.urltest_group && !tags.is_empty();
        if urltest {
            outbounds.push(singbox::urltest_outbound(&tags));
        }
        outbounds.extend(singbox::service_outbounds());

        let final_tag = if urltest {
            singbox::URLTEST_TAG.to_string()
        } else {
            tags.first()
                .cloned()
                .unwrap_or_else(|| singbox::DIRECT_TAG.to_string())
        };

        let mut doc = template.unwrap_or_else(default_singbox_template);
        let template_route = doc.remove("route");
        doc.insert("outbounds".into(), Value::Array(outbounds));
        doc.insert(
            "route".into(),
            singbox::route(syntax, template_route.as_ref(), extra_routes, &final_tag),
        );
        Value::Object(doc)
    }

    fn clash_document(
        &self,
        records: &[&ServerRecord],
        extra_routes: &[Value],
        ctx: &mut RunContext,
        opts: &ExportOptions,
        template: Option<Map<String, Value>>,
    ) -> Value {
        let mut taken: HashSet<String> = ["DIRECT", "REJECT", clash::SELECT_GROUP, clash::URLTEST_GROUP]
            .into_iter()
            .map(String::from)
            .collect();
        let mut names = Vec::with_capacity(records.len());
        let mut proxies = Vec::with_capacity(records.len());
        for rec in records {
            let base = display_tag(rec);
            let mut name = base.clone();
            let mut n = 1;
            while taken.contains(&name) {
                name = format!("{base} ({n})");
                n += 1;
            }
            match clash::build_proxy(rec, &name) {
                Ok(v) => {
                    taken.insert(name.clone());
                    proxies.push(v);
                    names.push(name);
                }
                Err(e) => {
                    warn!(tag = %name, error = %e, "proxy skipped");
                    ctx.warn_for(Stage::Export, &name, format!("proxy skipped: {e}"));
                }
            }
        }

        let mut rules = Vec::new();
        for r in extra_routes {
            match r {
                Value::String(s) => rules.push(s.clone()),
                other => ctx.warn(
                    Stage::Export,
                    format!("clash rules must be strings, ignoring {}", kind_of(other)),
                ),
            }
        }

        let built = clash::document(proxies, &names, opts.urltest_group && !names.is_empty(), rules);
        let mut doc = template.unwrap_or_else(default_clash_template);
        if let Value::Object(m) = built {
            doc.extend(m);
        }
        Value::Object(doc)
    }
}

fn display_tag(rec: &ServerRecord) -> String {
    if rec.tag.trim().is_empty() {
        format!("{}-{}", rec.kind(), rec.address)
    } else {
        rec.tag.clone()
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
