//! Persistent, identity-keyed exclusion list.
//!
//! The store file is loaded lazily on first access and rewritten atomically
//! on every mutation; the in-memory copy only changes after the write lands. Unversioned legacy files (a bare array, or an object
//! without `version`) load as version 0 and are upgraded on load.
//!
//! There is no cross-process lock: two processes writing the same file race,
//! and the last atomic rename wins.

use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::model::ServerRecord;
use crate::util::fs_atomic::write_atomic;

pub const STORE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExclusionEntry {
    /// Record identity (sha256 hex).
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// RFC 3339, UTC.
    pub timestamp: String,
}

#[derive(Serialize)]
struct StoreFile<'a> {
    version: u32,
    last_modified: &'a str,
    exclusions: &'a [ExclusionEntry],
}

#[derive(Debug, Default)]
struct State {
    entries: Vec<ExclusionEntry>,
    last_modified: Option<String>,
}

pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug)]
pub struct ExclusionStore {
    path: PathBuf,
    state: Option<State>,
}

impl ExclusionStore {
    /// Nothing is read until the first operation.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forget the in-memory copy; the next access reads the file again.
    pub fn reload(&mut self) {
        self.state = None;
    }

    fn state(&mut self) -> Result<&mut State, StoreError> {
        if self.state.is_none() {
            let (mut state, upgraded_from) = load(&self.path)?;
            if let Some(from) = upgraded_from {
                state.last_modified = Some(self.write(&state.entries)?);
                info!(path = %self.path.display(), from, to = STORE_VERSION, "exclusion store upgraded");
            }
            self.state = Some(state);
        }
        match self.state.as_mut() {
            Some(s) => Ok(s),
            None => Err(StoreError::Corrupt {
                path: self.path.clone(),
                message: "store state unavailable".into(),
            }),
        }
    }

    /// Write `entries` to disk and return the stamp recorded in the file.
    fn write(&self, entries: &[ExclusionEntry]) -> Result<String, StoreError> {
        let now = now_rfc3339();
        let file = StoreFile {
            version: STORE_VERSION,
            last_modified: &now,
            exclusions: entries,
        };
        let data = serde_json::to_vec_pretty(&file)?;
        write_atomic(&self.path, &data).map_err(|source| StoreError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), entries = entries.len(), "exclusion store saved");
        Ok(now)
    }

    /// Memory only changes once the file holds `entries`.
    fn commit(&mut self, entries: Vec<ExclusionEntry>) -> Result<(), StoreError> {
        let stamp = self.write(&entries)?;
        if let Some(state) = self.state.as_mut() {
            state.entries = entries;
            state.last_modified = Some(stamp);
        }
        Ok(())
    }

    /// `false` if the identity is already excluded.
    pub fn add(&mut self, id: &str, name: &str, reason: Option<&str>) -> Result<bool, StoreError> {
        let state = self.state()?;
        if state.entries.iter().any(|e| e.id == id) {
            return Ok(false);
        }
        let mut entries = state.entries.clone();
        entries.push(ExclusionEntry {
            id: id.to_string(),
            name: name.to_string(),
            reason: reason.map(str::to_string),
            timestamp: now_rfc3339(),
        });
        self.commit(entries)?;
        Ok(true)
    }

    /// Exclude a record by its identity, named after its display tag.
    pub fn add_record(&mut self, rec: &ServerRecord, reason: Option<&str>) -> Result<bool, StoreError> {
        self.add(&rec.identity(), &rec.tag, reason)
    }

    /// Add several entries with a single write. Returns how many were new.
    pub fn add_many<I>(&mut self, items: I) -> Result<usize, StoreError>
    where
        I: IntoIterator<Item = (String, String, Option<String>)>,
    {
        let mut entries = self.state()?.entries.clone();
        let mut known: HashSet<String> = entries.iter().map(|e| e.id.clone()).collect();
        let ts = now_rfc3339();
        let before = entries.len();
        for (id, name, reason) in items {
            if known.insert(id.clone()) {
                entries.push(ExclusionEntry {
                    id,
                    name,
                    reason,
                    timestamp: ts.clone(),
                });
            }
        }
        let added = entries.len() - before;
        if added > 0 {
            self.commit(entries)?;
        }
        Ok(added)
    }

    pub fn remove(&mut self, id: &str) -> Result<bool, StoreError> {
        let state = self.state()?;
        if !state.entries.iter().any(|e| e.id == id) {
            return Ok(false);
        }
        let entries = state.entries.iter().filter(|e| e.id != id).cloned().collect();
        self.commit(entries)?;
        Ok(true)
    }

    pub fn contains(&mut self, id: &str) -> Result<bool, StoreError> {
        Ok(self.state()?.entries.iter().any(|e| e.id == id))
    }

    pub fn get(&mut self, id: &str) -> Result<Option<ExclusionEntry>, StoreError> {
        Ok(self.state()?.entries.iter().find(|e| e.id == id).cloned())
    }

    /// Entries in insertion order.
    pub fn list_all(&mut self) -> Result<Vec<ExclusionEntry>, StoreError> {
        Ok(self.state()?.entries.clone())
    }

    /// Drop every entry; returns how many there were.
    pub fn clear(&mut self) -> Result<usize, StoreError> {
        let n = self.state()?.entries.len();
        self.commit(Vec::new())?;
        Ok(n)
    }

    pub fn len(&mut self) -> Result<usize, StoreError> {
        Ok(self.state()?.entries.len())
    }

    pub fn is_empty(&mut self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    pub fn last_modified(&mut self) -> Result<Option<String>, StoreError> {
        Ok(self.state()?.last_modified.clone())
    }

    /// Records whose identity is not excluded.
    pub fn filter(&mut self, records: Vec<ServerRecord>) -> Result<Vec<ServerRecord>, StoreError> {
        Ok(self.filter_with_report(records)?.0)
    }

    /// `(kept, dropped)`, both in input order.
    pub fn filter_with_report(
        &mut self,
        records: Vec<ServerRecord>,
    ) -> Result<(Vec<ServerRecord>, Vec<ServerRecord>), StoreError> {
        let ids: HashSet<&str> = self.state()?.entries.iter().map(|e| e.id.as_str()).collect();
        Ok(records
            .into_iter()
            .partition(|r| !ids.contains(r.identity().as_str())))
    }
}

/// Read the file. The second value is the legacy version it was upgraded from.
fn load(path: &Path) -> Result<(State, Option<u32>), StoreError> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((State::default(), None)),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if text.trim().is_empty() {
        return Ok((State::default(), None));
    }
    let corrupt = |message: String| StoreError::Corrupt {
        path: path.to_path_buf(),
        message,
    };
    let value: Value = serde_json::from_str(&text).map_err(|e| corrupt(e.to_string()))?;
    let (version, items, last_modified) = match &value {
        Value::Array(items) => (0, items.as_slice(), None),
        Value::Object(map) => {
            let version = match map.get("version") {
                None => 0,
                Some(v) => v
                    .as_u64()
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or_else(|| corrupt(format!("invalid version {v}")))?,
            };
            if version > STORE_VERSION {
                return Err(StoreError::UnsupportedVersion {
                    path: path.to_path_buf(),
                    found: version,
                    supported: STORE_VERSION,
                });
            }
            let items = match map.get("exclusions") {
                Some(Value::Array(a)) => a.as_slice(),
                None => &[][..],
                Some(_) => return Err(corrupt("`exclusions` is not an array".into())),
            };
            let lm = map
                .get("last_modified")
                .and_then(Value::as_str)
                .map(str::to_string);
            (version, items, lm)
        }
        _ => return Err(corrupt("expected an object or an array".into())),
    };

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(items.len());
    for item in items {
        let entry = entry_from_value(item).ok_or_else(|| corrupt(format!("bad entry {item}")))?;
        if seen.insert(entry.id.clone()) {
            entries.push(entry);
        }
    }
    let upgraded = (version < STORE_VERSION).then_some(version);
    Ok((
        State {
            entries,
            last_modified,
        },
        upgraded,
    ))
}

/// Current entries, plus the shapes older files used (a bare id, `identity`/`added_at`).
fn entry_from_value(v: &Value) -> Option<ExclusionEntry> {
    match v {
        Value::String(id) if !id.is_empty() => Some(ExclusionEntry {
            id: id.clone(),
            name: String::new(),
            reason: None,
            timestamp: now_rfc3339(),
        }),
        Value::Object(o) => {
            let s = |k: &str| o.get(k).and_then(Value::as_str).map(str::to_string);
            let id = s("id").or_else(|| s("identity")).filter(|i| !i.is_empty())?;
            Some(ExclusionEntry {
                id,
                name: s("name").unwrap_or_default(),
                reason: s("reason"),
                timestamp: s("timestamp")
                    .or_else(|| s("added_at"))
                    .unwrap_or_else(now_rfc3339),
            })
        }
        _ => None,
    }
}

pub type SharedStore = Arc<Mutex<ExclusionStore>>;

/// Hands out one store per resolved path.
///
/// Callers naming the same file share state; different files are independent.
#[derive(Debug, Default)]
pub struct ExclusionRegistry {
    stores: Mutex<HashMap<PathBuf, SharedStore>>,
}

impl ExclusionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, path: impl AsRef<Path>) -> SharedStore {
        let key = resolve(path.as_ref());
        self.stores
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ExclusionStore::new(key))))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.stores.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Canonical path when it exists; otherwise an absolute path under the
/// canonical parent so the key stays stable once the file is created.
fn resolve(path: &Path) -> PathBuf {
    if let Ok(p) = path.canonicalize() {
        return p;
    }
    let abs = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (abs.parent(), abs.file_name()) {
        (Some(dir), Some(name)) => dir
            .canonicalize()
            .map(|d| d.join(name))
            .unwrap_or_else(|_| abs.clone()),
        _ => abs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Protocol, ProxyAuthOpts};

    fn store() -> (tempfile::TempDir, ExclusionStore) {
        let dir = tempfile::tempdir().unwrap();
        let s = ExclusionStore::new(dir.path().join("exclusions.json"));
        (dir, s)
    }

    #[test]
    fn missing_file_is_empty_and_not_created() {
        let (_dir, mut s) = store();
        assert!(s.is_empty().unwrap());
        assert!(!s.path().exists());
    }

    #[test]
    fn add_remove_contains_and_file_format() {
        let (_dir, mut s) = store();
        assert!(s.add("abc", "HK 01", Some("slow")).unwrap());
        assert!(!s.add("abc", "HK 01 again", None).unwrap());
        assert!(s.contains("abc").unwrap());
        assert_eq!(s.len().unwrap(), 1);

        let v: Value = serde_json::from_str(&std::fs::read_to_string(s.path()).unwrap()).unwrap();
        assert_eq!(v["version"], 1);
        assert!(v["last_modified"].as_str().unwrap().ends_with('Z'));
        assert_eq!(v["exclusions"][0]["id"], "abc");
        assert_eq!(v["exclusions"][0]["reason"], "slow");
        assert!(v["exclusions"][0]["timestamp"].as_str().unwrap().ends_with('Z'));

        assert!(s.remove("abc").unwrap());
        assert!(!s.remove("abc").unwrap());
        assert!(s.get("abc").unwrap().is_none());
    }

    #[test]
    fn state_survives_reopen() {
        let (dir, mut s) = store();
        s.add_many(vec![
            ("a".to_string(), "A".to_string(), None),
            ("b".to_string(), "B".to_string(), Some("dead".to_string())),
            ("a".to_string(), "dup".to_string(), None),
        ])
        .unwrap();
        let mut again = ExclusionStore::new(dir.path().join("exclusions.json"));
        let ids: Vec<_> = again.list_all().unwrap().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(again.clear().unwrap(), 2);
        assert!(again.is_empty().unwrap());
    }

    #[test]
    fn failed_write_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("state");
        let mut s = ExclusionStore::new(sub.join("exclusions.json"));
        assert!(s.add("keep", "K", None).unwrap());

        // parent is now a plain file, so every write fails
        std::fs::remove_dir_all(&sub).unwrap();
        std::fs::write(&sub, b"").unwrap();

        assert!(matches!(s.add("new", "N", None), Err(StoreError::Io { .. })));
        assert!(!s.contains("new").unwrap());
        assert!(matches!(s.add("new", "N", None), Err(StoreError::Io { .. })));
        assert!(matches!(s.remove("keep"), Err(StoreError::Io { .. })));
        assert!(matches!(s.clear(), Err(StoreError::Io { .. })));
        assert_eq!(s.list_all().unwrap().len(), 1);

        std::fs::remove_file(&sub).unwrap();
        assert!(s.add("new", "N", None).unwrap());
        assert_eq!(s.len().unwrap(), 2);
    }

    #[test]
    fn newer_version_and_corrupt_files_are_rejected() {
        let (_dir, mut s) = store();
        std::fs::write(s.path(), r#"{"version": 9, "exclusions": []}"#).unwrap();
        assert!(matches!(
            s.list_all(),
            Err(StoreError::UnsupportedVersion { found: 9, .. })
        ));
        s.reload();
        std::fs::write(s.path(), "{ nope").unwrap();
        assert!(matches!(s.list_all(), Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn filter_drops_excluded_identities() {
        let (_dir, mut s) = store();
        let a = ServerRecord::new(Protocol::Socks(ProxyAuthOpts::default()), "h", 1).with_tag("a");
        let b = ServerRecord::new(Protocol::Socks(ProxyAuthOpts::default()), "h", 2).with_tag("b");
        s.add_record(&a, None).unwrap();
        let (kept, dropped) = s.filter_with_report(vec![a.clone(), b.clone()]).unwrap();
        assert_eq!(kept, vec![b]);
        assert_eq!(dropped, vec![a]);
    }

    #[test]
    fn registry_shares_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let reg = ExclusionRegistry::new();
        let p = dir.path().join("x.json");
        let a = reg.open(&p);
        let b = reg.open(dir.path().join(".").join("x.json"));
        let c = reg.open(dir.path().join("y.json"));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        a.lock().add("id", "n", None).unwrap();
        assert!(b.lock().contains("id").unwrap());
        assert!(!c.lock().contains("id").unwrap());
        assert_eq!(reg.len(), 2);
    }
}
