//! Field access over loosely typed JSON objects (sing-box outbounds, Clash
//! proxies after YAML→JSON conversion, vmess share links).

use serde_json::{Map, Value};

use super::EntryError;
use crate::model::Scalar;

pub(crate) type Obj = Map<String, Value>;

/// First present key rendered as text; numbers and booleans are stringified.
pub(crate) fn text(obj: &Obj, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|k| match obj.get(*k)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    })
}

/// Like [`text`] but blank strings count as absent.
pub(crate) fn non_empty(obj: &Obj, keys: &[&str]) -> Option<String> {
    text(obj, keys).filter(|s| !s.trim().is_empty())
}

pub(crate) fn scalar(obj: &Obj, keys: &[&str]) -> Option<Scalar> {
    keys.iter().find_map(|k| obj.get(*k).and_then(Scalar::from_json))
}

pub(crate) fn flag(obj: &Obj, keys: &[&str]) -> Option<bool> {
    scalar(obj, keys).and_then(|s| s.as_bool())
}

/// Port as number or numeric string. Absent is 0 so validation can report it.
pub(crate) fn port(obj: &Obj, keys: &[&str]) -> Result<u16, EntryError> {
    let Some(v) = keys.iter().find_map(|k| obj.get(*k)) else {
        return Ok(0);
    };
    let parsed = match v {
        Value::Number(n) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| EntryError::Port(v.to_string().trim_matches('"').to_string()))
}

/// Array of strings, or a single comma separated string.
pub(crate) fn list(obj: &Obj, keys: &[&str]) -> Vec<String> {
    let Some(v) = keys.iter().find_map(|k| obj.get(*k)) else {
        return Vec::new();
    };
    match v {
        Value::Array(items) => items
            .iter()
            .filter_map(|i| i.as_str().map(str::trim))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        Value::String(s) => split_list(s),
        _ => Vec::new(),
    }
}

pub(crate) fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub(crate) fn object<'a>(obj: &'a Obj, key: &str) -> Option<&'a Obj> {
    obj.get(key).and_then(Value::as_object)
}

/// WireGuard `reserved`: `[1,2,3]` or `"1,2,3"`.
pub(crate) fn reserved(obj: &Obj, keys: &[&str]) -> Result<Option<Vec<u8>>, EntryError> {
    let Some(v) = keys.iter().find_map(|k| obj.get(*k)) else {
        return Ok(None);
    };
    let bad = || EntryError::Malformed(format!("invalid reserved bytes {v}"));
    let out = match v {
        Value::Array(items) => items
            .iter()
            .map(|i| i.as_u64().and_then(|n| u8::try_from(n).ok()).ok_or_else(bad))
            .collect::<Result<Vec<_>, _>>()?,
        Value::String(s) => parse_reserved(s).ok_or_else(bad)?,
        _ => return Err(bad()),
    };
    Ok(Some(out))
}

pub(crate) fn parse_reserved(s: &str) -> Option<Vec<u8>> {
    s.split(',').map(|p| p.trim().parse::<u8>().ok()).collect()
}
