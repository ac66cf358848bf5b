//! Typed, read-only accessors over a parsed JSON document.
//!
//! `serde_json::Value` already exposes most of this, but callers throughout
//! the RPC layer need the same "get field, require this exact type, else
//! treat as a format error" shape over and over; these helpers name that
//! shape once.

use serde_json::Value;

/// Required field in an object; `None` covers both "missing" and "wrong
/// container" (non-object `v`).
pub fn object_get<'a>(v: &'a Value, key: &str) -> Option<&'a Value> {
    v.as_object().and_then(|m| m.get(key))
}

pub fn array_get(v: &Value, index: usize) -> Option<&Value> {
    v.as_array().and_then(|a| a.get(index))
}

pub fn require_str<'a>(v: &'a Value) -> Option<&'a str> {
    v.as_str()
}

pub fn require_object(v: &Value) -> Option<&serde_json::Map<String, Value>> {
    v.as_object()
}

pub fn require_i64(v: &Value) -> Option<i64> {
    v.as_i64()
}

pub fn require_u64(v: &Value) -> Option<u64> {
    v.as_u64()
}

/// The stat object the wire format exchanges for `lookup`/`getattr`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat {
    pub inode: u64,
    pub mode: u32,
    pub kind: EntryKind,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
}

/// Parses a stat object out of an RPC result. Strict: any missing field,
/// wrong type, or unrecognized `type` value is a parse failure, matching
/// "Result validation is strict" (component design, Filesystem Adapter).
pub fn parse_stat(result: &Value) -> Result<Stat, String> {
    let inode = object_get(result, "inode")
        .and_then(require_u64)
        .ok_or("missing or non-integer `inode`")?;
    let mode = object_get(result, "mode")
        .and_then(require_i64)
        .ok_or("missing or non-integer `mode`")? as u32;
    let kind = match object_get(result, "type").and_then(require_str) {
        Some("file") => EntryKind::File,
        Some("dir") => EntryKind::Dir,
        Some(other) => return Err(format!("unknown entry type `{other}`")),
        None => return Err("missing `type`".to_string()),
    };
    let size = object_get(result, "size")
        .and_then(require_u64)
        .ok_or("missing or non-integer `size`")?;
    let atime = object_get(result, "atime")
        .and_then(require_i64)
        .ok_or("missing or non-integer `atime`")?;
    let mtime = object_get(result, "mtime")
        .and_then(require_i64)
        .ok_or("missing or non-integer `mtime`")?;
    let ctime = object_get(result, "ctime")
        .and_then(require_i64)
        .ok_or("missing or non-integer `ctime`")?;

    Ok(Stat {
        inode,
        mode,
        kind,
        size,
        atime,
        mtime,
        ctime,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_valid_stat() {
        let v = json!({"inode": 2, "mode": 420, "type": "file", "size": 42, "atime": 0, "mtime": 0, "ctime": 0});
        let stat = parse_stat(&v).unwrap();
        assert_eq!(stat.inode, 2);
        assert_eq!(stat.kind, EntryKind::File);
        assert_eq!(stat.size, 42);
    }

    #[test]
    fn rejects_missing_field() {
        let v = json!({"type": "file"});
        assert!(parse_stat(&v).is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let v = json!({"inode": 1, "mode": 0, "type": "socket", "size": 0, "atime": 0, "mtime": 0, "ctime": 0});
        assert!(parse_stat(&v).is_err());
    }
}
