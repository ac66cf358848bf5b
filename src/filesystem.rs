//! Bridges kernel filesystem callbacks to RPC calls against a single
//! registered remote filesystem.
//!
//! Each callback builds an RPC context (here: just the moved-in `Reply*`
//! object and whatever arguments the method needs), invokes the Proxy, and
//! supplies a completion that translates the result or failure into a
//! kernel reply. Because the completion fires later, on whichever task
//! happens to drive the owning session's event loop, every `Reply*` type
//! this module touches must be `Send` -- which is exactly the contract
//! `fuser` gives them.

use std::collections::HashSet;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, Filesystem, ReplyAttr, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, Request as KernelRequest};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::json::{self, EntryKind, Stat};
use crate::rpc::Proxy;

const ATTR_TTL: Duration = Duration::from_secs(1);
const ENTRY_TTL: Duration = Duration::from_secs(1);

/// Tracks which inodes this filesystem has vouched for via `lookup`. Not
/// load-bearing for correctness -- the provider is the source of truth --
/// but gives the adapter a place to hang per-inode bookkeeping, per the
/// "local inode table" attribute: a kernel request against an inode this
/// table has never seen is a sign the provider and the kernel's dentry
/// cache have drifted, which is worth a log line even though the request
/// still proceeds normally.
#[derive(Default)]
struct InodeTable {
    known: HashSet<u64>,
}

impl InodeTable {
    fn observe(&mut self, ino: u64) {
        self.known.insert(ino);
    }

    fn is_known(&self, ino: u64) -> bool {
        self.known.contains(&ino)
    }
}

/// One per registered remote filesystem (`add_filesystem`). Owns a
/// non-owning handle to its Session's Proxy (cheap to clone: `Proxy` is
/// `Arc`-backed) and the kernel mount handle that results from spawning it
/// with `fuser`.
pub struct FilesystemAdapter {
    name: String,
    proxy: Proxy,
    inodes: Arc<Mutex<InodeTable>>,
}

impl FilesystemAdapter {
    pub fn new(name: String, proxy: Proxy) -> Self {
        FilesystemAdapter {
            name,
            proxy,
            inodes: Arc::new(Mutex::new(InodeTable::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn stat_to_attr(stat: &Stat) -> FileAttr {
        let to_time = |secs: i64| {
            if secs >= 0 {
                UNIX_EPOCH + Duration::from_secs(secs as u64)
            } else {
                UNIX_EPOCH
            }
        };
        FileAttr {
            ino: stat.inode,
            size: stat.size,
            blocks: stat.size.div_ceil(512),
            atime: to_time(stat.atime),
            mtime: to_time(stat.mtime),
            ctime: to_time(stat.ctime),
            crtime: to_time(stat.ctime),
            kind: match stat.kind {
                EntryKind::File => FileType::RegularFile,
                EntryKind::Dir => FileType::Directory,
            },
            perm: (stat.mode & 0o7777) as u16,
            nlink: 1,
            uid: 0,
            gid: 0,
            rdev: 0,
            blksize: 512,
            flags: 0,
        }
    }
}

impl Filesystem for FilesystemAdapter {
    fn lookup(&self, _req: &KernelRequest<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(entry_name) = name.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let fs_name = self.name.clone();
        let entry_name = entry_name.to_string();
        let inodes = self.inodes.clone();
        self.proxy.invoke(
            "lookup",
            json!([fs_name, parent, entry_name]),
            Box::new(move |result| match result.and_then(|v| {
                json::parse_stat(&v).map_err(|e| crate::error::RpcError::BadResponse(e))
            }) {
                Ok(stat) => {
                    inodes.lock().observe(stat.inode);
                    let attr = FilesystemAdapter::stat_to_attr(&stat);
                    reply.entry(&ENTRY_TTL, &attr, 0);
                }
                Err(_) => reply.error(libc::ENOENT),
            }),
        );
    }

    fn getattr(&self, _req: &KernelRequest<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if !self.inodes.lock().is_known(ino) {
            log::debug!("getattr on inode {ino} of filesystem {} with no prior lookup", self.name);
        }
        let fs_name = self.name.clone();
        self.proxy.invoke(
            "getattr",
            json!([fs_name, ino]),
            Box::new(move |result| match result.and_then(|v| {
                json::parse_stat(&v).map_err(|e| crate::error::RpcError::BadResponse(e))
            }) {
                Ok(stat) => {
                    let attr = FilesystemAdapter::stat_to_attr(&stat);
                    reply.attr(&ATTR_TTL, &attr);
                }
                Err(_) => reply.error(libc::ENOENT),
            }),
        );
    }

    fn open(&self, _req: &KernelRequest<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let fs_name = self.name.clone();
        self.proxy.invoke(
            "open",
            json!([fs_name, ino, flags]),
            Box::new(move |result| match result {
                Ok(value) => match json::object_get(&value, "handle").and_then(json::require_u64) {
                    Some(handle) => reply.opened(handle, 0),
                    None => reply.error(libc::ENOENT),
                },
                Err(_) => reply.error(libc::ENOENT),
            }),
        );
    }

    fn read(
        &self,
        _req: &KernelRequest<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let fs_name = self.name.clone();
        self.proxy.invoke(
            "read",
            json!([fs_name, ino, fh, offset, size]),
            Box::new(move |result| match result.and_then(decode_read_result) {
                Ok(bytes) => reply.data(&bytes),
                Err(_) => reply.error(libc::ENOENT),
            }),
        );
    }

    fn readdir(
        &self,
        _req: &KernelRequest<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs_name = self.name.clone();
        self.proxy.invoke(
            "readdir",
            json!([fs_name, ino, offset]),
            Box::new(move |result| {
                let entries = match result.and_then(decode_readdir_result) {
                    Ok(entries) => entries,
                    Err(_) => {
                        reply.error(libc::ENOENT);
                        return;
                    }
                };
                for (index, (name, entry_ino)) in entries.iter().enumerate() {
                    // FileType is unknown from this RPC's result shape; kernel
                    // accepts a best-effort kind here and corrects it via a
                    // follow-up lookup/getattr, so default to RegularFile.
                    let full = reply.add(*entry_ino, offset + index as i64 + 1, FileType::RegularFile, name);
                    if full {
                        break;
                    }
                }
                reply.ok();
            }),
        );
    }

    fn release(
        &self,
        _req: &KernelRequest<'_>,
        ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fs_name = self.name.clone();
        self.proxy.invoke(
            "release",
            json!([fs_name, ino, fh]),
            Box::new(move |result| match result {
                Ok(_) => reply.ok(),
                Err(_) => reply.error(libc::ENOENT),
            }),
        );
    }
}

fn decode_read_result(value: Value) -> Result<Vec<u8>, crate::error::RpcError> {
    let bad = |msg: &str| crate::error::RpcError::BadResponse(msg.to_string());
    let data = json::object_get(&value, "data")
        .and_then(json::require_str)
        .ok_or_else(|| bad("missing `data`"))?;
    let format = json::object_get(&value, "format")
        .and_then(json::require_str)
        .unwrap_or("identity");
    match format {
        "identity" => Ok(data.as_bytes().to_vec()),
        "base64" => {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| bad(&format!("invalid base64: {e}")))
        }
        other => Err(bad(&format!("unknown read format `{other}`"))),
    }
}

fn decode_readdir_result(value: Value) -> Result<Vec<(String, u64)>, crate::error::RpcError> {
    let bad = |msg: &str| crate::error::RpcError::BadResponse(msg.to_string());
    let array = value.as_array().ok_or_else(|| bad("readdir result is not an array"))?;
    let mut entries = Vec::with_capacity(array.len());
    for item in array {
        let name = json::object_get(item, "name")
            .and_then(json::require_str)
            .ok_or_else(|| bad("entry missing `name`"))?;
        let inode = json::object_get(item, "inode")
            .and_then(json::require_u64)
            .ok_or_else(|| bad("entry missing `inode`"))?;
        entries.push((name.to_string(), inode));
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_identity_read_result() {
        let v = json!({"data": "hello", "format": "identity", "count": 5});
        assert_eq!(decode_read_result(v).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn decodes_base64_read_result() {
        let v = json!({"data": "aGVsbG8=", "format": "base64", "count": 5});
        assert_eq!(decode_read_result(v).unwrap(), b"hello".to_vec());
    }

    #[test]
    fn rejects_missing_data_field() {
        let v = json!({"format": "identity"});
        assert!(decode_read_result(v).is_err());
    }

    #[test]
    fn inode_table_tracks_observed_inodes() {
        let mut table = InodeTable::default();
        assert!(!table.is_known(7));
        table.observe(7);
        assert!(table.is_known(7));
        assert!(!table.is_known(8));
    }

    #[test]
    fn decodes_readdir_entries() {
        let v = json!([{"name": "a", "inode": 2}, {"name": "b", "inode": 3}]);
        let entries = decode_readdir_result(v).unwrap();
        assert_eq!(entries, vec![("a".to_string(), 2), ("b".to_string(), 3)]);
    }
}
