//! The kernel-level mount, an external collaborator per spec §1. This
//! module supplies the one concrete implementation this crate ships:
//! spawning a background `fuser` session rooted under a configured
//! directory, named after the registered filesystem.

use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use fuser::MountOption;

use crate::error::MountError;
use crate::filesystem::FilesystemAdapter;
use crate::rpc::Proxy;

/// Opaque identifier for a mounted filesystem's kernel side. Used by
/// `Session::contains`/`process_filesystem_request` to know which
/// filesystem a routed event belongs to; since `fuser`'s background
/// session owns its own kernel-request dispatch thread, this crate never
/// actually receives a raw-readable event to route (see DESIGN.md), so the
/// handle mostly exists for identity and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MountHandle(pub(crate) u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_handle() -> MountHandle {
    MountHandle(NEXT_HANDLE.fetch_add(1, Ordering::SeqCst))
}

/// A live mount: an opaque guard dropped when the mount should go away
/// (for `FuserMountpointFactory`, a `BackgroundSession` that unmounts on
/// drop), plus the handle used for bookkeeping. Boxed as `dyn Any` rather
/// than naming `BackgroundSession` directly so test doubles can hand back
/// a `Mount` without spawning a real kernel mount.
pub struct Mount {
    pub handle: MountHandle,
    _guard: Box<dyn Any + Send>,
}

impl Mount {
    pub fn new(guard: impl Any + Send) -> Self {
        Mount {
            handle: next_handle(),
            _guard: Box::new(guard),
        }
    }
}

pub trait MountpointFactory: Send + Sync {
    /// Creates a kernel mount for `name`, bridging kernel callbacks through
    /// `proxy`. Returns an error if the mount cannot be created (bad name,
    /// I/O failure, name already taken at the filesystem level).
    fn mount(&self, name: &str, proxy: Proxy) -> Result<Mount, MountError>;
}

/// Mounts each registered filesystem at `<mount_root>/<name>`, creating
/// the directory if needed.
pub struct FuserMountpointFactory {
    mount_root: PathBuf,
    options: Vec<MountOption>,
}

impl FuserMountpointFactory {
    pub fn new(mount_root: PathBuf) -> Self {
        FuserMountpointFactory {
            mount_root,
            options: vec![MountOption::FSName("webmount".to_string())],
        }
    }

    pub fn with_options(mount_root: PathBuf, options: Vec<MountOption>) -> Self {
        FuserMountpointFactory { mount_root, options }
    }
}

impl MountpointFactory for FuserMountpointFactory {
    fn mount(&self, name: &str, proxy: Proxy) -> Result<Mount, MountError> {
        let mountpoint = self.mount_root.join(name);
        std::fs::create_dir_all(&mountpoint)?;

        let adapter = FilesystemAdapter::new(name.to_string(), proxy);
        let background = fuser::spawn_mount2(adapter, &mountpoint, &self.options)
            .map_err(|e| MountError::Rejected(e.to_string()))?;

        Ok(Mount::new(background))
    }
}
