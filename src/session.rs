//! Per-connection state: one reassembly buffer, one send queue, one Proxy,
//! zero or more registered filesystems.

use std::sync::Arc;

use serde_json::Value;

use crate::auth::{Authenticators, Credentials};
use crate::error::{MountError, Status};
use crate::message::{Message, SendQueue};
use crate::mount::{Mount, MountHandle, MountpointFactory};
use crate::rpc::{Dispatcher, Proxy};
use crate::timer::TimerManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

struct RegisteredFilesystem {
    name: String,
    mount: Mount,
}

/// Created on `ESTABLISHED`, destroyed on `CLOSED`. Exclusively owns its
/// Proxy, send queue, and filesystems; holds non-owning (`Arc`/clone)
/// references to the registries shared across every session.
pub struct Session {
    handle: SessionHandle,
    authenticated: bool,
    recv_buffer: String,
    send_queue: SendQueue,
    proxy: Proxy,
    dispatcher: Arc<Dispatcher<Session>>,
    authenticators: Authenticators,
    mountpoint_factory: Arc<dyn MountpointFactory>,
    timers: TimerManager,
    filesystems: Vec<RegisteredFilesystem>,
}

const RECV_BUFFER_INITIAL_CAPACITY: usize = 8 * 1024;

impl Session {
    pub fn new(
        handle: SessionHandle,
        outbound: tokio::sync::mpsc::Sender<Message>,
        dispatcher: Arc<Dispatcher<Session>>,
        authenticators: Authenticators,
        mountpoint_factory: Arc<dyn MountpointFactory>,
        timers: TimerManager,
    ) -> Self {
        Self::with_timeout(
            handle,
            outbound,
            dispatcher,
            authenticators,
            mountpoint_factory,
            timers,
            crate::rpc::proxy::DEFAULT_TIMEOUT,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_timeout(
        handle: SessionHandle,
        outbound: tokio::sync::mpsc::Sender<Message>,
        dispatcher: Arc<Dispatcher<Session>>,
        authenticators: Authenticators,
        mountpoint_factory: Arc<dyn MountpointFactory>,
        timers: TimerManager,
        default_timeout: std::time::Duration,
    ) -> Self {
        Session {
            handle,
            authenticated: false,
            recv_buffer: String::with_capacity(RECV_BUFFER_INITIAL_CAPACITY),
            send_queue: SendQueue::new(),
            proxy: Proxy::with_timeout(outbound, timers.clone(), default_timeout),
            dispatcher,
            authenticators,
            mountpoint_factory,
            timers,
            filesystems: Vec::new(),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn timers(&self) -> &TimerManager {
        &self.timers
    }

    /// `creds = None` is the anonymous path taken right after
    /// `ESTABLISHED`: granted only if an authenticator is registered under
    /// the empty type. Re-authentication is allowed and may change the
    /// flag in either direction (see DESIGN.md).
    pub fn authenticate(&mut self, creds: Option<&Credentials>) -> bool {
        self.authenticated = match creds {
            None => self.authenticators.grants_anonymous(),
            Some(creds) => self.authenticators.check(creds),
        };
        self.authenticated
    }

    /// Requires `is_authenticated()`; validates `name` against
    /// `[A-Za-z0-9_]+`, asks the Mountpoint Factory to create the mount,
    /// and registers the resulting Filesystem.
    pub fn add_filesystem(&mut self, name: &str) -> Result<(), AddFilesystemError> {
        if !self.authenticated {
            return Err(AddFilesystemError::AccessDenied);
        }
        if !is_valid_filesystem_name(name) {
            return Err(AddFilesystemError::BadFormat);
        }
        let mount = self
            .mountpoint_factory
            .mount(name, self.proxy.clone())
            .map_err(AddFilesystemError::Mount)?;
        self.filesystems.push(RegisteredFilesystem {
            name: name.to_string(),
            mount,
        });
        Ok(())
    }

    /// Appends reassembled bytes; on the final fragment, parses and
    /// classifies the full frame. Returns the response to enqueue for a
    /// request frame, if any -- the caller (the session's own event loop)
    /// pushes it into the send queue, since that keeps mutable access to
    /// `self` single-threaded and sequential.
    pub fn receive(&mut self, data: &str, is_final: bool) -> Option<Message> {
        if !is_final {
            self.recv_buffer.push_str(data);
            return None;
        }

        let response = if self.recv_buffer.is_empty() {
            self.process_frame(data)
        } else {
            self.recv_buffer.push_str(data);
            let full = std::mem::take(&mut self.recv_buffer);
            self.process_frame(&full)
        };
        self.recv_buffer.clear();
        response
    }

    fn process_frame(&mut self, raw: &str) -> Option<Message> {
        let value: Value = serde_json::from_str(raw).ok()?;
        if value.get("method").is_some() {
            let dispatcher = self.dispatcher.clone();
            dispatcher.process(raw, self)
        } else if value.get("result").is_some() || value.get("error").is_some() {
            self.proxy.on_response(raw);
            None
        } else {
            None
        }
    }

    /// Pushes a frame produced outside the receive path (a dispatcher
    /// response computed by the caller, or anything else the session's own
    /// task wants to send) onto the local queue.
    pub fn enqueue(&mut self, message: Message) {
        self.send_queue.enqueue(message);
    }

    /// Pops one message for the caller to actually write to the
    /// transport. One frame per writable-equivalent event.
    pub fn on_writable(&mut self) -> Option<Message> {
        self.send_queue.drain_one()
    }

    pub fn has_queued_sends(&self) -> bool {
        !self.send_queue.is_empty()
    }

    /// True if `handle` is the kernel mount handle of a filesystem
    /// registered on this session. A dispatcher fielding a raw-readable
    /// event calls this on every live session in turn to find the one
    /// whose filesystem owns the handle, then routes the event to
    /// [`Self::process_filesystem_request`] on that session. In this port,
    /// `fuser`'s background session dispatches kernel requests on its own
    /// thread the instant they arrive, so no raw-readable event is ever
    /// actually routed through here; the method is kept, correctly typed
    /// against the registered filesystems' own handles, for API
    /// completeness and testability (see DESIGN.md).
    pub fn contains(&self, handle: MountHandle) -> bool {
        self.filesystems.iter().any(|fs| fs.mount.handle == handle)
    }

    /// Finds the registered filesystem whose kernel handle is `handle` and
    /// asks it to service its pending kernel request. Returns whether such
    /// a filesystem was found. A no-op beyond that lookup in this port: a
    /// `FilesystemAdapter` mounted via `fuser::spawn_mount2` has no
    /// "pending request" to service here, since the `BackgroundSession`
    /// already delivered it straight to the adapter's `Filesystem` callback
    /// on its own thread (see DESIGN.md).
    pub fn process_filesystem_request(&self, handle: MountHandle) -> bool {
        self.filesystems.iter().any(|fs| fs.mount.handle == handle)
    }

    /// Disposes every pending RPC with `DisposedError` and drops every
    /// queued Message. Called when the connection closes.
    pub fn dispose(&mut self) {
        self.proxy.dispose();
        self.send_queue.clear();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddFilesystemError {
    #[error("access denied")]
    AccessDenied,
    #[error("bad filesystem name")]
    BadFormat,
    #[error("mount failed: {0}")]
    Mount(#[from] MountError),
}

impl AddFilesystemError {
    pub fn status(&self) -> Status {
        match self {
            AddFilesystemError::AccessDenied => Status::BadAccessDenied,
            AddFilesystemError::BadFormat => Status::BadFormat,
            AddFilesystemError::Mount(_) => Status::Bad,
        }
    }
}

pub fn is_valid_filesystem_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
