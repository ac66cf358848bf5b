//! Glues WebSocket connection lifecycle to sessions: owns the
//! authenticators registry, the mountpoint factory, and the dispatcher
//! `authenticate`/`add_filesystem` are registered on. Every accepted
//! connection becomes its own tokio task running a `select!` loop over
//! three event sources -- inbound WebSocket frames, the outbound send
//! channel, and the session's Timer Manager -- which is this port's
//! realization of "every entry point runs on the same event-loop thread"
//! scoped down to a per-session serial executor (spec §9).

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use crate::auth::{Authenticators, Credentials};
use crate::error::Status;
use crate::message::Message;
use crate::mount::MountpointFactory;
use crate::rpc::{Dispatcher, Request};
use crate::session::{Session, SessionHandle};
use crate::timer::TimerManager;

/// Subprotocol this role of the bridge serves: the adapter side, taking
/// connections from filesystem providers.
pub const SUBPROTOCOL: &str = "fs";

fn authenticate_handler(mut request: Request, session: &mut Session) {
    let params = request.params().clone();
    let kind = params.get(0).and_then(Value::as_str);
    let fields = params.get(1).and_then(Value::as_object);
    match (kind, fields) {
        (Some(kind), Some(fields)) => {
            let credentials = Credentials {
                kind: kind.to_string(),
                fields: fields.clone(),
            };
            if session.authenticate(Some(&credentials)) {
                request.respond();
            } else {
                request.respond_error(Status::BadAccessDenied);
            }
        }
        _ => request.respond_error(Status::BadAccessDenied),
    }
}

fn add_filesystem_handler(mut request: Request, session: &mut Session) {
    if !session.is_authenticated() {
        request.respond_error(Status::BadAccessDenied);
        return;
    }
    match request.params().get(0).and_then(Value::as_str) {
        Some(name) => {
            let name = name.to_string();
            match session.add_filesystem(&name) {
                Ok(()) => {
                    request.set_result("id", Value::String(name));
                    request.respond();
                }
                Err(err) => request.respond_error(err.status()),
            }
        }
        None => request.respond_error(Status::BadFormat),
    }
}

pub struct ServerProtocol {
    dispatcher: Arc<Dispatcher<Session>>,
    authenticators: Authenticators,
    mountpoint_factory: Arc<dyn MountpointFactory>,
    default_rpc_timeout: Duration,
    worker_channel_count: usize,
    live_handles: Arc<Mutex<HashSet<u64>>>,
    next_handle: Arc<AtomicU64>,
}

impl ServerProtocol {
    pub fn new(
        authenticators: Authenticators,
        mountpoint_factory: Arc<dyn MountpointFactory>,
        default_rpc_timeout: Duration,
    ) -> Self {
        Self::with_worker_channel_count(
            authenticators,
            mountpoint_factory,
            default_rpc_timeout,
            crate::config::Config::default().worker_channel_count,
        )
    }

    pub fn with_worker_channel_count(
        authenticators: Authenticators,
        mountpoint_factory: Arc<dyn MountpointFactory>,
        default_rpc_timeout: Duration,
        worker_channel_count: usize,
    ) -> Self {
        let mut dispatcher = Dispatcher::new();
        dispatcher.register("authenticate", authenticate_handler);
        dispatcher.register("add_filesystem", add_filesystem_handler);

        ServerProtocol {
            dispatcher: Arc::new(dispatcher),
            authenticators,
            mountpoint_factory,
            default_rpc_timeout,
            worker_channel_count,
            live_handles: Arc::new(Mutex::new(HashSet::new())),
            next_handle: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn session_count(&self) -> usize {
        self.live_handles.lock().len()
    }

    /// Binds and accepts connections until an I/O error tears down the
    /// listener itself; each connection is handed its own task immediately
    /// and never blocks this loop.
    pub async fn serve(&self, bind_addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr).await?;
        log::info!("webmount listening on {}", listener.local_addr()?);
        self.run(listener).await
    }

    /// Accepts connections off an already-bound listener; split out from
    /// [`Self::serve`] so tests can bind an ephemeral port and learn its
    /// address before handing the listener over.
    pub async fn run(&self, listener: TcpListener) -> std::io::Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let handle = SessionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
            log::debug!("accepted connection {peer} as session {}", handle.0);

            let dispatcher = self.dispatcher.clone();
            let authenticators = self.authenticators.clone();
            let mountpoint_factory = self.mountpoint_factory.clone();
            let default_timeout = self.default_rpc_timeout;
            let worker_channel_count = self.worker_channel_count;
            let live_handles = self.live_handles.clone();

            tokio::spawn(async move {
                live_handles.lock().insert(handle.0);
                run_connection(
                    stream,
                    handle,
                    dispatcher,
                    authenticators,
                    mountpoint_factory,
                    default_timeout,
                    worker_channel_count,
                )
                .await;
                live_handles.lock().remove(&handle.0);
            });
        }
    }
}

fn reject_unless_fs_subprotocol(
    request: &HandshakeRequest,
    mut response: HandshakeResponse,
) -> Result<HandshakeResponse, tokio_tungstenite::tungstenite::handshake::server::ErrorResponse> {
    let offers_fs = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|p| p.trim() == SUBPROTOCOL))
        .unwrap_or(false);
    if offers_fs {
        response.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            SUBPROTOCOL.parse().expect("static ascii value"),
        );
    }
    Ok(response)
}

#[allow(clippy::too_many_arguments)]
async fn run_connection(
    stream: TcpStream,
    handle: SessionHandle,
    dispatcher: Arc<Dispatcher<Session>>,
    authenticators: Authenticators,
    mountpoint_factory: Arc<dyn MountpointFactory>,
    default_timeout: Duration,
    worker_channel_count: usize,
) {
    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, reject_unless_fs_subprotocol).await {
        Ok(ws) => ws,
        Err(e) => {
            log::warn!("websocket handshake failed for session {}: {e}", handle.0);
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(worker_channel_count);
    let timers = TimerManager::new();

    let mut session = Session::with_timeout(
        handle,
        outbound_tx,
        dispatcher,
        authenticators,
        mountpoint_factory,
        timers.clone(),
        default_timeout,
    );

    // ESTABLISHED: authenticate anonymously so a registered "" authenticator
    // auto-grants before the provider sends a single frame.
    session.authenticate(None);

    loop {
        let deadline = timers
            .next_deadline()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));
        let sleep = tokio::time::sleep_until(deadline);
        tokio::pin!(sleep);

        tokio::select! {
            _ = &mut sleep => {
                timers.check();
            }
            incoming = ws_stream.next() => {
                timers.check();
                match incoming {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(response) = session.receive(text.as_str(), true) {
                            session.enqueue(response);
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Binary/ping/pong frames carry no JSON-RPC payload
                        // in this dialect (§6: text frames only); ignore.
                    }
                    Some(Err(e)) => {
                        log::warn!("session {} websocket read error: {e}", handle.0);
                        break;
                    }
                }
            }
            maybe_message = outbound_rx.recv() => {
                timers.check();
                match maybe_message {
                    Some(message) => session.enqueue(message),
                    None => {}
                }
            }
        }

        while session.has_queued_sends() {
            let Some(message) = session.on_writable() else {
                break;
            };
            if ws_sink.send(WsMessage::text(message.into_inner())).await.is_err() {
                log::warn!("session {} write failed, closing", handle.0);
                session.dispose();
                return;
            }
        }
    }

    session.dispose();
}
