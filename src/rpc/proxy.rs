//! Outbound half of the JSON-RPC dialect: request IDs, pending-call table,
//! per-request timeout, response correlation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc::Sender;

use crate::error::{RpcError, Status};
use crate::message::Message;
use crate::timer::{TimerManager, TimerToken};

pub type Completion = Box<dyn FnOnce(Result<Value, RpcError>) + Send>;

pub(crate) const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

struct PendingCall {
    completion: Option<Completion>,
    timers: TimerManager,
    timer: TimerToken,
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        self.timers.cancel(self.timer);
    }
}

struct ProxyInner {
    next_id: AtomicU32,
    pending: Mutex<HashMap<u32, PendingCall>>,
    outbound: Sender<Message>,
    timers: TimerManager,
    default_timeout: Duration,
}

/// Cheap to clone: every clone shares the same pending table and id
/// counter, which is what lets a `Filesystem` adapter running on a
/// different task invoke through the same Proxy as the session's own
/// event loop.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<ProxyInner>,
}

impl Proxy {
    pub fn new(outbound: Sender<Message>, timers: TimerManager) -> Self {
        Proxy {
            inner: Arc::new(ProxyInner {
                next_id: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                outbound,
                timers,
                default_timeout: DEFAULT_TIMEOUT,
            }),
        }
    }

    pub fn with_timeout(
        outbound: Sender<Message>,
        timers: TimerManager,
        default_timeout: Duration,
    ) -> Self {
        Proxy {
            inner: Arc::new(ProxyInner {
                next_id: AtomicU32::new(1),
                pending: Mutex::new(HashMap::new()),
                outbound,
                timers,
                default_timeout,
            }),
        }
    }

    /// Allocates an id, frames `{method, params, id}`, schedules the
    /// timeout, appends to the send queue, and registers the pending call.
    /// Returns the allocated id.
    pub fn invoke(&self, method: &str, params: Value, completion: Completion) -> u32 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = json!({ "method": method, "params": params, "id": id });
        let serialized = frame.to_string();
        // A closed or full channel means the session is already gone, or
        // its writer is backed up past `worker_channel_count`; either way,
        // drop the Message rather than blocking this call or queuing it
        // forever.
        let _ = self.inner.outbound.try_send(Message::new(serialized));

        let proxy_for_timeout = self.clone();
        let token = self.inner.timers.schedule(
            self.inner.default_timeout,
            Box::new(move || proxy_for_timeout.on_timeout(id)),
        );

        self.inner.pending.lock().insert(
            id,
            PendingCall {
                completion: Some(completion),
                timers: self.inner.timers.clone(),
                timer: token,
            },
        );
        id
    }

    /// Parses and routes an inbound frame believed to be a response. A
    /// frame whose `id` cannot be correlated to a pending call (unknown,
    /// already resolved, or absent) is silently dropped -- it may be a
    /// response to a call this session never made, or one that already
    /// timed out.
    pub fn on_response(&self, raw: &str) {
        let parsed = parse_response(raw);
        if parsed.id < 0 {
            return;
        }
        self.complete(parsed.id as u32, parsed.into_result());
    }

    fn on_timeout(&self, id: u32) {
        self.complete(id, Err(RpcError::Timeout));
    }

    fn complete(&self, id: u32, result: Result<Value, RpcError>) {
        let pending = self.inner.pending.lock().remove(&id);
        let Some(mut pending) = pending else {
            return;
        };
        let completion = pending.completion.take();
        drop(pending);
        if let Some(completion) = completion {
            completion(result);
        }
    }

    /// Completes every outstanding call with `RpcError::Disposed` and
    /// drops every pending timer; called when the owning session closes.
    pub fn dispose(&self) {
        let entries: Vec<PendingCall> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().map(|(_, v)| v).collect()
        };
        for mut pending in entries {
            let completion = pending.completion.take();
            drop(pending);
            if let Some(completion) = completion {
                completion(Err(RpcError::Disposed));
            }
        }
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

/// Result of parsing one inbound frame that is expected to be a response.
pub struct ParsedResponse {
    pub status: i32,
    pub id: i64,
    pub result: Option<Value>,
    pub message: Option<String>,
}

impl ParsedResponse {
    fn into_result(self) -> Result<Value, RpcError> {
        if self.status == Status::Good.code() {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(RpcError::Remote {
                code: self.status,
                message: self.message.unwrap_or_else(|| "remote error".to_string()),
            })
        }
    }
}

/// Parses a raw inbound frame as a JSON-RPC response, matching the literal
/// scenarios in the response-parser test table: a missing/non-integer `id`
/// yields `-1`; a present `result` yields status `GOOD`; a present `error`
/// yields `status = error.code`; anything else is a non-`GOOD`,
/// format-error status.
pub fn parse_response(raw: &str) -> ParsedResponse {
    let value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => {
            return ParsedResponse {
                status: Status::BadFormat.code(),
                id: -1,
                result: None,
                message: None,
            }
        }
    };

    let id = value.get("id").and_then(Value::as_i64).unwrap_or(-1);

    if let Some(result) = value.get("result") {
        ParsedResponse {
            status: Status::Good.code(),
            id,
            result: Some(result.clone()),
            message: None,
        }
    } else if let Some(error) = value.get("error") {
        let code = error
            .get("code")
            .and_then(Value::as_i64)
            .unwrap_or(Status::Bad.code() as i64) as i32;
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        ParsedResponse {
            status: code,
            id,
            result: None,
            message,
        }
    } else {
        ParsedResponse {
            status: Status::BadFormat.code(),
            id,
            result: None,
            message: None,
        }
    }
}
