//! Inbound half of the JSON-RPC dialect: method registry and per-request
//! single-use response writer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Map, Value};

use crate::error::Status;
use crate::message::Message;

/// Handed to a registered handler exactly once. `respond`/`respond_error`
/// consume it, so a handler cannot call either twice; if a handler returns
/// without calling one of them, `Drop` produces a generic `Bad` response so
/// the caller is never left hanging. The outcome is written into a shared
/// cell rather than pushed through a callback, so handlers are free to
/// hold a `&mut` borrow of their session for the full duration of the call
/// without aliasing it against the response path.
pub struct Request {
    id: i64,
    params: Value,
    result: Map<String, Value>,
    outcome: Arc<Mutex<Option<Message>>>,
    responded: bool,
}

impl Request {
    fn new(id: i64, params: Value, outcome: Arc<Mutex<Option<Message>>>) -> Self {
        Request {
            id,
            params,
            result: Map::new(),
            outcome,
            responded: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// Accumulates one field of the eventual success result object.
    pub fn set_result(&mut self, key: &str, value: Value) {
        self.result.insert(key.to_string(), value);
    }

    pub fn respond(mut self) {
        self.responded = true;
        let frame = json!({ "result": Value::Object(std::mem::take(&mut self.result)), "id": self.id });
        self.publish(frame);
    }

    pub fn respond_error(mut self, status: Status) {
        self.responded = true;
        let frame = json!({
            "error": { "code": status.code(), "message": status.message() },
            "id": self.id,
        });
        self.publish(frame);
    }

    fn publish(&self, frame: Value) {
        *self.outcome.lock().unwrap() = Some(Message::new(frame.to_string()));
    }
}

impl Drop for Request {
    fn drop(&mut self) {
        if !self.responded {
            log::error!(
                "request id {} dropped without a terminal response; replying Bad",
                self.id
            );
            let frame = json!({
                "error": { "code": Status::Bad.code(), "message": Status::Bad.message() },
                "id": self.id,
            });
            self.publish(frame);
        }
    }
}

pub type Handler<U> = Arc<dyn Fn(Request, &mut U) + Send + Sync>;

/// `method name -> handler`. Built once (typically alongside the
/// `ServerProtocol`) and shared read-only across every session.
pub struct Dispatcher<U> {
    handlers: HashMap<String, Handler<U>>,
}

impl<U> Default for Dispatcher<U> {
    fn default() -> Self {
        Self::new()
    }
}

impl<U> Dispatcher<U> {
    pub fn new() -> Self {
        Dispatcher {
            handlers: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: impl Fn(Request, &mut U) + Send + Sync + 'static,
    ) {
        self.handlers.insert(method.into(), Arc::new(handler));
    }

    /// Parses `raw` as a request frame and dispatches it, returning the
    /// response frame to enqueue (`None` when the frame was dropped
    /// silently: unparseable JSON, or missing `id`).
    ///
    /// Requires `method` (string) and `id` (integer); a frame with an `id`
    /// but no valid `method` is a protocol error, replied with
    /// `BAD_FORMAT`.
    pub fn process(&self, raw: &str, user: &mut U) -> Option<Message> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let id = value.get("id").and_then(Value::as_i64)?;

        let method = match value.get("method").and_then(Value::as_str) {
            Some(m) => m.to_string(),
            None => {
                let frame = json!({
                    "error": { "code": Status::BadFormat.code(), "message": Status::BadFormat.message() },
                    "id": id,
                });
                return Some(Message::new(frame.to_string()));
            }
        };

        let params = value.get("params").cloned().unwrap_or(Value::Array(Vec::new()));
        let outcome = Arc::new(Mutex::new(None));
        let request = Request::new(id, params, outcome.clone());

        match self.handlers.get(&method) {
            Some(handler) => handler(request, user),
            None => request.respond_error(Status::BadNotImplemented),
        }

        outcome.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_method_responds_not_implemented() {
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        let mut user = ();
        let msg = dispatcher
            .process(r#"{"method":"nope","params":[],"id":1}"#, &mut user)
            .unwrap();
        assert!(msg.0.contains(&Status::BadNotImplemented.code().to_string()));
    }

    #[test]
    fn missing_id_is_dropped_silently() {
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        let mut user = ();
        let msg = dispatcher.process(r#"{"method":"nope","params":[]}"#, &mut user);
        assert!(msg.is_none());
    }

    #[test]
    fn handler_that_forgets_to_respond_gets_a_bad_reply_via_drop() {
        let mut dispatcher: Dispatcher<()> = Dispatcher::new();
        dispatcher.register("noop", |_req, _user| {
            // intentionally does not call respond()/respond_error()
        });
        let mut user = ();
        let msg = dispatcher
            .process(r#"{"method":"noop","params":[],"id":7}"#, &mut user)
            .unwrap();
        assert!(msg.0.contains(&Status::Bad.code().to_string()));
    }

    #[test]
    fn handler_reads_params_and_builds_a_multi_field_result() {
        let mut dispatcher: Dispatcher<()> = Dispatcher::new();
        dispatcher.register("add_filesystem", |mut req, _user| {
            let name = req.params().get(0).and_then(Value::as_str).unwrap().to_string();
            req.set_result("id", Value::String(name));
            req.set_result("count", json!(2));
            req.respond();
        });
        let mut user = ();
        let msg = dispatcher
            .process(r#"{"method":"add_filesystem","params":["test"],"id":1}"#, &mut user)
            .unwrap();
        let response: Value = serde_json::from_str(&msg.0).unwrap();
        assert_eq!(response["result"]["id"], "test");
        assert_eq!(response["result"]["count"], 2);
    }
}
