//! JSON-RPC dialect: outbound [`proxy`] and inbound [`dispatcher`] halves.

pub mod dispatcher;
pub mod proxy;

pub use dispatcher::{Dispatcher, Request};
pub use proxy::{parse_response, Completion, ParsedResponse, Proxy};
