//! Keyed request/response correlation over a broker topic.
//!
//! A caller registers a correlation key with a [`ResponseManager`] and gets a
//! [`ResponseFuture`]; the manager's dispatcher task polls the response
//! topic and completes the future whose key matches an incoming record.
//! Responses without a waiting handler are logged as orphans. The matcher
//! never times out a request; callers bound the wait themselves.
//!
//! # Examples
//!
//! ```
//! use cdc_interceptor::response::PendingResponses;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pending = PendingResponses::new();
//! let future = pending.register("REQ-1");
//! assert!(pending.complete("REQ-1", "done"));
//! assert_eq!(future.await.unwrap(), "done");
//! # }
//! ```

pub mod decoder;
pub mod dispatcher;
pub mod handler;
pub mod manager;

pub use decoder::{JsonResponseDecoder, ResponseDecoder};
pub use dispatcher::ResponseDispatcher;
pub use handler::{PendingResponses, ResponseFuture, ResponseHandler};
pub use manager::{ResponseManager, ResponseRegistry};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    #[error("Handler for key '{key}' was dropped before a response arrived")]
    Dropped { key: String },

    #[error("No response for key '{key}' within {timeout_ms} ms")]
    Timeout { key: String, timeout_ms: u64 },

    #[error("Failed to decode response: {0}")]
    Decode(String),
}
