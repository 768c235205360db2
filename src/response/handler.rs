//! Pending request handlers and the futures they complete.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tracing::debug;

use super::ResponseError;

/// Completes one [`ResponseFuture`] when a response with its key arrives.
#[derive(Debug)]
pub struct ResponseHandler<V> {
    key: String,
    sender: Option<oneshot::Sender<V>>,
}

impl<V> ResponseHandler<V> {
    /// Creates a handler for `key` together with the future it completes.
    pub fn new(key: impl Into<String>) -> (Self, ResponseFuture<V>) {
        let key = key.into();
        let (sender, receiver) = oneshot::channel();
        (
            Self {
                key: key.clone(),
                sender: Some(sender),
            },
            ResponseFuture { key, receiver },
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_completed(&self) -> bool {
        self.sender.is_none()
    }

    /// Completes the future with `response` if `key` matches.
    ///
    /// Returns whether the response was accepted. A handler completes at
    /// most once.
    pub fn complete_if_match(&mut self, key: &str, response: V) -> bool {
        if key != self.key {
            return false;
        }
        match self.sender.take() {
            Some(sender) => {
                if sender.send(response).is_err() {
                    debug!(key = %self.key, "Response arrived after the caller gave up");
                } else {
                    debug!(key = %self.key, "Completed future");
                }
                true
            }
            None => false,
        }
    }
}

/// Resolves with the correlated response.
///
/// Resolves with [`ResponseError::Dropped`] when its handler is discarded
/// without a response, for instance on shutdown.
#[derive(Debug)]
pub struct ResponseFuture<V> {
    key: String,
    receiver: oneshot::Receiver<V>,
}

impl<V> ResponseFuture<V> {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl<V> Future for ResponseFuture<V> {
    type Output = Result<V, ResponseError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| ResponseError::Dropped { key: this.key.clone() }))
    }
}

/// Handlers waiting for a response, keyed by correlation key.
#[derive(Debug)]
pub struct PendingResponses<V> {
    handlers: Arc<Mutex<HashMap<String, ResponseHandler<V>>>>,
}

impl<V> Clone for PendingResponses<V> {
    fn clone(&self) -> Self {
        Self {
            handlers: self.handlers.clone(),
        }
    }
}

impl<V> Default for PendingResponses<V> {
    fn default() -> Self {
        Self {
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V> PendingResponses<V> {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut HashMap<String, ResponseHandler<V>>) -> R) -> R {
        let mut handlers = self.handlers.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut handlers)
    }

    /// Registers a handler for `key`, replacing any earlier one.
    pub fn register(&self, key: &str) -> ResponseFuture<V> {
        let (handler, future) = ResponseHandler::new(key);
        self.with(|handlers| handlers.insert(key.to_string(), handler));
        debug!(key = %key, "Registered handler");
        future
    }

    /// Completes and removes the handler for `key`.
    ///
    /// Returns `false` when no handler is waiting for `key`.
    pub fn complete(&self, key: &str, response: V) -> bool {
        match self.with(|handlers| handlers.remove(key)) {
            Some(mut handler) => handler.complete_if_match(key, response),
            None => false,
        }
    }

    /// Removes the handler for `key` without completing it.
    pub fn forget(&self, key: &str) -> bool {
        self.with(|handlers| handlers.remove(key)).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.with(|handlers| handlers.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.with(|handlers| handlers.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.with(|handlers| handlers.keys().cloned().collect());
        keys.sort();
        keys
    }

    /// Drops every handler; their futures resolve with `Dropped`.
    pub fn clear(&self) -> usize {
        self.with(|handlers| {
            let count = handlers.len();
            handlers.clear();
            count
        })
    }
}
