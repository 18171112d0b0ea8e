//! # Handlers and Groups
//!
//! A [`Handler`] pairs a filter set and a priority with a callback. The
//! callback reports what happened through an [`Outcome`]: an optional reply
//! and whether later handlers may still see the packet. Stopping propagation
//! is ordinary data, not an error.
//!
//! Callbacks are synchronous closures or async functions returning a boxed
//! future. A panic inside either is caught and reported as a handler fault.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::core::client::Client;
use crate::core::packet::Packet;
use crate::error::{ProtocolError, Result};
use crate::protocol::filter::Filter;

/// Whether later candidates may see the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Propagation {
    #[default]
    Continue,
    Stop,
}

/// Result of one handler invocation
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Outcome {
    /// Value written back to the sender
    pub reply: Option<Value>,
    pub propagation: Propagation,
}

impl Outcome {
    /// No reply, let later handlers run
    pub fn next() -> Self {
        Self::default()
    }

    /// No reply, no further handlers
    pub fn stop() -> Self {
        Self {
            reply: None,
            propagation: Propagation::Stop,
        }
    }

    pub fn reply(value: impl Into<Value>) -> Self {
        Self {
            reply: Some(value.into()),
            propagation: Propagation::Continue,
        }
    }

    pub fn reply_and_stop(value: impl Into<Value>) -> Self {
        Self {
            reply: Some(value.into()),
            propagation: Propagation::Stop,
        }
    }

    pub fn is_stop(&self) -> bool {
        self.propagation == Propagation::Stop
    }
}

type SyncFn = dyn Fn(&Packet, &Client) -> Result<Outcome> + Send + Sync + 'static;
type AsyncFn = dyn Fn(Arc<Packet>, Client) -> BoxFuture<'static, Result<Outcome>> + Send + Sync + 'static;

#[derive(Clone)]
enum Callback {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
}

/// A registered packet handler
#[derive(Clone)]
pub struct Handler {
    name: String,
    filters: Vec<Filter>,
    priority: i32,
    callback: Callback,
}

impl Handler {
    /// Handler with a synchronous callback
    pub fn new<F>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Packet, &Client) -> Result<Outcome> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            filters: Vec::new(),
            priority: 0,
            callback: Callback::Sync(Arc::new(callback)),
        }
    }

    /// Handler with an async callback
    pub fn new_async<F, Fut>(name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(Arc<Packet>, Client) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Outcome>> + Send + 'static,
    {
        Self {
            name: name.into(),
            filters: Vec::new(),
            priority: 0,
            callback: Callback::Async(Arc::new(move |packet, client| callback(packet, client).boxed())),
        }
    }

    /// Add a filter; all filters must pass
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Higher runs first
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_priority(&self) -> i32 {
        self.priority
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Sum of the specificity of this handler's own filters
    pub fn specificity(&self) -> usize {
        self.filters.iter().map(Filter::specificity).sum()
    }

    /// All own filters pass. Filters are evaluated in registration order and
    /// evaluation stops at the first failure.
    pub fn matches(&self, packet: &Packet, client: &Client) -> bool {
        self.filters.iter().all(|f| f.check(packet, client))
    }

    /// Run the callback, converting a panic into `HandlerPanicked`.
    pub async fn invoke(&self, packet: Arc<Packet>, client: Client) -> Result<Outcome> {
        match &self.callback {
            Callback::Sync(f) => catch_unwind(AssertUnwindSafe(|| f(&packet, &client)))
                .unwrap_or_else(|_| Err(ProtocolError::HandlerPanicked(self.name.clone()))),
            Callback::Async(f) => {
                let fut = match catch_unwind(AssertUnwindSafe(|| f(packet, client))) {
                    Ok(fut) => fut,
                    Err(_) => return Err(ProtocolError::HandlerPanicked(self.name.clone())),
                };
                AssertUnwindSafe(fut)
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| Err(ProtocolError::HandlerPanicked(self.name.clone())))
            }
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("filters", &self.filters)
            .finish()
    }
}

/// Handlers scoped by a shared filter prefix.
///
/// The group's filters are checked once per packet before any member's own
/// filters. Members are ordered globally with every other handler; a
/// member's specificity includes the group prefix.
#[derive(Debug, Clone)]
pub struct Group {
    name: String,
    filters: Vec<Filter>,
    handlers: Vec<Handler>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            filters: Vec::new(),
            handlers: Vec::new(),
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn handler(mut self, handler: Handler) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    pub fn handlers(&self) -> &[Handler] {
        &self.handlers
    }

    pub fn specificity(&self) -> usize {
        self.filters.iter().map(Filter::specificity).sum()
    }

    pub fn matches(&self, packet: &Packet, client: &Client) -> bool {
        self.filters.iter().all(|f| f.check(packet, client))
    }

    pub(crate) fn into_parts(self) -> (String, Vec<Filter>, Vec<Handler>) {
        (self.name, self.filters, self.handlers)
    }
}
