//! # Dispatcher
//!
//! Routes decoded packets to registered handlers.
//!
//! Candidates are kept sorted by `(priority desc, specificity desc,
//! registration order asc)`. For each packet the dispatcher walks that list
//! one entry at a time: group prefix (once per group per packet), then the
//! handler's filters, then the callback. A filter therefore sees whatever
//! earlier handlers changed, and nothing after a stop or a fault is checked.
//!
//! In concurrent mode all matches are collected up front, before any
//! callback runs.
//!
//! The candidate list is copy-on-write: registration swaps in a new
//! `Arc<Vec<_>>`, and a dispatch pass works on the snapshot it started with,
//! so no lock is held while a handler runs.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, trace, warn};

use crate::core::client::Client;
use crate::core::packet::Packet;
use crate::error::constants::{ERR_DISPATCHER_READ_LOCK, ERR_DISPATCHER_WRITE_LOCK};
use crate::error::{ProtocolError, Result};
use crate::protocol::fault::{default_fault_reply, Fault, FaultKind};
use crate::protocol::filter::Filter;
use crate::protocol::handler::{Group, Handler, Outcome, Propagation};

type FaultHook = dyn Fn(&Fault, &Client) -> Option<Value> + Send + Sync + 'static;

/// How several matching handlers run for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// One after another in candidate order
    #[default]
    Sequential,
    /// All matching handlers at once; replies are kept in candidate order up
    /// to the first stop or fault
    Concurrent,
}

/// What happened to one packet
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub sequence: u64,
    /// Names of invoked handlers, in candidate order
    pub invoked: Vec<String>,
    /// Replies queued to the sender
    pub replies: usize,
    /// A handler stopped propagation
    pub stopped: bool,
    /// Handler fault or no-match, if any
    pub fault: Option<Fault>,
}

impl DispatchReport {
    pub fn matched(&self) -> bool {
        !self.invoked.is_empty()
    }
}

#[derive(Debug)]
struct GroupScope {
    id: u64,
    name: String,
    filters: Vec<Filter>,
}

impl GroupScope {
    fn matches(&self, packet: &Packet, client: &Client) -> bool {
        self.filters.iter().all(|f| f.check(packet, client))
    }
}

#[derive(Debug)]
struct Entry {
    handler: Handler,
    group: Option<Arc<GroupScope>>,
    specificity: usize,
    order: u64,
}

impl Entry {
    fn sort_key(&self) -> (Reverse<i32>, Reverse<usize>, u64) {
        (
            Reverse(self.handler.get_priority()),
            Reverse(self.specificity),
            self.order,
        )
    }
}

/// Handler registry and dispatch loop shared by every connection
pub struct Dispatcher {
    entries: RwLock<Arc<Vec<Arc<Entry>>>>,
    fault_hook: RwLock<Arc<FaultHook>>,
    next_order: AtomicU64,
    next_group: AtomicU64,
    mode: DispatchMode,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_mode(DispatchMode::default())
    }

    pub fn with_mode(mode: DispatchMode) -> Self {
        let hook: Arc<FaultHook> = Arc::new(|fault: &Fault, _: &Client| default_fault_reply(fault));
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            fault_hook: RwLock::new(hook),
            next_order: AtomicU64::new(0),
            next_group: AtomicU64::new(0),
            mode,
        }
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    fn insert(&self, mut new: Vec<Entry>) -> Result<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(ERR_DISPATCHER_WRITE_LOCK))?;

        let mut next: Vec<Arc<Entry>> = (**entries).clone();
        for mut entry in new.drain(..) {
            entry.order = self.next_order.fetch_add(1, Ordering::Relaxed);
            let key = entry.sort_key();
            let pos = next.partition_point(|e| e.sort_key() <= key);
            next.insert(pos, Arc::new(entry));
        }
        *entries = Arc::new(next);
        Ok(())
    }

    /// Register a top-level handler.
    pub fn register(&self, handler: Handler) -> Result<()> {
        debug!(
            handler = handler.name(),
            priority = handler.get_priority(),
            specificity = handler.specificity(),
            "Registering handler"
        );
        let specificity = handler.specificity();
        self.insert(vec![Entry {
            handler,
            group: None,
            specificity,
            order: 0,
        }])
    }

    /// Register every member of a group behind the group's filter prefix.
    pub fn register_group(&self, group: Group) -> Result<()> {
        let prefix = group.specificity();
        let (name, filters, handlers) = group.into_parts();
        let scope = Arc::new(GroupScope {
            id: self.next_group.fetch_add(1, Ordering::Relaxed),
            name,
            filters,
        });
        debug!(group = %scope.name, members = handlers.len(), "Registering group");

        let entries = handlers
            .into_iter()
            .map(|handler| Entry {
                specificity: prefix + handler.specificity(),
                group: Some(scope.clone()),
                handler,
                order: 0,
            })
            .collect();
        self.insert(entries)
    }

    /// Replace the hook that turns recoverable faults into replies.
    pub fn set_fault_handler<F>(&self, hook: F) -> Result<()>
    where
        F: Fn(&Fault, &Client) -> Option<Value> + Send + Sync + 'static,
    {
        let mut current = self
            .fault_hook
            .write()
            .map_err(|_| ProtocolError::LockPoisoned(ERR_DISPATCHER_WRITE_LOCK))?;
        *current = Arc::new(hook);
        Ok(())
    }

    /// Ask the fault hook for a reply. A panicking hook yields no reply.
    pub fn fault_reply(&self, fault: &Fault, client: &Client) -> Option<Value> {
        let hook = match self.fault_hook.read() {
            Ok(hook) => hook.clone(),
            Err(_) => {
                error!("{ERR_DISPATCHER_READ_LOCK}");
                return default_fault_reply(fault);
            }
        };
        catch_unwind(AssertUnwindSafe(|| hook(fault, client))).unwrap_or_else(|_| {
            error!(kind = %fault.kind, "Fault handler panicked");
            None
        })
    }

    /// Run the fault hook and queue its reply to the client.
    pub fn report_fault(&self, fault: &Fault, client: &Client) {
        if let Some(reply) = self.fault_reply(fault, client) {
            // A closed client cannot be told anything.
            let _ = client.send(reply);
        }
    }

    /// Number of registered handlers, group members included
    pub fn len(&self) -> usize {
        self.snapshot().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handler names in dispatch order
    pub fn handler_names(&self) -> Vec<String> {
        self.snapshot()
            .map(|entries| entries.iter().map(|e| e.handler.name().to_string()).collect())
            .unwrap_or_default()
    }

    fn snapshot(&self) -> Result<Arc<Vec<Arc<Entry>>>> {
        self.entries
            .read()
            .map(|entries| entries.clone())
            .map_err(|_| ProtocolError::LockPoisoned(ERR_DISPATCHER_READ_LOCK))
    }

    /// Whether `entry` accepts the packet. Group prefixes are cached in
    /// `groups` so each is evaluated at most once per packet.
    fn admits(
        entry: &Entry,
        groups: &mut HashMap<u64, bool>,
        packet: &Packet,
        client: &Client,
    ) -> bool {
        if let Some(scope) = &entry.group {
            let passed = *groups
                .entry(scope.id)
                .or_insert_with(|| scope.matches(packet, client));
            if !passed {
                return false;
            }
        }
        entry.handler.matches(packet, client)
    }

    /// Every matching candidate in order, for concurrent dispatch.
    fn candidates(entries: &[Arc<Entry>], packet: &Packet, client: &Client) -> Vec<Arc<Entry>> {
        let mut groups = HashMap::new();
        entries
            .iter()
            .filter(|entry| Self::admits(entry, &mut groups, packet, client))
            .cloned()
            .collect()
    }

    fn handler_fault(&self, entry: &Entry, err: &ProtocolError, sequence: u64) -> Fault {
        let name = entry.handler.name();
        let fault = match Fault::from_error(err) {
            Some(fault) if fault.kind == FaultKind::Capacity => fault.with_handler(name),
            _ => Fault::new(FaultKind::Handler, err.to_string()).with_handler(name),
        };
        warn!(handler = name, sequence, error = %err, "Handler failed");
        fault.with_sequence(sequence)
    }

    /// Apply one handler outcome. Returns `true` when the pass must end.
    fn settle(
        &self,
        entry: &Entry,
        result: Result<Outcome>,
        packet: &Packet,
        report: &mut DispatchReport,
    ) -> bool {
        let client = packet.sender();
        match result {
            Ok(Outcome { reply, propagation }) => {
                if let Some(reply) = reply {
                    if client.send(reply).is_ok() {
                        report.replies += 1;
                    }
                }
                if propagation == Propagation::Stop {
                    trace!(handler = entry.handler.name(), sequence = report.sequence, "Propagation stopped");
                    report.stopped = true;
                    return true;
                }
                false
            }
            Err(err) => {
                let fault = self.handler_fault(entry, &err, report.sequence);
                self.report_fault(&fault, client);
                report.fault = Some(fault);
                true
            }
        }
    }

    /// Run one dispatch pass for `packet`.
    ///
    /// Handler faults are isolated: they end this pass and are reported to
    /// the fault hook, but never surface as an `Err`. The only error is a
    /// poisoned registry lock.
    pub async fn dispatch(&self, packet: Arc<Packet>) -> Result<DispatchReport> {
        let entries = self.snapshot()?;
        let client = packet.sender().clone();
        let mut report = DispatchReport {
            sequence: packet.sequence(),
            ..DispatchReport::default()
        };

        match self.mode {
            DispatchMode::Sequential => {
                let mut groups = HashMap::new();
                for entry in entries.iter() {
                    if !Self::admits(entry, &mut groups, &packet, &client) {
                        continue;
                    }
                    report.invoked.push(entry.handler.name().to_string());
                    let result = entry.handler.invoke(packet.clone(), client.clone()).await;
                    if self.settle(entry, result, &packet, &mut report) {
                        break;
                    }
                }
            }
            DispatchMode::Concurrent => {
                let candidates = Self::candidates(&entries, &packet, &client);
                let results = join_all(
                    candidates
                        .iter()
                        .map(|entry| entry.handler.invoke(packet.clone(), client.clone())),
                )
                .await;
                report.invoked = candidates
                    .iter()
                    .map(|e| e.handler.name().to_string())
                    .collect();
                for (entry, result) in candidates.iter().zip(results) {
                    if self.settle(entry, result, &packet, &mut report) {
                        break;
                    }
                }
            }
        }

        if report.invoked.is_empty() {
            let fault = Fault::new(FaultKind::NoMatch, "no handler accepted the packet")
                .with_sequence(report.sequence);
            debug!(client_id = %client.id(), sequence = report.sequence, "No matching handler");
            self.report_fault(&fault, &client);
            report.fault = Some(fault);
            return Ok(report);
        }

        trace!(
            client_id = %client.id(),
            sequence = report.sequence,
            invoked = report.invoked.len(),
            stopped = report.stopped,
            "Dispatch complete"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handler_names())
            .field("mode", &self.mode)
            .finish()
    }
}
