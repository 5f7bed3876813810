//! Listener registry and dispatch
//!
//! Incoming commands are matched against listeners registered under their
//! header. A one-shot listener completes a [`ResponseFuture`] at most once and
//! is removed as soon as it resolves, is cancelled, or its future is dropped.
//! An indication listener runs its callback on every match until cancelled.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, trace, warn};

use crate::commands::Command;
use crate::protocol::{HlCommonHeader, ProtocolError};

const LISTENER: &str = "zboss_core::listener";

/// Identifier of a registered listener
pub type ListenerId = u64;

type SyncCallback = Arc<dyn Fn(&Command) -> anyhow::Result<()> + Send + Sync>;
type CallbackFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
type AsyncCallback = Arc<dyn Fn(Command) -> CallbackFuture + Send + Sync>;

/// Callback of an indication listener
#[derive(Clone)]
pub enum IndicationCallback {
    /// Runs inline during dispatch
    Sync(SyncCallback),
    /// Spawned as its own task, never awaited by dispatch
    Async(AsyncCallback),
}

impl IndicationCallback {
    /// Wrap a callback run inline during dispatch
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(&Command) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        IndicationCallback::Sync(Arc::new(callback))
    }

    /// Wrap an async callback, spawned once per matching command
    pub fn new_async<F, Fut>(callback: F) -> Self
    where
        F: Fn(Command) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        IndicationCallback::Async(Arc::new(move |command| -> CallbackFuture {
            Box::pin(callback(command))
        }))
    }

    /// Run the callback; failures and panics are logged and swallowed
    pub(crate) fn invoke(&self, command: &Command) {
        match self {
            IndicationCallback::Sync(callback) => {
                match catch_unwind(AssertUnwindSafe(|| callback(command))) {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => warn!(
                        target: LISTENER,
                        "Indication callback failed for {}: {:#}",
                        command,
                        err
                    ),
                    Err(_) => error!(target: LISTENER, "Indication callback panicked for {}", command),
                }
            }
            IndicationCallback::Async(callback) => {
                let name = command.name();
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let task = callback(command.clone());
                        handle.spawn(async move {
                            if let Err(err) = task.await {
                                warn!(
                                    target: LISTENER,
                                    "Async indication callback failed for {}: {:#}",
                                    name,
                                    err
                                );
                            }
                        });
                    }
                    Err(_) => warn!(
                        target: LISTENER,
                        "No runtime to run async callback for {}",
                        name
                    ),
                }
            }
        }
    }
}

impl std::fmt::Debug for IndicationCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndicationCallback::Sync(_) => f.write_str("IndicationCallback::Sync"),
            IndicationCallback::Async(_) => f.write_str("IndicationCallback::Async"),
        }
    }
}

/// Something waiting for commands
#[derive(Debug)]
pub enum Listener {
    /// Completes a single future with the first matching command
    OneShot {
        /// Matching any one completes the listener
        patterns: Vec<Command>,
        /// Taken on completion or cancellation
        sender: Option<oneshot::Sender<Command>>,
    },
    /// Invokes a callback on every matching command
    Indication {
        /// Matching any one runs the callback
        patterns: Vec<Command>,
        /// Run once per matching command
        callback: IndicationCallback,
    },
}

impl Listener {
    /// One-shot listener and the receiving end of its completion slot
    pub fn one_shot(patterns: Vec<Command>) -> (Self, oneshot::Receiver<Command>) {
        let (sender, rx) = oneshot::channel();
        (
            Listener::OneShot {
                patterns,
                sender: Some(sender),
            },
            rx,
        )
    }

    /// Listener running `callback` on every match
    pub fn indication(patterns: Vec<Command>, callback: IndicationCallback) -> Self {
        Listener::Indication { patterns, callback }
    }

    /// Patterns this listener matches against
    pub fn patterns(&self) -> &[Command] {
        match self {
            Listener::OneShot { patterns, .. } | Listener::Indication { patterns, .. } => patterns,
        }
    }

    /// Whether this listener completes a future
    pub fn is_one_shot(&self) -> bool {
        matches!(self, Listener::OneShot { .. })
    }

    /// Distinct headers among the patterns, in first-seen order
    pub fn matching_headers(&self) -> Vec<HlCommonHeader> {
        let mut headers = Vec::new();
        for pattern in self.patterns() {
            let header = pattern.header();
            if !headers.contains(&header) {
                headers.push(header);
            }
        }
        headers
    }

    /// Whether any pattern matches `command`
    pub fn matches(&self, command: &Command) -> bool {
        self.patterns().iter().any(|p| p.matches(command))
    }

    /// Complete a one-shot listener with `command` if it matches.
    ///
    /// Returns false for a listener that already completed or was cancelled.
    /// Indication listeners only report whether they match; their callback is
    /// run by the caller.
    pub fn resolve(&mut self, command: &Command) -> bool {
        if !self.matches(command) {
            return false;
        }

        match self {
            Listener::OneShot { sender, .. } => match sender.take() {
                Some(tx) if !tx.is_closed() => tx.send(command.clone()).is_ok(),
                _ => false,
            },
            Listener::Indication { .. } => true,
        }
    }

    /// Cancel a pending one-shot listener; indications cannot be cancelled this way
    pub fn cancel(&mut self) -> bool {
        match self {
            Listener::OneShot { sender, .. } => {
                // Dropping the sender wakes the receiver with an error
                sender.take();
                true
            }
            Listener::Indication { .. } => false,
        }
    }
}

/// Result of dispatching one command
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Whether any listener matched
    pub matched: bool,
    /// Indication callbacks to run once the registry lock is released
    pub callbacks: Vec<IndicationCallback>,
}

/// Header-keyed listener buckets, insertion order preserved
#[derive(Debug, Default)]
pub struct Registry {
    next_id: ListenerId,
    listeners: HashMap<ListenerId, Listener>,
    buckets: HashMap<HlCommonHeader, Vec<ListenerId>>,
}

impl Registry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener to the bucket of every header among its patterns
    pub fn register(&mut self, listener: Listener) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;

        for header in listener.matching_headers() {
            trace!(target: LISTENER, "Registering listener {} for {}", id, header);
            self.buckets.entry(header).or_default().push(id);
        }
        self.listeners.insert(id, listener);
        id
    }

    /// Remove a listener from every bucket; no-op if already gone
    pub fn unregister(&mut self, id: ListenerId) -> Option<Listener> {
        let listener = self.listeners.remove(&id)?;

        for header in listener.matching_headers() {
            if let Some(bucket) = self.buckets.get_mut(&header) {
                bucket.retain(|other| *other != id);
                if bucket.is_empty() {
                    self.buckets.remove(&header);
                }
            }
        }
        trace!(target: LISTENER, "Unregistered listener {}", id);
        Some(listener)
    }

    /// Cancel and drop every listener
    pub fn clear(&mut self) {
        for (_, mut listener) in self.listeners.drain() {
            listener.cancel();
        }
        self.buckets.clear();
    }

    /// Number of registered listeners
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Whether no listeners are registered
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Number of listeners in the bucket for `header`
    pub fn bucket_len(&self, header: &HlCommonHeader) -> usize {
        self.buckets.get(header).map_or(0, Vec::len)
    }

    /// Resolve `command` against the listeners for its header.
    ///
    /// Only the first matching one-shot listener resolves, so one response
    /// never satisfies two waiters. Every matching indication is reported.
    pub fn dispatch(&mut self, command: &Command) -> Dispatch {
        let mut outcome = Dispatch::default();
        let Some(ids) = self.buckets.get(&command.header()).cloned() else {
            return outcome;
        };

        let mut one_shot_matched = false;
        let mut resolved = Vec::new();

        for id in ids {
            let Some(listener) = self.listeners.get_mut(&id) else {
                continue;
            };

            if listener.is_one_shot() {
                if one_shot_matched {
                    continue;
                }
                if listener.resolve(command) {
                    debug!(target: LISTENER, "Listener {} resolved by {}", id, command);
                    one_shot_matched = true;
                    outcome.matched = true;
                    resolved.push(id);
                }
            } else if listener.resolve(command) {
                if let Listener::Indication { callback, .. } = listener {
                    outcome.callbacks.push(callback.clone());
                }
                outcome.matched = true;
            }
        }

        for id in resolved {
            self.unregister(id);
        }
        outcome
    }
}

/// Shared handle to a registry
pub type SharedRegistry = Arc<Mutex<Registry>>;

/// Resolves with the command that matched a one-shot listener.
///
/// Dropping or cancelling the future unregisters its listener.
#[derive(Debug)]
pub struct ResponseFuture {
    id: ListenerId,
    rx: oneshot::Receiver<Command>,
    registry: Weak<Mutex<Registry>>,
}

impl ResponseFuture {
    /// Register a one-shot listener for `patterns`
    pub fn register(registry: &SharedRegistry, patterns: Vec<Command>) -> Self {
        let (listener, rx) = Listener::one_shot(patterns);
        let id = registry.lock().register(listener);
        Self {
            id,
            rx,
            registry: Arc::downgrade(registry),
        }
    }

    /// Identifier of the registered listener
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Stop waiting; the future then resolves to [`ProtocolError::Cancelled`]
    /// unless a command already arrived
    pub fn cancel(&mut self) {
        self.remove();
        self.rx.close();
    }

    fn remove(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().unregister(self.id);
        }
    }
}

impl Future for ResponseFuture {
    type Output = Result<Command, ProtocolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|result| result.map_err(|_| ProtocolError::Cancelled))
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        self.remove();
    }
}

/// Cancellable handle to an indication listener; dropping it does not cancel
#[derive(Debug, Clone)]
pub struct IndicationHandle {
    id: ListenerId,
    registry: Weak<Mutex<Registry>>,
}

impl IndicationHandle {
    /// Register an indication listener for `patterns`
    pub fn register(
        registry: &SharedRegistry,
        patterns: Vec<Command>,
        callback: IndicationCallback,
    ) -> Self {
        let id = registry
            .lock()
            .register(Listener::indication(patterns, callback));
        Self {
            id,
            registry: Arc::downgrade(registry),
        }
    }

    /// Identifier of the registered listener
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Remove the listener; idempotent
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().unregister(self.id);
        }
    }
}
