//! Lifecycle event registries for graphs and nodes
//!
//! Events fire synchronously, inline with the operation that caused them.
//! During `Graph::run` node events may be delivered from worker threads;
//! a per-registration lock guarantees that no two deliveries to the same
//! registration ever overlap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::data::NodeData;
use crate::error::{raise, FlowError, Result};

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

struct Listener<E> {
    id: u64,
    active: Arc<AtomicBool>,
    delivery: Arc<Mutex<()>>,
    callback: Arc<dyn Fn(&E) + Send + Sync>,
}

impl<E> Clone for Listener<E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            active: Arc::clone(&self.active),
            delivery: Arc::clone(&self.delivery),
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Callback list for one event kind
pub(crate) struct EventHub<E> {
    listeners: Arc<Mutex<Vec<Listener<E>>>>,
}

impl<E: 'static> EventHub<E> {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn subscribe(
        &self,
        callback: impl Fn(&E) + Send + Sync + 'static,
    ) -> EventRegistration {
        let id = NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));
        let listener = Listener {
            id,
            active: Arc::clone(&active),
            delivery: Arc::new(Mutex::new(())),
            callback: Arc::new(callback),
        };
        self.listeners.lock().unwrap().push(listener);

        let weak: Weak<Mutex<Vec<Listener<E>>>> = Arc::downgrade(&self.listeners);
        let detach_weak = weak.clone();
        EventRegistration {
            active,
            source_alive: Box::new(move || weak.upgrade().is_some()),
            detach: Box::new(move || {
                if let Some(listeners) = detach_weak.upgrade() {
                    listeners.lock().unwrap().retain(|l| l.id != id);
                }
            }),
        }
    }

    /// Deliver `event` to every active listener.
    ///
    /// The listener list is snapshotted first so callbacks may register or
    /// unregister without deadlocking.
    pub(crate) fn emit(&self, event: &E) {
        let snapshot: Vec<Listener<E>> = self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            let _serialized = listener.delivery.lock().unwrap();
            if listener.active.load(Ordering::Acquire) {
                (listener.callback)(event);
            }
        }
    }
}

/// A cancellable event subscription.
///
/// Valid until explicitly unregistered or until its source object is
/// destroyed, whichever comes first.
pub struct EventRegistration {
    active: Arc<AtomicBool>,
    source_alive: Box<dyn Fn() -> bool + Send + Sync>,
    detach: Box<dyn Fn() + Send + Sync>,
}

impl EventRegistration {
    /// Whether this registration is still active and its source alive
    pub fn is_valid(&self) -> bool {
        self.active.load(Ordering::Acquire) && (self.source_alive)()
    }

    /// Cancel the registration. Fails if it is already invalid.
    pub fn unregister(&self) -> Result<()> {
        if !self.is_valid() {
            return Err(raise(FlowError::InvalidHandle(
                "event registration is no longer active".to_string(),
            )));
        }
        self.active.store(false, Ordering::Release);
        (self.detach)();
        Ok(())
    }
}

/// Structural event registry owned by a graph
pub struct GraphEvents {
    pub(crate) node_added: EventHub<Arc<super::node::Node>>,
    pub(crate) node_removed: EventHub<Arc<super::node::Node>>,
    pub(crate) nodes_connected: EventHub<Arc<super::graph::Connection>>,
    pub(crate) nodes_disconnected: EventHub<Arc<super::graph::Connection>>,
    pub(crate) error: EventHub<String>,
}

impl GraphEvents {
    pub(crate) fn new() -> Self {
        Self {
            node_added: EventHub::new(),
            node_removed: EventHub::new(),
            nodes_connected: EventHub::new(),
            nodes_disconnected: EventHub::new(),
            error: EventHub::new(),
        }
    }

    pub fn on_node_added(
        &self,
        callback: impl Fn(&Arc<super::node::Node>) + Send + Sync + 'static,
    ) -> EventRegistration {
        self.node_added.subscribe(callback)
    }

    pub fn on_node_removed(
        &self,
        callback: impl Fn(&Arc<super::node::Node>) + Send + Sync + 'static,
    ) -> EventRegistration {
        self.node_removed.subscribe(callback)
    }

    pub fn on_nodes_connected(
        &self,
        callback: impl Fn(&Arc<super::graph::Connection>) + Send + Sync + 'static,
    ) -> EventRegistration {
        self.nodes_connected.subscribe(callback)
    }

    pub fn on_nodes_disconnected(
        &self,
        callback: impl Fn(&Arc<super::graph::Connection>) + Send + Sync + 'static,
    ) -> EventRegistration {
        self.nodes_disconnected.subscribe(callback)
    }

    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> EventRegistration {
        self.error.subscribe(move |message: &String| callback(message))
    }
}

/// Computational event registry owned by a node
pub struct NodeEvents {
    pub(crate) compute: EventHub<()>,
    pub(crate) error: EventHub<String>,
    pub(crate) set_input: EventHub<(String, NodeData)>,
    pub(crate) set_output: EventHub<(String, NodeData)>,
}

impl NodeEvents {
    pub(crate) fn new() -> Self {
        Self {
            compute: EventHub::new(),
            error: EventHub::new(),
            set_input: EventHub::new(),
            set_output: EventHub::new(),
        }
    }

    pub fn on_compute(&self, callback: impl Fn() + Send + Sync + 'static) -> EventRegistration {
        self.compute.subscribe(move |_| callback())
    }

    pub fn on_error(&self, callback: impl Fn(&str) + Send + Sync + 'static) -> EventRegistration {
        self.error.subscribe(move |message: &String| callback(message))
    }

    pub fn on_set_input(
        &self,
        callback: impl Fn(&str, &NodeData) + Send + Sync + 'static,
    ) -> EventRegistration {
        self.set_input
            .subscribe(move |(key, data): &(String, NodeData)| callback(key, data))
    }

    pub fn on_set_output(
        &self,
        callback: impl Fn(&str, &NodeData) + Send + Sync + 'static,
    ) -> EventRegistration {
        self.set_output
            .subscribe(move |(key, data): &(String, NodeData)| callback(key, data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn subscribe_emit_unregister() {
        let hub: EventHub<u32> = EventHub::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        let registration = hub.subscribe(move |value| {
            counter.fetch_add(*value as usize, Ordering::SeqCst);
        });

        hub.emit(&2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert!(registration.is_valid());

        registration.unregister().unwrap();
        assert!(!registration.is_valid());
        hub.emit(&100);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn double_unregister_fails() {
        let hub: EventHub<()> = EventHub::new();
        let registration = hub.subscribe(|_| {});
        registration.unregister().unwrap();
        assert!(matches!(
            registration.unregister(),
            Err(FlowError::InvalidHandle(_))
        ));
    }

    #[test]
    fn registration_dies_with_its_source() {
        let hub: EventHub<()> = EventHub::new();
        let registration = hub.subscribe(|_| {});
        assert!(registration.is_valid());
        drop(hub);
        assert!(!registration.is_valid());
        assert!(registration.unregister().is_err());
    }

    #[test]
    fn callbacks_may_unregister_during_delivery() {
        let hub: Arc<EventHub<()>> = Arc::new(EventHub::new());
        let slot: Arc<Mutex<Option<EventRegistration>>> = Arc::new(Mutex::new(None));

        let inner = Arc::clone(&slot);
        let registration = hub.subscribe(move |_| {
            if let Some(reg) = inner.lock().unwrap().take() {
                reg.unregister().unwrap();
            }
        });
        *slot.lock().unwrap() = Some(registration);

        hub.emit(&());
        hub.emit(&());
    }
}
