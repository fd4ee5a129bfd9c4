//! Process-wide registry of reference-counted object handles
//!
//! Engine objects cross the boundary to foreign callers as opaque numeric
//! handles. Each handle maps to one object instance and an atomic reference
//! count; the object is destroyed when the count reaches zero and the
//! identity is never reused for another object.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::error::{raise, FlowError, Result};

/// Opaque handle identity. Monotonic, never reused.
pub type HandleId = u64;

struct HandleEntry {
    ref_count: AtomicI32,
    type_name: &'static str,
    object: Arc<dyn Any + Send + Sync>,
}

/// Thread-safe table mapping handle identities to live engine objects
pub struct HandleRegistry {
    entries: Mutex<HashMap<HandleId, HandleEntry>>,
    next_id: AtomicU64,
}

static REGISTRY: Lazy<HandleRegistry> = Lazy::new(|| HandleRegistry {
    entries: Mutex::new(HashMap::new()),
    next_id: AtomicU64::new(1),
});

impl HandleRegistry {
    /// The process-wide registry instance
    pub fn global() -> &'static HandleRegistry {
        &REGISTRY
    }

    /// Register an object, returning a fresh handle with reference count 1
    pub fn register<T: Any + Send + Sync>(&self, object: Arc<T>) -> HandleId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = HandleEntry {
            ref_count: AtomicI32::new(1),
            type_name: std::any::type_name::<T>(),
            object,
        };
        self.entries.lock().unwrap().insert(id, entry);
        id
    }

    /// Resolve a handle to its underlying object
    pub fn resolve<T: Any + Send + Sync>(&self, id: HandleId) -> Result<Arc<T>> {
        let entries = self.entries.lock().unwrap();
        let entry = entries
            .get(&id)
            .ok_or_else(|| raise(FlowError::InvalidHandle(format!("handle {id} is not registered"))))?;
        entry
            .object
            .clone()
            .downcast::<T>()
            .map_err(|_| {
                raise(FlowError::InvalidHandle(format!(
                    "handle {id} refers to a {}, not a {}",
                    entry.type_name,
                    std::any::type_name::<T>()
                )))
            })
    }

    /// Whether `id` currently refers to a live object. No side effects.
    pub fn is_valid(&self, id: HandleId) -> bool {
        self.entries.lock().unwrap().contains_key(&id)
    }

    /// Increment the reference count of a live handle
    pub fn retain(&self, id: HandleId) -> Result<()> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            Some(entry) => {
                entry.ref_count.fetch_add(1, Ordering::AcqRel);
                Ok(())
            }
            None => Err(raise(FlowError::InvalidHandle(format!(
                "cannot retain handle {id}: not registered"
            )))),
        }
    }

    /// Decrement the reference count, destroying the object at zero.
    ///
    /// Returns `true` when this release destroyed the object.
    pub fn release(&self, id: HandleId) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get(&id).ok_or_else(|| {
            raise(FlowError::InvalidHandle(format!(
                "cannot release handle {id}: not registered"
            )))
        })?;
        let old = entry.ref_count.fetch_sub(1, Ordering::AcqRel);
        if old == 1 {
            entries.remove(&id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Current reference count of a live handle
    pub fn ref_count(&self, id: HandleId) -> Result<i32> {
        let entries = self.entries.lock().unwrap();
        match entries.get(&id) {
            Some(entry) => Ok(entry.ref_count.load(Ordering::Acquire)),
            None => Err(raise(FlowError::InvalidHandle(format!(
                "handle {id} is not registered"
            )))),
        }
    }

    /// Number of live handles (diagnostic)
    pub fn handle_count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}
