//! Service registry.
//!
//! An explicit, owned replacement for the original's process-wide list of
//! all services: the embedder constructs one registry, passes it to every
//! [`Service::init`](crate::Service::init), and tears it down with the
//! process.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::service::Shared;

/// Registry of live services.
#[derive(Default)]
pub struct ServiceRegistry {
    services: Mutex<Vec<(String, Weak<Shared>)>>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn register(&self, shared: &Arc<Shared>) {
        self.services
            .lock()
            .push((shared.name.clone(), Arc::downgrade(shared)));
    }

    pub(crate) fn unregister(&self, name: &str) {
        self.services.lock().retain(|(n, _)| n != name);
    }

    /// Names of all registered services.
    pub fn names(&self) -> Vec<String> {
        self.services
            .lock()
            .iter()
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Number of registered services.
    pub fn len(&self) -> usize {
        self.services.lock().len()
    }

    /// True if no services are registered.
    pub fn is_empty(&self) -> bool {
        self.services.lock().is_empty()
    }
}
