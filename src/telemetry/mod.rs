// SPDX-License-Identifier: Apache-2.0

//! Process-wide counter registry backing the /stats endpoint.
//!
//! Counters are registered once (per-watcher at construction) and then
//! incremented lock-free through the returned handle. The registry itself is
//! only locked to register and to snapshot.

pub mod stats_server;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

#[derive(Default)]
pub struct Registry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::default)
}

impl Registry {
    /// Register a new counter. Returns None when the name is already taken.
    pub fn register(&self, name: impl Into<String>) -> Option<Arc<AtomicU64>> {
        let name = name.into();
        let mut counters = self.counters.write().expect("registry lock poisoned");
        if counters.contains_key(&name) {
            return None;
        }
        let counter = Arc::new(AtomicU64::new(0));
        counters.insert(name, counter.clone());
        Some(counter)
    }

    pub fn get(&self, name: &str) -> Option<Arc<AtomicU64>> {
        self.counters
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    /// Point-in-time value of every registered counter.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(name, counter)| (name.clone(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}
