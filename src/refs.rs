//! Reference manager: named external addresses, refreshed on change.
//!
//! This is the "cyclic and observer graphs" design from `spec.md` §9: a
//! `RefManager` is an arena of `Source` records indexed by dense id.
//! `Reference` handles hold an id and register an observer callback with
//! the arena on creation, unregistering it on drop. `Content` (the
//! symbol-table side that actually knows when an address changes) holds a
//! set of source ids and calls [`RefManager::set_address`], which fans the
//! new address out to every registered observer. Grounded on
//! `original_source/Code/RefManager.cpp` and `Code/Refs.cpp`, with the
//! arena-indexed-storage shape borrowed from cranelift's
//! `scoped_hash_map.rs`.

use cranelift_entity::{entity_impl, PrimaryMap};
use std::sync::{Arc, Mutex};

/// A dense id naming one external reference source within a `RefManager`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(u32);
entity_impl!(RefId, "ref");

type Observer = Arc<dyn Fn(usize) + Send + Sync>;

struct Source {
    name: Option<Box<str>>,
    address: usize,
    observers: Vec<Option<Observer>>,
}

/// An arena of named external references, scoped to one compilation unit
/// (one listing or one group of listings sharing an engine). Addresses are
/// set once a symbol resolves (binds, relocates, or is lazily compiled) and
/// every registered [`Reference`] is notified synchronously.
pub struct RefManager {
    inner: Mutex<PrimaryMap<RefId, Source>>,
}

impl RefManager {
    /// Create an empty arena.
    pub fn new() -> Arc<RefManager> {
        Arc::new(RefManager {
            inner: Mutex::new(PrimaryMap::new()),
        })
    }

    /// Declare a new named (or anonymous) reference source with an initial
    /// address of `0` (unresolved).
    pub fn create(&self, name: Option<&str>) -> RefId {
        let mut guard = self.inner.lock().unwrap();
        guard.push(Source {
            name: name.map(Into::into),
            address: 0,
            observers: Vec::new(),
        })
    }

    /// The current address of `id`, or `0` if unresolved.
    pub fn address(&self, id: RefId) -> usize {
        self.inner.lock().unwrap()[id].address
    }

    /// The declared name of `id`, if any.
    pub fn name(&self, id: RefId) -> Option<String> {
        self.inner.lock().unwrap()[id]
            .name
            .as_ref()
            .map(|s| s.to_string())
    }

    /// Called by the `Content` side (symbol table, loader, lazy-compilation
    /// trampoline) whenever `id`'s address changes. Every observer
    /// registered through [`Reference::new`] is invoked synchronously, on
    /// the calling thread, with the new address.
    pub fn set_address(&self, id: RefId, addr: usize) {
        let callbacks: Vec<Observer>;
        {
            let mut guard = self.inner.lock().unwrap();
            let src = &mut guard[id];
            src.address = addr;
            // Collect the live observers while holding the lock, then run
            // them after releasing it so a callback may itself create new
            // references without deadlocking.
            callbacks = src
                .observers
                .iter()
                .filter_map(|o| o.as_ref())
                .cloned()
                .collect();
        }
        for cb in callbacks {
            cb(addr);
        }
    }

    fn register(&self, id: RefId, on_change: Observer) -> usize {
        let mut guard = self.inner.lock().unwrap();
        let obs = &mut guard[id].observers;
        obs.push(Some(on_change));
        obs.len() - 1
    }

    fn unregister(&self, id: RefId, slot: usize) {
        if let Some(src) = self.inner.lock().unwrap().get_mut(id) {
            if let Some(entry) = src.observers.get_mut(slot) {
                *entry = None;
            }
        }
    }
}

/// A live handle to an external reference, automatically unregistering its
/// observer callback on drop.
pub struct Reference {
    manager: Arc<RefManager>,
    id: RefId,
    slot: usize,
}

impl Reference {
    /// Register `on_change` with `manager` for `id`. It will be invoked
    /// every time [`RefManager::set_address`] is called for `id`, until
    /// this `Reference` is dropped.
    pub fn new(
        manager: Arc<RefManager>,
        id: RefId,
        on_change: impl Fn(usize) + Send + Sync + 'static,
    ) -> Reference {
        let slot = manager.register(id, Arc::new(on_change));
        Reference { manager, id, slot }
    }

    /// The source id this reference observes.
    pub fn id(&self) -> RefId {
        self.id
    }

    /// The current resolved address.
    pub fn address(&self) -> usize {
        self.manager.address(self.id)
    }
}

impl Drop for Reference {
    fn drop(&mut self) {
        self.manager.unregister(self.id, self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn observer_is_notified_on_change() {
        let mgr = RefManager::new();
        let id = mgr.create(Some("foo"));
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let r = Reference::new(mgr.clone(), id, move |addr| {
            seen2.store(addr, Ordering::SeqCst);
        });
        mgr.set_address(id, 0x1000);
        assert_eq!(seen.load(Ordering::SeqCst), 0x1000);
        assert_eq!(r.address(), 0x1000);
    }

    #[test]
    fn dropped_reference_stops_receiving_updates() {
        let mgr = RefManager::new();
        let id = mgr.create(None);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        {
            let _r = Reference::new(mgr.clone(), id, move |addr| {
                seen2.store(addr, Ordering::SeqCst);
            });
            mgr.set_address(id, 1);
            assert_eq!(seen.load(Ordering::SeqCst), 1);
        }
        mgr.set_address(id, 2);
        assert_eq!(seen.load(Ordering::SeqCst), 1, "dropped observer must not fire");
    }

    #[test]
    fn multiple_observers_all_fire() {
        let mgr = RefManager::new();
        let id = mgr.create(None);
        let a = Arc::new(AtomicUsize::new(0));
        let b = Arc::new(AtomicUsize::new(0));
        let (a2, b2) = (a.clone(), b.clone());
        let _r1 = Reference::new(mgr.clone(), id, move |addr| a2.store(addr, Ordering::SeqCst));
        let _r2 = Reference::new(mgr.clone(), id, move |addr| b2.store(addr, Ordering::SeqCst));
        mgr.set_address(id, 7);
        assert_eq!(a.load(Ordering::SeqCst), 7);
        assert_eq!(b.load(Ordering::SeqCst), 7);
    }
}
