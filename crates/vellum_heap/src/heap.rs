//! The managed heap: registry, reference accounting, and the cycle sweep.
//!
//! One [`Heap`] owns every managed object of a document session. Reference
//! accounting is immediate: the release that drives an object's strong count
//! to zero finalizes it on the spot, and the cascade runs on an explicit
//! FIFO worklist so arbitrarily deep ownership chains cannot exhaust the
//! call stack. Cyclic garbage never reaches a local zero, so every edge
//! removal that leaves a nonzero count marks the object as a suspect and the
//! configured [`CollectPolicy`] decides when to run the mark-from-roots
//! sweep that reclaims it.

use std::collections::VecDeque;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use parking_lot::Mutex;
use tracing::{debug, error, trace};
use vellum_utils::Stopwatch;

use crate::config::{CollectPolicy, HeapConfig};
use crate::descriptor::{Descriptor, Direction, ObjectId};
use crate::error::HeapError;
use crate::handle::{Handle, Owned};
use crate::object::Managed;

/// Counters reported by [`Heap::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeapStats {
    /// Objects ever allocated on this heap.
    pub allocated: u64,
    /// Objects finalized, through cascades and sweeps combined.
    pub finalized: u64,
    /// Cycle sweeps run.
    pub sweeps: u64,
    /// Objects reclaimed by sweeps (subset of `finalized`).
    pub swept: u64,
}

/// Registry slot for one managed object.
struct Entry {
    /// `None` while the value is checked out through a handle access.
    value: Option<Box<dyn Managed>>,
    descriptor: Descriptor,
    /// Key → managed-value side table, in insertion order. The edges
    /// themselves are accounted in `descriptor` like structural children.
    data: Vec<(String, ObjectId)>,
}

#[derive(Default)]
struct HeapInner {
    objects: AHashMap<ObjectId, Entry>,
    next_id: u64,
    /// Objects whose strong count reached zero, awaiting finalization.
    pending: VecDeque<ObjectId>,
    /// A finalization cascade is running; nested releases only enqueue.
    draining: bool,
    /// Sweep selection is running.
    sweeping: bool,
    /// A sweep became due while draining or sweeping; run it afterwards.
    sweep_requested: bool,
    /// Suspect edge removals since the last sweep.
    suspects: usize,
    stats: HeapStats,
}

/// The single authority over a connected heap of managed objects.
///
/// Created as `Arc<Heap>`; handles keep only weak references back, so
/// dropping the last user-held `Arc` tears the whole heap down
/// deterministically regardless of what the managed graph still contains.
///
/// All entry points serialize on one internal mutex, which is the exact
/// serialization a multi-threaded host needs; the lock is never held while
/// user code (finalizers, access closures) runs.
pub struct Heap {
    inner: Mutex<HeapInner>,
    config: HeapConfig,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HeapInner::default()),
            config,
        })
    }

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Allocate a managed object, returning a non-owning view of it.
    ///
    /// The new object starts with no references at all: the caller must
    /// establish a strong reference (root the handle, or acquire it under an
    /// owner) before the next operation that can trigger a collection, or
    /// the sweep will treat the object as unreachable.
    pub fn allocate<T: Managed>(self: &Arc<Self>, value: T) -> Handle<T> {
        self.allocate_with(|_| value)
    }

    /// Allocate with access to the object's own id during construction.
    ///
    /// Needed by values that embed same-owner containers, which are keyed by
    /// their owner's identity. The builder must not create edges involving
    /// the new id; the object is registered only after it returns.
    pub fn allocate_with<T: Managed>(
        self: &Arc<Self>,
        build: impl FnOnce(ObjectId) -> T,
    ) -> Handle<T> {
        let id = {
            let mut inner = self.inner.lock();
            let id = ObjectId(inner.next_id);
            inner.next_id += 1;
            inner.stats.allocated += 1;
            id
        };
        let value = build(id);
        {
            let mut inner = self.inner.lock();
            inner.objects.insert(
                id,
                Entry {
                    value: Some(Box::new(value)),
                    descriptor: Descriptor::new(),
                    data: Vec::new(),
                },
            );
        }
        trace!(%id, ty = std::any::type_name::<T>(), "allocate");
        Handle::new(Arc::downgrade(self), id)
    }

    /// Create an internal strong edge from `owner` to `target`.
    ///
    /// This is the sole way such an edge comes into existence; both
    /// descriptors are updated. Unknown owner or target is a programming
    /// error and panics.
    pub fn acquire<T>(self: &Arc<Self>, owner: ObjectId, target: &Handle<T>) -> Owned<T> {
        assert!(
            target.belongs_to(self),
            "acquire: handle belongs to a different heap"
        );
        let id = target.id();
        self.acquire_raw(owner, id);
        trace!(%owner, target = %id, "acquire");
        Owned::new(Arc::downgrade(self), owner, id)
    }

    /// Untyped edge accounting shared by `acquire` and `Owned::clone`.
    pub(crate) fn acquire_raw(&self, owner: ObjectId, target: ObjectId) {
        let mut inner = self.inner.lock();
        assert!(
            inner.objects.contains_key(&owner),
            "acquire: unknown owner {owner}"
        );
        assert!(
            inner.objects.contains_key(&target),
            "acquire: unknown target {target}"
        );
        Self::link(&mut inner, owner, target);
    }

    fn link(inner: &mut HeapInner, owner: ObjectId, target: ObjectId) {
        if let Some(entry) = inner.objects.get_mut(&owner) {
            entry.descriptor.incr(Direction::Outgoing, Some(target));
        }
        if let Some(entry) = inner.objects.get_mut(&target) {
            entry.descriptor.incr(Direction::Incoming, Some(owner));
        }
    }

    /// Register an external (rooted) reference to `id`.
    pub(crate) fn adopt_root(&self, id: ObjectId) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.objects.get_mut(&id) else {
            panic!("root: unknown object {id}");
        };
        entry.descriptor.incr(Direction::Incoming, None);
        trace!(%id, "root");
    }

    /// The single chokepoint for dropping a strong reference.
    ///
    /// `referrer` is `None` for rooted references. Driving the target's
    /// strong count to zero finalizes it immediately (cascading through the
    /// worklist); any other decrement marks the target as a cycle suspect
    /// and defers to the collection policy.
    pub(crate) fn release(&self, target: ObjectId, referrer: Option<ObjectId>) {
        let mut run_drain = false;
        let mut run_sweep = false;
        {
            let mut inner = self.inner.lock();

            if let Some(owner) = referrer
                && let Some(owner_entry) = inner.objects.get_mut(&owner)
                && !owner_entry.descriptor.decr(Direction::Outgoing, Some(target))
            {
                debug_assert!(false, "release: {owner} holds no edge to {target}");
                error!(%owner, %target, "outgoing edge released twice or never acquired");
            }

            let Some(entry) = inner.objects.get_mut(&target) else {
                // Target already torn down with its component; the dangling
                // peer reference is dropped without further accounting.
                trace!(%target, "release for untracked object");
                return;
            };

            if !entry.descriptor.decr(Direction::Incoming, referrer) {
                debug_assert!(
                    false,
                    "release: no incoming entry for {referrer:?} on {target}"
                );
                error!(%target, ?referrer, "incoming edge released twice or never acquired");
                return;
            }

            if entry.descriptor.in_degree() == 0 {
                inner.pending.push_back(target);
                if !inner.draining {
                    inner.draining = true;
                    run_drain = true;
                }
            } else {
                // The removed edge may have been the last link pinning a
                // cycle from the outside.
                run_sweep = Self::note_suspect(&mut inner, &self.config);
            }
        }

        if run_drain {
            self.drain_pending();
        }
        if run_sweep {
            self.collect_cycles();
        }
    }

    /// Record a suspect edge removal; returns whether the caller should run
    /// a sweep now.
    fn note_suspect(inner: &mut HeapInner, config: &HeapConfig) -> bool {
        inner.suspects += 1;
        let due = match config.policy {
            CollectPolicy::Eager => true,
            CollectPolicy::Threshold => inner.suspects >= config.suspect_threshold,
            CollectPolicy::Manual => false,
        };
        if !due {
            return false;
        }
        if inner.draining || inner.sweeping {
            inner.sweep_requested = true;
            return false;
        }
        true
    }

    /// Finalize everything on the pending worklist, FIFO.
    ///
    /// Only the outermost release drains; releases that happen while a
    /// finalized object's own handles drop merely enqueue, so the cascade
    /// never recurses deeper than one drop frame.
    fn drain_pending(&self) {
        loop {
            let mut inner = self.inner.lock();
            let Some(id) = inner.pending.pop_front() else {
                inner.draining = false;
                break;
            };
            let Some(entry) = inner.objects.remove(&id) else {
                debug_assert!(false, "pending object {id} vanished before finalization");
                continue;
            };
            inner.stats.finalized += 1;
            drop(inner);
            self.finalize_entry(id, entry);
        }

        let sweep_now = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.sweep_requested)
        };
        if sweep_now {
            self.collect_cycles();
        }
    }

    /// Run the finalizer, then release the object's own references: first
    /// the structural edges (by dropping the value), then the data table in
    /// insertion order. Called with the entry already unregistered and the
    /// lock not held.
    fn finalize_entry(&self, id: ObjectId, entry: Entry) {
        let Entry { value, data, .. } = entry;
        match value {
            Some(mut boxed) => {
                debug!(%id, ty = boxed.type_name(), "finalize");
                boxed.finalize();
                drop(boxed);
            }
            None => {
                // Checked out through a handle when its owner died: the
                // single-threaded re-entrancy contract was violated and the
                // finalizer cannot run.
                error!(%id, "object finalized while its value was checked out");
            }
        }
        for (_key, target) in data {
            self.release(target, Some(id));
        }
    }

    /// Reachability sweep: mark everything transitively reachable from the
    /// root set over outgoing edges, then force-finalize every tracked
    /// object left unmarked. This is the only mechanism that reclaims
    /// reference cycles. Returns the number of objects collected.
    pub fn collect_cycles(&self) -> usize {
        let doomed = {
            let mut inner = self.inner.lock();
            if inner.draining || inner.sweeping {
                inner.sweep_requested = true;
                return 0;
            }
            inner.sweeping = true;
            inner.suspects = 0;

            let sw = Stopwatch::start_new();
            let mut marked: AHashSet<ObjectId> = AHashSet::new();
            let mut stack: Vec<ObjectId> = inner
                .objects
                .iter()
                .filter(|(_, entry)| entry.descriptor.root_refs() > 0)
                .map(|(&id, _)| id)
                .collect();
            while let Some(id) = stack.pop() {
                if !marked.insert(id) {
                    continue;
                }
                if let Some(entry) = inner.objects.get(&id) {
                    for target in entry.descriptor.out_targets() {
                        if !marked.contains(&target) {
                            stack.push(target);
                        }
                    }
                }
            }

            let mut doomed_ids: Vec<ObjectId> = inner
                .objects
                .keys()
                .filter(|id| !marked.contains(*id))
                .copied()
                .collect();
            // Allocation order keeps force-teardown deterministic.
            doomed_ids.sort_unstable();

            // Unregister the whole component before any finalizer runs, so
            // the intra-component releases during teardown find nothing to
            // account against.
            let mut doomed = Vec::with_capacity(doomed_ids.len());
            for id in doomed_ids {
                if let Some(entry) = inner.objects.remove(&id) {
                    inner.stats.finalized += 1;
                    doomed.push((id, entry));
                }
            }
            inner.stats.sweeps += 1;
            inner.stats.swept += doomed.len() as u64;
            inner.sweeping = false;
            debug!(
                collected = doomed.len(),
                live = inner.objects.len(),
                elapsed_us = sw.elapsed_micros(),
                "cycle sweep"
            );
            doomed
        };

        let freed = doomed.len();
        for (id, entry) in doomed {
            self.finalize_entry(id, entry);
        }

        // Teardown releases into live objects may have produced new
        // suspects or deferred a sweep request.
        let again = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.sweep_requested)
        };
        if again {
            self.collect_cycles();
        }
        freed
    }

    // --- per-object data side table ------------------------------------

    /// Store a managed value under `key` on `owner`.
    ///
    /// The stored value is referenced exactly like a structural child: it
    /// participates in the same accounting and the same sweep. Storing under
    /// an existing key releases the previously stored value.
    pub fn store_data<T>(
        &self,
        owner: ObjectId,
        key: &str,
        value: &Handle<T>,
    ) -> Result<(), HeapError> {
        let displaced = {
            let mut inner = self.inner.lock();
            let target = value.id();
            if !inner.objects.contains_key(&target) {
                return Err(HeapError::UnknownObject(target));
            }
            let Some(entry) = inner.objects.get_mut(&owner) else {
                return Err(HeapError::UnknownObject(owner));
            };
            let displaced = entry
                .data
                .iter()
                .position(|(k, _)| k.as_str() == key)
                .map(|pos| entry.data.remove(pos).1);
            entry.data.push((key.to_string(), target));
            Self::link(&mut inner, owner, target);
            displaced
        };
        trace!(%owner, key, target = %value.id(), "store_data");
        if let Some(previous) = displaced {
            self.release(previous, Some(owner));
        }
        Ok(())
    }

    /// Read back a stored value as a non-owning view.
    ///
    /// Returns `Ok(None)` for an absent key. The type parameter is not
    /// verified here; a mismatch surfaces on access, like any other handle.
    pub fn read_data<T>(
        self: &Arc<Self>,
        owner: ObjectId,
        key: &str,
    ) -> Result<Option<Handle<T>>, HeapError> {
        let inner = self.inner.lock();
        let Some(entry) = inner.objects.get(&owner) else {
            return Err(HeapError::UnknownObject(owner));
        };
        let target = entry
            .data
            .iter()
            .find(|(k, _)| k.as_str() == key)
            .map(|stored| stored.1);
        Ok(target.map(|id| Handle::new(Arc::downgrade(self), id)))
    }

    /// Remove a stored value, releasing the edge to it.
    ///
    /// Returns whether the key existed.
    pub fn delete_data(&self, owner: ObjectId, key: &str) -> Result<bool, HeapError> {
        let removed = {
            let mut inner = self.inner.lock();
            let Some(entry) = inner.objects.get_mut(&owner) else {
                return Err(HeapError::UnknownObject(owner));
            };
            let Some(pos) = entry.data.iter().position(|(k, _)| k.as_str() == key) else {
                return Ok(false);
            };
            entry.data.remove(pos).1
        };
        trace!(%owner, key, "delete_data");
        self.release(removed, Some(owner));
        Ok(true)
    }

    // --- value access (used by handle types) ----------------------------

    /// Take the value out of the registry for an exclusive access window.
    pub(crate) fn checkout(&self, id: ObjectId) -> Box<dyn Managed> {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.objects.get_mut(&id) else {
            panic!("access to finalized or unknown object {id}");
        };
        let Some(value) = entry.value.take() else {
            panic!("re-entrant access to object {id}");
        };
        value
    }

    /// Put a checked-out value back.
    pub(crate) fn checkin(&self, id: ObjectId, value: Box<dyn Managed>) {
        let mut inner = self.inner.lock();
        match inner.objects.get_mut(&id) {
            Some(entry) => {
                debug_assert!(entry.value.is_none(), "double check-in for {id}");
                entry.value = Some(value);
            }
            None => {
                // The object was collected during the access window; its
                // finalizer could not run. Drop the value outside the lock.
                error!(%id, "object collected while checked out");
                drop(inner);
                drop(value);
            }
        }
    }

    // --- introspection ---------------------------------------------------

    /// Whether `id` is still tracked (allocated and not finalized).
    pub fn contains(&self, id: ObjectId) -> bool {
        self.inner.lock().objects.contains_key(&id)
    }

    /// Total strong references to `id` (roots plus incoming edges), or
    /// `None` if untracked.
    pub fn strong_count(&self, id: ObjectId) -> Option<u64> {
        self.inner
            .lock()
            .objects
            .get(&id)
            .map(|entry| entry.descriptor.in_degree())
    }

    /// Rooted references to `id`, or `None` if untracked.
    pub fn root_count(&self, id: ObjectId) -> Option<u32> {
        self.inner
            .lock()
            .objects
            .get(&id)
            .map(|entry| entry.descriptor.root_refs())
    }

    pub fn live_objects(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats
    }
}

impl Drop for Heap {
    /// Heap teardown: finalize every remaining object in allocation order.
    ///
    /// By the time this runs every weak handle back-reference is already
    /// dead, so the handle drops inside the dying values are no-ops and the
    /// registry can be cleared without re-entering the accounting paths.
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let mut remaining: Vec<ObjectId> = inner.objects.keys().copied().collect();
        if remaining.is_empty() {
            return;
        }
        remaining.sort_unstable();
        debug!(count = remaining.len(), "heap teardown");
        for id in remaining {
            if let Some(entry) = inner.objects.remove(&id)
                && let Some(mut value) = entry.value
            {
                value.finalize();
            }
        }
    }
}
