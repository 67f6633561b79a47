//! Containers of same-owner references.
//!
//! These batch-manage the edges of one owner — a node's children, a scope's
//! named entities — so insert/erase stay in lockstep with the owner's edge
//! accounting. Elements are plain [`Owned`] handles, so erasing one releases
//! it and dropping the whole container releases everything it still holds.
//!
//! Copying re-acquires every element under the destination owner; moving is
//! an ordinary Rust move, after which the source is statically unusable —
//! exactly the "owner-less moved-from container" contract.

use std::ops::RangeBounds;
use std::sync::Arc;

use ahash::AHashMap;

use crate::descriptor::ObjectId;
use crate::handle::{Handle, Owned};
use crate::heap::Heap;

/// Ordered sequence of references sharing one owner.
pub struct OwnedVec<T> {
    owner: ObjectId,
    items: Vec<Owned<T>>,
}

impl<T> OwnedVec<T> {
    pub fn new(owner: ObjectId) -> Self {
        Self {
            owner,
            items: Vec::new(),
        }
    }

    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Append an already-acquired reference. The element must have been
    /// acquired under this container's owner.
    pub fn push(&mut self, item: Owned<T>) {
        assert_eq!(
            item.owner(),
            self.owner,
            "element acquired under a different owner"
        );
        self.items.push(item);
    }

    /// Acquire `target` under this container's owner and append it.
    pub fn push_handle(&mut self, heap: &Arc<Heap>, target: &Handle<T>) {
        self.items.push(heap.acquire(self.owner, target));
    }

    pub fn insert(&mut self, index: usize, item: Owned<T>) {
        assert_eq!(
            item.owner(),
            self.owner,
            "element acquired under a different owner"
        );
        self.items.insert(index, item);
    }

    /// Remove and return the last element; dropping the returned handle
    /// releases it.
    pub fn pop(&mut self) -> Option<Owned<T>> {
        self.items.pop()
    }

    /// Remove and return the element at `index`.
    pub fn remove(&mut self, index: usize) -> Owned<T> {
        self.items.remove(index)
    }

    /// Erase a range of elements, releasing each.
    pub fn erase_range<R: RangeBounds<usize>>(&mut self, range: R) {
        self.items.drain(range);
    }

    /// Erase every element, releasing each.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn get(&self, index: usize) -> Option<Handle<T>> {
        self.items.get(index).map(Owned::handle)
    }

    /// Non-owning views of the elements, in order.
    pub fn iter(&self) -> impl Iterator<Item = Handle<T>> + '_ {
        self.items.iter().map(Owned::handle)
    }

    /// Copy the container for a (possibly different) owner, re-acquiring
    /// every element under it. Source and destination are independently
    /// counted afterwards.
    pub fn clone_for(&self, new_owner: ObjectId) -> OwnedVec<T> {
        let mut copy = OwnedVec::new(new_owner);
        for item in &self.items {
            let heap = item.heap();
            copy.items.push(heap.acquire(new_owner, &item.handle()));
        }
        copy
    }
}

impl<T> Clone for OwnedVec<T> {
    fn clone(&self) -> Self {
        self.clone_for(self.owner)
    }
}

impl<T> std::fmt::Debug for OwnedVec<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedVec")
            .field("owner", &self.owner)
            .field("len", &self.items.len())
            .finish()
    }
}

/// String-keyed map of references sharing one owner.
pub struct OwnedMap<T> {
    owner: ObjectId,
    entries: AHashMap<String, Owned<T>>,
}

impl<T> OwnedMap<T> {
    pub fn new(owner: ObjectId) -> Self {
        Self {
            owner,
            entries: AHashMap::new(),
        }
    }

    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert an already-acquired reference, returning the displaced one if
    /// the key was occupied (dropping it releases the old element).
    pub fn insert(&mut self, key: impl Into<String>, item: Owned<T>) -> Option<Owned<T>> {
        assert_eq!(
            item.owner(),
            self.owner,
            "element acquired under a different owner"
        );
        self.entries.insert(key.into(), item)
    }

    /// Acquire `target` under this container's owner and insert it.
    pub fn insert_handle(
        &mut self,
        heap: &Arc<Heap>,
        key: impl Into<String>,
        target: &Handle<T>,
    ) -> Option<Owned<T>> {
        self.entries
            .insert(key.into(), heap.acquire(self.owner, target))
    }

    /// Remove an entry; dropping the returned handle releases it.
    pub fn remove(&mut self, key: &str) -> Option<Owned<T>> {
        self.entries.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Handle<T>> {
        self.entries.get(key).map(Owned::handle)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Non-owning views of the entries, in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Handle<T>)> {
        self.entries
            .iter()
            .map(|(key, item)| (key.as_str(), item.handle()))
    }

    /// Copy the map for a (possibly different) owner, re-acquiring every
    /// element under it.
    pub fn clone_for(&self, new_owner: ObjectId) -> OwnedMap<T> {
        let mut copy = OwnedMap::new(new_owner);
        for (key, item) in &self.entries {
            let heap = item.heap();
            copy.entries
                .insert(key.clone(), heap.acquire(new_owner, &item.handle()));
        }
        copy
    }
}

impl<T> Clone for OwnedMap<T> {
    fn clone(&self) -> Self {
        self.clone_for(self.owner)
    }
}

impl<T> std::fmt::Debug for OwnedMap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedMap")
            .field("owner", &self.owner)
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::object::Managed;

    struct Item(u32);

    impl Managed for Item {}

    fn fixture() -> (Arc<Heap>, Handle<Item>, Handle<Item>, Handle<Item>) {
        let heap = Heap::new(HeapConfig::default());
        let owner = heap.allocate(Item(0));
        let c1 = heap.allocate(Item(1));
        let c2 = heap.allocate(Item(2));
        // Root everything so the fixture graph stays alive on its own.
        std::mem::forget((owner.root(), c1.root(), c2.root()));
        (heap, owner, c1, c2)
    }

    #[test]
    fn push_and_erase_stay_in_lockstep_with_accounting() {
        let (heap, owner, c1, c2) = fixture();
        let mut children = OwnedVec::new(owner.id());

        children.push_handle(&heap, &c1);
        children.push_handle(&heap, &c2);
        children.push_handle(&heap, &c1);
        assert_eq!(children.len(), 3);
        assert_eq!(heap.strong_count(c1.id()), Some(3)); // root + two edges
        assert_eq!(heap.strong_count(c2.id()), Some(2));

        let popped = children.pop();
        assert_eq!(popped.as_ref().map(|o| o.id()), Some(c1.id()));
        drop(popped);
        assert_eq!(heap.strong_count(c1.id()), Some(2));

        children.clear();
        assert_eq!(heap.strong_count(c1.id()), Some(1));
        assert_eq!(heap.strong_count(c2.id()), Some(1));
    }

    #[test]
    fn erase_range_releases_each_element() {
        let (heap, owner, c1, c2) = fixture();
        let mut children = OwnedVec::new(owner.id());
        for _ in 0..3 {
            children.push_handle(&heap, &c1);
        }
        children.push_handle(&heap, &c2);

        children.erase_range(1..3);
        assert_eq!(children.len(), 2);
        assert_eq!(heap.strong_count(c1.id()), Some(2));
        assert_eq!(heap.strong_count(c2.id()), Some(2));
        assert_eq!(children.get(0).map(|h| h.id()), Some(c1.id()));
        assert_eq!(children.get(1).map(|h| h.id()), Some(c2.id()));
    }

    #[test]
    fn copy_reacquires_under_the_new_owner() {
        let (heap, owner, c1, c2) = fixture();
        let other = heap.allocate(Item(9));
        std::mem::forget(other.root());

        let mut children = OwnedVec::new(owner.id());
        children.push_handle(&heap, &c1);
        children.push_handle(&heap, &c2);

        let copied = children.clone_for(other.id());
        assert_eq!(copied.owner(), other.id());
        assert_eq!(copied.len(), 2);
        assert_eq!(heap.strong_count(c1.id()), Some(3));

        drop(children);
        // The copy keeps its own edges alive.
        assert_eq!(heap.strong_count(c1.id()), Some(2));
        drop(copied);
        assert_eq!(heap.strong_count(c1.id()), Some(1));
    }

    #[test]
    fn move_transfers_without_touching_counts() {
        let (heap, owner, c1, _c2) = fixture();
        let mut children = OwnedVec::new(owner.id());
        children.push_handle(&heap, &c1);
        assert_eq!(heap.strong_count(c1.id()), Some(2));

        let moved = children;
        assert_eq!(heap.strong_count(c1.id()), Some(2));
        assert_eq!(moved.len(), 1);
        drop(moved);
        assert_eq!(heap.strong_count(c1.id()), Some(1));
    }

    #[test]
    #[should_panic(expected = "different owner")]
    fn foreign_elements_are_rejected() {
        let (heap, owner, c1, _c2) = fixture();
        let other = heap.allocate(Item(9));
        std::mem::forget(other.root());

        let mut children = OwnedVec::new(owner.id());
        children.push(heap.acquire(other.id(), &c1));
    }

    #[test]
    fn map_insert_displaces_and_releases() {
        let (heap, owner, c1, c2) = fixture();
        let mut named = OwnedMap::new(owner.id());

        assert!(named.insert_handle(&heap, "style", &c1).is_none());
        assert_eq!(heap.strong_count(c1.id()), Some(2));

        let displaced = named.insert_handle(&heap, "style", &c2);
        assert_eq!(displaced.as_ref().map(|o| o.id()), Some(c1.id()));
        drop(displaced);
        assert_eq!(heap.strong_count(c1.id()), Some(1));
        assert_eq!(named.get("style").map(|h| h.id()), Some(c2.id()));

        assert!(named.remove("style").is_some());
        assert!(named.is_empty());
    }
}
