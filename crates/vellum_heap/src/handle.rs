//! Reference handle types: non-owning views, rooted references, and
//! owner-bound references.
//!
//! All three carry the target's identity and a weak back-reference to the
//! heap; equality is identity equality, so any mix of handle types pointing
//! at the same live object compares equal. Only [`Rooted`] and [`Owned`]
//! touch the accounting: a [`Handle`] is free to copy around but must be
//! promoted before it is retained across anything that can collect.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, Weak};

use crate::descriptor::ObjectId;
use crate::heap::Heap;
use crate::object::Managed;

/// Non-owning view of a managed object.
///
/// Carries identity and type only; no accounting cost. Used for parameters,
/// comparisons, and temporary traversal. Access after the referent was
/// finalized panics: callers either revalidate with [`Handle::is_alive`] or
/// promote to a strong handle first.
pub struct Handle<T> {
    heap: Weak<Heap>,
    id: ObjectId,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn new(heap: Weak<Heap>, id: ObjectId) -> Self {
        Self {
            heap,
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Whether the referent is still tracked by a still-living heap.
    pub fn is_alive(&self) -> bool {
        self.heap
            .upgrade()
            .is_some_and(|heap| heap.contains(self.id))
    }

    /// Promote to a rooted (external) strong reference.
    pub fn root(&self) -> Rooted<T> {
        let heap = self.heap();
        heap.adopt_root(self.id);
        Rooted {
            handle: self.clone(),
        }
    }

    pub(crate) fn heap(&self) -> Arc<Heap> {
        match self.heap.upgrade() {
            Some(heap) => heap,
            None => panic!("handle {} outlived its heap", self.id),
        }
    }

    pub(crate) fn weak_heap(&self) -> &Weak<Heap> {
        &self.heap
    }

    pub(crate) fn belongs_to(&self, heap: &Arc<Heap>) -> bool {
        std::ptr::eq(self.heap.as_ptr(), Arc::as_ptr(heap))
    }
}

impl<T: Managed> Handle<T> {
    /// Run `f` with shared access to the referent.
    ///
    /// The value is checked out of the registry for the duration, so `f`
    /// may call back into the heap (allocate, acquire, drop handles) —
    /// but a nested access to the *same* object panics, as does access to
    /// an already-finalized one.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = Checkout::take(self.heap(), self.id);
        f(guard.value_ref())
    }

    /// Run `f` with exclusive access to the referent.
    pub fn with_mut<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = Checkout::take(self.heap(), self.id);
        f(guard.value_mut())
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        Self {
            heap: self.heap.clone(),
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.id)
    }
}

/// Exclusive access window; puts the value back on drop, including during
/// unwinding out of a user closure.
struct Checkout {
    heap: Arc<Heap>,
    id: ObjectId,
    value: Option<Box<dyn Managed>>,
}

impl Checkout {
    fn take(heap: Arc<Heap>, id: ObjectId) -> Self {
        let value = heap.checkout(id);
        Self {
            heap,
            id,
            value: Some(value),
        }
    }

    fn value_ref<T: Managed>(&self) -> &T {
        let Some(boxed) = self.value.as_deref() else {
            unreachable!("checkout holds a value until drop");
        };
        let any: &dyn Any = boxed;
        match any.downcast_ref::<T>() {
            Some(typed) => typed,
            None => panic!(
                "object {} is not a {}",
                self.id,
                std::any::type_name::<T>()
            ),
        }
    }

    fn value_mut<T: Managed>(&mut self) -> &mut T {
        let id = self.id;
        let Some(boxed) = self.value.as_deref_mut() else {
            unreachable!("checkout holds a value until drop");
        };
        let any: &mut dyn Any = boxed;
        match any.downcast_mut::<T>() {
            Some(typed) => typed,
            None => panic!("object {} is not a {}", id, std::any::type_name::<T>()),
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            self.heap.checkin(self.id, value);
        }
    }
}

/// Strong reference held from outside the managed graph.
///
/// The spec-level "nullable" rooted reference is spelled
/// `Option<Rooted<T>>` here. Dropping (or assigning over) a `Rooted`
/// releases the root reference; moving one transfers it without touching
/// counts.
pub struct Rooted<T> {
    handle: Handle<T>,
}

impl<T> Rooted<T> {
    /// Demote to a non-owning view.
    pub fn handle(&self) -> Handle<T> {
        self.handle.clone()
    }
}

impl<T> Deref for Rooted<T> {
    type Target = Handle<T>;

    fn deref(&self) -> &Handle<T> {
        &self.handle
    }
}

impl<T> Clone for Rooted<T> {
    fn clone(&self) -> Self {
        self.handle.heap().adopt_root(self.handle.id());
        Self {
            handle: self.handle.clone(),
        }
    }
}

impl<T> Drop for Rooted<T> {
    fn drop(&mut self) {
        if let Some(heap) = self.handle.weak_heap().upgrade() {
            heap.release(self.handle.id(), None);
        }
    }
}

impl<T> fmt::Debug for Rooted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rooted({})", self.handle.id())
    }
}

/// Strong reference held by one managed object toward another.
///
/// Only [`Heap::acquire`] creates these; an `Owned` always knows its owner
/// and cannot exist free-floating. Cloning re-acquires under the same
/// owner; moving transfers without touching counts.
pub struct Owned<T> {
    handle: Handle<T>,
    owner: ObjectId,
}

impl<T> Owned<T> {
    pub(crate) fn new(heap: Weak<Heap>, owner: ObjectId, id: ObjectId) -> Self {
        Self {
            handle: Handle::new(heap, id),
            owner,
        }
    }

    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    /// Demote to a non-owning view.
    pub fn handle(&self) -> Handle<T> {
        self.handle.clone()
    }
}

impl<T> Deref for Owned<T> {
    type Target = Handle<T>;

    fn deref(&self) -> &Handle<T> {
        &self.handle
    }
}

impl<T> Clone for Owned<T> {
    fn clone(&self) -> Self {
        self.handle.heap().acquire_raw(self.owner, self.handle.id());
        Self {
            handle: self.handle.clone(),
            owner: self.owner,
        }
    }
}

impl<T> Drop for Owned<T> {
    fn drop(&mut self) {
        if let Some(heap) = self.handle.weak_heap().upgrade() {
            heap.release(self.handle.id(), Some(self.owner));
        }
    }
}

impl<T> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Owned({} held by {})", self.handle.id(), self.owner)
    }
}

// Equality is identity equality, across every pairing of handle types.

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Weak::ptr_eq(&self.heap, &other.heap)
    }
}

impl<T> Eq for Handle<T> {}

impl<T> PartialEq for Rooted<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<T> Eq for Rooted<T> {}

impl<T> PartialEq for Owned<T> {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl<T> Eq for Owned<T> {}

impl<T> PartialEq<Rooted<T>> for Handle<T> {
    fn eq(&self, other: &Rooted<T>) -> bool {
        *self == other.handle
    }
}

impl<T> PartialEq<Handle<T>> for Rooted<T> {
    fn eq(&self, other: &Handle<T>) -> bool {
        self.handle == *other
    }
}

impl<T> PartialEq<Owned<T>> for Handle<T> {
    fn eq(&self, other: &Owned<T>) -> bool {
        *self == other.handle
    }
}

impl<T> PartialEq<Handle<T>> for Owned<T> {
    fn eq(&self, other: &Handle<T>) -> bool {
        self.handle == *other
    }
}

impl<T> PartialEq<Owned<T>> for Rooted<T> {
    fn eq(&self, other: &Owned<T>) -> bool {
        self.handle == other.handle
    }
}

impl<T> PartialEq<Rooted<T>> for Owned<T> {
    fn eq(&self, other: &Rooted<T>) -> bool {
        self.handle == other.handle
    }
}
