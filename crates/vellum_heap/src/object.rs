//! Managed value trait

use std::any::Any;

/// Base trait for all values whose lifetime is governed by a [`Heap`].
///
/// Implementors may freely embed [`Owned`] handles and managed containers;
/// dropping the value after finalization is what releases those edges, in
/// the order the fields are declared.
///
/// [`Heap`]: crate::Heap
/// [`Owned`]: crate::Owned
pub trait Managed: Any + Send {
    /// Runs exactly once when the object is destroyed, before any of its own
    /// outgoing references are released.
    ///
    /// This is the only point where user code observes destruction; it may
    /// call back into the heap (allocate, acquire, release other objects)
    /// but must not resurrect the object being finalized.
    fn finalize(&mut self) {}

    /// Type name for logging and diagnostics.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}
