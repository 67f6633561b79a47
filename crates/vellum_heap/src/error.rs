//! Heap error types

use thiserror::Error;

use crate::descriptor::ObjectId;

/// Errors surfaced by the heap's fallible auxiliary operations.
///
/// The core ownership contract has no recoverable failures: accounting
/// violations are asserted in debug builds and logged in release builds, and
/// dereferencing a finalized object panics. Only the per-object data table,
/// which is keyed by caller-supplied ids, reports errors as values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    /// The object id is not (or no longer) tracked by this heap.
    #[error("object {0} is not tracked by this heap")]
    UnknownObject(ObjectId),
}
