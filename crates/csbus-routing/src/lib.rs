//! Component mailboxes, the address router, and blocking-wait primitives.
//!
//! Each [`Component`] owns a private, serialized mailbox and a single logical
//! thread of execution; cross-component interaction happens exclusively by
//! posting a message or a deferred execution into the target's mailbox. The
//! [`Router`] is the process-wide registry that resolves an address or a
//! generation-tagged [`ComponentHandle`] to a live component, and the
//! [`promise`] pair is the one-shot future/promise every blocking call in the
//! stack waits on.

pub mod component;
pub mod router;
pub mod waiter;

pub use component::{Component, Execution};
pub use router::{ComponentHandle, Router};
pub use waiter::{promise, Resolver, Waiter, DEFAULT_MAX_WAIT, INFINITE_WAIT};

use std::sync::{Mutex, MutexGuard};

// Poisoning is not propagated: a panicking job must not wedge the registry
// or mailbox tables for every other thread.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
