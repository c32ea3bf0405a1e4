//! Gate for synchronous calls
//!
//! Blocking the calling frame is only legal where the caller has said so.
//! A [`SyncCallScope`] opens the gate for the current thread until it is
//! dropped; scopes nest. Issuing a synchronous call with the gate closed is a
//! programming error and panics.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static OPEN_SCOPES: Cell<usize> = const { Cell::new(0) };
}

/// Keeps the sync-call gate open on this thread while alive
#[must_use = "the gate closes as soon as the scope is dropped"]
#[derive(Debug)]
pub struct SyncCallScope {
    // Tied to the thread whose gate it opened.
    _not_send: PhantomData<*const ()>,
}

impl SyncCallScope {
    /// Opens the gate
    pub fn allow() -> Self {
        OPEN_SCOPES.with(|scopes| scopes.set(scopes.get() + 1));
        Self {
            _not_send: PhantomData,
        }
    }
}

impl Drop for SyncCallScope {
    fn drop(&mut self) {
        OPEN_SCOPES.with(|scopes| scopes.set(scopes.get() - 1));
    }
}

/// Checks whether synchronous calls are allowed on this thread
pub fn sync_calls_allowed() -> bool {
    OPEN_SCOPES.with(|scopes| scopes.get() > 0)
}

pub(crate) fn assert_sync_call_allowed(name: &str) {
    if !sync_calls_allowed() {
        panic!("synchronous call `{}` issued without an open SyncCallScope", name);
    }
}
