//! Bookkeeping for calls awaiting a response.
//!
//! Every outstanding call lives in one table keyed by request id, tagged as
//! either an asynchronous callback or a synchronous wait slot. An id is
//! therefore never pending in both forms at once.

use crate::error::CallError;
use ipc::{Message, RequestId};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Handler invoked exactly once with the outcome of a call
pub type ResponseHandler = Box<dyn FnOnce(Result<Message, CallError>)>;

/// Owns the handler of an asynchronous call
///
/// Dropping it without completing reports [`CallError::NoResponse`] to the
/// handler, so every registered call resolves exactly once.
pub(crate) struct ResponseCallback {
    request_id: RequestId,
    handler: Option<ResponseHandler>,
}

impl ResponseCallback {
    pub(crate) fn new(request_id: RequestId, handler: ResponseHandler) -> Self {
        Self {
            request_id,
            handler: Some(handler),
        }
    }

    /// Hands the matched response to the handler
    pub(crate) fn complete(mut self, response: Message) {
        if let Some(handler) = self.handler.take() {
            handler(Ok(response));
        }
    }
}

impl Drop for ResponseCallback {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            tracing::debug!(request_id = %self.request_id, "call dropped without response");
            handler(Err(CallError::NoResponse {
                request_id: self.request_id,
            }));
        }
    }
}

impl fmt::Debug for ResponseCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCallback")
            .field("request_id", &self.request_id)
            .field("pending", &self.handler.is_some())
            .finish()
    }
}

/// Slot a blocked synchronous caller waits on
#[derive(Debug, Default)]
pub(crate) struct SyncResponseSlot {
    woken: Cell<bool>,
    response: RefCell<Option<Message>>,
}

impl SyncResponseSlot {
    /// Checks whether the waiting frame may resume
    pub(crate) fn has_arrived(&self) -> bool {
        self.woken.get()
    }

    fn has_response(&self) -> bool {
        self.response.borrow().is_some()
    }

    fn fulfill(&self, response: Message) {
        *self.response.borrow_mut() = Some(response);
        self.woken.set(true);
    }

    /// Resumes the waiter without a response
    fn wake(&self) {
        self.woken.set(true);
    }

    /// Takes the stored response, if one arrived
    pub(crate) fn take_response(&self) -> Option<Message> {
        self.response.borrow_mut().take()
    }
}

#[derive(Debug)]
enum PendingEntry {
    Async(ResponseCallback),
    Sync(Rc<SyncResponseSlot>),
}

/// Result of matching an incoming response
#[derive(Debug)]
pub(crate) enum Resolution {
    /// Stored in a sync slot; the waiting frame picks it up
    Sync,
    /// Matched an async call; the callback must be completed
    Async(ResponseCallback, Message),
    /// Matched nothing
    Unmatched(Message),
}

/// Table of outstanding calls
#[derive(Debug, Default)]
pub(crate) struct PendingCallTable {
    entries: BTreeMap<RequestId, PendingEntry>,
}

impl PendingCallTable {
    pub(crate) fn contains(&self, request_id: RequestId) -> bool {
        self.entries.contains_key(&request_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn insert_async(&mut self, request_id: RequestId, callback: ResponseCallback) {
        debug_assert!(!self.contains(request_id));
        self.entries
            .insert(request_id, PendingEntry::Async(callback));
    }

    pub(crate) fn insert_sync(&mut self, request_id: RequestId) -> Rc<SyncResponseSlot> {
        debug_assert!(!self.contains(request_id));
        let slot = Rc::new(SyncResponseSlot::default());
        self.entries
            .insert(request_id, PendingEntry::Sync(Rc::clone(&slot)));
        slot
    }

    /// Erases a sync entry; only the frame that registered it calls this
    pub(crate) fn remove_sync(&mut self, request_id: RequestId) {
        if matches!(self.entries.get(&request_id), Some(PendingEntry::Sync(_))) {
            self.entries.remove(&request_id);
        }
    }

    /// Matches a response by request id and sync flag
    pub(crate) fn resolve(&mut self, response: Message) -> Resolution {
        let request_id = response.request_id();

        if response.is_sync() {
            return match self.entries.get(&request_id) {
                Some(PendingEntry::Sync(slot)) if !slot.has_response() => {
                    slot.fulfill(response);
                    Resolution::Sync
                }
                _ => Resolution::Unmatched(response),
            };
        }

        match self.entries.remove(&request_id) {
            Some(PendingEntry::Async(callback)) => Resolution::Async(callback, response),
            Some(entry) => {
                self.entries.insert(request_id, entry);
                Resolution::Unmatched(response)
            }
            None => Resolution::Unmatched(response),
        }
    }

    /// Removes every async entry
    ///
    /// The caller drops the returned callbacks once it holds no borrows, which
    /// fails each call with [`CallError::NoResponse`].
    pub(crate) fn take_async(&mut self) -> Vec<ResponseCallback> {
        let ids: Vec<RequestId> = self
            .entries
            .iter()
            .filter(|(_, entry)| matches!(entry, PendingEntry::Async(_)))
            .map(|(id, _)| *id)
            .collect();

        ids.into_iter()
            .filter_map(|id| match self.entries.remove(&id) {
                Some(PendingEntry::Async(callback)) => Some(callback),
                _ => None,
            })
            .collect()
    }

    /// Wakes every blocked sync caller without a response
    pub(crate) fn wake_sync_waiters(&self) {
        for entry in self.entries.values() {
            if let PendingEntry::Sync(slot) = entry {
                slot.wake();
            }
        }
    }
}
