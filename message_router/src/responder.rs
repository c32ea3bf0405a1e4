//! Capability to answer one incoming call

use crate::error::RouterError;
use crate::router::RouterInner;
use ipc::{Message, RequestId};
use std::rc::Weak;

/// One-shot handle for answering an incoming call
///
/// Consumed by [`Responder::respond`], so a call can be answered at most once.
/// Dropping a responder that never responded is a protocol violation: the
/// router raises a connection error unless it is already torn down.
#[derive(Debug)]
pub struct Responder {
    router: Weak<RouterInner>,
    request_id: RequestId,
    sync: bool,
    responded: bool,
}

impl Responder {
    pub(crate) fn new(router: Weak<RouterInner>, request_id: RequestId, sync: bool) -> Self {
        Self {
            router,
            request_id,
            sync,
            responded: false,
        }
    }

    /// Returns the id of the call being answered
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Checks whether the call being answered is synchronous
    pub fn is_sync(&self) -> bool {
        self.sync
    }

    /// Checks whether a response could still be delivered
    pub fn is_valid(&self) -> bool {
        self.router
            .upgrade()
            .is_some_and(|router| router.is_valid())
    }

    /// Sends `response` as the answer to this call
    ///
    /// The request id and sync flag are taken from the call, overriding
    /// whatever the message carries.
    pub fn respond(mut self, response: Message) -> Result<(), RouterError> {
        self.responded = true;
        let router = self.router.upgrade().ok_or(RouterError::Closed)?;
        router.send_response(response.into_response(self.request_id, self.sync))
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.responded {
            return;
        }
        let Some(router) = self.router.upgrade() else {
            return;
        };
        if !router.is_valid() {
            return;
        }

        tracing::warn!(
            router = router.name(),
            request_id = %self.request_id,
            "responder dropped without responding"
        );
        router.raise_error();
    }
}
