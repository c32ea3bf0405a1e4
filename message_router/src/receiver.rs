//! Dispatch target for incoming traffic

use crate::error::DispatchError;
use crate::responder::Responder;
use ipc::Message;

/// Receives the calls and one-way messages a router takes off its channel
///
/// Implementations run on the router's execution context, possibly while a
/// synchronous call further up the stack is blocked (for sync-flagged
/// messages only). Returning an error raises a connection error on the router.
pub trait MessageReceiver {
    /// Handles a one-way message
    fn accept(&self, message: Message) -> Result<(), DispatchError>;

    /// Handles a call
    ///
    /// The `responder` may be used now or kept and used later. Dropping it
    /// without responding breaks the connection.
    fn accept_with_responder(
        &self,
        message: Message,
        responder: Responder,
    ) -> Result<(), DispatchError>;
}
