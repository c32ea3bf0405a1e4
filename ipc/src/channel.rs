//! Channel abstraction for message passing
//!
//! A channel is an ordered, reliable, bidirectional conduit for discrete
//! [`Message`]s. It owns connectivity; whoever binds to it as a
//! [`ChannelClient`] owns what the messages mean.

use crate::Message;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Weak;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for one end of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(Uuid);

impl ChannelId {
    /// Creates a new random channel ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a channel ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({})", self.0)
    }
}

/// Errors reported by a channel
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// The channel or its peer is gone
    #[error("Channel disconnected")]
    Disconnected,

    /// The message could not be transmitted
    #[error("Failed to send message: {0}")]
    SendFailed(String),

    /// The bound client refused an incoming message
    #[error("Message rejected: {0}")]
    Rejected(String),

    /// A blocking wait ran out of traffic to pump
    #[error("Wait stalled with nothing left to pump")]
    Stalled,
}

/// Receiving side of a channel
///
/// Channels call back into their client on the client's own execution
/// context, possibly re-entrantly from inside [`Channel::wait_until`].
pub trait ChannelClient {
    /// Delivers one incoming message
    ///
    /// Returning an error breaks the channel: it notifies this client via
    /// [`ChannelClient::on_connection_error`] and disconnects the peer.
    fn on_message_received(&self, message: Message) -> Result<(), ChannelError>;

    /// Reports that the connection is broken
    fn on_connection_error(&self);
}

/// One end of a bidirectional message channel
pub trait Channel {
    /// Returns this end's identifier
    fn id(&self) -> ChannelId;

    /// Registers the client that incoming traffic is pushed to
    ///
    /// The channel only keeps a weak reference; it never owns its client.
    fn bind(&self, client: Weak<dyn ChannelClient>);

    /// Transmits a message to the peer
    fn send(&self, message: Message) -> Result<(), ChannelError>;

    /// Blocks the calling frame, pumping incoming traffic, until `condition`
    /// holds
    ///
    /// Incoming messages may be delivered to the client while waiting. Returns
    /// early with an error if the channel breaks or nothing is left to pump.
    fn wait_until(&self, condition: &dyn Fn() -> bool) -> Result<(), ChannelError>;

    /// Schedules `task` to run later on the channel's owning context
    ///
    /// Never runs the task inline and never from inside `wait_until`.
    fn post_task(&self, task: Box<dyn FnOnce()>);

    /// Breaks the channel
    ///
    /// The peer is notified of the disconnect; the client on this end is not,
    /// since it is the one raising the error.
    fn raise_error(&self);

    /// Closes this end without reporting an error locally
    fn close(&self);

    /// Checks whether messages can still flow both ways
    fn is_connected(&self) -> bool;
}
