//! Message types and header structure

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier linking an outbound call to its response
///
/// Ids are assigned per router, starting at 1. The value 0 is reserved
/// and never stamped on a real call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    /// The reserved "no request" value
    pub const NONE: RequestId = RequestId(0);

    /// Creates a request ID from its raw value
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn get(&self) -> u64 {
        self.0
    }

    /// Checks whether this is the reserved value
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Req({})", self.0)
    }
}

bitflags! {
    /// Classification flags carried in every message header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MessageFlags: u32 {
        /// The sender is waiting for a response to this call.
        const EXPECTS_RESPONSE = 1 << 0;

        /// This message answers an earlier call.
        const IS_RESPONSE = 1 << 1;

        /// The call (or the call this answers) blocks its issuer.
        const IS_SYNC = 1 << 2;
    }
}

impl Serialize for MessageFlags {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessageFlags {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bits = u32::deserialize(deserializer)?;
        Ok(MessageFlags::from_bits_truncate(bits))
    }
}

/// Routing metadata for a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Method or action name
    pub name: String,
    /// Classification flags
    pub flags: MessageFlags,
    /// Request ID (calls and responses only)
    pub request_id: RequestId,
}

impl MessageHeader {
    /// Creates a header with no request ID stamped yet
    pub fn new(name: impl Into<String>, flags: MessageFlags) -> Self {
        Self {
            name: name.into(),
            flags,
            request_id: RequestId::NONE,
        }
    }
}

/// Type-erased message payload
///
/// Encoding belongs to the layer above the router. For now, we use JSON.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    /// Serialized data (JSON for now)
    data: Vec<u8>,
}

impl MessagePayload {
    /// Creates a new payload from serializable data
    pub fn new<T: Serialize>(data: &T) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_vec(data)?;
        Ok(Self { data: json })
    }

    /// Creates an empty payload
    pub fn empty() -> Self {
        Self { data: Vec::new() }
    }

    /// Deserializes the payload into a specific type
    pub fn deserialize<T: for<'de> Deserialize<'de>>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.data)
    }
}

/// A unit of communication on a channel
///
/// Messages are move-only: whoever holds one owns it, and it is consumed
/// exactly once (sent, matched against a pending call, or dispatched).
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    header: MessageHeader,
    payload: MessagePayload,
}

impl Message {
    /// Creates a message from a header and payload
    pub fn new(header: MessageHeader, payload: MessagePayload) -> Self {
        Self { header, payload }
    }

    /// Creates a one-way notification
    pub fn one_way(name: impl Into<String>, payload: MessagePayload) -> Self {
        Self::new(MessageHeader::new(name, MessageFlags::empty()), payload)
    }

    /// Creates an asynchronous call that expects a response
    pub fn call(name: impl Into<String>, payload: MessagePayload) -> Self {
        Self::new(
            MessageHeader::new(name, MessageFlags::EXPECTS_RESPONSE),
            payload,
        )
    }

    /// Creates a synchronous call that expects a response
    pub fn sync_call(name: impl Into<String>, payload: MessagePayload) -> Self {
        Self::new(
            MessageHeader::new(
                name,
                MessageFlags::EXPECTS_RESPONSE | MessageFlags::IS_SYNC,
            ),
            payload,
        )
    }

    /// Creates an unaddressed response
    ///
    /// The request ID is filled in by whoever answers the call, see
    /// [`Message::into_response`].
    pub fn response(name: impl Into<String>, payload: MessagePayload) -> Self {
        Self::new(MessageHeader::new(name, MessageFlags::IS_RESPONSE), payload)
    }

    /// Serializes `value` into an asynchronous call
    pub fn encode_call<T: Serialize>(
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::call(name, MessagePayload::new(value)?))
    }

    /// Returns the method or action name
    pub fn name(&self) -> &str {
        &self.header.name
    }

    /// Returns the payload
    pub fn payload(&self) -> &MessagePayload {
        &self.payload
    }

    /// Splits the message into its header and payload
    pub fn into_parts(self) -> (MessageHeader, MessagePayload) {
        (self.header, self.payload)
    }

    /// Checks whether the sender waits for a response
    pub fn expects_response(&self) -> bool {
        self.header.flags.contains(MessageFlags::EXPECTS_RESPONSE)
    }

    /// Checks whether this answers an earlier call
    pub fn is_response(&self) -> bool {
        self.header.flags.contains(MessageFlags::IS_RESPONSE)
    }

    /// Checks whether this belongs to a synchronous call
    pub fn is_sync(&self) -> bool {
        self.header.flags.contains(MessageFlags::IS_SYNC)
    }

    /// Checks that the message is not both a call and a response
    pub fn is_well_formed(&self) -> bool {
        !self
            .header
            .flags
            .contains(MessageFlags::EXPECTS_RESPONSE | MessageFlags::IS_RESPONSE)
    }

    /// Returns the request ID (`RequestId::NONE` for one-way messages)
    pub fn request_id(&self) -> RequestId {
        self.header.request_id
    }

    /// Stamps the request ID
    pub fn set_request_id(&mut self, request_id: RequestId) {
        self.header.request_id = request_id;
    }

    /// Turns this message into the response for `request_id`
    ///
    /// The sync flag follows the call being answered, not whatever the
    /// caller put on this message.
    pub fn into_response(mut self, request_id: RequestId, sync: bool) -> Self {
        self.header.flags.remove(MessageFlags::EXPECTS_RESPONSE);
        self.header.flags.insert(MessageFlags::IS_RESPONSE);
        self.header.flags.set(MessageFlags::IS_SYNC, sync);
        self.header.request_id = request_id;
        self
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_response() {
            "response"
        } else if self.expects_response() {
            "call"
        } else {
            "one-way"
        };
        write!(f, "{} {} {}", kind, self.header.name, self.header.request_id)?;
        if self.is_sync() {
            write!(f, " (sync)")?;
        }
        Ok(())
    }
}
