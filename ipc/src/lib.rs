//! # Inter-Process Communication (IPC)
//!
//! This crate defines the message-passing primitives the router sits on.
//!
//! ## Philosophy
//!
//! - **Messages, not shared memory**: All communication is explicit message passing
//! - **Move-only**: A message has exactly one owner and is consumed exactly once
//! - **Correlated**: Calls and responses carry a request ID for matching
//! - **Transport-agnostic**: Channels are a trait; the router never sees bytes
//!
//! ## Architecture
//!
//! Messages carry:
//! - An action/method name
//! - Classification flags (expects response, is response, is sync)
//! - A request ID for calls and responses
//! - A type-erased payload
//!
//! A [`Channel`] moves messages between two ends and pushes incoming ones
//! to its bound [`ChannelClient`].

pub mod channel;
pub mod message;

pub use channel::{Channel, ChannelClient, ChannelError, ChannelId};
pub use message::{Message, MessageFlags, MessageHeader, MessagePayload, RequestId};
