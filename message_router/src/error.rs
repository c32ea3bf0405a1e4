//! Router error types

use crate::reentrant::QueueError;
use ipc::{ChannelError, RequestId};
use thiserror::Error;

/// Errors returned synchronously by router operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    /// The channel could not transmit the message
    #[error("Failed to transmit message: {0}")]
    Transmit(#[from] ChannelError),

    /// The router has torn down after a connection error
    #[error("Router has encountered a connection error")]
    ConnectionErrored,

    /// The router was closed
    #[error("Router is closed")]
    Closed,

    /// An incoming message arrived before a receiver was bound
    #[error("No incoming receiver is bound")]
    NoReceiver,

    /// The dispatch target refused an incoming message
    #[error("Dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),

    /// The message flags do not fit the operation
    #[error("Invalid message: {0}")]
    InvalidMessage(&'static str),

    /// The reentrant queue cannot buffer another message
    #[error(transparent)]
    QueueFull(#[from] QueueError),
}

/// Outcome delivered to a response handler when no response will come
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CallError {
    /// The connection failed (or the router closed) before a response arrived
    #[error("No response for {request_id}")]
    NoResponse { request_id: RequestId },
}

impl CallError {
    /// Returns the request the failure belongs to
    pub fn request_id(&self) -> RequestId {
        match self {
            CallError::NoResponse { request_id } => *request_id,
        }
    }
}

/// Errors a dispatch target reports for an incoming message
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// The receiver does not know the message
    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    /// The receiver understood the message but refused it
    #[error("Message rejected: {0}")]
    Rejected(String),
}
