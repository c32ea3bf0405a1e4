//! Buffer for messages deferred by a blocking call.
//!
//! While a sync call blocks, or while earlier deferred messages are still
//! waiting, non-sync messages land here and are replayed in arrival order
//! once the router is back at the top of its frame.

use ipc::Message;
use std::collections::VecDeque;
use thiserror::Error;

/// A message the reentrant queue had no room for
///
/// The rejected message travels back with the error so the caller decides
/// what happens to it.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("Reentrant queue full ({capacity} messages), cannot defer {message}")]
pub struct QueueError {
    pub capacity: usize,
    pub message: Message,
}

impl QueueError {
    /// Hands back the message that was not queued
    pub fn into_message(self) -> Message {
        self.message
    }
}

#[derive(Debug)]
pub(crate) struct ReentrantQueue {
    limit: usize,
    deferred: VecDeque<Message>,
}

impl ReentrantQueue {
    pub(crate) fn with_capacity(limit: usize) -> Self {
        Self {
            limit,
            deferred: VecDeque::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.deferred.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.deferred.is_empty()
    }

    /// Defers `message` behind everything already queued
    pub(crate) fn push(&mut self, message: Message) -> Result<(), QueueError> {
        if self.deferred.len() == self.limit {
            return Err(QueueError {
                capacity: self.limit,
                message,
            });
        }
        self.deferred.push_back(message);
        Ok(())
    }

    /// Takes the oldest deferred message
    pub(crate) fn pop_front(&mut self) -> Option<Message> {
        self.deferred.pop_front()
    }

    /// Drops everything still deferred, returning the count
    pub(crate) fn clear(&mut self) -> usize {
        let discarded = self.deferred.len();
        self.deferred.clear();
        discarded
    }
}
