//! Pending user input for a busy session

use std::collections::VecDeque;

use super::types::QueuedMessage;
use crate::error::{Error, Result};

/// FIFO of messages submitted while a job was active
#[derive(Debug, Default)]
pub struct MessageQueue {
    entries: VecDeque<QueuedMessage>,
    limit: Option<usize>,
}

impl MessageQueue {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            limit,
        }
    }

    /// Append a message and return its 1-based position
    pub fn push(&mut self, message: QueuedMessage) -> Result<usize> {
        if let Some(limit) = self.limit
            && self.entries.len() >= limit
        {
            return Err(Error::QueueFull { limit });
        }
        self.entries.push_back(message);
        Ok(self.entries.len())
    }

    /// Remove and return the oldest message
    pub fn shift(&mut self) -> Option<QueuedMessage> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
