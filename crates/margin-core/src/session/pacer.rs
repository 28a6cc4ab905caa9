//! Paced token reveal for one job's content stream
//!
//! Incoming deltas arrive in network-sized bursts. The pacer splits them into
//! whitespace and non-whitespace runs and reveals one run per drain tick, so
//! the visual rate does not depend on how the transport batches bytes.

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;

static TOKEN_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+|\S+").ok());

/// Split text into contiguous whitespace and non-whitespace runs
pub fn tokenize(text: &str) -> Vec<String> {
    match TOKEN_PATTERN.as_ref() {
        Some(pattern) => pattern
            .find_iter(text)
            .map(|m| m.as_str().to_string())
            .collect(),
        None if text.is_empty() => Vec::new(),
        None => vec![text.to_string()],
    }
}

/// Stream buffer plus reveal cursor for the active job
#[derive(Debug, Default)]
pub struct TokenPacer {
    pending: VecDeque<String>,
    revealed: String,
}

impl TokenPacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything; called at job start
    pub fn reset(&mut self) {
        self.pending.clear();
        self.revealed.clear();
    }

    /// Append a delta, returning how many tokens were queued
    pub fn enqueue(&mut self, text: &str) -> usize {
        let tokens = tokenize(text);
        let added = tokens.len();
        self.pending.extend(tokens);
        added
    }

    /// Reveal the next token. Returns false when nothing was pending.
    pub fn tick(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(token) => {
                self.revealed.push_str(&token);
                true
            }
            None => false,
        }
    }

    /// Reveal everything at once
    pub fn flush(&mut self) {
        for token in self.pending.drain(..) {
            self.revealed.push_str(&token);
        }
    }

    pub fn is_drained(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn revealed(&self) -> &str {
        &self.revealed
    }

    /// Revealed text plus everything still queued
    #[cfg(test)]
    pub fn full_text(&self) -> String {
        let mut text = self.revealed.clone();
        for token in &self.pending {
            text.push_str(token);
        }
        text
    }
}
