//! Tool activity of the active job
//!
//! Tracks three things: tool requests waiting for a user answer (the oldest
//! one is shown), tool executions reported through traces, and the
//! chain-of-thought list that interleaves thinking text with tool steps.

use std::collections::VecDeque;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::types::ToolRequestKind;
use crate::config::ToolActivityConfig;

/// A tool call waiting for the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolRequest {
    pub request_id: String,
    pub kind: ToolRequestKind,
    pub prompt: String,
    pub payload: serde_json::Value,
}

/// State of a traced tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Running,
    Finished,
    Failed,
}

/// Presentation form of a tool execution record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolExecutionView {
    pub id: String,
    pub name: String,
    pub state: ExecutionState,
}

/// One entry of the chain-of-thought list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChainEntry {
    Thinking {
        text: String,
    },
    Tool {
        id: String,
        name: String,
        state: ExecutionState,
    },
}

#[derive(Debug)]
struct ToolExecution {
    id: String,
    name: String,
    state: ExecutionState,
    /// Running: when it times out. Otherwise: when it is removed.
    deadline: Instant,
}

#[derive(Debug)]
pub struct ToolActivity {
    requests: VecDeque<ToolRequest>,
    executions: Vec<ToolExecution>,
    chain: Vec<ChainEntry>,
    timeout: Duration,
    grace: Duration,
}

impl ToolActivity {
    pub fn new(config: &ToolActivityConfig) -> Self {
        Self {
            requests: VecDeque::new(),
            executions: Vec::new(),
            chain: Vec::new(),
            timeout: config.execution_timeout(),
            grace: config.removal_grace(),
        }
    }

    /// Queue a request unless one with the same id is already waiting
    pub fn raise(&mut self, request: ToolRequest) -> bool {
        if self
            .requests
            .iter()
            .any(|r| r.request_id == request.request_id)
        {
            return false;
        }
        self.requests.push_back(request);
        true
    }

    /// The request currently shown to the user
    pub fn active_request(&self) -> Option<&ToolRequest> {
        self.requests.front()
    }

    pub fn resolve(&mut self, request_id: &str) -> Option<ToolRequest> {
        let index = self
            .requests
            .iter()
            .position(|r| r.request_id == request_id)?;
        self.requests.remove(index)
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    /// Stage a running record for a tool-start trace
    pub fn start_execution(&mut self, id: &str, name: &str, now: Instant) {
        if self.executions.iter().any(|e| e.id == id) {
            return;
        }
        self.executions.push(ToolExecution {
            id: id.to_string(),
            name: name.to_string(),
            state: ExecutionState::Running,
            deadline: now + self.timeout,
        });
        self.chain.push(ChainEntry::Tool {
            id: id.to_string(),
            name: name.to_string(),
            state: ExecutionState::Running,
        });
    }

    /// Settle a record for a tool-finish trace
    pub fn finish_execution(&mut self, id: &str, ok: bool, now: Instant) {
        let state = if ok {
            ExecutionState::Finished
        } else {
            ExecutionState::Failed
        };
        let deadline = now + self.grace;

        match self.executions.iter_mut().find(|e| e.id == id) {
            Some(execution) if execution.state == ExecutionState::Running => {
                execution.state = state;
                execution.deadline = deadline;
            }
            _ => return,
        }
        self.set_chain_state(id, state);
    }

    /// Thinking text joins the previous thinking entry when adjacent
    pub fn append_thinking(&mut self, text: &str) {
        if let Some(ChainEntry::Thinking { text: existing }) = self.chain.last_mut() {
            existing.push_str(text);
            return;
        }
        self.chain.push(ChainEntry::Thinking {
            text: text.to_string(),
        });
    }

    /// Apply timeouts and removals due at `now`; true if anything changed
    pub fn expire(&mut self, now: Instant) -> bool {
        let mut changed = false;
        let mut timed_out = Vec::new();

        self.executions.retain_mut(|execution| {
            if execution.deadline > now {
                return true;
            }
            changed = true;
            if execution.state == ExecutionState::Running {
                execution.state = ExecutionState::Failed;
                execution.deadline = now + self.grace;
                timed_out.push(execution.id.clone());
                true
            } else {
                false
            }
        });

        for id in timed_out {
            tracing::debug!(tool_id = %id, "Tool execution timed out");
            self.set_chain_state(&id, ExecutionState::Failed);
        }
        changed
    }

    /// Earliest pending timeout or removal
    pub fn next_deadline(&self) -> Option<Instant> {
        self.executions.iter().map(|e| e.deadline).min()
    }

    pub fn executions(&self) -> Vec<ToolExecutionView> {
        self.executions
            .iter()
            .map(|e| ToolExecutionView {
                id: e.id.clone(),
                name: e.name.clone(),
                state: e.state,
            })
            .collect()
    }

    pub fn chain(&self) -> &[ChainEntry] {
        &self.chain
    }

    /// Forget everything from the previous job
    pub fn reset(&mut self) {
        self.requests.clear();
        self.executions.clear();
        self.chain.clear();
    }

    fn set_chain_state(&mut self, id: &str, new_state: ExecutionState) {
        for entry in self.chain.iter_mut().rev() {
            if let ChainEntry::Tool { id: entry_id, state, .. } = entry
                && entry_id == id
            {
                *state = new_state;
                return;
            }
        }
    }
}
