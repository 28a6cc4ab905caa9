//! Session types for the job orchestration core
//!
//! These types define the protocol between frontends and the per-conversation
//! session actors: commands going in, job events coming from the transport,
//! and the normalized messages and snapshots coming out.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::tools::{ChainEntry, ToolExecutionView, ToolRequest};

/// Unique identifier for a conversation
pub type ConversationId = String;

/// Unique identifier for a message in a conversation's history
pub type MessageId = String;

/// Local identity of one job within a session
///
/// Tickets are allocated by the controller, so they exist before the
/// transport has assigned a job id. Events are tagged with the ticket of the
/// job that produced them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobTicket(pub u64);

impl fmt::Display for JobTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Lifecycle phase of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    /// Job requested, nothing streamed yet
    Sending,
    /// First progress event received
    Streaming,
    /// Merging the job into history
    Finalizing,
    /// Tearing down an interrupted job
    Interrupting,
}

impl Phase {
    /// Whether a job occupies the session
    pub fn is_active(self) -> bool {
        matches!(self, Self::Sending | Self::Streaming)
    }
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// What kind of job a message starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    /// Conversational turn; content deltas form the transcript
    #[default]
    Chat,
    /// Rewrite the current selection; content deltas are progress only
    RewriteSelection,
}

impl JobAction {
    pub fn is_conversational(self) -> bool {
        matches!(self, Self::Chat)
    }
}

/// A file or snippet attached to a user message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub content: String,
}

/// Text selection captured from the editor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionSnapshot {
    pub text: String,
    pub start: usize,
    pub end: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Kind of edit a patch proposal performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PatchKind {
    ReplaceSelection,
    ReplaceRangeInFile,
    InsertAtCursor,
}

/// Position a patch applies to, captured when it was proposed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatchAnchor {
    Selection {
        start: usize,
        end: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_text: Option<String>,
    },
    FileRange {
        path: String,
        start_line: usize,
        end_line: usize,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected_text: Option<String>,
    },
    Cursor {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<usize>,
    },
}

/// Review state of a patch proposal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
}

/// Patch review block attached to a persisted message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchReview {
    pub kind: PatchKind,
    pub anchor: PatchAnchor,
    pub text: String,
    pub status: PatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of feedback refinements applied
    #[serde(default)]
    pub revision: u32,
}

/// Stream a delta belongs to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaChannel {
    #[default]
    Content,
    Thinking,
}

/// Kind of a tool request awaiting the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolRequestKind {
    Approval,
    UserInput,
}

/// Stage of a traced tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStage {
    Start,
    Finish,
}

/// Tool sub-event carried by a trace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTrace {
    pub id: String,
    pub name: String,
    pub stage: ToolStage,
    /// Outcome for `finish`; absent means success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
}

/// Events delivered by the job stream, in send order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    Delta {
        text: String,
        #[serde(default)]
        channel: DeltaChannel,
    },
    Trace {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tool: Option<ToolTrace>,
    },
    Plan {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default)]
        steps: Vec<String>,
    },
    ToolCall {
        request_id: String,
        kind: ToolRequestKind,
        #[serde(default)]
        prompt: String,
        #[serde(default)]
        payload: serde_json::Value,
    },
    Usage {
        used: i64,
        window: i64,
    },
    Patch {
        kind: PatchKind,
        anchor: PatchAnchor,
        text: String,
    },
    Done {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl JobEvent {
    /// Create a content delta
    pub fn delta(text: impl Into<String>) -> Self {
        Self::Delta {
            text: text.into(),
            channel: DeltaChannel::Content,
        }
    }

    /// Create a thinking delta
    pub fn thinking(text: impl Into<String>) -> Self {
        Self::Delta {
            text: text.into(),
            channel: DeltaChannel::Thinking,
        }
    }

    /// Create a terminal event
    pub fn done(status: impl Into<String>) -> Self {
        Self::Done {
            status: status.into(),
            message: None,
        }
    }

    /// Create a failing terminal event with a message
    pub fn failed(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Done {
            status: status.into(),
            message: Some(message.into()),
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::Delta { .. } => "delta",
            Self::Trace { .. } => "trace",
            Self::Plan { .. } => "plan",
            Self::ToolCall { .. } => "tool_call",
            Self::Usage { .. } => "usage",
            Self::Patch { .. } => "patch",
            Self::Done { .. } => "done",
        }
    }
}

/// Normalized conversation message, ready for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch: Option<PatchReview>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            status_line: None,
            patch: None,
            attachments: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(Role::System, content)
    }

    /// Assistant message carrying a patch review card
    pub fn patch_card(review: PatchReview) -> Self {
        let mut message = Self::with_role(Role::Assistant, String::new());
        message.patch = Some(review);
        message
    }

    pub fn with_status_line(mut self, status_line: Option<String>) -> Self {
        self.status_line = status_line;
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// User input waiting for (or about to start) a job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    /// Patch proposal this message refines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_feedback_target: Option<MessageId>,
    #[serde(default)]
    pub action: JobAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionSnapshot>,
}

impl QueuedMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
            patch_feedback_target: None,
            action: JobAction::Chat,
            selection: None,
        }
    }

    /// Feedback round for a pending patch proposal
    pub fn feedback(message_id: impl Into<MessageId>, text: impl Into<String>) -> Self {
        Self::new(text).with_feedback_target(message_id)
    }

    pub fn with_attachments(mut self, attachments: Vec<Attachment>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_feedback_target(mut self, message_id: impl Into<MessageId>) -> Self {
        self.patch_feedback_target = Some(message_id.into());
        self
    }

    pub fn with_action(mut self, action: JobAction) -> Self {
        self.action = action;
        self
    }

    pub fn with_selection(mut self, selection: SelectionSnapshot) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// Token usage reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub used: u64,
    pub window: u64,
    /// 0.0 - 100.0
    pub percentage: f64,
}

impl UsageSnapshot {
    /// Build a snapshot from raw backend numbers, clamping out-of-range values
    pub fn from_report(used: i64, window: i64) -> Self {
        let window = window.max(0) as u64;
        let used = (used.max(0) as u64).min(window);
        let percentage = if window == 0 {
            0.0
        } else {
            (used as f64 / window as f64 * 100.0).clamp(0.0, 100.0)
        };

        Self {
            used,
            window,
            percentage,
        }
    }
}

/// Input messages sent to a session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionInput {
    /// User submits a message (queued while a job is active)
    Submit { message: QueuedMessage },
    /// User interrupts the active job
    Interrupt,
    /// User accepts a pending patch proposal
    AcceptPatch { message_id: MessageId },
    /// User rejects a pending patch proposal
    RejectPatch { message_id: MessageId },
    /// User asks for a refinement of a pending patch proposal
    PatchFeedback { message_id: MessageId, text: String },
    /// User answers a tool request
    RespondToTool {
        request_id: String,
        result: serde_json::Value,
    },
    /// User removes a message from history
    RemoveMessage { message_id: MessageId },
}

impl SessionInput {
    /// Create a plain chat submission
    pub fn user_message(text: impl Into<String>) -> Self {
        Self::Submit {
            message: QueuedMessage::new(text),
        }
    }

    pub fn interrupt() -> Self {
        Self::Interrupt
    }

    pub fn accept_patch(message_id: impl Into<MessageId>) -> Self {
        Self::AcceptPatch {
            message_id: message_id.into(),
        }
    }

    pub fn reject_patch(message_id: impl Into<MessageId>) -> Self {
        Self::RejectPatch {
            message_id: message_id.into(),
        }
    }

    pub fn patch_feedback(message_id: impl Into<MessageId>, text: impl Into<String>) -> Self {
        Self::PatchFeedback {
            message_id: message_id.into(),
            text: text.into(),
        }
    }

    pub fn respond_to_tool(request_id: impl Into<String>, result: serde_json::Value) -> Self {
        Self::RespondToTool {
            request_id: request_id.into(),
            result,
        }
    }
}

/// Read-only projection of a session for presentation
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub conversation_id: ConversationId,
    pub provider: String,
    pub phase: Phase,
    pub status_line: Option<String>,
    /// Revealed text of the active job
    pub streaming_text: String,
    /// Thinking transcript of the active job
    pub thinking: String,
    pub chain: Vec<ChainEntry>,
    pub tool_executions: Vec<ToolExecutionView>,
    pub usage: Option<UsageSnapshot>,
    pub queued: usize,
    pub active_tool_request: Option<ToolRequest>,
    pub pending_tool_requests: usize,
    pub messages: Vec<ChatMessage>,
    /// Persistence revision the messages were derived from
    pub revision: u64,
}

impl SessionSnapshot {
    /// Whether the session has no job and nothing queued
    pub fn is_settled(&self) -> bool {
        self.phase == Phase::Idle && self.queued == 0
    }

    /// Most recent message carrying a patch review card
    pub fn latest_patch(&self) -> Option<&ChatMessage> {
        self.messages.iter().rev().find(|m| m.patch.is_some())
    }
}
