//! Collaborator interfaces consumed by the session core
//!
//! [`JobTransport`] creates jobs and streams their events; [`EditorBridge`]
//! applies accepted patches to the document and captures selections.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::session::patch::ApplyRequest;
use crate::session::types::{
    Attachment, ChatMessage, ConversationId, JobAction, JobEvent, JobTicket, MessageId,
    PatchAnchor, PatchKind, SelectionSnapshot,
};

/// Proposal being refined by a feedback job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchFeedback {
    pub message_id: MessageId,
    pub kind: PatchKind,
    pub anchor: PatchAnchor,
    pub current_text: String,
}

/// Everything the backend needs to run one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub conversation_id: ConversationId,
    pub provider: String,
    pub action: JobAction,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Committed history before this turn
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<PatchFeedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionSnapshot>,
    #[serde(default)]
    pub extended_reasoning: bool,
}

/// User answer to a tool request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResponse {
    pub request_id: String,
    pub result: serde_json::Value,
}

/// What the job task reports back to its session
#[derive(Debug)]
pub enum JobSignal {
    /// Transport accepted the job
    Created(String),
    /// Job creation failed or was cancelled
    CreateFailed(String),
    Event(JobEvent),
    /// `stream_job_events` returned
    Ended(Result<()>),
}

/// Channel end a transport delivers job events into
///
/// Every event is tagged with the ticket of the job that produced it, so the
/// session can recognize events from a job it already moved past.
#[derive(Debug, Clone)]
pub struct JobEventSink {
    ticket: JobTicket,
    tx: mpsc::UnboundedSender<(JobTicket, JobSignal)>,
}

impl JobEventSink {
    pub fn new(ticket: JobTicket, tx: mpsc::UnboundedSender<(JobTicket, JobSignal)>) -> Self {
        Self { ticket, tx }
    }

    pub fn ticket(&self) -> JobTicket {
        self.ticket
    }

    /// Deliver an event; false once the session is gone
    pub fn emit(&self, event: JobEvent) -> bool {
        self.send(JobSignal::Event(event))
    }

    pub(crate) fn send(&self, signal: JobSignal) -> bool {
        self.tx.send((self.ticket, signal)).is_ok()
    }
}

/// Backend job API
#[async_trait]
pub trait JobTransport: Send + Sync {
    /// Create a job and return its remote id
    async fn create_job(&self, payload: JobPayload) -> Result<String>;

    /// Stream a job's events into `sink` in send order
    ///
    /// Returns when the stream ends. Implementations must stop delivering
    /// promptly once `cancel` fires.
    async fn stream_job_events(
        &self,
        job_id: &str,
        sink: JobEventSink,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Answer a tool request raised by the job
    async fn respond_to_job_request(&self, job_id: &str, response: ToolResponse) -> Result<()>;
}

/// Result of an editor mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOutcome {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EditOutcome {
    pub fn ok() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Result of a selection capture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection: Option<SelectionSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SelectionOutcome {
    pub fn selected(selection: SelectionSnapshot) -> Self {
        Self {
            selection: Some(selection),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            selection: None,
            error: Some(error.into()),
        }
    }
}

/// Document editor integration
#[async_trait]
pub trait EditorBridge: Send + Sync {
    async fn apply_replace_range(&self, anchor: &PatchAnchor, text: &str) -> EditOutcome;

    async fn apply_replace_in_file(&self, anchor: &PatchAnchor, text: &str) -> EditOutcome;

    async fn insert_at_cursor(&self, anchor: &PatchAnchor, text: &str) -> EditOutcome;

    async fn request_selection(&self) -> SelectionOutcome;
}

/// Dispatch an apply request to the matching editor operation
pub async fn apply_patch(editor: &dyn EditorBridge, request: &ApplyRequest) -> EditOutcome {
    match request.kind {
        PatchKind::ReplaceSelection => editor.apply_replace_range(&request.anchor, &request.text).await,
        PatchKind::ReplaceRangeInFile => {
            editor
                .apply_replace_in_file(&request.anchor, &request.text)
                .await
        }
        PatchKind::InsertAtCursor => editor.insert_at_cursor(&request.anchor, &request.text).await,
    }
}

/// Editor used when no document is attached
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedEditor;

const DETACHED: &str = "No editor is attached";

#[async_trait]
impl EditorBridge for DetachedEditor {
    async fn apply_replace_range(&self, _anchor: &PatchAnchor, _text: &str) -> EditOutcome {
        EditOutcome::failed(DETACHED)
    }

    async fn apply_replace_in_file(&self, _anchor: &PatchAnchor, _text: &str) -> EditOutcome {
        EditOutcome::failed(DETACHED)
    }

    async fn insert_at_cursor(&self, _anchor: &PatchAnchor, _text: &str) -> EditOutcome {
        EditOutcome::failed(DETACHED)
    }

    async fn request_selection(&self) -> SelectionOutcome {
        SelectionOutcome::failed(DETACHED)
    }
}
