//! Session module - per-conversation job orchestration
//!
//! Every conversation gets one session. A session runs at most one job at a
//! time, queues further input, paces the streamed reply and reconciles it (and
//! any patch proposals) into history exactly once.
//!
//! - `SessionRegistry`: creates and tears down sessions by conversation id
//! - `SessionHandle`: the cloneable front door of one session
//! - `SessionJobController`: the synchronous job lifecycle state machine
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     SessionRegistry                      │
//! │                                                          │
//! │  get(conversation_id) ──▶ SessionHandle                  │
//! │                              │ SessionCommand             │
//! │                              ▼                            │
//! │            ┌─────────────── SessionActor ─────────────┐   │
//! │            │ SessionJobController                     │   │
//! │            │  pacer timer · clock timer · tool expiry │   │
//! │            └──────▲──────────────────────┬────────────┘   │
//! │      (ticket, JobSignal)           watch<SessionSnapshot> │
//! │                   │                      ▼                │
//! │               job task ◀── JobTransport   presentation    │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use margin_core::session::{SessionRegistry, SessionServices};
//!
//! let registry = SessionRegistry::new(SessionServices::new(transport), Config::default());
//! let session = registry.get("conversation-1");
//! session.submit("Explain this function").await?;
//!
//! let snapshot = session.wait_for_idle().await?;
//! for message in &snapshot.messages {
//!     println!("{:?}: {}", message.role, message.content);
//! }
//! ```

mod actor;
pub mod clock;
pub mod controller;
pub mod pacer;
pub mod patch;
pub mod queue;
mod registry;
pub mod tools;
pub mod types;

pub use actor::SubmitOutcome;
pub use clock::{ThinkingClock, format_elapsed};
pub use controller::{JobStart, SessionJobController, Submission};
pub use pacer::TokenPacer;
pub use patch::{ApplyRequest, PatchProposal, PatchProposalStore};
pub use queue::MessageQueue;
pub use registry::{SessionHandle, SessionRegistry, SessionServices};
pub use tools::{ChainEntry, ExecutionState, ToolActivity, ToolExecutionView, ToolRequest};
pub use types::{
    Attachment, ChatMessage, ConversationId, DeltaChannel, JobAction, JobEvent, JobTicket,
    MessageId, PatchAnchor, PatchKind, PatchReview, PatchStatus, Phase, QueuedMessage, Role,
    SelectionSnapshot, SessionInput, SessionSnapshot, ToolRequestKind, ToolStage, ToolTrace,
    UsageSnapshot,
};
