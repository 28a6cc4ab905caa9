//! Margin Core - job orchestration for a document-side coding assistant
//!
//! This crate provides the per-conversation core of the assistant:
//! - One session actor per conversation with a single active job
//! - Queued user input and paced streaming output
//! - Patch proposal review (accept, reject, feedback refinement)
//! - Exactly-once reconciliation of each job into conversation history
//!
//! Transports, the document editor and durable storage are collaborators
//! behind the traits in [`transport`] and [`persistence`].

pub mod config;
pub mod error;
pub mod persistence;
pub mod session;
pub mod transport;

pub use config::{Config, ConfigManager, TerminalStatus};
pub use error::{Error, Result};
pub use persistence::{ConversationState, InMemoryPersistence, Persistence};
pub use session::{
    ChatMessage, JobEvent, Phase, QueuedMessage, SessionHandle, SessionInput, SessionRegistry,
    SessionServices, SessionSnapshot, SubmitOutcome,
};
pub use transport::{
    DetachedEditor, EditOutcome, EditorBridge, JobEventSink, JobPayload, JobTransport,
    SelectionOutcome, ToolResponse,
};
