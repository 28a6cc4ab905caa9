//! Host-side pieces of the `margin` binary

pub mod editor;
pub mod frames;
pub mod replay;
pub mod script;
pub mod storage;

pub use editor::DocumentEditor;
pub use replay::{ReplayReport, run_scenario};
pub use script::{Scenario, ScriptedTransport, Step};
pub use storage::{JsonFilePersistence, SavedConversation, default_conversations_dir};
