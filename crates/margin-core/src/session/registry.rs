//! Registry of live sessions
//!
//! One session (actor plus handle) per conversation id. The map is the only
//! shared mutable state of the core; every other piece of session state is
//! owned by that session's actor.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::actor::{ActorServices, SessionActor, SessionCommand, SubmitOutcome};
use super::controller::SessionJobController;
use super::types::{ConversationId, QueuedMessage, SessionInput, SessionSnapshot};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::persistence::{ConversationState, InMemoryPersistence, Persistence};
use crate::transport::{DetachedEditor, EditorBridge, JobTransport};

/// Collaborators handed to every session
#[derive(Clone)]
pub struct SessionServices {
    pub transport: Arc<dyn JobTransport>,
    pub editor: Arc<dyn EditorBridge>,
    pub persistence: Arc<dyn Persistence>,
}

impl SessionServices {
    /// Services with an in-memory store and no editor attached
    pub fn new(transport: Arc<dyn JobTransport>) -> Self {
        Self {
            transport,
            editor: Arc::new(DetachedEditor),
            persistence: Arc::new(InMemoryPersistence::new()),
        }
    }

    pub fn with_editor(mut self, editor: Arc<dyn EditorBridge>) -> Self {
        self.editor = editor;
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }
}

struct SessionInner {
    conversation_id: ConversationId,
    provider: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Cheap, cloneable reference to one live session
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("conversation_id", &self.inner.conversation_id)
            .field("provider", &self.inner.provider)
            .finish()
    }
}

impl SessionHandle {
    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    pub fn provider(&self) -> &str {
        &self.inner.provider
    }

    /// Whether two handles point at the same live session
    pub fn same_session(&self, other: &SessionHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.commands.is_closed()
    }

    fn closed(&self) -> Error {
        Error::SessionClosed(self.inner.conversation_id.clone())
    }

    fn send(&self, command: SessionCommand) -> Result<()> {
        self.inner.commands.send(command).map_err(|_| self.closed())
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(build(reply))?;
        rx.await.map_err(|_| self.closed())
    }

    /// Submit plain chat text
    pub async fn submit(&self, text: impl Into<String>) -> Result<SubmitOutcome> {
        self.submit_message(QueuedMessage::new(text)).await
    }

    pub async fn submit_message(&self, message: QueuedMessage) -> Result<SubmitOutcome> {
        self.request(|reply| SessionCommand::Submit { message, reply })
            .await?
    }

    /// Interrupt the active job; a no-op when idle
    pub fn interrupt(&self) -> Result<()> {
        self.send(SessionCommand::Interrupt)
    }

    /// Apply a pending patch; true once the editor applied it
    pub async fn accept_patch(&self, message_id: impl Into<String>) -> Result<bool> {
        let message_id = message_id.into();
        self.request(|reply| SessionCommand::AcceptPatch { message_id, reply })
            .await
    }

    pub async fn reject_patch(&self, message_id: impl Into<String>) -> Result<bool> {
        let message_id = message_id.into();
        self.request(|reply| SessionCommand::RejectPatch { message_id, reply })
            .await
    }

    /// Ask for a refinement of a pending patch
    pub async fn patch_feedback(
        &self,
        message_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<SubmitOutcome> {
        let message_id = message_id.into();
        let text = text.into();
        self.request(|reply| SessionCommand::PatchFeedback {
            message_id,
            text,
            reply,
        })
        .await?
    }

    pub fn respond_to_tool(
        &self,
        request_id: impl Into<String>,
        result: serde_json::Value,
    ) -> Result<()> {
        self.send(SessionCommand::RespondToTool {
            request_id: request_id.into(),
            result,
        })
    }

    pub async fn remove_message(&self, message_id: impl Into<String>) -> Result<bool> {
        let message_id = message_id.into();
        self.request(|reply| SessionCommand::RemoveMessage { message_id, reply })
            .await
    }

    /// Route a frontend input to the matching operation
    pub async fn dispatch(&self, input: SessionInput) -> Result<()> {
        match input {
            SessionInput::Submit { message } => self.submit_message(message).await.map(|_| ()),
            SessionInput::Interrupt => self.interrupt(),
            SessionInput::AcceptPatch { message_id } => self.accept_patch(message_id).await.map(|_| ()),
            SessionInput::RejectPatch { message_id } => self.reject_patch(message_id).await.map(|_| ()),
            SessionInput::PatchFeedback { message_id, text } => {
                self.patch_feedback(message_id, text).await.map(|_| ())
            }
            SessionInput::RespondToTool { request_id, result } => {
                self.respond_to_tool(request_id, result)
            }
            SessionInput::RemoveMessage { message_id } => {
                self.remove_message(message_id).await.map(|_| ())
            }
        }
    }

    /// Latest published snapshot
    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshots.clone()
    }

    /// Wait until a snapshot satisfies `predicate`
    pub async fn wait_until(
        &self,
        mut predicate: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot> {
        let mut rx = self.subscribe();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| self.closed())?;
        Ok(snapshot.clone())
    }

    /// Wait until no job runs and nothing is queued
    pub async fn wait_for_idle(&self) -> Result<SessionSnapshot> {
        self.wait_until(SessionSnapshot::is_settled).await
    }

    async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.send(SessionCommand::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Creates, looks up and tears down sessions by conversation id
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConversationId, SessionHandle>>,
    services: SessionServices,
    config: Arc<Config>,
}

impl SessionRegistry {
    pub fn new(services: SessionServices, config: Config) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            services,
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get or lazily create the session for a conversation
    pub fn get(&self, conversation_id: &str) -> SessionHandle {
        let provider = self.config.default_provider.clone();
        self.open(conversation_id, &provider)
    }

    /// Get or create a session with an explicit provider tag
    ///
    /// An existing session keeps the provider it was created with.
    pub fn open(&self, conversation_id: &str, provider: &str) -> SessionHandle {
        self.get_or_spawn(conversation_id, || {
            SessionJobController::new(
                conversation_id,
                provider,
                self.config.clone(),
                self.services.persistence.clone(),
            )
        })
    }

    /// Create a session seeded with persisted history
    ///
    /// Returns the existing handle unchanged when the session is already live.
    pub fn restore(
        &self,
        conversation_id: &str,
        provider: &str,
        state: ConversationState,
    ) -> SessionHandle {
        self.get_or_spawn(conversation_id, || {
            SessionJobController::with_state(
                conversation_id,
                provider,
                state,
                self.config.clone(),
                self.services.persistence.clone(),
            )
        })
    }

    fn get_or_spawn(
        &self,
        conversation_id: &str,
        build: impl FnOnce() -> SessionJobController,
    ) -> SessionHandle {
        if let Some(handle) = self.sessions.read().get(conversation_id) {
            return handle.clone();
        }

        let mut sessions = self.sessions.write();
        if let Some(handle) = sessions.get(conversation_id) {
            return handle.clone();
        }

        let controller = build();
        let provider = controller.provider().to_string();
        let spawned = SessionActor::spawn(
            controller,
            ActorServices {
                transport: self.services.transport.clone(),
                editor: self.services.editor.clone(),
            },
            self.config.clone(),
        );

        let handle = SessionHandle {
            inner: Arc::new(SessionInner {
                conversation_id: conversation_id.to_string(),
                provider: provider.clone(),
                commands: spawned.commands,
                snapshots: spawned.snapshots,
                task: Mutex::new(Some(spawned.task)),
            }),
        };
        sessions.insert(conversation_id.to_string(), handle.clone());
        info!(conversation_id, %provider, "Created session");
        handle
    }

    /// Tear a session down and forget it
    ///
    /// Any running job is interrupted and committed, queued messages are
    /// dropped. Returns false when no such session exists.
    pub async fn destroy(&self, conversation_id: &str) -> bool {
        let handle = self.sessions.write().remove(conversation_id);
        match handle {
            Some(handle) => {
                handle.shutdown().await;
                info!(conversation_id, "Destroyed session");
                true
            }
            None => {
                debug!(conversation_id, "No session to destroy");
                false
            }
        }
    }

    /// Destroy every session
    pub async fn destroy_all(&self) {
        for conversation_id in self.list_sessions() {
            self.destroy(&conversation_id).await;
        }
    }

    pub fn has_session(&self, conversation_id: &str) -> bool {
        self.sessions.read().contains_key(conversation_id)
    }

    pub fn list_sessions(&self) -> Vec<ConversationId> {
        self.sessions.read().keys().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    /// Snapshot of a live session without creating one
    pub fn snapshot(&self, conversation_id: &str) -> Option<SessionSnapshot> {
        self.sessions
            .read()
            .get(conversation_id)
            .map(SessionHandle::snapshot)
    }
}
