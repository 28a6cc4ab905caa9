//! Job lifecycle state machine for one conversation
//!
//! The controller is synchronous: every input carries the current instant and
//! every output tells the driver what to do next (start a job, arm a timer).
//! The session actor owns it and serializes all calls.

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clock::ThinkingClock;
use super::pacer::TokenPacer;
use super::patch::{ApplyRequest, PatchProposal, PatchProposalStore};
use super::queue::MessageQueue;
use super::tools::{ToolActivity, ToolRequest};
use super::types::{
    ChatMessage, ConversationId, DeltaChannel, JobAction, JobEvent, JobTicket, MessageId,
    PatchStatus, Phase, QueuedMessage, SessionSnapshot, ToolStage, UsageSnapshot,
};
use crate::config::{CompletionConfig, Config, TerminalStatus};
use crate::error::Result;
use crate::persistence::{ConversationState, Persistence, normalize_messages};
use crate::transport::{EditOutcome, JobPayload, PatchFeedback};

const STREAM_ENDED_EARLY: &str = "Job stream ended without a terminal event";

/// A job the driver must create through the transport
#[derive(Debug)]
pub struct JobStart {
    pub ticket: JobTicket,
    pub payload: JobPayload,
    pub cancel: CancellationToken,
}

/// What happened to a submitted message
#[derive(Debug)]
pub enum Submission {
    Started(JobStart),
    /// Waiting behind the active job (1-based)
    Queued { position: usize },
    /// Nothing to send
    Ignored,
}

/// Terminal signal waiting for the stream buffer to drain
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingDone {
    status: String,
    failure: Option<String>,
}

impl PendingDone {
    fn from_done(completion: &CompletionConfig, status: String, message: Option<String>) -> Self {
        let failure = match completion.normalize(&status) {
            TerminalStatus::Ok => None,
            TerminalStatus::Failed(normalized) => Some(
                message
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| format!("Job ended with status \"{}\"", normalized)),
            ),
        };
        Self { status, failure }
    }

    fn failure(message: String) -> Self {
        Self {
            status: "error".to_string(),
            failure: Some(message),
        }
    }
}

#[derive(Debug)]
struct ActiveJob {
    ticket: JobTicket,
    job_id: Option<String>,
    action: JobAction,
    cancel: CancellationToken,
    user_message: ChatMessage,
    pending_done: Option<PendingDone>,
    /// Proposal this job was asked to refine, until it does
    feedback_target: Option<MessageId>,
}

/// The most recently finalized job, whose stream may still deliver patches
#[derive(Debug)]
struct FinalizedJob {
    ticket: JobTicket,
    feedback_target: Option<MessageId>,
    cancel: CancellationToken,
}

pub struct SessionJobController {
    conversation_id: ConversationId,
    provider: String,
    config: Arc<Config>,
    persistence: Arc<dyn Persistence>,
    phase: Phase,
    queue: MessageQueue,
    pacer: TokenPacer,
    clock: ThinkingClock,
    patches: PatchProposalStore,
    tools: ToolActivity,
    usage: Option<UsageSnapshot>,
    /// Prefix reported by trace/plan events
    status_label: Option<String>,
    /// Last non-empty progress line of a non-conversational job
    progress: Option<String>,
    progress_buffer: String,
    thinking: String,
    state: ConversationState,
    active: Option<ActiveJob>,
    last_finalized: Option<FinalizedJob>,
    next_ticket: u64,
}

impl SessionJobController {
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        provider: impl Into<String>,
        config: Arc<Config>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        Self::with_state(
            conversation_id,
            provider,
            ConversationState::default(),
            config,
            persistence,
        )
    }

    /// Seed a controller with previously persisted history
    pub fn with_state(
        conversation_id: impl Into<ConversationId>,
        provider: impl Into<String>,
        state: ConversationState,
        config: Arc<Config>,
        persistence: Arc<dyn Persistence>,
    ) -> Self {
        let mut patches = PatchProposalStore::new();
        patches.restore(&state.messages);

        Self {
            conversation_id: conversation_id.into(),
            provider: provider.into(),
            queue: MessageQueue::new(config.queue.max_pending),
            pacer: TokenPacer::new(),
            clock: ThinkingClock::new(),
            patches,
            tools: ToolActivity::new(&config.tools),
            usage: None,
            status_label: None,
            progress: None,
            progress_buffer: String::new(),
            thinking: String::new(),
            state,
            active: None,
            last_finalized: None,
            next_ticket: 1,
            phase: Phase::Idle,
            config,
            persistence,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> &ConversationState {
        &self.state
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Remote id of the active job, once the transport created it
    pub fn active_job_id(&self) -> Option<&str> {
        self.active.as_ref().and_then(|a| a.job_id.as_deref())
    }

    pub fn active_ticket(&self) -> Option<JobTicket> {
        self.active.as_ref().map(|a| a.ticket)
    }

    /// Start a job for `message`, or queue it behind the active one
    pub fn submit(&mut self, message: QueuedMessage, now: Instant) -> Result<Submission> {
        if message.text.trim().is_empty() && message.attachments.is_empty() {
            return Ok(Submission::Ignored);
        }

        if self.active.is_some() || self.phase != Phase::Idle {
            let position = self.queue.push(message)?;
            debug!(
                conversation_id = %self.conversation_id,
                position,
                "Queued message behind active job"
            );
            return Ok(Submission::Queued { position });
        }

        // Anything already waiting goes first
        if !self.queue.is_empty() {
            self.queue.push(message)?;
            return Ok(self
                .start_next(now)
                .map(Submission::Started)
                .unwrap_or(Submission::Ignored));
        }

        Ok(Submission::Started(self.start_job(message, now)))
    }

    fn start_job(&mut self, message: QueuedMessage, now: Instant) -> JobStart {
        let ticket = JobTicket(self.next_ticket);
        self.next_ticket += 1;

        self.pacer.reset();
        self.tools.reset();
        self.thinking.clear();
        self.status_label = None;
        self.progress = None;
        self.progress_buffer.clear();

        let feedback = message
            .patch_feedback_target
            .as_deref()
            .and_then(|target| self.patches.pending(target))
            .map(|proposal| PatchFeedback {
                message_id: proposal.message_id.clone(),
                kind: proposal.kind,
                anchor: proposal.anchor.clone(),
                current_text: proposal.text.clone(),
            });

        let feedback_target = feedback.as_ref().map(|f| f.message_id.clone());
        let payload = JobPayload {
            conversation_id: self.conversation_id.clone(),
            provider: self.provider.clone(),
            action: message.action,
            text: message.text.clone(),
            attachments: message.attachments.clone(),
            history: self.state.messages.clone(),
            feedback,
            selection: message.selection,
            extended_reasoning: self.config.status.extended_reasoning,
        };

        let cancel = CancellationToken::new();
        self.active = Some(ActiveJob {
            ticket,
            job_id: None,
            action: message.action,
            cancel: cancel.clone(),
            user_message: ChatMessage::user(message.text).with_attachments(message.attachments),
            pending_done: None,
            feedback_target,
        });
        self.clock.start(self.config.status.label(), now);
        self.phase = Phase::Sending;

        info!(
            conversation_id = %self.conversation_id,
            %ticket,
            action = ?payload.action,
            "Starting job"
        );

        JobStart {
            ticket,
            payload,
            cancel,
        }
    }

    fn start_next(&mut self, now: Instant) -> Option<JobStart> {
        let message = self.queue.shift()?;
        Some(self.start_job(message, now))
    }

    fn is_active_ticket(&self, ticket: JobTicket) -> bool {
        self.active.as_ref().is_some_and(|a| a.ticket == ticket)
    }

    /// The transport assigned a remote id to a job
    pub fn job_created(&mut self, ticket: JobTicket, job_id: String) -> bool {
        match self.active.as_mut() {
            Some(active) if active.ticket == ticket => {
                debug!(conversation_id = %self.conversation_id, %ticket, %job_id, "Job created");
                active.job_id = Some(job_id);
                true
            }
            _ => false,
        }
    }

    /// Consume one event from a job stream
    ///
    /// Returns the next job to start when this event finished the active one.
    pub fn handle_event(
        &mut self,
        ticket: JobTicket,
        event: JobEvent,
        now: Instant,
    ) -> Option<JobStart> {
        if !self.is_active_ticket(ticket) {
            match event {
                JobEvent::Patch { kind, anchor, text }
                    if self.last_finalized.as_ref().is_some_and(|j| j.ticket == ticket) =>
                {
                    self.apply_late_patch(PatchProposal::new(kind, anchor, text));
                }
                other => {
                    debug!(
                        conversation_id = %self.conversation_id,
                        %ticket,
                        event = other.name(),
                        "Dropping stale job event"
                    );
                }
            }
            return None;
        }

        match event {
            JobEvent::Delta {
                text,
                channel: DeltaChannel::Thinking,
            } => {
                self.mark_streaming();
                self.thinking.push_str(&text);
                self.tools.append_thinking(&text);
            }
            JobEvent::Delta { text, .. } => {
                self.mark_streaming();
                if self.active_action().is_conversational() {
                    self.pacer.enqueue(&text);
                } else {
                    self.record_progress(&text, now);
                }
            }
            JobEvent::Trace { label, tool } => {
                self.mark_streaming();
                let explicit = label.filter(|l| !l.trim().is_empty());
                if let Some(tool) = tool {
                    match tool.stage {
                        ToolStage::Start => {
                            self.tools.start_execution(&tool.id, &tool.name, now);
                            if explicit.is_none() {
                                self.status_label = Some(format!("Running {}", tool.name));
                            }
                        }
                        ToolStage::Finish => {
                            self.tools
                                .finish_execution(&tool.id, tool.ok.unwrap_or(true), now);
                        }
                    }
                }
                if explicit.is_some() {
                    self.status_label = explicit;
                }
                self.clock_tick(now);
            }
            JobEvent::Plan { label, steps } => {
                self.mark_streaming();
                let label = label
                    .filter(|l| !l.trim().is_empty())
                    .or_else(|| steps.into_iter().rev().find(|s| !s.trim().is_empty()));
                if label.is_some() {
                    self.status_label = label;
                }
                self.clock_tick(now);
            }
            JobEvent::ToolCall {
                request_id,
                kind,
                prompt,
                payload,
            } => {
                let raised = self.tools.raise(ToolRequest {
                    request_id,
                    kind,
                    prompt,
                    payload,
                });
                if !raised {
                    debug!(conversation_id = %self.conversation_id, "Tool request already pending");
                }
            }
            JobEvent::Usage { used, window } => {
                self.usage = Some(UsageSnapshot::from_report(used, window));
            }
            JobEvent::Patch { kind, anchor, text } => {
                let target = self
                    .active
                    .as_mut()
                    .and_then(|a| a.feedback_target.take())
                    .filter(|t| self.patches.pending(t).is_some());
                match target {
                    Some(target) => {
                        self.patches.refine(&target, text);
                        debug!(conversation_id = %self.conversation_id, message_id = %target, "Refined patch proposal");
                    }
                    None => {
                        self.patches.stage(PatchProposal::new(kind, anchor, text));
                    }
                }
            }
            JobEvent::Done { status, message } => {
                let done = PendingDone::from_done(&self.config.completion, status, message);
                let active = self.active.as_mut()?;
                if active.pending_done.is_some() {
                    debug!(conversation_id = %self.conversation_id, %ticket, "Ignoring repeated done");
                    return None;
                }
                active.pending_done = Some(done);
                if self.pacer.is_drained() {
                    return self.finalize(now);
                }
            }
        }
        None
    }

    fn active_action(&self) -> JobAction {
        self.active.as_ref().map(|a| a.action).unwrap_or_default()
    }

    fn mark_streaming(&mut self) {
        if self.phase == Phase::Sending {
            self.phase = Phase::Streaming;
        }
    }

    fn record_progress(&mut self, text: &str, now: Instant) {
        self.progress_buffer.push_str(text);
        if let Some(line) = self
            .progress_buffer
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
        {
            self.progress = Some(line.to_string());
        }
        self.clock_tick(now);
    }

    fn live_label(&self) -> Option<&str> {
        self.status_label.as_deref().or(self.progress.as_deref())
    }

    /// A patch from the last finalized job refines only that job's own target
    fn apply_late_patch(&mut self, proposal: PatchProposal) {
        let target = self
            .last_finalized
            .as_mut()
            .and_then(|job| job.feedback_target.take())
            .filter(|t| self.patches.pending(t).is_some());
        let appended = match target {
            Some(target) => {
                self.patches.refine(&target, proposal.text);
                Vec::new()
            }
            None => vec![self.patches.insert(proposal)],
        };
        info!(conversation_id = %self.conversation_id, "Recorded late patch proposal");
        self.commit(appended);
    }

    /// Whether the drain timer should be armed
    pub fn wants_pacer(&self) -> bool {
        self.active.is_some() && !self.pacer.is_drained()
    }

    pub fn clock_running(&self) -> bool {
        self.clock.is_running()
    }

    /// Reveal one token; finalizes when a terminal event was waiting on it
    pub fn pacer_tick(&mut self, now: Instant) -> Option<JobStart> {
        self.active.as_ref()?;
        self.pacer.tick();
        let done_waiting = self
            .active
            .as_ref()
            .is_some_and(|a| a.pending_done.is_some());
        if done_waiting && self.pacer.is_drained() {
            return self.finalize(now);
        }
        None
    }

    pub fn clock_tick(&mut self, now: Instant) {
        let label = self.live_label().map(str::to_string);
        self.clock.tick(label.as_deref(), now);
    }

    fn finalize(&mut self, now: Instant) -> Option<JobStart> {
        let active = self.active.take()?;
        self.phase = Phase::Finalizing;

        let done = active
            .pending_done
            .unwrap_or_else(|| PendingDone::failure(STREAM_ENDED_EARLY.to_string()));
        self.clock.mark_complete(now);
        let status_line = self.clock.status_line().map(str::to_string);

        let mut appended = vec![active.user_message];
        let text = self.pacer.revealed().to_string();
        if active.action.is_conversational() && !text.trim().is_empty() {
            appended.push(ChatMessage::assistant(text).with_status_line(status_line));
        }
        let failed = done.failure.is_some();
        if let Some(failure) = done.failure {
            appended.push(ChatMessage::system(failure));
        }
        appended.extend(self.patches.take_staged());

        self.tools.clear_requests();
        self.clear_stream();
        self.commit(appended);
        self.retire_finalized();
        self.last_finalized = Some(FinalizedJob {
            ticket: active.ticket,
            feedback_target: active.feedback_target,
            cancel: active.cancel,
        });
        self.phase = Phase::Idle;

        info!(
            conversation_id = %self.conversation_id,
            ticket = %active.ticket,
            status = %done.status,
            failed,
            revision = self.state.revision,
            "Job finalized"
        );

        self.start_next(now)
    }

    /// Abort the active job, keeping whatever it produced so far
    pub fn interrupt(&mut self, now: Instant) -> Option<JobStart> {
        let active = self.active.take()?;
        self.phase = Phase::Interrupting;
        active.cancel.cancel();

        self.pacer.flush();
        let marker = &self.config.completion.interrupted_marker;
        let revealed = self.pacer.revealed();
        let content = if revealed.is_empty() {
            marker.clone()
        } else {
            format!("{}\n\n{}", revealed, marker)
        };

        let dropped = self.patches.discard_staged();
        self.clock.stop();
        self.tools.clear_requests();
        self.clear_stream();

        self.commit(vec![active.user_message, ChatMessage::assistant(content)]);
        self.retire_finalized();
        self.phase = Phase::Idle;

        info!(
            conversation_id = %self.conversation_id,
            ticket = %active.ticket,
            dropped_patches = dropped,
            "Job interrupted"
        );

        self.start_next(now)
    }

    /// Job creation or streaming failed
    pub fn transport_failed(
        &mut self,
        ticket: JobTicket,
        error: &str,
        now: Instant,
    ) -> Option<JobStart> {
        let active = self.active.as_mut().filter(|a| a.ticket == ticket)?;
        if active.cancel.is_cancelled() || active.pending_done.is_some() {
            return None;
        }
        warn!(conversation_id = %self.conversation_id, %ticket, error, "Job transport failed");
        active.pending_done = Some(PendingDone::failure(format!("Request failed: {}", error)));
        if self.pacer.is_drained() {
            return self.finalize(now);
        }
        None
    }

    /// The job stream returned
    pub fn stream_ended(&mut self, ticket: JobTicket, now: Instant) -> Option<JobStart> {
        let active = self.active.as_mut().filter(|a| a.ticket == ticket)?;
        if active.cancel.is_cancelled() || active.pending_done.is_some() {
            return None;
        }
        warn!(conversation_id = %self.conversation_id, %ticket, "{}", STREAM_ENDED_EARLY);
        active.pending_done = Some(PendingDone::failure(STREAM_ENDED_EARLY.to_string()));
        if self.pacer.is_drained() {
            return self.finalize(now);
        }
        None
    }

    /// Stop listening to the last finalized job's stream
    fn retire_finalized(&mut self) {
        if let Some(job) = self.last_finalized.take() {
            job.cancel.cancel();
            debug!(conversation_id = %self.conversation_id, ticket = %job.ticket, "Closed finished job stream");
        }
    }

    fn clear_stream(&mut self) {
        self.pacer.reset();
        self.status_label = None;
        self.progress = None;
        self.progress_buffer.clear();
    }

    /// Start applying a pending proposal
    pub fn begin_apply(&self, message_id: &str) -> Option<ApplyRequest> {
        self.patches.begin_apply(message_id)
    }

    /// Record what the editor did with an apply request
    pub fn apply_result(&mut self, message_id: &str, outcome: EditOutcome) -> bool {
        let changed = if outcome.ok {
            self.patches.set_status(message_id, PatchStatus::Accepted)
        } else {
            let error = outcome
                .error
                .unwrap_or_else(|| "Patch could not be applied".to_string());
            warn!(conversation_id = %self.conversation_id, message_id, %error, "Patch apply failed");
            self.patches.record_error(message_id, error)
        };
        if changed {
            self.commit(Vec::new());
        }
        changed
    }

    pub fn reject(&mut self, message_id: &str) -> bool {
        let changed = self.patches.set_status(message_id, PatchStatus::Rejected);
        if changed {
            self.commit(Vec::new());
        }
        changed
    }

    /// Ask for a refinement of a pending proposal
    pub fn patch_feedback(
        &mut self,
        message_id: &str,
        text: impl Into<String>,
        now: Instant,
    ) -> Result<Submission> {
        if self.patches.pending(message_id).is_none() {
            return Ok(Submission::Ignored);
        }
        self.submit(QueuedMessage::feedback(message_id, text), now)
    }

    /// Resolve a tool request, returning the job it belongs to
    pub fn respond_to_tool(&mut self, request_id: &str) -> Option<(String, ToolRequest)> {
        let request = self.tools.resolve(request_id)?;
        let job_id = self.active_job_id()?.to_string();
        Some((job_id, request))
    }

    pub fn expire_tools(&mut self, now: Instant) -> bool {
        self.tools.expire(now)
    }

    pub fn next_tool_deadline(&self) -> Option<Instant> {
        self.tools.next_deadline()
    }

    /// Drop a message (and its proposal) from history
    pub fn remove_message(&mut self, message_id: &str) -> bool {
        let before = self.state.messages.len();
        let messages: Vec<ChatMessage> = self
            .state
            .messages
            .iter()
            .filter(|m| m.id != message_id)
            .cloned()
            .collect();
        if messages.len() == before {
            return false;
        }

        self.patches.remove(message_id);
        let next = self.persistence.set_conversation_messages(
            &self.state,
            &self.provider,
            &self.conversation_id,
            messages,
        );
        self.state = next;
        true
    }

    /// Commit a standalone system message
    pub fn report_system_message(&mut self, text: impl Into<String>) {
        self.commit(vec![ChatMessage::system(text)]);
    }

    /// Interrupt the active job and drop everything queued
    pub fn teardown(&mut self, now: Instant) {
        let dropped = self.queue.len();
        self.queue.clear();
        self.interrupt(now);
        self.tools.reset();
        self.retire_finalized();
        debug!(conversation_id = %self.conversation_id, dropped, "Session torn down");
    }

    fn commit(&mut self, appended: Vec<ChatMessage>) {
        let mut messages = self.state.messages.clone();
        messages.extend(appended);
        let messages: Vec<ChatMessage> = normalize_messages(messages)
            .into_iter()
            .map(|message| self.refresh_patch(message))
            .collect();

        let next = self.persistence.set_conversation_messages(
            &self.state,
            &self.provider,
            &self.conversation_id,
            messages,
        );
        debug!(
            conversation_id = %self.conversation_id,
            revision = next.revision,
            "Committed conversation"
        );
        self.state = next;
    }

    fn refresh_patch(&self, mut message: ChatMessage) -> ChatMessage {
        if message.patch.is_some()
            && let Some(review) = self.patches.review(&message.id)
        {
            message.patch = Some(review);
        }
        message
    }

    /// History as presentation should see it right now
    fn visible_messages(&self) -> Vec<ChatMessage> {
        let mut messages: Vec<ChatMessage> = self
            .state
            .messages
            .iter()
            .cloned()
            .map(|m| self.refresh_patch(m))
            .collect();
        if let Some(active) = &self.active {
            messages.push(active.user_message.clone());
        }
        messages
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            conversation_id: self.conversation_id.clone(),
            provider: self.provider.clone(),
            phase: self.phase,
            status_line: self.clock.status_line().map(str::to_string),
            streaming_text: self.pacer.revealed().to_string(),
            thinking: self.thinking.clone(),
            chain: self.tools.chain().to_vec(),
            tool_executions: self.tools.executions(),
            usage: self.usage,
            queued: self.queue.len(),
            active_tool_request: self.tools.active_request().cloned(),
            pending_tool_requests: self.tools.pending_requests(),
            messages: self.visible_messages(),
            revision: self.state.revision,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::session::types::{
        PatchAnchor, PatchKind, PatchReview, Role, ToolRequestKind, ToolTrace,
    };

    fn controller() -> SessionJobController {
        SessionJobController::new(
            "conv-1",
            "default",
            Arc::new(Config::default()),
            Arc::new(InMemoryPersistence::new()),
        )
    }

    fn started(submission: Submission) -> JobStart {
        match submission {
            Submission::Started(start) => start,
            other => panic!("Expected Started, got {:?}", other),
        }
    }

    fn drain(ctrl: &mut SessionJobController, now: Instant) -> Option<JobStart> {
        let mut next = None;
        while ctrl.wants_pacer() {
            next = ctrl.pacer_tick(now);
        }
        next
    }

    fn file_patch(text: &str) -> JobEvent {
        JobEvent::Patch {
            kind: PatchKind::ReplaceRangeInFile,
            anchor: PatchAnchor::FileRange {
                path: "src/lib.rs".to_string(),
                start_line: 1,
                end_line: 2,
                expected_text: None,
            },
            text: text.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_world() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Say hi"), now).unwrap());
        assert_eq!(ctrl.phase(), Phase::Sending);

        for text in ["Hello", " ", "world"] {
            ctrl.handle_event(job.ticket, JobEvent::delta(text), now);
        }
        assert_eq!(ctrl.phase(), Phase::Streaming);
        assert!(ctrl.handle_event(job.ticket, JobEvent::done("ok"), now).is_none());

        // Not finalized until drained
        assert_eq!(ctrl.state().revision, 0);
        drain(&mut ctrl, now + Duration::from_secs(2));

        let messages = &ctrl.state().messages;
        assert_eq!(ctrl.state().revision, 1);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].content, "Hello world");
        assert_eq!(messages[1].status_line.as_deref(), Some("Thought for 2s"));
        assert_eq!(ctrl.phase(), Phase::Idle);
        assert!(!ctrl.wants_pacer());
        assert!(!ctrl.clock_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_done_commits_once() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Q"), now).unwrap());

        ctrl.handle_event(job.ticket, JobEvent::delta("A"), now);
        ctrl.handle_event(job.ticket, JobEvent::done("ok"), now);
        ctrl.handle_event(job.ticket, JobEvent::done("error"), now);
        drain(&mut ctrl, now);
        ctrl.handle_event(job.ticket, JobEvent::done("ok"), now);
        ctrl.stream_ended(job.ticket, now);

        assert_eq!(ctrl.state().revision, 1);
        assert_eq!(ctrl.state().messages.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_message_starts_after_finalize() {
        let now = Instant::now();
        let mut ctrl = controller();
        let a = started(ctrl.submit(QueuedMessage::new("A"), now).unwrap());

        match ctrl.submit(QueuedMessage::new("B"), now).unwrap() {
            Submission::Queued { position } => assert_eq!(position, 1),
            other => panic!("Expected Queued, got {:?}", other),
        }
        assert_eq!(ctrl.snapshot().queued, 1);

        let b = ctrl.handle_event(a.ticket, JobEvent::done("ok"), now).unwrap();
        assert_eq!(b.payload.text, "B");
        assert_ne!(a.ticket, b.ticket);
        assert_eq!(ctrl.phase(), Phase::Sending);
        assert_eq!(ctrl.queued(), 0);
        assert_eq!(b.payload.history.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_flushes_and_marks() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Q"), now).unwrap());

        ctrl.handle_event(job.ticket, JobEvent::delta("Hel"), now);
        ctrl.pacer_tick(now);
        ctrl.handle_event(job.ticket, JobEvent::delta("lo world"), now);
        ctrl.handle_event(job.ticket, file_patch("staged"), now);
        assert_eq!(ctrl.snapshot().streaming_text, "Hel");

        assert!(ctrl.interrupt(now).is_none());
        assert!(job.cancel.is_cancelled());

        let messages = &ctrl.state().messages;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Hello world\n\n_[Interrupted by user]_");
        assert!(messages.iter().all(|m| m.patch.is_none()));
        assert_eq!(ctrl.state().revision, 1);
        assert!(!ctrl.wants_pacer());
        assert!(!ctrl.clock_running());
        assert!(ctrl.snapshot().status_line.is_none());

        // Events from the aborted job are stale, patches included
        ctrl.handle_event(job.ticket, file_patch("late"), now);
        ctrl.transport_failed(job.ticket, "aborted", now);
        assert_eq!(ctrl.state().revision, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_on_idle_is_noop() {
        let now = Instant::now();
        let mut ctrl = controller();
        assert!(ctrl.interrupt(now).is_none());
        assert_eq!(ctrl.state().revision, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_card_follows_reply() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Fix it"), now).unwrap());

        ctrl.handle_event(job.ticket, JobEvent::delta("Here"), now);
        ctrl.handle_event(job.ticket, file_patch("fn fixed() {}"), now);
        ctrl.handle_event(job.ticket, JobEvent::delta(" you go"), now);
        ctrl.handle_event(job.ticket, JobEvent::done("success"), now);
        drain(&mut ctrl, now);

        let messages = &ctrl.state().messages;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[1].content, "Here you go");
        let review = messages[2].patch.as_ref().unwrap();
        assert_eq!(review.status, PatchStatus::Pending);
        assert_eq!(review.text, "fn fixed() {}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_patch_is_committed_immediately() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Q"), now).unwrap());
        ctrl.handle_event(job.ticket, JobEvent::done("ok"), now);
        assert_eq!(ctrl.state().revision, 1);

        ctrl.handle_event(job.ticket, file_patch("late"), now);
        assert_eq!(ctrl.state().revision, 2);
        assert!(ctrl.state().messages.last().unwrap().patch.is_some());

        // Anything else from that job is stale
        ctrl.handle_event(job.ticket, JobEvent::delta("more"), now);
        assert_eq!(ctrl.state().revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_feedback_refines_in_place() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Fix"), now).unwrap());
        ctrl.handle_event(job.ticket, file_patch("v1"), now);
        ctrl.handle_event(job.ticket, JobEvent::done("ok"), now);
        let card_id = ctrl.state().messages.last().unwrap().id.clone();
        let count = ctrl.state().messages.len();

        let refine = started(ctrl.patch_feedback(&card_id, "shorter", now).unwrap());
        let feedback = refine.payload.feedback.as_ref().unwrap();
        assert_eq!(feedback.message_id, card_id);
        assert_eq!(feedback.current_text, "v1");

        ctrl.handle_event(refine.ticket, file_patch("v2"), now);
        ctrl.handle_event(refine.ticket, JobEvent::done("ok"), now);

        let messages = &ctrl.state().messages;
        // Only the feedback user message was added
        assert_eq!(messages.len(), count + 1);
        let card = messages.iter().find(|m| m.id == card_id).unwrap();
        let review = card.patch.as_ref().unwrap();
        assert_eq!(review.text, "v2");
        assert_eq!(review.revision, 1);
        assert_eq!(review.status, PatchStatus::Pending);

        // A second patch in an unrelated turn is a new proposal
        let next = started(ctrl.submit(QueuedMessage::new("Another"), now).unwrap());
        ctrl.handle_event(next.ticket, file_patch("other"), now);
        ctrl.handle_event(next.ticket, JobEvent::done("ok"), now);
        let pending = ctrl
            .state()
            .messages
            .iter()
            .filter(|m| m.patch.is_some())
            .count();
        assert_eq!(pending, 2);
    }

    fn patch_cards(ctrl: &SessionJobController) -> Vec<PatchReview> {
        ctrl.state()
            .messages
            .iter()
            .filter_map(|m| m.patch.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_patch_during_queued_job_is_new_card() {
        let now = Instant::now();
        let mut ctrl = controller();
        let a = started(ctrl.submit(QueuedMessage::new("A"), now).unwrap());
        ctrl.submit(QueuedMessage::new("B"), now).unwrap();

        let b = ctrl.handle_event(a.ticket, JobEvent::done("ok"), now).unwrap();
        let revision = ctrl.state().revision;
        ctrl.handle_event(a.ticket, file_patch("from A"), now);
        assert_eq!(ctrl.state().revision, revision + 1);

        ctrl.handle_event(b.ticket, file_patch("from B"), now);
        ctrl.handle_event(b.ticket, JobEvent::done("ok"), now);
        let texts: Vec<String> = patch_cards(&ctrl).into_iter().map(|r| r.text).collect();
        assert_eq!(texts, vec!["from A", "from B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_patch_leaves_next_feedback_target() {
        let now = Instant::now();
        let mut ctrl = controller();
        let first = started(ctrl.submit(QueuedMessage::new("Fix"), now).unwrap());
        ctrl.handle_event(first.ticket, file_patch("v1"), now);
        ctrl.handle_event(first.ticket, JobEvent::done("ok"), now);
        let card_id = ctrl.state().messages.last().unwrap().id.clone();

        let a = started(ctrl.submit(QueuedMessage::new("Explain"), now).unwrap());
        assert!(matches!(
            ctrl.patch_feedback(&card_id, "shorter", now).unwrap(),
            Submission::Queued { position: 1 }
        ));
        let refine = ctrl.handle_event(a.ticket, JobEvent::done("ok"), now).unwrap();
        assert_eq!(refine.payload.feedback.as_ref().unwrap().message_id, card_id);

        // Belongs to the finished job, not to the refinement now running
        ctrl.handle_event(a.ticket, file_patch("A-late"), now);
        let card = ctrl.patches.get(&card_id).unwrap();
        assert_eq!(card.text, "v1");
        assert_eq!(card.revision, 0);

        ctrl.handle_event(refine.ticket, file_patch("v2"), now);
        ctrl.handle_event(refine.ticket, JobEvent::done("ok"), now);

        let cards = patch_cards(&ctrl);
        assert_eq!(cards.len(), 2);
        let card = ctrl.patches.get(&card_id).unwrap();
        assert_eq!(card.text, "v2");
        assert_eq!(card.revision, 1);
        assert!(cards.iter().any(|r| r.text == "A-late" && r.revision == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_patch_refines_own_target() {
        let now = Instant::now();
        let mut ctrl = controller();
        let first = started(ctrl.submit(QueuedMessage::new("Fix"), now).unwrap());
        ctrl.handle_event(first.ticket, file_patch("v1"), now);
        ctrl.handle_event(first.ticket, JobEvent::done("ok"), now);
        let card_id = ctrl.state().messages.last().unwrap().id.clone();

        let refine = started(ctrl.patch_feedback(&card_id, "shorter", now).unwrap());
        ctrl.handle_event(refine.ticket, JobEvent::done("ok"), now);
        ctrl.handle_event(refine.ticket, file_patch("v2"), now);
        ctrl.handle_event(refine.ticket, file_patch("v3"), now);

        // The first late patch resolves the target, the second is its own card
        let cards = patch_cards(&ctrl);
        assert_eq!(cards.len(), 2);
        let card = ctrl.patches.get(&card_id).unwrap();
        assert_eq!(card.text, "v2");
        assert_eq!(card.revision, 1);
        assert_eq!(cards[1].text, "v3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_stream_is_closed_later() {
        let now = Instant::now();
        let mut ctrl = controller();
        let a = started(ctrl.submit(QueuedMessage::new("A"), now).unwrap());
        ctrl.handle_event(a.ticket, JobEvent::done("ok"), now);
        assert!(!a.cancel.is_cancelled());

        let b = started(ctrl.submit(QueuedMessage::new("B"), now).unwrap());
        ctrl.handle_event(b.ticket, JobEvent::done("ok"), now);
        assert!(a.cancel.is_cancelled());
        assert!(!b.cancel.is_cancelled());

        ctrl.teardown(now);
        assert!(b.cancel.is_cancelled());
        let revision = ctrl.state().revision;
        ctrl.handle_event(b.ticket, file_patch("too late"), now);
        assert_eq!(ctrl.state().revision, revision);
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_reject_only_from_pending() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Fix"), now).unwrap());
        ctrl.handle_event(job.ticket, file_patch("v1"), now);
        ctrl.handle_event(job.ticket, JobEvent::done("ok"), now);
        let card_id = ctrl.state().messages.last().unwrap().id.clone();

        assert!(ctrl.apply_result(&card_id, EditOutcome::failed("range moved")));
        let review = ctrl.state().messages.last().unwrap().patch.clone().unwrap();
        assert_eq!(review.status, PatchStatus::Pending);
        assert_eq!(review.error.as_deref(), Some("range moved"));

        assert!(ctrl.begin_apply(&card_id).is_some());
        assert!(ctrl.apply_result(&card_id, EditOutcome::ok()));
        let revision = ctrl.state().revision;

        assert!(!ctrl.reject(&card_id));
        assert!(!ctrl.apply_result(&card_id, EditOutcome::ok()));
        assert!(ctrl.begin_apply(&card_id).is_none());
        assert!(matches!(
            ctrl.patch_feedback(&card_id, "again", now).unwrap(),
            Submission::Ignored
        ));
        assert_eq!(ctrl.state().revision, revision);
        let review = ctrl.state().messages.last().unwrap().patch.clone().unwrap();
        assert_eq!(review.status, PatchStatus::Accepted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_status_synthesizes_message() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Q"), now).unwrap());
        ctrl.handle_event(job.ticket, JobEvent::done("cancelled"), now);

        let last = ctrl.state().messages.last().unwrap();
        assert_eq!(last.role, Role::System);
        assert_eq!(last.content, "Job ended with status \"cancelled\"");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_then_next_job() {
        let now = Instant::now();
        let mut ctrl = controller();
        let a = started(ctrl.submit(QueuedMessage::new("A"), now).unwrap());
        ctrl.submit(QueuedMessage::new("B"), now).unwrap();

        let b = ctrl
            .transport_failed(a.ticket, "connection reset", now)
            .unwrap();
        assert_eq!(b.payload.text, "B");

        let systems: Vec<_> = ctrl
            .state()
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .collect();
        assert_eq!(systems.len(), 1);
        assert_eq!(systems[0].content, "Request failed: connection reset");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_end_without_done() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Q"), now).unwrap());
        ctrl.handle_event(job.ticket, JobEvent::delta("partial"), now);
        assert!(ctrl.stream_ended(job.ticket, now).is_none());
        drain(&mut ctrl, now);

        let messages = &ctrl.state().messages;
        assert_eq!(messages[1].content, "partial");
        assert_eq!(messages[2].content, STREAM_ENDED_EARLY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rewrite_progress_is_status_only() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(
            ctrl.submit(
                QueuedMessage::new("Tighten this").with_action(JobAction::RewriteSelection),
                now,
            )
            .unwrap(),
        );

        ctrl.handle_event(job.ticket, JobEvent::delta("Reading selection\nRewr"), now);
        ctrl.handle_event(job.ticket, JobEvent::delta("iting\n"), now);
        assert!(!ctrl.wants_pacer());
        let status = ctrl.snapshot().status_line.unwrap();
        assert!(status.starts_with("Rewriting · "), "{}", status);

        ctrl.handle_event(job.ticket, JobEvent::done("ok"), now);
        assert!(ctrl.state().messages.iter().all(|m| m.role == Role::User));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tool_activity_and_usage() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Q"), now).unwrap());
        ctrl.job_created(job.ticket, "remote-1".to_string());

        ctrl.handle_event(
            job.ticket,
            JobEvent::Trace {
                label: None,
                tool: Some(ToolTrace {
                    id: "t1".to_string(),
                    name: "grep".to_string(),
                    stage: ToolStage::Start,
                    ok: None,
                }),
            },
            now,
        );
        let request = JobEvent::ToolCall {
            request_id: "r1".to_string(),
            kind: ToolRequestKind::Approval,
            prompt: "Allow?".to_string(),
            payload: serde_json::Value::Null,
        };
        ctrl.handle_event(job.ticket, request.clone(), now);
        ctrl.handle_event(job.ticket, request, now);
        ctrl.handle_event(job.ticket, JobEvent::Usage { used: 50, window: 200 }, now);

        let snapshot = ctrl.snapshot();
        assert!(snapshot.status_line.unwrap().starts_with("Running grep"));
        assert_eq!(snapshot.pending_tool_requests, 1);
        assert_eq!(snapshot.usage.unwrap().percentage, 25.0);
        assert_eq!(snapshot.tool_executions.len(), 1);

        let (job_id, answered) = ctrl.respond_to_tool("r1").unwrap();
        assert_eq!(job_id, "remote-1");
        assert_eq!(answered.prompt, "Allow?");
        assert!(ctrl.respond_to_tool("r1").is_none());

        let deadline = ctrl.next_tool_deadline().unwrap();
        assert!(ctrl.expire_tools(deadline));
        assert_eq!(
            ctrl.snapshot().tool_executions[0].state,
            crate::session::tools::ExecutionState::Failed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_message_drops_proposal() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("Fix"), now).unwrap());
        ctrl.handle_event(job.ticket, file_patch("v1"), now);
        ctrl.handle_event(job.ticket, JobEvent::done("ok"), now);
        let card_id = ctrl.state().messages.last().unwrap().id.clone();

        assert!(ctrl.remove_message(&card_id));
        assert!(!ctrl.remove_message(&card_id));
        assert!(ctrl.begin_apply(&card_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_drops_queue() {
        let now = Instant::now();
        let mut ctrl = controller();
        let job = started(ctrl.submit(QueuedMessage::new("A"), now).unwrap());
        ctrl.submit(QueuedMessage::new("B"), now).unwrap();
        ctrl.handle_event(job.ticket, JobEvent::delta("partial"), now);

        ctrl.teardown(now);
        assert_eq!(ctrl.phase(), Phase::Idle);
        assert_eq!(ctrl.queued(), 0);
        assert!(ctrl.active_ticket().is_none());
        assert_eq!(ctrl.state().revision, 1);
        assert!(ctrl.state().messages[1].content.starts_with("partial\n\n"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_submission_is_ignored() {
        let now = Instant::now();
        let mut ctrl = controller();
        assert!(matches!(
            ctrl.submit(QueuedMessage::new("   "), now).unwrap(),
            Submission::Ignored
        ));
        assert_eq!(ctrl.phase(), Phase::Idle);
    }
}
