//! Async driver for one session
//!
//! The actor owns a [`SessionJobController`] and is the only task that
//! mutates it. It multiplexes handle commands, job task signals, the pacer
//! drain timer, the status clock timer and the tool expiry deadline in a
//! single `select!` loop, then publishes a fresh snapshot.

use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, sleep_until, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::{JobStart, SessionJobController, Submission};
use super::types::{JobAction, JobTicket, MessageId, QueuedMessage, SessionSnapshot};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::transport::{
    EditOutcome, EditorBridge, JobEventSink, JobPayload, JobSignal, JobTransport, ToolResponse,
    apply_patch,
};

/// Result of a submission as seen by a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A job started right away
    Started(JobTicket),
    /// The message waits behind the active job (1-based)
    Queued { position: usize },
    /// Nothing was sent
    Ignored,
}

/// Commands accepted by a session actor
#[derive(Debug)]
pub(crate) enum SessionCommand {
    Submit {
        message: QueuedMessage,
        reply: oneshot::Sender<Result<SubmitOutcome>>,
    },
    Interrupt,
    AcceptPatch {
        message_id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    RejectPatch {
        message_id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    PatchFeedback {
        message_id: MessageId,
        text: String,
        reply: oneshot::Sender<Result<SubmitOutcome>>,
    },
    RespondToTool {
        request_id: String,
        result: serde_json::Value,
    },
    RemoveMessage {
        message_id: MessageId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// Collaborators shared by every session of a registry
#[derive(Clone)]
pub(crate) struct ActorServices {
    pub transport: Arc<dyn JobTransport>,
    pub editor: Arc<dyn EditorBridge>,
}

pub(crate) struct SessionActor {
    controller: SessionJobController,
    services: ActorServices,
    config: Arc<Config>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    signals_tx: mpsc::UnboundedSender<(JobTicket, JobSignal)>,
    signals_rx: mpsc::UnboundedReceiver<(JobTicket, JobSignal)>,
    snapshot: watch::Sender<SessionSnapshot>,
    pacer_timer: Option<Interval>,
    clock_timer: Option<Interval>,
}

/// Channels a handle uses to reach a spawned actor
pub(crate) struct SpawnedSession {
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub snapshots: watch::Receiver<SessionSnapshot>,
    pub task: JoinHandle<()>,
}

impl SessionActor {
    /// Spawn the actor task for a controller
    pub fn spawn(
        controller: SessionJobController,
        services: ActorServices,
        config: Arc<Config>,
    ) -> SpawnedSession {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshots) = watch::channel(controller.snapshot());

        let actor = Self {
            controller,
            services,
            config,
            commands,
            signals_tx,
            signals_rx,
            snapshot,
            pacer_timer: None,
            clock_timer: None,
        };
        let task = tokio::spawn(actor.run());

        SpawnedSession {
            commands: commands_tx,
            snapshots,
            task,
        }
    }

    async fn run(mut self) {
        let conversation_id = self.controller.conversation_id().to_string();
        debug!(%conversation_id, "Session actor starting");

        loop {
            self.sync_timers();
            let tool_deadline = self.controller.next_tool_deadline();

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some((ticket, signal)) = self.signals_rx.recv() => {
                    self.handle_signal(ticket, signal);
                }
                _ = next_tick(&mut self.pacer_timer) => {
                    let next = self.controller.pacer_tick(Instant::now());
                    self.launch(next);
                }
                _ = next_tick(&mut self.clock_timer) => {
                    self.controller.clock_tick(Instant::now());
                }
                _ = sleep_until_deadline(tool_deadline) => {
                    self.controller.expire_tools(Instant::now());
                }
            }

            self.publish();
        }

        debug!(%conversation_id, "Session actor stopped");
    }

    /// Arm the timers the controller needs and drop the rest
    fn sync_timers(&mut self) {
        if self.controller.wants_pacer() {
            if self.pacer_timer.is_none() {
                self.pacer_timer = Some(periodic(self.config.pacing.tick()));
            }
        } else {
            self.pacer_timer = None;
        }

        if self.controller.clock_running() {
            if self.clock_timer.is_none() {
                self.clock_timer = Some(periodic(self.config.status.tick()));
            }
        } else {
            self.clock_timer = None;
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.controller.snapshot());
    }

    fn shutdown(&mut self) {
        self.controller.teardown(Instant::now());
        self.pacer_timer = None;
        self.clock_timer = None;
        self.publish();
        info!(conversation_id = %self.controller.conversation_id(), "Session shut down");
    }

    /// Replies are sent after publishing so callers observe the new state
    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Submit { message, reply } => {
                let outcome = match self.prepare(message).await {
                    Some(message) => {
                        let result = self.controller.submit(message, Instant::now());
                        self.settle(result)
                    }
                    None => Ok(SubmitOutcome::Ignored),
                };
                self.publish();
                let _ = reply.send(outcome);
            }
            SessionCommand::Interrupt => {
                let next = self.controller.interrupt(Instant::now());
                self.launch(next);
            }
            SessionCommand::AcceptPatch { message_id, reply } => {
                let accepted = self.accept_patch(&message_id).await;
                self.publish();
                let _ = reply.send(accepted);
            }
            SessionCommand::RejectPatch { message_id, reply } => {
                let rejected = self.controller.reject(&message_id);
                self.publish();
                let _ = reply.send(rejected);
            }
            SessionCommand::PatchFeedback {
                message_id,
                text,
                reply,
            } => {
                let result = self
                    .controller
                    .patch_feedback(&message_id, text, Instant::now());
                let outcome = self.settle(result);
                self.publish();
                let _ = reply.send(outcome);
            }
            SessionCommand::RespondToTool { request_id, result } => {
                self.respond_to_tool(request_id, result);
            }
            SessionCommand::RemoveMessage { message_id, reply } => {
                let removed = self.controller.remove_message(&message_id);
                self.publish();
                let _ = reply.send(removed);
            }
            SessionCommand::Shutdown { done } => {
                // Handled by the loop; reaching here means a duplicate
                let _ = done.send(());
            }
        }
    }

    /// Capture the selection a rewrite message needs
    ///
    /// Returns `None` when the editor could not provide one; the failure is
    /// recorded as a system message and no job starts.
    async fn prepare(&mut self, message: QueuedMessage) -> Option<QueuedMessage> {
        if message.action != JobAction::RewriteSelection || message.selection.is_some() {
            return Some(message);
        }

        let limit = self.config.editor.timeout();
        let failure = match timeout(limit, self.services.editor.request_selection()).await {
            Ok(outcome) => match outcome.selection {
                Some(selection) => return Some(message.with_selection(selection)),
                None => outcome
                    .error
                    .unwrap_or_else(|| "No text is selected".to_string()),
            },
            Err(_) => editor_timeout(limit).to_string(),
        };

        warn!(
            conversation_id = %self.controller.conversation_id(),
            %failure,
            "Could not capture selection"
        );
        self.controller
            .report_system_message(format!("Could not read the selection: {}", failure));
        None
    }

    fn settle(&mut self, result: Result<Submission>) -> Result<SubmitOutcome> {
        match result? {
            Submission::Started(start) => {
                let ticket = start.ticket;
                self.launch(Some(start));
                Ok(SubmitOutcome::Started(ticket))
            }
            Submission::Queued { position } => Ok(SubmitOutcome::Queued { position }),
            Submission::Ignored => Ok(SubmitOutcome::Ignored),
        }
    }

    async fn accept_patch(&mut self, message_id: &str) -> bool {
        let Some(request) = self.controller.begin_apply(message_id) else {
            debug!(message_id, "Accept ignored for non-pending patch");
            return false;
        };

        let limit = self.config.editor.timeout();
        let outcome = match timeout(limit, apply_patch(self.services.editor.as_ref(), &request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => EditOutcome::failed(editor_timeout(limit).to_string()),
        };

        let ok = outcome.ok;
        self.controller.apply_result(message_id, outcome) && ok
    }

    fn respond_to_tool(&mut self, request_id: String, result: serde_json::Value) {
        let Some((job_id, _request)) = self.controller.respond_to_tool(&request_id) else {
            debug!(%request_id, "No pending tool request to answer");
            return;
        };

        let transport = self.services.transport.clone();
        tokio::spawn(async move {
            let response = ToolResponse { request_id, result };
            if let Err(e) = transport.respond_to_job_request(&job_id, response).await {
                warn!(%job_id, "Failed to deliver tool response: {}", e);
            }
        });
    }

    fn handle_signal(&mut self, ticket: JobTicket, signal: JobSignal) {
        let now = Instant::now();
        let next = match signal {
            JobSignal::Created(job_id) => {
                self.controller.job_created(ticket, job_id);
                None
            }
            JobSignal::CreateFailed(error) => self.controller.transport_failed(ticket, &error, now),
            JobSignal::Event(event) => self.controller.handle_event(ticket, event, now),
            JobSignal::Ended(Ok(())) => self.controller.stream_ended(ticket, now),
            JobSignal::Ended(Err(e)) => {
                self.controller
                    .transport_failed(ticket, &e.to_string(), now)
            }
        };
        self.launch(next);
    }

    /// Spawn the job task for a started job
    fn launch(&self, start: Option<JobStart>) {
        let Some(JobStart {
            ticket,
            payload,
            cancel,
        }) = start
        else {
            return;
        };

        let sink = JobEventSink::new(ticket, self.signals_tx.clone());
        let transport = self.services.transport.clone();
        tokio::spawn(run_job(transport, payload, sink, cancel));
    }
}

fn editor_timeout(limit: Duration) -> Error {
    Error::EditorTimeout(u64::try_from(limit.as_millis()).unwrap_or(u64::MAX))
}

/// Create the job, then stream its events until the stream ends or is cancelled
async fn run_job(
    transport: Arc<dyn JobTransport>,
    payload: JobPayload,
    sink: JobEventSink,
    cancel: CancellationToken,
) {
    let ticket = sink.ticket();
    let created = tokio::select! {
        _ = cancel.cancelled() => return,
        result = transport.create_job(payload) => result,
    };

    let job_id = match created {
        Ok(job_id) => job_id,
        Err(e) => {
            sink.send(JobSignal::CreateFailed(e.to_string()));
            return;
        }
    };
    if !sink.send(JobSignal::Created(job_id.clone())) {
        return;
    }

    let result = tokio::select! {
        _ = cancel.cancelled() => {
            debug!(%ticket, %job_id, "Job stream cancelled");
            return;
        }
        result = transport.stream_job_events(&job_id, sink.clone(), cancel.clone()) => result,
    };
    sink.send(JobSignal::Ended(result));
}

fn periodic(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}
