//! Drive a live session through a scenario's user steps

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use tracing::info;

use margin_core::session::{JobAction, PatchStatus};
use margin_core::{
    Config, ConversationState, Persistence, QueuedMessage, SessionHandle, SessionRegistry,
    SessionServices, SessionSnapshot,
};

use crate::editor::DocumentEditor;
use crate::script::{Scenario, ScriptedTransport, Step};

/// Upper bound for a `wait_idle` step
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Final state of a replayed conversation
#[derive(Debug)]
pub struct ReplayReport {
    pub snapshot: SessionSnapshot,
    pub document: String,
    pub jobs_created: usize,
    /// Scripted replies no job consumed
    pub unused_jobs: usize,
    pub tool_responses: usize,
}

pub async fn run_scenario(
    scenario: Scenario,
    config: Config,
    persistence: Arc<dyn Persistence>,
    history: Option<ConversationState>,
) -> anyhow::Result<ReplayReport> {
    let transport = Arc::new(ScriptedTransport::new(scenario.jobs.clone()));
    let editor = Arc::new(DocumentEditor::new(&scenario.document));
    let services = SessionServices::new(transport.clone())
        .with_editor(editor.clone())
        .with_persistence(persistence);
    let registry = SessionRegistry::new(services, config);

    let handle = match history {
        Some(state) => registry.restore(&scenario.conversation_id, &scenario.provider, state),
        None => registry.open(&scenario.conversation_id, &scenario.provider),
    };

    info!(
        conversation_id = %scenario.conversation_id,
        steps = scenario.steps.len(),
        "Replaying scenario"
    );
    for (index, step) in scenario.steps.iter().enumerate() {
        run_step(&handle, step)
            .await
            .with_context(|| format!("Step {} ({:?}) failed", index + 1, step))?;
    }

    let snapshot = wait_idle(&handle).await?;
    registry.destroy(&scenario.conversation_id).await;

    Ok(ReplayReport {
        snapshot,
        document: editor.text(),
        jobs_created: transport.payloads().len(),
        unused_jobs: transport.remaining_jobs(),
        tool_responses: transport.responses().len(),
    })
}

async fn run_step(handle: &SessionHandle, step: &Step) -> anyhow::Result<()> {
    match step {
        Step::Submit {
            text,
            rewrite_selection,
        } => {
            let mut message = QueuedMessage::new(text.clone());
            if *rewrite_selection {
                message = message.with_action(JobAction::RewriteSelection);
            }
            let outcome = handle.submit_message(message).await?;
            info!(?outcome, "Submitted");
        }
        Step::Wait { ms } => tokio::time::sleep(Duration::from_millis(*ms)).await,
        Step::WaitIdle => {
            wait_idle(handle).await?;
        }
        Step::Interrupt => handle.interrupt()?,
        Step::AcceptLatest => {
            let id = latest_pending_patch(handle)?;
            if !handle.accept_patch(id).await? {
                bail!("Patch was not accepted");
            }
        }
        Step::RejectLatest => {
            let id = latest_pending_patch(handle)?;
            handle.reject_patch(id).await?;
        }
        Step::FeedbackLatest { text } => {
            let id = latest_pending_patch(handle)?;
            handle.patch_feedback(id, text.clone()).await?;
        }
        Step::RespondToTool { request_id, result } => {
            handle.respond_to_tool(request_id.clone(), result.clone())?;
        }
    }
    Ok(())
}

async fn wait_idle(handle: &SessionHandle) -> anyhow::Result<SessionSnapshot> {
    tokio::time::timeout(IDLE_TIMEOUT, handle.wait_for_idle())
        .await
        .context("Session did not settle")?
        .map_err(Into::into)
}

fn latest_pending_patch(handle: &SessionHandle) -> anyhow::Result<String> {
    let snapshot = handle.snapshot();
    let message = snapshot
        .latest_patch()
        .context("No patch proposal to review")?;
    match &message.patch {
        Some(review) if review.status == PatchStatus::Pending => Ok(message.id.clone()),
        _ => bail!("Latest patch proposal was already reviewed"),
    }
}
