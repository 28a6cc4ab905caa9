//! Replay scenarios and the scripted backend that plays them

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use margin_core::{Error, JobEvent, JobEventSink, JobPayload, JobTransport, Result, ToolResponse};

/// A recorded conversation to replay against a live session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub conversation_id: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub document: DocumentSeed,
    /// Backend replies, consumed one per created job
    #[serde(default)]
    pub jobs: Vec<ScriptedJob>,
    pub steps: Vec<Step>,
}

fn default_provider() -> String {
    "scripted".to_string()
}

impl Scenario {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Initial document the editor starts from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentSeed {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Selected character range, if any
    #[serde(default)]
    pub selection: Option<(usize, usize)>,
}

/// One backend job's event stream
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScriptedJob {
    #[serde(default)]
    pub events: Vec<TimedEvent>,
    /// Keep the stream open after the last event until cancelled
    #[serde(default)]
    pub hold_open: bool,
    /// Fail job creation with this message
    #[serde(default)]
    pub fail_create: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedEvent {
    /// Delay after the previous event
    #[serde(default)]
    pub after_ms: u64,
    pub event: JobEvent,
}

/// User action in a scenario
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    Submit {
        text: String,
        #[serde(default)]
        rewrite_selection: bool,
    },
    Wait {
        ms: u64,
    },
    WaitIdle,
    Interrupt,
    AcceptLatest,
    RejectLatest,
    FeedbackLatest {
        text: String,
    },
    RespondToTool {
        request_id: String,
        #[serde(default)]
        result: serde_json::Value,
    },
}

/// Backend that answers jobs from a scenario's script
pub struct ScriptedTransport {
    jobs: Mutex<VecDeque<ScriptedJob>>,
    streams: Mutex<Vec<(String, ScriptedJob)>>,
    payloads: Mutex<Vec<JobPayload>>,
    responses: Mutex<Vec<(String, ToolResponse)>>,
    next_id: AtomicU64,
}

impl ScriptedTransport {
    pub fn new(jobs: Vec<ScriptedJob>) -> Self {
        Self {
            jobs: Mutex::new(jobs.into()),
            streams: Mutex::new(Vec::new()),
            payloads: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Payloads of every job created so far
    pub fn payloads(&self) -> Vec<JobPayload> {
        self.payloads.lock().clone()
    }

    pub fn responses(&self) -> Vec<(String, ToolResponse)> {
        self.responses.lock().clone()
    }

    pub fn remaining_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    fn take_stream(&self, job_id: &str) -> Option<ScriptedJob> {
        let mut streams = self.streams.lock();
        let index = streams.iter().position(|(id, _)| id == job_id)?;
        Some(streams.remove(index).1)
    }
}

#[async_trait]
impl JobTransport for ScriptedTransport {
    async fn create_job(&self, payload: JobPayload) -> Result<String> {
        let job = self
            .jobs
            .lock()
            .pop_front()
            .ok_or_else(|| Error::transport("No scripted reply left for this job"))?;
        if let Some(message) = job.fail_create {
            return Err(Error::Transport(message));
        }

        let job_id = format!("job-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(job_id = %job_id, action = ?payload.action, "Scripted job created");
        self.payloads.lock().push(payload);
        self.streams.lock().push((job_id.clone(), job));
        Ok(job_id)
    }

    async fn stream_job_events(
        &self,
        job_id: &str,
        sink: JobEventSink,
        cancel: CancellationToken,
    ) -> Result<()> {
        let job = self
            .take_stream(job_id)
            .ok_or_else(|| Error::Transport(format!("Unknown job {}", job_id)))?;

        for timed in job.events {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_millis(timed.after_ms)) => {}
            }
            debug!(job_id, event = timed.event.name(), "Replaying event");
            if !sink.emit(timed.event) {
                return Ok(());
            }
        }

        if job.hold_open {
            cancel.cancelled().await;
        }
        Ok(())
    }

    async fn respond_to_job_request(&self, job_id: &str, response: ToolResponse) -> Result<()> {
        info!(job_id, request_id = %response.request_id, "Tool response received");
        self.responses.lock().push((job_id.to_string(), response));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scenario() {
        let json = r#"{
            "conversation_id": "demo",
            "document": { "text": "hello world", "selection": [6, 11] },
            "jobs": [
                { "events": [
                    { "after_ms": 10, "event": { "type": "delta", "text": "Hi" } },
                    { "event": { "type": "done", "status": "complete" } }
                ] }
            ],
            "steps": [
                { "step": "submit", "text": "hello" },
                { "step": "wait_idle" },
                { "step": "feedback_latest", "text": "shorter" }
            ]
        }"#;

        let scenario: Scenario = serde_json::from_str(json).unwrap();
        assert_eq!(scenario.provider, "scripted");
        assert_eq!(scenario.jobs[0].events.len(), 2);
        assert_eq!(scenario.jobs[0].events[1].after_ms, 0);
        assert!(matches!(scenario.steps[1], Step::WaitIdle));
        assert!(matches!(
            &scenario.steps[0],
            Step::Submit { rewrite_selection: false, .. }
        ));
    }

    #[tokio::test]
    async fn test_jobs_are_consumed_in_order() {
        let transport = ScriptedTransport::new(vec![
            ScriptedJob::default(),
            ScriptedJob {
                fail_create: Some("backend down".to_string()),
                ..Default::default()
            },
        ]);
        let payload = JobPayload {
            conversation_id: "c".to_string(),
            provider: "p".to_string(),
            action: Default::default(),
            text: "hi".to_string(),
            attachments: Vec::new(),
            history: Vec::new(),
            feedback: None,
            selection: None,
            extended_reasoning: false,
        };

        assert_eq!(transport.create_job(payload.clone()).await.unwrap(), "job-1");
        let err = transport.create_job(payload.clone()).await.unwrap_err();
        assert!(err.to_string().contains("backend down"));
        assert!(transport.create_job(payload).await.is_err());
        assert_eq!(transport.payloads().len(), 1);
    }
}
