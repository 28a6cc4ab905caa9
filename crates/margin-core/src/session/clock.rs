//! Elapsed-time status line for the active job

use std::time::Duration;

use tokio::time::Instant;

/// Render an elapsed duration for the status line
///
/// Under a minute: `"7s"`. Under an hour: `"2m 05s"`. Otherwise `"1h 02m 05s"`.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if total < 60 {
        format!("{}s", seconds)
    } else if total < 3600 {
        format!("{}m {:02}s", minutes, seconds)
    } else {
        format!("{}h {:02}m {:02}s", hours, minutes, seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ClockState {
    Stopped,
    Running { started: Instant },
    Complete,
}

/// Tracks how long a job has been working
#[derive(Debug)]
pub struct ThinkingClock {
    state: ClockState,
    prefix: String,
    status_line: Option<String>,
}

impl Default for ThinkingClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ThinkingClock {
    pub fn new() -> Self {
        Self {
            state: ClockState::Stopped,
            prefix: String::new(),
            status_line: None,
        }
    }

    pub fn start(&mut self, prefix: impl Into<String>, now: Instant) {
        self.prefix = prefix.into();
        self.state = ClockState::Running { started: now };
        self.status_line = Some(format!("{} · {}", self.prefix, format_elapsed(Duration::ZERO)));
    }

    /// Re-render the live status line
    ///
    /// `label` overrides the clock prefix when the job reported progress.
    pub fn tick(&mut self, label: Option<&str>, now: Instant) {
        if let ClockState::Running { started } = self.state {
            let label = label.filter(|l| !l.trim().is_empty()).unwrap_or(&self.prefix);
            let elapsed = now.saturating_duration_since(started);
            self.status_line = Some(format!("{} · {}", label, format_elapsed(elapsed)));
        }
    }

    /// Freeze the final "Thought for" line; false if already complete or stopped
    pub fn mark_complete(&mut self, now: Instant) -> bool {
        match self.state {
            ClockState::Running { started } => {
                let elapsed = now.saturating_duration_since(started);
                self.status_line = Some(format!("Thought for {}", format_elapsed(elapsed)));
                self.state = ClockState::Complete;
                true
            }
            _ => false,
        }
    }

    /// Stop without a final message
    pub fn stop(&mut self) {
        self.state = ClockState::Stopped;
        self.status_line = None;
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, ClockState::Running { .. })
    }

    pub fn status_line(&self) -> Option<&str> {
        self.status_line.as_deref()
    }
}
