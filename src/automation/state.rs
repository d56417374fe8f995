use super::cancel::CancelFlag;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Stopped,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Completed => "COMPLETED",
            RunStatus::Stopped => "STOPPED",
            RunStatus::Failed => "FAILED",
        })
    }
}

/// What a run ended with.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub message: Option<String>,
    pub iterations: u32,
    pub elapsed: Duration,
}

impl RunOutcome {
    pub fn failed_before_start(message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            message: Some(message.into()),
            iterations: 0,
            elapsed: Duration::ZERO,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} after {} round(s) in {}",
            self.status,
            self.iterations,
            format_elapsed(self.elapsed)
        )?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        Ok(())
    }
}

/// Per-run bookkeeping owned by the engine.
#[derive(Debug, Clone)]
pub struct ScriptRunState {
    pub iterations: u32,
    pub started_at: Instant,
    pub cancel: CancelFlag,
}

impl ScriptRunState {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            iterations: 0,
            started_at: Instant::now(),
            cancel,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// 0 means no limit.
    pub fn limit_reached(&self, max_loops: u32) -> bool {
        max_loops > 0 && self.iterations >= max_loops
    }

    pub fn finish(&self, status: RunStatus, message: Option<String>) -> RunOutcome {
        RunOutcome {
            status,
            message,
            iterations: self.iterations,
            elapsed: self.elapsed(),
        }
    }
}

/// `1d 02:03:04`
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (days, rest) = (secs / 86_400, secs % 86_400);
    format!(
        "{days}d {:02}:{:02}:{:02}",
        rest / 3600,
        (rest % 3600) / 60,
        rest % 60
    )
}
