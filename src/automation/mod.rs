// Script automation: options, the state machine engine, recovery collaborators
// and the run driver that owns every resource a run touches.

pub mod cancel;
pub mod catalog;
pub mod dispatcher;
pub mod engine;
pub mod options;
pub mod recovery;
pub mod runner;
pub mod state;

#[cfg(test)]
mod tests;

pub use cancel::{CancelFlag, Cancelled};
pub use catalog::ScriptVariant;
pub use dispatcher::{ActionDispatcher, DeploymentTable};
pub use engine::{Engine, EngineResult, Timings};
pub use options::{CaptureMode, OptionMap, OptionValue, OptionsError, Region, RunOptions};
pub use recovery::{ClockControl, DeviceClock, Replenisher, TimezoneScope};
pub use runner::{BridgeKind, RunContext, RunRequest, run_script, run_variant};
pub use state::{RunOutcome, RunStatus, ScriptRunState};

use crate::bridge::BridgeError;
use crate::capture::CaptureError;
use crate::matching::MatchError;
use recovery::RecoveryError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Stopped on request")]
    Cancelled,

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Recovery(RecoveryError),

    #[error(transparent)]
    Options(#[from] OptionsError),

    #[error("Battle did not end within {0:?}")]
    BattleTimeout(Duration),

    #[error("Stage '{template}' not found after {scrolls} scrolls")]
    StageNotFound { template: String, scrolls: u32 },
}

impl EngineError {
    /// Fatal errors end the run as FAILED; the rest abandon one round.
    pub fn is_fatal(&self) -> bool {
        match self {
            EngineError::Bridge(e) => e.is_unavailable(),
            EngineError::Capture(e) => e.is_fatal(),
            EngineError::Match(e) => e.is_fatal(),
            EngineError::Recovery(RecoveryError::Bridge(e)) => e.is_unavailable(),
            EngineError::Recovery(RecoveryError::Adb(e)) => e.is_disconnect(),
            EngineError::Recovery(RecoveryError::ClockUnmanaged) => true,
            EngineError::Options(_) => true,
            _ => false,
        }
    }
}

impl From<Cancelled> for EngineError {
    fn from(_: Cancelled) -> Self {
        EngineError::Cancelled
    }
}

impl From<RecoveryError> for EngineError {
    fn from(e: RecoveryError) -> Self {
        match e {
            RecoveryError::Cancelled => EngineError::Cancelled,
            other => EngineError::Recovery(other),
        }
    }
}
