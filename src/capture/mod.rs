// Screen acquisition: frames from the bridge, or from a local emulator window
// refreshed by a background capture loop.

pub mod frame;
pub mod manager;
pub mod method;
pub mod source;
pub mod target;
pub mod window;


pub use frame::Frame;
pub use manager::{CaptureManager, CaptureState, FrameReader};
pub use method::{CaptureMethod, MethodPolicy, TitleRules, default_policy};
pub use source::{AnySource, BridgeFrameSource, FrameSource, WindowFrameSource};
pub use target::{CaptureTarget, WindowHandle};
pub use window::{WindowCapture, open_window, resolve_window};

use crate::bridge::BridgeError;
use std::time::Duration;
use thiserror::Error;

pub type CaptureResult<T> = Result<T, CaptureError>;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("{what} is not supported on this platform")]
    Unsupported { what: String },

    #[error("No window matches title {title:?} / class {class:?}")]
    WindowNotFound {
        title: Option<String>,
        class: Option<String>,
    },

    #[error("{target} is not a window target")]
    NotAWindow { target: String },

    #[error("Capture window is no longer valid")]
    TargetLost,

    #[error("No frame captured within {waited:?}")]
    NoFirstFrame { waited: Duration },

    #[error(transparent)]
    Bridge(#[from] BridgeError),
}

impl CaptureError {
    /// Errors after which the run cannot see the screen any more.
    pub fn is_fatal(&self) -> bool {
        match self {
            CaptureError::TargetLost
            | CaptureError::Unsupported { .. }
            | CaptureError::WindowNotFound { .. }
            | CaptureError::NotAWindow { .. }
            | CaptureError::NoFirstFrame { .. } => true,
            CaptureError::Bridge(e) => e.is_unavailable(),
        }
    }
}
