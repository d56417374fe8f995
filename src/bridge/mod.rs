// Automation bridge - the session through which the game is observed and driven.
// Implemented over adb directly, or over an Appium (W3C WebDriver) server.

pub mod adb;
pub mod appium;


pub use appium::{AppiumBridge, AppiumConfig};

use crate::adb::AdbError;
use image::RgbImage;
use std::time::Duration;
use thiserror::Error;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The bridge (or the device behind it) cannot be reached at all.
    #[error("Automation bridge unavailable: {reason}")]
    Unavailable { reason: String },

    #[error(transparent)]
    Adb(#[from] AdbError),

    #[error("Bridge request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bridge answered {status} to {endpoint}: {message}")]
    Protocol {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Bridge returned an unusable screenshot: {0}")]
    Screenshot(String),
}

impl BridgeError {
    /// True when retrying within the same run is pointless.
    pub fn is_unavailable(&self) -> bool {
        match self {
            BridgeError::Unavailable { .. } => true,
            BridgeError::Adb(e) => e.is_disconnect(),
            BridgeError::Http(e) => e.is_connect(),
            _ => false,
        }
    }
}

/// Capture and input against one target device. Calls are plain request/response
/// round trips; none of them waits for the game to react.
#[allow(async_fn_in_trait)]
pub trait AutomationBridge {
    async fn capture_frame(&self) -> BridgeResult<RgbImage>;

    async fn tap(&self, x: u32, y: u32) -> BridgeResult<()>;

    async fn swipe(
        &self,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration: Duration,
    ) -> BridgeResult<()>;

    /// Stop the app and bring it back to its launcher activity.
    async fn relaunch_app(&self, package: &str, activity: &str) -> BridgeResult<()>;

    /// Release the session. Called exactly once when a run ends.
    async fn quit(&self) -> BridgeResult<()>;
}

/// The bridge kind picked on the command line, behind one type.
pub enum AnyBridge {
    Adb(std::sync::Arc<crate::adb::AdbBackend>),
    Appium(AppiumBridge),
}

impl AutomationBridge for AnyBridge {
    async fn capture_frame(&self) -> BridgeResult<RgbImage> {
        match self {
            AnyBridge::Adb(b) => b.capture_frame().await,
            AnyBridge::Appium(b) => b.capture_frame().await,
        }
    }

    async fn tap(&self, x: u32, y: u32) -> BridgeResult<()> {
        match self {
            AnyBridge::Adb(b) => AutomationBridge::tap(b.as_ref(), x, y).await,
            AnyBridge::Appium(b) => b.tap(x, y).await,
        }
    }

    async fn swipe(
        &self,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration: Duration,
    ) -> BridgeResult<()> {
        match self {
            AnyBridge::Adb(b) => {
                AutomationBridge::swipe(b.as_ref(), x1, y1, x2, y2, duration).await
            }
            AnyBridge::Appium(b) => b.swipe(x1, y1, x2, y2, duration).await,
        }
    }

    async fn relaunch_app(&self, package: &str, activity: &str) -> BridgeResult<()> {
        match self {
            AnyBridge::Adb(b) => b.relaunch_app(package, activity).await,
            AnyBridge::Appium(b) => b.relaunch_app(package, activity).await,
        }
    }

    async fn quit(&self) -> BridgeResult<()> {
        match self {
            AnyBridge::Adb(b) => b.quit().await,
            AnyBridge::Appium(b) => b.quit().await,
        }
    }
}
