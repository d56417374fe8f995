use super::frame::Frame;
use super::manager::FrameReader;
use super::{CaptureError, CaptureResult};
use crate::bridge::AutomationBridge;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// "Give me the current screen". `Ok(None)` means nothing usable this time;
/// the caller decides whether that matters.
#[allow(async_fn_in_trait)]
pub trait FrameSource {
    async fn capture(&self) -> CaptureResult<Option<Frame>>;
}

/// Every capture is a fresh round trip through the bridge.
pub struct BridgeFrameSource<B> {
    bridge: Arc<B>,
}

impl<B> BridgeFrameSource<B> {
    pub fn new(bridge: Arc<B>) -> Self {
        Self { bridge }
    }
}

impl<B: AutomationBridge> FrameSource for BridgeFrameSource<B> {
    async fn capture(&self) -> CaptureResult<Option<Frame>> {
        let frame = Frame::new(self.bridge.capture_frame().await?);
        Ok((!frame.is_empty()).then_some(frame))
    }
}

/// Snapshots of a running capture loop. Never blocks; may lag by one cadence.
pub struct WindowFrameSource {
    reader: FrameReader,
}

impl WindowFrameSource {
    pub fn new(reader: FrameReader) -> Self {
        Self { reader }
    }

    /// Poll until the loop has produced its first frame.
    pub async fn wait_first_frame(&self, timeout: Duration) -> CaptureResult<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.capture().await? {
                return Ok(frame);
            }
            if Instant::now() >= deadline {
                return Err(CaptureError::NoFirstFrame { waited: timeout });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl FrameSource for WindowFrameSource {
    async fn capture(&self) -> CaptureResult<Option<Frame>> {
        if self.reader.is_invalidated() {
            return Err(CaptureError::TargetLost);
        }
        Ok(self.reader.latest().filter(|f| !f.is_empty()))
    }
}

/// Either source behind one type, chosen at run start.
pub enum AnySource<B> {
    Bridge(BridgeFrameSource<B>),
    Window(WindowFrameSource),
}

impl<B: AutomationBridge> FrameSource for AnySource<B> {
    async fn capture(&self) -> CaptureResult<Option<Frame>> {
        match self {
            AnySource::Bridge(s) => s.capture().await,
            AnySource::Window(s) => s.capture().await,
        }
    }
}
