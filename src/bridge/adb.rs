use super::{AutomationBridge, BridgeResult};
use crate::adb::AdbBackend;
use image::RgbImage;
use std::time::Duration;

/// adb needs no session: capture and input go straight to the device.
impl AutomationBridge for AdbBackend {
    async fn capture_frame(&self) -> BridgeResult<RgbImage> {
        Ok(self.screenshot().await?)
    }

    async fn tap(&self, x: u32, y: u32) -> BridgeResult<()> {
        Ok(AdbBackend::tap(self, x, y).await?)
    }

    async fn swipe(
        &self,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration: Duration,
    ) -> BridgeResult<()> {
        Ok(AdbBackend::swipe(self, x1, y1, x2, y2, Some(duration)).await?)
    }

    async fn relaunch_app(&self, package: &str, _activity: &str) -> BridgeResult<()> {
        self.force_stop(package).await?;
        self.launch(package).await?;
        Ok(())
    }

    async fn quit(&self) -> BridgeResult<()> {
        log::debug!("Releasing adb bridge for {}", self.serial());
        Ok(())
    }
}
