use crate::bridge::{AutomationBridge, BridgeResult};
use std::sync::Arc;
use std::time::Duration;

pub const DEPLOYMENT_SLOTS: usize = 12;

/// Screen point in the canonical 1920x1080 landscape layout.
pub type Point = (u32, u32);

/// Index → tap point for every unit-deployment button.
/// 0 is the wallet upgrade, 1..=10 the cat slots (top row 1-5, bottom row 6-10),
/// 11 the cat cannon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentTable {
    positions: [Point; DEPLOYMENT_SLOTS],
}

impl DeploymentTable {
    pub fn canonical() -> Self {
        Self {
            positions: [
                (150, 975),
                (560, 845),
                (760, 845),
                (960, 845),
                (1160, 845),
                (1360, 845),
                (560, 985),
                (760, 985),
                (960, 985),
                (1160, 985),
                (1360, 985),
                (1770, 960),
            ],
        }
    }

    pub fn position(&self, index: usize) -> Option<Point> {
        self.positions.get(index).copied()
    }

    pub fn label(index: usize) -> String {
        match index {
            0 => "wallet".to_string(),
            11 => "cannon".to_string(),
            n if n < DEPLOYMENT_SLOTS => format!("cat {n}"),
            n => format!("slot {n}"),
        }
    }
}

impl Default for DeploymentTable {
    fn default() -> Self {
        Self::canonical()
    }
}

/// Turns intent into bridge input. Nothing here waits for the game to react;
/// pacing and verification belong to the engine.
pub struct ActionDispatcher<B> {
    bridge: Arc<B>,
    table: DeploymentTable,
}

impl<B: AutomationBridge> ActionDispatcher<B> {
    pub fn new(bridge: Arc<B>) -> Self {
        Self::with_table(bridge, DeploymentTable::canonical())
    }

    pub fn with_table(bridge: Arc<B>, table: DeploymentTable) -> Self {
        Self { bridge, table }
    }

    pub fn bridge(&self) -> &Arc<B> {
        &self.bridge
    }

    pub fn table(&self) -> &DeploymentTable {
        &self.table
    }

    pub async fn tap(&self, x: u32, y: u32) -> BridgeResult<()> {
        log::debug!("tap ({x}, {y})");
        self.bridge.tap(x, y).await
    }

    /// Same device primitive as [`tap`](Self::tap) for now.
    pub async fn press_and_release(&self, x: u32, y: u32) -> BridgeResult<()> {
        self.tap(x, y).await
    }

    pub async fn swipe(
        &self,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration_ms: u64,
    ) -> BridgeResult<()> {
        log::debug!("swipe ({x1}, {y1}) -> ({x2}, {y2}) over {duration_ms}ms");
        self.bridge
            .swipe(x1, y1, x2, y2, Duration::from_millis(duration_ms))
            .await
    }

    /// Tap each listed deployment slot once, in the given order. Repeats and
    /// indices outside the table are skipped. Returns the number of taps sent.
    pub async fn fight_sequence_tap(&self, order: &[usize]) -> BridgeResult<usize> {
        let mut seen = [false; DEPLOYMENT_SLOTS];
        let mut sent = 0;
        for &index in order {
            let Some((x, y)) = self.table.position(index) else {
                log::warn!("Deployment slot {index} does not exist, skipping");
                continue;
            };
            if std::mem::replace(&mut seen[index], true) {
                continue;
            }
            self.tap(x, y).await?;
            sent += 1;
        }
        Ok(sent)
    }
}
