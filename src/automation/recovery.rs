// Recovery collaborators: resource replenishment and the device clock.

use super::cancel::{CancelFlag, Cancelled};
use crate::adb::{AdbError, CommandChannel};
use crate::bridge::{AutomationBridge, BridgeError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub type RecoveryResult<T> = Result<T, RecoveryError>;

#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error(transparent)]
    Adb(#[from] AdbError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("Device timezone is '{actual}' after setting '{wanted}'")]
    TimezoneNotApplied { wanted: String, actual: String },

    #[error("Device clock reads {actual} after setting it to {wanted}")]
    ClockNotAdvanced { wanted: u64, actual: u64 },

    #[error("This run has no access to the device clock")]
    ClockUnmanaged,

    #[error("Interrupted by stop request")]
    Cancelled,
}

impl From<Cancelled> for RecoveryError {
    fn from(_: Cancelled) -> Self {
        RecoveryError::Cancelled
    }
}

/// Brings the exhausted resource back. Invoked only when the run allows it.
#[async_trait(?Send)]
pub trait Replenisher {
    async fn replenish(&self) -> RecoveryResult<()>;
}

/// Restarting the game refills the resource; wait for it to come back up.
pub struct AppRestart<B> {
    bridge: Arc<B>,
    package: String,
    activity: String,
    settle: Duration,
    cancel: CancelFlag,
}

impl<B> AppRestart<B> {
    pub fn new(
        bridge: Arc<B>,
        package: impl Into<String>,
        activity: impl Into<String>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            bridge,
            package: package.into(),
            activity: activity.into(),
            settle: Duration::from_secs(15),
            cancel,
        }
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }
}

#[async_trait(?Send)]
impl<B: AutomationBridge> Replenisher for AppRestart<B> {
    async fn replenish(&self) -> RecoveryResult<()> {
        log::info!("Restarting {} to replenish", self.package);
        self.bridge.relaunch_app(&self.package, &self.activity).await?;
        self.cancel.sleep(self.settle).await?;
        Ok(())
    }
}

/// Timezone access through the device shell.
#[derive(Clone)]
pub struct DeviceClock {
    channel: Arc<dyn CommandChannel>,
}

impl DeviceClock {
    pub fn new(channel: Arc<dyn CommandChannel>) -> Self {
        Self { channel }
    }

    /// Olson id, e.g. `Asia/Taipei`.
    pub async fn current_timezone(&self) -> RecoveryResult<String> {
        Ok(self.channel.getprop("persist.sys.timezone").await?)
    }

    /// `+09:00` style offset as the device currently reports it.
    pub async fn utc_offset(&self) -> RecoveryResult<String> {
        let raw = self.channel.shell(&["date", "+%z"]).await?;
        format_offset(raw.trim()).ok_or_else(|| {
            RecoveryError::Adb(AdbError::Unparseable {
                command: "date +%z".to_string(),
                output: raw,
            })
        })
    }

    /// Switch off automatic timezone and apply `timezone`, then read it back.
    pub async fn set_timezone(&self, timezone: &str) -> RecoveryResult<()> {
        self.channel
            .shell(&["settings", "put", "global", "auto_time_zone", "0"])
            .await?;
        self.channel
            .shell(&["service", "call", "alarm", "3", "s16", timezone])
            .await?;
        if self.current_timezone().await? != timezone {
            // Older images ignore the alarm call; the property still works on rooted emulators
            self.channel
                .shell(&["setprop", "persist.sys.timezone", timezone])
                .await?;
        }
        let actual = self.current_timezone().await?;
        if actual != timezone {
            return Err(RecoveryError::TimezoneNotApplied {
                wanted: timezone.to_string(),
                actual,
            });
        }
        log::info!("Device timezone set to {timezone}");
        Ok(())
    }

    /// Seconds since the epoch on the device.
    pub async fn now(&self) -> RecoveryResult<u64> {
        let raw = self.channel.shell(&["date", "+%s"]).await?;
        raw.trim().parse().map_err(|_| {
            RecoveryError::Adb(AdbError::Unparseable {
                command: "date +%s".to_string(),
                output: raw,
            })
        })
    }

    /// Turn off network time and move the clock forward by `by`.
    pub async fn advance(&self, by: Duration) -> RecoveryResult<()> {
        let wanted = self.now().await? + by.as_secs();
        self.channel
            .shell(&["settings", "put", "global", "auto_time", "0"])
            .await?;
        self.channel.shell(&["date", &format!("@{wanted}")]).await?;
        let actual = self.now().await?;
        if actual < wanted {
            return Err(RecoveryError::ClockNotAdvanced { wanted, actual });
        }
        log::debug!("Device clock moved forward {by:?}");
        Ok(())
    }

    /// Let the device take its time from the network again.
    pub async fn resume_network_time(&self) -> RecoveryResult<()> {
        self.channel
            .shell(&["settings", "put", "global", "auto_time", "1"])
            .await?;
        Ok(())
    }

    fn restore_blocking(&self, timezone: &str) -> Result<(), AdbError> {
        let current = self.channel.shell_blocking(&["getprop", "persist.sys.timezone"])?;
        if current.trim() == timezone {
            return Ok(());
        }
        self.channel
            .shell_blocking(&["service", "call", "alarm", "3", "s16", timezone])?;
        self.channel
            .shell_blocking(&["setprop", "persist.sys.timezone", timezone])?;
        Ok(())
    }
}

/// `+0900` → `+09:00`.
pub fn format_offset(raw: &str) -> Option<String> {
    let (sign, digits) = raw.split_at_checked(1)?;
    if !matches!(sign, "+" | "-")
        || digits.len() != 4
        || !digits.bytes().all(|b| b.is_ascii_digit())
    {
        return None;
    }
    Some(format!("{sign}{}:{}", &digits[..2], &digits[2..]))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClockStatus {
    Aligned,
    Changed { from: String, to: String },
    Misaligned { current: String, target: String },
}

/// Keeps the device clock where an event run needs it.
#[async_trait(?Send)]
pub trait ClockControl {
    /// `allow_change = false` only reports; it never touches the device.
    async fn ensure_aligned(&self, allow_change: bool) -> RecoveryResult<ClockStatus>;

    /// Move the device clock forward.
    async fn advance(&self, by: Duration) -> RecoveryResult<()>;
}

/// Aligns to a configured target timezone. Without a target every check passes.
pub struct TargetClock {
    clock: DeviceClock,
    target: Option<String>,
}

impl TargetClock {
    pub fn new(clock: DeviceClock, target: Option<String>) -> Self {
        Self { clock, target }
    }
}

#[async_trait(?Send)]
impl ClockControl for TargetClock {
    async fn ensure_aligned(&self, allow_change: bool) -> RecoveryResult<ClockStatus> {
        let Some(target) = &self.target else {
            return Ok(ClockStatus::Aligned);
        };
        let current = self.clock.current_timezone().await?;
        if &current == target {
            return Ok(ClockStatus::Aligned);
        }
        if !allow_change {
            return Ok(ClockStatus::Misaligned {
                current,
                target: target.clone(),
            });
        }
        self.clock.set_timezone(target).await?;
        Ok(ClockStatus::Changed {
            from: current,
            to: target.clone(),
        })
    }

    async fn advance(&self, by: Duration) -> RecoveryResult<()> {
        self.clock.advance(by).await
    }
}

/// For scripts that never look at the clock.
pub struct Unmanaged;

#[async_trait(?Send)]
impl ClockControl for Unmanaged {
    async fn ensure_aligned(&self, _allow_change: bool) -> RecoveryResult<ClockStatus> {
        Ok(ClockStatus::Aligned)
    }

    async fn advance(&self, _by: Duration) -> RecoveryResult<()> {
        Err(RecoveryError::ClockUnmanaged)
    }
}

/// The device timezone as it was when the run started. Put back by
/// [`restore`](Self::restore), or synchronously on drop if that never ran.
pub struct TimezoneScope {
    clock: DeviceClock,
    original: String,
    restored: bool,
}

impl TimezoneScope {
    pub async fn capture(clock: DeviceClock) -> RecoveryResult<Self> {
        let original = clock.current_timezone().await?;
        log::info!("Device timezone at run start: {original}");
        Ok(Self {
            clock,
            original,
            restored: false,
        })
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    /// On failure the scope is dropped unrestored, so the blocking restore
    /// still gets its turn.
    pub async fn restore(mut self) -> RecoveryResult<()> {
        self.put_back().await?;
        self.restored = true;
        Ok(())
    }

    async fn put_back(&self) -> RecoveryResult<()> {
        if self.clock.current_timezone().await? == self.original {
            return Ok(());
        }
        log::info!("Restoring device timezone to {}", self.original);
        self.clock.set_timezone(&self.original).await
    }
}

impl Drop for TimezoneScope {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.clock.restore_blocking(&self.original) {
            log::warn!("Could not restore device timezone to {}: {e}", self.original);
        }
    }
}
