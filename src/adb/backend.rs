use super::error::AdbResult;
use super::rust_impl::RustAdb;
use super::shell::AdbShell;
use super::types::{CommandChannel, Device, DeviceInfo};
use async_trait::async_trait;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which transport carries adb traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum AdbImpl {
    /// Spawn the external `adb` binary per command
    Shell,
    /// Talk to the adb server socket in-process
    Rust,
}

pub enum AdbBackend {
    Shell(AdbShell),
    Rust(RustAdb),
}

impl AdbBackend {
    /// Connect well-known emulator ports first so they show up in the list.
    pub async fn list_devices(kind: AdbImpl, adb_path: &Path) -> AdbResult<Vec<Device>> {
        match kind {
            AdbImpl::Shell => {
                let shell = AdbShell::unbound(adb_path);
                shell.connect_known_emulators().await;
                shell.list_devices().await
            }
            AdbImpl::Rust => {
                RustAdb::connect_known_emulators().await;
                RustAdb::list_devices().await
            }
        }
    }

    pub async fn describe_devices(kind: AdbImpl, adb_path: &Path) -> AdbResult<Vec<DeviceInfo>> {
        let devices = Self::list_devices(kind, adb_path).await?;
        let mut infos = Vec::with_capacity(devices.len());
        for device in devices {
            let info = match kind {
                AdbImpl::Shell => AdbShell::unbound(adb_path).describe_device(&device.serial).await,
                AdbImpl::Rust => RustAdb::new_with_device(Some(&device.serial))
                    .await?
                    .describe_device()
                    .await,
            };
            infos.push(info);
        }
        Ok(infos)
    }

    pub async fn restart_server(adb_path: &Path) -> AdbResult<()> {
        AdbShell::unbound(adb_path).restart_server().await
    }

    /// Open `serial`, or the first attached device.
    pub async fn connect(
        kind: AdbImpl,
        adb_path: impl Into<PathBuf>,
        serial: Option<&str>,
    ) -> AdbResult<Self> {
        match kind {
            AdbImpl::Shell => Ok(AdbBackend::Shell(
                AdbShell::new_with_device(adb_path, serial).await?,
            )),
            AdbImpl::Rust => Ok(AdbBackend::Rust(RustAdb::new_with_device(serial).await?)),
        }
    }

    pub fn serial(&self) -> &str {
        match self {
            AdbBackend::Shell(s) => s.serial().unwrap_or_default(),
            AdbBackend::Rust(r) => r.serial(),
        }
    }

    pub fn screen_dimensions(&self) -> (u32, u32) {
        match self {
            AdbBackend::Shell(s) => s.screen_dimensions(),
            AdbBackend::Rust(r) => r.screen_dimensions(),
        }
    }

    pub async fn screenshot(&self) -> AdbResult<RgbImage> {
        match self {
            AdbBackend::Shell(s) => s.screenshot().await,
            AdbBackend::Rust(r) => r.screenshot().await,
        }
    }

    pub async fn tap(&self, x: u32, y: u32) -> AdbResult<()> {
        match self {
            AdbBackend::Shell(s) => s.tap(x, y).await,
            AdbBackend::Rust(r) => r.tap(x, y).await,
        }
    }

    pub async fn swipe(
        &self,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration: Option<Duration>,
    ) -> AdbResult<()> {
        match self {
            AdbBackend::Shell(s) => s.swipe(x1, y1, x2, y2, duration).await,
            AdbBackend::Rust(r) => r.swipe(x1, y1, x2, y2, duration).await,
        }
    }

    pub async fn force_stop(&self, package: &str) -> AdbResult<()> {
        self.shell(&["am", "force-stop", package]).await.map(|_| ())
    }

    /// Start the package's launcher activity without knowing its class name.
    pub async fn launch(&self, package: &str) -> AdbResult<()> {
        self.shell(&[
            "monkey",
            "-p",
            package,
            "-c",
            "android.intent.category.LAUNCHER",
            "1",
        ])
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl CommandChannel for AdbBackend {
    async fn shell(&self, args: &[&str]) -> AdbResult<String> {
        match self {
            AdbBackend::Shell(s) => s.shell(args).await,
            AdbBackend::Rust(r) => r.shell(args).await,
        }
    }

    fn shell_blocking(&self, args: &[&str]) -> AdbResult<String> {
        match self {
            AdbBackend::Shell(s) => s.shell_blocking(args),
            AdbBackend::Rust(r) => r.shell_blocking(args),
        }
    }
}
