use super::error::{AdbError, AdbResult};
use super::types::{
    CommandChannel, Device, DeviceInfo, EmulatorFamily, WELL_KNOWN_EMULATOR_PORTS, outside_screen,
    parse_devices, parse_screen_size,
};
use super::rust_impl::decode_encoded;
use async_trait::async_trait;
use image::RgbImage;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;
use tokio::process::Command;

/// Device command channel backed by the external `adb` binary. Every call is one
/// process invocation; `-s <serial>` is added when a device has been selected.
#[derive(Debug, Clone)]
pub struct AdbShell {
    adb_path: PathBuf,
    serial: Option<String>,
    screen_x: u32,
    screen_y: u32,
}

impl AdbShell {
    /// A channel that is not bound to any device yet (for `devices`, `connect`, ...).
    pub fn unbound(adb_path: impl Into<PathBuf>) -> Self {
        Self {
            adb_path: adb_path.into(),
            serial: None,
            screen_x: 0,
            screen_y: 0,
        }
    }

    /// Bind to `serial` (or the only attached device) and read its screen size.
    pub async fn new_with_device(
        adb_path: impl Into<PathBuf>,
        serial: Option<&str>,
    ) -> AdbResult<Self> {
        let unbound = Self::unbound(adb_path);
        unbound.ensure_adb_available().await?;
        let devices = unbound.list_devices().await?;
        let device = match serial {
            Some(serial) => devices
                .into_iter()
                .find(|d| d.serial == serial)
                .ok_or_else(|| AdbError::DeviceNotFound {
                    serial: serial.to_string(),
                })?,
            None => devices.into_iter().next().ok_or(AdbError::NoDevices)?,
        };
        let mut shell = Self {
            serial: Some(device.serial),
            ..unbound
        };
        let (x, y) = shell.get_screen_size().await?;
        shell.screen_x = x;
        shell.screen_y = y;
        Ok(shell)
    }

    pub fn adb_path(&self) -> &Path {
        &self.adb_path
    }

    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn screen_dimensions(&self) -> (u32, u32) {
        (self.screen_x, self.screen_y)
    }

    fn command_line(&self, args: &[&str]) -> Vec<String> {
        let mut full = Vec::with_capacity(args.len() + 2);
        if let Some(serial) = &self.serial {
            full.push("-s".to_string());
            full.push(serial.clone());
        }
        full.extend(args.iter().map(|a| a.to_string()));
        full
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("adb {}", self.command_line(args).join(" "))
    }

    fn spawn_error(&self, args: &[&str], source: std::io::Error) -> AdbError {
        if source.kind() == std::io::ErrorKind::NotFound {
            AdbError::BinaryNotFound {
                path: self.adb_path.clone(),
            }
        } else {
            AdbError::Spawn {
                command: self.describe(args),
                source,
            }
        }
    }

    fn check_output(&self, args: &[&str], output: Output) -> AdbResult<Vec<u8>> {
        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if text.is_empty() {
                text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(AdbError::CommandFailed {
                command: self.describe(args),
                status: output.status.to_string(),
                output: text,
            });
        }
        Ok(output.stdout)
    }

    /// Run `adb [-s serial] <args...>` and return raw stdout.
    pub async fn run_bytes(&self, args: &[&str]) -> AdbResult<Vec<u8>> {
        log::debug!("{}", self.describe(args));
        let output = Command::new(&self.adb_path)
            .args(self.command_line(args))
            .output()
            .await
            .map_err(|e| self.spawn_error(args, e))?;
        self.check_output(args, output)
    }

    /// Run `adb [-s serial] <args...>` and return stdout as text.
    pub async fn run(&self, args: &[&str]) -> AdbResult<String> {
        let stdout = self.run_bytes(args).await?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Blocking twin of [`AdbShell::run`] for drop guards.
    pub fn run_blocking(&self, args: &[&str]) -> AdbResult<String> {
        let output = std::process::Command::new(&self.adb_path)
            .args(self.command_line(args))
            .output()
            .map_err(|e| self.spawn_error(args, e))?;
        let stdout = self.check_output(args, output)?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    pub async fn ensure_adb_available(&self) -> AdbResult<()> {
        let unbound = Self::unbound(self.adb_path.clone());
        unbound.run(&["version"]).await.map(|_| ())
    }

    pub async fn restart_server(&self) -> AdbResult<()> {
        let unbound = Self::unbound(self.adb_path.clone());
        unbound.run(&["kill-server"]).await?;
        unbound.run(&["start-server"]).await?;
        Ok(())
    }

    /// `adb connect <address>`. adb reports refusals on stdout with a zero exit
    /// status, so the text is inspected as well.
    pub async fn connect(&self, address: &str) -> AdbResult<()> {
        let unbound = Self::unbound(self.adb_path.clone());
        let out = unbound.run(&["connect", address]).await?;
        if out.contains("refused") || out.contains("failed") || out.contains("cannot") {
            return Err(AdbError::CommandFailed {
                command: format!("adb connect {address}"),
                status: "refused".to_string(),
                output: out.trim().to_string(),
            });
        }
        Ok(())
    }

    /// Try every well-known emulator port on loopback; failures are expected and only logged.
    pub async fn connect_known_emulators(&self) {
        for port in WELL_KNOWN_EMULATOR_PORTS {
            let address = format!("127.0.0.1:{port}");
            match self.connect(&address).await {
                Ok(()) => log::info!("Connected to emulator at {address}"),
                Err(e) => log::debug!("No emulator at {address}: {e}"),
            }
        }
    }

    pub async fn list_devices(&self) -> AdbResult<Vec<Device>> {
        let unbound = Self::unbound(self.adb_path.clone());
        let stdout = unbound.run(&["devices", "-l"]).await?;
        Ok(parse_devices(&stdout))
    }

    /// Query model/brand/version for one serial. Property failures degrade to empty
    /// strings; the device is still listed.
    pub async fn describe_device(&self, serial: &str) -> DeviceInfo {
        let bound = Self {
            serial: Some(serial.to_string()),
            ..Self::unbound(self.adb_path.clone())
        };
        let prop = |name: &'static str| {
            let bound = bound.clone();
            async move {
                match bound.getprop(name).await {
                    Ok(value) => value,
                    Err(e) => {
                        log::warn!("getprop {name} failed on {serial}: {e}");
                        String::new()
                    }
                }
            }
        };
        let model = prop("ro.product.model").await;
        let brand = prop("ro.product.brand").await;
        let android_version = prop("ro.build.version.release").await;
        let family = EmulatorFamily::classify(&model, &brand, serial);
        DeviceInfo {
            serial: serial.to_string(),
            model,
            brand,
            android_version,
            family,
        }
    }

    async fn get_screen_size(&self) -> AdbResult<(u32, u32)> {
        let stdout = self.run(&["shell", "wm", "size"]).await?;
        parse_screen_size(&stdout).ok_or(AdbError::ScreenSizeParseFailed)
    }

    /// PNG bytes from `exec-out screencap -p` (binary-safe, unlike `shell`).
    pub async fn capture_screen_png(&self) -> AdbResult<Vec<u8>> {
        self.run_bytes(&["exec-out", "screencap", "-p"]).await
    }

    pub async fn screenshot(&self) -> AdbResult<RgbImage> {
        let png = self.capture_screen_png().await?;
        decode_encoded(&png)
    }

    pub async fn tap(&self, x: u32, y: u32) -> AdbResult<()> {
        if self.out_of_bounds(x, y) {
            return Err(AdbError::TapOutOfBounds { x, y });
        }
        let (xs, ys) = (x.to_string(), y.to_string());
        self.run(&["shell", "input", "tap", &xs, &ys]).await.map(|_| ())
    }

    pub async fn swipe(
        &self,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration: Option<Duration>,
    ) -> AdbResult<()> {
        for (x, y) in [(x1, y1), (x2, y2)] {
            if self.out_of_bounds(x, y) {
                return Err(AdbError::TapOutOfBounds { x, y });
            }
        }
        let coords = [x1, y1, x2, y2].map(|v| v.to_string());
        let mut args = vec!["shell", "input", "swipe"];
        args.extend(coords.iter().map(String::as_str));
        let ms = duration.map(|d| d.as_millis().to_string());
        if let Some(ms) = &ms {
            args.push(ms);
        }
        self.run(&args).await.map(|_| ())
    }

    fn out_of_bounds(&self, x: u32, y: u32) -> bool {
        outside_screen(self.screen_dimensions(), x, y)
    }
}

#[async_trait]
impl CommandChannel for AdbShell {
    async fn shell(&self, args: &[&str]) -> AdbResult<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.run(&full).await
    }

    fn shell_blocking(&self, args: &[&str]) -> AdbResult<String> {
        let mut full = vec!["shell"];
        full.extend_from_slice(args);
        self.run_blocking(&full)
    }
}
