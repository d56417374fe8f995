// Core device-channel types and traits
use super::error::AdbResult;
use async_trait::async_trait;
use serde::Serialize;

/// Emulator ports that are worth an `adb connect` before listing devices
/// (MuMu, Nox). LDPlayer registers itself as `emulator-55xx` on its own.
pub const WELL_KNOWN_EMULATOR_PORTS: [u16; 2] = [16384, 62001];

#[derive(Debug, PartialEq, Serialize, Clone)]
pub struct Device {
    pub serial: String,
    pub transport_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EmulatorFamily {
    LdPlayer,
    MuMu,
    Nox,
    Unknown,
}

impl EmulatorFamily {
    /// Guess the emulator family from `ro.product.model`, `ro.product.brand` and the serial.
    pub fn classify(model: &str, brand: &str, serial: &str) -> Self {
        let model = model.to_lowercase();
        if model.contains("leidian") || model.contains("ldplayer") {
            EmulatorFamily::LdPlayer
        } else if model.contains("mumu") || model.contains("netease") {
            EmulatorFamily::MuMu
        } else if model.contains("nox") {
            EmulatorFamily::Nox
        } else if brand.to_lowercase().contains("samsung") || serial.starts_with("127.0.0.1") {
            // MuMu reports itself as a Samsung handset and is reached over loopback
            EmulatorFamily::MuMu
        } else if serial.starts_with("emulator-") {
            EmulatorFamily::LdPlayer
        } else {
            EmulatorFamily::Unknown
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            EmulatorFamily::LdPlayer => "LDPlayer",
            EmulatorFamily::MuMu => "MuMu",
            EmulatorFamily::Nox => "Nox",
            EmulatorFamily::Unknown => "Unknown device",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub model: String,
    pub brand: String,
    pub android_version: String,
    pub family: EmulatorFamily,
}

impl DeviceInfo {
    pub fn friendly_name(&self) -> String {
        format!(
            "{} (model: {}) - Android {}",
            self.family.label(),
            self.model,
            self.android_version
        )
    }
}

/// Synchronous request/response access to a device shell. Implemented by both
/// adb backends; everything that only needs `shell ...` round trips (device clock,
/// property queries) goes through this.
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Run `adb shell <args...>` against the selected device and return stdout.
    async fn shell(&self, args: &[&str]) -> AdbResult<String>;

    /// Blocking variant for contexts that cannot await (drop guards).
    fn shell_blocking(&self, args: &[&str]) -> AdbResult<String>;

    async fn getprop(&self, name: &str) -> AdbResult<String> {
        Ok(self.shell(&["getprop", name]).await?.trim().to_string())
    }
}

/// True when (x, y) cannot lie on a `size` screen in either orientation.
/// `wm size` reports the portrait panel while games may run in landscape.
/// A zero size means it was never read and nothing is rejected.
pub fn outside_screen((width, height): (u32, u32), x: u32, y: u32) -> bool {
    if width == 0 || height == 0 {
        return false;
    }
    let (long, short) = (width.max(height), width.min(height));
    x.max(y) > long || x.min(y) > short
}

/// Parse `wm size` output. An override size (set with `wm size WxH`) wins over the
/// physical size, since input coordinates follow the override.
pub fn parse_screen_size(stdout: &str) -> Option<(u32, u32)> {
    let mut physical = None;
    for line in stdout.lines() {
        let line = line.trim();
        let (is_override, rest) = if let Some(rest) = line.strip_prefix("Override size:") {
            (true, rest)
        } else if let Some(rest) = line.strip_prefix("Physical size:") {
            (false, rest)
        } else {
            continue;
        };
        let parsed = rest
            .trim()
            .split_once('x')
            .and_then(|(w, h)| {
                Some((w.trim().parse::<u32>().ok()?, h.trim().parse::<u32>().ok()?))
            });
        match parsed {
            Some(size) if is_override => return Some(size),
            Some(size) => physical = Some(size),
            None => {}
        }
    }
    physical
}

/// Parse `adb devices -l`, keeping only entries in `device` state.
pub fn parse_devices(output: &str) -> Vec<Device> {
    output
        .lines()
        .filter(|line| !line.starts_with("List of devices") && !line.starts_with('*'))
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() >= 2 && parts[1] == "device" {
                let transport_id = parts
                    .iter()
                    .find_map(|part| part.strip_prefix("transport_id:"))
                    .map(str::to_string);
                Some(Device {
                    serial: parts[0].to_string(),
                    transport_id,
                })
            } else {
                None
            }
        })
        .collect()
}
