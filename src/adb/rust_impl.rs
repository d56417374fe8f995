// https://crates.io/crates/adb_client
use super::error::{AdbError, AdbResult};
use super::types::{
    CommandChannel, Device, DeviceInfo, EmulatorFamily, WELL_KNOWN_EMULATOR_PORTS, outside_screen,
    parse_screen_size,
};
use adb_client::{ADBDeviceExt, ADBServer, ADBServerDevice, DeviceState};
use async_trait::async_trait;
use image::RgbImage;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const SHELL_TIMEOUT: Duration = Duration::from_secs(5);
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

/// Device command channel that talks to the adb server directly over its socket
/// protocol. `adb_client` is blocking, so every call runs on the blocking pool with
/// a timeout around it; a hung transport then surfaces as [`AdbError::Timeout`].
pub struct RustAdb {
    serial: String,
    server_device: Arc<Mutex<ADBServerDevice>>,
    screen_x: u32,
    screen_y: u32,
}

impl RustAdb {
    pub async fn list_devices() -> AdbResult<Vec<Device>> {
        let mut server = ADBServer::default();
        let device_list = tokio::task::spawn_blocking(move || server.devices()).await??;
        Ok(device_list
            .into_iter()
            .filter(|d| matches!(d.state, DeviceState::Device))
            .map(|d| Device {
                serial: d.identifier,
                transport_id: None,
            })
            .collect())
    }

    pub async fn connect_known_emulators() {
        for port in WELL_KNOWN_EMULATOR_PORTS {
            let address = SocketAddrV4::new(Ipv4Addr::LOCALHOST, port);
            let outcome = tokio::task::spawn_blocking(move || {
                let mut server = ADBServer::default();
                server.connect_device(address)
            })
            .await;
            match outcome {
                Ok(Ok(())) => log::info!("Connected to emulator at {address}"),
                Ok(Err(e)) => log::debug!("No emulator at {address}: {e}"),
                Err(e) => log::debug!("Connect task for {address} failed: {e}"),
            }
        }
    }

    /// Open `serial`, or the only attached device when `None`.
    pub async fn new_with_device(serial: Option<&str>) -> AdbResult<Self> {
        let requested = serial.map(str::to_string);
        let (serial, dev) = tokio::task::spawn_blocking(move || -> AdbResult<_> {
            let mut server = ADBServer::default();
            let serial = match requested {
                Some(serial) => serial,
                None => server
                    .devices()?
                    .into_iter()
                    .next()
                    .map(|d| d.identifier)
                    .ok_or(AdbError::NoDevices)?,
            };
            let dev = server
                .get_device_by_name(&serial)
                .map_err(|_| AdbError::DeviceNotFound {
                    serial: serial.clone(),
                })?;
            Ok((serial, dev))
        })
        .await??;

        let mut adb = RustAdb {
            serial,
            server_device: Arc::new(Mutex::new(dev)),
            screen_x: 0,
            screen_y: 0,
        };
        let size = adb.shell(&["wm", "size"]).await?;
        let (x, y) = parse_screen_size(&size).ok_or(AdbError::ScreenSizeParseFailed)?;
        adb.screen_x = x;
        adb.screen_y = y;
        Ok(adb)
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn screen_dimensions(&self) -> (u32, u32) {
        (self.screen_x, self.screen_y)
    }

    pub async fn describe_device(&self) -> DeviceInfo {
        let mut props = Vec::with_capacity(3);
        for name in ["ro.product.model", "ro.product.brand", "ro.build.version.release"] {
            props.push(self.getprop(name).await.unwrap_or_else(|e| {
                log::warn!("getprop {name} failed on {}: {e}", self.serial);
                String::new()
            }));
        }
        let android_version = props.pop().unwrap_or_default();
        let brand = props.pop().unwrap_or_default();
        let model = props.pop().unwrap_or_default();
        let family = EmulatorFamily::classify(&model, &brand, &self.serial);
        DeviceInfo {
            serial: self.serial.clone(),
            model,
            brand,
            android_version,
            family,
        }
    }

    fn run_shell_blocking(device: &Mutex<ADBServerDevice>, args: &[&str]) -> AdbResult<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();
        let mut dev = device.lock().unwrap_or_else(PoisonError::into_inner);
        dev.shell_command(args, &mut out)
            .map_err(|e| AdbError::shell(args, e))?;
        Ok(out)
    }

    async fn run_shell_owned(&self, args: Vec<String>, timeout: Duration) -> AdbResult<Vec<u8>> {
        let description = args.join(" ");
        let device = Arc::clone(&self.server_device);
        let task = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = args.iter().map(String::as_str).collect();
            Self::run_shell_blocking(&device, &refs)
        });
        match tokio::time::timeout(timeout, task).await {
            Ok(joined) => joined?,
            Err(_) => Err(AdbError::Timeout {
                duration: timeout,
                description,
            }),
        }
    }

    /// Grab the screen, preferring the framebuffer service and falling back to
    /// `screencap -p` when the framebuffer format is not understood.
    pub async fn screenshot(&self) -> AdbResult<RgbImage> {
        let device = Arc::clone(&self.server_device);
        let task = tokio::task::spawn_blocking(move || {
            let mut dev = device.lock().unwrap_or_else(PoisonError::into_inner);
            dev.framebuffer_bytes()
        });
        let framebuffer = match tokio::time::timeout(CAPTURE_TIMEOUT, task).await {
            Ok(joined) => joined?,
            Err(_) => {
                return Err(AdbError::Timeout {
                    duration: CAPTURE_TIMEOUT,
                    description: "framebuffer capture".to_string(),
                });
            }
        };
        match framebuffer
            .map_err(AdbError::from)
            .and_then(|data| decode_framebuffer(&data, self.screen_x, self.screen_y))
        {
            Ok(image) => Ok(image),
            Err(e) => {
                log::debug!("Framebuffer capture unusable ({e}), falling back to screencap");
                let png = self
                    .run_shell_owned(vec!["screencap".into(), "-p".into()], CAPTURE_TIMEOUT)
                    .await?;
                decode_encoded(&png)
            }
        }
    }

    pub async fn tap(&self, x: u32, y: u32) -> AdbResult<()> {
        if outside_screen(self.screen_dimensions(), x, y) {
            return Err(AdbError::TapOutOfBounds { x, y });
        }
        let args = vec!["input".into(), "tap".into(), x.to_string(), y.to_string()];
        self.run_shell_owned(args, SHELL_TIMEOUT).await.map(|_| ())
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
            if outside_screen(self.screen_dimensions(), x, y) {
                return Err(AdbError::TapOutOfBounds { x, y });
            }
        }
        let mut args: Vec<String> = vec!["input".into(), "swipe".into()];
        args.extend([x1, y1, x2, y2].map(|v| v.to_string()));
        if let Some(d) = duration {
            args.push(d.as_millis().to_string());
        }
        let timeout = SHELL_TIMEOUT + duration.unwrap_or_default();
        self.run_shell_owned(args, timeout).await.map(|_| ())
    }
}

#[async_trait]
impl CommandChannel for RustAdb {
    async fn shell(&self, args: &[&str]) -> AdbResult<String> {
        let owned = args.iter().map(|a| a.to_string()).collect();
        let out = self.run_shell_owned(owned, SHELL_TIMEOUT).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    fn shell_blocking(&self, args: &[&str]) -> AdbResult<String> {
        let out = Self::run_shell_blocking(&self.server_device, args)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

/// Decode a PNG/JPEG capture into RGB.
pub fn decode_encoded(data: &[u8]) -> AdbResult<RgbImage> {
    image::load_from_memory(data)
        .map(|img| img.to_rgb8())
        .map_err(|e| AdbError::CaptureDecode {
            description: e.to_string(),
        })
}

/// Decode framebuffer service output. Newer servers hand back an encoded image;
/// older ones return raw RGBA, RGB or RGB565 pixels, possibly behind a header.
pub fn decode_framebuffer(data: &[u8], width: u32, height: u32) -> AdbResult<RgbImage> {
    if data.starts_with(b"\x89PNG\r\n\x1a\n") || data.starts_with(&[0xFF, 0xD8]) {
        return decode_encoded(data);
    }
    let pixel_count = (width as usize) * (height as usize);
    let bad_size = || AdbError::CaptureDecode {
        description: format!(
            "{} bytes for {width}x{height} ({:.2} bytes/pixel)",
            data.len(),
            data.len() as f64 / pixel_count.max(1) as f64
        ),
    };
    if pixel_count == 0 {
        return Err(bad_size());
    }

    let rgb = if data.len() >= pixel_count * 4 {
        // Header precedes the pixels, so take the tail
        let raw = &data[data.len() - pixel_count * 4..];
        raw.chunks_exact(4).flat_map(|p| [p[0], p[1], p[2]]).collect()
    } else if data.len() >= pixel_count * 3 {
        data[data.len() - pixel_count * 3..].to_vec()
    } else if data.len() >= pixel_count * 2 {
        data[data.len() - pixel_count * 2..]
            .chunks_exact(2)
            .flat_map(|chunk| {
                let pixel = u16::from_le_bytes([chunk[0], chunk[1]]);
                let r = ((pixel >> 11) & 0x1F) as u8;
                let g = ((pixel >> 5) & 0x3F) as u8;
                let b = (pixel & 0x1F) as u8;
                [(r << 3) | (r >> 2), (g << 2) | (g >> 4), (b << 3) | (b >> 2)]
            })
            .collect()
    } else {
        return Err(bad_size());
    };
    RgbImage::from_raw(width, height, rgb).ok_or_else(bad_size)
}
