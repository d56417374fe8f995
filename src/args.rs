use crate::adb::AdbImpl;
use crate::automation::BridgeKind;
use crate::bridge::appium::DEFAULT_APPIUM_URL;
use crate::matching::SearchRegion;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "battlecats-adb-run",
    version = env!("APP_VERSION_DISPLAY"),
    about = "🤖 Battle Cats automation over ADB / Appium"
)]
pub struct Args {
    /// Path to the adb binary (shell implementation only)
    #[arg(long = "adb", env = "ADB_PATH", default_value = "adb", global = true)]
    pub adb_path: PathBuf,

    /// ADB transport. The shell implementation requires the adb tool to be installed.
    #[arg(
        long = "impl",
        env = "ADB_IMPL",
        value_enum,
        default_value_t = AdbImpl::Rust,
        global = true
    )]
    pub adb_impl: AdbImpl,

    /// Device serial; the first device in 'device' state when omitted
    #[arg(long, short = 'd', global = true)]
    pub device: Option<String>,

    /// How scripts observe and drive the device
    #[arg(long, value_enum, default_value_t = BridgeKind::Adb, global = true)]
    pub bridge: BridgeKind,

    #[arg(long, default_value = DEFAULT_APPIUM_URL, global = true)]
    pub appium_url: String,

    /// Directory holding images_tw/ and images_jp/
    #[arg(long, default_value = ".", global = true)]
    pub assets: PathBuf,

    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List connected devices (connects known emulator ports first)
    Devices {
        /// Kill and restart the adb server before listing
        #[arg(long)]
        restart_server: bool,
    },
    /// Save one screenshot
    Screenshot {
        #[arg(long, short = 'o', default_value = "cli-screenshot.png")]
        out: PathBuf,
    },
    /// List the available scripts
    Scripts,
    /// Run a script until it completes, stops or fails
    Run {
        /// Script id, see 'scripts'
        script: String,
        /// JSON file with run options
        #[arg(long)]
        options: Option<PathBuf>,
        /// Override one option, e.g. --set max_loops=10 --set position_order=6,10,1
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,
        /// Stop the run after N seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
    /// Capture once and report how well a template matches
    Match {
        /// Template name relative to the region folder, e.g. legend/XP_1
        template: String,
        #[arg(long, default_value = "images_tw")]
        folder: String,
        /// Minimum confidence in [0, 1]; every check states its own
        #[arg(long)]
        threshold: f32,
        /// Only search x,y,width,height of the screen
        #[arg(long, value_parser = parse_region, value_name = "X,Y,W,H")]
        region: Option<SearchRegion>,
    },
    /// Show the device timezone, or change it
    Timezone {
        /// Olson id to switch to, e.g. Asia/Tokyo
        #[arg(long)]
        set: Option<String>,
    },
}

fn parse_region(raw: &str) -> Result<SearchRegion, String> {
    let parts = raw
        .split(',')
        .map(|p| p.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("'{raw}': {e}"))?;
    match parts[..] {
        [x, y, width, height] if width > 0 && height > 0 => {
            Ok(SearchRegion::new(x, y, width, height))
        }
        _ => Err(format!("'{raw}' is not x,y,width,height with a non-empty size")),
    }
}
