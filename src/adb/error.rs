use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A specialized `Result` type for device command channel operations.
pub type AdbResult<T> = Result<T, AdbError>;

/// The error type for everything that goes through `adb`, whether the external
/// binary or the in-process `adb_client` transport.
#[derive(Debug, Error)]
pub enum AdbError {
    #[error(
        "'adb' binary not found at {path:?}. \
         Install Android Platform Tools, pass --adb <path> or use --impl=rust."
    )]
    BinaryNotFound { path: PathBuf },

    #[error("Failed to invoke '{command}': {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("Command '{command}' failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("Could not parse output of '{command}': {output:?}")]
    Unparseable { command: String, output: String },

    #[error("No devices in 'device' state")]
    NoDevices,

    #[error("Device '{serial}' not found")]
    DeviceNotFound { serial: String },

    #[error("ADB server request failed: {source}")]
    Server {
        #[from]
        source: adb_client::RustADBError,
    },

    #[error("Shell command '{command}' failed: {source}")]
    ShellCommandFailed {
        command: String,
        source: adb_client::RustADBError,
    },

    #[error("Operation timed out after {duration:?}: {description}")]
    Timeout {
        duration: Duration,
        description: String,
    },

    #[error("Task failed to complete: {source}")]
    JoinError {
        #[from]
        source: tokio::task::JoinError,
    },

    #[error("Could not parse screen size from 'wm size' output.")]
    ScreenSizeParseFailed,

    #[error("Tap coordinates are out of bounds: x={x}, y={y}")]
    TapOutOfBounds { x: u32, y: u32 },

    #[error("Screen capture returned data that is not an image: {description}")]
    CaptureDecode { description: String },
}

impl AdbError {
    /// True when the device (or the adb transport to it) is gone, as opposed to a
    /// single command misbehaving.
    pub fn is_disconnect(&self) -> bool {
        match self {
            AdbError::BinaryNotFound { .. }
            | AdbError::NoDevices
            | AdbError::DeviceNotFound { .. }
            | AdbError::Server { .. } => true,
            AdbError::ShellCommandFailed { source, .. } => {
                let err_str = source.to_string();
                err_str.contains("CLSE")
                    || err_str.contains("no write endpoint")
                    || err_str.contains("Broken pipe")
            }
            AdbError::CommandFailed { output, .. } => {
                output.contains("device offline")
                    || output.contains("no devices/emulators found")
                    || (output.contains("device '") && output.contains("not found"))
            }
            _ => false,
        }
    }

    /// Wrap an `adb_client` shell failure, keeping the command for the message.
    pub fn shell(command: &[&str], source: adb_client::RustADBError) -> Self {
        AdbError::ShellCommandFailed {
            command: command.join(" "),
            source,
        }
    }
}
