// ADB module - device command channel
// Two transports: the external `adb` binary (shell) and the adb server socket
// spoken in-process through adb_client (rust).

pub mod backend;
pub mod error;
pub mod rust_impl;
pub mod shell;
pub mod types;


pub use backend::{AdbBackend, AdbImpl};
pub use error::{AdbError, AdbResult};
pub use shell::AdbShell;
pub use types::{CommandChannel, Device, DeviceInfo, EmulatorFamily};
