pub mod adb;
pub mod args;
pub mod automation;
pub mod bridge;
pub mod capture;
pub mod logging;
pub mod matching;

pub use adb::AdbBackend;
pub use automation::{RunOutcome, RunStatus, run_script};
