use std::fmt;
use std::sync::Arc;

/// The run's status sink: one text line per call, no levels. Everything sent here
/// is mirrored to `log::info!` under target `run`.
#[derive(Clone)]
pub struct RunLog {
    sink: Arc<dyn Fn(&str) + Send + Sync>,
}

impl RunLog {
    pub fn new(sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Lines only reach the `log` facade.
    pub fn silent() -> Self {
        Self::new(|_| {})
    }

    pub fn line(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        log::info!(target: "run", "{message}");
        (self.sink)(message);
    }
}

impl fmt::Debug for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RunLog")
    }
}

impl Default for RunLog {
    fn default() -> Self {
        Self::silent()
    }
}
