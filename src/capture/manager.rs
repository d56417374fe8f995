use super::frame::Frame;
use super::method::{CaptureMethod, MethodPolicy};
use super::target::CaptureTarget;
use super::window::WindowCapture;
use crate::logging::RunLog;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Pause between successful grabs.
pub const DEFAULT_CADENCE: Duration = Duration::from_millis(10);
/// Extra pause after a failed grab.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Running,
}

struct Shared {
    latest: Mutex<Option<Frame>>,
    running: Mutex<bool>,
    wake: Condvar,
    invalidated: AtomicBool,
}

impl Shared {
    fn running(&self) -> MutexGuard<'_, bool> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_running(&self) -> bool {
        *self.running()
    }

    fn set_running(&self, value: bool) {
        *self.running() = value;
        self.wake.notify_all();
    }

    /// Sleep for `duration` unless the loop is asked to stop first.
    /// Returns whether the loop should keep going.
    fn pause(&self, duration: Duration) -> bool {
        let guard = self.running();
        let (guard, _) = self
            .wake
            .wait_timeout_while(guard, duration, |running| *running)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }

    fn publish(&self, frame: Frame) {
        *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(frame);
    }
}

/// Read side of a [`CaptureManager`]; cheap to clone and hand to frame sources.
#[derive(Clone)]
pub struct FrameReader {
    shared: Arc<Shared>,
}

impl FrameReader {
    /// Snapshot of the newest complete frame, if any has been captured.
    pub fn latest(&self) -> Option<Frame> {
        self.shared
            .latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The capture loop stopped because its window went away.
    pub fn is_invalidated(&self) -> bool {
        self.shared.invalidated.load(Ordering::Acquire)
    }
}

/// Background acquisition loop for one window target. One thread per manager;
/// `stop` joins it.
pub struct CaptureManager {
    target: CaptureTarget,
    method: CaptureMethod,
    backend: Arc<Mutex<Box<dyn WindowCapture>>>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    cadence: Duration,
    backoff: Duration,
    log: RunLog,
}

impl CaptureManager {
    /// The capture method is chosen here, once, from the target's title.
    pub fn new(
        target: CaptureTarget,
        backend: Box<dyn WindowCapture>,
        policy: &MethodPolicy,
        log: RunLog,
    ) -> Self {
        let method = policy(target.title());
        log::info!("Capturing {target} with {method}");
        Self {
            target,
            method,
            backend: Arc::new(Mutex::new(backend)),
            shared: Arc::new(Shared {
                latest: Mutex::new(None),
                running: Mutex::new(false),
                wake: Condvar::new(),
                invalidated: AtomicBool::new(false),
            }),
            worker: None,
            cadence: DEFAULT_CADENCE,
            backoff: DEFAULT_BACKOFF,
            log,
        }
    }

    pub fn with_timing(mut self, cadence: Duration, backoff: Duration) -> Self {
        self.cadence = cadence;
        self.backoff = backoff;
        self
    }

    pub fn method(&self) -> CaptureMethod {
        self.method
    }

    pub fn target(&self) -> &CaptureTarget {
        &self.target
    }

    pub fn state(&self) -> CaptureState {
        if self.shared.is_running() {
            CaptureState::Running
        } else {
            CaptureState::Stopped
        }
    }

    pub fn reader(&self) -> FrameReader {
        FrameReader {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn latest_frame(&self) -> Option<Frame> {
        self.reader().latest()
    }

    /// Start the loop. No-op while already running.
    pub fn start(&mut self) {
        if self.shared.is_running() {
            return;
        }
        // A loop that ended on its own (invalid handle) still needs reaping
        self.join_worker();
        self.shared.invalidated.store(false, Ordering::Release);
        self.shared.set_running(true);

        let shared = Arc::clone(&self.shared);
        let backend = Arc::clone(&self.backend);
        let method = self.method;
        let (cadence, backoff) = (self.cadence, self.backoff);
        let log = self.log.clone();
        let target = self.target.to_string();
        self.worker = Some(thread::spawn(move || {
            acquisition_loop(&shared, &backend, method, cadence, backoff, &log, &target);
        }));
    }

    /// Stop the loop and wait until its thread has exited.
    pub fn stop(&mut self) {
        self.shared.set_running(false);
        self.join_worker();
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            log::error!("Capture thread for {} panicked", self.target);
        }
    }
}

impl Drop for CaptureManager {
    fn drop(&mut self) {
        self.stop();
    }
}

fn acquisition_loop(
    shared: &Shared,
    backend: &Mutex<Box<dyn WindowCapture>>,
    method: CaptureMethod,
    cadence: Duration,
    backoff: Duration,
    log: &RunLog,
    target: &str,
) {
    let mut backend = backend.lock().unwrap_or_else(PoisonError::into_inner);
    while shared.is_running() {
        if !backend.is_alive() {
            shared.invalidated.store(true, Ordering::Release);
            shared.set_running(false);
            log::error!("Capture target {target} is no longer a live window");
            log.line(format!("Error: capture window {target} is gone, screen capture stopped"));
            break;
        }
        let pause = match backend.grab(method) {
            Some(pixels) => {
                shared.publish(Frame::new(pixels));
                cadence
            }
            None => backoff + cadence,
        };
        if !shared.pause(pause) {
            break;
        }
    }
    log::debug!("Capture loop for {target} exited");
}
