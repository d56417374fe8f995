use super::cancel::CancelFlag;
use super::catalog::{self, ScriptVariant};
use super::dispatcher::ActionDispatcher;
use super::engine::{Engine, Timings};
use super::options::{CaptureMode, OptionMap, RunOptions};
use super::recovery::{
    AppRestart, ClockControl, DeviceClock, TargetClock, TimezoneScope, Unmanaged,
};
use super::state::RunOutcome;
use crate::adb::{AdbBackend, AdbImpl, CommandChannel};
use crate::bridge::{AnyBridge, AppiumBridge, AppiumConfig, AutomationBridge};
use crate::capture::{
    AnySource, BridgeFrameSource, CaptureManager, CaptureResult, WindowFrameSource,
    default_policy, open_window, resolve_window,
};
use crate::logging::RunLog;
use crate::matching::{TemplateMatcher, TemplateStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const FIRST_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BridgeKind {
    /// Drive the device through adb directly
    Adb,
    /// Open an Appium session on a local server
    Appium,
}

/// Everything needed to start one run from the command line.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub script: String,
    pub options: OptionMap,
    pub assets: PathBuf,
    pub adb_impl: AdbImpl,
    pub adb_path: PathBuf,
    pub device: Option<String>,
    pub bridge: BridgeKind,
    pub appium_url: String,
}

/// Where a resolved run looks for assets, how it paces itself and where it reports.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub assets: PathBuf,
    pub cancel: CancelFlag,
    pub log: RunLog,
    pub timings: Timings,
}

/// Resolve the script and its options, connect, run, release.
pub async fn run_script(request: RunRequest, cancel: CancelFlag, log: RunLog) -> RunOutcome {
    let Some(variant) = catalog::find(&request.script) else {
        return RunOutcome::failed_before_start(format!(
            "Unknown script '{}', see the 'scripts' command",
            request.script
        ));
    };
    let options = match RunOptions::resolve(&request.options, &variant) {
        Ok(options) => options,
        Err(e) => return RunOutcome::failed_before_start(e.to_string()),
    };

    let connected =
        AdbBackend::connect(request.adb_impl, &request.adb_path, request.device.as_deref()).await;
    let adb = match connected {
        Ok(adb) => Arc::new(adb),
        Err(e) => {
            return RunOutcome::failed_before_start(format!("Automation bridge unavailable: {e}"));
        }
    };
    log.line(format!("Connected to device {}", adb.serial()));

    let bridge = match request.bridge {
        BridgeKind::Adb => AnyBridge::Adb(adb.clone()),
        BridgeKind::Appium => {
            let mut config = AppiumConfig::new(
                adb.serial(),
                options.region.package(),
                &options.region.activity(),
            );
            config.server_url = request.appium_url.clone();
            match AppiumBridge::connect(&config).await {
                Ok(session) => AnyBridge::Appium(session),
                Err(e) => return RunOutcome::failed_before_start(e.to_string()),
            }
        }
    };

    let context = RunContext {
        assets: request.assets,
        cancel,
        log,
        timings: Timings::default(),
    };
    let clock: Arc<dyn CommandChannel> = adb;
    run_variant(Arc::new(bridge), Some(clock), variant, options, context).await
}

/// Run `variant` over an already open bridge. The bridge is quit exactly once
/// whatever the outcome; the capture loop and the device timezone are put back
/// before that.
pub async fn run_variant<B>(
    bridge: Arc<B>,
    clock: Option<Arc<dyn CommandChannel>>,
    variant: ScriptVariant,
    options: RunOptions,
    context: RunContext,
) -> RunOutcome
where
    B: AutomationBridge + 'static,
{
    let outcome = run_with_resources(&bridge, clock, variant, options, &context).await;
    if let Err(e) = bridge.quit().await {
        log::warn!("Closing the bridge session failed: {e}");
    }
    context.log.line(format!("Run {outcome}"));
    outcome
}

async fn run_with_resources<B>(
    bridge: &Arc<B>,
    clock: Option<Arc<dyn CommandChannel>>,
    variant: ScriptVariant,
    options: RunOptions,
    context: &RunContext,
) -> RunOutcome
where
    B: AutomationBridge + 'static,
{
    let shifts_clock = variant.shifts_clock();
    let device_clock = clock
        .filter(|_| variant.uses_clock() || shifts_clock)
        .map(DeviceClock::new);
    let scope = match device_clock.as_ref().filter(|_| variant.uses_clock()) {
        Some(clock) => match TimezoneScope::capture(clock.clone()).await {
            Ok(scope) => Some(scope),
            Err(e) => {
                log::warn!("Could not read the device timezone, it will not be restored: {e}");
                None
            }
        },
        None => None,
    };
    let clock_control: Box<dyn ClockControl> = match &device_clock {
        Some(clock) => Box::new(TargetClock::new(
            clock.clone(),
            options.target_timezone.clone(),
        )),
        None => Box::new(Unmanaged),
    };

    let mut manager = None;
    let window = options
        .window_title
        .as_deref()
        .filter(|_| options.capture == CaptureMode::Fast);
    let frames = match window {
        None => AnySource::Bridge(BridgeFrameSource::new(bridge.clone())),
        Some(title) => {
            let class = options.window_class.as_deref();
            match start_window_capture(title, class, &context.log).await {
                Ok((started, source)) => {
                    manager = Some(started);
                    AnySource::Window(source)
                }
                Err(e) => {
                    release_timezone(scope).await;
                    return RunOutcome::failed_before_start(format!(
                        "Window capture unavailable: {e}"
                    ));
                }
            }
        }
    };

    let replenisher = AppRestart::new(
        bridge.clone(),
        options.region.package(),
        options.region.activity(),
        context.cancel.clone(),
    );
    let matcher = TemplateMatcher::new(TemplateStore::new(&context.assets));
    let engine = Engine::new(
        variant,
        options,
        ActionDispatcher::new(bridge.clone()),
        frames,
        matcher,
        Box::new(replenisher),
    )
    .with_clock(clock_control)
    .with_cancel(context.cancel.clone())
    .with_log(context.log.clone())
    .with_timings(context.timings.clone());

    let outcome = engine.run().await;

    if let Some(mut manager) = manager {
        manager.stop();
    }
    if shifts_clock
        && let Some(clock) = &device_clock
        && let Err(e) = clock.resume_network_time().await
    {
        log::warn!("Could not switch network time back on: {e}");
    }
    release_timezone(scope).await;
    outcome
}

async fn release_timezone(scope: Option<TimezoneScope>) {
    if let Some(scope) = scope
        && let Err(e) = scope.restore().await
    {
        log::warn!("Could not restore the device timezone: {e}");
    }
}

/// Resolve the window once, start its capture loop and wait for the first frame.
async fn start_window_capture(
    title: &str,
    class: Option<&str>,
    log: &RunLog,
) -> CaptureResult<(CaptureManager, WindowFrameSource)> {
    let target = resolve_window(Some(title), class)?;
    let backend = open_window(&target)?;
    let mut manager = CaptureManager::new(target, backend, &default_policy, log.clone());
    manager.start();
    let source = WindowFrameSource::new(manager.reader());
    match source.wait_first_frame(FIRST_FRAME_TIMEOUT).await {
        Ok(_) => Ok((manager, source)),
        Err(e) => {
            manager.stop();
            Err(e)
        }
    }
}
