use battlecats_adb_run::adb::{AdbBackend, CommandChannel};
use battlecats_adb_run::args::{Args, Command};
use battlecats_adb_run::automation::options::{parse_options_json, parse_override};
use battlecats_adb_run::automation::{
    CancelFlag, DeviceClock, OptionMap, RunRequest, RunStatus, catalog, run_script,
};
use battlecats_adb_run::capture::Frame;
use battlecats_adb_run::logging::RunLog;
use battlecats_adb_run::matching::{
    Matcher, TemplateKey, TemplateMatcher, TemplateStore, Threshold,
};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

fn main() -> ExitCode {
    let args = Args::parse();
    let default_filter = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();
    log::debug!(
        "Battle Cats ADB Run v{} (c) {}",
        env!("APP_VERSION_DISPLAY"),
        env!("APP_BUILD_YEAR")
    );

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("❌ Could not start the async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(dispatch(args)) {
        Ok(code) => code,
        Err(message) => {
            eprintln!("❌ {message}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(args: Args) -> Result<ExitCode, String> {
    match &args.command {
        Command::Devices { restart_server } => {
            if *restart_server {
                AdbBackend::restart_server(&args.adb_path)
                    .await
                    .map_err(|e| e.to_string())?;
                println!("🔄 adb server restarted");
            }
            let devices = AdbBackend::describe_devices(args.adb_impl, &args.adb_path)
                .await
                .map_err(|e| e.to_string())?;
            if devices.is_empty() {
                println!("No devices found");
            }
            for info in devices {
                println!("📱 {}  {}", info.serial, info.friendly_name());
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Screenshot { out } => {
            let device = connect(&args).await?;
            let image = device.screenshot().await.map_err(|e| e.to_string())?;
            image
                .save(out)
                .map_err(|e| format!("Write to {} failed: {e}", out.display()))?;
            println!(
                "✅ {}x{} screenshot of {} saved to {}",
                image.width(),
                image.height(),
                device.serial(),
                out.display()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Scripts => {
            for variant in catalog::all() {
                println!("{:<16} {:<22} {}", variant.id, variant.title, variant.description);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Run {
            script,
            options,
            overrides,
            timeout,
        } => {
            let mut map = match options {
                Some(path) => {
                    let text = tokio::fs::read_to_string(path)
                        .await
                        .map_err(|e| format!("Cannot read {}: {e}", path.display()))?;
                    parse_options_json(&text).map_err(|e| e.to_string())?
                }
                None => OptionMap::new(),
            };
            for raw in overrides {
                let (key, value) = parse_override(raw).map_err(|e| e.to_string())?;
                map.insert(key, value);
            }

            let cancel = CancelFlag::new();
            let on_ctrl_c = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("Ctrl-C received, stopping after the current step");
                    on_ctrl_c.cancel();
                }
            });
            if let Some(secs) = *timeout {
                let on_timeout = cancel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    log::info!("Timeout of {secs}s reached, stopping");
                    on_timeout.cancel();
                });
            }

            let request = RunRequest {
                script: script.clone(),
                options: map,
                assets: args.assets.clone(),
                adb_impl: args.adb_impl,
                adb_path: args.adb_path.clone(),
                device: args.device.clone(),
                bridge: args.bridge,
                appium_url: args.appium_url.clone(),
            };
            // Run lines reach the console through env_logger
            let outcome = run_script(request, cancel, RunLog::silent()).await;
            println!("{outcome}");
            Ok(match outcome.status {
                RunStatus::Completed | RunStatus::Stopped => ExitCode::SUCCESS,
                RunStatus::Failed => ExitCode::FAILURE,
            })
        }
        Command::Match {
            template,
            folder,
            threshold,
            region,
        } => {
            let device = connect(&args).await?;
            let frame = Frame::new(device.screenshot().await.map_err(|e| e.to_string())?);
            let matcher = TemplateMatcher::new(TemplateStore::new(&args.assets));
            let key = TemplateKey::new(template.as_str(), folder.as_str());
            let threshold = Threshold::new(*threshold);
            let result = matcher
                .find(&frame, &key, threshold, *region)
                .map_err(|e| e.to_string())?;
            match result.center() {
                Some((x, y)) => println!(
                    "✅ {key} found at ({x}, {y}) with confidence {:.3} (threshold {threshold})",
                    result.confidence()
                ),
                None => println!(
                    "❌ {key} not found, best confidence {:.3} (threshold {threshold})",
                    result.confidence()
                ),
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Timezone { set } => {
            let device = connect(&args).await?;
            let channel: Arc<dyn CommandChannel> = Arc::new(device);
            let clock = DeviceClock::new(channel);
            if let Some(timezone) = set {
                clock
                    .set_timezone(timezone)
                    .await
                    .map_err(|e| e.to_string())?;
            }
            let current = clock.current_timezone().await.map_err(|e| e.to_string())?;
            let offset = clock.utc_offset().await.map_err(|e| e.to_string())?;
            println!("🕒 {current} (UTC{offset})");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn connect(args: &Args) -> Result<AdbBackend, String> {
    let device = AdbBackend::connect(args.adb_impl, &args.adb_path, args.device.as_deref())
        .await
        .map_err(|e| e.to_string())?;
    let (w, h) = device.screen_dimensions();
    log::info!("📱 Device {} ({w}x{h})", device.serial());
    Ok(device)
}
