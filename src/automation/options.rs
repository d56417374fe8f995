use super::catalog::{Round, ScriptVariant};
use super::dispatcher::DEPLOYMENT_SLOTS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type OptionsResult<T> = Result<T, OptionsError>;

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("Options must be a JSON object: {0}")]
    NotAnObject(String),

    #[error("Malformed options JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Option override '{0}' is not in key=value form")]
    MalformedOverride(String),

    #[error("Option '{name}' has an invalid value {value}: {reason}")]
    InvalidValue {
        name: String,
        value: String,
        reason: String,
    },
}

/// One run option as supplied by the configuration collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<i64>),
    Text(String),
    /// Any other JSON shape; counts fall back to their defaults
    Other(serde_json::Value),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(true) => f.write_str("on"),
            OptionValue::Bool(false) => f.write_str("off"),
            OptionValue::Int(n) => write!(f, "{n}"),
            OptionValue::Float(n) => write!(f, "{n}"),
            OptionValue::List(items) => write!(f, "{items:?}"),
            OptionValue::Text(text) => f.write_str(text),
            OptionValue::Other(value) => write!(f, "{value}"),
        }
    }
}

pub type OptionMap = BTreeMap<String, OptionValue>;

/// A `null` entry counts as absent.
pub fn parse_options_json(text: &str) -> OptionsResult<OptionMap> {
    let entries = match serde_json::from_str(text)? {
        serde_json::Value::Object(entries) => entries,
        other => return Err(OptionsError::NotAnObject(other.to_string())),
    };
    entries
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| -> OptionsResult<(String, OptionValue)> {
            Ok((k, serde_json::from_value(v)?))
        })
        .collect()
}

/// `key=value` from the command line. Values are typed by shape: `true`/`false`,
/// integers, comma lists (optionally bracketed), anything else is text.
pub fn parse_override(raw: &str) -> OptionsResult<(String, OptionValue)> {
    let (key, value) = raw
        .split_once('=')
        .filter(|(k, _)| !k.trim().is_empty())
        .ok_or_else(|| OptionsError::MalformedOverride(raw.to_string()))?;
    let value = value.trim();
    let typed = match value {
        "true" => OptionValue::Bool(true),
        "false" => OptionValue::Bool(false),
        _ => {
            if let Ok(n) = value.parse::<i64>() {
                OptionValue::Int(n)
            } else if let Some(list) = parse_list(value) {
                OptionValue::List(list)
            } else {
                OptionValue::Text(value.to_string())
            }
        }
    };
    Ok((key.trim().to_string(), typed))
}

fn parse_list(value: &str) -> Option<Vec<i64>> {
    let inner = value.trim_start_matches('[').trim_end_matches(']');
    if !inner.contains(',') && inner == value {
        return None;
    }
    if inner.trim().is_empty() {
        return Some(Vec::new());
    }
    inner.split(',').map(|part| part.trim().parse().ok()).collect()
}

/// Game server. Decides the package, launch activity and asset folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Tw,
    Jp,
}

impl Region {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "tw" | "台服" => Some(Region::Tw),
            "jp" | "日服" => Some(Region::Jp),
            _ => None,
        }
    }

    pub fn package(self) -> &'static str {
        match self {
            Region::Tw => "jp.co.ponos.battlecatstw",
            Region::Jp => "jp.co.ponos.battlecats",
        }
    }

    pub fn activity(self) -> String {
        format!("{}.MyActivity", self.package())
    }

    pub fn folder(self) -> &'static str {
        match self {
            Region::Tw => "images_tw",
            Region::Jp => "images_jp",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Region::Tw => "tw",
            Region::Jp => "jp",
        })
    }
}

/// How frames reach the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Screenshots over the bridge
    Compat,
    /// Grabs of the emulator window; needs `window_title`
    Fast,
}

impl CaptureMode {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim().to_lowercase();
        match value.as_str() {
            "compat" | "兼容" => Some(CaptureMode::Compat),
            "fast" => Some(CaptureMode::Fast),
            _ if value.starts_with("高效") => Some(CaptureMode::Fast),
            _ => None,
        }
    }
}

impl fmt::Display for CaptureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CaptureMode::Compat => "compat",
            CaptureMode::Fast => "fast",
        })
    }
}

/// The validated slice of the option map a run consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub region: Region,
    /// 0 = unlimited
    pub max_loops: u32,
    pub refresh_power_enabled: bool,
    pub use_power_recover_enabled: bool,
    pub change_timezone_enabled: bool,
    pub enter_ex_stage_enabled: bool,
    pub collect_all_gold_enabled: bool,
    pub refresh_zombie_enabled: bool,
    pub kill_members_enabled: bool,
    pub long_roll_times: u32,
    /// Short scrolls tried while looking for a stage
    pub stage_search_scrolls: u32,
    pub position_order: Vec<usize>,
    pub target_timezone: Option<String>,
    /// Device clock advance per expedition round
    pub clock_step: Duration,
    pub capture: CaptureMode,
    pub window_title: Option<String>,
    pub window_class: Option<String>,
}

impl RunOptions {
    /// Validate `map` against `variant`'s defaults. Unparseable counts fall back to
    /// their documented defaults; malformed values of any other option are errors.
    pub fn resolve(map: &OptionMap, variant: &ScriptVariant) -> OptionsResult<Self> {
        let region = match map.get("server") {
            None => Region::Tw,
            Some(value @ OptionValue::Text(text)) => Region::parse(text)
                .ok_or_else(|| invalid("server", value, "expected tw or jp"))?,
            Some(other) => return Err(invalid("server", other, "expected tw or jp")),
        };
        let window_title = text(map, "window_title")?;
        let capture = capture_mode(map.get("run_mod"), window_title.is_some())?;
        let search_default = variant.entry.as_ref().map_or(0, |e| e.max_short_scrolls);
        let step_default = match &variant.round {
            Round::Claim(claim) => claim.clock_step,
            _ => Duration::ZERO,
        };
        let step_minutes = u32::try_from(step_default.as_secs() / 60).unwrap_or(u32::MAX);

        Ok(Self {
            region,
            max_loops: count(map.get("max_loops"), variant.default_max_loops, 0),
            refresh_power_enabled: toggle(map, "refresh_power_enabled", true)?,
            use_power_recover_enabled: toggle(map, "use_power_recover_enabled", false)?,
            change_timezone_enabled: toggle(map, "change_timezone_enabled", true)?,
            enter_ex_stage_enabled: toggle(map, "enter_ex_stage_enabled", true)?,
            collect_all_gold_enabled: toggle(map, "collect_all_gold_enabled", true)?,
            refresh_zombie_enabled: toggle(map, "refresh_zombie_enabled", true)?,
            kill_members_enabled: toggle(map, "kill_members_enabled", false)?,
            long_roll_times: count(
                map.get("long_roll_times"),
                variant.default_long_roll_times,
                variant.default_long_roll_times,
            ),
            stage_search_scrolls: count(map.get("max_times"), search_default, search_default),
            position_order: position_order(map.get("position_order"), &variant.default_order)?,
            target_timezone: text(map, "target_timezone")?,
            clock_step: Duration::from_secs(
                u64::from(count(map.get("clock_step_minutes"), step_minutes, step_minutes)) * 60,
            ),
            capture,
            window_title,
            window_class: text(map, "window_class")?,
        })
    }

    /// `refresh_power_enabled=on, ...` for the start banner.
    pub fn describe(&self) -> String {
        let onoff = |b: bool| if b { "on" } else { "off" };
        let mut parts = vec![
            format!("refresh_power={}", onoff(self.refresh_power_enabled)),
            format!("use_power_recover={}", onoff(self.use_power_recover_enabled)),
            format!("change_timezone={}", onoff(self.change_timezone_enabled)),
            format!("position_order={:?}", self.position_order),
        ];
        if let Some(tz) = &self.target_timezone {
            parts.push(format!("target_timezone={tz}"));
        }
        if let Some(title) = &self.window_title {
            parts.push(format!("window_title={title}"));
        }
        parts.push(format!("capture={}", self.capture));
        parts.join(", ")
    }
}

/// Absent: window grabs when a window is named. Fast without a window is an error.
fn capture_mode(value: Option<&OptionValue>, has_window: bool) -> OptionsResult<CaptureMode> {
    let mode = match value {
        None => {
            return Ok(if has_window {
                CaptureMode::Fast
            } else {
                CaptureMode::Compat
            });
        }
        Some(value @ OptionValue::Text(text)) => CaptureMode::parse(text)
            .ok_or_else(|| invalid("run_mod", value, "expected compat or fast"))?,
        Some(other) => return Err(invalid("run_mod", other, "expected compat or fast")),
    };
    if mode == CaptureMode::Fast && !has_window {
        return Err(OptionsError::InvalidValue {
            name: "run_mod".to_string(),
            value: mode.to_string(),
            reason: "fast capture needs window_title".to_string(),
        });
    }
    Ok(mode)
}

fn invalid(name: &str, value: &OptionValue, reason: &str) -> OptionsError {
    OptionsError::InvalidValue {
        name: name.to_string(),
        value: format!("{value:?}"),
        reason: reason.to_string(),
    }
}

/// Absent → `default`; present but not a non-negative integer → `fallback`.
fn count(value: Option<&OptionValue>, default: u32, fallback: u32) -> u32 {
    match value {
        None => default,
        Some(OptionValue::Int(n)) => u32::try_from(*n).unwrap_or(fallback),
        Some(OptionValue::Text(text)) => text.trim().parse::<u32>().unwrap_or(fallback),
        Some(_) => fallback,
    }
}

fn toggle(map: &OptionMap, name: &str, default: bool) -> OptionsResult<bool> {
    match map.get(name) {
        None => Ok(default),
        Some(OptionValue::Bool(b)) => Ok(*b),
        Some(OptionValue::Int(0)) => Ok(false),
        Some(OptionValue::Int(1)) => Ok(true),
        Some(value @ OptionValue::Text(text)) => match text.trim().to_lowercase().as_str() {
            "true" | "on" | "yes" | "1" => Ok(true),
            "false" | "off" | "no" | "0" => Ok(false),
            _ => Err(invalid(name, value, "expected a boolean")),
        },
        Some(other) => Err(invalid(name, other, "expected a boolean")),
    }
}

fn text(map: &OptionMap, name: &str) -> OptionsResult<Option<String>> {
    match map.get(name) {
        None => Ok(None),
        Some(OptionValue::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(OptionValue::Text(text)) => Ok(Some(text.trim().to_string())),
        Some(other) => Err(invalid(name, other, "expected text")),
    }
}

/// A non-list falls back to the variant default; a list with an index outside
/// the deployment table is rejected.
fn position_order(value: Option<&OptionValue>, default: &[usize]) -> OptionsResult<Vec<usize>> {
    let Some(OptionValue::List(items)) = value else {
        return Ok(default.to_vec());
    };
    items
        .iter()
        .map(|&i| {
            usize::try_from(i)
                .ok()
                .filter(|&i| i < DEPLOYMENT_SLOTS)
                .ok_or_else(|| {
                    invalid(
                        "position_order",
                        &OptionValue::List(items.clone()),
                        &format!("index {i} is outside 0..{DEPLOYMENT_SLOTS}"),
                    )
                })
        })
        .collect()
}
