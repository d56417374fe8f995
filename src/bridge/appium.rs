use super::{AutomationBridge, BridgeError, BridgeResult};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use image::RgbImage;
use reqwest::{Client, Method};
use serde_json::{Value, json};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

pub const DEFAULT_APPIUM_URL: &str = "http://127.0.0.1:4723";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AppiumConfig {
    pub server_url: String,
    pub device_serial: String,
    pub package: String,
    pub activity: String,
    pub new_command_timeout: Duration,
}

impl AppiumConfig {
    pub fn new(device_serial: &str, package: &str, activity: &str) -> Self {
        Self {
            server_url: DEFAULT_APPIUM_URL.to_string(),
            device_serial: device_serial.to_string(),
            package: package.to_string(),
            activity: activity.to_string(),
            new_command_timeout: Duration::from_secs(3600),
        }
    }

    /// W3C new-session body. `noReset` keeps game data between sessions.
    pub fn capabilities(&self) -> Value {
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "platformName": "Android",
                    "appium:automationName": "UiAutomator2",
                    "appium:deviceName": self.device_serial,
                    "appium:udid": self.device_serial,
                    "appium:appPackage": self.package,
                    "appium:appActivity": self.activity,
                    "appium:noReset": true,
                    "appium:skipDeviceInitialization": true,
                    "appium:newCommandTimeout": self.new_command_timeout.as_secs(),
                },
                "firstMatch": [{}],
            }
        })
    }
}

/// W3C pointer action sequence for a single touch at (x, y).
pub fn tap_actions(x: u32, y: u32) -> Value {
    json!({
        "actions": [{
            "type": "pointer",
            "id": "finger1",
            "parameters": { "pointerType": "touch" },
            "actions": [
                { "type": "pointerMove", "duration": 0, "x": x, "y": y },
                { "type": "pointerDown", "button": 0 },
                { "type": "pause", "duration": 50 },
                { "type": "pointerUp", "button": 0 },
            ],
        }]
    })
}

/// W3C pointer action sequence for a drag from (x1, y1) to (x2, y2).
pub fn swipe_actions(x1: u32, y1: u32, x2: u32, y2: u32, duration: Duration) -> Value {
    json!({
        "actions": [{
            "type": "pointer",
            "id": "finger1",
            "parameters": { "pointerType": "touch" },
            "actions": [
                { "type": "pointerMove", "duration": 0, "x": x1, "y": y1 },
                { "type": "pointerDown", "button": 0 },
                {
                    "type": "pointerMove",
                    "duration": duration.as_millis() as u64,
                    "origin": "viewport",
                    "x": x2,
                    "y": y2
                },
                { "type": "pointerUp", "button": 0 },
            ],
        }]
    })
}

/// Pull the W3C error out of a response body, if there is one.
pub fn response_error(body: &Value) -> Option<String> {
    let value = body.get("value")?;
    let error = value.get("error")?.as_str()?;
    let message = value.get("message").and_then(Value::as_str).unwrap_or_default();
    Some(format!("{error}: {message}"))
}

/// A live Appium session. Created by [`AppiumBridge::connect`] and released by
/// [`AutomationBridge::quit`].
pub struct AppiumBridge {
    client: Client,
    base_url: String,
    session_id: Mutex<Option<String>>,
}

impl AppiumBridge {
    pub async fn connect(config: &AppiumConfig) -> BridgeResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let base_url = config.server_url.trim_end_matches('/').to_string();
        log::info!(
            "Opening Appium session at {base_url} for {} ({})",
            config.device_serial,
            config.package
        );
        let bridge = Self {
            client,
            base_url,
            session_id: Mutex::new(None),
        };
        let created = bridge
            .request(Method::POST, "/session", Some(config.capabilities()))
            .await?;
        let session_id = created
            .get("value")
            .and_then(|v| v.get("sessionId"))
            .or_else(|| created.get("sessionId"))
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Protocol {
                endpoint: "/session".to_string(),
                status: 200,
                message: "response carries no sessionId".to_string(),
            })?;
        log::debug!("Appium session {session_id}");
        *bridge
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(session_id.to_string());
        Ok(bridge)
    }

    fn session_path(&self, suffix: &str) -> BridgeResult<String> {
        let guard = self.session_id.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_deref() {
            Some(id) => Ok(format!("/session/{id}{suffix}")),
            None => Err(BridgeError::Unavailable {
                reason: "Appium session already closed".to_string(),
            }),
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> BridgeResult<Value> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self.client.request(method, &url);
        if let Some(body) = body {
            req = req.json(&body);
        }
        let response = req.send().await.map_err(|e| {
            if e.is_connect() {
                BridgeError::Unavailable {
                    reason: format!("cannot reach Appium at {}: {e}", self.base_url),
                }
            } else {
                BridgeError::Http(e)
            }
        })?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = response_error(&body).unwrap_or_else(|| body.to_string());
            // The server is up but the session is gone
            if status.as_u16() == 404 && message.starts_with("invalid session id") {
                return Err(BridgeError::Unavailable { reason: message });
            }
            return Err(BridgeError::Protocol {
                endpoint: path.to_string(),
                status: status.as_u16(),
                message,
            });
        }
        Ok(body)
    }

    async fn session_post(&self, suffix: &str, body: Value) -> BridgeResult<Value> {
        let path = self.session_path(suffix)?;
        self.request(Method::POST, &path, Some(body)).await
    }
}

impl AutomationBridge for AppiumBridge {
    async fn capture_frame(&self) -> BridgeResult<RgbImage> {
        let path = self.session_path("/screenshot")?;
        let body = self.request(Method::GET, &path, None).await?;
        let encoded = body
            .get("value")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::Screenshot("no base64 payload".to_string()))?;
        let png = STANDARD
            .decode(encoded.trim())
            .map_err(|e| BridgeError::Screenshot(e.to_string()))?;
        image::load_from_memory(&png)
            .map(|img| img.to_rgb8())
            .map_err(|e| BridgeError::Screenshot(e.to_string()))
    }

    async fn tap(&self, x: u32, y: u32) -> BridgeResult<()> {
        self.session_post("/actions", tap_actions(x, y)).await.map(|_| ())
    }

    async fn swipe(
        &self,
        x1: u32,
        y1: u32,
        x2: u32,
        y2: u32,
        duration: Duration,
    ) -> BridgeResult<()> {
        self.session_post("/actions", swipe_actions(x1, y1, x2, y2, duration))
            .await
            .map(|_| ())
    }

    async fn relaunch_app(&self, package: &str, _activity: &str) -> BridgeResult<()> {
        self.session_post("/appium/device/terminate_app", json!({ "appId": package }))
            .await?;
        self.session_post("/appium/device/activate_app", json!({ "appId": package }))
            .await?;
        Ok(())
    }

    async fn quit(&self) -> BridgeResult<()> {
        let id = self
            .session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(id) = id {
            self.request(Method::DELETE, &format!("/session/{id}"), None)
                .await?;
            log::info!("Appium session {id} closed");
        }
        Ok(())
    }
}
