use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{PilotError, PilotResult};

const CONFIG_FILE: &str = "config.toml";
const API_KEY_ENV: &str = "PHONE_PILOT_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub screenshot: ScreenshotConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    /// Display name -> package name, used by `Launch` and for reporting the foreground app.
    #[serde(default)]
    pub apps: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Falls back to env var PHONE_PILOT_API_KEY when absent.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    #[serde(default = "default_frequency_penalty")]
    pub frequency_penalty: f64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key: None,
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            top_p: default_top_p(),
            frequency_penalty: default_frequency_penalty(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> String {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
            .unwrap_or_default()
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/v1".into()
}

fn default_model() -> String {
    "autoglm-phone-9b".into()
}

fn default_max_tokens() -> u32 {
    3000
}

fn default_top_p() -> f64 {
    0.85
}

fn default_frequency_penalty() -> f64 {
    0.2
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    #[default]
    Shell,
    InProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShellKind {
    /// `adb [-s SERIAL] shell CMD` from a host machine.
    #[default]
    Adb,
    /// `sh -c CMD` (or `su -c`) when running on the device itself.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub shell: ShellKind,
    #[serde(default = "default_adb_path")]
    pub adb_path: String,
    #[serde(default)]
    pub serial: Option<String>,
    /// Program used by the local shell channel: "sh" or "su".
    #[serde(default = "default_local_shell")]
    pub local_shell: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            shell: ShellKind::default(),
            adb_path: default_adb_path(),
            serial: None,
            local_shell: default_local_shell(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

fn default_adb_path() -> String {
    "adb".into()
}

fn default_local_shell() -> String {
    "sh".into()
}

fn default_command_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotConfig {
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_max_height")]
    pub max_height: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// Largest base64 slice read back per shell round-trip.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_remote_path")]
    pub remote_path: String,
    /// Delay after hiding the overlay, when capture exclusion is unavailable.
    #[serde(default = "default_hide_settle")]
    pub hide_settle_ms: u64,
}

impl Default for ScreenshotConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            max_height: default_max_height(),
            jpeg_quality: default_jpeg_quality(),
            chunk_size: default_chunk_size(),
            remote_path: default_remote_path(),
            hide_settle_ms: default_hide_settle(),
        }
    }
}

fn default_max_width() -> u32 {
    720
}

fn default_max_height() -> u32 {
    1280
}

fn default_jpeg_quality() -> u8 {
    80
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_remote_path() -> String {
    "/data/local/tmp/phone_pilot_screen.png".into()
}

fn default_hide_settle() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_long_press")]
    pub long_press_ms: u64,
    /// Approve sensitive taps automatically when nobody listens for confirmations.
    #[serde(default)]
    pub auto_confirm_sensitive: bool,
    /// Pause between an action and the next screenshot so the UI can settle.
    #[serde(default = "default_step_delay")]
    pub step_delay_ms: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_consecutive_failures: default_max_failures(),
            long_press_ms: default_long_press(),
            auto_confirm_sensitive: false,
            step_delay_ms: default_step_delay(),
        }
    }
}

fn default_max_steps() -> u32 {
    100
}

fn default_max_failures() -> u32 {
    5
}

fn default_long_press() -> u64 {
    3000
}

fn default_step_delay() -> u64 {
    1000
}

fn resolve_config_path() -> Option<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join(CONFIG_FILE);
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Some(candidate);
            }
        }
    }

    if let Ok(cwd) = std::env::current_dir() {
        let candidate = cwd.join(CONFIG_FILE);
        if candidate.exists() {
            tracing::debug!(path = %candidate.display(), "config found in working directory");
            return Some(candidate);
        }
    }

    let candidate = dirs::config_dir()?.join("phone-pilot").join(CONFIG_FILE);
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in user config dir");
        return Some(candidate);
    }
    None
}

/// Load the config from `explicit`, or from the first well-known location.
/// Missing files yield the defaults; malformed files are an error.
pub fn load_config(explicit: Option<&Path>) -> PilotResult<AppConfig> {
    let path = match explicit {
        Some(p) if p.exists() => p.to_path_buf(),
        Some(p) => {
            return Err(PilotError::Config(format!(
                "config file {} does not exist",
                p.display()
            )))
        }
        None => match resolve_config_path() {
            Some(p) => p,
            None => {
                tracing::info!("no config.toml found, using defaults");
                return Ok(AppConfig::default());
            }
        },
    };
    load_config_from(&path)
}

pub fn load_config_from(path: &Path) -> PilotResult<AppConfig> {
    let content = std::fs::read_to_string(path)?;
    let config: AppConfig = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), model = %config.llm.model, "config loaded");
    Ok(config)
}

pub fn save_config(config: &AppConfig, path: &Path) -> PilotResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
