// src/settings.rs
//
// Persistent settings (TOML). Missing fields fall back to their defaults so
// older files keep loading.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::SettingsError;
use crate::io::serial::Parity;

const APP_DIR_NAME: &str = "wsns";
const DB_FILE_NAME: &str = "wsns.sqlite";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SerialSettings {
    #[serde(default)]
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default)]
    pub parity: Parity,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: Parity::None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WsnsSettings {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_export_dir")]
    pub export_dir: PathBuf,
    /// Seconds between commits of the open store transaction.
    /// Inserts inside this window are lost on a crash.
    #[serde(default = "default_commit_period_secs")]
    pub commit_period_secs: u64,
    #[serde(default = "default_live_capacity")]
    pub live_capacity: usize,
    #[serde(default)]
    pub file_logging: bool,
    #[serde(default)]
    pub serial: SerialSettings,
}

fn default_baud_rate() -> u32 {
    115_200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_commit_period_secs() -> u64 {
    10
}
fn default_live_capacity() -> usize {
    1024
}

fn data_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}
fn default_db_path() -> PathBuf {
    data_root().join(DB_FILE_NAME)
}
fn default_log_dir() -> PathBuf {
    data_root().join("log")
}
fn default_export_dir() -> PathBuf {
    dirs::document_dir()
        .unwrap_or_else(data_root)
        .join(APP_DIR_NAME)
}

impl Default for WsnsSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_dir: default_log_dir(),
            export_dir: default_export_dir(),
            commit_period_secs: default_commit_period_secs(),
            live_capacity: default_live_capacity(),
            file_logging: false,
            serial: SerialSettings::default(),
        }
    }
}

/// Default location of the settings file.
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join("settings.toml")
}

/// Load settings from `path`. On first run the defaults are written there.
pub fn load_settings(path: &Path) -> Result<WsnsSettings, SettingsError> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    } else {
        let settings = WsnsSettings::default();
        save_settings(path, &settings)?;
        tlog!("[settings] Created default settings at {:?}", path);
        Ok(settings)
    }
}

pub fn save_settings(path: &Path, settings: &WsnsSettings) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    initialize_directories(settings)?;

    let content = toml::to_string_pretty(settings)?;
    std::fs::write(path, content)?;
    Ok(())
}

fn initialize_directories(settings: &WsnsSettings) -> Result<(), std::io::Error> {
    if let Some(parent) = settings.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&settings.log_dir)?;
    std::fs::create_dir_all(&settings.export_dir)?;
    Ok(())
}
