//! Persistent configuration.
//!
//! Stored as JSON in `<config_dir>/breadbin/config.json`.  Loading never
//! fails: a missing or unparsable file falls back to defaults, and
//! unknown fields are ignored so old configs keep working.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cpu::JamMode;
use crate::drive::DriveModel;
use crate::machine::VideoStandard;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// IEC device number (8-11).
    pub device: u8,
    /// "1541", "1571", or "1581".
    pub model: String,
    /// Disk image to mount at power-on.
    pub image: Option<String>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            device: 8,
            model: "1541".to_string(),
            image: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding kernal/basic/chargen (and drive DOS) images.
    pub rom_dir: Option<String>,
    /// "ntsc" or "pal".
    pub video: String,
    /// Behaviour on an undefined opcode: "halt", "freeze", "nop".
    pub jam_mode: String,
    /// Drives to attach at power-on.
    pub drives: Vec<DriveConfig>,
    /// Program to inject after boot.
    pub autostart_prg: Option<String>,
    /// Trace categories to enable ("cpu", "pla", "iec", ...).
    pub trace: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rom_dir: None,
            video: "pal".to_string(),
            jam_mode: "freeze".to_string(),
            drives: vec![DriveConfig::default()],
            autostart_prg: None,
            trace: Vec::new(),
        }
    }
}

impl Config {
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|d| d.join("config.json"))
    }

    /// Load from disk, or return defaults if missing / invalid.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    log::warn!("config unreadable, using defaults: {e}");
                    Self::default()
                }
            },
            Err(e) => {
                log::warn!("cannot read config: {e}");
                Self::default()
            }
        }
    }

    /// Best-effort save; a failure is logged, never fatal.
    pub fn save(&self) {
        let Some(path) = Self::config_path() else {
            return;
        };
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(self) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    log::warn!("cannot save config: {e}");
                } else {
                    log::info!("config saved to {}", path.display());
                }
            }
            Err(e) => log::warn!("cannot serialize config: {e}"),
        }
    }

    pub fn video_standard(&self) -> VideoStandard {
        match self.video.to_ascii_lowercase().as_str() {
            "ntsc" => VideoStandard::Ntsc,
            _ => VideoStandard::Pal,
        }
    }

    pub fn jam_mode_policy(&self) -> JamMode {
        match self.jam_mode.to_ascii_lowercase().as_str() {
            "halt" => JamMode::Halt,
            "nop" => JamMode::NopCompat,
            _ => JamMode::FreezePC,
        }
    }

    pub fn drive_model(model: &str) -> Option<DriveModel> {
        match model {
            "1541" => Some(DriveModel::D1541),
            "1571" => Some(DriveModel::D1571),
            "1581" => Some(DriveModel::D1581),
            _ => None,
        }
    }
}

fn config_dir() -> Option<PathBuf> {
    if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg).join("breadbin"));
    }
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config").join("breadbin"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let c = Config::default();
        assert_eq!(c.video_standard(), VideoStandard::Pal);
        assert_eq!(c.jam_mode_policy(), JamMode::FreezePC);
        assert_eq!(c.drives.len(), 1);
        assert_eq!(c.drives[0].device, 8);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let json = r#"{"video":"ntsc","future_field":123}"#;
        let c: Config = serde_json::from_str(json).unwrap();
        assert_eq!(c.video_standard(), VideoStandard::Ntsc);
        assert_eq!(c.jam_mode, "freeze", "missing fields get defaults");
    }

    #[test]
    fn round_trip() {
        let mut c = Config::default();
        c.drives.push(DriveConfig {
            device: 9,
            model: "1581".to_string(),
            image: Some("demo.d81".to_string()),
        });
        let json = serde_json::to_string(&c).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.drives.len(), 2);
        assert_eq!(
            Config::drive_model(&back.drives[1].model),
            Some(DriveModel::D1581)
        );
    }
}
