//! Daemon configuration
//!
//! A typed, immutable configuration loaded once at startup from a JSON
//! file. Hook commands are flat `<event>_command` / `<event>_args` keys;
//! anything unrecognized is an error rather than a silent no-op.
//!
//! The only environment variable consumed is `RUNTIME_DIRECTORY`, used as
//! the root for volatile state such as the PID file.

use crate::events::HOOK_KINDS;
use crate::thermal::LEVEL_COUNT;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Config file consulted when no path is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/wdhwd/wdhwd.json";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unrecognized option {0:?}")]
    UnknownOption(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

/// One notification hook: a command and its argument templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub command: String,
    pub args: Vec<String>,
}

/// Raw on-disk shape; durations in seconds, everything optional.
#[derive(Debug, Deserialize)]
#[serde(default)]
struct RawConfig {
    pmc_port: String,
    socket_path: String,
    socket_max_clients: usize,
    log_file: Option<String>,
    logging: String,
    lcd_intensity_normal: u8,
    lcd_intensity_dimmed: u8,
    lcd_dim_timeout: u64,
    fan_speed_normal: u8,
    fan_speed_increment: u8,
    fan_speed_decrement: u8,
    additional_drives: Vec<String>,
    user: String,
    group: String,
    disk_temp_command: String,
    poll_interval: u64,
    long_press_threshold: f64,
    hysteresis_band: f64,
    shutdown_grace: u64,
    subprocess_timeout: u64,
    temp_thresholds: [f64; LEVEL_COUNT],
    fan_duties: [u8; LEVEL_COUNT],
    auto_drive_power: bool,
    /// Hook keys (`<event>_command`, `<event>_args`) land here.
    #[serde(flatten)]
    extra: HashMap<String, JsonValue>,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self {
            pmc_port: "/dev/ttyS0".to_string(),
            socket_path: "/run/wdhwd/hws.sock".to_string(),
            socket_max_clients: 10,
            log_file: None,
            logging: "info,wdhwd=debug".to_string(),
            lcd_intensity_normal: 100,
            lcd_intensity_dimmed: 20,
            lcd_dim_timeout: 60,
            fan_speed_normal: 30,
            fan_speed_increment: 10,
            fan_speed_decrement: 5,
            additional_drives: Vec::new(),
            user: "wdhwd".to_string(),
            group: "wdhwd".to_string(),
            disk_temp_command: "/usr/sbin/disktemp".to_string(),
            poll_interval: 30,
            long_press_threshold: 1.0,
            hysteresis_band: 2.0,
            shutdown_grace: 60,
            subprocess_timeout: 30,
            temp_thresholds: [0.0, 30.0, 40.0, 50.0, 60.0, 65.0, 70.0, 75.0],
            fan_duties: [20, 30, 50, 70, 85, 99, 99, 99],
            auto_drive_power: true,
            extra: HashMap::new(),
        }
    }
}

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub pmc_port: PathBuf,
    pub socket_path: PathBuf,
    pub socket_max_clients: usize,
    pub log_file: Option<PathBuf>,
    /// Log filter directive, `tracing_subscriber::EnvFilter` syntax.
    pub logging: String,
    pub lcd_intensity_normal: u8,
    pub lcd_intensity_dimmed: u8,
    /// Zero disables dimming.
    pub lcd_dim_timeout: Duration,
    pub fan_speed_normal: u8,
    pub fan_speed_increment: u8,
    pub fan_speed_decrement: u8,
    pub additional_drives: Vec<String>,
    pub user: String,
    pub group: String,
    pub disk_temp_command: PathBuf,
    pub poll_interval: Duration,
    pub long_press_threshold: Duration,
    pub hysteresis_band: f64,
    pub shutdown_grace: Duration,
    pub subprocess_timeout: Duration,
    pub temp_thresholds: [f64; LEVEL_COUNT],
    pub fan_duties: [u8; LEVEL_COUNT],
    pub auto_drive_power: bool,
    pub hooks: HashMap<String, HookSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_raw(RawConfig::default()).expect("defaults are valid")
    }
}

impl Config {
    /// Load from `path`, or from the default location when none is given.
    /// A missing default file yields the built-in defaults; a missing
    /// explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => Self::from_json(&text),
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                Self::from_raw(RawConfig::default())
            }
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Self::from_raw(serde_json::from_str(text)?)
    }

    /// Root for volatile state (PID file), when the service manager
    /// provides one.
    pub fn runtime_directory() -> Option<PathBuf> {
        std::env::var_os("RUNTIME_DIRECTORY").map(PathBuf::from)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        if raw.socket_max_clients == 0 {
            return Err(ConfigError::InvalidValue {
                key: "socket_max_clients".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for (key, value) in [
            ("lcd_intensity_normal", raw.lcd_intensity_normal),
            ("lcd_intensity_dimmed", raw.lcd_intensity_dimmed),
        ] {
            if value > 100 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "intensity is a percentage".to_string(),
                });
            }
        }
        for (key, value) in [
            ("fan_speed_normal", raw.fan_speed_normal),
            ("fan_speed_increment", raw.fan_speed_increment),
            ("fan_speed_decrement", raw.fan_speed_decrement),
        ] {
            if value > 100 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    reason: "duty cycle is a percentage".to_string(),
                });
            }
        }
        if raw.fan_duties.iter().any(|d| *d > 100) {
            return Err(ConfigError::InvalidValue {
                key: "fan_duties".to_string(),
                reason: "duty cycle is a percentage".to_string(),
            });
        }
        if raw
            .temp_thresholds
            .windows(2)
            .any(|pair| pair[1] < pair[0])
        {
            return Err(ConfigError::InvalidValue {
                key: "temp_thresholds".to_string(),
                reason: "thresholds must be non-decreasing".to_string(),
            });
        }
        if raw.long_press_threshold <= 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "long_press_threshold".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let hooks = parse_hooks(&raw.extra)?;

        Ok(Self {
            pmc_port: PathBuf::from(raw.pmc_port),
            socket_path: PathBuf::from(raw.socket_path),
            socket_max_clients: raw.socket_max_clients,
            log_file: raw.log_file.map(PathBuf::from),
            logging: raw.logging,
            lcd_intensity_normal: raw.lcd_intensity_normal,
            lcd_intensity_dimmed: raw.lcd_intensity_dimmed,
            lcd_dim_timeout: Duration::from_secs(raw.lcd_dim_timeout),
            fan_speed_normal: raw.fan_speed_normal,
            fan_speed_increment: raw.fan_speed_increment,
            fan_speed_decrement: raw.fan_speed_decrement,
            additional_drives: raw.additional_drives,
            user: raw.user,
            group: raw.group,
            disk_temp_command: PathBuf::from(raw.disk_temp_command),
            poll_interval: Duration::from_secs(raw.poll_interval),
            long_press_threshold: Duration::from_secs_f64(raw.long_press_threshold),
            hysteresis_band: raw.hysteresis_band,
            shutdown_grace: Duration::from_secs(raw.shutdown_grace),
            subprocess_timeout: Duration::from_secs(raw.subprocess_timeout),
            temp_thresholds: raw.temp_thresholds,
            fan_duties: raw.fan_duties,
            auto_drive_power: raw.auto_drive_power,
            hooks,
        })
    }
}

/// Extract `<event>_command` / `<event>_args` pairs from the leftover keys.
fn parse_hooks(extra: &HashMap<String, JsonValue>) -> Result<HashMap<String, HookSpec>, ConfigError> {
    let mut commands: HashMap<String, String> = HashMap::new();
    let mut args: HashMap<String, Vec<String>> = HashMap::new();

    for (key, value) in extra {
        if let Some(kind) = key.strip_suffix("_command") {
            if !HOOK_KINDS.contains(&kind) {
                return Err(ConfigError::UnknownOption(key.clone()));
            }
            let command = value.as_str().ok_or_else(|| ConfigError::InvalidValue {
                key: key.clone(),
                reason: "expected a string".to_string(),
            })?;
            commands.insert(kind.to_string(), command.to_string());
        } else if let Some(kind) = key.strip_suffix("_args") {
            if !HOOK_KINDS.contains(&kind) {
                return Err(ConfigError::UnknownOption(key.clone()));
            }
            let list = value.as_array().ok_or_else(|| ConfigError::InvalidValue {
                key: key.clone(),
                reason: "expected an array of strings".to_string(),
            })?;
            let mut templates = Vec::with_capacity(list.len());
            for item in list {
                let s = item.as_str().ok_or_else(|| ConfigError::InvalidValue {
                    key: key.clone(),
                    reason: "expected an array of strings".to_string(),
                })?;
                templates.push(s.to_string());
            }
            args.insert(kind.to_string(), templates);
        } else {
            return Err(ConfigError::UnknownOption(key.clone()));
        }
    }

    for kind in args.keys() {
        if !commands.contains_key(kind) {
            return Err(ConfigError::InvalidValue {
                key: format!("{}_args", kind),
                reason: "arguments without a command".to_string(),
            });
        }
    }

    Ok(commands
        .into_iter()
        .map(|(kind, command)| {
            let args = args.get(&kind).cloned().unwrap_or_default();
            (kind, HookSpec { command, args })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.pmc_port, PathBuf::from("/dev/ttyS0"));
        assert_eq!(config.socket_max_clients, 10);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.long_press_threshold, Duration::from_secs(1));
        assert!(config.hooks.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let config = Config::from_json(
            r#"{
                "pmc_port": "/dev/ttyUSB0",
                "socket_path": "/tmp/hws.sock",
                "fan_speed_normal": 40,
                "additional_drives": ["/dev/sde"],
                "temperature_changed_command": "/usr/local/bin/on-temp",
                "temperature_changed_args": ["{old_level}", "{new_level}", "{monitor_data}"],
                "system_up_command": "/usr/local/bin/on-up"
            }"#,
        )
        .unwrap();

        assert_eq!(config.pmc_port, PathBuf::from("/dev/ttyUSB0"));
        assert_eq!(config.fan_speed_normal, 40);
        assert_eq!(config.additional_drives, vec!["/dev/sde"]);

        let hook = &config.hooks["temperature_changed"];
        assert_eq!(hook.command, "/usr/local/bin/on-temp");
        assert_eq!(hook.args.len(), 3);
        assert_eq!(config.hooks["system_up"].args, Vec::<String>::new());
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(matches!(
            Config::from_json(r#"{"fan_sped_normal": 40}"#),
            Err(ConfigError::UnknownOption(_))
        ));
    }

    #[test]
    fn test_unknown_hook_event_rejected() {
        assert!(matches!(
            Config::from_json(r#"{"coffee_ready_command": "/bin/true"}"#),
            Err(ConfigError::UnknownOption(_))
        ));
    }

    #[test]
    fn test_args_without_command_rejected() {
        assert!(matches!(
            Config::from_json(r#"{"system_up_args": ["a"]}"#),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_thresholds_must_ascend() {
        assert!(matches!(
            Config::from_json(r#"{"temp_thresholds": [0, 30, 40, 50, 45, 65, 70, 75]}"#),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_duty_over_hundred_rejected() {
        assert!(matches!(
            Config::from_json(r#"{"fan_speed_normal": 120}"#),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_dim_timeout_allowed() {
        let config = Config::from_json(r#"{"lcd_dim_timeout": 0}"#).unwrap();
        assert!(config.lcd_dim_timeout.is_zero());
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        assert!(matches!(
            Config::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
