//! Configuration file handling for the DRM agent.
//!
//! The agent is configured by a JSON file supplied by the host application.
//! The `licensing` section selects the license mode (metered by default,
//! node-locked when `nodelocked` is true), the `drm` section carries the
//! design clock frequency, and the optional `settings` section tunes retry
//! periods, timeouts, frequency detection and logging.

use crate::error::{DrmError, Result};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Licensing mode, fixed at construction from the configuration file.
///
/// The numeric code is what the web service expects in the `mode` field of
/// every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseMode {
    /// Floating/metered licensing: time-bounded licenses renewed by the
    /// background worker, usage evidence reported to the web service.
    Metered,
    /// Node-locked licensing: a single permanent license for this FPGA
    /// image, cached on disk.
    NodeLocked,
    /// No license installed.
    Idle,
}

impl LicenseMode {
    /// Wire encoding used in request payloads.
    pub fn code(self) -> u8 {
        match self {
            LicenseMode::Metered => 0,
            LicenseMode::NodeLocked => 1,
            LicenseMode::Idle => 2,
        }
    }
}

impl fmt::Display for LicenseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LicenseMode::Metered => "Floating/Metering",
            LicenseMode::NodeLocked => "Node-Locked",
            LicenseMode::Idle => "Idle",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Default long-tier retry delay in seconds.
pub const DEFAULT_WS_RETRY_PERIOD_LONG: u32 = 60;
/// Default short-tier retry delay in seconds.
pub const DEFAULT_WS_RETRY_PERIOD_SHORT: u32 = 2;
/// Default per-call web service deadline in seconds.
pub const DEFAULT_WS_REQUEST_TIMEOUT: u32 = 10;
/// Default frequency measurement window in milliseconds.
pub const DEFAULT_FREQUENCY_DETECTION_PERIOD: u32 = 100;
/// Default frequency deviation threshold in percent.
pub const DEFAULT_FREQUENCY_DETECTION_THRESHOLD: f64 = 2.0;
/// Default console verbosity (spdlog-style numeric level, 4 = error).
pub const DEFAULT_LOG_VERBOSITY: i32 = 4;
/// Default log file verbosity (2 = info).
pub const DEFAULT_LOG_FILE_VERBOSITY: i32 = 2;

fn default_ws_retry_period_long() -> u32 {
    DEFAULT_WS_RETRY_PERIOD_LONG
}
fn default_ws_retry_period_short() -> u32 {
    DEFAULT_WS_RETRY_PERIOD_SHORT
}
fn default_ws_request_timeout() -> u32 {
    DEFAULT_WS_REQUEST_TIMEOUT
}
fn default_frequency_detection_period() -> u32 {
    DEFAULT_FREQUENCY_DETECTION_PERIOD
}
fn default_frequency_detection_threshold() -> f64 {
    DEFAULT_FREQUENCY_DETECTION_THRESHOLD
}
fn default_log_verbosity() -> i32 {
    DEFAULT_LOG_VERBOSITY
}
fn default_log_file_verbosity() -> i32 {
    DEFAULT_LOG_FILE_VERBOSITY
}

/// Tunable settings from the optional `settings` section.
///
/// Retry periods and the request timeout may also be changed at runtime
/// through the parameter surface, with the same validation as here.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Long-tier retry delay (s), used while the deadline is still far away.
    #[serde(default = "default_ws_retry_period_long")]
    pub ws_retry_period_long: u32,

    /// Short-tier retry delay (s), used when the deadline is close.
    #[serde(default = "default_ws_retry_period_short")]
    pub ws_retry_period_short: u32,

    /// Deadline (s) for one web service round-trip during start/stop.
    #[serde(default = "default_ws_request_timeout")]
    pub ws_request_timeout: u32,

    /// Frequency measurement window (ms).
    #[serde(default = "default_frequency_detection_period")]
    pub frequency_detection_period: u32,

    /// Frequency deviation warning threshold (%).
    #[serde(default = "default_frequency_detection_threshold")]
    pub frequency_detection_threshold: f64,

    /// Console verbosity, spdlog-style: 0 trace .. 5 critical, 6 off.
    #[serde(default = "default_log_verbosity")]
    pub log_verbosity: i32,

    /// Log file verbosity, same scale as `log_verbosity`.
    #[serde(default = "default_log_file_verbosity")]
    pub log_file_verbosity: i32,

    /// Log file type: 0 none, 1 basic, 2 rotating (daily).
    #[serde(default)]
    pub log_file_type: u8,

    /// Log file path; required when `log_file_type` is non-zero.
    #[serde(default)]
    pub log_file_path: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ws_retry_period_long: DEFAULT_WS_RETRY_PERIOD_LONG,
            ws_retry_period_short: DEFAULT_WS_RETRY_PERIOD_SHORT,
            ws_request_timeout: DEFAULT_WS_REQUEST_TIMEOUT,
            frequency_detection_period: DEFAULT_FREQUENCY_DETECTION_PERIOD,
            frequency_detection_threshold: DEFAULT_FREQUENCY_DETECTION_THRESHOLD,
            log_verbosity: DEFAULT_LOG_VERBOSITY,
            log_file_verbosity: DEFAULT_LOG_FILE_VERBOSITY,
            log_file_type: 0,
            log_file_path: None,
        }
    }
}

// =============================================================================
// Configuration file
// =============================================================================

#[derive(Deserialize)]
struct ConfFile {
    licensing: LicensingSection,
    #[serde(default)]
    drm: Option<DrmSection>,
    #[serde(default)]
    design: Option<DesignSection>,
    #[serde(default)]
    settings: Option<Settings>,
}

#[derive(Deserialize)]
struct LicensingSection {
    #[serde(default)]
    nodelocked: bool,
    #[serde(default)]
    license_dir: Option<PathBuf>,
    #[serde(default)]
    url: Option<String>,
}

#[derive(Deserialize)]
struct DrmSection {
    frequency_mhz: i32,
}

#[derive(Deserialize)]
struct DesignSection {
    #[serde(default)]
    udid: Option<String>,
    #[serde(default, rename = "boardType")]
    board_type: Option<String>,
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// License mode requested by the configuration file.
    pub mode: LicenseMode,
    /// Design clock frequency in MHz (metered mode).
    pub frequency_mhz: i32,
    /// Directory holding node-locked artifacts (node-locked mode).
    pub license_dir: Option<PathBuf>,
    /// Base URL of the licensing web service.
    pub service_url: Option<String>,
    /// Optional user-supplied design identifier, forwarded to the service.
    pub udid: Option<String>,
    /// Optional board type, forwarded to the service.
    pub board_type: Option<String>,
    /// Tunable settings.
    pub settings: Settings,
}

impl Config {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DrmError::BadArgument(format!(
                "cannot read configuration file '{}': {e}",
                path.display()
            ))
        })?;
        let file: ConfFile = serde_json::from_str(&content).map_err(|e| {
            DrmError::BadFormat(format!(
                "error in configuration file '{}': {e}",
                path.display()
            ))
        })?;

        let (mode, frequency_mhz, license_dir) = if file.licensing.nodelocked {
            let dir = file.licensing.license_dir.ok_or_else(|| {
                DrmError::BadFormat(format!(
                    "error in configuration file '{}': 'licensing.license_dir' is required for node-locked licensing",
                    path.display()
                ))
            })?;
            (LicenseMode::NodeLocked, 0, Some(dir))
        } else {
            let drm = file.drm.ok_or_else(|| {
                DrmError::BadFormat(format!(
                    "error in configuration file '{}': 'drm.frequency_mhz' is required for metered licensing",
                    path.display()
                ))
            })?;
            (LicenseMode::Metered, drm.frequency_mhz, None)
        };

        let config = Config {
            mode,
            frequency_mhz,
            license_dir,
            service_url: file.licensing.url,
            udid: file.design.as_ref().and_then(|d| d.udid.clone()),
            board_type: file.design.as_ref().and_then(|d| d.board_type.clone()),
            settings: file.settings.unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants that must hold after construction.
    pub fn validate(&self) -> Result<()> {
        let s = &self.settings;
        if s.ws_request_timeout == 0 {
            return Err(DrmError::BadArgument(
                "ws_request_timeout must not be 0".to_string(),
            ));
        }
        if s.ws_retry_period_short == 0 {
            return Err(DrmError::BadArgument(
                "ws_retry_period_short must not be 0".to_string(),
            ));
        }
        if s.ws_retry_period_long <= s.ws_retry_period_short {
            return Err(DrmError::BadArgument(format!(
                "ws_retry_period_long ({}) must be greater than ws_retry_period_short ({})",
                s.ws_retry_period_long, s.ws_retry_period_short
            )));
        }
        if self.mode == LicenseMode::Metered && self.frequency_mhz < 1 {
            return Err(DrmError::BadArgument(format!(
                "drm.frequency_mhz ({}) must be a positive number of MHz",
                self.frequency_mhz
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_conf(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_metered_config_minimal() {
        let file = write_conf(r#"{"licensing": {}, "drm": {"frequency_mhz": 125}}"#);
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.mode, LicenseMode::Metered);
        assert_eq!(config.frequency_mhz, 125);
        assert_eq!(config.settings.ws_retry_period_long, 60);
        assert_eq!(config.settings.ws_retry_period_short, 2);
        assert_eq!(config.settings.ws_request_timeout, 10);
        assert_eq!(config.settings.frequency_detection_period, 100);
        assert!((config.settings.frequency_detection_threshold - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_nodelocked_config() {
        let file = write_conf(
            r#"{"licensing": {"nodelocked": true, "license_dir": "/tmp/licenses"}}"#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.mode, LicenseMode::NodeLocked);
        assert_eq!(config.license_dir.unwrap(), PathBuf::from("/tmp/licenses"));
    }

    #[test]
    fn test_nodelocked_requires_license_dir() {
        let file = write_conf(r#"{"licensing": {"nodelocked": true}}"#);
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, DrmError::BadFormat(_)));
        assert!(err.to_string().contains("license_dir"));
    }

    #[test]
    fn test_metered_requires_frequency() {
        let file = write_conf(r#"{"licensing": {}}"#);
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, DrmError::BadFormat(_)));
        assert!(err.to_string().contains("frequency_mhz"));
    }

    #[test]
    fn test_design_section() {
        let file = write_conf(
            r#"{"licensing": {}, "drm": {"frequency_mhz": 100},
                "design": {"udid": "u-1", "boardType": "vcu1525"}}"#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.udid.as_deref(), Some("u-1"));
        assert_eq!(config.board_type.as_deref(), Some("vcu1525"));
    }

    #[test]
    fn test_settings_overrides() {
        let file = write_conf(
            r#"{"licensing": {}, "drm": {"frequency_mhz": 100},
                "settings": {"ws_retry_period_long": 30, "ws_retry_period_short": 1,
                             "ws_request_timeout": 5}}"#,
        );
        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.settings.ws_retry_period_long, 30);
        assert_eq!(config.settings.ws_retry_period_short, 1);
        assert_eq!(config.settings.ws_request_timeout, 5);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let file = write_conf(
            r#"{"licensing": {}, "drm": {"frequency_mhz": 100},
                "settings": {"ws_request_timeout": 0}}"#,
        );
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, DrmError::BadArgument(_)));
        assert!(err.to_string().contains("ws_request_timeout"));
    }

    #[test]
    fn test_long_must_exceed_short() {
        let file = write_conf(
            r#"{"licensing": {}, "drm": {"frequency_mhz": 100},
                "settings": {"ws_retry_period_long": 2, "ws_retry_period_short": 2}}"#,
        );
        let err = Config::from_file(file.path()).unwrap_err();
        assert!(matches!(err, DrmError::BadArgument(_)));
    }

    #[test]
    fn test_malformed_json_is_bad_format() {
        let file = write_conf("{ not json");
        assert!(matches!(
            Config::from_file(file.path()),
            Err(DrmError::BadFormat(_))
        ));
    }

    #[test]
    fn test_license_mode_codes_and_display() {
        assert_eq!(LicenseMode::Metered.code(), 0);
        assert_eq!(LicenseMode::NodeLocked.code(), 1);
        assert_eq!(LicenseMode::Idle.code(), 2);
        assert_eq!(LicenseMode::Metered.to_string(), "Floating/Metering");
        assert_eq!(LicenseMode::NodeLocked.to_string(), "Node-Locked");
        assert_eq!(LicenseMode::Idle.to_string(), "Idle");
    }
}
