//! Parameter get/set surface of the session engine.
//!
//! Exposes session and hardware state (session id, license type and
//! duration, activator count, metering counter, token state, mailbox user
//! slots) plus the runtime-tunable settings. Setting a retry period or the
//! request timeout re-validates the same invariants as construction.

use crate::config::LicenseMode;
use crate::controller::mailbox::MailboxSlot;
use crate::error::{DrmError, Result};
use crate::session::DrmManager;
use serde_json::{json, Value};
use tracing::{debug, warn};

/// Keys accepted by [`DrmManager::get`] and [`DrmManager::set`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKey {
    /// Configured license type display string.
    LicenseType,
    /// Duration in seconds of the current license.
    LicenseDuration,
    /// Server-assigned session id, empty when no session is open.
    SessionId,
    /// Whether the controller reports a running session.
    SessionStatus,
    /// Whether a license is currently active on the controller.
    LicenseStatus,
    /// Metering counter extracted from the controller.
    MeteredData,
    /// Number of protected IP blocks detected by the controller.
    NumActivators,
    /// Current (possibly corrected) controller frequency in MHz.
    DrmFrequency,
    /// License type the controller itself reports.
    DrmLicenseType,
    FrequencyDetectionThreshold,
    FrequencyDetectionPeriod,
    /// Product information read from the read-only mailbox.
    ProductInfo,
    TokenString,
    TokenValidity,
    TokenTimeLeft,
    /// Size of the mailbox user area, in words.
    MailboxSize,
    /// Contents of the mailbox user area.
    MailboxData,
    /// The user custom-field mailbox slot.
    CustomField,
    WsRetryPeriodLong,
    WsRetryPeriodShort,
    WsRequestTimeout,
    /// Path of the node-locked license request file.
    NodelockedRequestFile,
    /// Names of every parameter key.
    ListAll,
}

impl ParameterKey {
    pub const ALL: &'static [ParameterKey] = &[
        ParameterKey::LicenseType,
        ParameterKey::LicenseDuration,
        ParameterKey::SessionId,
        ParameterKey::SessionStatus,
        ParameterKey::LicenseStatus,
        ParameterKey::MeteredData,
        ParameterKey::NumActivators,
        ParameterKey::DrmFrequency,
        ParameterKey::DrmLicenseType,
        ParameterKey::FrequencyDetectionThreshold,
        ParameterKey::FrequencyDetectionPeriod,
        ParameterKey::ProductInfo,
        ParameterKey::TokenString,
        ParameterKey::TokenValidity,
        ParameterKey::TokenTimeLeft,
        ParameterKey::MailboxSize,
        ParameterKey::MailboxData,
        ParameterKey::CustomField,
        ParameterKey::WsRetryPeriodLong,
        ParameterKey::WsRetryPeriodShort,
        ParameterKey::WsRequestTimeout,
        ParameterKey::NodelockedRequestFile,
        ParameterKey::ListAll,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ParameterKey::LicenseType => "license_type",
            ParameterKey::LicenseDuration => "license_duration",
            ParameterKey::SessionId => "session_id",
            ParameterKey::SessionStatus => "session_status",
            ParameterKey::LicenseStatus => "license_status",
            ParameterKey::MeteredData => "metered_data",
            ParameterKey::NumActivators => "num_activators",
            ParameterKey::DrmFrequency => "drm_frequency",
            ParameterKey::DrmLicenseType => "drm_license_type",
            ParameterKey::FrequencyDetectionThreshold => "frequency_detection_threshold",
            ParameterKey::FrequencyDetectionPeriod => "frequency_detection_period",
            ParameterKey::ProductInfo => "product_info",
            ParameterKey::TokenString => "token_string",
            ParameterKey::TokenValidity => "token_validity",
            ParameterKey::TokenTimeLeft => "token_time_left",
            ParameterKey::MailboxSize => "mailbox_size",
            ParameterKey::MailboxData => "mailbox_data",
            ParameterKey::CustomField => "custom_field",
            ParameterKey::WsRetryPeriodLong => "ws_retry_period_long",
            ParameterKey::WsRetryPeriodShort => "ws_retry_period_short",
            ParameterKey::WsRequestTimeout => "ws_request_timeout",
            ParameterKey::NodelockedRequestFile => "nodelocked_request_file",
            ParameterKey::ListAll => "list_all",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|key| key.name() == name)
            .ok_or_else(|| DrmError::BadArgument(format!("cannot find parameter: {name}")))
    }
}

fn value_as_u32(key: ParameterKey, value: &Value) -> Result<u32> {
    value
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| {
            DrmError::BadArgument(format!(
                "parameter '{}' requires an unsigned integer value",
                key.name()
            ))
        })
}

impl DrmManager {
    /// Read one parameter.
    pub fn get(&self, key: ParameterKey) -> Result<Value> {
        debug!(key = key.name(), "getting parameter");
        let inner = &self.inner;
        let value = match key {
            ParameterKey::LicenseType => json!(inner.mode.to_string()),
            ParameterKey::LicenseDuration => json!(inner.state.lock().license_duration),
            ParameterKey::SessionId => json!(inner.state.lock().session_id),
            ParameterKey::SessionStatus => json!(inner.controller.status_session_running()?),
            ParameterKey::LicenseStatus => json!(!inner.controller.status_timer_empty()?),
            ParameterKey::MeteredData => json!(self.metered_data()?),
            ParameterKey::NumActivators => json!(inner.controller.num_activators()?),
            ParameterKey::DrmFrequency => json!(inner.state.lock().frequency_curr),
            ParameterKey::DrmLicenseType => {
                // Both status bits in one controller transaction.
                let _lock = inner.controller.guard();
                let is_nodelocked = inner.controller.status_is_nodelocked()?;
                let is_metered = inner.controller.status_is_metered()?;
                let mode = if is_metered {
                    LicenseMode::Metered
                } else if is_nodelocked {
                    LicenseMode::NodeLocked
                } else {
                    LicenseMode::Idle
                };
                json!(mode.to_string())
            }
            ParameterKey::FrequencyDetectionThreshold => {
                json!(inner.settings.lock().frequency_detection_threshold)
            }
            ParameterKey::FrequencyDetectionPeriod => {
                json!(inner.settings.lock().frequency_detection_period)
            }
            ParameterKey::ProductInfo => inner.builder.product().clone(),
            ParameterKey::TokenString => json!(inner.service.token_string()),
            ParameterKey::TokenValidity => json!(inner.service.token_validity()),
            ParameterKey::TokenTimeLeft => json!(inner.service.token_time_left()),
            ParameterKey::MailboxSize => json!(inner.controller.mailbox_user_size()?),
            ParameterKey::MailboxData => {
                let _lock = inner.controller.guard();
                let size = inner.controller.mailbox_user_size()?;
                json!(inner
                    .controller
                    .read_mailbox_words(MailboxSlot::User.index(), size)?)
            }
            ParameterKey::CustomField => {
                json!(inner.controller.read_mailbox_word(MailboxSlot::CustomField.index())?)
            }
            ParameterKey::WsRetryPeriodLong => json!(inner.settings.lock().ws_retry_period_long),
            ParameterKey::WsRetryPeriodShort => json!(inner.settings.lock().ws_retry_period_short),
            ParameterKey::WsRequestTimeout => json!(inner.settings.lock().ws_request_timeout),
            ParameterKey::NodelockedRequestFile => match &inner.nodelocked {
                Some(store) => json!(store.request_path.display().to_string()),
                None => {
                    warn!("parameter only available with node-locked licensing");
                    json!("Not applicable")
                }
            },
            ParameterKey::ListAll => {
                json!(ParameterKey::ALL.iter().map(|k| k.name()).collect::<Vec<_>>())
            }
        };
        Ok(value)
    }

    /// Write one parameter.
    pub fn set(&self, key: ParameterKey, value: &Value) -> Result<()> {
        debug!(key = key.name(), %value, "setting parameter");
        let inner = &self.inner;
        match key {
            ParameterKey::FrequencyDetectionThreshold => {
                let threshold = value.as_f64().ok_or_else(|| {
                    DrmError::BadArgument(
                        "parameter 'frequency_detection_threshold' requires a number".to_string(),
                    )
                })?;
                inner.settings.lock().frequency_detection_threshold = threshold;
            }
            ParameterKey::FrequencyDetectionPeriod => {
                inner.settings.lock().frequency_detection_period = value_as_u32(key, value)?;
            }
            ParameterKey::CustomField => {
                inner
                    .controller
                    .write_mailbox_word(MailboxSlot::CustomField.index(), value_as_u32(key, value)?)?;
            }
            ParameterKey::MailboxData => {
                let array = value.as_array().ok_or_else(|| {
                    DrmError::BadArgument("value must be an array of integers".to_string())
                })?;
                let words = array
                    .iter()
                    .map(|v| value_as_u32(key, v))
                    .collect::<Result<Vec<_>>>()?;
                inner
                    .controller
                    .write_mailbox_words(MailboxSlot::User.index(), &words)?;
            }
            ParameterKey::WsRetryPeriodLong => {
                let period = value_as_u32(key, value)?;
                let mut settings = inner.settings.lock();
                if period <= settings.ws_retry_period_short {
                    return Err(DrmError::BadArgument(format!(
                        "ws_retry_period_long ({period}) must be greater than ws_retry_period_short ({})",
                        settings.ws_retry_period_short
                    )));
                }
                settings.ws_retry_period_long = period;
            }
            ParameterKey::WsRetryPeriodShort => {
                let period = value_as_u32(key, value)?;
                let mut settings = inner.settings.lock();
                if period == 0 {
                    return Err(DrmError::BadArgument(
                        "ws_retry_period_short must not be 0".to_string(),
                    ));
                }
                if settings.ws_retry_period_long <= period {
                    return Err(DrmError::BadArgument(format!(
                        "ws_retry_period_long ({}) must be greater than ws_retry_period_short ({period})",
                        settings.ws_retry_period_long
                    )));
                }
                settings.ws_retry_period_short = period;
            }
            ParameterKey::WsRequestTimeout => {
                let timeout = value_as_u32(key, value)?;
                if timeout == 0 {
                    return Err(DrmError::BadArgument(
                        "ws_request_timeout must not be 0".to_string(),
                    ));
                }
                inner.settings.lock().ws_request_timeout = timeout;
            }
            _ => {
                return Err(DrmError::BadArgument(format!(
                    "parameter '{}' cannot be overwritten",
                    key.name()
                )));
            }
        }
        Ok(())
    }

    /// Metering counter from the controller: hex characters 16..32 of the
    /// third metering record, while a license is active (always available in
    /// node-locked mode), 0 otherwise.
    fn metered_data(&self) -> Result<u64> {
        let inner = &self.inner;
        let _lock = inner.controller.guard();
        let active =
            inner.mode == LicenseMode::NodeLocked || !inner.controller.status_timer_empty()?;
        if !active {
            return Ok(0);
        }
        let extract = inner.controller.async_extract_metering()?;
        let record = extract.records.get(2).ok_or_else(|| {
            DrmError::Controller("metering file carries no usage record".to_string())
        })?;
        let span = record.get(16..32).ok_or_else(|| {
            DrmError::Controller("metering usage record is truncated".to_string())
        })?;
        u64::from_str_radix(span, 16).map_err(|_| {
            DrmError::Controller(format!(
                "could not convert string '{span}' to an unsigned integer"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Settings};
    use crate::controller::testing::{ScriptedDriver, ScriptedState};
    use crate::ws::testing::StubService;

    fn manager() -> DrmManager {
        let (driver, _) = ScriptedDriver::new(ScriptedState {
            rw_words: vec![0; 8],
            timer_counter: 1,
            ..ScriptedState::default()
        });
        DrmManager::with_service(
            Config {
                mode: LicenseMode::Metered,
                frequency_mhz: 125,
                license_dir: None,
                service_url: None,
                udid: None,
                board_type: None,
                settings: Settings::default(),
            },
            Box::new(driver),
            Box::new(StubService::default()),
            Box::new(|_| {}),
        )
        .unwrap()
    }

    #[test]
    fn test_key_names_roundtrip() {
        for key in ParameterKey::ALL {
            assert_eq!(ParameterKey::from_name(key.name()).unwrap(), *key);
        }
        assert!(ParameterKey::from_name("no_such_parameter").is_err());
    }

    #[test]
    fn test_get_static_parameters() {
        let m = manager();
        assert_eq!(m.get(ParameterKey::LicenseType).unwrap(), "Floating/Metering");
        assert_eq!(m.get(ParameterKey::SessionId).unwrap(), "");
        assert_eq!(m.get(ParameterKey::DrmFrequency).unwrap(), 125);
        assert_eq!(m.get(ParameterKey::NumActivators).unwrap(), 1);
        assert_eq!(m.get(ParameterKey::SessionStatus).unwrap(), false);
        assert_eq!(m.get(ParameterKey::WsRetryPeriodLong).unwrap(), 60);
        assert_eq!(m.get(ParameterKey::WsRetryPeriodShort).unwrap(), 2);
        assert_eq!(m.get(ParameterKey::WsRequestTimeout).unwrap(), 10);
        assert_eq!(
            m.get(ParameterKey::NodelockedRequestFile).unwrap(),
            "Not applicable"
        );
    }

    #[test]
    fn test_list_all_names_every_key() {
        let m = manager();
        let list = m.get(ParameterKey::ListAll).unwrap();
        assert_eq!(list.as_array().unwrap().len(), ParameterKey::ALL.len());
    }

    #[test]
    fn test_metered_data_parses_usage_record() {
        // The scripted metering record carries 0x42 in characters 16..32.
        let m = manager();
        assert_eq!(m.get(ParameterKey::MeteredData).unwrap(), 0x42);
    }

    #[test]
    fn test_custom_field_roundtrip() {
        let m = manager();
        m.set(ParameterKey::CustomField, &serde_json::json!(77)).unwrap();
        assert_eq!(m.get(ParameterKey::CustomField).unwrap(), 77);
    }

    #[test]
    fn test_mailbox_data_roundtrip() {
        let m = manager();
        assert_eq!(m.get(ParameterKey::MailboxSize).unwrap(), 6);
        m.set(ParameterKey::MailboxData, &serde_json::json!([1, 2, 3]))
            .unwrap();
        let data = m.get(ParameterKey::MailboxData).unwrap();
        assert_eq!(data.as_array().unwrap()[..3], [1, 2, 3].map(|v| serde_json::json!(v)));
    }

    #[test]
    fn test_mailbox_data_overflow_rejected() {
        let m = manager();
        let too_long: Vec<u32> = (0..7).collect();
        let err = m
            .set(ParameterKey::MailboxData, &serde_json::json!(too_long))
            .unwrap_err();
        assert!(matches!(err, DrmError::BadArgument(_)));
    }

    #[test]
    fn test_retry_period_validation_on_set() {
        let m = manager();
        // long must stay above short
        assert!(m.set(ParameterKey::WsRetryPeriodLong, &serde_json::json!(2)).is_err());
        m.set(ParameterKey::WsRetryPeriodLong, &serde_json::json!(30)).unwrap();
        assert!(m.set(ParameterKey::WsRetryPeriodShort, &serde_json::json!(30)).is_err());
        assert!(m.set(ParameterKey::WsRetryPeriodShort, &serde_json::json!(0)).is_err());
        m.set(ParameterKey::WsRetryPeriodShort, &serde_json::json!(5)).unwrap();
        assert_eq!(m.get(ParameterKey::WsRetryPeriodShort).unwrap(), 5);
    }

    #[test]
    fn test_request_timeout_must_be_positive() {
        let m = manager();
        assert!(m.set(ParameterKey::WsRequestTimeout, &serde_json::json!(0)).is_err());
        m.set(ParameterKey::WsRequestTimeout, &serde_json::json!(20)).unwrap();
        assert_eq!(m.get(ParameterKey::WsRequestTimeout).unwrap(), 20);
    }

    #[test]
    fn test_read_only_parameter_cannot_be_set() {
        let m = manager();
        let err = m.set(ParameterKey::SessionId, &serde_json::json!("S1")).unwrap_err();
        assert!(matches!(err, DrmError::BadArgument(_)));
        assert!(err.to_string().contains("cannot be overwritten"));
    }
}
