//! License response validation and installation.
//!
//! Takes a license response from the web service, checks it against the
//! session, pushes the per-DNA key (and, metered only, the license timer)
//! into the controller, and verifies the controller switched to the
//! configured license mode.

use super::SessionState;
use crate::config::LicenseMode;
use crate::controller::DrmController;
use crate::error::{DrmError, Result};
use crate::json;
use serde_json::Value;
use tracing::{debug, warn};

struct ParsedLicense {
    session_id: String,
    key: String,
    /// Timer blob and duration; only present for metered licenses.
    metered: Option<(String, u32)>,
}

fn parse_license(license: &Value, dna: &str, mode: LicenseMode) -> Result<ParsedLicense> {
    let metering = json::required_object(license, "metering")?;
    let license_node = json::required_object(license, "license")?;
    let dna_node = json::required_object(license_node, dna)?;

    let session_id = json::required_str(metering, "sessionId")?.to_string();
    let key = json::required_str(dna_node, "key")?.to_string();
    let metered = if mode != LicenseMode::NodeLocked {
        let timer = json::required_str(dna_node, "licenseTimer")?.to_string();
        let timeout_second = json::required_u32(metering, "timeoutSecond")?;
        Some((timer, timeout_second))
    } else {
        None
    };

    Ok(ParsedLicense {
        session_id,
        key,
        metered,
    })
}

/// Install a license response into the controller.
///
/// The caller holds the session state lock; controller operations run as one
/// transaction under the controller guard.
pub(crate) fn install_license(
    controller: &DrmController,
    mode: LicenseMode,
    dna: &str,
    state: &mut SessionState,
    license: &Value,
) -> Result<()> {
    debug!("installing next license on the controller");

    let parsed = parse_license(license, dna, mode).map_err(|e| match e {
        DrmError::BadFormat(message) => DrmError::WebServiceResponse(format!(
            "malformed response from the license web service: {message}"
        )),
        other => other,
    })?;

    if state.session_id.is_empty() {
        debug!(session = %parsed.session_id, "saving session ID");
        state.session_id = parsed.session_id;
    } else if state.session_id != parsed.session_id {
        return Err(DrmError::Controller(format!(
            "session ID mismatch: received '{}' from the web service but expected '{}'",
            parsed.session_id, state.session_id
        )));
    }

    let _lock = controller.guard();

    let activation = controller.activate(&parsed.key)?;
    if activation.error_code != 0 {
        return Err(DrmError::Controller(format!(
            "failed to activate license on the controller, activation error 0x{:x}",
            activation.error_code
        )));
    }

    if let Some((timer, timeout_second)) = parsed.metered {
        if timeout_second == 0 {
            warn!("'timeoutSecond' field sent by the license web service must not be 0");
        }
        state.license_duration = timeout_second;
        let enabled = controller.load_timer(&timer)?;
        if !enabled {
            return Err(DrmError::Controller(
                "failed to load license timer on the controller".to_string(),
            ));
        }
        state.license_counter += 1;
        debug!(
            license = state.license_counter,
            session = %state.session_id,
            duration_secs = timeout_second,
            "license timer loaded"
        );
    }

    let is_nodelocked = controller.status_is_nodelocked()?;
    let is_metered = controller.status_is_metered()?;
    if is_nodelocked && is_metered {
        return Err(DrmError::Controller(
            "controller reports both node-locked and metering license modes".to_string(),
        ));
    }
    match mode {
        LicenseMode::NodeLocked => {
            if !is_nodelocked {
                return Err(DrmError::Controller(
                    "controller failed to switch to node-locked license mode".to_string(),
                ));
            }
            debug!("controller is in node-locked license mode");
        }
        _ => {
            if !is_metered {
                return Err(DrmError::Controller(
                    "controller failed to switch to metering license mode".to_string(),
                ));
            }
            debug!("controller is in metering license mode");
        }
    }
    Ok(())
}

/// Check that a license response belongs to the current session without
/// installing it (used for the `close` acknowledgement).
pub(crate) fn check_session_id_from_ws(state: &SessionState, license: &Value) -> Result<()> {
    let ws_session = license
        .get("metering")
        .and_then(|m| m.get("sessionId"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !state.session_id.is_empty() && state.session_id != ws_session {
        return Err(DrmError::Controller(format!(
            "session ID mismatch: received '{ws_session}' from the web service but expected '{}'",
            state.session_id
        )));
    }
    Ok(())
}
