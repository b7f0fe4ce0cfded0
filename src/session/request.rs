//! License request payloads.
//!
//! Every request is the cached header (hardware identity, product info,
//! agent version) plus phase-specific fields: a fresh challenge, the
//! metering evidence, the current frequency (metered only), and for
//! `running`/`close` the session id recovered from the metering records.

use crate::config::LicenseMode;
use crate::controller::driver::MeteringExtract;
use crate::controller::DesignInfo;
use crate::error::{DrmError, Result};
use crate::VERSION;
use serde_json::{json, Value};
use tracing::debug;

/// Number of hex characters of the first metering record carrying the
/// session id.
const SESSION_ID_LEN: usize = 16;

/// Builds the three license request payloads from the cached header.
#[derive(Debug)]
pub(crate) struct RequestBuilder {
    header: Value,
    mode: LicenseMode,
}

impl RequestBuilder {
    /// Build and cache the request header from the hardware identity.
    pub fn new(
        design: &DesignInfo,
        mode: LicenseMode,
        frequency_init: i32,
        udid: Option<&str>,
        board_type: Option<&str>,
    ) -> Result<Self> {
        let mut header = json!({});
        if let Some(udid) = udid {
            header["udid"] = json!(udid);
        }
        if let Some(board_type) = board_type {
            header["boardType"] = json!(board_type);
        }
        header["mode"] = json!(mode.code());
        if mode != LicenseMode::NodeLocked {
            header["drm_frequency_init"] = json!(frequency_init);
        }
        header["drmlibVersion"] = json!(VERSION);
        header["lgdnVersion"] = json!(design.version);
        header["dna"] = json!(design.dna);

        let mut vlnv_file = json!({});
        for (i, vlnv) in design.vlnvs.iter().enumerate() {
            if vlnv.len() < 16 || !vlnv.is_ascii() {
                return Err(DrmError::Controller(format!(
                    "unexpected VLNV identifier '{vlnv}'"
                )));
            }
            vlnv_file[i.to_string()] = json!({
                "vendor": format!("x{}", &vlnv[0..4]),
                "library": format!("x{}", &vlnv[4..8]),
                "name": format!("x{}", &vlnv[8..12]),
                "version": format!("x{}", &vlnv[12..16]),
            });
        }
        header["vlnvFile"] = vlnv_file;

        if let Some(product) = &design.product {
            header["product"] = serde_json::from_str(product).map_err(|e| {
                DrmError::BadFormat(format!(
                    "failed to parse read-only mailbox product information: {e}"
                ))
            })?;
        } else {
            debug!("no product information found in the controller mailbox");
        }

        Ok(Self { header, mode })
    }

    /// Product information parsed from the read-only mailbox.
    pub fn product(&self) -> &Value {
        self.header.get("product").unwrap_or(&Value::Null)
    }

    fn base(&self, extract: &MeteringExtract, frequency: Option<i32>) -> Value {
        let mut request = self.header.clone();
        request["saasChallenge"] = json!(extract.challenge);
        request["meteringFile"] = json!(extract.records.concat());
        if let Some(frequency) = frequency {
            request["drm_frequency"] = json!(frequency);
        }
        request
    }

    /// Request opening a new session. The caller resets its license counter.
    pub fn open(&self, extract: &MeteringExtract, frequency: Option<i32>) -> Value {
        debug!("building web request to create a new session");
        let mut request = self.base(extract, frequency);
        request["request"] = json!("open");
        request["mode"] = json!(self.mode.code());
        request
    }

    /// Request the next license of the current session.
    pub fn running(
        &self,
        extract: &MeteringExtract,
        frequency: Option<i32>,
        expected_session: &str,
    ) -> Result<Value> {
        debug!("building web request to maintain the current session");
        let session_id = session_id_from_records(&extract.records)?;
        check_session_id(expected_session, &session_id)?;
        let mut request = self.base(extract, frequency);
        request["sessionId"] = json!(session_id);
        request["request"] = json!("running");
        Ok(request)
    }

    /// Request closing the current session with its final metering.
    pub fn close(
        &self,
        extract: &MeteringExtract,
        frequency: Option<i32>,
        expected_session: &str,
    ) -> Result<Value> {
        debug!("building web request to stop the current session");
        let session_id = session_id_from_records(&extract.records)?;
        check_session_id(expected_session, &session_id)?;
        let mut request = self.base(extract, frequency);
        request["sessionId"] = json!(session_id);
        request["request"] = json!("close");
        Ok(request)
    }
}

/// Session id as reported by the controller: the first 16 hex characters of
/// the first metering record.
pub(crate) fn session_id_from_records(records: &[String]) -> Result<String> {
    records
        .first()
        .and_then(|record| record.get(..SESSION_ID_LEN))
        .map(str::to_string)
        .ok_or_else(|| {
            DrmError::Controller("metering file carries no session id record".to_string())
        })
}

fn check_session_id(expected: &str, from_controller: &str) -> Result<()> {
    if !expected.is_empty() && expected != from_controller {
        return Err(DrmError::Controller(format!(
            "session ID mismatch: controller gives '{from_controller}' but expected '{expected}'"
        )));
    }
    Ok(())
}
