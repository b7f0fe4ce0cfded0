//! Web service client for the licensing backend.
//!
//! The agent talks to two endpoints: an OAuth2 token endpoint and a license
//! endpoint that exchanges a request payload for a license response. Both
//! sit behind the [`LicenseService`] trait so tests can inject a mock
//! service instead of a live HTTP stack.
//!
//! Failures are classified into [`DrmError::WebServiceRetryable`] (transport
//! errors and 408/429/5xx statuses, consumed by the retry engine) and
//! terminal [`DrmError::WebService`] errors (authentication and other 4xx).

use crate::error::{DrmError, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Margin subtracted from a token's validity before it is considered stale.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

/// Remote licensing service seen by the session engine.
pub trait LicenseService: Send + Sync {
    /// Ensure a valid bearer token is available, authenticating if needed.
    fn request_token(&self, deadline: Instant) -> Result<()>;

    /// Exchange a request payload for a license response.
    fn request_license(&self, request: &Value, deadline: Instant) -> Result<Value>;

    /// Current bearer token, empty if none was obtained yet.
    fn token_string(&self) -> String;

    /// Validity in seconds the token was granted with, 0 if none.
    fn token_validity(&self) -> u32;

    /// Seconds until the current token expires, 0 if none or expired.
    fn token_time_left(&self) -> u32;
}

/// OAuth2 client credentials, read from the credentials file.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    /// Load credentials from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            DrmError::BadArgument(format!(
                "cannot read credentials file '{}': {e}",
                path.display()
            ))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            DrmError::BadFormat(format!(
                "error in credentials file '{}': {e}",
                path.display()
            ))
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    validity: u32,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u32,
}

/// HTTP implementation of [`LicenseService`] over a blocking reqwest client.
pub struct WsClient {
    http: reqwest::blocking::Client,
    token_url: String,
    license_url: String,
    credentials: Credentials,
    token: Mutex<Option<CachedToken>>,
}

impl WsClient {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: &str, credentials: Credentials, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| DrmError::WebService(format!("failed to create HTTP client: {e}")))?;
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            http,
            token_url: format!("{base}/auth/token"),
            license_url: format!("{base}/license"),
            credentials,
            token: Mutex::new(None),
        })
    }

    fn bearer(&self) -> Result<String> {
        let token = self.token.lock();
        match &*token {
            Some(t) if t.expires_at > Instant::now() => Ok(t.value.clone()),
            _ => Err(DrmError::WebService(
                "license requested without a valid OAuth2 token".to_string(),
            )),
        }
    }
}

impl LicenseService for WsClient {
    fn request_token(&self, deadline: Instant) -> Result<()> {
        {
            let token = self.token.lock();
            if let Some(t) = &*token {
                let now = Instant::now();
                if t.expires_at > now + TOKEN_EXPIRY_MARGIN {
                    let time_left = t.expires_at.saturating_duration_since(now).as_secs();
                    debug!(time_left, "reusing cached OAuth2 token");
                    return Ok(());
                }
            }
        }

        debug!(url = %self.token_url, "requesting OAuth2 token");
        let response = self
            .http
            .post(&self.token_url)
            .timeout(remaining_before(deadline)?)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
            ])
            .send()
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| DrmError::WebServiceResponse(format!("failed to read token response: {e}")))?;
        if !status.is_success() {
            return Err(classify_status("Authentication", status.as_u16(), &body));
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            DrmError::WebServiceResponse(format!("malformed token response: {e}"))
        })?;
        debug!(validity = parsed.expires_in, "obtained OAuth2 token");
        *self.token.lock() = Some(CachedToken {
            value: parsed.access_token,
            validity: parsed.expires_in,
            expires_at: Instant::now() + Duration::from_secs(u64::from(parsed.expires_in)),
        });
        Ok(())
    }

    fn request_license(&self, request: &Value, deadline: Instant) -> Result<Value> {
        let bearer = self.bearer()?;
        debug!(url = %self.license_url, "posting license request");
        let response = self
            .http
            .post(&self.license_url)
            .timeout(remaining_before(deadline)?)
            .bearer_auth(bearer)
            .json(request)
            .send()
            .map_err(classify_transport)?;

        let status = response.status();
        let body = response.text().map_err(|e| {
            DrmError::WebServiceResponse(format!("failed to read license response: {e}"))
        })?;
        if !status.is_success() {
            warn!(status = status.as_u16(), "license request rejected");
            return Err(classify_status("License", status.as_u16(), &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| DrmError::WebServiceResponse(format!("malformed license response: {e}")))
    }

    fn token_string(&self) -> String {
        self.token
            .lock()
            .as_ref()
            .map(|t| t.value.clone())
            .unwrap_or_default()
    }

    fn token_validity(&self) -> u32 {
        self.token.lock().as_ref().map(|t| t.validity).unwrap_or(0)
    }

    fn token_time_left(&self) -> u32 {
        self.token
            .lock()
            .as_ref()
            .map(|t| t.expires_at.saturating_duration_since(Instant::now()).as_secs() as u32)
            .unwrap_or(0)
    }
}

/// Time budget left before `deadline`; an elapsed deadline is retryable so
/// the retry engine converts it into its timeout error.
fn remaining_before(deadline: Instant) -> Result<Duration> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return Err(DrmError::WebServiceRetryable(
            "request deadline already elapsed".to_string(),
        ));
    }
    Ok(remaining)
}

/// Transport-level failures (DNS, connect, timeout) are all transient.
fn classify_transport(error: reqwest::Error) -> DrmError {
    DrmError::WebServiceRetryable(format!("request failed: {error}"))
}

/// Map an HTTP error status to the retryable or terminal error kind.
fn classify_status(what: &str, status: u16, body: &str) -> DrmError {
    let detail = body_excerpt(body);
    match status {
        408 | 429 | 500..=599 => DrmError::WebServiceRetryable(format!(
            "{what} endpoint returned HTTP {status}: {detail}"
        )),
        401 | 403 => DrmError::WebService(format!(
            "{what} request was rejected (HTTP {status}): check the credentials file: {detail}"
        )),
        _ => DrmError::WebService(format!(
            "{what} endpoint returned HTTP {status}: {detail}"
        )),
    }
}

fn body_excerpt(body: &str) -> &str {
    let trimmed = body.trim();
    match trimmed.char_indices().nth(256) {
        Some((idx, _)) => &trimmed[..idx],
        None => trimmed,
    }
}
