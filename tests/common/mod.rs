//! Shared test doubles: a simulated licensing controller whose timer
//! counter decrements in real time, and a scripted licensing service.
#![allow(dead_code)]

use drm_agent::controller::driver::{
    ActivationResult, ControllerDriver, DriverResult, MailboxImage, MeteringExtract,
};
use drm_agent::ws::LicenseService;
use drm_agent::{Config, DrmError, LicenseMode, Result, Settings};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

pub const DNA: &str = "DEADBEEF";
pub const SESSION: &str = "0123456789ABCDEF";

// =============================================================================
// Simulated controller
// =============================================================================

pub struct ControllerModel {
    pub version: String,
    pub vlnvs: Vec<String>,
    pub rw_words: Vec<u32>,
    pub session_running: bool,
    pub metering_mode: bool,
    pub nodelock_mode: bool,
    /// Whether the simulated FPGA image carries a node-locked controller.
    pub nodelock_image: bool,
    pub timer_loaded: bool,
    /// Simulated clock the timer counter decrements at.
    pub freq_hz: u64,
    /// License period a timer install grants, in seconds.
    pub license_seconds: u64,
    /// Ticks loaded by the last license timer install.
    pub timer_ticks: u64,
    pub timer_loaded_at: Option<Instant>,
    pub activation_error: u8,
}

impl Default for ControllerModel {
    fn default() -> Self {
        Self {
            version: "00030100".to_string(),
            vlnvs: vec!["1122334455667788".to_string()],
            rw_words: vec![0; 8],
            session_running: false,
            metering_mode: false,
            nodelock_mode: false,
            nodelock_image: false,
            timer_loaded: false,
            freq_hz: 125_000_000,
            license_seconds: 30,
            timer_ticks: 0,
            timer_loaded_at: None,
            activation_error: 0,
        }
    }
}

impl ControllerModel {
    fn counter(&self) -> u64 {
        match self.timer_loaded_at {
            Some(loaded_at) => {
                let burned = (loaded_at.elapsed().as_secs_f64() * self.freq_hz as f64) as u64;
                self.timer_ticks.saturating_sub(burned)
            }
            None => 0,
        }
    }

    /// Free the license timer init slot, as the hardware does when the
    /// current license period rolls over.
    pub fn free_timer_slot(&mut self) {
        self.timer_loaded = false;
    }
}

pub struct SimulatedController {
    pub model: Arc<Mutex<ControllerModel>>,
}

impl SimulatedController {
    pub fn new(model: ControllerModel) -> (Self, Arc<Mutex<ControllerModel>>) {
        let model = Arc::new(Mutex::new(model));
        (
            Self {
                model: Arc::clone(&model),
            },
            model,
        )
    }

    fn extract(&self) -> MeteringExtract {
        MeteringExtract {
            detected_ips: 1,
            challenge: "CHALLENGE".to_string(),
            records: vec![
                format!("{SESSION}0000000000000000"),
                "0000".to_string(),
                "00000000000000000000000000000007".to_string(),
            ],
        }
    }
}

impl ControllerDriver for SimulatedController {
    fn select_registers_page(&self) -> DriverResult<()> {
        Ok(())
    }
    fn select_mailbox_page(&self) -> DriverResult<()> {
        Ok(())
    }
    fn extract_version(&self) -> DriverResult<String> {
        Ok(self.model.lock().version.clone())
    }
    fn extract_dna(&self) -> DriverResult<String> {
        Ok(DNA.to_string())
    }
    fn extract_vlnvs(&self) -> DriverResult<Vec<String>> {
        Ok(self.model.lock().vlnvs.clone())
    }
    fn read_mailbox(&self) -> DriverResult<MailboxImage> {
        let model = self.model.lock();
        Ok(MailboxImage {
            ro_size: 0,
            rw_size: model.rw_words.len() as u32,
            ro_words: Vec::new(),
            rw_words: model.rw_words.clone(),
        })
    }
    fn write_mailbox(&self, words: &[u32]) -> DriverResult<()> {
        self.model.lock().rw_words = words.to_vec();
        Ok(())
    }
    fn initialization(&self) -> DriverResult<MeteringExtract> {
        self.model.lock().session_running = true;
        Ok(self.extract())
    }
    fn extract_metering_async(&self) -> DriverResult<MeteringExtract> {
        Ok(self.extract())
    }
    fn extract_metering_sync(&self) -> DriverResult<MeteringExtract> {
        Ok(self.extract())
    }
    fn end_session_extract_metering(&self) -> DriverResult<MeteringExtract> {
        let mut model = self.model.lock();
        model.session_running = false;
        model.timer_loaded = false;
        model.timer_loaded_at = None;
        Ok(self.extract())
    }
    fn activate(&self, _key: &str) -> DriverResult<ActivationResult> {
        let mut model = self.model.lock();
        if model.nodelock_image {
            model.nodelock_mode = true;
        } else {
            model.metering_mode = true;
        }
        Ok(ActivationResult {
            done: true,
            error_code: model.activation_error,
        })
    }
    fn load_license_timer(&self, _timer: &str) -> DriverResult<bool> {
        let mut model = self.model.lock();
        model.timer_loaded = true;
        model.timer_ticks = model.license_seconds * model.freq_hz;
        model.timer_loaded_at = Some(Instant::now());
        Ok(true)
    }
    fn sample_timer_counter(&self) -> DriverResult<u64> {
        Ok(self.model.lock().counter())
    }
    fn session_running(&self) -> DriverResult<bool> {
        Ok(self.model.lock().session_running)
    }
    fn license_metering_mode(&self) -> DriverResult<bool> {
        Ok(self.model.lock().metering_mode)
    }
    fn license_nodelock_mode(&self) -> DriverResult<bool> {
        Ok(self.model.lock().nodelock_mode)
    }
    fn timer_init_loaded(&self) -> DriverResult<bool> {
        Ok(self.model.lock().timer_loaded)
    }
    fn timer_count_empty(&self) -> DriverResult<bool> {
        Ok(self.model.lock().counter() == 0)
    }
    fn detected_ip_count(&self) -> DriverResult<u32> {
        Ok(self.model.lock().vlnvs.len() as u32)
    }
}

// =============================================================================
// Scripted licensing service
// =============================================================================

#[derive(Default)]
pub struct ServiceState {
    pub responses: Mutex<VecDeque<Value>>,
    pub requests: Mutex<Vec<Value>>,
    /// Transient failures injected before `request_license` succeeds.
    pub license_failures: AtomicU32,
}

impl ServiceState {
    /// The `request` field of every payload received so far.
    pub fn phases(&self) -> Vec<String> {
        self.requests
            .lock()
            .iter()
            .map(|r| {
                r.get("request")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            })
            .collect()
    }
}

pub struct ScriptedService(pub Arc<ServiceState>);

impl ScriptedService {
    pub fn new() -> (Self, Arc<ServiceState>) {
        let state = Arc::new(ServiceState::default());
        (Self(Arc::clone(&state)), state)
    }
}

impl LicenseService for ScriptedService {
    fn request_token(&self, _deadline: Instant) -> Result<()> {
        Ok(())
    }

    fn request_license(&self, request: &Value, _deadline: Instant) -> Result<Value> {
        if self.0.license_failures.load(Ordering::SeqCst) > 0 {
            self.0.license_failures.fetch_sub(1, Ordering::SeqCst);
            return Err(DrmError::WebServiceRetryable("HTTP 503".to_string()));
        }
        self.0.requests.lock().push(request.clone());
        self.0
            .responses
            .lock()
            .pop_front()
            .ok_or_else(|| DrmError::WebService("no scripted response left".to_string()))
    }

    fn token_string(&self) -> String {
        "test-token".to_string()
    }
    fn token_validity(&self) -> u32 {
        3600
    }
    fn token_time_left(&self) -> u32 {
        3600
    }
}

/// A well-formed metered license response.
pub fn license_response(session: &str, timeout_second: u32) -> Value {
    json!({
        "metering": {"sessionId": session, "timeoutSecond": timeout_second},
        "license": {DNA: {"key": "K", "licenseTimer": "T"}},
    })
}

/// A well-formed node-locked license response (no timer material).
pub fn nodelocked_license_response(session: &str) -> Value {
    json!({
        "metering": {"sessionId": session},
        "license": {DNA: {"key": "K"}},
    })
}

// =============================================================================
// Configuration fixtures
// =============================================================================

pub fn metered_config(frequency_mhz: i32) -> Config {
    Config {
        mode: LicenseMode::Metered,
        frequency_mhz,
        license_dir: None,
        service_url: None,
        udid: None,
        board_type: None,
        settings: Settings::default(),
    }
}

pub fn nodelocked_config(license_dir: PathBuf) -> Config {
    Config {
        mode: LicenseMode::NodeLocked,
        frequency_mhz: 0,
        license_dir: Some(license_dir),
        service_url: None,
        udid: None,
        board_type: None,
        settings: Settings::default(),
    }
}
