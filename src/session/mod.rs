//! Licensing session engine.
//!
//! [`DrmManager`] owns the controller façade, the web service client and the
//! background worker, and drives the session state machine:
//!
//! - `activate` initializes the hardware session, installs the first license
//!   (`open` request) and spawns the worker; with `resume_session` it
//!   continues a paused session with a `running` request instead.
//! - `deactivate` joins the worker and closes the session on the service
//!   (`close` request); with `pause_session` it only stops the worker and
//!   keeps the session alive on the controller.
//! - Node-locked mode installs a permanent license from the on-disk cache
//!   (or one single network round-trip) and never spawns a worker.
//!
//! Releasing the manager while the security-stop flag is set closes a
//! still-running session synchronously, so the hardware is never stranded
//! with an open session by a crash-free shutdown path.

mod install;
mod nodelocked;
mod request;
mod retry;
mod signal;
mod worker;

use crate::config::{Config, LicenseMode, Settings};
use crate::controller::driver::ControllerDriver;
use crate::controller::{DesignInfo, DrmController};
use crate::error::{DrmError, Result};
use crate::ws::{Credentials, LicenseService, WsClient};
use install::{check_session_id_from_ws, install_license};
use nodelocked::NodeLockedStore;
use parking_lot::Mutex;
use request::RequestBuilder;
use retry::RetryPolicy;
use serde_json::Value;
use signal::StopSignal;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Callback receiving asynchronous worker errors, invoked at most once per
/// worker lifetime, from the worker thread.
pub type AsyncErrorCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Mutable session state, shared between the foreground and the worker.
pub(crate) struct SessionState {
    /// Server-assigned session id; empty when no session belongs to this
    /// object.
    pub session_id: String,
    /// Licenses installed within the current session.
    pub license_counter: u32,
    /// Duration in seconds of the current license.
    pub license_duration: u32,
    /// Possibly corrected controller frequency in MHz.
    pub frequency_curr: i32,
    /// Whether the release path must stop a still-running session.
    pub security_stop: bool,
}

/// Everything the worker shares with the foreground.
pub(crate) struct SessionInner {
    pub controller: DrmController,
    pub service: Box<dyn LicenseService>,
    pub builder: RequestBuilder,
    pub design: DesignInfo,
    pub mode: LicenseMode,
    pub frequency_init: i32,
    pub nodelocked: Option<NodeLockedStore>,
    pub settings: Mutex<Settings>,
    pub state: Mutex<SessionState>,
    pub stop: StopSignal,
    pub async_error: AsyncErrorCallback,
}

impl SessionInner {
    /// Frequency to attach to request payloads; node-locked requests carry
    /// none.
    pub(crate) fn frequency(&self, state: &SessionState) -> Option<i32> {
        if self.mode == LicenseMode::NodeLocked {
            None
        } else {
            Some(state.frequency_curr)
        }
    }

    fn foreground_policy(&self) -> (Instant, RetryPolicy) {
        let settings = self.settings.lock();
        let deadline =
            Instant::now() + Duration::from_secs(u64::from(settings.ws_request_timeout));
        let policy =
            RetryPolicy::short_only(Duration::from_secs(u64::from(settings.ws_retry_period_short)));
        (deadline, policy)
    }
}

/// DRM client agent for one licensing controller.
///
/// Holds at most one session and at most one background worker at any time.
/// All entry points are callable from any thread.
pub struct DrmManager {
    pub(crate) inner: Arc<SessionInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DrmManager {
    /// Create a manager from configuration and credentials files, talking to
    /// the licensing service over HTTP.
    pub fn new(
        conf_file_path: &Path,
        cred_file_path: &Path,
        driver: Box<dyn ControllerDriver>,
        async_error: AsyncErrorCallback,
    ) -> Result<Self> {
        let config = Config::from_file(conf_file_path)?;
        let credentials = Credentials::from_file(cred_file_path)?;
        let url = config.service_url.clone().ok_or_else(|| {
            DrmError::BadArgument(format!(
                "'licensing.url' is missing from configuration file '{}'",
                conf_file_path.display()
            ))
        })?;
        let timeout = Duration::from_secs(u64::from(config.settings.ws_request_timeout));
        let service: Box<dyn LicenseService> =
            Box::new(WsClient::new(&url, credentials, timeout)?);
        Self::with_service(config, driver, service, async_error)
    }

    /// Create a manager with an injected licensing service.
    ///
    /// This is the seam used by tests; [`DrmManager::new`] wires in the HTTP
    /// client.
    pub fn with_service(
        config: Config,
        driver: Box<dyn ControllerDriver>,
        service: Box<dyn LicenseService>,
        async_error: AsyncErrorCallback,
    ) -> Result<Self> {
        config.validate()?;

        let controller = DrmController::new(driver);
        controller.check_compatibility()?;
        let design = controller.design_info()?;
        let builder = RequestBuilder::new(
            &design,
            config.mode,
            config.frequency_mhz,
            config.udid.as_deref(),
            config.board_type.as_deref(),
        )?;
        controller.acquire_instance_lock()?;

        let nodelocked = match (config.mode, &config.license_dir) {
            (LicenseMode::NodeLocked, Some(dir)) => Some(NodeLockedStore::new(dir, &design)?),
            (LicenseMode::NodeLocked, None) => {
                return Err(DrmError::BadArgument(
                    "node-locked licensing requires 'licensing.license_dir'".to_string(),
                ))
            }
            _ => None,
        };

        let manager = Self {
            inner: Arc::new(SessionInner {
                controller,
                service,
                builder,
                design,
                mode: config.mode,
                frequency_init: config.frequency_mhz,
                nodelocked,
                state: Mutex::new(SessionState {
                    session_id: String::new(),
                    license_counter: 0,
                    license_duration: 0,
                    frequency_curr: config.frequency_mhz,
                    security_stop: false,
                }),
                settings: Mutex::new(config.settings),
                stop: StopSignal::new(),
                async_error,
            }),
            worker: Mutex::new(None),
        };

        if manager.inner.mode == LicenseMode::NodeLocked {
            manager.prepare_node_locked()?;
        }
        Ok(manager)
    }

    // =========================================================================
    // Entry points
    // =========================================================================

    /// Start (or resume) licensing the controller.
    ///
    /// In metered mode this opens a session with the web service, installs
    /// the first license and spawns the background worker; with
    /// `resume_session` a session paused by `deactivate(true)` continues
    /// under its original session id. In node-locked mode the cached (or
    /// once-requested) permanent license is installed instead.
    pub fn activate(&self, resume_session: bool) -> Result<()> {
        debug!(resume_session, "calling 'activate'");
        self.try_activate(resume_session).inspect_err(|e| {
            error!(error = %e, "activation failed");
        })
    }

    /// Stop (or pause) licensing the controller.
    ///
    /// Joins the worker first. Without `pause_session` the session is closed
    /// on the web service and the final metering uploaded; with it, only the
    /// worker stops and the security-stop flag is cleared.
    pub fn deactivate(&self, pause_session: bool) -> Result<()> {
        debug!(pause_session, "calling 'deactivate'");
        self.try_deactivate(pause_session).inspect_err(|e| {
            error!(error = %e, "deactivation failed");
        })
    }

    fn try_activate(&self, resume_session: bool) -> Result<()> {
        let running = self.inner.controller.status_session_running()?;

        if self.inner.mode == LicenseMode::NodeLocked {
            let Some(store) = &self.inner.nodelocked else {
                return Err(DrmError::BadUsage(
                    "node-locked store was not prepared".to_string(),
                ));
            };
            return nodelocked::install(&self.inner, store);
        }
        if self.inner.controller.status_is_nodelocked()? {
            return Err(DrmError::BadUsage(
                "the controller is locked in node-locked licensing mode: \
                 to use other licensing modes, reprogram the FPGA device"
                    .to_string(),
            ));
        }

        self.inner.state.lock().security_stop = true;
        if running && resume_session {
            self.resume_session()
        } else {
            if running {
                debug!("a session is already running and resume was not requested: stopping it");
                if let Err(e) = self.stop_session() {
                    debug!(error = %e, "failed to stop the pending session");
                }
            }
            self.start_session()
        }
    }

    fn try_deactivate(&self, pause_session: bool) -> Result<()> {
        if self.inner.mode == LicenseMode::NodeLocked {
            return Ok(());
        }
        if !self.inner.controller.status_session_running()? {
            debug!("no session is currently running");
            return Ok(());
        }
        if pause_session {
            self.pause_session()
        } else {
            self.stop_session()
        }
    }

    // =========================================================================
    // Session transitions
    // =========================================================================

    fn start_session(&self) -> Result<()> {
        info!("starting a new metering session");

        let request = {
            let mut state = self.inner.state.lock();
            state.license_counter = 0;
            let extract = self.inner.controller.initialization()?;
            self.inner.builder.open(&extract, self.inner.frequency(&state))
        };
        let license = self.foreground_fetch(&request)?;
        {
            let mut state = self.inner.state.lock();
            install_license(
                &self.inner.controller,
                self.inner.mode,
                &self.inner.design.dna,
                &mut state,
                &license,
            )?;
        }
        self.spawn_worker();
        Ok(())
    }

    fn resume_session(&self) -> Result<()> {
        info!("resuming the current metering session");

        if !self.inner.controller.status_timer_loaded()? {
            let request = {
                let state = self.inner.state.lock();
                let extract = self.inner.controller.sync_extract_metering()?;
                self.inner
                    .builder
                    .running(&extract, self.inner.frequency(&state), &state.session_id)?
            };
            let license = self.foreground_fetch(&request)?;
            let mut state = self.inner.state.lock();
            install_license(
                &self.inner.controller,
                self.inner.mode,
                &self.inner.design.dna,
                &mut state,
                &license,
            )?;
        }
        self.spawn_worker();
        Ok(())
    }

    fn stop_session(&self) -> Result<()> {
        info!("stopping the current metering session");
        self.stop_worker();

        let request = {
            let state = self.inner.state.lock();
            let extract = self.inner.controller.end_session_and_extract_metering()?;
            self.inner
                .builder
                .close(&extract, self.inner.frequency(&state), &state.session_id)?
        };
        let license = self.foreground_fetch(&request)?;

        let mut state = self.inner.state.lock();
        check_session_id_from_ws(&state, &license)?;
        info!(session = %state.session_id, "session stopped and last metering data uploaded");
        state.session_id.clear();
        Ok(())
    }

    fn pause_session(&self) -> Result<()> {
        info!("pausing the current metering session");
        self.stop_worker();
        self.inner.state.lock().security_stop = false;
        Ok(())
    }

    fn foreground_fetch(&self, request: &Value) -> Result<Value> {
        let (deadline, policy) = self.inner.foreground_policy();
        retry::fetch_license(&*self.inner.service, request, deadline, policy, &self.inner.stop)
    }

    // =========================================================================
    // Node-locked preparation
    // =========================================================================

    fn prepare_node_locked(&self) -> Result<()> {
        let Some(store) = &self.inner.nodelocked else {
            return Ok(());
        };

        // A metered session may still be running on the controller from a
        // previous agent; close it gracefully before switching modes.
        if self.inner.controller.status_is_metered()?
            && self.inner.controller.status_session_running()?
        {
            debug!("a metered session is still pending: closing it before node-locked issuance");
            if let Err(e) = self.close_pending_metered_session() {
                debug!(error = %e, "failed to close the pending session gracefully");
            }
        }

        nodelocked::ensure_request_file(&self.inner, store)
    }

    /// Best-effort close of a foreign metered session; the request carries
    /// the metered mode code even though this agent is node-locked.
    fn close_pending_metered_session(&self) -> Result<()> {
        let extract = self.inner.controller.end_session_and_extract_metering()?;
        let mut request = self.inner.builder.close(&extract, None, "")?;
        request["mode"] = serde_json::json!(LicenseMode::Metered.code());
        self.foreground_fetch(&request)?;
        Ok(())
    }

    // =========================================================================
    // Worker lifecycle
    // =========================================================================

    fn spawn_worker(&self) {
        let mut slot = self.worker.lock();
        if slot.is_some() {
            warn!("license maintenance worker is already running");
            return;
        }
        debug!("starting the license maintenance worker");
        self.inner.stop.reset();
        let inner = Arc::clone(&self.inner);
        *slot = Some(std::thread::spawn(move || worker::run(inner)));
    }

    /// Signal and join the worker. `deactivate` happens-before worker
    /// termination: this returns only once the worker is gone.
    fn stop_worker(&self) {
        let mut slot = self.worker.lock();
        if let Some(handle) = slot.take() {
            debug!("signalling the license maintenance worker to stop");
            self.inner.stop.request_stop();
            if handle.join().is_err() {
                error!("license maintenance worker panicked");
            }
            self.inner.stop.reset();
            debug!("license maintenance worker joined");
        }
    }

    /// Whether a worker is currently attached to this manager.
    pub fn has_worker(&self) -> bool {
        self.worker.lock().is_some()
    }
}

impl Drop for DrmManager {
    fn drop(&mut self) {
        let security_stop = self.inner.state.lock().security_stop;
        if security_stop {
            match self.inner.controller.status_session_running() {
                Ok(true) => {
                    debug!("security stop triggered: stopping the current session");
                    if let Err(e) = self.stop_session() {
                        warn!(error = %e, "failed to stop the session on release");
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(error = %e, "failed to read the session state on release"),
            }
        }
        self.stop_worker();
        if let Err(e) = self.inner.controller.release_instance_lock() {
            debug!(error = %e, "failed to release the controller instance lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::testing::{ScriptedDriver, ScriptedState};
    use crate::ws::testing::StubService;

    fn metered_config() -> Config {
        Config {
            mode: LicenseMode::Metered,
            frequency_mhz: 125,
            license_dir: None,
            service_url: None,
            udid: None,
            board_type: None,
            settings: Settings::default(),
        }
    }

    fn manager_with(
        state: ScriptedState,
        service: StubService,
    ) -> (Result<DrmManager>, Arc<parking_lot::Mutex<ScriptedState>>) {
        let (driver, handle) = ScriptedDriver::new(state);
        let manager = DrmManager::with_service(
            metered_config(),
            Box::new(driver),
            Box::new(service),
            Box::new(|_| {}),
        );
        (manager, handle)
    }

    #[test]
    fn test_construction_checks_controller_version() {
        let (result, _) = manager_with(
            ScriptedState {
                version: "00020000".to_string(),
                ..ScriptedState::default()
            },
            StubService::default(),
        );
        assert!(matches!(result, Err(DrmError::Controller(_))));
    }

    #[test]
    fn test_activate_rejects_nodelocked_controller() {
        let (result, handle) = manager_with(
            ScriptedState {
                nodelock_mode: true,
                ..ScriptedState::default()
            },
            StubService::default(),
        );
        let manager = result.unwrap();
        let err = manager.activate(false).unwrap_err();
        assert!(matches!(err, DrmError::BadUsage(_)));
        // The security-stop flag was never raised.
        assert!(!manager.inner.state.lock().security_stop);
        drop(manager);
        assert!(!handle.lock().session_running);
    }

    #[test]
    fn test_deactivate_without_session_is_a_no_op() {
        let (result, _) = manager_with(ScriptedState::default(), StubService::default());
        let manager = result.unwrap();
        manager.deactivate(false).unwrap();
        assert!(!manager.has_worker());
    }

    #[test]
    fn test_validation_runs_before_hardware_access() {
        let mut config = metered_config();
        config.settings.ws_request_timeout = 0;
        let (driver, _) = ScriptedDriver::new(ScriptedState::default());
        let result = DrmManager::with_service(
            config,
            Box::new(driver),
            Box::new(StubService::default()),
            Box::new(|_| {}),
        );
        assert!(matches!(result, Err(DrmError::BadArgument(_))));
    }
}
