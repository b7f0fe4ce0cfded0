//! Typed façade over the licensing controller.
//!
//! [`DrmController`] wraps the external [`driver::ControllerDriver`] behind a
//! reentrant mutex and exposes the session-level operations the agent needs:
//! design identity extraction, challenge/metering extraction, license
//! installation and status reads.
//!
//! # Locking contract
//!
//! Every operation acquires the controller mutex for its full duration; the
//! controller has internal page state that must not be interleaved between
//! threads. The mutex is reentrant so composite operations can take the
//! guard once and call several façade operations atomically. No caller may
//! hold the guard across a sleep or a network call.

pub mod driver;
pub mod mailbox;

use crate::error::{DrmError, Result};
use driver::{ActivationResult, ControllerDriver, DriverResult, MeteringExtract};
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::fmt;
use tracing::debug;

/// Lowest controller version the agent is compatible with.
const COMPAT_FLOOR_MAJOR: u32 = 3;
const COMPAT_FLOOR_MINOR: u32 = 1;

/// Controller version decoded from the version register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl fmt::Display for ControllerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Immutable hardware identity read once at startup.
#[derive(Debug, Clone)]
pub struct DesignInfo {
    /// Hardware serial keying the per-device license.
    pub dna: String,
    /// Raw controller version string, as reported to the web service.
    pub version: String,
    /// VLNV identifiers of the protected IP blocks.
    pub vlnvs: Vec<String>,
    /// Product information JSON read from the read-only mailbox, if any.
    pub product: Option<String>,
}

/// Serialized, session-level view of the licensing controller.
pub struct DrmController {
    driver: ReentrantMutex<Box<dyn ControllerDriver>>,
}

impl DrmController {
    pub fn new(driver: Box<dyn ControllerDriver>) -> Self {
        Self {
            driver: ReentrantMutex::new(driver),
        }
    }

    /// Take the controller guard for a composite transaction.
    ///
    /// The guard is reentrant: façade operations called while it is held
    /// re-acquire it without deadlocking. Do not hold it across a sleep or
    /// a network call.
    pub(crate) fn guard(&self) -> ReentrantMutexGuard<'_, Box<dyn ControllerDriver>> {
        self.driver.lock()
    }

    /// Run one driver operation under the controller mutex, mapping any
    /// non-zero driver status to a fatal [`DrmError::Controller`].
    fn run<T>(&self, op: impl FnOnce(&dyn ControllerDriver) -> DriverResult<T>) -> Result<T> {
        let guard = self.driver.lock();
        op(&**guard)
            .map_err(|e| DrmError::Controller(format!("error in controller driver call: {e}")))
    }

    // =========================================================================
    // Identity and compatibility
    // =========================================================================

    /// Decode the controller version register.
    pub fn version(&self) -> Result<ControllerVersion> {
        let raw = self.run(|d| d.extract_version())?;
        parse_version(&raw)
    }

    /// Reject controllers older than the compatibility floor.
    pub fn check_compatibility(&self) -> Result<ControllerVersion> {
        let version = self.version()?;
        if version.major < COMPAT_FLOOR_MAJOR || version.minor < COMPAT_FLOOR_MINOR {
            return Err(DrmError::Controller(format!(
                "this agent is not compatible with controller version {version}: \
                 the controller version must be at least {COMPAT_FLOOR_MAJOR}.{COMPAT_FLOOR_MINOR}.0"
            )));
        }
        debug!(%version, "controller version accepted");
        Ok(version)
    }

    /// Read the full hardware identity in one controller transaction.
    pub fn design_info(&self) -> Result<DesignInfo> {
        let _lock = self.guard();
        let version = self.run(|d| d.extract_version())?;
        let dna = self.run(|d| d.extract_dna())?;
        let vlnvs = self.run(|d| d.extract_vlnvs())?;
        let image = self.run(|d| {
            d.select_mailbox_page()?;
            d.read_mailbox()
        })?;
        debug!(
            ro_size = image.ro_size,
            rw_size = image.rw_size,
            "mailbox sizes"
        );
        let product = if image.ro_size > 0 {
            ro_words_to_string(&image.ro_words)?
        } else {
            None
        };
        Ok(DesignInfo {
            dna,
            version,
            vlnvs,
            product,
        })
    }

    // =========================================================================
    // Challenge and metering extraction
    // =========================================================================

    /// Start a session on the controller; first challenge + metering.
    pub fn initialization(&self) -> Result<MeteringExtract> {
        self.run(|d| d.initialization())
    }

    /// Extract metering without touching the license timer.
    pub fn async_extract_metering(&self) -> Result<MeteringExtract> {
        self.run(|d| d.extract_metering_async())
    }

    /// Extract metering synchronized with the license timer.
    pub fn sync_extract_metering(&self) -> Result<MeteringExtract> {
        self.run(|d| d.extract_metering_sync())
    }

    /// End the running session and extract the final metering file.
    pub fn end_session_and_extract_metering(&self) -> Result<MeteringExtract> {
        self.run(|d| d.end_session_extract_metering())
    }

    // =========================================================================
    // License installation
    // =========================================================================

    /// Push a license key into the controller.
    pub fn activate(&self, key: &str) -> Result<ActivationResult> {
        self.run(|d| d.activate(key))
    }

    /// Load a license timer blob. Returns whether the timer is enabled.
    pub fn load_timer(&self, timer: &str) -> Result<bool> {
        self.run(|d| d.load_license_timer(timer))
    }

    /// Sample the 64-bit license timer countdown.
    pub fn sample_timer_counter(&self) -> Result<u64> {
        self.run(|d| d.sample_timer_counter())
    }

    // =========================================================================
    // Status registers
    // =========================================================================

    pub fn status_session_running(&self) -> Result<bool> {
        let running = self.run(|d| {
            d.select_registers_page()?;
            d.session_running()
        })?;
        debug!(running, "controller session running state");
        Ok(running)
    }

    pub fn status_is_metered(&self) -> Result<bool> {
        self.run(|d| {
            d.select_registers_page()?;
            d.license_metering_mode()
        })
    }

    pub fn status_is_nodelocked(&self) -> Result<bool> {
        self.run(|d| {
            d.select_registers_page()?;
            d.license_nodelock_mode()
        })
    }

    /// Whether the license timer init slot is occupied. A free slot means
    /// the controller is ready to receive the next license.
    pub fn status_timer_loaded(&self) -> Result<bool> {
        self.run(|d| {
            d.select_registers_page()?;
            d.timer_init_loaded()
        })
    }

    /// Whether the license timer countdown has run out.
    pub fn status_timer_empty(&self) -> Result<bool> {
        self.run(|d| {
            d.select_registers_page()?;
            d.timer_count_empty()
        })
    }

    /// Number of protected IP blocks detected by the controller.
    pub fn num_activators(&self) -> Result<u32> {
        self.run(|d| {
            d.select_registers_page()?;
            d.detected_ip_count()
        })
    }
}

fn parse_version(raw: &str) -> Result<ControllerVersion> {
    let head = raw.get(..8).unwrap_or(raw);
    let word = u32::from_str_radix(head, 16).map_err(|_| {
        DrmError::Controller(format!("unexpected controller version string '{raw}'"))
    })?;
    Ok(ControllerVersion {
        major: (word >> 16) & 0xFF,
        minor: (word >> 8) & 0xFF,
        patch: word & 0xFF,
    })
}

/// Decode the read-only mailbox words as a NUL-terminated UTF-8 string.
fn ro_words_to_string(words: &[u32]) -> Result<Option<String>> {
    let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    if let Some(nul) = bytes.iter().position(|&b| b == 0) {
        bytes.truncate(nul);
    }
    if bytes.is_empty() {
        return Ok(None);
    }
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| DrmError::BadFormat("read-only mailbox content is not valid UTF-8".to_string()))
}

// =============================================================================
// Test support
// =============================================================================
