//! Seam to the controller driver library.
//!
//! The register-level protocol of the licensing controller (paging scheme,
//! bit-field layout of the status registers, mailbox byte packing) lives in
//! a separate driver library. This module defines the contract the agent
//! requires from that library: the [`ControllerDriver`] trait, the data
//! types its operations exchange, and [`RegisterIo`], the holder for the two
//! caller-supplied register callbacks a driver implementation is built over.

use std::fmt;

/// Callback reading one 32-bit controller register at a byte offset.
/// Returns 0 on success.
pub type ReadRegisterCallback = Box<dyn Fn(u32, &mut u32) -> i32 + Send + Sync>;

/// Callback writing one 32-bit controller register at a byte offset.
/// Returns 0 on success.
pub type WriteRegisterCallback = Box<dyn Fn(u32, u32) -> i32 + Send + Sync>;

/// Register addresses understood by the controller.
///
/// The page register selects which register file the line registers expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrmRegister {
    /// Page-select register.
    Page,
    /// Line `N` of the currently selected page.
    Line(u32),
}

impl DrmRegister {
    /// Byte offset of this register in the controller's address space.
    pub fn offset(self) -> u32 {
        match self {
            DrmRegister::Page => 0,
            DrmRegister::Line(n) => 4 * n + 4,
        }
    }
}

/// Non-zero status reported by the controller driver or a register callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverError(pub u32);

/// Status a failed register callback is folded into.
pub const CALLBACK_FAILURE: u32 = u32::MAX;

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "controller driver status 0x{:08x}", self.0)
    }
}

impl std::error::Error for DriverError {}

pub type DriverResult<T> = Result<T, DriverError>;

/// Owns the caller-supplied register callbacks.
///
/// Driver implementations perform all hardware access through this type so
/// that the host process keeps full control over how the controller's
/// memory-mapped registers are reached.
pub struct RegisterIo {
    read_register: ReadRegisterCallback,
    write_register: WriteRegisterCallback,
}

impl RegisterIo {
    pub fn new(read_register: ReadRegisterCallback, write_register: WriteRegisterCallback) -> Self {
        Self {
            read_register,
            write_register,
        }
    }

    /// Read one register. A non-zero callback status is folded into
    /// [`CALLBACK_FAILURE`].
    pub fn read(&self, register: DrmRegister) -> DriverResult<u32> {
        let mut word = 0u32;
        let rc = (self.read_register)(register.offset(), &mut word);
        if rc != 0 {
            tracing::error!(offset = register.offset(), rc, "read register callback failed");
            return Err(DriverError(CALLBACK_FAILURE));
        }
        Ok(word)
    }

    /// Write one register. A non-zero callback status is folded into
    /// [`CALLBACK_FAILURE`].
    pub fn write(&self, register: DrmRegister, word: u32) -> DriverResult<()> {
        let rc = (self.write_register)(register.offset(), word);
        if rc != 0 {
            tracing::error!(offset = register.offset(), rc, "write register callback failed");
            return Err(DriverError(CALLBACK_FAILURE));
        }
        Ok(())
    }
}

/// One challenge-plus-metering extraction from the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeteringExtract {
    /// Number of protected IP blocks the controller detected.
    pub detected_ips: u32,
    /// Challenge the web service needs to mint the next license.
    pub challenge: String,
    /// Metering file records. The first 16 hex characters of the first
    /// record carry the session id; record 2 carries the metering counter.
    pub records: Vec<String>,
}

/// Outcome of pushing a license key into the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationResult {
    pub done: bool,
    /// Non-zero means the controller rejected the key.
    pub error_code: u8,
}

/// Snapshot of both mailbox regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxImage {
    pub ro_size: u32,
    pub rw_size: u32,
    pub ro_words: Vec<u32>,
    pub rw_words: Vec<u32>,
}

/// High-level operations the controller driver library must provide.
///
/// Implementations are expected to perform their own register sequencing on
/// top of [`RegisterIo`]; the agent façade adds page selection where an
/// operation reads from a specific register page, and serializes every call
/// behind a reentrant mutex. All methods report hardware or protocol
/// malfunction through [`DriverError`]; such failures are never retried.
pub trait ControllerDriver: Send {
    /// Select the status/control register page.
    fn select_registers_page(&self) -> DriverResult<()>;
    /// Select the mailbox register page.
    fn select_mailbox_page(&self) -> DriverResult<()>;

    /// Controller version as an 8-hex-digit string (major, minor, patch bytes).
    fn extract_version(&self) -> DriverResult<String>;
    /// Hardware serial keying the per-device license.
    fn extract_dna(&self) -> DriverResult<String>;
    /// VLNV identifiers of the protected IP blocks, 16 hex chars each.
    fn extract_vlnvs(&self) -> DriverResult<Vec<String>>;

    /// Read both mailbox regions. Caller selects the mailbox page first.
    fn read_mailbox(&self) -> DriverResult<MailboxImage>;
    /// Write the full read-write mailbox region. Caller selects the page first.
    fn write_mailbox(&self, words: &[u32]) -> DriverResult<()>;

    /// Start a session on the controller and extract the first challenge and
    /// metering file.
    fn initialization(&self) -> DriverResult<MeteringExtract>;
    /// Extract metering without synchronizing with the license timer.
    fn extract_metering_async(&self) -> DriverResult<MeteringExtract>;
    /// Extract metering synchronized with the license timer.
    fn extract_metering_sync(&self) -> DriverResult<MeteringExtract>;
    /// End the running session and extract the final metering file.
    fn end_session_extract_metering(&self) -> DriverResult<MeteringExtract>;

    /// Push a license key into the controller.
    fn activate(&self, key: &str) -> DriverResult<ActivationResult>;
    /// Load a license timer blob. Returns whether the timer is now enabled.
    fn load_license_timer(&self, timer: &str) -> DriverResult<bool>;
    /// Sample the 64-bit license timer countdown.
    fn sample_timer_counter(&self) -> DriverResult<u64>;

    /// Session-running status bit. Caller selects the registers page first.
    fn session_running(&self) -> DriverResult<bool>;
    /// Metering license mode status bit.
    fn license_metering_mode(&self) -> DriverResult<bool>;
    /// Node-locked license mode status bit.
    fn license_nodelock_mode(&self) -> DriverResult<bool>;
    /// Whether the license timer init slot is loaded (no room for another).
    fn timer_init_loaded(&self) -> DriverResult<bool>;
    /// Whether the license timer countdown is empty.
    fn timer_count_empty(&self) -> DriverResult<bool>;
    /// Number of detected protected IP blocks.
    fn detected_ip_count(&self) -> DriverResult<u32>;
}
