//! DRM client agent for FPGA accelerators.
//!
//! This library keeps the licensing controller embedded in a programmed FPGA
//! continuously licensed: it negotiates a metering session with a licensing
//! web service, extracts cryptographic challenges and metering evidence from
//! the hardware, and installs successive time-bounded license blobs into the
//! controller before the current one expires. Usage evidence flows back to
//! the service with every request.
//!
//! # High-Level API
//!
//! The [`session::DrmManager`] type is the entry point:
//!
//! ```ignore
//! use drm_agent::session::DrmManager;
//!
//! let manager = DrmManager::new(
//!     Path::new("conf.json"),
//!     Path::new("cred.json"),
//!     driver,
//!     Box::new(|msg| eprintln!("async DRM error: {msg}")),
//! )?;
//!
//! manager.activate(false)?;
//! // ... accelerator protected functions are enabled ...
//! manager.deactivate(false)?;
//! ```
//!
//! Hardware access goes through the [`controller::driver::ControllerDriver`]
//! seam; the register-level protocol itself lives in the controller driver
//! library, built over the two caller-supplied register callbacks held by
//! [`controller::driver::RegisterIo`].

pub mod config;
pub mod controller;
pub mod error;
mod json;
pub mod logging;
pub mod params;
pub mod session;
pub mod ws;

pub use config::{Config, LicenseMode, Settings};
pub use controller::driver::{
    ControllerDriver, DriverError, ReadRegisterCallback, RegisterIo, WriteRegisterCallback,
};
pub use error::{DrmError, Result};
pub use params::ParameterKey;
pub use session::{AsyncErrorCallback, DrmManager};

/// Version of the DRM agent library.
///
/// Reported to the licensing web service in every request header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
