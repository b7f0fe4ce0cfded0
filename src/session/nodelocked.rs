//! Node-locked (offline) license issuance.
//!
//! A node-locked license is permanent for one FPGA image. The artifacts live
//! in a configured directory, named by a stable hash of the hardware design:
//! `<hash>.req` holds the request payload, `<hash>.lic` the license
//! response. A present license file is trusted and installed without
//! contacting the network; otherwise the request is sent once and the
//! response persisted next to it.

use super::install::install_license;
use super::retry::{fetch_license, RetryPolicy};
use super::SessionInner;
use crate::controller::DesignInfo;
use crate::error::{DrmError, Result};
use crate::json;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Paths of the two node-locked artifacts for one hardware design.
#[derive(Debug, Clone)]
pub(crate) struct NodeLockedStore {
    pub request_path: PathBuf,
    pub license_path: PathBuf,
}

impl NodeLockedStore {
    /// Derive the artifact paths inside `dir`, which must already exist.
    pub fn new(dir: &Path, design: &DesignInfo) -> Result<Self> {
        if !dir.is_dir() {
            return Err(DrmError::BadArgument(format!(
                "license directory '{}' specified in the configuration file does not exist",
                dir.display()
            )));
        }
        let hash = design_hash(design);
        debug!(hash, "hash for the hardware design");
        Ok(Self {
            request_path: dir.join(format!("{hash}.req")),
            license_path: dir.join(format!("{hash}.lic")),
        })
    }
}

/// Stable design hash: 16 uppercase hex characters over
/// `DNA || controller version || concat(VLNVs)`.
pub(crate) fn design_hash(design: &DesignInfo) -> String {
    let mut hasher = Sha256::new();
    hasher.update(design.dna.as_bytes());
    hasher.update(design.version.as_bytes());
    for vlnv in &design.vlnvs {
        hasher.update(vlnv.as_bytes());
    }
    let digest = hasher.finalize();
    digest[..8].iter().fold(String::new(), |mut out, byte| {
        let _ = write!(out, "{byte:02X}");
        out
    })
}

/// Write the license request file if this design does not have one yet.
pub(crate) fn ensure_request_file(inner: &SessionInner, store: &NodeLockedStore) -> Result<()> {
    if store.request_path.is_file() {
        debug!(
            path = %store.request_path.display(),
            "a license request file already exists in the license directory"
        );
        return Ok(());
    }
    let request = {
        let mut state = inner.state.lock();
        state.license_counter = 0;
        let extract = inner.controller.initialization()?;
        inner.builder.open(&extract, None)
    };
    json::save_file_atomic(&store.request_path, &request)?;
    debug!(path = %store.request_path.display(), "license request file saved");
    Ok(())
}

/// Install the node-locked license, requesting and persisting it first if no
/// local license file exists. Never spawns a worker.
pub(crate) fn install(inner: &SessionInner, store: &NodeLockedStore) -> Result<()> {
    debug!(
        path = %store.license_path.display(),
        "looking for a local node-locked license file"
    );

    let license = match json::parse_file(&store.license_path) {
        Ok(license) => license,
        Err(_) => {
            // No local license: request one from the web service.
            inner.state.lock().session_id.clear();
            let request = json::parse_file(&store.request_path)?;
            let (timeout, short) = {
                let settings = inner.settings.lock();
                (
                    Duration::from_secs(u64::from(settings.ws_request_timeout)),
                    Duration::from_secs(u64::from(settings.ws_retry_period_short)),
                )
            };
            let deadline = Instant::now() + timeout;
            let license = fetch_license(
                &*inner.service,
                &request,
                deadline,
                RetryPolicy::short_only(short),
                &inner.stop,
            )?;
            json::save_file_atomic(&store.license_path, &license)?;
            debug!(
                path = %store.license_path.display(),
                "requested and saved a new node-locked license file"
            );
            license
        }
    };

    let mut state = inner.state.lock();
    install_license(
        &inner.controller,
        inner.mode,
        &inner.design.dna,
        &mut state,
        &license,
    )?;
    info!("installed node-locked license successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn design() -> DesignInfo {
        DesignInfo {
            dna: "DEADBEEF".to_string(),
            version: "00030100".to_string(),
            vlnvs: vec!["1122334455667788".to_string()],
            product: None,
        }
    }

    #[test]
    fn test_design_hash_is_stable() {
        let a = design_hash(&design());
        let b = design_hash(&design());
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_design_hash_depends_on_identity() {
        let mut other = design();
        other.dna = "FEEDFACE".to_string();
        assert_ne!(design_hash(&design()), design_hash(&other));

        let mut other = design();
        other.vlnvs.push("AAAAAAAAAAAAAAAA".to_string());
        assert_ne!(design_hash(&design()), design_hash(&other));
    }

    #[test]
    fn test_store_requires_existing_directory() {
        let err = NodeLockedStore::new(Path::new("/nonexistent/licenses"), &design()).unwrap_err();
        assert!(matches!(err, DrmError::BadArgument(_)));
    }

    #[test]
    fn test_store_paths() {
        let dir = tempfile::tempdir().unwrap();
        let store = NodeLockedStore::new(dir.path(), &design()).unwrap();
        let hash = design_hash(&design());
        assert_eq!(store.request_path, dir.path().join(format!("{hash}.req")));
        assert_eq!(store.license_path, dir.path().join(format!("{hash}.lic")));
    }
}
