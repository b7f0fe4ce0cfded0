//! Integration tests for node-locked (offline) license issuance.

mod common;

use common::{
    nodelocked_config, nodelocked_license_response, ControllerModel, ScriptedService,
    SimulatedController, SESSION,
};
use drm_agent::{DrmError, DrmManager, ParameterKey};
use std::fs;
use std::path::Path;

fn nodelocked_model() -> ControllerModel {
    ControllerModel {
        nodelock_image: true,
        ..ControllerModel::default()
    }
}

fn artifact_paths(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let mut req = None;
    let mut lic = None;
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        match path.extension().and_then(|e| e.to_str()) {
            Some("req") => req = Some(path),
            Some("lic") => lic = Some(path),
            _ => {}
        }
    }
    (req.expect("no .req file written"), lic.unwrap_or_default())
}

#[test]
fn cold_start_requests_and_persists_the_license() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, model) = SimulatedController::new(nodelocked_model());
    let (service, service_handle) = ScriptedService::new();
    service_handle
        .responses
        .lock()
        .push_back(nodelocked_license_response(SESSION));

    let manager = DrmManager::with_service(
        nodelocked_config(dir.path().to_path_buf()),
        Box::new(driver),
        Box::new(service),
        Box::new(|_| {}),
    )
    .unwrap();

    // Construction already wrote the request file.
    let (req_path, _) = artifact_paths(dir.path());
    let request: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&req_path).unwrap()).unwrap();
    assert_eq!(request["request"], "open");
    assert_eq!(request["mode"], 1);
    assert!(request.get("drm_frequency").is_none());

    manager.activate(false).unwrap();

    // Exactly one license fetch, license persisted, no worker spawned.
    assert_eq!(service_handle.phases(), vec!["open"]);
    let (_, lic_path) = artifact_paths(dir.path());
    assert!(lic_path.is_file());
    assert!(!manager.has_worker());
    assert_eq!(manager.get(ParameterKey::SessionId).unwrap(), SESSION);
    assert_eq!(manager.get(ParameterKey::LicenseType).unwrap(), "Node-Locked");
    assert!(model.lock().nodelock_mode);
    assert_eq!(
        manager.get(ParameterKey::NodelockedRequestFile).unwrap(),
        req_path.display().to_string().as_str()
    );
}

#[test]
fn warm_start_installs_without_any_network_call() {
    let dir = tempfile::tempdir().unwrap();

    // First agent performs the one-shot issuance.
    {
        let (driver, _) = SimulatedController::new(nodelocked_model());
        let (service, handle) = ScriptedService::new();
        handle
            .responses
            .lock()
            .push_back(nodelocked_license_response(SESSION));
        let manager = DrmManager::with_service(
            nodelocked_config(dir.path().to_path_buf()),
            Box::new(driver),
            Box::new(service),
            Box::new(|_| {}),
        )
        .unwrap();
        manager.activate(false).unwrap();
    }

    // Second agent on the same design finds both artifacts on disk.
    let (driver, model) = SimulatedController::new(nodelocked_model());
    let (service, service_handle) = ScriptedService::new();
    let manager = DrmManager::with_service(
        nodelocked_config(dir.path().to_path_buf()),
        Box::new(driver),
        Box::new(service),
        Box::new(|_| {}),
    )
    .unwrap();
    manager.activate(false).unwrap();

    assert!(service_handle.requests.lock().is_empty());
    assert!(!manager.has_worker());
    assert!(model.lock().nodelock_mode);

    // Deactivate is a no-op for node-locked licensing.
    manager.deactivate(false).unwrap();
    assert!(service_handle.requests.lock().is_empty());
}

#[test]
fn missing_license_directory_is_rejected() {
    let (driver, _) = SimulatedController::new(nodelocked_model());
    let (service, _) = ScriptedService::new();
    let result = DrmManager::with_service(
        nodelocked_config("/nonexistent/license/dir".into()),
        Box::new(driver),
        Box::new(service),
        Box::new(|_| {}),
    );
    assert!(matches!(result, Err(DrmError::BadArgument(_))));
}

#[test]
fn pending_metered_session_is_closed_before_issuance() {
    let dir = tempfile::tempdir().unwrap();
    // The controller still runs a metered session from a previous agent.
    let (driver, _model) = SimulatedController::new(ControllerModel {
        nodelock_image: true,
        metering_mode: true,
        session_running: true,
        ..ControllerModel::default()
    });
    let (service, service_handle) = ScriptedService::new();
    service_handle
        .responses
        .lock()
        .push_back(nodelocked_license_response(SESSION));

    let manager = DrmManager::with_service(
        nodelocked_config(dir.path().to_path_buf()),
        Box::new(driver),
        Box::new(service),
        Box::new(|_| {}),
    )
    .unwrap();

    // The graceful close went out first, flagged with the metered mode code.
    let phases = service_handle.phases();
    assert_eq!(phases.first().map(String::as_str), Some("close"));
    {
        let requests = service_handle.requests.lock();
        assert_eq!(requests[0]["mode"], 0);
    }
    assert!(!manager.has_worker());
}
