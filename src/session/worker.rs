//! Background license maintenance worker.
//!
//! One cooperative task per session: it measures the controller frequency
//! once (metered only), then keeps the controller supplied with licenses.
//! Whenever the timer init slot is free it requests and installs the next
//! license, with a deadline equal to the remaining license duration;
//! otherwise it sleeps until the current license is about to expire.
//!
//! Any failure other than cancellation is delivered once to the
//! asynchronous error callback and terminates the worker; it is respawned
//! only by the session engine.

use super::install::install_license;
use super::retry::{fetch_license, RetryPolicy};
use super::SessionInner;
use crate::config::LicenseMode;
use crate::error::{DrmError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error};

/// Attempts allowed when the timer counter is observed reloading mid-sample.
const FREQUENCY_DETECTION_ATTEMPTS: u32 = 3;

/// Worker entry point. Reports every failure except cancellation through the
/// asynchronous error callback, at most once.
pub(crate) fn run(inner: Arc<SessionInner>) {
    match maintain(&inner) {
        Ok(()) | Err(DrmError::Exit(_)) => {
            debug!("license maintenance worker stopped on request");
        }
        Err(e) => {
            error!(error = %e, "license maintenance worker terminated");
            (inner.async_error)(&e.to_string());
        }
    }
}

fn maintain(inner: &SessionInner) -> Result<()> {
    if inner.mode == LicenseMode::Metered {
        detect_frequency(inner)?;
    }

    loop {
        if !inner.controller.status_timer_loaded()? {
            // The slot for the next license is free.
            if inner.stop.is_requested() {
                return Ok(());
            }
            debug!("requesting a new license now");

            let request = {
                let state = inner.state.lock();
                let extract = inner.controller.sync_extract_metering()?;
                inner
                    .builder
                    .running(&extract, inner.frequency(&state), &state.session_id)?
            };

            let (duration, policy) = {
                let state = inner.state.lock();
                let settings = inner.settings.lock();
                (
                    state.license_duration,
                    RetryPolicy {
                        short_period: Duration::from_secs(u64::from(
                            settings.ws_retry_period_short,
                        )),
                        long_period: Duration::from_secs(u64::from(settings.ws_retry_period_long)),
                    },
                )
            };
            let deadline = Instant::now() + Duration::from_secs(u64::from(duration));

            let license =
                fetch_license(&*inner.service, &request, deadline, policy, &inner.stop)?;

            let mut state = inner.state.lock();
            install_license(
                &inner.controller,
                inner.mode,
                &inner.design.dna,
                &mut state,
                &license,
            )?;
        } else {
            // Both license slots are taken; sleep until the current license
            // is about to run out.
            let frequency = inner.state.lock().frequency_curr;
            let counter = inner.controller.sample_timer_counter()?;
            let time_left = license_time_left(counter, frequency);
            debug!(
                seconds = time_left,
                "waiting before checking controller readiness for a new license"
            );
            inner
                .stop
                .sleep_or_exit(Duration::from_secs(u64::from(time_left) + 1))?;
        }
    }
}

/// Seconds of license time left in a timer counter ticking at `frequency_mhz`.
pub(crate) fn license_time_left(counter: u64, frequency_mhz: i32) -> u32 {
    (counter as f64 / frequency_mhz as f64 / 1e6).ceil() as u32
}

/// Measure the actual controller clock from the license timer countdown.
///
/// Samples the counter, busy-waits until it is observed decrementing (the
/// timer might have just been loaded), sleeps one detection period and
/// samples again. A counter that was reloaded mid-sample restarts the
/// measurement. When the measured frequency deviates from the configured
/// one by at least the detection threshold, the current frequency is
/// corrected and [`DrmError::BadFrequency`] is raised.
fn detect_frequency(inner: &SessionInner) -> Result<()> {
    let (period, threshold) = {
        let settings = inner.settings.lock();
        (
            Duration::from_millis(u64::from(settings.frequency_detection_period)),
            settings.frequency_detection_threshold,
        )
    };
    let period_ms = period.as_millis();
    debug!(period_ms, "detecting controller frequency");

    let mut attempts_left = FREQUENCY_DETECTION_ATTEMPTS;
    let (ticks, elapsed) = loop {
        let mut counter_start = inner.controller.sample_timer_counter()?;
        // Wait until the counter is actually counting down.
        loop {
            if inner.stop.is_requested() {
                return Err(DrmError::Exit("exit requested".to_string()));
            }
            let counter = inner.controller.sample_timer_counter()?;
            if counter < counter_start {
                counter_start = counter;
                break;
            }
            std::thread::yield_now();
        }
        let time_start = Instant::now();

        inner.stop.sleep_or_exit(period)?;

        let counter_end = inner.controller.sample_timer_counter()?;
        let time_end = Instant::now();

        if counter_end == 0 {
            return Err(DrmError::Controller(
                "frequency auto-detection failed: license timer counter is 0".to_string(),
            ));
        }
        if counter_end > counter_start {
            attempts_left -= 1;
            if attempts_left == 0 {
                return Err(DrmError::Controller(format!(
                    "failed to estimate the controller frequency after {FREQUENCY_DETECTION_ATTEMPTS} attempts"
                )));
            }
            debug!("license timer counter was reloaded mid-sample; taking another sample");
            continue;
        }
        break (counter_start - counter_end, time_end - time_start);
    };

    let seconds = elapsed.as_secs_f64();
    let measured = (ticks as f64 / seconds / 1e6).ceil() as i32;
    debug!(
        seconds,
        ticks, measured_mhz = measured, "estimated controller frequency"
    );

    let mut state = inner.state.lock();
    let configured = state.frequency_curr;
    let deviation = 100.0 * f64::from((measured - configured).abs()) / f64::from(configured);
    if deviation >= threshold {
        state.frequency_curr = measured;
        return Err(DrmError::BadFrequency(format!(
            "estimated controller frequency ({measured} MHz) differs from the value \
             ({} MHz) defined in the configuration file by more than {threshold}%: \
             the considered frequency is now {measured} MHz",
            inner.frequency_init
        )));
    }
    debug!(
        measured_mhz = measured,
        configured_mhz = configured,
        deviation_pct = deviation,
        "controller frequency matches the configuration"
    );
    Ok(())
}
