//! Lightweight metrics helpers for Atrium.
//!
//! This module exposes a small set of convenience functions and an RAII timer
//! wrapping the `metrics` crate macros. It does not embed an exporter (the
//! embedding application can install any compatible recorder) while still
//! describing the Atrium-specific metric names.
//!
//! Provided metrics (labels vary by family):
//! * `atrium_requests_total` (counter; method, status)
//! * `atrium_request_duration_seconds` (histogram; method)
//! * `atrium_config_reloads_total` (counter; outcome)
//! * `atrium_active_sessions` (gauge)
//! * `atrium_application_generation` (gauge per context path)
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use once_cell::sync::Lazy;

pub const ATRIUM_REQUESTS_TOTAL: &str = "atrium_requests_total";
pub const ATRIUM_REQUEST_DURATION_SECONDS: &str = "atrium_request_duration_seconds";
pub const ATRIUM_CONFIG_RELOADS_TOTAL: &str = "atrium_config_reloads_total"; // labels: outcome
pub const ATRIUM_ACTIVE_SESSIONS: &str = "atrium_active_sessions";
pub const ATRIUM_APPLICATION_GENERATION: &str = "atrium_application_generation"; // labels: context_path

/// Running totals of reload outcomes, kept for the status endpoint.
pub static RELOAD_OUTCOMES: Lazy<Mutex<HashMap<String, u64>>> = Lazy::new(|| {
    describe_counter!(
        ATRIUM_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP transactions completed."
    );
    describe_histogram!(
        ATRIUM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP transactions, including controller execution."
    );
    describe_counter!(
        ATRIUM_CONFIG_RELOADS_TOTAL,
        Unit::Count,
        "Definition file changes applied or rejected, by outcome."
    );
    describe_gauge!(
        ATRIUM_ACTIVE_SESSIONS,
        "Number of session ids currently tracked by the routing core."
    );
    describe_gauge!(
        ATRIUM_APPLICATION_GENERATION,
        "Definition generation of the live context of each application."
    );

    Mutex::new(HashMap::new())
});

/// Count a completed transaction.
pub fn increment_request_total(method: &str, status: u16) {
    counter!(
        ATRIUM_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(method: &str, duration: std::time::Duration) {
    histogram!(ATRIUM_REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Count one definition file change (`loaded`, `unloaded`, `rejected`, ...).
pub fn increment_config_reload(outcome: &str) {
    if let Ok(mut outcomes) = RELOAD_OUTCOMES.lock() {
        *outcomes.entry(outcome.to_string()).or_insert(0) += 1;
    } else {
        tracing::error!("Failed to acquire lock for reload outcome totals");
    }
    counter!(ATRIUM_CONFIG_RELOADS_TOTAL, "outcome" => outcome.to_string()).increment(1);
}

pub fn set_active_sessions(count: usize) {
    gauge!(ATRIUM_ACTIVE_SESSIONS).set(count as f64);
}

pub fn set_application_generation(context_path: &str, generation: u64) {
    gauge!(ATRIUM_APPLICATION_GENERATION, "context_path" => context_path.to_string())
        .set(generation as f64);
}

/// RAII helper measuring transaction duration.
pub struct RequestTimer {
    start: Instant,
    method: String,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.method, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Atrium metrics system");

    // Force lazy initialization of metrics descriptions
    Lazy::force(&RELOAD_OUTCOMES);

    tracing::info!("Atrium metrics system initialized successfully");
    Ok(())
}

/// Snapshot of reload outcome totals.
pub fn reload_outcomes() -> HashMap<String, u64> {
    RELOAD_OUTCOMES
        .lock()
        .map(|outcomes| outcomes.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reload_outcomes_accumulate() {
        let before = reload_outcomes().get("test-outcome").copied().unwrap_or(0);
        increment_config_reload("test-outcome");
        increment_config_reload("test-outcome");
        assert_eq!(reload_outcomes().get("test-outcome"), Some(&(before + 2)));
    }

    #[test]
    fn test_request_timer() {
        let timer = RequestTimer::new("GET");
        // Timer will record duration when dropped
        drop(timer);
    }

    #[test]
    fn test_init_metrics() {
        assert!(init_metrics().is_ok());
    }
}
