//! Audit logging for operational events.
//!
//! All events are emitted via `tracing` with a dedicated target so they can be
//! filtered and formatted (e.g. JSON) separately from request logs.

use tracing::{info, warn};

const AUDIT_TARGET: &str = "cdxfed::audit";

/// A source's circuit breaker opened; it will be skipped until the window ends.
pub fn breaker_opened(source: &str, failures: usize, window_secs: f64) {
    warn!(
        target: AUDIT_TARGET,
        event = "breaker_opened",
        source = %source,
        failures = failures,
        window_secs = window_secs,
    );
}

/// A source's circuit breaker closed after its window elapsed.
pub fn breaker_closed(source: &str) {
    info!(
        target: AUDIT_TARGET,
        event = "breaker_closed",
        source = %source,
    );
}

/// Every dispatched source failed for one query.
pub fn all_sources_failed(url: &str, failed: usize) {
    warn!(
        target: AUDIT_TARGET,
        event = "all_sources_failed",
        url = %url,
        failed = failed,
    );
}

/// Log admin HTTP request (metrics, readiness, source listing).
pub fn admin_http_request(path: &str, status: u16) {
    info!(
        target: AUDIT_TARGET,
        event = "admin_http_request",
        path = %path,
        status = %status,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audit_target_is_static() {
        assert_eq!(AUDIT_TARGET, "cdxfed::audit");
    }
}
