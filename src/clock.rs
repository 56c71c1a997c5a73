//! Wall-clock time and id generation.
//!
//! OmniQ's notion of "now" is milliseconds since the Unix epoch, taken from
//! [`chrono::Utc`] exactly as the teacher crate does (`Utc::now().timestamp()`),
//! just at millisecond rather than second resolution since leases are
//! sub-second sensitive.

use ulid::Ulid;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a fresh job id.
///
/// ULIDs are lexicographically sortable by their leading 48-bit time
/// component, which is what gives us property P3 (successive `publish`
/// calls produce ordered ids) for free.
pub fn new_job_id() -> String {
    Ulid::new().to_string()
}

/// `paused_backoff_s(poll) = max(0.25, poll * 10)`.
pub fn paused_backoff_s(poll_interval_s: f64) -> f64 {
    (poll_interval_s * 10.0).max(0.25)
}

/// `derive_heartbeat_interval_s(timeout_ms) = clamp(timeout_ms / 2000, 1, 10)`.
pub fn derive_heartbeat_interval_s(timeout_ms: i64) -> f64 {
    let raw = timeout_ms as f64 / 2000.0;
    raw.clamp(1.0, 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paused_backoff_has_floor() {
        assert_eq!(paused_backoff_s(0.0), 0.25);
        assert_eq!(paused_backoff_s(0.01), 0.25);
    }

    #[test]
    fn paused_backoff_scales_with_poll() {
        assert_eq!(paused_backoff_s(0.05), 0.5);
        assert_eq!(paused_backoff_s(1.0), 10.0);
    }

    #[test]
    fn heartbeat_interval_clamps_low() {
        assert_eq!(derive_heartbeat_interval_s(1000), 1.0);
    }

    #[test]
    fn heartbeat_interval_midrange() {
        assert_eq!(derive_heartbeat_interval_s(4000), 2.0);
    }

    #[test]
    fn heartbeat_interval_clamps_high() {
        assert_eq!(derive_heartbeat_interval_s(30_000), 10.0);
    }

    #[test]
    fn successive_ids_are_ordered() {
        let a = new_job_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = new_job_id();
        assert!(a < b, "expected {a} < {b}");
    }
}
