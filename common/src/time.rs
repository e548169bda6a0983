//! Time utilities and protocol constants.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Default timings used when no configuration overrides them.
pub mod constants {
    use super::Duration;

    /// Upper bound on a single payment gateway call.
    pub fn gateway_call_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// How long an action waits for another action on the same project.
    pub fn project_lock_timeout() -> Duration {
        Duration::from_secs(5)
    }

    /// Internal retries after an optimistic version conflict.
    pub const MAX_PERSISTENCE_RETRIES: u32 = 3;
}

/// A timestamp (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Milliseconds elapsed since `since`, clamped at zero.
pub fn elapsed_ms(since: Timestamp) -> u64 {
    (now() - since).num_milliseconds().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_never_negative() {
        let future = now() + chrono::Duration::seconds(10);
        assert_eq!(elapsed_ms(future), 0);

        let past = now() - chrono::Duration::seconds(1);
        assert!(elapsed_ms(past) >= 1000);
    }

    #[test]
    fn test_defaults_are_bounded() {
        assert!(constants::gateway_call_timeout() > Duration::ZERO);
        assert!(constants::project_lock_timeout() > Duration::ZERO);
        assert!(constants::MAX_PERSISTENCE_RETRIES > 0);
    }
}
