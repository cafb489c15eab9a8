use chrono::Utc;
use serde::Serialize;

use crate::config::TimestampPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TimestampRejection {
    Stale,
    FutureDated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimestampCheck {
    pub is_valid: bool,
    /// Negative when the timestamp is ahead of the server clock
    pub age_secs: i64,
    pub reason: Option<TimestampRejection>,
}

/// Rejects stale or future-dated readings. Age is always recomputed from the clock.
#[derive(Debug, Clone)]
pub struct TimestampValidator {
    policy: TimestampPolicy,
}

impl TimestampValidator {
    pub fn new(policy: TimestampPolicy) -> Self {
        Self { policy }
    }

    pub fn validate(&self, timestamp: i64, now: i64, max_staleness_secs: i64) -> TimestampCheck {
        let age_secs = now.saturating_sub(timestamp);

        let reason = if age_secs < -self.policy.clock_skew_tolerance_secs {
            Some(TimestampRejection::FutureDated)
        } else if age_secs > max_staleness_secs {
            Some(TimestampRejection::Stale)
        } else {
            None
        };

        TimestampCheck {
            is_valid: reason.is_none(),
            age_secs,
            reason,
        }
    }

    pub fn validate_now(&self, timestamp: i64, max_staleness_secs: i64) -> TimestampCheck {
        self.validate(timestamp, Utc::now().timestamp(), max_staleness_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> TimestampValidator {
        TimestampValidator::new(TimestampPolicy::default())
    }

    #[test]
    fn twenty_minute_old_point_is_stale_at_five_minutes() {
        let now = 1_700_000_000;
        let check = validator().validate(now - 20 * 60, now, 300);
        assert!(!check.is_valid);
        assert_eq!(check.age_secs, 1200);
        assert_eq!(check.reason, Some(TimestampRejection::Stale));
    }

    #[test]
    fn boundary_age_is_accepted() {
        let now = 1_700_000_000;
        assert!(validator().validate(now - 300, now, 300).is_valid);
        assert!(!validator().validate(now - 301, now, 300).is_valid);
    }

    #[test]
    fn small_clock_skew_is_tolerated() {
        let now = 1_700_000_000;
        let check = validator().validate(now + 30, now, 300);
        assert!(check.is_valid);
        assert_eq!(check.age_secs, -30);

        let far_future = validator().validate(now + 61, now, 300);
        assert_eq!(far_future.reason, Some(TimestampRejection::FutureDated));
    }

    #[test]
    fn validate_now_reads_the_clock() {
        let fresh = Utc::now().timestamp() - 5;
        assert!(validator().validate_now(fresh, 60).is_valid);
        assert!(!validator().validate_now(fresh - 3600, 60).is_valid);
    }
}
