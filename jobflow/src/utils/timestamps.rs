//! Timestamp utilities.

use chrono::{DateTime, Duration, Utc};

/// Represents a timestamp that can be serialized/deserialized.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the current time, bumped forward if needed so it is strictly
/// later than `previous`.
///
/// The wall clock can stall or step backwards; a re-queued job must still
/// sort after its old position.
#[must_use]
pub fn strictly_after(previous: Timestamp) -> Timestamp {
    let now = Utc::now();
    if now > previous {
        now
    } else {
        previous + Duration::microseconds(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_utc_is_recent() {
        let before = Utc::now();
        let now = now_utc();
        assert!(now >= before);
    }

    #[test]
    fn test_strictly_after_past_value() {
        let past = Utc::now() - Duration::seconds(10);
        assert!(strictly_after(past) > past);
    }

    #[test]
    fn test_strictly_after_future_value() {
        let future = Utc::now() + Duration::hours(1);
        let bumped = strictly_after(future);
        assert!(bumped > future);
        assert_eq!(bumped - future, Duration::microseconds(1));
    }
}
