//! Precision sleeper
//!
//! OS sleeps have multi-millisecond granularity on many schedulers. To hit
//! sub-millisecond deadlines we sleep coarsely until we are within
//! [`SPIN_THRESHOLD`] of the deadline, then poll the monotonic clock for the
//! remainder.

use std::time::{Duration, Instant};

/// Tail of every wait that is busy-waited instead of slept
pub const SPIN_THRESHOLD: Duration = Duration::from_micros(1500);

/// Sleep for at least `duration`
///
/// Not interruptible; callers check cancellation before and after.
pub fn sleep_precise(duration: Duration) {
    if duration.is_zero() {
        return;
    }
    sleep_until_precise(Instant::now() + duration);
}

/// Sleep until `deadline` has passed
///
/// Returns immediately if the deadline is already in the past.
pub fn sleep_until_precise(deadline: Instant) {
    let now = Instant::now();
    if deadline <= now {
        return;
    }

    let remaining = deadline - now;
    if remaining > SPIN_THRESHOLD {
        std::thread::sleep(remaining - SPIN_THRESHOLD);
    }

    while Instant::now() < deadline {
        std::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sleep_precise_never_returns_early() {
        for micros in [0u64, 200, 1_000, 1_500, 3_000, 12_000] {
            let duration = Duration::from_micros(micros);
            let start = Instant::now();
            sleep_precise(duration);
            assert!(start.elapsed() >= duration, "returned early for {:?}", duration);
        }
    }

    #[test]
    fn test_sleep_precise_accuracy() {
        let duration = Duration::from_millis(5);
        let start = Instant::now();
        sleep_precise(duration);
        let elapsed = start.elapsed();
        // Generous bound to tolerate loaded CI hosts
        assert!(elapsed < duration + Duration::from_millis(20), "overshoot: {:?}", elapsed);
    }

    #[test]
    fn test_past_deadline_returns_immediately() {
        let deadline = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        let start = Instant::now();
        sleep_until_precise(deadline);
        assert!(start.elapsed() < Duration::from_millis(1));
    }
}
