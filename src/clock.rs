//! Monotonic and realtime clocks, exposed as fractional seconds.
//!
//! Stall detection (`lastDataReceived`, see [`crate::device`]) uses the
//! monotonic clock exclusively: the original source mixed monotonic and
//! realtime reads across revisions, which would let a realtime clock step
//! (NTP correction, manual `date -s`) masquerade as device data, or cause
//! a spurious stall. Only WAV filename templating and reply timestamps use
//! realtime.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current monotonic time in fractional seconds, suitable only for deltas.
pub fn monotonic_now() -> f64 {
    let t = nix_clock_gettime_monotonic();
    t
}

/// Current wall-clock time in fractional seconds since the Unix epoch.
pub fn realtime_now() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

#[cfg(unix)]
fn nix_clock_gettime_monotonic() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: ts is a valid out-pointer for CLOCK_MONOTONIC.
    let rv = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    debug_assert_eq!(rv, 0, "clock_gettime(CLOCK_MONOTONIC) failed");
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}

#[cfg(not(unix))]
fn nix_clock_gettime_monotonic() -> f64 {
    use std::time::Instant;
    // Fall back to a process-local epoch; only deltas are ever compared.
    thread_local! {
        static EPOCH: Instant = Instant::now();
    }
    EPOCH.with(|e| e.elapsed().as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_is_nondecreasing() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }

    #[test]
    fn realtime_is_plausible() {
        // Sometime after 2020-01-01.
        assert!(realtime_now() > 1_577_836_800.0);
    }
}
