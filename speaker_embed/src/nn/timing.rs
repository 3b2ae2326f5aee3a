//! Per-stage wall-time instrumentation.
//!
//! Enable with `--features timing`. When disabled, every timing operation
//! compiles to a no-op.

#[cfg(feature = "timing")]
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "timing")]
use std::time::Instant;

/// Stage accumulators (in microseconds)
#[cfg(feature = "timing")]
pub static SPECTROGRAM_TIME_US: AtomicU64 = AtomicU64::new(0);
#[cfg(feature = "timing")]
pub static BACKBONE_TIME_US: AtomicU64 = AtomicU64::new(0);
#[cfg(feature = "timing")]
pub static POOLING_TIME_US: AtomicU64 = AtomicU64::new(0);
#[cfg(feature = "timing")]
pub static HEAD_TIME_US: AtomicU64 = AtomicU64::new(0);
#[cfg(feature = "timing")]
pub static BATCHNORM_TIME_US: AtomicU64 = AtomicU64::new(0);

/// Call counts
#[cfg(feature = "timing")]
pub static FORWARD_CALLS: AtomicU64 = AtomicU64::new(0);
#[cfg(feature = "timing")]
pub static BATCHNORM_CALLS: AtomicU64 = AtomicU64::new(0);

/// Reset all timing accumulators.
#[cfg(feature = "timing")]
pub fn reset_timings() {
    SPECTROGRAM_TIME_US.store(0, Ordering::Relaxed);
    BACKBONE_TIME_US.store(0, Ordering::Relaxed);
    POOLING_TIME_US.store(0, Ordering::Relaxed);
    HEAD_TIME_US.store(0, Ordering::Relaxed);
    BATCHNORM_TIME_US.store(0, Ordering::Relaxed);
    FORWARD_CALLS.store(0, Ordering::Relaxed);
    BATCHNORM_CALLS.store(0, Ordering::Relaxed);
}

/// Print the accumulated stage times and their share of the forward pass.
#[cfg(feature = "timing")]
pub fn print_timings() {
    let stages: [(&str, &AtomicU64); 4] = [
        ("Spectrogram", &SPECTROGRAM_TIME_US),
        ("Backbone", &BACKBONE_TIME_US),
        ("Pooling", &POOLING_TIME_US),
        ("Head", &HEAD_TIME_US),
    ];
    let micros: Vec<u64> = stages
        .iter()
        .map(|(_, c)| c.load(Ordering::Relaxed))
        .collect();
    let total: u64 = micros.iter().sum();

    println!(
        "\n=== Timing Summary ({} forward calls) ===",
        FORWARD_CALLS.load(Ordering::Relaxed)
    );
    for ((name, _), us) in stages.iter().zip(&micros) {
        let share = if total > 0 {
            *us as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        println!("{:<12} {:>8.2}ms ({:.1}%)", name, *us as f64 / 1000.0, share);
    }
    println!(
        "{:<12} {:>8.2}ms ({} calls, inside Backbone/Pooling/Head)",
        "BatchNorm",
        BATCHNORM_TIME_US.load(Ordering::Relaxed) as f64 / 1000.0,
        BATCHNORM_CALLS.load(Ordering::Relaxed)
    );
    println!("==========================================\n");
}

/// RAII timer that adds elapsed time to an atomic counter.
#[cfg(feature = "timing")]
pub struct Timer {
    start: Instant,
    counter: &'static AtomicU64,
}

#[cfg(feature = "timing")]
impl Timer {
    #[inline]
    pub fn new(counter: &'static AtomicU64) -> Self {
        Self {
            start: Instant::now(),
            counter,
        }
    }
}

#[cfg(feature = "timing")]
impl Drop for Timer {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed().as_micros() as u64;
        self.counter.fetch_add(elapsed, Ordering::Relaxed);
    }
}

/// Increment a call counter.
#[cfg(feature = "timing")]
#[inline]
pub fn increment_calls(counter: &'static AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Time a block into a stage counter. No-op when timing is disabled.
#[macro_export]
macro_rules! timed {
    ($counter:expr, $block:expr) => {{
        #[cfg(feature = "timing")]
        {
            let _timer = $crate::nn::timing::Timer::new(&$counter);
            $block
        }
        #[cfg(not(feature = "timing"))]
        {
            $block
        }
    }};
}

/// Increment a call counter. No-op when timing is disabled.
#[macro_export]
macro_rules! increment_counter {
    ($counter:expr) => {
        #[cfg(feature = "timing")]
        {
            $crate::nn::timing::increment_calls(&$counter);
        }
    };
}

#[cfg(all(test, feature = "timing"))]
mod tests {
    use super::*;

    #[test]
    fn test_counters_reset() {
        crate::increment_counter!(FORWARD_CALLS);
        let value = crate::timed!(HEAD_TIME_US, 1 + 1);
        assert_eq!(value, 2);
        assert!(FORWARD_CALLS.load(Ordering::Relaxed) >= 1);

        // Other tests may run forward passes concurrently, so only the call is checked
        reset_timings();
    }
}
