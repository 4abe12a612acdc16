//! Wear-leveling trigger logic and QPS-based idle detection.
//!
//! Every zone reset feeds the [`WearLeveler`] probe. When I/O resets outpace
//! the adaptive reset-ratio threshold the worker condition variable is
//! signaled; the external wear-leveling worker then calls the idle detector
//! and, if the device is quiet, runs a relocation through the migrator.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::metrics::PoolMetrics;

/// Reset-ratio trigger state and the wear-leveling worker gate.
#[derive(Debug)]
pub struct WearLeveler {
    nr_zones: u64,
    total_reset_count: AtomicU64,
    check_reset_count: AtomicU64,
    reset_ratio_threshold: Mutex<f64>,
    trigger_count: AtomicU32,
    wakeup_count: AtomicU64,
    worker_parked: Mutex<bool>,
    worker_cv: Condvar,
}

impl WearLeveler {
    /// Creates the controller for a device with `nr_zones` zones.
    pub fn new(nr_zones: u64, reset_ratio_threshold_pct: f64) -> Self {
        Self {
            nr_zones,
            total_reset_count: AtomicU64::new(0),
            check_reset_count: AtomicU64::new(0),
            reset_ratio_threshold: Mutex::new(reset_ratio_threshold_pct),
            trigger_count: AtomicU32::new(0),
            wakeup_count: AtomicU64::new(0),
            worker_parked: Mutex::new(false),
            worker_cv: Condvar::new(),
        }
    }

    /// Accounts one zone reset and decides whether to signal the worker.
    ///
    /// `meta_resets_now` is the current sum over the metadata ring, so the
    /// ratio is computed over I/O resets only. `reset_count_std_dev` is
    /// evaluated lazily; it walks every I/O zone and is only needed when the
    /// threshold adapts.
    pub(crate) fn on_zone_reset<F>(&self, meta_resets_now: u64, reset_count_std_dev: F)
    where
        F: FnOnce() -> f64,
    {
        let total = self.total_reset_count.fetch_add(1, Ordering::Relaxed) + 1;
        if total <= self.nr_zones {
            return;
        }

        if self.check_reset_count.load(Ordering::Relaxed) < self.nr_zones {
            self.check_reset_count.store(self.nr_zones, Ordering::Relaxed);
        }

        let io_resets = total.saturating_sub(meta_resets_now);
        let diff = io_resets.saturating_sub(self.check_reset_count.load(Ordering::Relaxed));
        let threshold = *self.reset_ratio_threshold.lock();
        if (100 * diff) as f64 > io_resets as f64 * threshold && diff >= self.nr_zones {
            if self.trigger_count.load(Ordering::Relaxed) >= 2 {
                self.trigger_count.store(0, Ordering::Relaxed);
                self.adapt_threshold(reset_count_std_dev());
            }
            self.wakeup_worker();
            self.check_reset_count.store(io_resets, Ordering::Relaxed);
        }
    }

    /// Scales the trigger threshold by the observed reset-count dispersion:
    /// high dispersion lowers the bar for the next trigger, low dispersion
    /// raises it. The divisor is clamped positive and the threshold is kept
    /// inside [1, 100].
    fn adapt_threshold(&self, std_dev: f64) {
        let divisor = (1.0 + (std_dev - 1.5) / 1.5).max(0.1);
        let mut threshold = self.reset_ratio_threshold.lock();
        *threshold = (*threshold / divisor).clamp(1.0, 100.0);
        debug!(
            std_dev,
            threshold = *threshold,
            "adapted wear-leveling reset-ratio threshold"
        );
    }

    /// Signals the wear-leveling worker.
    pub fn wakeup_worker(&self) {
        {
            let mut parked = self.worker_parked.lock();
            *parked = false;
        }
        self.worker_cv.notify_one();
        self.wakeup_count.fetch_add(1, Ordering::Relaxed);
        self.trigger_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Parks the calling worker until the next wakeup or `timeout`.
    /// Returns true when woken by a trigger, false on timeout.
    pub fn wait_for_wakeup(&self, timeout: Duration) -> bool {
        let mut parked = self.worker_parked.lock();
        *parked = true;
        while *parked {
            if self.worker_cv.wait_for(&mut parked, timeout).timed_out() {
                *parked = false;
                return false;
            }
        }
        true
    }

    /// Resets accounted since the pool was opened, meta ring included.
    pub fn total_reset_count(&self) -> u64 {
        self.total_reset_count.load(Ordering::Relaxed)
    }

    /// I/O reset watermark at the last trigger.
    pub fn check_reset_count(&self) -> u64 {
        self.check_reset_count.load(Ordering::Relaxed)
    }

    /// Current reset-ratio threshold in percent.
    pub fn reset_ratio_threshold(&self) -> f64 {
        *self.reset_ratio_threshold.lock()
    }

    /// Times the worker condition variable has been signaled.
    pub fn wakeup_count(&self) -> u64 {
        self.wakeup_count.load(Ordering::Relaxed)
    }
}

/// Standard deviation of per-zone reset counts.
///
/// The mean is computed with integer division, matching the established
/// trigger behavior; the bias is small once counts grow past the zone count.
pub fn reset_count_std_dev(reset_counts: &[u32]) -> f64 {
    if reset_counts.is_empty() {
        return 0.0;
    }
    let n = reset_counts.len() as u64;
    let total: u64 = reset_counts.iter().map(|&c| c as u64).sum();
    let mean = (total / n) as f64;
    let sum: f64 = reset_counts
        .iter()
        .map(|&c| (c as f64 - mean).powi(2))
        .sum();
    (sum / n as f64).sqrt()
}

/// Write/read QPS sampling and the adaptive idle thresholds.
///
/// The detector takes two back-to-back 100 ms samples. Five consecutive
/// busy verdicts raise the thresholds toward the observed window maxima;
/// five consecutive idle verdicts restore the configured initial values.
#[derive(Debug)]
pub struct QpsTracker {
    initial_write_threshold: u64,
    initial_read_threshold: u64,
    write_threshold: AtomicU64,
    read_threshold: AtomicU64,
    window_write_max: AtomicU64,
    window_read_max: AtomicU64,
    fail_streak: AtomicU32,
    success_streak: AtomicU32,
}

/// Length of one QPS sampling window.
const QPS_WINDOW: Duration = Duration::from_millis(100);

impl QpsTracker {
    /// Creates the tracker with the configured initial idle thresholds.
    pub fn new(idle_qps_write: u64, idle_qps_read: u64) -> Self {
        Self {
            initial_write_threshold: idle_qps_write,
            initial_read_threshold: idle_qps_read,
            write_threshold: AtomicU64::new(idle_qps_write),
            read_threshold: AtomicU64::new(idle_qps_read),
            window_write_max: AtomicU64::new(0),
            window_read_max: AtomicU64::new(0),
            fail_streak: AtomicU32::new(0),
            success_streak: AtomicU32::new(0),
        }
    }

    /// Samples two 100 ms windows from the pool counters and judges whether
    /// the device is idle enough to run a relocation now.
    pub fn judge_qps_trend(&self, metrics: &PoolMetrics) -> bool {
        metrics.clear_qps_now();
        thread::sleep(QPS_WINDOW);
        let (write1, read1) = (metrics.write_qps_now(), metrics.read_qps_now());

        metrics.clear_qps_now();
        thread::sleep(QPS_WINDOW);
        let (write2, read2) = (metrics.write_qps_now(), metrics.read_qps_now());

        self.evaluate(write1, read1, write2, read2)
    }

    /// Deterministic core of the trend judgment over two window samples.
    pub(crate) fn evaluate(&self, write1: u64, read1: u64, write2: u64, read2: u64) -> bool {
        self.window_write_max
            .fetch_max(write1.max(write2), Ordering::Relaxed);
        self.window_read_max
            .fetch_max(read1.max(read2), Ordering::Relaxed);

        if self.fail_streak.load(Ordering::Relaxed) >= 5 {
            let write_max = self.window_write_max.load(Ordering::Relaxed);
            let read_max = self.window_read_max.load(Ordering::Relaxed);
            if write_max > self.write_threshold.load(Ordering::Relaxed) {
                let raised = (self.write_threshold.load(Ordering::Relaxed) + write_max) / 2;
                self.write_threshold.store(raised, Ordering::Relaxed);
            }
            if read_max > self.read_threshold.load(Ordering::Relaxed) {
                let raised = (self.read_threshold.load(Ordering::Relaxed) + read_max) / 2;
                self.read_threshold.store(raised, Ordering::Relaxed);
            }
            self.window_write_max.store(0, Ordering::Relaxed);
            self.window_read_max.store(0, Ordering::Relaxed);
            self.fail_streak.store(0, Ordering::Relaxed);
        }

        let thresholds_raised = self.write_threshold.load(Ordering::Relaxed)
            != self.initial_write_threshold
            || self.read_threshold.load(Ordering::Relaxed) != self.initial_read_threshold;
        if thresholds_raised && self.success_streak.load(Ordering::Relaxed) >= 5 {
            self.write_threshold
                .store(self.initial_write_threshold, Ordering::Relaxed);
            self.read_threshold
                .store(self.initial_read_threshold, Ordering::Relaxed);
            self.success_streak.store(0, Ordering::Relaxed);
        }

        let write_threshold = self.write_threshold.load(Ordering::Relaxed);
        let read_threshold = self.read_threshold.load(Ordering::Relaxed);

        let idle = if write1 < write_threshold && write2 < write_threshold {
            if read1 < read_threshold && read2 < read_threshold {
                true
            } else if read2 > read1 {
                false
            } else {
                // Reads above threshold but clearly decaying.
                100 * (read1 - read2) > read_threshold * 5
            }
        } else if write2 > write1 {
            false
        } else if read1 < read_threshold && read2 < read_threshold {
            // Writes above threshold but clearly decaying.
            100 * (write1 - write2) > write_threshold * 5
        } else {
            false
        };

        if idle {
            self.success_streak.fetch_add(1, Ordering::Relaxed);
            self.fail_streak.store(0, Ordering::Relaxed);
        } else {
            self.fail_streak.fetch_add(1, Ordering::Relaxed);
            self.success_streak.store(0, Ordering::Relaxed);
        }
        idle
    }

    /// Current write-QPS idle ceiling.
    pub fn write_threshold(&self) -> u64 {
        self.write_threshold.load(Ordering::Relaxed)
    }

    /// Current read-QPS idle ceiling.
    pub fn read_threshold(&self) -> u64 {
        self.read_threshold.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_std_dev_uniform_counts_is_zero() {
        assert_eq!(reset_count_std_dev(&[5, 5, 5, 5]), 0.0);
        assert_eq!(reset_count_std_dev(&[]), 0.0);
    }

    #[test]
    fn test_std_dev_integer_mean() {
        // Counts {0, 3}: the true mean is 1.5 but the integer mean is 1,
        // giving sqrt((1 + 4) / 2) instead of 1.5.
        let sd = reset_count_std_dev(&[0, 3]);
        assert!((sd - (2.5f64).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_probe_silent_until_total_exceeds_zone_count() {
        let wear = WearLeveler::new(8, 10.0);
        for _ in 0..8 {
            wear.on_zone_reset(0, || 0.0);
        }
        assert_eq!(wear.wakeup_count(), 0);
        assert_eq!(wear.check_reset_count(), 0);
    }

    #[test]
    fn test_probe_triggers_and_advances_watermark() {
        let wear = WearLeveler::new(8, 10.0);
        // First trigger requires io_resets - 8 >= 8, i.e. total 16.
        for _ in 0..16 {
            wear.on_zone_reset(0, || 0.0);
        }
        assert_eq!(wear.wakeup_count(), 1);
        assert_eq!(wear.check_reset_count(), 16);
    }

    #[test]
    fn test_probe_meta_resets_excluded() {
        let wear = WearLeveler::new(8, 10.0);
        // Half of the resets belong to the meta ring; io_resets stays below
        // the zone-count floor so no trigger fires.
        for _ in 0..16 {
            wear.on_zone_reset(8, || 0.0);
        }
        assert_eq!(wear.wakeup_count(), 0);
    }

    #[test]
    fn test_threshold_adapts_after_two_triggers() {
        let wear = WearLeveler::new(4, 10.0);
        // Drive enough resets for three triggers; high dispersion should
        // lower the threshold on the third.
        for _ in 0..200 {
            wear.on_zone_reset(0, || 6.0);
        }
        assert!(wear.wakeup_count() >= 3);
        assert!(wear.reset_ratio_threshold() < 10.0);
    }

    #[test]
    fn test_threshold_clamped() {
        let wear = WearLeveler::new(4, 10.0);
        wear.adapt_threshold(0.0);
        assert!(wear.reset_ratio_threshold() <= 100.0);
        for _ in 0..50 {
            wear.adapt_threshold(1000.0);
        }
        assert!(wear.reset_ratio_threshold() >= 1.0);
    }

    #[test]
    fn test_worker_wakeup() {
        let wear = Arc::new(WearLeveler::new(4, 10.0));
        let w = wear.clone();
        let worker = thread::spawn(move || w.wait_for_wakeup(Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(50));
        wear.wakeup_worker();
        assert!(worker.join().unwrap());
    }

    #[test]
    fn test_worker_timeout() {
        let wear = WearLeveler::new(4, 10.0);
        assert!(!wear.wait_for_wakeup(Duration::from_millis(20)));
    }

    #[test]
    fn test_qps_idle_when_both_windows_quiet() {
        let qps = QpsTracker::new(76, 5000);
        assert!(qps.evaluate(10, 100, 5, 50));
    }

    #[test]
    fn test_qps_busy_when_writes_rise() {
        let qps = QpsTracker::new(76, 5000);
        assert!(!qps.evaluate(100, 10, 200, 10));
    }

    #[test]
    fn test_qps_idle_when_writes_decay_sharply() {
        let qps = QpsTracker::new(76, 5000);
        // Reads quiet, writes above threshold but dropping by more than 5%
        // of the threshold.
        assert!(qps.evaluate(200, 10, 100, 10));
    }

    #[test]
    fn test_qps_busy_when_reads_rise() {
        let qps = QpsTracker::new(76, 5000);
        assert!(!qps.evaluate(10, 6000, 10, 7000));
    }

    #[test]
    fn test_qps_idle_when_reads_decay_sharply() {
        let qps = QpsTracker::new(76, 5000);
        assert!(qps.evaluate(10, 7000, 10, 6000));
    }

    #[test]
    fn test_qps_thresholds_raise_after_fail_streak_and_restore() {
        let qps = QpsTracker::new(76, 5000);
        for _ in 0..5 {
            assert!(!qps.evaluate(1000, 10, 2000, 10));
        }
        // Sixth sample runs the adaptation first.
        qps.evaluate(1000, 10, 2000, 10);
        assert!(qps.write_threshold() > 76);

        let raised = qps.write_threshold();
        for _ in 0..5 {
            assert!(qps.evaluate(1, 1, 0, 0));
        }
        assert_eq!(qps.write_threshold(), raised);
        // One more idle sample after the streak restores the initial values.
        qps.evaluate(1, 1, 0, 0);
        assert_eq!(qps.write_threshold(), 76);
        assert_eq!(qps.read_threshold(), 5000);
    }
}
