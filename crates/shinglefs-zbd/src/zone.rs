//! Per-zone state: write pointer, capacity accounting, lifetime hint, and
//! the busy flag that gives one caller at a time mutation rights.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::backend::{ZoneReport, ZonedBackend};
use crate::error::{ZbdError, ZbdResult};
use crate::lifetime::Lifetime;
use crate::metrics::PoolMetrics;

/// One zone of the device.
///
/// All fields are atomics: the pool hands out `Arc<Zone>` handles, scans read
/// zone state without coordination, and mutation rights belong to whoever
/// holds the busy flag. Holding busy covers `wp`, `capacity`, `max_capacity`,
/// the lifetime hint, and device operations on the zone.
pub struct Zone {
    backend: Arc<dyn ZonedBackend>,
    metrics: Arc<PoolMetrics>,
    start: u64,
    zone_size: u64,
    block_size: u64,
    busy: AtomicBool,
    max_capacity: AtomicU64,
    capacity: AtomicU64,
    wp: AtomicU64,
    used_capacity: AtomicU64,
    lifetime: AtomicU8,
    reset_count: AtomicU32,
}

impl Zone {
    /// Builds a zone from its device report. Capacity is derived from the
    /// write pointer when the zone is writable, 0 otherwise.
    pub(crate) fn new(
        report: &ZoneReport,
        backend: Arc<dyn ZonedBackend>,
        metrics: Arc<PoolMetrics>,
    ) -> Self {
        let capacity = if report.writable {
            report.max_capacity - (report.wp - report.start)
        } else {
            0
        };
        let zone_size = backend.zone_size();
        let block_size = backend.block_size();
        Self {
            backend,
            metrics,
            start: report.start,
            zone_size,
            block_size,
            busy: AtomicBool::new(false),
            max_capacity: AtomicU64::new(report.max_capacity),
            capacity: AtomicU64::new(capacity),
            wp: AtomicU64::new(report.wp),
            used_capacity: AtomicU64::new(0),
            lifetime: AtomicU8::new(Lifetime::NotSet.as_raw()),
            reset_count: AtomicU32::new(0),
        }
    }

    /// Absolute byte offset of the zone on the device.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Current write pointer.
    pub fn wp(&self) -> u64 {
        self.wp.load(Ordering::Relaxed)
    }

    /// Remaining writable bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Relaxed)
    }

    /// Maximum writable bytes in this zone.
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity.load(Ordering::Relaxed)
    }

    /// Zone number derived from its position on the device.
    pub fn zone_nr(&self) -> u64 {
        self.start / self.zone_size
    }

    /// Whether nothing has been written since the last reset.
    pub fn is_empty(&self) -> bool {
        self.wp() == self.start
    }

    /// Whether no writable capacity remains.
    pub fn is_full(&self) -> bool {
        self.capacity() == 0
    }

    /// Whether the upper layer still references data in this zone.
    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0
    }

    /// Bytes the upper layer considers live in this zone.
    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::Relaxed)
    }

    /// Accounts bytes written on behalf of the upper layer.
    pub fn add_used_capacity(&self, bytes: u64) {
        self.used_capacity.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Releases the upper layer's claim on `bytes` of this zone.
    pub fn sub_used_capacity(&self, bytes: u64) {
        let prev = self.used_capacity.fetch_sub(bytes, Ordering::Relaxed);
        debug_assert!(prev >= bytes, "used capacity underflow");
    }

    /// Current lifetime hint of the data in the zone.
    pub fn lifetime(&self) -> Lifetime {
        Lifetime::from_raw(self.lifetime.load(Ordering::Relaxed))
    }

    /// Stamps the zone with a lifetime hint. Requires busy.
    pub fn set_lifetime(&self, lifetime: Lifetime) {
        debug_assert!(self.is_busy());
        self.lifetime.store(lifetime.as_raw(), Ordering::Relaxed);
    }

    /// Resets performed on this zone since the pool was opened.
    pub fn reset_count(&self) -> u32 {
        self.reset_count.load(Ordering::Relaxed)
    }

    /// Overwrites the reset counter; used to seed wear-leveling state.
    pub fn set_reset_count(&self, count: u32) {
        self.reset_count.store(count, Ordering::Relaxed);
    }

    /// Bytes that a relocation of the remaining live data would free.
    pub fn reclaimable_space(&self) -> u64 {
        let used = self.used_capacity();
        if self.is_full() {
            self.max_capacity().saturating_sub(used)
        } else {
            (self.wp() - self.start).saturating_sub(used)
        }
    }

    /// Tries to take exclusive mutation rights. Returns false if another
    /// caller holds them.
    pub fn acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Drops mutation rights. Returns false if they were not held.
    pub fn release(&self) -> bool {
        self.busy.swap(false, Ordering::Release)
    }

    /// Drops mutation rights, treating an unheld flag as corruption.
    pub fn check_release(&self) -> ZbdResult<()> {
        if !self.release() {
            debug_assert!(false, "released an unheld zone");
            return Err(ZbdError::Corruption(format!(
                "failed to unset busy flag of zone {}",
                self.zone_nr()
            )));
        }
        Ok(())
    }

    /// Whether some caller currently holds mutation rights.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    /// Device reset plus local state rollback. Pool-side accounting (total
    /// reset counter, wear-leveling probe) happens in the pool's reset entry
    /// point, which is the only caller.
    pub(crate) fn reset_inner(&self) -> ZbdResult<()> {
        debug_assert!(!self.is_used());
        debug_assert!(self.is_busy());

        let report = self.backend.reset(self.start)?;
        if report.offline {
            self.capacity.store(0, Ordering::Relaxed);
        } else {
            self.max_capacity.store(report.max_capacity, Ordering::Relaxed);
            self.capacity.store(report.max_capacity, Ordering::Relaxed);
        }
        self.wp.store(self.start, Ordering::Relaxed);
        self.lifetime
            .store(Lifetime::NotSet.as_raw(), Ordering::Relaxed);
        self.reset_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Forces the zone to full. Requires busy.
    pub fn finish(&self) -> ZbdResult<()> {
        debug_assert!(self.is_busy());

        self.backend.finish(self.start)?;
        self.capacity.store(0, Ordering::Relaxed);
        self.wp.store(self.start + self.zone_size, Ordering::Relaxed);
        Ok(())
    }

    /// Closes the zone on the device if it is neither empty nor full.
    /// Requires busy.
    pub fn close(&self) -> ZbdResult<()> {
        debug_assert!(self.is_busy());

        if !(self.is_empty() || self.is_full()) {
            self.backend.close(self.start)?;
        }
        Ok(())
    }

    /// Appends `data` at the write pointer. Requires busy; the size must be
    /// a multiple of the block size and fit the remaining capacity.
    pub fn append(&self, data: &[u8]) -> ZbdResult<()> {
        debug_assert!(self.is_busy());
        let t0 = Instant::now();
        self.metrics.report_write_qps();

        let size = data.len() as u64;
        if size % self.block_size != 0 {
            return Err(ZbdError::InvalidArgument(format!(
                "append of {} bytes is not a multiple of the {} byte block size",
                size, self.block_size
            )));
        }
        if self.capacity() < size {
            return Err(ZbdError::NoSpace(
                "not enough capacity for append".to_string(),
            ));
        }

        let mut written = 0usize;
        while written < data.len() {
            let n = self
                .backend
                .write(&data[written..], self.wp.load(Ordering::Relaxed))?;
            self.wp.fetch_add(n as u64, Ordering::Relaxed);
            self.capacity.fetch_sub(n as u64, Ordering::Relaxed);
            self.metrics.add_bytes_written(n as u64);
            written += n;
        }

        self.metrics.record_zone_write(t0.elapsed());
        Ok(())
    }

    /// Immutable copy of the zone state for reporting.
    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            start: self.start,
            wp: self.wp(),
            capacity: self.capacity(),
            max_capacity: self.max_capacity(),
            used_capacity: self.used_capacity(),
            lifetime: self.lifetime(),
            reset_count: self.reset_count(),
        }
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("start", &self.start)
            .field("wp", &self.wp())
            .field("capacity", &self.capacity())
            .field("max_capacity", &self.max_capacity())
            .field("used_capacity", &self.used_capacity())
            .field("lifetime", &self.lifetime())
            .field("reset_count", &self.reset_count())
            .field("busy", &self.is_busy())
            .finish()
    }
}

/// Point-in-time view of one zone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    /// Absolute byte offset of the zone.
    pub start: u64,
    /// Write pointer at snapshot time.
    pub wp: u64,
    /// Remaining writable bytes.
    pub capacity: u64,
    /// Maximum writable bytes.
    pub max_capacity: u64,
    /// Bytes the upper layer considers live.
    pub used_capacity: u64,
    /// Lifetime hint of the zone's data.
    pub lifetime: Lifetime,
    /// Resets since the pool was opened.
    pub reset_count: u32,
}
