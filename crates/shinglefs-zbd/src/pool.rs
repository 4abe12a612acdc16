//! The device-wide zone pool: open sequence, metadata reserve, space
//! accounting, and reporting.

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::json;
use tracing::{debug, error, info};

use crate::backend::ZonedBackend;
use crate::config::PoolConfig;
use crate::error::{ZbdError, ZbdResult};
use crate::lifetime::Lifetime;
use crate::metrics::PoolMetrics;
use crate::migrate::MigrateGate;
use crate::tokens::ZoneTokens;
use crate::wear::{reset_count_std_dev, QpsTracker, WearLeveler};
use crate::zone::{Zone, ZoneSnapshot};

/// Zones reserved for metadata. Two non-offline zones are needed to roll the
/// metadata log safely; one extra covers a zone going offline.
pub const META_ZONES: usize = 3;

/// Minimum number of zones that makes sense for a pool.
pub const ZBD_MIN_ZONES: u32 = 32;

/// Device quota headroom held back for metadata and migration.
const RESERVED_ZONES: u32 = 2;

/// Pool of zones on a single zoned device.
///
/// Owns the metadata reserve and the I/O zone set, arbitrates open/active
/// tokens, and drives the wear-leveling trigger. Writers receive
/// `Arc<Zone>` handles with the busy flag held; tokens travel separately
/// and are returned through [`ZonePool::put_open_io_zone_token`] and
/// [`ZonePool::put_active_io_zone_token`].
pub struct ZonePool {
    pub(crate) backend: Arc<dyn ZonedBackend>,
    pub(crate) config: PoolConfig,
    pub(crate) meta_zones: Vec<Arc<Zone>>,
    pub(crate) io_zones: Vec<Arc<Zone>>,
    pub(crate) tokens: ZoneTokens,
    pub(crate) migrate: MigrateGate,
    pub(crate) wear: WearLeveler,
    pub(crate) qps: QpsTracker,
    pub(crate) metrics: Arc<PoolMetrics>,
    deferred_status: Mutex<Option<ZbdError>>,
    start_time: Instant,
}

impl std::fmt::Debug for ZonePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZonePool")
            .field("config", &self.config)
            .field("meta_zones", &self.meta_zones)
            .field("io_zones", &self.io_zones)
            .finish()
    }
}

impl ZonePool {
    /// Opens the pool over a backend: validates geometry, computes effective
    /// quotas, reserves the metadata ring, and normalizes I/O zone state.
    pub fn open(backend: Arc<dyn ZonedBackend>, config: PoolConfig) -> ZbdResult<Self> {
        if !config.readonly && !config.exclusive {
            return Err(ZbdError::InvalidArgument(
                "write opens must be exclusive".to_string(),
            ));
        }

        let limits = backend.open(config.readonly, config.exclusive)?;
        let nr_zones = backend.nr_zones();
        if nr_zones < ZBD_MIN_ZONES {
            return Err(ZbdError::NotSupported(format!(
                "too few zones on zoned backend ({ZBD_MIN_ZONES} required)"
            )));
        }

        let max_active = if limits.max_active_zones == 0 {
            nr_zones
        } else {
            limits.max_active_zones.saturating_sub(RESERVED_ZONES)
        };
        let max_open = if limits.max_open_zones == 0 {
            nr_zones
        } else {
            limits.max_open_zones.saturating_sub(RESERVED_ZONES)
        };

        info!(
            device = %backend.describe(),
            nr_zones,
            max_active = limits.max_active_zones,
            max_open = limits.max_open_zones,
            "opened zoned block device"
        );

        let reports = backend.list_zones()?;
        if reports.len() != nr_zones as usize {
            error!("failed to list zones");
            return Err(ZbdError::Io("failed to list zones".to_string()));
        }

        let metrics = Arc::new(PoolMetrics::new());
        let mut meta_zones = Vec::with_capacity(META_ZONES);
        let mut io_zones = Vec::new();

        // The first META_ZONES sequential-write-required slots form the
        // metadata ring; an offline zone among them burns its slot.
        let mut i = 0;
        let mut m = 0;
        while m < META_ZONES && i < reports.len() {
            let report = &reports[i];
            if report.swr {
                if !report.offline {
                    meta_zones.push(Arc::new(Zone::new(
                        report,
                        backend.clone(),
                        metrics.clone(),
                    )));
                }
                m += 1;
            }
            i += 1;
        }

        let tokens = ZoneTokens::new(max_open, max_active);
        let mut active_seed = 0u32;
        for report in &reports[i..] {
            if !report.swr || report.offline {
                continue;
            }
            let zone = Arc::new(Zone::new(report, backend.clone(), metrics.clone()));
            if !zone.acquire() {
                debug_assert!(false, "fresh zone already busy");
                return Err(ZbdError::Corruption(format!(
                    "failed to set busy flag of zone {}",
                    zone.zone_nr()
                )));
            }
            if report.active {
                active_seed += 1;
                if report.open && !config.readonly {
                    zone.close()?;
                }
            }
            io_zones.push(zone.clone());
            zone.check_release()?;
        }
        tokens.seed_active(active_seed);

        let wear = WearLeveler::new(nr_zones as u64, config.reset_ratio_threshold_pct);
        let qps = QpsTracker::new(config.idle_qps_write, config.idle_qps_read);

        Ok(Self {
            backend,
            config,
            meta_zones,
            io_zones,
            tokens,
            migrate: MigrateGate::new(),
            wear,
            qps,
            metrics,
            deferred_status: Mutex::new(None),
            start_time: Instant::now(),
        })
    }

    /// Resets a zone and feeds the wear-leveling probe. The zone must be
    /// busy-held by the caller and hold no live data.
    pub fn reset_zone(&self, zone: &Zone) -> ZbdResult<()> {
        zone.reset_inner()?;

        let meta_resets: u64 = self
            .meta_zones
            .iter()
            .map(|z| z.reset_count() as u64)
            .sum();
        self.wear.on_zone_reset(meta_resets, || {
            let counts: Vec<u32> = self.io_zones.iter().map(|z| z.reset_count()).collect();
            reset_count_std_dev(&counts)
        });
        Ok(())
    }

    /// Walks the I/O zones and resets every zone that is neither empty nor
    /// holding live data, returning the active token of each non-full one.
    pub fn reset_unused_io_zones(&self) -> ZbdResult<()> {
        for zone in &self.io_zones {
            if !zone.acquire() {
                continue;
            }
            if !zone.is_empty() && !zone.is_used() {
                let was_full = zone.is_full();
                let reset_status = self.reset_zone(zone);
                let release_status = zone.check_release();
                reset_status?;
                release_status?;
                if !was_full {
                    self.tokens.put_active_token();
                }
            } else {
                zone.check_release()?;
            }
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes from `offset`, retrying partial reads.
    /// Returns the number of bytes read, which is short only at end of
    /// device.
    pub fn read(&self, buf: &mut [u8], offset: u64, direct: bool) -> ZbdResult<usize> {
        self.metrics.report_read_qps();

        let mut done = 0usize;
        let mut pos = offset;
        while done < buf.len() {
            let n = self.backend.read(&mut buf[done..], pos, direct)?;
            if n == 0 {
                break;
            }
            done += n;
            pos += n as u64;
        }
        Ok(done)
    }

    /// Drops any cached data for the given range.
    pub fn invalidate_cache(&self, pos: u64, size: u64) -> ZbdResult<()> {
        self.backend.invalidate_cache(pos, size)
    }

    /// The I/O zone containing the given byte offset, if any.
    pub fn get_io_zone(&self, offset: u64) -> Option<Arc<Zone>> {
        let zone_size = self.backend.zone_size();
        self.io_zones
            .iter()
            .find(|z| z.start() <= offset && offset < z.start() + zone_size)
            .cloned()
    }

    /// Sum of remaining writable capacity over the I/O zones.
    pub fn free_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.capacity()).sum()
    }

    /// Sum of live data over the I/O zones.
    pub fn used_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.used_capacity()).sum()
    }

    /// Dead bytes in full zones, reclaimable by reset.
    pub fn reclaimable_space(&self) -> u64 {
        self.io_zones
            .iter()
            .filter(|z| z.is_full())
            .map(|z| z.max_capacity().saturating_sub(z.used_capacity()))
            .sum()
    }

    /// Zones holding live data whose lifetime hint was never set; relocation
    /// sources for the wear-leveling worker.
    pub fn lifetime_zero_zones(&self) -> Vec<Arc<Zone>> {
        self.io_zones
            .iter()
            .filter(|z| z.is_used() && z.lifetime() == Lifetime::NotSet)
            .cloned()
            .collect()
    }

    /// Per-zone reset counts in I/O zone order.
    pub fn io_zone_reset_counts(&self) -> Vec<u32> {
        self.io_zones.iter().map(|z| z.reset_count()).collect()
    }

    /// Seeds per-zone reset counts, e.g. to restore wear-leveling state.
    pub fn set_io_zone_reset_counts(&self, counts: &[u32]) {
        for (zone, &count) in self.io_zones.iter().zip(counts) {
            zone.set_reset_count(count);
        }
    }

    /// Immutable snapshot of every I/O zone.
    pub fn zone_snapshot(&self) -> Vec<ZoneSnapshot> {
        self.io_zones.iter().map(|z| z.snapshot()).collect()
    }

    /// JSON rendering of the meta and I/O zone sets.
    pub fn encode_json(&self) -> serde_json::Value {
        let meta: Vec<ZoneSnapshot> = self.meta_zones.iter().map(|z| z.snapshot()).collect();
        let io: Vec<ZoneSnapshot> = self.io_zones.iter().map(|z| z.snapshot()).collect();
        json!({ "meta": meta, "io": io })
    }

    /// The deferred I/O error, if one has been latched.
    pub fn deferred_status(&self) -> Option<ZbdError> {
        self.deferred_status.lock().clone()
    }

    /// Latches an asynchronous write error. The first error wins; every
    /// subsequent allocation fails with it.
    pub fn set_deferred_status(&self, status: ZbdError) {
        let mut deferred = self.deferred_status.lock();
        if deferred.is_none() {
            *deferred = Some(status);
        }
    }

    /// Blocks until an open-zone token is available.
    pub fn wait_for_open_io_zone_token(&self, prioritized: bool) {
        self.tokens.wait_open_token(prioritized);
    }

    /// Takes an active-zone token if one is available.
    pub fn get_active_io_zone_token_if_available(&self) -> bool {
        self.tokens.try_active_token()
    }

    /// Returns an open-zone token.
    pub fn put_open_io_zone_token(&self) {
        self.tokens.put_open_token();
    }

    /// Returns an active-zone token.
    pub fn put_active_io_zone_token(&self) {
        self.tokens.put_active_token();
    }

    /// Open I/O zones right now.
    pub fn open_io_zones(&self) -> u32 {
        self.tokens.open_count()
    }

    /// Active I/O zones right now.
    pub fn active_io_zones(&self) -> u32 {
        self.tokens.active_count()
    }

    /// Samples the QPS windows and reports whether the device is idle
    /// enough to run a relocation. Sleeps for two 100 ms windows.
    pub fn judge_qps_trend(&self) -> bool {
        self.qps.judge_qps_trend(&self.metrics)
    }

    /// Wear-leveling trigger state, for the worker and for tests.
    pub fn wear(&self) -> &WearLeveler {
        &self.wear
    }

    /// QPS idle-detection state.
    pub fn qps(&self) -> &QpsTracker {
        &self.qps
    }

    /// Shared metric counters.
    pub fn metrics(&self) -> Arc<PoolMetrics> {
        self.metrics.clone()
    }

    /// Write granularity in bytes.
    pub fn block_size(&self) -> u64 {
        self.backend.block_size()
    }

    /// Zone size in bytes.
    pub fn zone_size(&self) -> u64 {
        self.backend.zone_size()
    }

    /// Total zones on the device.
    pub fn nr_zones(&self) -> u32 {
        self.backend.nr_zones()
    }

    /// Zones available to the I/O allocator.
    pub fn nr_io_zones(&self) -> usize {
        self.io_zones.len()
    }

    /// Human-readable device identifier.
    pub fn filename(&self) -> String {
        self.backend.describe()
    }

    /// Logs the aggregate zone statistics line.
    pub fn log_zone_stats(&self) {
        let mut used_capacity = 0u64;
        let mut reclaimable_capacity = 0u64;
        let mut reclaimables_max_capacity = 0u64;
        let mut partial = 0u64;

        for zone in &self.io_zones {
            let used = zone.used_capacity();
            used_capacity += used;
            if used > 0 {
                reclaimable_capacity += zone.max_capacity().saturating_sub(used);
                reclaimables_max_capacity += zone.max_capacity();
            }
            if !(zone.is_full() || zone.is_empty()) {
                partial += 1;
            }
        }
        if reclaimables_max_capacity == 0 {
            reclaimables_max_capacity = 1;
        }

        info!(
            uptime_s = self.start_time.elapsed().as_secs(),
            used_mb = used_capacity / (1024 * 1024),
            reclaimable_mb = reclaimable_capacity / (1024 * 1024),
            avg_reclaimable_pct = 100 * reclaimable_capacity / reclaimables_max_capacity,
            partial_zones = partial,
            active_zones = self.tokens.active_count(),
            open_zones = self.tokens.open_count(),
            "zone stats"
        );
    }

    /// Logs per-zone live-byte usage at debug level.
    pub fn log_zone_usage(&self) {
        for zone in &self.io_zones {
            let used = zone.used_capacity();
            if used > 0 {
                debug!(
                    zone = zone.zone_nr(),
                    used_bytes = used,
                    used_mb = used / (1024 * 1024),
                    "zone usage"
                );
            }
        }
    }

    /// Logs the garbage histogram: bucket 0 counts empty zones, buckets
    /// 1..=10 count zones with garbage below 10%..100%, bucket 11 counts
    /// fully-garbage zones.
    pub fn log_garbage_info(&self) {
        let mut garbage_buckets = [0u32; 12];
        for zone in &self.io_zones {
            if !zone.acquire() {
                continue;
            }
            if zone.is_empty() {
                garbage_buckets[0] += 1;
                zone.release();
                continue;
            }
            let written = if zone.is_full() {
                zone.max_capacity()
            } else {
                zone.wp() - zone.start()
            };
            let garbage_rate = if zone.max_capacity() == 0 {
                0.0
            } else {
                written.saturating_sub(zone.used_capacity()) as f64 / zone.max_capacity() as f64
            };
            let idx = (((garbage_rate + 0.1) * 10.0) as usize).min(11);
            garbage_buckets[idx] += 1;
            zone.release();
        }
        info!(buckets = ?garbage_buckets, "zone garbage stats");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemBackend, MemBackendConfig};

    fn open_pool(backend_config: MemBackendConfig) -> (Arc<MemBackend>, ZonePool) {
        let backend = Arc::new(MemBackend::new(backend_config));
        let pool = ZonePool::open(backend.clone(), PoolConfig::default()).unwrap();
        (backend, pool)
    }

    #[test]
    fn test_open_rejects_too_few_zones() {
        let backend = Arc::new(MemBackend::new(MemBackendConfig {
            nr_zones: 16,
            ..MemBackendConfig::default()
        }));
        let err = ZonePool::open(backend, PoolConfig::default()).unwrap_err();
        assert!(matches!(err, ZbdError::NotSupported(_)));
    }

    #[test]
    fn test_open_rejects_non_exclusive_write() {
        let backend = Arc::new(MemBackend::new(MemBackendConfig::default()));
        let config = PoolConfig {
            exclusive: false,
            ..PoolConfig::default()
        };
        let err = ZonePool::open(backend, config).unwrap_err();
        assert!(matches!(err, ZbdError::InvalidArgument(_)));
    }

    #[test]
    fn test_open_classifies_meta_then_io() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        assert_eq!(pool.meta_zones.len(), META_ZONES);
        assert_eq!(pool.nr_io_zones(), 32 - META_ZONES);
        assert_eq!(pool.meta_zones[0].start(), 0);
        assert_eq!(pool.io_zones[0].start(), META_ZONES as u64 * 256 * 1024);
    }

    #[test]
    fn test_open_skips_conventional_zones() {
        let (_backend, pool) = open_pool(MemBackendConfig {
            nr_zones: 34,
            conv_zones: 2,
            ..MemBackendConfig::default()
        });
        // Conventional zones host neither meta nor I/O zones.
        assert_eq!(pool.meta_zones.len(), META_ZONES);
        assert_eq!(pool.meta_zones[0].zone_nr(), 2);
        assert_eq!(pool.nr_io_zones(), 34 - 2 - META_ZONES);
    }

    #[test]
    fn test_open_offline_meta_slot_burned() {
        let backend = Arc::new(MemBackend::new(MemBackendConfig::default()));
        backend.set_offline(1);
        let pool = ZonePool::open(backend, PoolConfig::default()).unwrap();
        // Zone 1 consumed a meta slot but is not part of the ring.
        assert_eq!(pool.meta_zones.len(), META_ZONES - 1);
        assert_eq!(pool.nr_io_zones(), 32 - META_ZONES);
    }

    #[test]
    fn test_open_normalizes_device_open_zones() {
        let backend = Arc::new(MemBackend::new(MemBackendConfig::default()));
        // Pre-write two I/O zones so the device reports them open.
        let zone_size = backend.zone_size();
        backend.write(&vec![1u8; 4096], 3 * zone_size).unwrap();
        backend.write(&vec![1u8; 4096], 4 * zone_size).unwrap();

        let pool = ZonePool::open(backend.clone(), PoolConfig::default()).unwrap();
        assert_eq!(pool.active_io_zones(), 2);
        let reports = backend.list_zones().unwrap();
        assert!(!reports[3].open);
        assert!(reports[3].active);
    }

    #[test]
    fn test_effective_quotas() {
        let (_backend, pool) = open_pool(MemBackendConfig {
            max_open_zones: 10,
            max_active_zones: 12,
            ..MemBackendConfig::default()
        });
        assert_eq!(pool.tokens.max_open(), 8);
        assert_eq!(pool.tokens.max_active(), 10);
    }

    #[test]
    fn test_unreported_quotas_fall_back_to_zone_count() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        assert_eq!(pool.tokens.max_open(), 32);
        assert_eq!(pool.tokens.max_active(), 32);
    }

    #[test]
    fn test_space_accounting() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        let zone_size = pool.zone_size();
        let io_zones = pool.nr_io_zones() as u64;
        assert_eq!(pool.free_space(), io_zones * zone_size);
        assert_eq!(pool.used_space(), 0);
        assert_eq!(pool.reclaimable_space(), 0);

        let zone = &pool.io_zones[0];
        assert!(zone.acquire());
        zone.append(&vec![0u8; 8192]).unwrap();
        zone.add_used_capacity(4096);
        zone.finish().unwrap();
        zone.release();

        assert_eq!(pool.free_space(), (io_zones - 1) * zone_size);
        assert_eq!(pool.used_space(), 4096);
        assert_eq!(pool.reclaimable_space(), zone_size - 4096);
    }

    #[test]
    fn test_reset_unused_restores_capacity() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        let zone = pool.io_zones[0].clone();
        assert!(pool.get_active_io_zone_token_if_available());
        assert!(zone.acquire());
        zone.append(&vec![0u8; 8192]).unwrap();
        zone.release();

        pool.reset_unused_io_zones().unwrap();
        assert!(zone.is_empty());
        assert_eq!(zone.capacity(), pool.zone_size());
        assert_eq!(zone.reset_count(), 1);
    }

    #[test]
    fn test_reset_unused_returns_active_tokens() {
        let backend = Arc::new(MemBackend::new(MemBackendConfig::default()));
        let zone_size = backend.zone_size();
        backend.write(&vec![1u8; 4096], 3 * zone_size).unwrap();
        backend.write(&vec![1u8; 4096], 4 * zone_size).unwrap();

        let pool = ZonePool::open(backend, PoolConfig::default()).unwrap();
        assert_eq!(pool.active_io_zones(), 2);
        pool.reset_unused_io_zones().unwrap();
        assert_eq!(pool.active_io_zones(), 0);
    }

    #[test]
    fn test_reset_unused_skips_used_zones() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        let zone = pool.io_zones[0].clone();
        assert!(zone.acquire());
        zone.append(&vec![0u8; 8192]).unwrap();
        zone.add_used_capacity(8192);
        zone.release();

        pool.reset_unused_io_zones().unwrap();
        assert!(!zone.is_empty());
        assert_eq!(zone.reset_count(), 0);
    }

    #[test]
    fn test_read_spans_partial_reads() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        let zone = pool.io_zones[0].clone();
        assert!(zone.acquire());
        zone.append(&vec![0x5au8; 8192]).unwrap();
        zone.release();

        let mut buf = vec![0u8; 8192];
        let n = pool.read(&mut buf, zone.start(), false).unwrap();
        assert_eq!(n, 8192);
        assert!(buf.iter().all(|&b| b == 0x5a));
    }

    #[test]
    fn test_get_io_zone() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        let zone_size = pool.zone_size();
        let zone = pool.get_io_zone(3 * zone_size + 17).unwrap();
        assert_eq!(zone.zone_nr(), 3);
        // Offsets inside the meta ring belong to no I/O zone.
        assert!(pool.get_io_zone(0).is_none());
    }

    #[test]
    fn test_deferred_status_sticky() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        assert!(pool.deferred_status().is_none());
        pool.set_deferred_status(ZbdError::Io("first".to_string()));
        pool.set_deferred_status(ZbdError::Io("second".to_string()));
        assert_eq!(pool.deferred_status(), Some(ZbdError::Io("first".to_string())));
    }

    #[test]
    fn test_encode_json_shape() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        let value = pool.encode_json();
        assert_eq!(value["meta"].as_array().unwrap().len(), META_ZONES);
        assert_eq!(
            value["io"].as_array().unwrap().len(),
            pool.nr_io_zones()
        );
        assert!(value["io"][0]["start"].is_u64());
    }

    #[test]
    fn test_reset_count_export_import() {
        let (_backend, pool) = open_pool(MemBackendConfig::default());
        let mut counts = pool.io_zone_reset_counts();
        assert!(counts.iter().all(|&c| c == 0));
        counts[0] = 7;
        pool.set_io_zone_reset_counts(&counts);
        assert_eq!(pool.io_zones[0].reset_count(), 7);
    }

    #[test]
    fn test_reopen_yields_same_layout() {
        let backend = Arc::new(MemBackend::new(MemBackendConfig::default()));
        let pool = ZonePool::open(backend.clone(), PoolConfig::default()).unwrap();
        let meta_starts: Vec<u64> = pool.meta_zones.iter().map(|z| z.start()).collect();
        let io_starts: Vec<u64> = pool.io_zones.iter().map(|z| z.start()).collect();
        drop(pool);

        let pool = ZonePool::open(backend, PoolConfig::default()).unwrap();
        assert_eq!(
            pool.meta_zones.iter().map(|z| z.start()).collect::<Vec<_>>(),
            meta_starts
        );
        assert_eq!(
            pool.io_zones.iter().map(|z| z.start()).collect::<Vec<_>>(),
            io_starts
        );
    }
}
