//! Zone allocation: lifetime-matched placement into open zones, wear-routed
//! selection of empty zones, and the metadata ring allocator.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{ZbdError, ZbdResult};
use crate::lifetime::{lifetime_diff, Lifetime, LIFETIME_DIFF_COULD_BE_WORSE, LIFETIME_DIFF_NOT_GOOD};
use crate::pool::ZonePool;
use crate::zone::Zone;

/// Class of I/O requesting an allocation. Write-ahead-log writers are
/// prioritized at the open-token gate and skip the finish sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoClass {
    /// Write-ahead log writes.
    Wal,
    /// Memtable flush output.
    Flush,
    /// Compaction output.
    Compaction,
    /// Anything else.
    Other,
}

impl IoClass {
    /// Whether this class is prioritized at the token gate.
    pub fn is_wal(self) -> bool {
        self == IoClass::Wal
    }
}

impl ZonePool {
    /// Allocates a zone for a new write with the given lifetime hint.
    ///
    /// Prefers a partially-written zone whose data outlives the file; opens
    /// a fresh zone when the best match is mediocre and an active slot can
    /// be had, finishing the cheapest zone if the device is out of active
    /// slots. Returns the zone busy-held with an open token (and, for a
    /// fresh zone, an active token) attached; `None` if no zone qualifies.
    pub fn allocate_io_zone(
        &self,
        file_lifetime: Lifetime,
        io_class: IoClass,
    ) -> ZbdResult<Option<Arc<Zone>>> {
        let t0 = Instant::now();

        if let Some(status) = self.deferred_status() {
            return Err(status);
        }

        if !io_class.is_wal() {
            self.apply_finish_threshold()?;
        }

        self.tokens.wait_open_token(io_class.is_wal());

        let (best_diff, mut allocated) = match self.best_open_zone_match(file_lifetime, 0) {
            Ok(found) => found,
            Err(e) => {
                self.tokens.put_open_token();
                return Err(e);
            }
        };

        let mut new_zone = false;
        if best_diff >= LIFETIME_DIFF_COULD_BE_WORSE {
            let got_token = self.tokens.try_active_token();

            // Without an active slot, a mediocre match beats finishing a
            // zone just to open a fresh one.
            if let Some(zone) = allocated.take() {
                if !got_token && best_diff == LIFETIME_DIFF_COULD_BE_WORSE {
                    debug!("allocator: avoided a finish by relaxing lifetime match");
                    allocated = Some(zone);
                } else if let Err(e) = zone.check_release() {
                    self.tokens.put_open_token();
                    if got_token {
                        self.tokens.put_active_token();
                    }
                    return Err(e);
                }
            }

            if allocated.is_none() {
                while !got_token && !self.tokens.try_active_token() {
                    if let Err(e) = self.finish_cheapest_io_zone() {
                        self.tokens.put_open_token();
                        return Err(e);
                    }
                }
                // An active token is held from here on.
                match self.allocate_empty_zone(file_lifetime) {
                    Ok(Some(zone)) => {
                        zone.set_lifetime(file_lifetime);
                        new_zone = true;
                        allocated = Some(zone);
                    }
                    Ok(None) => {
                        self.tokens.put_active_token();
                    }
                    Err(e) => {
                        self.tokens.put_active_token();
                        self.tokens.put_open_token();
                        return Err(e);
                    }
                }
            }
        }

        match &allocated {
            Some(zone) => {
                debug!(
                    new_zone,
                    start = zone.start(),
                    wp = zone.wp(),
                    zone_lifetime = ?zone.lifetime(),
                    file_lifetime = ?file_lifetime,
                    "allocated zone"
                );
            }
            None => self.tokens.put_open_token(),
        }

        if !io_class.is_wal() {
            self.log_zone_stats();
        }

        self.metrics.set_zone_gauges(
            self.tokens.open_count() as u64,
            self.tokens.active_count() as u64,
        );
        self.metrics.record_io_alloc(t0.elapsed());

        Ok(allocated)
    }

    /// Allocates a metadata zone from the reserved ring, resetting a
    /// non-empty unused zone on the way. The zone is returned busy-held;
    /// the caller releases it.
    pub fn allocate_meta_zone(&self) -> ZbdResult<Arc<Zone>> {
        let t0 = Instant::now();

        for zone in &self.meta_zones {
            if !zone.acquire() {
                continue;
            }
            if zone.is_used() {
                zone.check_release()?;
                continue;
            }
            if !zone.is_empty() {
                if let Err(e) = self.reset_zone(zone) {
                    warn!(zone = zone.zone_nr(), error = %e, "failed resetting meta zone");
                    zone.check_release()?;
                    continue;
                }
            }
            self.metrics.record_meta_alloc(t0.elapsed());
            return Ok(zone.clone());
        }

        error!("out of metadata zones, pool should go read-only");
        self.metrics.record_meta_alloc(t0.elapsed());
        Err(ZbdError::NoSpace("out of metadata zones".to_string()))
    }

    /// Finishes every non-empty, non-full zone whose remaining capacity has
    /// dropped below the configured fraction of its max capacity, returning
    /// one active token per finished zone.
    pub(crate) fn apply_finish_threshold(&self) -> ZbdResult<()> {
        if self.config.finish_threshold_pct == 0 {
            return Ok(());
        }

        for zone in &self.io_zones {
            if !zone.acquire() {
                continue;
            }
            let within_threshold =
                zone.capacity() < zone.max_capacity() * self.config.finish_threshold_pct / 100;
            if !(zone.is_empty() || zone.is_full()) && within_threshold {
                if let Err(e) = zone.finish() {
                    zone.release();
                    debug!(zone = zone.zone_nr(), "failed finishing zone");
                    return Err(e);
                }
                zone.check_release()?;
                self.tokens.put_active_token();
            } else {
                zone.check_release()?;
            }
        }
        Ok(())
    }

    /// Finishes the non-empty, non-full zone with the least remaining
    /// capacity, freeing one active token. Success with no victim means
    /// every non-busy zone was empty or full.
    pub(crate) fn finish_cheapest_io_zone(&self) -> ZbdResult<()> {
        let mut victim: Option<Arc<Zone>> = None;

        for zone in &self.io_zones {
            if !zone.acquire() {
                continue;
            }
            if zone.is_empty() || zone.is_full() {
                zone.check_release()?;
                continue;
            }
            match &victim {
                None => victim = Some(zone.clone()),
                Some(current) => {
                    if current.capacity() > zone.capacity() {
                        current.check_release()?;
                        victim = Some(zone.clone());
                    } else {
                        zone.check_release()?;
                    }
                }
            }
        }

        let Some(victim) = victim else {
            debug!("all non-busy zones are empty or full, nothing to finish");
            return Ok(());
        };

        let finish_status = victim.finish();
        let release_status = victim.check_release();
        if finish_status.is_ok() {
            self.tokens.put_active_token();
        }
        release_status?;
        finish_status
    }

    /// Scans partially-written zones holding live data with at least
    /// `min_capacity` remaining and picks the one whose lifetime best fits
    /// `file_lifetime`. The chosen zone is returned busy-held together with
    /// its score; callers treat `LIFETIME_DIFF_NOT_GOOD` as "no match".
    pub(crate) fn best_open_zone_match(
        &self,
        file_lifetime: Lifetime,
        min_capacity: u64,
    ) -> ZbdResult<(u32, Option<Arc<Zone>>)> {
        let mut best_diff = LIFETIME_DIFF_NOT_GOOD;
        let mut allocated: Option<Arc<Zone>> = None;

        for zone in &self.io_zones {
            if !zone.acquire() {
                continue;
            }
            if zone.is_used() && !zone.is_full() && zone.capacity() >= min_capacity {
                let diff = lifetime_diff(zone.lifetime(), file_lifetime);
                if diff <= best_diff {
                    if let Some(previous) = allocated.take() {
                        if let Err(e) = previous.check_release() {
                            let _ = zone.check_release();
                            return Err(e);
                        }
                    }
                    allocated = Some(zone.clone());
                    best_diff = diff;
                } else {
                    zone.check_release()?;
                }
            } else {
                zone.check_release()?;
            }
        }

        Ok((best_diff, allocated))
    }

    /// Picks an empty zone, routing by the data's expected lifetime: hot
    /// data goes to the most-reset zone, cold data to the least-reset one
    /// (stopping early at a never-reset zone). The zone is returned
    /// busy-held.
    pub(crate) fn allocate_empty_zone(
        &self,
        file_lifetime: Lifetime,
    ) -> ZbdResult<Option<Arc<Zone>>> {
        let hot = file_lifetime < Lifetime::Short;
        let mut allocated: Option<Arc<Zone>> = None;

        for zone in &self.io_zones {
            if !zone.acquire() {
                continue;
            }
            if !zone.is_empty() {
                zone.check_release()?;
                continue;
            }
            let better = match &allocated {
                None => true,
                Some(current) => {
                    if hot {
                        zone.reset_count() > current.reset_count()
                    } else {
                        zone.reset_count() < current.reset_count()
                    }
                }
            };
            if better {
                if let Some(previous) = allocated.take() {
                    if let Err(e) = previous.check_release() {
                        let _ = zone.check_release();
                        return Err(e);
                    }
                }
                allocated = Some(zone.clone());
                if !hot && zone.reset_count() == 0 {
                    break;
                }
            } else {
                zone.check_release()?;
            }
        }

        Ok(allocated)
    }
}
