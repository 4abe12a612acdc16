//! Migration target/source selection for wear leveling and garbage
//! collection. One migration runs at a time; callers serialize through the
//! migrate gate.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::info;

use crate::error::{ZbdError, ZbdResult};
use crate::lifetime::{lifetime_diff, Lifetime, LIFETIME_DIFF_NOT_GOOD};
use crate::pool::ZonePool;
use crate::zone::Zone;

/// Serializes migrations: held from target selection until
/// [`ZonePool::release_migrate_zone`].
#[derive(Debug, Default)]
pub(crate) struct MigrateGate {
    migrating: Mutex<bool>,
    cv: Condvar,
}

impl MigrateGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Blocks until no migration is in flight, then claims the gate.
    fn acquire(&self) {
        let mut migrating = self.migrating.lock();
        while *migrating {
            self.cv.wait(&mut migrating);
        }
        *migrating = true;
    }

    /// Opens the gate and wakes one waiter.
    fn release(&self) {
        *self.migrating.lock() = false;
        self.cv.notify_one();
    }
}

impl ZonePool {
    /// Claims the migrate gate and picks a partially-written relocation
    /// target with at least `min_capacity` remaining whose lifetime fits.
    ///
    /// On success the zone is busy-held with a prioritized open token
    /// attached and the gate stays claimed until
    /// [`ZonePool::release_migrate_zone`]. `None` means no partially-written
    /// target exists; the gate is dropped and the caller may fall back to
    /// [`ZonePool::get_migrate_target_zone`].
    pub fn take_migrate_zone(
        &self,
        file_lifetime: Lifetime,
        min_capacity: u64,
    ) -> ZbdResult<Option<Arc<Zone>>> {
        self.migrate.acquire();
        self.tokens.wait_open_token(true);

        match self.best_open_zone_match(file_lifetime, min_capacity) {
            Ok((_, Some(zone))) => {
                info!(start = zone.start(), "take migrate zone");
                Ok(Some(zone))
            }
            Ok((_, None)) => {
                self.tokens.put_open_token();
                self.migrate.release();
                Ok(None)
            }
            Err(e) => {
                self.tokens.put_open_token();
                self.migrate.release();
                Err(e)
            }
        }
    }

    /// Claims the migrate gate and picks a relocation target, preferring an
    /// empty zone with the highest reset count so relocated (cold-leaning)
    /// data concentrates wear on already-hot zones.
    ///
    /// An empty target requires an active token; without one the search
    /// falls back to partially-written zones with at least `min_capacity`
    /// remaining and a tolerable lifetime fit, maximizing
    /// `reset_count × reclaimable / max_capacity`. The returned zone is
    /// busy-held with a prioritized open token (plus an active token when it
    /// was empty); the gate stays claimed until
    /// [`ZonePool::release_migrate_zone`].
    pub fn get_migrate_target_zone(
        &self,
        file_lifetime: Lifetime,
        min_capacity: u64,
    ) -> ZbdResult<Arc<Zone>> {
        self.migrate.acquire();
        self.tokens.wait_open_token(true);

        match self.migrate_target_scan(file_lifetime, min_capacity) {
            Ok(Some(zone)) => {
                info!(start = zone.start(), "take wear-leveling migrate zone");
                Ok(zone)
            }
            Ok(None) => {
                self.tokens.put_open_token();
                self.migrate.release();
                Err(ZbdError::NotFound(
                    "the migrate target zone was not found".to_string(),
                ))
            }
            Err(e) => {
                self.tokens.put_open_token();
                self.migrate.release();
                Err(e)
            }
        }
    }

    fn migrate_target_scan(
        &self,
        file_lifetime: Lifetime,
        min_capacity: u64,
    ) -> ZbdResult<Option<Arc<Zone>>> {
        // Empty zone with the highest reset count.
        let mut target: Option<Arc<Zone>> = None;
        for zone in &self.io_zones {
            if !zone.acquire() {
                continue;
            }
            if zone.is_empty()
                && target
                    .as_ref()
                    .map_or(true, |t| zone.reset_count() > t.reset_count())
            {
                if let Some(previous) = target.take() {
                    if let Err(e) = previous.check_release() {
                        let _ = zone.check_release();
                        return Err(e);
                    }
                }
                target = Some(zone.clone());
            } else {
                zone.check_release()?;
            }
        }

        if let Some(zone) = target {
            if self.tokens.try_active_token() {
                zone.set_lifetime(file_lifetime);
                return Ok(Some(zone));
            }
            // No active slot for an empty zone; fall back to a
            // partially-written target.
            zone.release();
        }

        let mut best: Option<Arc<Zone>> = None;
        let mut best_score = 0u64;
        for zone in &self.io_zones {
            if !zone.acquire() {
                continue;
            }
            if zone.is_used()
                && !zone.is_full()
                && zone.capacity() >= min_capacity
                && zone.max_capacity() > 0
            {
                let score = zone.reset_count() as u64 * zone.reclaimable_space()
                    / zone.max_capacity();
                let better = best.as_ref().map_or(true, |b| {
                    score > best_score
                        || (score == best_score && zone.reset_count() > b.reset_count())
                });
                if better && lifetime_diff(zone.lifetime(), file_lifetime) != LIFETIME_DIFF_NOT_GOOD
                {
                    if let Some(previous) = best.take() {
                        if let Err(e) = previous.check_release() {
                            let _ = zone.check_release();
                            return Err(e);
                        }
                    }
                    best = Some(zone.clone());
                    best_score = score;
                } else {
                    zone.check_release()?;
                }
            } else {
                zone.check_release()?;
            }
        }

        Ok(best)
    }

    /// Ends a migration: releases the zone's busy flag and opens the gate.
    /// Tokens attached to the zone are returned separately by the caller.
    pub fn release_migrate_zone(&self, zone: Option<&Zone>) -> ZbdResult<()> {
        let status = match zone {
            Some(z) => {
                let status = z.check_release();
                info!(start = z.start(), "release migrate zone");
                status
            }
            None => Ok(()),
        };
        self.migrate.release();
        status
    }

    /// Picks a relocation source: among zones holding live long-lived data
    /// with something to reclaim, minimize
    /// `reset_count × max_capacity / reclaimable`, breaking ties toward the
    /// larger reclaimable space. Read-only scan; the zone is not busy-held.
    pub fn least_reset_count_zone(&self) -> ZbdResult<Arc<Zone>> {
        let mut best: Option<Arc<Zone>> = None;
        let mut best_score = 0u64;

        for zone in &self.io_zones {
            if zone.is_empty() || !zone.is_used() || zone.lifetime() != Lifetime::Extreme {
                continue;
            }
            let reclaimable = zone.reclaimable_space();
            if reclaimable == 0 {
                continue;
            }
            let score = zone.reset_count() as u64 * zone.max_capacity() / reclaimable;
            let better = best.as_ref().map_or(true, |b| {
                score < best_score
                    || (score == best_score && reclaimable > b.reclaimable_space())
            });
            if better {
                best = Some(zone.clone());
                best_score = score;
            }
        }

        best.ok_or_else(|| {
            ZbdError::NotFound("the zone with the fewest resets was not found".to_string())
        })
    }
}
