//! Open/active zone token accounting.
//!
//! Zoned devices bound how many zones may be simultaneously open and active.
//! Writers take an open token before touching a closed zone and an active
//! token before opening an empty one; both are counting semaphores over one
//! mutex and condition variable.

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct TokenCounts {
    open: u32,
    active: u32,
}

/// Counting semaphores for the device's open/active zone quotas.
#[derive(Debug)]
pub struct ZoneTokens {
    max_open: u32,
    max_active: u32,
    counts: Mutex<TokenCounts>,
    cv: Condvar,
}

impl ZoneTokens {
    /// Creates the gates with the effective device quotas.
    pub fn new(max_open: u32, max_active: u32) -> Self {
        Self {
            max_open,
            max_active,
            counts: Mutex::new(TokenCounts::default()),
            cv: Condvar::new(),
        }
    }

    /// Blocks until an open token is available, then takes it.
    ///
    /// Non-prioritized callers are held to one slot below the limit so a
    /// prioritized writer (the WAL) can always make progress.
    pub fn wait_open_token(&self, prioritized: bool) {
        let limit = if prioritized {
            self.max_open
        } else {
            self.max_open.saturating_sub(1)
        };
        let mut counts = self.counts.lock();
        while counts.open >= limit {
            self.cv.wait(&mut counts);
        }
        counts.open += 1;
    }

    /// Takes an active token if one is available.
    pub fn try_active_token(&self) -> bool {
        let mut counts = self.counts.lock();
        if counts.active < self.max_active {
            counts.active += 1;
            true
        } else {
            false
        }
    }

    /// Returns an open token and wakes one waiter.
    pub fn put_open_token(&self) {
        {
            let mut counts = self.counts.lock();
            debug_assert!(counts.open > 0, "open token underflow");
            counts.open = counts.open.saturating_sub(1);
        }
        self.cv.notify_one();
    }

    /// Returns an active token and wakes one waiter.
    pub fn put_active_token(&self) {
        {
            let mut counts = self.counts.lock();
            debug_assert!(counts.active > 0, "active token underflow");
            counts.active = counts.active.saturating_sub(1);
        }
        self.cv.notify_one();
    }

    /// Accounts zones the device already reported active at open time.
    pub(crate) fn seed_active(&self, count: u32) {
        self.counts.lock().active = count;
    }

    /// Open tokens currently taken.
    pub fn open_count(&self) -> u32 {
        self.counts.lock().open
    }

    /// Active tokens currently taken.
    pub fn active_count(&self) -> u32 {
        self.counts.lock().active
    }

    /// Effective open-zone quota.
    pub fn max_open(&self) -> u32 {
        self.max_open
    }

    /// Effective active-zone quota.
    pub fn max_active(&self) -> u32 {
        self.max_active
    }
}
