#![warn(missing_docs)]

//! ShingleFS zoned block device core: zone pool, allocation, wear leveling.
//!
//! This crate manages the pool of zones on a single SMR/ZNS-style zoned
//! device. It arbitrates zone allocation across writers, enforces the
//! device's open/active zone quotas, routes writes toward zones whose data
//! lifetime matches the incoming hint, reserves a small ring of zones for
//! metadata log rotation, and drives an idle-aware wear-leveling policy
//! that signals an external worker to relocate data.
//!
//! The device itself is reached through the [`ZonedBackend`] trait; concrete
//! ioctl or zonefs backends live outside this crate.

pub mod alloc;
pub mod backend;
pub mod config;
pub mod error;
pub mod lifetime;
pub mod metrics;
pub mod migrate;
pub mod pool;
pub mod tokens;
pub mod wear;
pub mod zone;

pub use alloc::IoClass;
pub use backend::{BackendLimits, MemBackend, MemBackendConfig, ResetReport, ZoneReport, ZonedBackend};
pub use config::{BackendKind, PoolConfig};
pub use error::{ZbdError, ZbdResult};
pub use lifetime::{
    lifetime_diff, Lifetime, LIFETIME_DIFF_COULD_BE_WORSE, LIFETIME_DIFF_NOT_GOOD,
};
pub use metrics::{MetricsSnapshot, PoolMetrics};
pub use pool::{ZonePool, META_ZONES, ZBD_MIN_ZONES};
pub use tokens::ZoneTokens;
pub use wear::{reset_count_std_dev, QpsTracker, WearLeveler};
pub use zone::{Zone, ZoneSnapshot};
