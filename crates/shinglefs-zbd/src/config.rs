//! Pool configuration.

use serde::{Deserialize, Serialize};

/// Kind of zoned backend the pool sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendKind {
    /// A raw zoned block device (SMR/ZNS character device).
    BlockDevice,
    /// A filesystem exposing one file per zone (zonefs-style).
    ZonedFs,
}

/// Configuration for a zone pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Kind of backend the path points at.
    pub backend_kind: BackendKind,
    /// Device or mount path.
    pub path: String,
    /// Open the device read-only.
    pub readonly: bool,
    /// Open the device exclusively. Write opens must be exclusive.
    pub exclusive: bool,
    /// Finish a zone once its remaining capacity drops below this percentage
    /// of its max capacity. 0 disables the finish sweep.
    pub finish_threshold_pct: u64,
    /// Initial reset-ratio threshold (percent) for the wear-leveling trigger.
    pub reset_ratio_threshold_pct: f64,
    /// Initial write-QPS ceiling below which the device counts as idle.
    pub idle_qps_write: u64,
    /// Initial read-QPS ceiling below which the device counts as idle.
    pub idle_qps_read: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backend_kind: BackendKind::BlockDevice,
            path: String::new(),
            readonly: false,
            exclusive: true,
            finish_threshold_pct: 0,
            reset_ratio_threshold_pct: 10.0,
            idle_qps_write: 76,
            idle_qps_read: 5000,
        }
    }
}
