//! Backend abstraction over the underlying zoned device.
//!
//! The pool never touches a device directly; it goes through [`ZonedBackend`].
//! Concrete ioctl- or zonefs-based backends live outside this crate. The
//! in-memory [`MemBackend`] implements the full contract for tests and
//! bring-up.

use parking_lot::Mutex;

use crate::error::{ZbdError, ZbdResult};

/// Open/active zone limits reported by the device at open. A value of 0
/// means the device does not report that limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendLimits {
    /// Maximum simultaneously active zones, 0 if unreported.
    pub max_active_zones: u32,
    /// Maximum simultaneously open zones, 0 if unreported.
    pub max_open_zones: u32,
}

/// Device-reported state of one zone, as returned by zone enumeration.
#[derive(Debug, Clone, Copy)]
pub struct ZoneReport {
    /// Absolute byte offset of the zone on the device.
    pub start: u64,
    /// Maximum writable bytes in this zone.
    pub max_capacity: u64,
    /// Current write pointer.
    pub wp: u64,
    /// Whether the zone is sequential-write-required.
    pub swr: bool,
    /// Whether the device reports the zone offline.
    pub offline: bool,
    /// Whether the device reports the zone active.
    pub active: bool,
    /// Whether the device reports the zone open.
    pub open: bool,
    /// Whether the zone can accept writes.
    pub writable: bool,
}

/// Outcome of a zone reset.
#[derive(Debug, Clone, Copy)]
pub struct ResetReport {
    /// The zone went offline during the reset.
    pub offline: bool,
    /// Writable capacity after the reset.
    pub max_capacity: u64,
}

/// Contract the pool consumes. Implementations must be safe to share across
/// threads; every method takes `&self`.
pub trait ZonedBackend: Send + Sync {
    /// Opens the device and returns its open/active limits.
    fn open(&self, readonly: bool, exclusive: bool) -> ZbdResult<BackendLimits>;

    /// Enumerates all zones in device order.
    fn list_zones(&self) -> ZbdResult<Vec<ZoneReport>>;

    /// Resets the zone starting at `start` to empty.
    fn reset(&self, start: u64) -> ZbdResult<ResetReport>;

    /// Forces the zone starting at `start` to full.
    fn finish(&self, start: u64) -> ZbdResult<()>;

    /// Transitions an open zone at `start` to closed.
    fn close(&self, start: u64) -> ZbdResult<()>;

    /// Writes `data` at `offset`, which must equal the zone's write pointer.
    /// May write fewer bytes than requested.
    fn write(&self, data: &[u8], offset: u64) -> ZbdResult<usize>;

    /// Reads into `buf` from `offset`. May read fewer bytes than requested;
    /// returns 0 at end of device.
    fn read(&self, buf: &mut [u8], offset: u64, direct: bool) -> ZbdResult<usize>;

    /// Drops any cached data for the given range.
    fn invalidate_cache(&self, pos: u64, size: u64) -> ZbdResult<()>;

    /// Zone size in bytes. All zones share one size.
    fn zone_size(&self) -> u64;

    /// Write granularity in bytes.
    fn block_size(&self) -> u64;

    /// Total number of zones on the device.
    fn nr_zones(&self) -> u32;

    /// Human-readable identifier, e.g. the device path.
    fn describe(&self) -> String;
}

/// Geometry and behavior knobs for [`MemBackend`].
#[derive(Debug, Clone)]
pub struct MemBackendConfig {
    /// Number of zones.
    pub nr_zones: u32,
    /// Bytes per zone.
    pub zone_size: u64,
    /// Write granularity.
    pub block_size: u64,
    /// Conventional (non-SWR) zones at the front of the device.
    pub conv_zones: u32,
    /// Reported max active zones, 0 = unreported.
    pub max_active_zones: u32,
    /// Reported max open zones, 0 = unreported.
    pub max_open_zones: u32,
    /// Cap on bytes accepted per write call, to exercise partial writes.
    pub max_write_chunk: Option<usize>,
}

impl Default for MemBackendConfig {
    fn default() -> Self {
        Self {
            nr_zones: 32,
            zone_size: 256 * 1024,
            block_size: 4096,
            conv_zones: 0,
            max_active_zones: 0,
            max_open_zones: 0,
            max_write_chunk: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemZoneCond {
    Empty,
    Open,
    Closed,
    Full,
    Offline,
}

#[derive(Debug)]
struct MemZone {
    start: u64,
    wp: u64,
    cond: MemZoneCond,
}

#[derive(Debug)]
struct MemState {
    zones: Vec<MemZone>,
    data: Vec<u8>,
}

/// In-memory zoned device. Enforces sequential writes at the write pointer
/// and models the empty/open/closed/full/offline zone conditions.
pub struct MemBackend {
    config: MemBackendConfig,
    state: Mutex<MemState>,
}

impl MemBackend {
    /// Builds a device with the given geometry, all zones empty.
    pub fn new(config: MemBackendConfig) -> Self {
        let zones = (0..config.nr_zones)
            .map(|i| {
                let start = i as u64 * config.zone_size;
                MemZone {
                    start,
                    wp: start,
                    cond: MemZoneCond::Empty,
                }
            })
            .collect();
        let data = vec![0u8; (config.nr_zones as u64 * config.zone_size) as usize];
        Self {
            config,
            state: Mutex::new(MemState { zones, data }),
        }
    }

    /// Marks a zone offline. Its data stays readable but resets report the
    /// zone gone and writes fail.
    pub fn set_offline(&self, zone_idx: u32) {
        let mut state = self.state.lock();
        if let Some(z) = state.zones.get_mut(zone_idx as usize) {
            z.cond = MemZoneCond::Offline;
        }
    }

    fn zone_index(&self, offset: u64) -> ZbdResult<usize> {
        let idx = (offset / self.config.zone_size) as usize;
        if idx >= self.config.nr_zones as usize {
            return Err(ZbdError::Io(format!("offset {offset} beyond device end")));
        }
        Ok(idx)
    }
}

impl ZonedBackend for MemBackend {
    fn open(&self, _readonly: bool, _exclusive: bool) -> ZbdResult<BackendLimits> {
        Ok(BackendLimits {
            max_active_zones: self.config.max_active_zones,
            max_open_zones: self.config.max_open_zones,
        })
    }

    fn list_zones(&self) -> ZbdResult<Vec<ZoneReport>> {
        let state = self.state.lock();
        Ok(state
            .zones
            .iter()
            .enumerate()
            .map(|(i, z)| {
                let offline = z.cond == MemZoneCond::Offline;
                let full = z.cond == MemZoneCond::Full;
                ZoneReport {
                    start: z.start,
                    max_capacity: self.config.zone_size,
                    wp: z.wp,
                    swr: (i as u32) >= self.config.conv_zones,
                    offline,
                    active: matches!(z.cond, MemZoneCond::Open | MemZoneCond::Closed),
                    open: z.cond == MemZoneCond::Open,
                    writable: !offline && !full,
                }
            })
            .collect())
    }

    fn reset(&self, start: u64) -> ZbdResult<ResetReport> {
        let idx = self.zone_index(start)?;
        let mut state = self.state.lock();
        let z = &mut state.zones[idx];
        if z.cond == MemZoneCond::Offline {
            return Ok(ResetReport {
                offline: true,
                max_capacity: 0,
            });
        }
        z.wp = z.start;
        z.cond = MemZoneCond::Empty;
        Ok(ResetReport {
            offline: false,
            max_capacity: self.config.zone_size,
        })
    }

    fn finish(&self, start: u64) -> ZbdResult<()> {
        let idx = self.zone_index(start)?;
        let mut state = self.state.lock();
        let z = &mut state.zones[idx];
        if z.cond == MemZoneCond::Offline {
            return Err(ZbdError::Io(format!("zone at {start} is offline")));
        }
        z.wp = z.start + self.config.zone_size;
        z.cond = MemZoneCond::Full;
        Ok(())
    }

    fn close(&self, start: u64) -> ZbdResult<()> {
        let idx = self.zone_index(start)?;
        let mut state = self.state.lock();
        let z = &mut state.zones[idx];
        match z.cond {
            MemZoneCond::Offline => Err(ZbdError::Io(format!("zone at {start} is offline"))),
            MemZoneCond::Open => {
                z.cond = MemZoneCond::Closed;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn write(&self, data: &[u8], offset: u64) -> ZbdResult<usize> {
        let idx = self.zone_index(offset)?;
        let mut state = self.state.lock();
        let zone_end = state.zones[idx].start + self.config.zone_size;
        {
            let z = &state.zones[idx];
            if z.cond == MemZoneCond::Offline {
                return Err(ZbdError::Io(format!("zone at {} is offline", z.start)));
            }
            if offset != z.wp {
                return Err(ZbdError::Io(format!(
                    "unaligned write: offset {} but write pointer {}",
                    offset, z.wp
                )));
            }
        }
        let mut n = data.len();
        if let Some(chunk) = self.config.max_write_chunk {
            n = n.min(chunk);
        }
        if offset + n as u64 > zone_end {
            return Err(ZbdError::Io("write crosses zone boundary".to_string()));
        }
        let pos = offset as usize;
        state.data[pos..pos + n].copy_from_slice(&data[..n]);
        let z = &mut state.zones[idx];
        z.wp += n as u64;
        z.cond = if z.wp == zone_end {
            MemZoneCond::Full
        } else {
            MemZoneCond::Open
        };
        Ok(n)
    }

    fn read(&self, buf: &mut [u8], offset: u64, _direct: bool) -> ZbdResult<usize> {
        let state = self.state.lock();
        let dev_end = state.data.len() as u64;
        if offset >= dev_end {
            return Ok(0);
        }
        let n = (buf.len() as u64).min(dev_end - offset) as usize;
        let pos = offset as usize;
        buf[..n].copy_from_slice(&state.data[pos..pos + n]);
        Ok(n)
    }

    fn invalidate_cache(&self, _pos: u64, _size: u64) -> ZbdResult<()> {
        Ok(())
    }

    fn zone_size(&self) -> u64 {
        self.config.zone_size
    }

    fn block_size(&self) -> u64 {
        self.config.block_size
    }

    fn nr_zones(&self) -> u32 {
        self.config.nr_zones
    }

    fn describe(&self) -> String {
        format!("mem:{}z", self.config.nr_zones)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemBackend {
        MemBackend::new(MemBackendConfig {
            nr_zones: 4,
            zone_size: 16 * 4096,
            ..MemBackendConfig::default()
        })
    }

    #[test]
    fn test_fresh_device_all_empty_swr() {
        let be = backend();
        let zones = be.list_zones().unwrap();
        assert_eq!(zones.len(), 4);
        for (i, z) in zones.iter().enumerate() {
            assert_eq!(z.start, i as u64 * 16 * 4096);
            assert_eq!(z.wp, z.start);
            assert!(z.swr);
            assert!(z.writable);
            assert!(!z.active);
        }
    }

    #[test]
    fn test_write_enforces_write_pointer() {
        let be = backend();
        let block = vec![7u8; 4096];
        assert_eq!(be.write(&block, 0).unwrap(), 4096);
        // Rewriting at the zone start is rejected; only the wp is writable.
        assert!(be.write(&block, 0).is_err());
        assert_eq!(be.write(&block, 4096).unwrap(), 4096);

        let zones = be.list_zones().unwrap();
        assert_eq!(zones[0].wp, 8192);
        assert!(zones[0].open);
    }

    #[test]
    fn test_partial_writes_with_chunk_cap() {
        let be = MemBackend::new(MemBackendConfig {
            nr_zones: 2,
            zone_size: 16 * 4096,
            max_write_chunk: Some(1000),
            ..MemBackendConfig::default()
        });
        let n = be.write(&vec![1u8; 4096], 0).unwrap();
        assert_eq!(n, 1000);
        let zones = be.list_zones().unwrap();
        assert_eq!(zones[0].wp, 1000);
    }

    #[test]
    fn test_finish_and_reset() {
        let be = backend();
        be.write(&vec![1u8; 4096], 0).unwrap();
        be.finish(0).unwrap();
        let zones = be.list_zones().unwrap();
        assert_eq!(zones[0].wp, 16 * 4096);
        assert!(!zones[0].writable);

        let report = be.reset(0).unwrap();
        assert!(!report.offline);
        assert_eq!(report.max_capacity, 16 * 4096);
        let zones = be.list_zones().unwrap();
        assert_eq!(zones[0].wp, 0);
    }

    #[test]
    fn test_offline_zone_reports_and_rejects() {
        let be = backend();
        be.set_offline(1);
        let zones = be.list_zones().unwrap();
        assert!(zones[1].offline);
        assert!(!zones[1].writable);
        assert!(be.write(&vec![0u8; 4096], zones[1].start).is_err());
        let report = be.reset(zones[1].start).unwrap();
        assert!(report.offline);
        assert_eq!(report.max_capacity, 0);
    }

    #[test]
    fn test_read_back() {
        let be = backend();
        let block = vec![0xabu8; 4096];
        be.write(&block, 0).unwrap();
        let mut buf = vec![0u8; 4096];
        assert_eq!(be.read(&mut buf, 0, false).unwrap(), 4096);
        assert_eq!(buf, block);
    }

    #[test]
    fn test_read_past_device_end() {
        let be = backend();
        let mut buf = vec![0u8; 16];
        assert_eq!(be.read(&mut buf, 4 * 16 * 4096, false).unwrap(), 0);
    }
}
