//! Block device interface and the role registry.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::structs::{SectorId, SECTOR_SIZE};

pub mod buffer_cache;
#[cfg(any(test, feature = "std"))]
pub mod std_impl;

/// The error type for device I/O.
#[derive(Debug, PartialEq, Eq)]
pub struct DevError;

pub type Result<T> = core::result::Result<T, DevError>;

/// A device that reads and writes whole sectors.
///
/// `buf` is always exactly `SECTOR_SIZE` bytes.
pub trait BlockDevice: Send + Sync {
    fn read_at(&self, sector: SectorId, buf: &mut [u8]) -> Result<()>;
    fn write_at(&self, sector: SectorId, buf: &[u8]) -> Result<()>;
    fn sector_count(&self) -> SectorId;
    fn sync(&self) -> Result<()>;
}

/// What a device is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockRole {
    Filesys,
    Swap,
}

/// Devices discovered at boot, looked up by role.
pub struct DeviceRegistry {
    filesys: Mutex<Option<Arc<dyn BlockDevice>>>,
    swap: Mutex<Option<Arc<dyn BlockDevice>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        DeviceRegistry {
            filesys: Mutex::new(None),
            swap: Mutex::new(None),
        }
    }

    pub fn register(&self, role: BlockRole, device: Arc<dyn BlockDevice>) {
        let slot = match role {
            BlockRole::Filesys => &self.filesys,
            BlockRole::Swap => &self.swap,
        };
        *slot.lock() = Some(device);
    }

    pub fn get(&self, role: BlockRole) -> Option<Arc<dyn BlockDevice>> {
        let slot = match role {
            BlockRole::Filesys => &self.filesys,
            BlockRole::Swap => &self.swap,
        };
        slot.lock().clone()
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Memory-backed device, used by tests and as a swap device model.
pub struct MemDisk {
    sectors: SectorId,
    data: Mutex<Vec<u8>>,
}

impl MemDisk {
    pub fn new(sectors: SectorId) -> Self {
        MemDisk {
            sectors,
            data: Mutex::new(vec![0; sectors as usize * SECTOR_SIZE]),
        }
    }
}

impl BlockDevice for MemDisk {
    fn read_at(&self, sector: SectorId, buf: &mut [u8]) -> Result<()> {
        if sector >= self.sectors || buf.len() != SECTOR_SIZE {
            return Err(DevError);
        }
        let begin = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.data.lock()[begin..begin + SECTOR_SIZE]);
        Ok(())
    }

    fn write_at(&self, sector: SectorId, buf: &[u8]) -> Result<()> {
        if sector >= self.sectors || buf.len() != SECTOR_SIZE {
            return Err(DevError);
        }
        let begin = sector as usize * SECTOR_SIZE;
        self.data.lock()[begin..begin + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn sector_count(&self) -> SectorId {
        self.sectors
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
