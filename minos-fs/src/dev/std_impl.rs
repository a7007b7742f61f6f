#![cfg(any(test, feature = "std"))]

use std::fs::File;
use std::io::{Error, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use super::{BlockDevice, DevError, Result};
use crate::structs::{SectorId, SECTOR_SIZE};

/// A regular file used as a sector device.
pub struct FileDisk {
    file: Mutex<File>,
    sectors: SectorId,
}

impl FileDisk {
    /// Extends `file` to `sectors * SECTOR_SIZE` bytes and wraps it.
    pub fn new(file: File, sectors: SectorId) -> std::io::Result<Self> {
        file.set_len(sectors as u64 * SECTOR_SIZE as u64)?;
        Ok(FileDisk {
            file: Mutex::new(file),
            sectors,
        })
    }
}

impl BlockDevice for FileDisk {
    fn read_at(&self, sector: SectorId, buf: &mut [u8]) -> Result<()> {
        if sector >= self.sectors || buf.len() != SECTOR_SIZE {
            return Err(DevError);
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&self, sector: SectorId, buf: &[u8]) -> Result<()> {
        if sector >= self.sectors || buf.len() != SECTOR_SIZE {
            return Err(DevError);
        }
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(sector as u64 * SECTOR_SIZE as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn sector_count(&self) -> SectorId {
        self.sectors
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }
}

impl From<Error> for DevError {
    fn from(_: Error) -> Self {
        DevError
    }
}
