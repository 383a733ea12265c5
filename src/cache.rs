//! Per-volume sector cache
//!
//! The engines work a sector at a time; this module keeps the most
//! recently touched sectors in memory behind an LRU, write-back style.
//! Dirty sectors are flushed on eviction and when a public operation
//! finishes (`sync_all`), so the on-disk image is consistent between
//! operations.

use std::sync::Arc;

use lru::LruCache;
use spin::RwLock;

use crate::device::{BlockDevice, DeviceError};
use crate::SECTOR_CACHE_LIMIT;

pub trait Cache {
    /// The read-only mapper to the cached sector
    ///
    /// - `offset`: offset in the sector
    /// - `f`: a closure to read
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V;
    /// The mutable mapper to the cached sector
    ///
    /// - `offset`: offset in the sector
    /// - `f`: a closure to write
    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V;
    /// Write the sector back if it was modified.
    fn sync(&mut self) -> Result<(), DeviceError>;
}

pub struct SectorCache {
    buf: Vec<u8>,
    sector_id: usize,
    sector_size: usize,
    device: Arc<dyn BlockDevice>,
    modified: bool,
}

impl SectorCache {
    /// Load one sector from the device.
    pub fn new(
        sector_id: usize,
        sector_size: usize,
        device: Arc<dyn BlockDevice>,
    ) -> Result<Self, DeviceError> {
        let mut buf = vec![0u8; sector_size];
        device.read_at(&mut buf, (sector_id * sector_size) as u64)?;
        Ok(Self {
            buf,
            sector_id,
            sector_size,
            device,
            modified: false,
        })
    }

    fn get_ref<T>(&self, offset: usize) -> &T {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= self.sector_size);
        unsafe { &*(self.buf[offset..].as_ptr() as *const T) }
    }

    fn get_mut<T>(&mut self, offset: usize) -> &mut T {
        let type_size = core::mem::size_of::<T>();
        assert!(offset + type_size <= self.sector_size);
        self.modified = true;
        unsafe { &mut *(self.buf[offset..].as_mut_ptr() as *mut T) }
    }

    pub fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        &self.buf[offset..offset + len]
    }

    pub fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        self.modified = true;
        &mut self.buf[offset..offset + len]
    }
}

impl Cache for SectorCache {
    fn read<T, V>(&self, offset: usize, f: impl FnOnce(&T) -> V) -> V {
        f(self.get_ref(offset))
    }

    fn modify<T, V>(&mut self, offset: usize, f: impl FnOnce(&mut T) -> V) -> V {
        f(self.get_mut(offset))
    }

    fn sync(&mut self) -> Result<(), DeviceError> {
        if self.modified {
            self.modified = false;
            let offset = (self.sector_id * self.sector_size) as u64;
            let written = self.device.write_at(&self.buf, offset)?;
            if written != self.buf.len() {
                return Err(DeviceError::ShortWrite(offset));
            }
        }
        Ok(())
    }
}

impl Drop for SectorCache {
    fn drop(&mut self) {
        let _ = self.sync();
    }
}

pub struct SectorCacheManager {
    lru: RwLock<LruCache<usize, Arc<RwLock<SectorCache>>>>,
    sector_size: usize,
    device: Arc<dyn BlockDevice>,
}

impl SectorCacheManager {
    pub fn new(sector_size: usize, device: Arc<dyn BlockDevice>) -> Self {
        Self {
            // Bounded by hand below so eviction can write back.
            lru: RwLock::new(LruCache::unbounded()),
            sector_size,
            device,
        }
    }

    pub fn sector_size(&self) -> usize {
        self.sector_size
    }

    /// Get a sector, loading it from the device on a miss. The least
    /// recently used sector is flushed out once the cache is full.
    pub fn get(&self, sector_id: usize) -> Result<Arc<RwLock<SectorCache>>, DeviceError> {
        let mut lru = self.lru.write();
        if let Some(sector) = lru.get(&sector_id) {
            return Ok(Arc::clone(sector));
        }

        if lru.len() == SECTOR_CACHE_LIMIT {
            // Dropping the evicted entry syncs it.
            lru.pop_lru();
        }

        let sector = Arc::new(RwLock::new(SectorCache::new(
            sector_id,
            self.sector_size,
            Arc::clone(&self.device),
        )?));
        lru.put(sector_id, Arc::clone(&sector));
        Ok(sector)
    }

    /// Copy bytes out of the volume, spanning sectors as needed.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> Result<(), DeviceError> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let sector_id = pos / self.sector_size;
            let in_sector = pos % self.sector_size;
            let len = (self.sector_size - in_sector).min(buf.len() - done);

            let sector = self.get(sector_id)?;
            buf[done..done + len].copy_from_slice(sector.read().bytes(in_sector, len));
            done += len;
        }
        Ok(())
    }

    /// Copy bytes into the volume, spanning sectors as needed.
    pub fn write_at(&self, offset: usize, buf: &[u8]) -> Result<(), DeviceError> {
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done;
            let sector_id = pos / self.sector_size;
            let in_sector = pos % self.sector_size;
            let len = (self.sector_size - in_sector).min(buf.len() - done);

            let sector = self.get(sector_id)?;
            sector
                .write()
                .bytes_mut(in_sector, len)
                .copy_from_slice(&buf[done..done + len]);
            done += len;
        }
        Ok(())
    }

    /// Flush every dirty sector.
    pub fn sync_all(&self) -> Result<(), DeviceError> {
        for (_, sector) in self.lru.write().iter_mut() {
            sector.write().sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn write_back_reaches_device_on_sync() {
        let dev = Arc::new(MemDevice::new(8192));
        let cache = SectorCacheManager::new(512, Arc::clone(&dev) as Arc<dyn BlockDevice>);

        cache.write_at(700, b"payload").unwrap();

        let mut direct = [0u8; 7];
        dev.read_at(&mut direct, 700).unwrap();
        assert_ne!(&direct, b"payload", "write-back must not hit disk early");

        cache.sync_all().unwrap();
        dev.read_at(&mut direct, 700).unwrap();
        assert_eq!(&direct, b"payload");
    }

    #[test]
    fn spanning_read_crosses_sectors() {
        let dev = Arc::new(MemDevice::new(8192));
        dev.write_at(b"abcdefgh", 508).unwrap();
        let cache = SectorCacheManager::new(512, dev as Arc<dyn BlockDevice>);

        let mut buf = [0u8; 8];
        cache.read_at(508, &mut buf).unwrap();
        assert_eq!(&buf, b"abcdefgh");
    }

    #[test]
    fn eviction_flushes_lru_sector() {
        let dev = Arc::new(MemDevice::new(512 * (SECTOR_CACHE_LIMIT + 8)));
        let cache = SectorCacheManager::new(512, Arc::clone(&dev) as Arc<dyn BlockDevice>);

        cache.write_at(0, b"first").unwrap();
        // Touch enough other sectors to push sector 0 out.
        for i in 1..=SECTOR_CACHE_LIMIT {
            let mut b = [0u8; 1];
            cache.read_at(i * 512, &mut b).unwrap();
        }

        let mut direct = [0u8; 5];
        dev.read_at(&mut direct, 0).unwrap();
        assert_eq!(&direct, b"first");
    }
}
