//! File Allocation Table
//!
//! One 32-bit entry per data cluster, of which only the low 28 bits are
//! meaningful. 0 is free, values below [`crate::BAD_CLUSTER`] link to
//! the next cluster of a chain, and anything at or above it is bad/EOC.
//! The high nibble is reserved: every write is a read-modify-write that
//! leaves it untouched, and every write lands in every FAT copy so the
//! mirrors stay byte-identical.

use std::sync::Arc;

use log::debug;

use crate::cache::SectorCacheManager;
use crate::{Error, Result, BAD_CLUSTER, CLUSTER_MASK, END_CLUSTER, FREE_CLUSTER};

pub fn is_eoc(value: u32) -> bool {
    value >= END_CLUSTER
}

/// Bad-cluster marks end a chain walk just like EOC does.
pub fn ends_chain(value: u32) -> bool {
    value >= BAD_CLUSTER
}

pub struct FatTable {
    cache: Arc<SectorCacheManager>,
    /// Byte offset of FAT copy #1.
    fat_offset: usize,
    /// Bytes per FAT copy.
    fat_size: usize,
    table_count: usize,
    /// Count of data clusters; valid cluster numbers are 2..n_clusters+2.
    n_clusters: usize,
}

impl FatTable {
    pub fn new(
        cache: Arc<SectorCacheManager>,
        fat_offset: usize,
        fat_size: usize,
        table_count: usize,
        n_clusters: usize,
    ) -> Self {
        Self {
            cache,
            fat_offset,
            fat_size,
            table_count,
            n_clusters,
        }
    }

    pub fn cluster_count(&self) -> usize {
        self.n_clusters
    }

    fn check(&self, cluster: u32) -> Result<()> {
        if cluster < 2 || cluster as usize >= self.n_clusters + 2 {
            return Err(Error::BadCluster(cluster));
        }
        Ok(())
    }

    /// The low 28 bits of the entry for `cluster`.
    pub fn get(&self, cluster: u32) -> Result<u32> {
        self.check(cluster)?;
        let mut raw = [0u8; 4];
        self.cache
            .read_at(self.fat_offset + cluster as usize * 4, &mut raw)?;
        Ok(crate::read_le_u32(&raw) & CLUSTER_MASK)
    }

    /// Store the low 28 bits of `value` for `cluster`, preserving the
    /// reserved high nibble, in every FAT copy.
    pub fn put(&self, cluster: u32, value: u32) -> Result<()> {
        self.check(cluster)?;
        for copy in 0..self.table_count {
            let offset = self.fat_offset + copy * self.fat_size + cluster as usize * 4;
            let mut raw = [0u8; 4];
            self.cache.read_at(offset, &mut raw)?;
            let merged = (crate::read_le_u32(&raw) & !CLUSTER_MASK) | (value & CLUSTER_MASK);
            self.cache.write_at(offset, &merged.to_le_bytes())?;
        }
        debug!("fat: [{cluster}] <- {value:#010x}");
        Ok(())
    }

    /// First free entry at or after `hint + 1`. The scan does not wrap;
    /// reaching the end of the table is out-of-space.
    pub fn allocate(&self, hint: u32) -> Result<u32> {
        let mut cluster = (hint + 1).max(2);
        while (cluster as usize) < self.n_clusters + 2 {
            if self.get(cluster)? == FREE_CLUSTER {
                debug!("fat: allocated cluster {cluster}");
                return Ok(cluster);
            }
            cluster += 1;
        }
        Err(Error::OutOfSpace)
    }

    /// The cluster following `cluster` in its chain, or `None` at the
    /// end. A free or reserved value also ends the walk; an in-use chain
    /// is expected to terminate in an EOC mark.
    pub fn next(&self, cluster: u32) -> Result<Option<u32>> {
        let value = self.get(cluster)?;
        if ends_chain(value) || value < 2 {
            Ok(None)
        } else {
            Ok(Some(value))
        }
    }

    /// Walk `n` links from `start`.
    pub fn nth(&self, start: u32, n: usize) -> Result<Option<u32>> {
        let mut cluster = start;
        for _ in 0..n {
            match self.next(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cluster))
    }

    /// Every cluster of the chain rooted at `start`, in chain order.
    /// Bounded by the cluster count so a corrupt cyclic chain cannot
    /// spin forever.
    pub fn collect_chain(&self, start: u32) -> Result<Vec<u32>> {
        let mut clusters = Vec::new();
        let mut cluster = start;
        for _ in 0..self.n_clusters {
            clusters.push(cluster);
            match self.next(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(clusters),
            }
        }
        Ok(clusters)
    }

    /// Release a whole chain back to the free pool; returns how many
    /// clusters were freed.
    pub fn free_chain(&self, start: u32) -> Result<usize> {
        if start < 2 {
            return Ok(0);
        }
        let clusters = self.collect_chain(start)?;
        for &cluster in clusters.iter() {
            self.put(cluster, FREE_CLUSTER)?;
        }
        Ok(clusters.len())
    }

    /// Full scan: (free entry count, highest non-free cluster index).
    /// This is the mount-time source of truth for the FSInfo counters.
    pub fn count_free_and_last(&self) -> Result<(u32, u32)> {
        let mut free = 0u32;
        let mut last = 0u32;
        for cluster in 2..(self.n_clusters + 2) as u32 {
            if self.get(cluster)? == FREE_CLUSTER {
                free += 1;
            } else {
                last = cluster;
            }
        }
        Ok((free, last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemDevice};

    fn table(n_clusters: usize) -> (Arc<MemDevice>, FatTable) {
        let dev = Arc::new(MemDevice::new(64 * 1024));
        let cache = Arc::new(SectorCacheManager::new(
            512,
            Arc::clone(&dev) as Arc<dyn BlockDevice>,
        ));
        let fat = FatTable::new(cache, 0, 8 * 1024, 2, n_clusters);
        (dev, fat)
    }

    #[test]
    fn put_preserves_reserved_nibble() {
        let (dev, fat) = table(64);
        dev.write_at(&0x3000_0000u32.to_le_bytes(), 5 * 4).unwrap();

        fat.put(5, BAD_CLUSTER).unwrap();
        let mut raw = [0u8; 4];
        fat.cache.sync_all().unwrap();
        dev.read_at(&mut raw, 5 * 4).unwrap();
        assert_eq!(u32::from_le_bytes(raw), 0x3FFF_FFF7);
        // Readers never see the nibble.
        assert_eq!(fat.get(5).unwrap(), BAD_CLUSTER);
    }

    #[test]
    fn put_mirrors_every_copy() {
        let (dev, fat) = table(64);
        fat.put(2, 0x0FFF_FFFF).unwrap();
        fat.cache.sync_all().unwrap();

        let mut copy1 = [0u8; 4];
        let mut copy2 = [0u8; 4];
        dev.read_at(&mut copy1, 2 * 4).unwrap();
        dev.read_at(&mut copy2, 8 * 1024 + 2 * 4).unwrap();
        assert_eq!(copy1, copy2);
    }

    #[test]
    fn allocate_scans_forward_from_hint() {
        let (_dev, fat) = table(16);
        fat.put(2, 0x0FFF_FFFF).unwrap();
        fat.put(3, 0x0FFF_FFFF).unwrap();
        fat.put(5, 0x0FFF_FFFF).unwrap();

        assert_eq!(fat.allocate(1).unwrap(), 4);
        assert_eq!(fat.allocate(4).unwrap(), 6);
        // No wrap-around: scanning from the end is out-of-space.
        assert!(matches!(fat.allocate(17), Err(Error::OutOfSpace)));
    }

    #[test]
    fn allocate_exhausts_to_out_of_space() {
        let (_dev, fat) = table(4);
        for c in 2..6 {
            fat.put(c, 0x0FFF_FFFF).unwrap();
        }
        assert!(matches!(fat.allocate(1), Err(Error::OutOfSpace)));
    }

    #[test]
    fn range_checks() {
        let (_dev, fat) = table(8);
        assert!(matches!(fat.get(0), Err(Error::BadCluster(0))));
        assert!(matches!(fat.get(1), Err(Error::BadCluster(1))));
        assert!(matches!(fat.get(10), Err(Error::BadCluster(10))));
        assert!(matches!(fat.put(10, 0), Err(Error::BadCluster(10))));
        assert!(fat.get(9).is_ok());
    }

    #[test]
    fn chain_walks_terminate() {
        let (_dev, fat) = table(16);
        fat.put(2, 3).unwrap();
        fat.put(3, 4).unwrap();
        fat.put(4, 0x0FFF_FFFF).unwrap();

        assert_eq!(fat.collect_chain(2).unwrap(), vec![2, 3, 4]);
        assert_eq!(fat.nth(2, 2).unwrap(), Some(4));
        assert_eq!(fat.nth(2, 3).unwrap(), None);

        // A (corrupt) cycle still terminates.
        fat.put(4, 2).unwrap();
        assert_eq!(fat.collect_chain(2).unwrap().len(), 16);
    }

    #[test]
    fn free_chain_recounts() {
        let (_dev, fat) = table(16);
        fat.put(2, 3).unwrap();
        fat.put(3, 0x0FFF_FFFF).unwrap();
        fat.put(7, 0x0FFF_FFFF).unwrap();

        let (free, last) = fat.count_free_and_last().unwrap();
        assert_eq!(free, 13);
        assert_eq!(last, 7);

        assert_eq!(fat.free_chain(2).unwrap(), 2);
        let (free, last) = fat.count_free_and_last().unwrap();
        assert_eq!(free, 15);
        assert_eq!(last, 7);
    }
}
