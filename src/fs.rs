//! A mounted volume
//!
//! [`Volume`] owns the device handle, the sector cache, the decoded BPB
//! and the FAT, and provides the cluster-level I/O both engines are
//! built from: directory-chunk walking, chain reads, the
//! allocate-link-terminate write loop, and the FSInfo counter
//! bookkeeping.
//!
//! Mount order: read and validate the BPB, load the FSInfo counters,
//! then rescan the whole FAT. The scan is the source of truth; the
//! stored counters are only hints and may be stale after a crash. The
//! refreshed values are written back immediately, so a stale FSInfo
//! never outlives a mount.

use std::sync::Arc;

use log::{error, info};
use spin::RwLock;

use crate::bpb::{BootSector, FatKind, FsInfoCounters, BOOT_SECTOR_SIZE};
use crate::cache::{Cache, SectorCacheManager};
use crate::device::BlockDevice;
use crate::dir::{scan_slots, DirEntryInfo, Scan};
use crate::fat::FatTable;
use crate::{Error, Result, DIRENT_SIZE, END_OF_CLUSTER, FSINFO_COUNTERS_OFFSET};

pub struct Volume {
    pub(crate) cache: Arc<SectorCacheManager>,
    pub(crate) bpb: BootSector,
    pub(crate) kind: FatKind,
    pub(crate) fat: FatTable,
    pub(crate) info: RwLock<FsInfoCounters>,
    /// Cluster number of the current directory; 0 means the root, which
    /// is reloaded from the BPB whenever it is consulted.
    pub(crate) current_directory: RwLock<u32>,
}

/// A matched directory entry plus where its slots live on disk.
pub(crate) struct Located {
    pub info: DirEntryInfo,
    /// Absolute byte offset of the 8.3 entry (for write-back).
    pub entry_offset: usize,
    /// Absolute byte offset of the first slot of the logical entry.
    pub first_offset: usize,
}

impl Volume {
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let mut raw = [0u8; BOOT_SECTOR_SIZE];
        device
            .read_at(&mut raw, 0)
            .map_err(Error::DeviceUnreadable)?;
        let bpb = BootSector::from_bytes(&raw);
        if !bpb.is_valid() {
            error!("boot sector failed validation");
            return Err(Error::BadSignature);
        }
        let volume_bytes = bpb.total_sector_count() * bpb.bytes_per_sector();
        let device_bytes = device.size().map_err(Error::DeviceUnreadable)? as usize;
        if device_bytes < volume_bytes {
            error!("device is smaller ({device_bytes}B) than the volume it claims ({volume_bytes}B)");
            return Err(Error::BadSignature);
        }

        let cache = Arc::new(SectorCacheManager::new(
            bpb.bytes_per_sector(),
            Arc::clone(&device),
        ));
        let fat = FatTable::new(
            Arc::clone(&cache),
            bpb.fat1_offset(),
            bpb.fat_size_bytes(),
            bpb.fat_count(),
            bpb.data_cluster_count(),
        );

        let counter_sector = cache.get(FSINFO_COUNTERS_OFFSET as usize / bpb.bytes_per_sector())?;
        let stored = counter_sector.read().read(
            FSINFO_COUNTERS_OFFSET as usize % bpb.bytes_per_sector(),
            |counters: &FsInfoCounters| *counters,
        );
        drop(counter_sector);
        let stored_free = stored.num_free_clusters;
        let stored_last = stored.last_alloc;
        info!("free clusters (stored): {stored_free:#x}, last alloc (stored): {stored_last:#x}");

        // The FAT, not the hint sector, decides.
        let (free, last) = fat.count_free_and_last()?;
        let kind = bpb.fat_kind();
        info!(
            "mounted {:?}: {} data clusters, {} free, last allocated {}, {} sectors/cluster",
            kind,
            bpb.data_cluster_count(),
            free,
            last,
            bpb.sectors_per_cluster(),
        );

        let volume = Self {
            cache,
            bpb,
            kind,
            fat,
            info: RwLock::new(FsInfoCounters {
                num_free_clusters: free,
                last_alloc: last,
            }),
            current_directory: RwLock::new(0),
        };
        volume.flush()?;
        Ok(volume)
    }

    pub fn kind(&self) -> FatKind {
        self.kind
    }

    pub fn cluster_size(&self) -> usize {
        self.bpb.cluster_size()
    }

    pub fn free_cluster_count(&self) -> u32 {
        self.info.read().num_free_clusters
    }

    pub(crate) fn cluster_location(&self, cluster: u32) -> usize {
        self.bpb.cluster_location(cluster)
    }

    /// Write the live counters into the FSInfo sector (only those 8
    /// bytes; the surrounding signatures stay untouched) and push every
    /// dirty cached sector out to the device.
    pub fn flush(&self) -> Result<()> {
        let info = *self.info.read();
        let sector_size = self.bpb.bytes_per_sector();
        let sector = self.cache.get(FSINFO_COUNTERS_OFFSET as usize / sector_size)?;
        sector.write().modify(
            FSINFO_COUNTERS_OFFSET as usize % sector_size,
            |counters: &mut FsInfoCounters| *counters = info,
        );
        drop(sector);
        self.cache.sync_all()?;
        Ok(())
    }

    /// Allocate one cluster, scanning forward from `hint + 1`, zero it,
    /// and account for it. The new cluster's FAT entry is left free for
    /// the caller to link or terminate.
    pub(crate) fn alloc_cluster(&self, hint: u32) -> Result<u32> {
        let cluster = self.fat.allocate(hint)?;
        self.zero_cluster(cluster)?;
        let mut info = self.info.write();
        info.num_free_clusters = info.num_free_clusters.saturating_sub(1);
        info.last_alloc = cluster;
        Ok(cluster)
    }

    /// Release a chain and return its clusters to the free counter.
    pub(crate) fn release_chain(&self, start: u32) -> Result<()> {
        if start < 2 {
            return Ok(());
        }
        let freed = self.fat.free_chain(start)?;
        let mut info = self.info.write();
        info.num_free_clusters += freed as u32;
        Ok(())
    }

    pub(crate) fn zero_cluster(&self, cluster: u32) -> Result<()> {
        let zeros = vec![0u8; self.cluster_size()];
        self.cache
            .write_at(self.cluster_location(cluster), &zeros)?;
        Ok(())
    }

    /// Iterate the cluster-sized chunks of a directory. `start == 0`
    /// names the root: the fixed root-directory region on a classic
    /// FAT16 layout, the `root_cluster` chain otherwise.
    pub(crate) fn dir_chunks(&self, start: u32) -> DirChunks<'_> {
        let state = if start == 0 {
            match self.bpb.root_region() {
                Some((offset, len)) => ChunkState::Region {
                    offset,
                    len,
                    done: false,
                },
                None => ChunkState::Chain {
                    next: Some(self.bpb.root_cluster()),
                },
            }
        } else {
            ChunkState::Chain { next: Some(start) }
        };
        DirChunks { vol: self, state }
    }

    /// Scan the directory rooted at `start` for `name` (FAT name
    /// matching is case-insensitive).
    pub(crate) fn find_in_dir(&self, start: u32, name: &str) -> Result<Option<Located>> {
        let mut chunks = self.dir_chunks(start);
        let mut slot_base = 0usize;
        let mut buf = Vec::new();
        while let Some((abs, len)) = chunks.next_chunk()? {
            buf.resize(len, 0);
            self.cache.read_at(abs, &mut buf)?;
            let mut pos = 0usize;
            loop {
                match scan_slots(&buf, slot_base, pos) {
                    Scan::Entry(info, next) => {
                        if info.name.eq_ignore_ascii_case(name) {
                            return Ok(Some(Located {
                                entry_offset: abs + (info.entry_slot - slot_base) * DIRENT_SIZE,
                                first_offset: abs + (info.first_slot - slot_base) * DIRENT_SIZE,
                                info: *info,
                            }));
                        }
                        pos = next - slot_base;
                    }
                    Scan::End => return Ok(None),
                    Scan::Exhausted(next) => {
                        slot_base = next;
                        break;
                    }
                }
            }
        }
        Ok(None)
    }

    /// One `read_dir` step: the next logical entry at or after `slot`,
    /// with the slot to resume from.
    pub(crate) fn next_dir_entry(
        &self,
        start: u32,
        slot: usize,
    ) -> Result<Option<(DirEntryInfo, usize)>> {
        let mut chunks = self.dir_chunks(start);
        let mut slot_base = 0usize;
        let mut buf = Vec::new();
        while let Some((abs, len)) = chunks.next_chunk()? {
            let slots_here = len / DIRENT_SIZE;
            if slot >= slot_base + slots_here {
                slot_base += slots_here;
                continue;
            }
            buf.resize(len, 0);
            self.cache.read_at(abs, &mut buf)?;
            let pos = slot.saturating_sub(slot_base);
            match scan_slots(&buf, slot_base, pos) {
                Scan::Entry(info, next) => return Ok(Some((*info, next))),
                Scan::End => return Ok(None),
                Scan::Exhausted(next) => {
                    // Resume in the next cluster.
                    return self.next_dir_entry_from(chunks, next);
                }
            }
        }
        Ok(None)
    }

    fn next_dir_entry_from(
        &self,
        mut chunks: DirChunks<'_>,
        mut slot_base: usize,
    ) -> Result<Option<(DirEntryInfo, usize)>> {
        let mut buf = Vec::new();
        while let Some((abs, len)) = chunks.next_chunk()? {
            buf.resize(len, 0);
            self.cache.read_at(abs, &mut buf)?;
            match scan_slots(&buf, slot_base, 0) {
                Scan::Entry(info, next) => return Ok(Some((*info, next))),
                Scan::End => return Ok(None),
                Scan::Exhausted(next) => slot_base = next,
            }
        }
        Ok(None)
    }

    /// Find room for `size_req` contiguous slots in the directory at
    /// `start`. A tombstone run of the required size is preferred;
    /// otherwise the run starts at the first end-of-directory slot with
    /// enough room left in its cluster. Returns the absolute byte
    /// offset, or `None` when the directory has no room.
    pub(crate) fn find_free_run(&self, start: u32, size_req: usize) -> Result<Option<usize>> {
        let mut chunks = self.dir_chunks(start);
        let mut buf = Vec::new();
        while let Some((abs, len)) = chunks.next_chunk()? {
            buf.resize(len, 0);
            self.cache.read_at(abs, &mut buf)?;
            let slots_here = len / DIRENT_SIZE;

            let mut run = 0usize;
            let mut run_start = 0usize;
            for i in 0..slots_here {
                let b0 = buf[i * DIRENT_SIZE];
                if b0 == crate::DIR_ENTRY_LAST_AND_UNUSED {
                    // Free from here on; usable if the run fits this
                    // cluster, else try the next one.
                    if slots_here - i >= size_req {
                        return Ok(Some(abs + i * DIRENT_SIZE));
                    }
                    break;
                } else if b0 == crate::DIR_ENTRY_UNUSED {
                    if run == 0 {
                        run_start = i;
                    }
                    run += 1;
                    if run == size_req {
                        return Ok(Some(abs + run_start * DIRENT_SIZE));
                    }
                } else {
                    run = 0;
                }
            }
        }
        Ok(None)
    }

    /// Read bytes at `offset` of the chain rooted at `start`. Stops at
    /// the end of the chain; returns the bytes actually read.
    pub(crate) fn read_chain_at(
        &self,
        start: u32,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cluster_size = self.cluster_size();
        let mut cluster = match self.fat.nth(start, offset / cluster_size)? {
            Some(c) => c,
            None => return Ok(0),
        };
        let mut in_cluster = offset % cluster_size;
        let mut done = 0usize;
        loop {
            let amount = (cluster_size - in_cluster).min(buf.len() - done);
            self.cache.read_at(
                self.cluster_location(cluster) + in_cluster,
                &mut buf[done..done + amount],
            )?;
            done += amount;
            if done == buf.len() {
                return Ok(done);
            }
            match self.fat.next(cluster)? {
                Some(next) => cluster = next,
                None => return Ok(done),
            }
            in_cluster = 0;
        }
    }

    /// Write bytes at `offset` of the chain rooted at `start`,
    /// allocating and linking fresh clusters as the data outgrows the
    /// chain and terminating the final cluster with EOC. Running out of
    /// space is not an error here: the short count is returned.
    pub(crate) fn write_chain_at(&self, start: u32, offset: usize, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let cluster_size = self.cluster_size();

        let mut cluster = start;
        for _ in 0..offset / cluster_size {
            match self.fat.next(cluster)? {
                Some(next) => cluster = next,
                None => {
                    let next = match self.alloc_cluster(cluster) {
                        Ok(c) => c,
                        Err(Error::OutOfSpace) => return Ok(0),
                        Err(e) => return Err(e),
                    };
                    self.fat.put(cluster, next)?;
                    cluster = next;
                }
            }
        }

        let mut in_cluster = offset % cluster_size;
        let mut written = 0usize;
        loop {
            let amount = (cluster_size - in_cluster).min(buf.len() - written);
            self.cache.write_at(
                self.cluster_location(cluster) + in_cluster,
                &buf[written..written + amount],
            )?;
            written += amount;
            if written == buf.len() {
                self.fat.put(cluster, END_OF_CLUSTER)?;
                return Ok(written);
            }
            let next = match self.alloc_cluster(cluster) {
                Ok(c) => c,
                Err(Error::OutOfSpace) => {
                    // Surface the short write; the chain stays valid.
                    self.fat.put(cluster, END_OF_CLUSTER)?;
                    return Ok(written);
                }
                Err(e) => return Err(e),
            };
            self.fat.put(cluster, next)?;
            cluster = next;
            in_cluster = 0;
        }
    }

    pub(crate) fn write_dir_entry(
        &self,
        entry_offset: usize,
        entry: &crate::entry::ShortDirEntry,
    ) -> Result<()> {
        self.cache.write_at(entry_offset, entry.as_bytes())?;
        Ok(())
    }
}

pub(crate) struct DirChunks<'v> {
    vol: &'v Volume,
    state: ChunkState,
}

enum ChunkState {
    Region {
        offset: usize,
        len: usize,
        done: bool,
    },
    Chain {
        next: Option<u32>,
    },
}

impl DirChunks<'_> {
    /// The next (absolute byte offset, length) chunk of the directory.
    pub(crate) fn next_chunk(&mut self) -> Result<Option<(usize, usize)>> {
        match &mut self.state {
            ChunkState::Region { offset, len, done } => {
                if *done {
                    Ok(None)
                } else {
                    *done = true;
                    Ok(Some((*offset, *len)))
                }
            }
            ChunkState::Chain { next } => match *next {
                None => Ok(None),
                Some(cluster) => {
                    *next = self.vol.fat.next(cluster)?;
                    Ok(Some((
                        self.vol.cluster_location(cluster),
                        self.vol.cluster_size(),
                    )))
                }
            },
        }
    }
}
