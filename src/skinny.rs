//! The Skinny28 engine
//!
//! Same layout and directory machinery as the FAT engine, with one
//! twist: a file's cluster-hi/lo pair is an index into the version
//! table, never a cluster. Creating a file allocates a version slot;
//! every write lays down a brand-new chain and pushes its head onto the
//! record, so the three previous contents stay readable; reads resolve
//! the current chain through the record. Directories are untouched by
//! versioning -- they keep real cluster numbers, or `cd` could not
//! descend into them.

use std::sync::Arc;

use crate::device::BlockDevice;
use crate::engine::{create_node, open_at, open_dir_at, resolve, tombstone};
use crate::fs::Volume;
use crate::vers::VersionTable;
use crate::vfs::{FileKind, FileSystemOps, OpenDir, OpenFile};
use crate::{Error, Result, END_OF_CLUSTER};

pub struct SkinnyEngine {
    vol: Volume,
    vers: VersionTable,
}

impl SkinnyEngine {
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self> {
        let vol = Volume::mount(device)?;
        let vers = VersionTable::new(vol.bpb.version_table_cluster());
        Ok(Self { vol, vers })
    }

    pub fn volume(&self) -> &Volume {
        &self.vol
    }

    fn revision_chain(&self, file: &OpenFile, revision: u32) -> Result<u32> {
        if !(1..=3).contains(&revision) {
            return Err(Error::BadRevision(revision));
        }
        let record = self.vers.record(&self.vol, file.entry.location())?;
        record.revision(revision)
    }
}

impl FileSystemOps for SkinnyEngine {
    fn create(&self, path: &str, kind: FileKind) -> Result<()> {
        // Version slot first; its index is what the entry stores. The
        // record gets an initial zeroed chain right away: a reachable
        // file must never sit at vcurr == 0, which is what marks a slot
        // free for reallocation.
        create_node(&self.vol, path, kind, |vol| {
            let slot = self.vers.allocate_slot(vol)?;
            let hint = vol.info.read().alloc_hint();
            let head = vol.alloc_cluster(hint)?;
            vol.fat.put(head, END_OF_CLUSTER)?;
            self.vers.push(vol, slot, head)?;
            Ok(slot)
        })
    }

    fn open(&self, path: &str, change_dir: bool) -> Result<Option<OpenFile>> {
        open_at(&self.vol, path, change_dir)
    }

    fn read(&self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        let size = file.entry.size() as usize;
        if file.offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let current = self.vers.current(&self.vol, file.entry.location())?;
        if current < 2 {
            return Ok(0);
        }
        let want = (size - file.offset).min(buf.len());
        let read = self
            .vol
            .read_chain_at(current, file.offset, &mut buf[..want])?;
        file.offset += read;
        Ok(read)
    }

    /// Writes are never in-place: a fresh chain gets the data, then its
    /// head is pushed onto the version record, demoting the previous
    /// contents to revision 1.
    fn write(&self, file: &mut OpenFile, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let slot = file.entry.location();
        let previous = self.vers.current(&self.vol, slot)?;

        let start = match self.vol.alloc_cluster(previous) {
            Ok(cluster) => cluster,
            // No fresh chain, no new revision; surface the short count.
            Err(Error::OutOfSpace) => return Ok(0),
            Err(e) => return Err(e),
        };
        self.vol.fat.put(start, END_OF_CLUSTER)?;

        file.beg_marker = 0;
        file.eof_marker = 0;
        let written = self.vol.write_chain_at(start, 0, buf)?;
        file.offset = written;
        file.eof_marker = written;

        self.vers.push(&self.vol, slot, start)?;

        file.entry.set_size(written as u32);
        self.vol.write_dir_entry(file.entry_pos, &file.entry)?;
        self.vol.flush()?;
        Ok(written)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let located = resolve(&self.vol, path)?
            .ok_or_else(|| Error::NoSuchPath(path.to_string()))?;
        tombstone(&self.vol, &located)?;
        if located.info.is_dir {
            self.vol.release_chain(located.info.location)?;
        } else {
            // Every retained chain goes, and the record frees up.
            let slot = located.info.location;
            let record = self.vers.record(&self.vol, slot)?;
            for index in 0..=3 {
                let head = record.revision(index)?;
                self.vol.release_chain(head)?;
            }
            self.vers.clear(&self.vol, slot)?;
        }
        self.vol.flush()?;
        Ok(())
    }

    fn open_dir(&self, path: &str) -> Result<OpenDir> {
        open_dir_at(&self.vol, path)
    }

    fn read_dir(&self, dir: &mut OpenDir) -> Result<Option<crate::dir::DirEntryInfo>> {
        match self.vol.next_dir_entry(dir.cluster, dir.slot)? {
            Some((info, next)) => {
                dir.slot = next;
                Ok(Some(info))
            }
            None => Ok(None),
        }
    }

    fn teardown(&self) -> Result<()> {
        self.vol.flush()
    }

    /// Chain head of revision `index` (0 is the current chain) for the
    /// shell's `revs` display.
    fn get_revision(&self, file: &OpenFile, index: u32) -> Result<u32> {
        let record = self.vers.record(&self.vol, file.entry.location())?;
        record.revision(index)
    }

    fn revert(&self, file: &mut OpenFile, revision: u32) -> Result<()> {
        self.vers.revert(&self.vol, file.entry.location(), revision)?;
        self.vol.flush()
    }

    /// Read the file's data through revision `revision` instead of the
    /// current chain, without altering any state. A revision holding no
    /// chain reads as the pre-first-write contents: empty.
    fn read_revision(&self, file: &mut OpenFile, buf: &mut [u8], revision: u32) -> Result<usize> {
        let chain = self.revision_chain(file, revision)?;
        if chain < 2 {
            return Ok(0);
        }
        let size = file.entry.size() as usize;
        if file.offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let want = (size - file.offset).min(buf.len());
        let read = self.vol.read_chain_at(chain, file.offset, &mut buf[..want])?;
        file.offset += read;
        Ok(read)
    }
}
