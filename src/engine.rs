//! The plain FAT engine, and the path/create/delete plumbing both
//! engines share
//!
//! A path is tokenised on `/`; resolution starts from the mount's
//! current directory, or from the root for absolute paths. A component
//! that resolves to cluster 0 means the root and is reloaded from the
//! BPB. Directories store real cluster numbers on both engines, so the
//! walk itself never cares which engine owns the volume; only what the
//! terminal entry's cluster-hi/lo pair *means* differs.

use std::sync::Arc;

use log::debug;

use crate::device::BlockDevice;
use crate::dir::{build_entry_run, slots_required};
use crate::entry::ShortDirEntry;
use crate::fs::{Located, Volume};
use crate::vfs::{FileKind, FileSystemOps, OpenDir, OpenFile};
use crate::{
    basis_name, Error, Result, ATTR_ARCHIVE, ATTR_DIRECTORY, DIRENT_SIZE, DIR_ENTRY_UNUSED,
    END_OF_CLUSTER,
};

pub struct FatEngine {
    vol: Volume,
}

impl FatEngine {
    pub fn mount(device: Arc<dyn BlockDevice>) -> Result<Self> {
        Ok(Self {
            vol: Volume::mount(device)?,
        })
    }

    pub fn volume(&self) -> &Volume {
        &self.vol
    }
}

/// Where resolution of `path` begins: the root for absolute paths, the
/// mount's current directory otherwise.
pub(crate) fn start_dir(vol: &Volume, path: &str) -> u32 {
    if path.starts_with('/') {
        0
    } else {
        *vol.current_directory.read()
    }
}

pub(crate) fn components(path: &str) -> Vec<&str> {
    path.split('/')
        .filter(|c| !c.is_empty() && *c != ".")
        .collect()
}

/// Resolve `path` to its terminal entry. `Ok(None)` means the path
/// names the root itself, which has no directory entry of its own.
pub(crate) fn resolve(vol: &Volume, path: &str) -> Result<Option<Located>> {
    let comps = components(path);
    if comps.is_empty() {
        return Ok(None);
    }
    let mut dir = start_dir(vol, path);
    for (i, comp) in comps.iter().enumerate() {
        let located = vol
            .find_in_dir(dir, comp)?
            .ok_or_else(|| Error::NoSuchPath(path.to_string()))?;
        if i + 1 == comps.len() {
            return Ok(Some(located));
        }
        if !located.info.is_dir {
            return Err(Error::NoSuchPath(path.to_string()));
        }
        dir = located.info.location;
    }
    unreachable!()
}

/// Resolve everything but the final component; returns the directory to
/// create in and the leaf name.
pub(crate) fn resolve_parent<'p>(vol: &Volume, path: &'p str) -> Result<(u32, &'p str)> {
    let comps = components(path);
    let Some((&leaf, parents)) = comps.split_last() else {
        return Err(Error::NoSuchPath(path.to_string()));
    };
    let mut dir = start_dir(vol, path);
    for comp in parents {
        let located = vol
            .find_in_dir(dir, comp)?
            .ok_or_else(|| Error::NoSuchPath(path.to_string()))?;
        if !located.info.is_dir {
            return Err(Error::NoSuchPath(path.to_string()));
        }
        dir = located.info.location;
    }
    Ok((dir, leaf))
}

/// Create a file or directory entry under `path`. `file_location`
/// supplies what a fresh *file* entry stores in its cluster-hi/lo pair
/// (0 on FAT, a version-table slot on Skinny28); directories always get
/// a real, zeroed cluster with `.` and `..` inside.
pub(crate) fn create_node(
    vol: &Volume,
    path: &str,
    kind: FileKind,
    file_location: impl FnOnce(&Volume) -> Result<u32>,
) -> Result<()> {
    let (parent, leaf) = resolve_parent(vol, path)?;
    if vol.find_in_dir(parent, leaf)?.is_some() {
        return Err(Error::AlreadyExists(path.to_string()));
    }

    let sde = match kind {
        FileKind::File => {
            let location = file_location(vol)?;
            ShortDirEntry::new(basis_name(leaf), ATTR_ARCHIVE, location)
        }
        FileKind::Dir => {
            let hint = vol.info.read().alloc_hint();
            let cluster = vol.alloc_cluster(hint)?;
            vol.fat.put(cluster, END_OF_CLUSTER)?;
            write_dot_entries(vol, cluster, parent)?;
            ShortDirEntry::new(basis_name(leaf), ATTR_DIRECTORY, cluster)
        }
    };

    let run = build_entry_run(leaf, &sde);
    let size_req = slots_required(leaf);
    debug_assert_eq!(run.len(), size_req);

    let at = vol
        .find_free_run(parent, size_req)?
        .ok_or(Error::DirectoryFull)?;
    for (i, slot) in run.iter().enumerate() {
        vol.cache.write_at(at + i * DIRENT_SIZE, slot)?;
    }
    debug!("created {path:?} ({kind:?}) at byte offset {at:#x}");
    vol.flush()?;
    Ok(())
}

/// The `.` and `..` entries of a freshly made directory. `..` stores the
/// parent's starting cluster, which is 0 when the parent is the root.
fn write_dot_entries(vol: &Volume, cluster: u32, parent: u32) -> Result<()> {
    let dot = ShortDirEntry::dot_entry(b".", cluster);
    let dotdot = ShortDirEntry::dot_entry(b"..", parent);
    let location = vol.cluster_location(cluster);
    vol.cache.write_at(location, dot.as_bytes())?;
    vol.cache.write_at(location + DIRENT_SIZE, dotdot.as_bytes())?;
    Ok(())
}

/// Tombstone every slot of a logical entry, the long-name run and its
/// 8.3 tail.
pub(crate) fn tombstone(vol: &Volume, located: &Located) -> Result<()> {
    let mut offset = located.first_offset;
    while offset <= located.entry_offset {
        vol.cache.write_at(offset, &[DIR_ENTRY_UNUSED])?;
        offset += DIRENT_SIZE;
    }
    Ok(())
}

/// Resolve a path to an open directory handle.
pub(crate) fn open_dir_at(vol: &Volume, path: &str) -> Result<OpenDir> {
    let cluster = match resolve(vol, path)? {
        None => start_dir(vol, path),
        Some(located) => {
            if !located.info.is_dir {
                return Err(Error::NotADirectory(path.to_string()));
            }
            located.info.location
        }
    };
    Ok(OpenDir {
        mount: 0,
        cluster,
        slot: 0,
    })
}

/// Open shared by both engines; what differs is how `read`/`write`
/// interpret the entry's location, not how the entry is found.
pub(crate) fn open_at(vol: &Volume, path: &str, change_dir: bool) -> Result<Option<OpenFile>> {
    match resolve(vol, path)? {
        None => {
            // The root itself.
            if change_dir {
                *vol.current_directory.write() = 0;
                Ok(None)
            } else {
                Err(Error::IsADirectory(path.to_string()))
            }
        }
        Some(located) => {
            if located.info.is_dir {
                if change_dir {
                    *vol.current_directory.write() = located.info.location;
                    Ok(None)
                } else {
                    Err(Error::IsADirectory(path.to_string()))
                }
            } else if change_dir {
                Err(Error::NotADirectory(path.to_string()))
            } else {
                let size = located.info.size as usize;
                Ok(Some(OpenFile {
                    mount: 0,
                    offset: 0,
                    entry: located.info.entry,
                    entry_pos: located.entry_offset,
                    beg_marker: 0,
                    eof_marker: size,
                }))
            }
        }
    }
}

impl FileSystemOps for FatEngine {
    fn create(&self, path: &str, kind: FileKind) -> Result<()> {
        // A plain FAT file starts with no clusters at all; the first
        // write allocates its chain.
        create_node(&self.vol, path, kind, |_| Ok(0))
    }

    fn open(&self, path: &str, change_dir: bool) -> Result<Option<OpenFile>> {
        open_at(&self.vol, path, change_dir)
    }

    fn read(&self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize> {
        let size = file.entry.size() as usize;
        if file.offset >= size || buf.is_empty() {
            return Ok(0);
        }
        let start = file.entry.location();
        if start < 2 {
            return Ok(0);
        }
        let want = (size - file.offset).min(buf.len());
        let read = self.vol.read_chain_at(start, file.offset, &mut buf[..want])?;
        file.offset += read;
        Ok(read)
    }

    fn write(&self, file: &mut OpenFile, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut start = file.entry.location();
        if start < 2 {
            let hint = self.vol.info.read().alloc_hint();
            start = match self.vol.alloc_cluster(hint) {
                Ok(cluster) => cluster,
                // Nothing written; surface the short count.
                Err(Error::OutOfSpace) => return Ok(0),
                Err(e) => return Err(e),
            };
            self.vol.fat.put(start, END_OF_CLUSTER)?;
            file.entry.set_location(start);
            file.beg_marker = 0;
            file.eof_marker = 0;
        }

        let written = self.vol.write_chain_at(start, file.offset, buf)?;
        file.offset += written;
        if file.offset > file.eof_marker {
            file.eof_marker = file.offset;
        }
        file.entry.set_size((file.eof_marker - file.beg_marker) as u32);
        self.vol.write_dir_entry(file.entry_pos, &file.entry)?;
        self.vol.flush()?;
        Ok(written)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let located = resolve(&self.vol, path)?
            .ok_or_else(|| Error::NoSuchPath(path.to_string()))?;
        tombstone(&self.vol, &located)?;
        self.vol.release_chain(located.info.location)?;
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
}
