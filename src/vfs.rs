//! Mount table and operation dispatch
//!
//! One context object instead of process-wide tables: [`Vfs`] owns the
//! fixed-size mount, open-file and open-directory tables, and
//! [`FileSystemOps`] is the capability set each engine publishes --
//! with the Skinny28-only revision operations present on the table but
//! unbacked (`Unsupported`) for plain FAT mounts. Slot lifetime is
//! slot occupancy: closing a handle releases everything it carried, so
//! nothing can point at a record that is gone.

use std::sync::Arc;

use log::info;

use crate::device::{BlockDevice, FileDevice};
use crate::dir::DirEntryInfo;
use crate::engine::FatEngine;
use crate::entry::ShortDirEntry;
use crate::skinny::SkinnyEngine;
use crate::{Error, Result, DIR_LIMIT, FILE_LIMIT, MOUNT_LIMIT};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsKind {
    Fat,
    Skinny28,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Position at byte 0.
    Begin,
    /// Position at the current end of the file.
    Append,
}

/// An open-file record: everything a later `read`/`write` needs to get
/// back to the entry it came from.
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub(crate) mount: usize,
    pub(crate) offset: usize,
    /// Cached directory entry.
    pub(crate) entry: ShortDirEntry,
    /// Absolute byte offset of that entry on disk, for write-back.
    pub(crate) entry_pos: usize,
    /// Logical begin/end-of-file markers; `size = eof - beg`.
    pub(crate) beg_marker: usize,
    pub(crate) eof_marker: usize,
}

impl OpenFile {
    pub fn size(&self) -> u32 {
        self.entry.size()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// An open-directory record; `slot` is the 32-byte-entry index the next
/// `read_dir` resumes from.
#[derive(Debug, Clone)]
pub struct OpenDir {
    pub(crate) mount: usize,
    pub(crate) cluster: u32,
    pub(crate) slot: usize,
}

/// The capability set every engine publishes. The mount table stores
/// which concrete engine backs each mount; the revision operations are
/// part of the table but only Skinny28 backs them.
pub trait FileSystemOps: Send + Sync {
    fn create(&self, path: &str, kind: FileKind) -> Result<()>;
    /// Open a file, or -- with `change_dir` -- move the mount's current
    /// directory and return `None`.
    fn open(&self, path: &str, change_dir: bool) -> Result<Option<OpenFile>>;
    fn read(&self, file: &mut OpenFile, buf: &mut [u8]) -> Result<usize>;
    fn write(&self, file: &mut OpenFile, buf: &[u8]) -> Result<usize>;
    fn delete(&self, path: &str) -> Result<()>;
    fn open_dir(&self, path: &str) -> Result<OpenDir>;
    fn read_dir(&self, dir: &mut OpenDir) -> Result<Option<DirEntryInfo>>;
    fn teardown(&self) -> Result<()>;

    fn get_revision(&self, _file: &OpenFile, _index: u32) -> Result<u32> {
        Err(Error::Unsupported)
    }
    fn revert(&self, _file: &mut OpenFile, _revision: u32) -> Result<()> {
        Err(Error::Unsupported)
    }
    fn read_revision(
        &self,
        _file: &mut OpenFile,
        _buf: &mut [u8],
        _revision: u32,
    ) -> Result<usize> {
        Err(Error::Unsupported)
    }
}

pub struct Mount {
    pub device_path: String,
    pub mount_point: String,
    pub kind: FsKind,
    engine: Box<dyn FileSystemOps>,
}

/// The dispatch context: mount, open-file and open-directory tables.
pub struct Vfs {
    mounts: Vec<Option<Mount>>,
    files: Vec<Option<OpenFile>>,
    dirs: Vec<Option<OpenDir>>,
}

impl Default for Vfs {
    fn default() -> Self {
        Self::new()
    }
}

impl Vfs {
    pub fn new() -> Self {
        Self {
            mounts: Vec::new(),
            files: Vec::new(),
            dirs: Vec::new(),
        }
    }

    /// Mount the volume image or device node at `device_path`.
    pub fn mount(&mut self, kind: FsKind, device_path: &str, mount_point: &str) -> Result<usize> {
        let device = FileDevice::open(device_path).map_err(Error::DeviceUnreadable)?;
        self.mount_with(kind, Arc::new(device), device_path, mount_point)
    }

    /// Mount an already-opened device (in-memory volumes, tests).
    pub fn mount_device(
        &mut self,
        kind: FsKind,
        device: Arc<dyn BlockDevice>,
        mount_point: &str,
    ) -> Result<usize> {
        self.mount_with(kind, device, "<device>", mount_point)
    }

    fn mount_with(
        &mut self,
        kind: FsKind,
        device: Arc<dyn BlockDevice>,
        device_path: &str,
        mount_point: &str,
    ) -> Result<usize> {
        let engine: Box<dyn FileSystemOps> = match kind {
            FsKind::Fat => Box::new(FatEngine::mount(device)?),
            FsKind::Skinny28 => Box::new(SkinnyEngine::mount(device)?),
        };
        let mount = Mount {
            device_path: device_path.to_string(),
            mount_point: mount_point.to_string(),
            kind,
            engine,
        };
        let slot = alloc_slot(&mut self.mounts, MOUNT_LIMIT, Error::MountTableFull)?;
        info!("{device_path} on {mount_point} type {kind:?}");
        self.mounts[slot] = Some(mount);
        Ok(slot)
    }

    pub fn unmount(&mut self, mount_point: &str) -> Result<()> {
        let slot = self
            .mounts
            .iter()
            .position(|m| {
                m.as_ref()
                    .map(|m| m.mount_point == mount_point)
                    .unwrap_or(false)
            })
            .ok_or_else(|| Error::NoSuchMount(mount_point.to_string()))?;

        // Handles die with their mount.
        for file in self.files.iter_mut() {
            if file.as_ref().map(|f| f.mount == slot).unwrap_or(false) {
                *file = None;
            }
        }
        for dir in self.dirs.iter_mut() {
            if dir.as_ref().map(|d| d.mount == slot).unwrap_or(false) {
                *dir = None;
            }
        }

        let mount = self.mounts[slot].take();
        if let Some(mount) = mount {
            mount.engine.teardown()?;
        }
        Ok(())
    }

    pub fn mounts(&self) -> impl Iterator<Item = &Mount> + '_ {
        self.mounts.iter().flatten()
    }

    /// Route a path to its mount: the longest mount point prefixing the
    /// path wins. Relative paths resolve against the mount's current
    /// directory, so any single mounted volume accepts them.
    fn mount_for_path<'p>(&self, path: &'p str) -> Result<(usize, &'p str)> {
        if !path.starts_with('/') {
            let mut only = None;
            for (i, m) in self.mounts.iter().enumerate() {
                if m.is_some() {
                    if only.is_some() {
                        return Err(Error::NoSuchMount(path.to_string()));
                    }
                    only = Some(i);
                }
            }
            return only
                .map(|i| (i, path))
                .ok_or_else(|| Error::NoSuchMount(path.to_string()));
        }

        let mut best: Option<(usize, usize)> = None;
        for (i, mount) in self.mounts.iter().enumerate() {
            let Some(mount) = mount else { continue };
            let mp = mount.mount_point.trim_end_matches('/');
            if path.starts_with(mp) && (mp.is_empty() || path[mp.len()..].starts_with('/') || path.len() == mp.len())
            {
                let score = mp.len();
                if best.map(|(_, s)| score >= s).unwrap_or(true) {
                    best = Some((i, score));
                }
            }
        }
        let (slot, score) = best.ok_or_else(|| Error::NoSuchMount(path.to_string()))?;
        let rel = &path[score..];
        Ok((slot, if rel.is_empty() { "/" } else { rel }))
    }

    fn engine(&self, mount: usize) -> Result<&dyn FileSystemOps> {
        self.mounts
            .get(mount)
            .and_then(|m| m.as_ref())
            .map(|m| m.engine.as_ref())
            .ok_or(Error::BadHandle(mount))
    }

    pub fn create(&mut self, path: &str, kind: FileKind) -> Result<()> {
        let (mount, rel) = self.mount_for_path(path)?;
        self.engine(mount)?.create(rel, kind)
    }

    pub fn open(&mut self, path: &str, mode: OpenMode) -> Result<usize> {
        let (mount, rel) = self.mount_for_path(path)?;
        let mut file = self
            .engine(mount)?
            .open(rel, false)?
            .ok_or_else(|| Error::IsADirectory(path.to_string()))?;
        file.mount = mount;
        if mode == OpenMode::Append {
            file.offset = file.entry.size() as usize;
        }
        let slot = alloc_slot(&mut self.files, FILE_LIMIT, Error::FileTableFull)?;
        self.files[slot] = Some(file);
        Ok(slot)
    }

    pub fn close(&mut self, file: usize) -> Result<()> {
        let slot = self
            .files
            .get_mut(file)
            .ok_or(Error::BadHandle(file))?;
        if slot.take().is_none() {
            return Err(Error::BadHandle(file));
        }
        Ok(())
    }

    pub fn read(&mut self, file: usize, buf: &mut [u8]) -> Result<usize> {
        let mut record = self.take_file(file)?;
        let result = self.engine(record.mount)?.read(&mut record, buf);
        self.files[file] = Some(record);
        result
    }

    pub fn write(&mut self, file: usize, buf: &[u8]) -> Result<usize> {
        let mut record = self.take_file(file)?;
        let result = self.engine(record.mount)?.write(&mut record, buf);
        self.files[file] = Some(record);
        result
    }

    pub fn remove(&mut self, path: &str) -> Result<()> {
        let (mount, rel) = self.mount_for_path(path)?;
        self.engine(mount)?.delete(rel)
    }

    pub fn change_dir(&mut self, path: &str) -> Result<()> {
        let (mount, rel) = self.mount_for_path(path)?;
        match self.engine(mount)?.open(rel, true)? {
            None => Ok(()),
            Some(_) => Err(Error::NotADirectory(path.to_string())),
        }
    }

    pub fn open_dir(&mut self, path: &str) -> Result<usize> {
        let (mount, rel) = self.mount_for_path(path)?;
        let mut dir = self.engine(mount)?.open_dir(rel)?;
        dir.mount = mount;
        let slot = alloc_slot(&mut self.dirs, DIR_LIMIT, Error::DirTableFull)?;
        self.dirs[slot] = Some(dir);
        Ok(slot)
    }

    pub fn read_dir(&mut self, dir: usize) -> Result<Option<DirEntryInfo>> {
        let mut record = self
            .dirs
            .get_mut(dir)
            .and_then(Option::take)
            .ok_or(Error::BadHandle(dir))?;
        let result = self.engine(record.mount)?.read_dir(&mut record);
        self.dirs[dir] = Some(record);
        result
    }

    pub fn close_dir(&mut self, dir: usize) -> Result<()> {
        let slot = self.dirs.get_mut(dir).ok_or(Error::BadHandle(dir))?;
        if slot.take().is_none() {
            return Err(Error::BadHandle(dir));
        }
        Ok(())
    }

    /// Skinny28: chain head of revision `index` of an open file.
    pub fn get_revision(&mut self, file: usize, index: u32) -> Result<u32> {
        let record = self.take_file(file)?;
        let result = self.engine(record.mount)?.get_revision(&record, index);
        self.files[file] = Some(record);
        result
    }

    /// Skinny28: promote revision `revision` to current.
    pub fn revert(&mut self, file: usize, revision: u32) -> Result<()> {
        let mut record = self.take_file(file)?;
        let result = self.engine(record.mount)?.revert(&mut record, revision);
        self.files[file] = Some(record);
        result
    }

    /// Skinny28: read through an older revision without changing state.
    pub fn read_revision(&mut self, file: usize, buf: &mut [u8], revision: u32) -> Result<usize> {
        let mut record = self.take_file(file)?;
        let result = self
            .engine(record.mount)?
            .read_revision(&mut record, buf, revision);
        self.files[file] = Some(record);
        result
    }

    fn take_file(&mut self, file: usize) -> Result<OpenFile> {
        self.files
            .get_mut(file)
            .and_then(Option::take)
            .ok_or(Error::BadHandle(file))
    }
}

fn alloc_slot<T>(table: &mut Vec<Option<T>>, limit: usize, full: Error) -> Result<usize> {
    if let Some(slot) = table.iter().position(Option::is_none) {
        return Ok(slot);
    }
    if table.len() < limit {
        table.push(None);
        return Ok(table.len() - 1);
    }
    Err(full)
}
