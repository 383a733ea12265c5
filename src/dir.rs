//! Directory codec
//!
//! On disk a directory is laid out low address to high address as
//!
//! fileA_lfn_n
//! fileA_lfn_n-1
//! ...
//! fileA_lfn_1
//! fileA_8.3
//! fileB_lfn_n
//! ...
//!
//! The read side walks one cluster's worth of 32-byte slots at a time,
//! folding long-name runs into the 8.3 entry that follows them. The
//! write side emits the mirror image: `ceil(len/13)` long entries from
//! the highest ordinal down, then the 8.3 tail, all contiguous within a
//! single directory cluster.

use log::warn;

use crate::entry::{LongDirEntry, ShortDirEntry};
use crate::{
    lfn_slot_count, ATTR_DEVICE, ATTR_DIRECTORY, ATTR_HIDDEN, ATTR_LONG_NAME, ATTR_VOLUME_ID,
    DIRENT_SIZE, DIR_ENTRY_LAST_AND_UNUSED, DIR_ENTRY_UNUSED, LAST_LONG_ENTRY, LONG_NAME_LEN,
};

/// One logical directory entry, as surfaced by `read_dir`.
#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: String,
    pub is_dir: bool,
    pub attributes: u8,
    /// Starting cluster (FAT) or version-table slot (Skinny28).
    pub location: u32,
    pub size: u32,
    pub(crate) entry: ShortDirEntry,
    /// Slot index of the 8.3 entry within its directory.
    pub(crate) entry_slot: usize,
    /// Slot index where the logical entry begins (its first long slot,
    /// or the 8.3 entry itself when there is none).
    pub(crate) first_slot: usize,
}

/// Result of scanning one buffer-load of directory slots.
pub(crate) enum Scan {
    /// A logical entry, with the slot index to resume from.
    Entry(Box<DirEntryInfo>, usize),
    /// 0x00 first byte: nothing further in this directory.
    End,
    /// Ran off the end of the buffer; continue in the next cluster.
    Exhausted(usize),
}

struct PendingName {
    units: Vec<u8>,
    checksum: u8,
    first_slot: usize,
}

/// Scan `buf` from slot `start` (an index relative to the buffer).
/// `slot_base` is the directory-wide index of the buffer's first slot,
/// so the returned entry positions are directory-relative.
pub(crate) fn scan_slots(buf: &[u8], slot_base: usize, start: usize) -> Scan {
    let mut pending: Option<PendingName> = None;
    let mut i = start;

    while (i + 1) * DIRENT_SIZE <= buf.len() {
        let raw = &buf[i * DIRENT_SIZE..(i + 1) * DIRENT_SIZE];

        if raw[0] == DIR_ENTRY_LAST_AND_UNUSED {
            return Scan::End;
        }
        if raw[0] == DIR_ENTRY_UNUSED {
            pending = None;
            i += 1;
            continue;
        }

        if raw[11] == ATTR_LONG_NAME {
            let lde = LongDirEntry::from_bytes(raw);
            if lde.is_last() {
                pending = Some(PendingName {
                    units: vec![0u8; lde.ordinal() * LONG_NAME_LEN],
                    checksum: lde.checksum(),
                    first_slot: slot_base + i,
                });
            }
            match pending.as_mut() {
                Some(p) if lde.ordinal() >= 1 => {
                    let at = (lde.ordinal() - 1) * LONG_NAME_LEN;
                    if at + LONG_NAME_LEN <= p.units.len() {
                        p.units[at..at + LONG_NAME_LEN].copy_from_slice(&lde.name_units());
                    }
                }
                _ => {
                    warn!("orphaned long-name slot at index {}", slot_base + i);
                }
            }
            i += 1;
            continue;
        }

        match raw[11] {
            ATTR_HIDDEN | ATTR_VOLUME_ID | ATTR_DEVICE => {
                pending = None;
                i += 1;
                continue;
            }
            _ => {}
        }

        let sde = ShortDirEntry::from_bytes(raw);
        let (name, first_slot) = match pending.take() {
            Some(p) if p.checksum == sde.checksum() && !sde.is_dot() => {
                (long_name_string(&p.units), p.first_slot)
            }
            Some(_) => {
                warn!(
                    "long-name checksum mismatch ahead of {:?}; using the 8.3 name",
                    sde.name_string()
                );
                (sde.name_string(), slot_base + i)
            }
            None => (sde.name_string(), slot_base + i),
        };

        let info = DirEntryInfo {
            name,
            is_dir: sde.attributes() == ATTR_DIRECTORY,
            attributes: sde.attributes(),
            location: sde.location(),
            size: sde.size(),
            entry: sde,
            entry_slot: slot_base + i,
            first_slot,
        };
        return Scan::Entry(Box::new(info), slot_base + i + 1);
    }

    Scan::Exhausted(slot_base + i)
}

fn long_name_string(units: &[u8]) -> String {
    let len = units
        .iter()
        .position(|&b| b == 0x00 || b == 0xFF)
        .unwrap_or(units.len());
    String::from_utf8_lossy(&units[..len]).into_owned()
}

/// Slots needed for `name`: its long-entry run plus the 8.3 tail.
pub(crate) fn slots_required(name: &str) -> usize {
    lfn_slot_count(name.len()) + 1
}

/// Emit the full run for `name`: long entries from the highest ordinal
/// down to 1, then the 8.3 entry. The caller must place the run
/// contiguously within one directory cluster.
pub(crate) fn build_entry_run(name: &str, sde: &ShortDirEntry) -> Vec<[u8; DIRENT_SIZE]> {
    let bytes = name.as_bytes();
    let count = lfn_slot_count(bytes.len());
    let short_name = sde.name_bytes();

    let mut run = Vec::with_capacity(count + 1);
    for i in (1..=count).rev() {
        let mut order = i as u8;
        if i == count {
            order |= LAST_LONG_ENTRY;
        }
        let lde = LongDirEntry::build(order, bytes, &short_name);
        let mut slot = [0u8; DIRENT_SIZE];
        slot.copy_from_slice(lde.as_bytes());
        run.push(slot);
    }

    let mut tail = [0u8; DIRENT_SIZE];
    tail.copy_from_slice(sde.as_bytes());
    run.push(tail);
    run
}
