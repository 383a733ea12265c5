//! 32-byte directory entries
//!
//! A directory is a regular file whose contents is a series of 32-byte
//! entries. Special notes about the first byte of an entry:
//! - 0xE5: the entry is free (a tombstone);
//! - 0x00: the entry is free and so is everything after it in this
//!   directory;
//! - 0x2E: the `.` / `..` pseudo entries.
//!
//! A set of long entries always immediately precedes, and is physically
//! contiguous with, the 8.3 entry it is associated with. Every member of
//! the set carries the checksum of the 8.3 name, each member is ordered
//! 1..N from the entry nearest the 8.3 tail, and the last logical (first
//! physical) member is or'd with 0x40. Names are NUL terminated at the
//! exact end position and padded with 0xFFFF.
//!
//! Timestamps are stored as zero throughout; versioning, not mtimes, is
//! this system's notion of history.

use crate::{
    lfn_checksum, ATTR_DIRECTORY, ATTR_LONG_NAME, ATTR_VOLUME_ID, DIR_ENTRY_LAST_AND_UNUSED,
    DIR_ENTRY_UNUSED, DOT, LAST_LONG_ENTRY, LONG_NAME_LEN, SPACE,
};

/// FAT 32-byte directory entry.
#[derive(Clone, Copy, Debug)]
#[repr(packed)]
pub struct ShortDirEntry {
    /// 8.3 name; 8 base bytes then 3 extension bytes, space padded.
    name: [u8; 11],
    /// 0x01 read-only, 0x02 hidden, 0x04 system, 0x08 volume label,
    /// 0x10 directory, 0x20 archive; 0x0F marks a long-name slot.
    attributes: u8,
    reserved_nt: u8,
    time_tenth: u8,
    time: u16,
    date: u16,
    last_accessed: u16,
    /// High word of the starting cluster. In Skinny28 the hi/lo pair is
    /// not a cluster at all but an index into the version table.
    high_clu: u16,
    mod_time: u16,
    mod_date: u16,
    low_clu: u16,
    size: u32,
}

impl ShortDirEntry {
    pub fn empty() -> Self {
        Self {
            name: [0; 11],
            attributes: 0,
            reserved_nt: 0,
            time_tenth: 0,
            time: 0,
            date: 0,
            last_accessed: 0,
            high_clu: 0,
            mod_time: 0,
            mod_date: 0,
            low_clu: 0,
            size: 0,
        }
    }

    pub fn new(name: [u8; 11], attributes: u8, location: u32) -> Self {
        let mut entry = Self::empty();
        entry.name = name;
        entry.attributes = attributes;
        entry.set_location(location);
        entry
    }

    /// The `.` / `..` pseudo entries of a fresh directory.
    pub fn dot_entry(name: &[u8], cluster: u32) -> Self {
        let mut bytes = [SPACE; 11];
        bytes[..name.len()].copy_from_slice(name);
        Self::new(bytes, ATTR_DIRECTORY, cluster)
    }

    pub fn from_bytes(buf: &[u8]) -> Self {
        assert!(buf.len() >= 32);
        unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, 32) }
    }

    pub fn name_bytes(&self) -> [u8; 11] {
        self.name
    }

    /// The stored name with the implied dot, e.g. `HELLO.TXT`.
    pub fn name_string(&self) -> String {
        if self.name[0] == DOT {
            let len = if self.name[1] == DOT { 2 } else { 1 };
            return String::from_utf8_lossy(&self.name[..len]).into_owned();
        }
        let mut out = Vec::with_capacity(12);
        for &b in self.name[..8].iter() {
            if b == SPACE {
                break;
            }
            out.push(b);
        }
        if self.name[8] != SPACE {
            out.push(DOT);
            for &b in self.name[8..].iter() {
                if b == SPACE {
                    break;
                }
                out.push(b);
            }
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    pub fn checksum(&self) -> u8 {
        lfn_checksum(&self.name)
    }

    pub fn attributes(&self) -> u8 {
        self.attributes
    }

    pub fn is_free(&self) -> bool {
        self.name[0] == DIR_ENTRY_UNUSED || self.name[0] == DIR_ENTRY_LAST_AND_UNUSED
    }

    pub fn is_deleted(&self) -> bool {
        self.name[0] == DIR_ENTRY_UNUSED
    }

    /// Free, and the rest of the directory is free too.
    pub fn is_end(&self) -> bool {
        self.name[0] == DIR_ENTRY_LAST_AND_UNUSED
    }

    pub fn is_long_name(&self) -> bool {
        self.attributes == ATTR_LONG_NAME
    }

    pub fn is_dir(&self) -> bool {
        self.attributes == ATTR_DIRECTORY
    }

    pub fn is_volume_label(&self) -> bool {
        self.attributes == ATTR_VOLUME_ID
    }

    pub fn is_dot(&self) -> bool {
        self.name[0] == DOT
    }

    /// Starting cluster on FAT; version-table slot index on Skinny28.
    pub fn location(&self) -> u32 {
        ((self.high_clu as u32) << 16) | self.low_clu as u32
    }

    pub fn set_location(&mut self, location: u32) {
        self.high_clu = (location >> 16) as u16;
        self.low_clu = (location & 0xFFFF) as u16;
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn set_size(&mut self, size: u32) {
        self.size = size;
    }

    pub fn delete(&mut self) {
        self.name[0] = DIR_ENTRY_UNUSED;
    }
}

/// Long directory entry: 13 UCS-2 code units of name per slot, split
/// 5 + 6 + 2 around the fixed fields.
#[derive(Clone, Copy, Debug)]
#[repr(packed)]
pub struct LongDirEntry {
    /// Ordinal 1..N in the low bits; 0x40 or'd into the last logical
    /// (first physical) slot of the set. 0xE5 tombstones the slot.
    order: u8,
    name1: [u16; 5],
    /// Always [`ATTR_LONG_NAME`].
    attributes: u8,
    /// 0: sub-component of a long name. Other values reserved.
    entry_type: u8,
    /// Checksum of the 8.3 name in the companion entry.
    checksum: u8,
    name2: [u16; 6],
    /// Artifact of the FAT first-cluster field; must be zero.
    zero: u16,
    name3: [u16; 2],
}

impl LongDirEntry {
    pub fn from_bytes(buf: &[u8]) -> Self {
        assert!(buf.len() >= 32);
        unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, 32) }
    }

    /// Build the slot with ordinal `order` (0x40 already or'd in for the
    /// first physical slot) for `name`, which is treated as 8-bit data:
    /// one byte per UCS-2 unit, no Unicode interpretation.
    ///
    /// Units past the end of the name are 0xFFFF, except that the exact
    /// end-of-name position (when it falls inside this slot) carries the
    /// 0x0000 terminator.
    pub fn build(order: u8, name: &[u8], short_name: &[u8; 11]) -> Self {
        let mut units = [0xFFFFu16; LONG_NAME_LEN];
        let base = ((order & 0x1F) as usize - 1) * LONG_NAME_LEN;
        for (i, unit) in units.iter_mut().enumerate() {
            let pos = base + i;
            if pos < name.len() {
                *unit = name[pos] as u16;
            } else if pos == name.len() {
                *unit = 0x0000;
            }
        }

        let mut name1 = [0u16; 5];
        let mut name2 = [0u16; 6];
        let mut name3 = [0u16; 2];
        name1.copy_from_slice(&units[..5]);
        name2.copy_from_slice(&units[5..11]);
        name3.copy_from_slice(&units[11..]);

        Self {
            order,
            name1,
            attributes: ATTR_LONG_NAME,
            entry_type: 0,
            checksum: lfn_checksum(short_name),
            name2,
            zero: 0,
            name3,
        }
    }

    pub fn order(&self) -> u8 {
        self.order
    }

    /// Ordinal with the last-entry flag stripped.
    pub fn ordinal(&self) -> usize {
        (self.order & 0x1F) as usize
    }

    pub fn is_last(&self) -> bool {
        self.order & LAST_LONG_ENTRY == LAST_LONG_ENTRY
    }

    pub fn is_deleted(&self) -> bool {
        self.order == DIR_ENTRY_UNUSED
    }

    pub fn checksum(&self) -> u8 {
        self.checksum
    }

    /// The 13 code units of this slot, narrowed back to bytes.
    pub fn name_units(&self) -> [u8; LONG_NAME_LEN] {
        let mut units = [0u16; LONG_NAME_LEN];
        unsafe {
            units[..5].copy_from_slice(&core::ptr::addr_of!(self.name1).read_unaligned());
            units[5..11].copy_from_slice(&core::ptr::addr_of!(self.name2).read_unaligned());
            units[11..].copy_from_slice(&core::ptr::addr_of!(self.name3).read_unaligned());
        }
        let mut bytes = [0u8; LONG_NAME_LEN];
        for (b, &u) in bytes.iter_mut().zip(units.iter()) {
            *b = u as u8;
        }
        bytes
    }

    pub fn delete(&mut self) {
        self.order = DIR_ENTRY_UNUSED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lfn_slot_count;

    #[test]
    fn entries_are_32_bytes() {
        assert_eq!(core::mem::size_of::<ShortDirEntry>(), 32);
        assert_eq!(core::mem::size_of::<LongDirEntry>(), 32);
    }

    #[test]
    fn location_splits_across_hi_lo() {
        let mut sde = ShortDirEntry::empty();
        sde.set_location(0x0012_3456);
        let bytes = sde.as_bytes();
        assert_eq!(&bytes[20..22], &0x0012u16.to_le_bytes());
        assert_eq!(&bytes[26..28], &0x3456u16.to_le_bytes());
        assert_eq!(sde.location(), 0x0012_3456);
    }

    #[test]
    fn name_string_inserts_the_implied_dot() {
        let sde = ShortDirEntry::new(*b"HELLO   TXT", 0x20, 0);
        assert_eq!(sde.name_string(), "HELLO.TXT");
        let sde = ShortDirEntry::new(*b"NOEXT      ", 0x20, 0);
        assert_eq!(sde.name_string(), "NOEXT");
        let dot = ShortDirEntry::dot_entry(b"..", 0);
        assert_eq!(dot.name_string(), "..");
    }

    #[test]
    fn a_13_byte_name_is_one_slot_with_ordinal_0x41() {
        let name = b"exactly13byte";
        assert_eq!(name.len(), 13);
        assert_eq!(lfn_slot_count(name.len()), 1);

        let lde = LongDirEntry::build(1 | LAST_LONG_ENTRY, name, b"EXACTLY13  ");
        assert_eq!(lde.order(), 0x41);
        assert_eq!(&lde.name_units(), name);
        // Name fills the slot exactly: no terminator, no 0xFFFF fill.
        let bytes = lde.as_bytes();
        assert_eq!(&bytes[28..30], &(b't' as u16).to_le_bytes());
        assert_eq!(&bytes[30..32], &(b'e' as u16).to_le_bytes());
    }

    #[test]
    fn a_14_byte_name_takes_two_slots() {
        let name = b"fourteen.bytes";
        assert_eq!(name.len(), 14);
        assert_eq!(lfn_slot_count(name.len()), 2);

        // Physical write order: ordinal 2 (flagged last) first, then 1.
        let first_physical = LongDirEntry::build(2 | LAST_LONG_ENTRY, name, b"FOURTEENBYT");
        let second_physical = LongDirEntry::build(1, name, b"FOURTEENBYT");
        assert_eq!(first_physical.order(), 0x42);
        assert_eq!(second_physical.order(), 0x01);

        // The first 13 code units live in the ordinal-1 slot.
        assert_eq!(&second_physical.name_units(), b"fourteen.byte");
        // The ordinal-2 slot holds the last byte, the terminator, then fill.
        let bytes = first_physical.as_bytes();
        assert_eq!(&bytes[1..3], &(b's' as u16).to_le_bytes());
        assert_eq!(&bytes[3..5], &0x0000u16.to_le_bytes());
        assert_eq!(&bytes[5..7], &0xFFFFu16.to_le_bytes());
    }

    #[test]
    fn every_slot_carries_the_short_name_checksum() {
        let short = b"LONG_N~1TXT";
        let name = b"long_name_with_seventeen_characters.txt";
        let n = lfn_slot_count(name.len());
        for i in 0..n {
            let order = (n - i) as u8 | if i == 0 { LAST_LONG_ENTRY } else { 0 };
            let lde = LongDirEntry::build(order, name, short);
            assert_eq!(lde.checksum(), lfn_checksum(short));
            assert_eq!(lde.attributes, ATTR_LONG_NAME);
        }
    }
}
