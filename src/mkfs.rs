//! The formatter
//!
//! Lays down a consistent empty volume: primary boot sector plus the
//! backup copy at sector 6, the FSInfo sector with both counters left
//! "unknown" for the first mount to compute, both FAT copies with the
//! reserved entries seeded (the root directory at cluster 2 and the
//! version table at cluster 3, both EOC-terminated), and a volume-label
//! entry in the otherwise empty root.
//!
//! The produced volume is not bootable; the boot-code area holds the
//! classic "This is not a bootable disk" stub so a stray boot attempt
//! says something useful.

use log::info;

use crate::bpb::{BootSector, ExtBootSector32, FsInfoCounters};
use crate::device::{BlockDevice, DeviceError};
use crate::entry::ShortDirEntry;
use crate::{Error, Result, ATTR_VOLUME_ID, SPACE};

/// Disk-size (in sectors) to sectors-per-cluster tables, straight from
/// the 1.03 specification. A zero value means the size is too small to
/// format.
pub const DSK_TABLE_FAT16: [(u32, u8); 8] = [
    (8400, 0),
    (32680, 2),
    (262144, 4),
    (524288, 8),
    (1048576, 16),
    (2097152, 32),
    (4194304, 64),
    (0xFFFFFFFF, 64),
];

pub const DSK_TABLE_FAT32: [(u32, u8); 6] = [
    (66600, 0),
    (32680, 1),
    (16777216, 8),
    (33554432, 16),
    (67108864, 32),
    (0xFFFFFFFF, 64),
];

/// Volumes below 512 MiB pick their cluster size from the FAT16 table.
const FAT16_SIZE_LIMIT: u64 = 536_870_912;

/// The boot-code stub: prints a "not a bootable disk" message.
const BOOT_CODE: [u8; 129] = [
    0x0E, 0x1F, 0xBE, 0x77, 0x7C, 0xAC, 0x22, 0xC0, 0x74, 0x0B, 0x56, 0xB4, 0x0E, 0xBB, 0x07,
    0x00, 0xCD, 0x10, 0x5E, 0xEB, 0xF0, 0x32, 0xE4, 0xCD, 0x16, 0xCD, 0x19, 0xEB, 0xFE, 0x54,
    0x68, 0x69, 0x73, 0x20, 0x69, 0x73, 0x20, 0x6E, 0x6F, 0x74, 0x20, 0x61, 0x20, 0x62, 0x6F,
    0x6F, 0x74, 0x61, 0x62, 0x6C, 0x65, 0x20, 0x64, 0x69, 0x73, 0x6B, 0x2E, 0x20, 0x20, 0x50,
    0x6C, 0x65, 0x61, 0x73, 0x65, 0x20, 0x69, 0x6E, 0x73, 0x65, 0x72, 0x74, 0x20, 0x61, 0x20,
    0x62, 0x6F, 0x6F, 0x74, 0x61, 0x62, 0x6C, 0x65, 0x20, 0x66, 0x6C, 0x6F, 0x70, 0x70, 0x79,
    0x20, 0x61, 0x6E, 0x64, 0x0D, 0x0A, 0x70, 0x72, 0x65, 0x73, 0x73, 0x20, 0x61, 0x6E, 0x79,
    0x20, 0x6B, 0x65, 0x79, 0x20, 0x74, 0x6F, 0x20, 0x74, 0x72, 0x79, 0x20, 0x61, 0x67, 0x61,
    0x69, 0x6E, 0x20, 0x2E, 0x2E, 0x2E, 0x20, 0x0D, 0x0A,
];

const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const NO_NAME: [u8; 11] = *b"NO NAME    ";

#[derive(Debug, Clone)]
pub struct FormatOptions {
    pub sector_size: u16,
    /// Overrides the size-table lookup when set.
    pub sectors_per_cluster: Option<u8>,
    pub label: Option<String>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            sector_size: 512,
            sectors_per_cluster: None,
            label: None,
        }
    }
}

/// Parse a size argument with an optional K/M/G suffix (powers of 1024).
pub fn parse_size(arg: &str) -> Option<u64> {
    let (digits, shift) = match arg.as_bytes().last()? {
        b'K' => (&arg[..arg.len() - 1], 10),
        b'M' => (&arg[..arg.len() - 1], 20),
        b'G' => (&arg[..arg.len() - 1], 30),
        _ => (arg, 0),
    };
    let n: u64 = digits.parse().ok()?;
    Some(n << shift)
}

fn sectors_per_cluster_for(size: u64, sector_size: u16) -> u8 {
    let sectors = size / sector_size as u64;
    let table: &[(u32, u8)] = if size < FAT16_SIZE_LIMIT {
        &DSK_TABLE_FAT16
    } else {
        &DSK_TABLE_FAT32
    };
    for &(disk_size, spc) in table {
        if sectors <= disk_size as u64 {
            return spc;
        }
    }
    0
}

fn label_bytes(label: &Option<String>) -> [u8; 11] {
    match label {
        None => NO_NAME,
        Some(label) => {
            let mut bytes = [SPACE; 11];
            for (dst, src) in bytes.iter_mut().zip(label.bytes()) {
                *dst = src;
            }
            bytes
        }
    }
}

/// Write a fresh volume onto `device`, using its full size.
pub fn format(device: &dyn BlockDevice, options: &FormatOptions) -> Result<()> {
    let size = device.size().map_err(Error::DeviceUnreadable)?;
    let sector_size = options.sector_size;
    let sectors_per_cluster = match options.sectors_per_cluster {
        Some(spc) => spc,
        None => sectors_per_cluster_for(size, sector_size),
    };
    if sectors_per_cluster == 0 || !sectors_per_cluster.is_power_of_two() {
        return Err(Error::BadSignature);
    }

    let total_sectors = (size / sector_size as u64) as u32;
    let reserved_sectors = 32u16;
    let table_count = 2u8;

    // Sectors per FAT copy, per the 1.03 algorithm. Entries here are
    // always 32-bit (even when the cluster count will classify the
    // volume FAT16), so the FAT32 variant of the divisor applies
    // unconditionally.
    let tmp1 = total_sectors - reserved_sectors as u32;
    let tmp2 = (256 * sectors_per_cluster as u32 + table_count as u32) / 2;
    let table_size = (tmp1 + tmp2 - 1) / tmp2;

    let boot = BootSector {
        boot_jump: [0xEB, 0x58, 0x90],
        oem_name: *b"mkdosfs ",
        bytes_per_sector: sector_size,
        sectors_per_cluster,
        reserved_sector_count: reserved_sectors,
        table_count,
        // Version table cluster, not a root entry count.
        root_entry_count: 3,
        total_sectors_16: 0,
        media_type: 0xF8,
        table_size_16: 0,
        sectors_per_track: 32,
        head_side_count: 64,
        hidden_sector_count: 0,
        total_sectors_32: total_sectors,
        ext: ExtBootSector32 {
            table_size_32: table_size,
            extended_flags: 0,
            fat_version: 0,
            root_cluster: 2,
            fat_info: 1,
            backup_bs_sector: 6,
            reserved_0: [0; 12],
            drive_number: 0,
            reserved_1: 0,
            boot_signature: 0x29,
            volume_id: 892301,
            volume_label: label_bytes(&options.label),
            fat_type_label: *b"SKINNY28",
        },
    };

    write_boot_sector(device, 0, &boot)?;
    write_boot_sector(
        device,
        boot.backup_boot_sector() as u64 * sector_size as u64,
        &boot,
    )?;
    write_fsinfo(device)?;

    // Both FAT copies: media entry, the reserved EOC, then the root
    // directory (cluster 2) and version table (cluster 3) chains. The
    // copy offsets are in sectors, so the stride is table_size *
    // sector_size bytes.
    let seed: [u32; 4] = [
        0x0FFFFF00 | boot.media_type as u32,
        0x0FFFFFFF,
        0x0FFFFFF8,
        0x0FFFFFFF,
    ];
    let mut seed_bytes = [0u8; 16];
    for (i, value) in seed.iter().enumerate() {
        seed_bytes[i * 4..(i + 1) * 4].copy_from_slice(&value.to_le_bytes());
    }
    for copy in 0..table_count as u64 {
        let offset = boot.fat1_offset() as u64 + copy * boot.fat_size_bytes() as u64;
        write_all(device, &seed_bytes, offset)?;
    }

    // A single volume-label entry in the root directory.
    let label = ShortDirEntry::new(label_bytes(&options.label), ATTR_VOLUME_ID, 0);
    write_all(device, label.as_bytes(), boot.cluster_location(2) as u64)?;

    info!(
        "formatted {} sectors, {} sectors/cluster, FAT of {} sectors at sector {}",
        total_sectors, sectors_per_cluster, table_size, reserved_sectors,
    );
    Ok(())
}

/// 90 bytes of BPB, the boot-code stub, and the 55 AA signature word at
/// byte offset 510.
fn write_boot_sector(device: &dyn BlockDevice, offset: u64, boot: &BootSector) -> Result<()> {
    let mut sector = [0u8; 512];
    sector[..90].copy_from_slice(boot.as_bytes());
    sector[90..90 + BOOT_CODE.len()].copy_from_slice(&BOOT_CODE);
    sector[510..].copy_from_slice(&BOOT_SIGNATURE);
    write_all(device, &sector, offset)
}

/// The FSInfo sector, placed so the two counters land at the fixed
/// volume offset 1000 the engines read them from.
fn write_fsinfo(device: &dyn BlockDevice) -> Result<()> {
    let mut sector = [0u8; 512];
    sector[..4].copy_from_slice(&crate::LEAD_SIGNATURE.to_le_bytes());
    sector[484..488].copy_from_slice(&crate::STRUCT_SIGNATURE.to_le_bytes());
    sector[488..496].copy_from_slice(FsInfoCounters::unknown().as_bytes());
    sector[508..].copy_from_slice(&crate::TRAIL_SIGNATURE.to_le_bytes());
    write_all(device, &sector, 512)
}

/// Formatting happens below the cache layer, so short writes are
/// checked here directly.
fn write_all(device: &dyn BlockDevice, buf: &[u8], offset: u64) -> Result<()> {
    let written = device.write_at(buf, offset).map_err(Error::Device)?;
    if written != buf.len() {
        return Err(Error::Device(DeviceError::ShortWrite(offset)));
    }
    Ok(())
}
