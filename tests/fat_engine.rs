//! End-to-end flows over an in-memory image: format, mount through the
//! VFS, and drive the plain FAT engine the way the shell would.

use std::sync::Arc;

use skinnyfat::bpb::BootSector;
use skinnyfat::device::{BlockDevice, MemDevice};
use skinnyfat::mkfs::{format, FormatOptions};
use skinnyfat::vfs::FileKind;
use skinnyfat::{FsKind, OpenMode, Vfs};

const IMAGE_SIZE: usize = 16 * 1024 * 1024;

fn fresh() -> (Vfs, Arc<MemDevice>) {
    let dev = Arc::new(MemDevice::new(IMAGE_SIZE));
    format(
        dev.as_ref(),
        &FormatOptions {
            label: Some("TESTVOL".into()),
            ..Default::default()
        },
    )
    .unwrap();
    let mut vfs = Vfs::new();
    vfs.mount_device(FsKind::Fat, Arc::clone(&dev) as Arc<dyn BlockDevice>, "/")
        .unwrap();
    (vfs, dev)
}

fn write_file(vfs: &mut Vfs, path: &str, data: &[u8], mode: OpenMode) -> usize {
    let fd = vfs.open(path, mode).unwrap();
    let n = vfs.write(fd, data).unwrap();
    vfs.close(fd).unwrap();
    n
}

fn read_file(vfs: &mut Vfs, path: &str) -> Vec<u8> {
    let fd = vfs.open(path, OpenMode::Begin).unwrap();
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = vfs.read(fd, &mut buf).unwrap();
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    vfs.close(fd).unwrap();
    out
}

fn list(vfs: &mut Vfs, path: &str) -> Vec<String> {
    let dd = vfs.open_dir(path).unwrap();
    let mut names = Vec::new();
    while let Some(entry) = vfs.read_dir(dd).unwrap() {
        names.push(entry.name);
    }
    vfs.close_dir(dd).unwrap();
    names
}

#[test]
fn touch_echo_cat() {
    let (mut vfs, _dev) = fresh();
    vfs.create("/a.txt", FileKind::File).unwrap();
    assert_eq!(write_file(&mut vfs, "/a.txt", b"hello", OpenMode::Begin), 5);
    assert_eq!(read_file(&mut vfs, "/a.txt"), b"hello");
}

#[test]
fn append_concatenates() {
    let (mut vfs, _dev) = fresh();
    vfs.create("/a.txt", FileKind::File).unwrap();
    write_file(&mut vfs, "/a.txt", b"first", OpenMode::Begin);
    write_file(&mut vfs, "/a.txt", b"second", OpenMode::Append);
    assert_eq!(read_file(&mut vfs, "/a.txt"), b"firstsecond");
}

#[test]
fn mkdir_cd_touch_ls() {
    let (mut vfs, _dev) = fresh();
    vfs.create("/d", FileKind::Dir).unwrap();
    vfs.change_dir("/d").unwrap();
    vfs.create("inner", FileKind::File).unwrap();
    vfs.change_dir("/").unwrap();
    assert_eq!(list(&mut vfs, "/d"), vec![".", "..", "inner"]);
}

#[test]
fn dot_dot_walks_back_up() {
    let (mut vfs, _dev) = fresh();
    vfs.create("/d", FileKind::Dir).unwrap();
    vfs.create("/top.txt", FileKind::File).unwrap();
    write_file(&mut vfs, "/top.txt", b"up here", OpenMode::Begin);

    vfs.change_dir("/d").unwrap();
    vfs.change_dir("..").unwrap();
    assert_eq!(read_file(&mut vfs, "top.txt"), b"up here");
}

#[test]
fn readdir_insertion_order_and_sizes() {
    let (mut vfs, _dev) = fresh();
    let files: &[(&str, usize)] = &[("one.txt", 11), ("two.txt", 200), ("three.txt", 1024)];
    for (name, size) in files {
        let path = format!("/{name}");
        vfs.create(&path, FileKind::File).unwrap();
        write_file(&mut vfs, &path, &vec![b'x'; *size], OpenMode::Begin);
    }

    let dd = vfs.open_dir("/").unwrap();
    let mut seen = Vec::new();
    while let Some(entry) = vfs.read_dir(dd).unwrap() {
        seen.push((entry.name.clone(), entry.size as usize));
    }
    vfs.close_dir(dd).unwrap();

    assert_eq!(
        seen,
        files
            .iter()
            .map(|(n, s)| (n.to_string(), *s))
            .collect::<Vec<_>>()
    );
}

#[test]
fn multi_cluster_round_trip() {
    let (mut vfs, dev) = fresh();
    let boot = BootSector::from_bytes(&dev.snapshot(0, 90));
    let cluster = boot.cluster_size();

    // Every interesting length: empty, sub-cluster, exact multiples,
    // and 10 clusters worth.
    for (i, len) in [0usize, 1, cluster - 1, cluster, cluster + 1, 10 * cluster]
        .iter()
        .enumerate()
    {
        let path = format!("/file{i}.bin");
        let data: Vec<u8> = (0..*len).map(|j| (j * 31 + i) as u8).collect();
        vfs.create(&path, FileKind::File).unwrap();
        assert_eq!(write_file(&mut vfs, &path, &data, OpenMode::Begin), *len);
        assert_eq!(read_file(&mut vfs, &path), data);
    }
}

#[test]
fn delete_then_recreate_reads_empty() {
    let (mut vfs, _dev) = fresh();
    vfs.create("/gone.txt", FileKind::File).unwrap();
    write_file(&mut vfs, "/gone.txt", b"soon to vanish", OpenMode::Begin);

    vfs.remove("/gone.txt").unwrap();
    assert!(vfs.open("/gone.txt", OpenMode::Begin).is_err());

    vfs.create("/gone.txt", FileKind::File).unwrap();
    assert_eq!(read_file(&mut vfs, "/gone.txt"), b"");
}

#[test]
fn fat_copies_stay_identical() {
    let (mut vfs, dev) = fresh();
    vfs.create("/d", FileKind::Dir).unwrap();
    vfs.create("/a.txt", FileKind::File).unwrap();
    write_file(&mut vfs, "/a.txt", &vec![7u8; 9000], OpenMode::Begin);
    vfs.create("/d/b.txt", FileKind::File).unwrap();
    write_file(&mut vfs, "/d/b.txt", b"nested", OpenMode::Begin);
    vfs.remove("/a.txt").unwrap();

    let boot = BootSector::from_bytes(&dev.snapshot(0, 90));
    let fat1 = dev.snapshot(boot.fat1_offset(), boot.fat_size_bytes());
    let fat2 = dev.snapshot(
        boot.fat1_offset() + boot.fat_size_bytes(),
        boot.fat_size_bytes(),
    );
    assert_eq!(fat1, fat2);
}

#[test]
fn chains_terminate_and_cover_the_size() {
    let (mut vfs, dev) = fresh();
    vfs.create("/big.bin", FileKind::File).unwrap();
    write_file(&mut vfs, "/big.bin", &vec![3u8; 10_000], OpenMode::Begin);

    let boot = BootSector::from_bytes(&dev.snapshot(0, 90));
    let fat = dev.snapshot(boot.fat1_offset(), boot.fat_size_bytes());
    let entry_of = |c: u32| {
        u32::from_le_bytes([
            fat[c as usize * 4],
            fat[c as usize * 4 + 1],
            fat[c as usize * 4 + 2],
            fat[c as usize * 4 + 3],
        ]) & 0x0FFF_FFFF
    };

    let dd = vfs.open_dir("/").unwrap();
    let info = vfs.read_dir(dd).unwrap().unwrap();
    vfs.close_dir(dd).unwrap();
    assert_eq!(info.name, "big.bin");

    let mut cluster = info.location;
    let mut chain_len = 0usize;
    for _ in 0..boot.data_cluster_count() {
        chain_len += 1;
        let next = entry_of(cluster);
        if next >= 0x0FFF_FFF8 {
            cluster = 0;
            break;
        }
        cluster = next;
    }
    assert_eq!(cluster, 0, "chain must end in EOC without cycling");
    assert!(info.size as usize <= chain_len * boot.cluster_size());
    assert_eq!(chain_len, 10_000usize.div_ceil(boot.cluster_size()));
}

#[test]
fn long_names_survive_listing_and_lookup() {
    let (mut vfs, _dev) = fresh();
    let name = "long_name_with_seventeen_characters.txt";
    vfs.create(&format!("/{name}"), FileKind::File).unwrap();
    write_file(&mut vfs, &format!("/{name}"), b"x", OpenMode::Begin);

    assert_eq!(list(&mut vfs, "/"), vec![name.to_string()]);
    assert_eq!(read_file(&mut vfs, &format!("/{name}")), b"x");
    // FAT name matching is case-insensitive.
    assert_eq!(
        read_file(&mut vfs, "/LONG_NAME_WITH_SEVENTEEN_CHARACTERS.TXT"),
        b"x"
    );
}

#[test]
fn out_of_space_surfaces_a_short_write() {
    let (mut vfs, dev) = fresh();
    let boot = BootSector::from_bytes(&dev.snapshot(0, 90));

    vfs.create("/fill.bin", FileKind::File).unwrap();
    let too_big = vec![1u8; IMAGE_SIZE + IMAGE_SIZE / 4];
    let fd = vfs.open("/fill.bin", OpenMode::Begin).unwrap();
    let written = vfs.write(fd, &too_big).unwrap();
    vfs.close(fd).unwrap();

    assert!(written > 0);
    assert!(written < too_big.len());
    assert_eq!(written % boot.cluster_size(), 0);
    // What did fit reads back.
    let back = read_file(&mut vfs, "/fill.bin");
    assert_eq!(back.len(), written);
}

#[test]
fn errors_say_what_happened() {
    let (mut vfs, _dev) = fresh();
    vfs.create("/a.txt", FileKind::File).unwrap();
    vfs.create("/d", FileKind::Dir).unwrap();

    assert!(matches!(
        vfs.create("/a.txt", FileKind::File),
        Err(skinnyfat::Error::AlreadyExists(_))
    ));
    assert!(matches!(
        vfs.open("/missing.txt", OpenMode::Begin),
        Err(skinnyfat::Error::NoSuchPath(_))
    ));
    assert!(matches!(
        vfs.open("/d", OpenMode::Begin),
        Err(skinnyfat::Error::IsADirectory(_))
    ));
    assert!(matches!(
        vfs.change_dir("/a.txt"),
        Err(skinnyfat::Error::NotADirectory(_))
    ));
    assert!(matches!(
        vfs.remove("/missing.txt"),
        Err(skinnyfat::Error::NoSuchPath(_))
    ));
}

#[test]
fn revision_ops_are_unsupported_on_plain_fat() {
    let (mut vfs, _dev) = fresh();
    vfs.create("/a.txt", FileKind::File).unwrap();
    let fd = vfs.open("/a.txt", OpenMode::Begin).unwrap();
    assert!(matches!(
        vfs.get_revision(fd, 0),
        Err(skinnyfat::Error::Unsupported)
    ));
    assert!(matches!(
        vfs.revert(fd, 1),
        Err(skinnyfat::Error::Unsupported)
    ));
}

#[test]
fn unmount_then_remount_preserves_contents() {
    let dev = Arc::new(MemDevice::new(IMAGE_SIZE));
    format(dev.as_ref(), &FormatOptions::default()).unwrap();

    let mut vfs = Vfs::new();
    vfs.mount_device(FsKind::Fat, Arc::clone(&dev) as Arc<dyn BlockDevice>, "/")
        .unwrap();
    vfs.create("/keep.txt", FileKind::File).unwrap();
    write_file(&mut vfs, "/keep.txt", b"durable", OpenMode::Begin);
    vfs.unmount("/").unwrap();

    let mut vfs = Vfs::new();
    vfs.mount_device(FsKind::Fat, Arc::clone(&dev) as Arc<dyn BlockDevice>, "/")
        .unwrap();
    assert_eq!(read_file(&mut vfs, "/keep.txt"), b"durable");
}

#[test]
fn stale_fsinfo_is_recomputed_on_mount() {
    let dev = Arc::new(MemDevice::new(IMAGE_SIZE));
    format(dev.as_ref(), &FormatOptions::default()).unwrap();

    // The formatter writes "unknown" counters on purpose.
    let raw = dev.snapshot(1000, 8);
    assert_eq!(raw, vec![0xFF; 8]);

    let mut vfs = Vfs::new();
    vfs.mount_device(FsKind::Fat, Arc::clone(&dev) as Arc<dyn BlockDevice>, "/")
        .unwrap();
    vfs.unmount("/").unwrap();

    // After a mount the counters reflect the FAT scan: everything free
    // except the root directory and version-table clusters.
    let boot = BootSector::from_bytes(&dev.snapshot(0, 90));
    let raw = dev.snapshot(1000, 8);
    let free = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
    let last = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    assert_eq!(free as usize, boot.data_cluster_count() - 2);
    assert_eq!(last, 3);
}
