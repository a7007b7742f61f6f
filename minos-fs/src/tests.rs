extern crate std;

use std::sync::Arc;

use crate::dev::std_impl::FileDisk;
use crate::dev::{BlockDevice, BlockRole, DeviceRegistry, MemDisk};
use crate::structs::*;
use crate::{Filesys, FsError};

const DISK_SECTORS: u32 = 4096;

fn fresh_registry() -> (DeviceRegistry, Arc<MemDisk>) {
    let devices = DeviceRegistry::new();
    let disk = Arc::new(MemDisk::new(DISK_SECTORS));
    devices.register(BlockRole::Filesys, disk.clone());
    (devices, disk)
}

fn fresh_fs() -> (Arc<Filesys>, DeviceRegistry, Arc<MemDisk>) {
    let (devices, disk) = fresh_registry();
    let fs = Filesys::format(&devices).expect("format failed");
    (fs, devices, disk)
}

#[test]
fn format_on_tempfile() {
    let devices = DeviceRegistry::new();
    let file = tempfile::tempfile().expect("failed to create file");
    let disk = FileDisk::new(file, DISK_SECTORS).expect("failed to size file");
    devices.register(BlockRole::Filesys, Arc::new(disk));
    let fs = Filesys::format(&devices).expect("format failed");
    fs.create(None, "/hello", 0).expect("create failed");
    assert_eq!(fs.open(None, "/hello").unwrap().len(), 0);
}

#[test]
fn mount_rejects_blank_device() {
    let (devices, _disk) = fresh_registry();
    assert_eq!(Filesys::mount(&devices).err(), Some(FsError::WrongFs));
}

#[test]
fn create_then_reopen_after_remount() {
    let (devices, _disk) = fresh_registry();
    let payload = b"persistent bytes";
    {
        let fs = Filesys::format(&devices).expect("format failed");
        fs.create(None, "/keep", 0).unwrap();
        let mut f = fs.open(None, "/keep").unwrap();
        assert_eq!(f.write(payload).unwrap(), payload.len());
        fs.sync().unwrap();
    }
    let fs = Filesys::mount(&devices).expect("mount failed");
    let mut f = fs.open(None, "/keep").unwrap();
    assert_eq!(f.len(), payload.len());
    let mut back = [0u8; 16];
    assert_eq!(f.read(&mut back).unwrap(), payload.len());
    assert_eq!(&back[..], payload);
}

#[test]
fn nested_create_filesize_inumber() {
    let (fs, _d, _m) = fresh_fs();
    fs.mkdir(None, "/a").unwrap();
    fs.mkdir(None, "/a/b").unwrap();
    fs.create(None, "/a/b/c", 0).unwrap();
    let f = fs.open(None, "/a/b/c").unwrap();
    assert_eq!(f.len(), 0);
    assert!(!f.is_dir());
    let sector = f.inumber();
    assert!(fs.sector_allocated(sector));
    let again = fs.open(None, "/a/b/c").unwrap();
    assert_eq!(again.inumber(), sector);
}

#[test]
fn large_file_spans_both_indirect_tiers() {
    let (fs, _d, _m) = fresh_fs();
    const LEN: usize = 200_000;
    fs.create(None, "/file", 0).unwrap();
    let pattern: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    {
        let mut f = fs.open(None, "/file").unwrap();
        assert_eq!(f.write(&pattern).unwrap(), LEN);
    }
    // 200000 bytes cover 391 sectors: direct (123), single-indirect
    // (128), and into the double-indirect tier.
    assert!(bytes_to_sectors(LEN) > MAX_SECTORS_INDIRECT);
    let mut f = fs.open(None, "/file").unwrap();
    assert_eq!(f.len(), LEN);
    let mut back = vec![0u8; LEN];
    assert_eq!(f.read(&mut back).unwrap(), LEN);
    assert_eq!(back, pattern);
}

#[test]
fn remove_refuses_nonempty_directory() {
    let (fs, _d, _m) = fresh_fs();
    fs.mkdir(None, "/d").unwrap();
    fs.create(None, "/d/f", 0).unwrap();
    assert_eq!(fs.remove(None, "/d").err(), Some(FsError::DirNotEmpty));
    fs.remove(None, "/d/f").unwrap();
    fs.remove(None, "/d").unwrap();
    assert!(fs.open(None, "/d").is_err());
}

#[test]
fn write_past_eof_leaves_zero_holes() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/h", 0).unwrap();
    let f = fs.open(None, "/h").unwrap();
    assert_eq!(f.write_at(1000, b"tail!").unwrap(), 5);
    assert_eq!(f.len(), 1005);
    let mut back = vec![0xffu8; 1005];
    assert_eq!(f.read_at(0, &mut back).unwrap(), 1005);
    assert!(back[..1000].iter().all(|&b| b == 0));
    assert_eq!(&back[1000..], b"tail!");
}

#[test]
fn extension_across_tier_boundary() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/grow", 0).unwrap();
    let f = fs.open(None, "/grow").unwrap();
    // Fill the direct tier exactly, then one more sector.
    let direct_bytes = MAX_SECTORS_DIRECT * SECTOR_SIZE;
    let chunk = vec![7u8; direct_bytes];
    assert_eq!(f.write_at(0, &chunk).unwrap(), direct_bytes);
    assert_eq!(f.write_at(direct_bytes, &[9u8; 600]).unwrap(), 600);
    let mut back = vec![0u8; 600];
    assert_eq!(f.read_at(direct_bytes, &mut back).unwrap(), 600);
    assert!(back.iter().all(|&b| b == 9));
}

#[test]
fn removed_sector_is_reusable() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/x", 0).unwrap();
    let sector = fs.open(None, "/x").unwrap().inumber();
    fs.remove(None, "/x").unwrap();
    assert!(!fs.sector_allocated(sector));
    fs.create(None, "/x", 0).unwrap();
    assert_eq!(fs.open(None, "/x").unwrap().inumber(), sector);
}

#[test]
fn removing_large_file_frees_all_sectors() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/big", 0).unwrap();
    let data_sector;
    {
        let f = fs.open(None, "/big").unwrap();
        let buf = vec![3u8; 300 * SECTOR_SIZE];
        assert_eq!(f.write_at(0, &buf).unwrap(), buf.len());
        data_sector = f.inumber();
    }
    fs.remove(None, "/big").unwrap();
    assert!(!fs.sector_allocated(data_sector));
    // Everything the file owned must be allocatable again.
    fs.create(None, "/big2", 300 * SECTOR_SIZE).unwrap();
}

#[test]
fn dirty_buffers_reach_device_after_sync() {
    let (fs, _d, disk) = fresh_fs();
    fs.create(None, "/raw", 0).unwrap();
    let pattern: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i % 13) as u8 + 1).collect();
    let inode_sector;
    {
        let f = fs.open(None, "/raw").unwrap();
        assert_eq!(f.write_at(0, &pattern).unwrap(), SECTOR_SIZE);
        inode_sector = f.inumber();
    }
    fs.sync().unwrap();
    // Read the inode image and its first data sector from the raw
    // device, bypassing the cache.
    let mut image = DiskInode::zeroed();
    disk.read_at(inode_sector, image.as_buf_mut()).unwrap();
    assert_eq!(image.magic, INODE_MAGIC);
    assert_eq!(image.len_bytes(), SECTOR_SIZE);
    let mut raw = [0u8; SECTOR_SIZE];
    disk.read_at(image.direct[0], &mut raw).unwrap();
    assert_eq!(&raw[..], &pattern[..]);
}

#[test]
fn walker_rejects_file_in_the_middle() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/plain", 0).unwrap();
    assert_eq!(
        fs.open(None, "/plain/sub").err(),
        Some(FsError::NotDir)
    );
    assert_eq!(
        fs.create(None, "/plain/sub", 0).err(),
        Some(FsError::NotDir)
    );
}

#[test]
fn mkdir_edge_cases() {
    let (fs, _d, _m) = fresh_fs();
    fs.mkdir(None, "/a").unwrap();
    assert_eq!(fs.mkdir(None, "/a").err(), Some(FsError::EntryExist));
    assert!(fs.mkdir(None, "/missing/y").is_err());
    assert_eq!(fs.mkdir(None, ".").err(), Some(FsError::InvalidPath));
    assert_eq!(fs.mkdir(None, "..").err(), Some(FsError::InvalidPath));
}

#[test]
fn create_edge_cases() {
    let (fs, _d, _m) = fresh_fs();
    assert_eq!(fs.create(None, ".", 0).err(), Some(FsError::InvalidPath));
    assert_eq!(fs.create(None, "..", 0).err(), Some(FsError::InvalidPath));
    fs.create(None, "/dup", 0).unwrap();
    assert_eq!(fs.create(None, "/dup", 0).err(), Some(FsError::EntryExist));
    // NAME_MAX is 14 bytes per component.
    assert_eq!(
        fs.create(None, "/fifteen-chars!", 0).err(),
        Some(FsError::InvalidPath)
    );
    fs.create(None, "/fourteen-chars", 0).unwrap();
    assert_eq!(fs.remove(None, "/").err(), Some(FsError::InvalidPath));
}

#[test]
fn chdir_and_relative_paths() {
    let (fs, _d, _m) = fresh_fs();
    fs.mkdir(None, "/a").unwrap();
    let mut cwd = None;
    fs.chdir(&mut cwd, "a").unwrap();
    fs.create(cwd.as_ref(), "f", 0).unwrap();
    assert!(fs.open(None, "/a/f").is_ok());
    // "." resolves to the current directory, ".." to its parent.
    let here = fs.open(cwd.as_ref(), ".").unwrap();
    let a = fs.open(None, "/a").unwrap();
    assert_eq!(here.inumber(), a.inumber());
    let up = fs.open(cwd.as_ref(), "..").unwrap();
    let root = fs.open(None, "/").unwrap();
    assert_eq!(up.inumber(), root.inumber());
    // Root is its own parent.
    let above_root = fs.open(None, "..").unwrap();
    assert_eq!(above_root.inumber(), root.inumber());
}

#[test]
fn readdir_lists_live_entries() {
    let (fs, _d, _m) = fresh_fs();
    fs.mkdir(None, "/dir").unwrap();
    fs.create(None, "/dir/one", 0).unwrap();
    fs.create(None, "/dir/two", 0).unwrap();
    fs.create(None, "/dir/three", 0).unwrap();
    fs.remove(None, "/dir/two").unwrap();
    let mut handle = fs.open(None, "/dir").unwrap();
    assert!(handle.is_dir());
    let mut names = Vec::new();
    while let Some(name) = handle.readdir().unwrap() {
        names.push(name);
    }
    assert_eq!(names, ["one", "three"]);
}

#[test]
fn slot_reuse_keeps_directory_dense() {
    let (fs, _d, _m) = fresh_fs();
    fs.mkdir(None, "/dir").unwrap();
    fs.create(None, "/dir/one", 0).unwrap();
    fs.create(None, "/dir/two", 0).unwrap();
    fs.remove(None, "/dir/one").unwrap();
    // The freed slot is reused before the directory grows.
    let len_before = fs.open(None, "/dir").unwrap().len();
    fs.create(None, "/dir/three", 0).unwrap();
    assert_eq!(fs.open(None, "/dir").unwrap().len(), len_before);
}

#[test]
fn deny_write_blocks_other_handles() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/exe", 0).unwrap();
    let mut guard = fs.open(None, "/exe").unwrap();
    guard.deny_write();
    let other = fs.open(None, "/exe").unwrap();
    assert_eq!(other.write_at(0, b"nope").unwrap(), 0);
    drop(guard);
    assert_eq!(other.write_at(0, b"yes!").unwrap(), 4);
}

#[test]
fn open_after_remove_fails_but_holders_continue() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/gone", 0).unwrap();
    let held = fs.open(None, "/gone").unwrap();
    let sector = held.inumber();
    fs.remove(None, "/gone").unwrap();
    assert!(fs.open(None, "/gone").is_err());
    // The last holder can still use the file; sectors are freed only
    // when it lets go.
    assert_eq!(held.write_at(0, b"late write").unwrap(), 10);
    assert!(fs.sector_allocated(sector));
    drop(held);
    assert!(!fs.sector_allocated(sector));
}

#[test]
fn open_same_sector_yields_same_inode() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/shared", 0).unwrap();
    let a = fs.open(None, "/shared").unwrap();
    let b = fs.open(None, "/shared").unwrap();
    assert!(Arc::ptr_eq(a.inode(), b.inode()));
}

#[test]
fn parent_pointers_follow_mkdir() {
    let (fs, _d, _m) = fresh_fs();
    fs.mkdir(None, "/outer").unwrap();
    fs.mkdir(None, "/outer/inner").unwrap();
    let outer = fs.open(None, "/outer").unwrap();
    let inner = fs.open(None, "/outer/inner").unwrap();
    assert_eq!(inner.inode().parent(), outer.inumber());
    assert_eq!(outer.inode().parent(), ROOT_DIR_SECTOR);
    let root = fs.open(None, "/").unwrap();
    assert_eq!(root.inode().parent(), ROOT_DIR_SECTOR);
}

#[test]
fn create_with_initial_size_reads_zero() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/sz", 5000).unwrap();
    let f = fs.open(None, "/sz").unwrap();
    assert_eq!(f.len(), 5000);
    let mut back = vec![0xffu8; 5000];
    assert_eq!(f.read_at(0, &mut back).unwrap(), 5000);
    assert!(back.iter().all(|&b| b == 0));
}

#[test]
fn seek_and_tell_move_the_handle() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/pos", 0).unwrap();
    let mut f = fs.open(None, "/pos").unwrap();
    assert_eq!(f.tell(), 0);
    f.write(b"abcdef").unwrap();
    assert_eq!(f.tell(), 6);
    f.seek(2);
    let mut two = [0u8; 2];
    assert_eq!(f.read(&mut two).unwrap(), 2);
    assert_eq!(&two, b"cd");
    assert_eq!(f.tell(), 4);
    // Reading past the end is a short read, not an error.
    f.seek(100);
    assert_eq!(f.read(&mut two).unwrap(), 0);
}

#[test]
fn readdir_on_regular_file_is_refused() {
    let (fs, _d, _m) = fresh_fs();
    fs.create(None, "/f", 0).unwrap();
    let mut f = fs.open(None, "/f").unwrap();
    assert_eq!(f.readdir().err(), Some(FsError::NotDir));
}

#[test]
fn allocations_do_not_collide_after_remount() {
    let (devices, _disk) = fresh_registry();
    let first_sector;
    {
        let fs = Filesys::format(&devices).unwrap();
        fs.create(None, "/old", 0).unwrap();
        let f = fs.open(None, "/old").unwrap();
        f.write_at(0, b"old data").unwrap();
        first_sector = f.inumber();
    }
    let fs = Filesys::mount(&devices).unwrap();
    fs.create(None, "/new", 0).unwrap();
    let new = fs.open(None, "/new").unwrap();
    assert_ne!(new.inumber(), first_sector);
    let old = fs.open(None, "/old").unwrap();
    let mut back = [0u8; 8];
    assert_eq!(old.read_at(0, &mut back).unwrap(), 8);
    assert_eq!(&back, b"old data");
}
