//! End-to-end filesystem tests over a realistic mount layout: a disk-backed
//! writable root, a read-only archive at `rom`, and an in-memory scratch
//! mount.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use polyvm_api::fs::{self, OpenFlags};
use polyvm_core::fs::{ArchiveMount, MemoryMount, WritableFileMount};
use polyvm_core::FileSystem;

fn rom_archive() -> ArchiveMount<Cursor<Vec<u8>>> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    writer.add_directory("programs/", options).unwrap();
    writer.start_file("startup", options).unwrap();
    writer.write_all(b"print('hello')\n").unwrap();
    writer.start_file("programs/list", options).unwrap();
    writer.write_all(b"-- list files\n").unwrap();
    let cursor = writer.finish().unwrap();
    ArchiveMount::new(cursor).unwrap()
}

fn test_fs(capacity: u64) -> (Arc<FileSystem>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let root = WritableFileMount::new(dir.path().join("computer"), capacity);
    let filesystem = FileSystem::new("hdd", Arc::new(root), 16);
    filesystem.mount("rom", "rom", Arc::new(rom_archive())).unwrap();
    (filesystem, dir)
}

#[test]
fn resolves_across_heterogeneous_mounts() {
    let (filesystem, _dir) = test_fs(1 << 20);

    assert!(filesystem.is_dir("").unwrap());
    assert!(filesystem.exists("rom/startup").unwrap());
    assert!(filesystem.is_read_only("rom/startup").unwrap());
    assert!(!filesystem.is_read_only("startup").unwrap());
    assert_eq!(filesystem.get_mount_label("rom/programs").unwrap(), "rom");
    assert_eq!(filesystem.get_mount_label("programs").unwrap(), "hdd");

    // The rom mount shows up in the root listing even though the disk
    // directory has no such entry.
    let listing = filesystem.list("").unwrap();
    assert!(listing.contains(&"rom".to_owned()));
}

#[test]
fn write_read_and_copy_between_mounts() {
    let (filesystem, _dir) = test_fs(1 << 20);

    {
        let mut handle = filesystem.open_for_write("notes", OpenFlags::WRITE_DEFAULTS).unwrap();
        handle.write_all(b"first line\n").unwrap();
        handle.close();
    }
    assert_eq!(filesystem.get_size("notes").unwrap(), 11);

    // Copy out of the archive onto disk, then read it back.
    filesystem.copy("rom/startup", "startup").unwrap();
    let mut contents = String::new();
    {
        let mut handle = filesystem.open_for_read("startup").unwrap();
        handle.read_to_string(&mut contents).unwrap();
    }
    assert_eq!(contents, "print('hello')\n");

    // Copying a whole directory out of the archive works too.
    filesystem.copy("rom/programs", "programs").unwrap();
    assert!(filesystem.is_dir("programs").unwrap());
    assert!(filesystem.exists("programs/list").unwrap());

    // Writing into the archive is rejected with the path, not host text.
    let err = filesystem.open_for_write("rom/evil", OpenFlags::WRITE_DEFAULTS).unwrap_err();
    assert_eq!(err.to_string(), format!("/rom/evil: {}", fs::ACCESS_DENIED));
}

#[test]
fn move_between_mounts_falls_back_to_copy_and_delete() {
    let (filesystem, _dir) = test_fs(1 << 20);
    let scratch = Arc::new(MemoryMount::new());
    filesystem.mount_writable("scratch", "tmp", scratch).unwrap();

    {
        let mut handle = filesystem.open_for_write("tmp/draft", OpenFlags::WRITE_DEFAULTS).unwrap();
        handle.write_all(b"work in progress").unwrap();
        handle.close();
    }

    filesystem.move_("tmp/draft", "draft").unwrap();
    assert!(!filesystem.exists("tmp/draft").unwrap());
    assert_eq!(filesystem.get_size("draft").unwrap(), 16);
}

#[test]
fn quota_is_enforced_at_the_crossing_operation() {
    // Room for the root directory plus a couple of minimum-size files.
    let (filesystem, _dir) = test_fs(1_200);

    {
        let mut handle = filesystem.open_for_write("a", OpenFlags::WRITE_DEFAULTS).unwrap();
        handle.write_all(&[0; 100]).unwrap();
        handle.close();
    }
    {
        let mut handle = filesystem.open_for_write("b", OpenFlags::WRITE_DEFAULTS).unwrap();
        handle.write_all(&[0; 100]).unwrap();
        handle.close();
    }

    // Both files charge the 500-byte floor, so a third won't fit.
    let free = filesystem.get_free_space("").unwrap();
    assert!(free < 500, "expected under a file's floor free, got {free}");
    assert!(filesystem.open_for_write("c", OpenFlags::WRITE_DEFAULTS).is_err());

    // Deleting one frees its full charge again.
    filesystem.delete("a").unwrap();
    assert!(filesystem.open_for_write("c", OpenFlags::WRITE_DEFAULTS).is_ok());
}

#[test]
fn append_and_seek_round_trip() {
    let (filesystem, _dir) = test_fs(1 << 20);

    {
        let mut handle = filesystem.open_for_write("log", OpenFlags::WRITE_DEFAULTS).unwrap();
        handle.write_all(b"one\n").unwrap();
        handle.close();
    }
    {
        let mut handle = filesystem.open_for_write("log", OpenFlags::APPEND_DEFAULTS).unwrap();
        handle.write_all(b"two\n").unwrap();
        handle.close();
    }

    let mut handle = filesystem.open_for_read("log").unwrap();
    handle.seek(SeekFrom::Start(4)).unwrap();
    let mut tail = String::new();
    handle.read_to_string(&mut tail).unwrap();
    assert_eq!(tail, "two\n");
}

#[test]
fn unmount_force_closes_open_handles() {
    let (filesystem, _dir) = test_fs(1 << 20);
    let scratch = Arc::new(MemoryMount::new());
    scratch.add_file("data", b"payload".to_vec()).unwrap();
    filesystem.mount_writable("scratch", "tmp", scratch).unwrap();

    let mut handle = filesystem.open_for_read("tmp/data").unwrap();
    assert_eq!(filesystem.open_count(), 1);

    filesystem.unmount("tmp");
    assert_eq!(filesystem.open_count(), 0);
    assert!(!handle.is_open());
    let mut buffer = Vec::new();
    assert!(handle.read_to_end(&mut buffer).is_err());

    // The mount itself is gone from resolution.
    assert!(filesystem.exists("tmp/data").is_err() || !filesystem.exists("tmp/data").unwrap());
}

#[test]
fn open_handle_cap_is_per_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let root = WritableFileMount::new(dir.path().join("computer"), 1 << 20);
    let filesystem = FileSystem::new("hdd", Arc::new(root), 2);

    let _a = filesystem.open_for_write("a", OpenFlags::WRITE_DEFAULTS).unwrap();
    let _b = filesystem.open_for_write("b", OpenFlags::WRITE_DEFAULTS).unwrap();
    let err = filesystem.open_for_write("c", OpenFlags::WRITE_DEFAULTS).unwrap_err();
    assert_eq!(err.message(), fs::TOO_MANY_FILES);

    drop(_a);
    assert!(filesystem.open_for_write("c", OpenFlags::WRITE_DEFAULTS).is_ok());
}

#[test]
fn archive_reads_are_stable_across_cache_eviction() {
    let (filesystem, _dir) = test_fs(1 << 20);

    let read = |filesystem: &Arc<FileSystem>| {
        let mut handle = filesystem.open_for_read("rom/startup").unwrap();
        let mut contents = Vec::new();
        handle.read_to_end(&mut contents).unwrap();
        contents
    };

    let first = read(&filesystem);
    let second = read(&filesystem);
    assert_eq!(first, second);
    assert_eq!(first, b"print('hello')\n");
}
