//! Mounts backed by real directories on the host disk.
//!
//! [`FileMount`] exposes a directory read-only. [`WritableFileMount`] adds
//! writes under a capacity quota: every file and directory is charged at
//! least [`MINIMUM_FILE_SIZE`] bytes, so a thousand one-byte files cannot
//! dodge the limit.

use std::fs as host_fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use polyvm_api::fs::{
    self, remap_io_error, FileAttributes, FileOperationError, Mount, OpenFlags, SeekableChannel,
    WritableMount, MINIMUM_FILE_SIZE,
};
use walkdir::WalkDir;

use super::path;

/// A read-only mount over a host directory.
pub struct FileMount {
    root: PathBuf,
}

impl FileMount {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileMount { root: root.into() }
    }

    /// Resolve a virtual path against the root. Paths are sanitized by the
    /// filesystem layer, but a standalone user could still pass `..`, so it
    /// is rejected here too.
    fn resolve(&self, virtual_path: &str) -> Result<PathBuf, FileOperationError> {
        let mut resolved = self.root.clone();
        for segment in virtual_path.split('/') {
            if segment.is_empty() {
                continue;
            }
            if segment == ".." {
                return Err(FileOperationError::new(virtual_path, fs::ACCESS_DENIED));
            }
            resolved.push(segment);
        }
        Ok(resolved)
    }
}

impl Mount for FileMount {
    fn exists(&self, virtual_path: &str) -> Result<bool, FileOperationError> {
        Ok(self.resolve(virtual_path)?.exists())
    }

    fn is_directory(&self, virtual_path: &str) -> Result<bool, FileOperationError> {
        Ok(self.resolve(virtual_path)?.is_dir())
    }

    fn list(
        &self,
        virtual_path: &str,
        contents: &mut Vec<String>,
    ) -> Result<(), FileOperationError> {
        let resolved = self.resolve(virtual_path)?;
        if !resolved.is_dir() {
            return Err(FileOperationError::new(virtual_path, fs::NOT_A_DIRECTORY));
        }
        let entries =
            host_fs::read_dir(&resolved).map_err(|e| remap_io_error(virtual_path, &e))?;
        for entry in entries {
            let entry = entry.map_err(|e| remap_io_error(virtual_path, &e))?;
            contents.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(())
    }

    fn size(&self, virtual_path: &str) -> Result<u64, FileOperationError> {
        let metadata = host_fs::metadata(self.resolve(virtual_path)?)
            .map_err(|e| remap_io_error(virtual_path, &e))?;
        Ok(if metadata.is_dir() { 0 } else { metadata.len() })
    }

    fn attributes(&self, virtual_path: &str) -> Result<FileAttributes, FileOperationError> {
        let metadata = host_fs::metadata(self.resolve(virtual_path)?)
            .map_err(|e| remap_io_error(virtual_path, &e))?;
        Ok(FileAttributes::with_times(
            metadata.is_dir(),
            if metadata.is_dir() { 0 } else { metadata.len() },
            metadata.created().ok(),
            metadata.modified().ok(),
        ))
    }

    fn open_for_read(
        &self,
        virtual_path: &str,
    ) -> Result<Box<dyn SeekableChannel>, FileOperationError> {
        let resolved = self.resolve(virtual_path)?;
        if resolved.is_dir() {
            return Err(FileOperationError::new(virtual_path, fs::NOT_A_FILE));
        }
        let file =
            host_fs::File::open(&resolved).map_err(|e| remap_io_error(virtual_path, &e))?;
        Ok(Box::new(ReadOnlyFile { file }))
    }
}

/// A writable mount over a host directory, with quota tracking.
pub struct WritableFileMount {
    inner: FileMount,
    tracker: Arc<SpaceTracker>,
}

struct SpaceTracker {
    /// Includes one [`MINIMUM_FILE_SIZE`] charge for the root directory.
    capacity: u64,
    used: Mutex<u64>,
}

impl SpaceTracker {
    fn try_charge(&self, bytes: u64) -> bool {
        let mut used = lock_used(&self.used);
        if self.capacity.saturating_sub(*used) < bytes {
            false
        } else {
            *used += bytes;
            true
        }
    }

    fn refund(&self, bytes: u64) {
        let mut used = lock_used(&self.used);
        *used = used.saturating_sub(bytes);
    }

    fn used(&self) -> u64 {
        *lock_used(&self.used)
    }
}

impl WritableFileMount {
    /// Create a mount with the given usable capacity in bytes. The root
    /// directory is created lazily on first write.
    pub fn new(root: impl Into<PathBuf>, capacity: u64) -> Self {
        let root = root.into();
        let used = measure_used_space(&root);
        WritableFileMount {
            inner: FileMount::new(root),
            tracker: Arc::new(SpaceTracker {
                capacity: capacity + MINIMUM_FILE_SIZE,
                used: Mutex::new(used),
            }),
        }
    }

    fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Create missing ancestor directories of `resolved`, charging the quota
    /// for each.
    fn create_parents(
        &self,
        virtual_path: &str,
        resolved: &Path,
    ) -> Result<(), FileOperationError> {
        let Some(parent) = resolved.parent() else { return Ok(()) };
        if parent.exists() {
            return Ok(());
        }
        // The root directory's charge is part of the capacity offset, so only
        // levels below it count.
        let mut missing = 0u64;
        let mut probe = parent.to_path_buf();
        while !probe.exists() && probe != *self.root() {
            missing += 1;
            if !probe.pop() {
                break;
            }
        }
        if !self.tracker.try_charge(missing * MINIMUM_FILE_SIZE) {
            return Err(FileOperationError::new(virtual_path, fs::OUT_OF_SPACE));
        }
        host_fs::create_dir_all(parent).map_err(|e| {
            self.tracker.refund(missing * MINIMUM_FILE_SIZE);
            remap_io_error(virtual_path, &e)
        })
    }
}

impl Mount for WritableFileMount {
    fn exists(&self, virtual_path: &str) -> Result<bool, FileOperationError> {
        self.inner.exists(virtual_path)
    }

    fn is_directory(&self, virtual_path: &str) -> Result<bool, FileOperationError> {
        self.inner.is_directory(virtual_path)
    }

    fn list(
        &self,
        virtual_path: &str,
        contents: &mut Vec<String>,
    ) -> Result<(), FileOperationError> {
        // The root may not exist yet; present it as an empty directory.
        if virtual_path.is_empty() && !self.root().exists() {
            return Ok(());
        }
        self.inner.list(virtual_path, contents)
    }

    fn size(&self, virtual_path: &str) -> Result<u64, FileOperationError> {
        self.inner.size(virtual_path)
    }

    fn attributes(&self, virtual_path: &str) -> Result<FileAttributes, FileOperationError> {
        self.inner.attributes(virtual_path)
    }

    fn open_for_read(
        &self,
        virtual_path: &str,
    ) -> Result<Box<dyn SeekableChannel>, FileOperationError> {
        self.inner.open_for_read(virtual_path)
    }
}

impl WritableMount for WritableFileMount {
    fn is_read_only(&self, virtual_path: &str) -> Result<bool, FileOperationError> {
        let mut probe = self.inner.resolve(virtual_path)?;
        loop {
            if let Ok(metadata) = host_fs::metadata(&probe) {
                return Ok(metadata.permissions().readonly());
            }
            if probe == *self.root() || !probe.pop() {
                return Ok(false);
            }
        }
    }

    fn make_directory(&self, virtual_path: &str) -> Result<(), FileOperationError> {
        let resolved = self.inner.resolve(virtual_path)?;
        if resolved.is_dir() {
            return Ok(());
        }
        if resolved.exists() {
            return Err(FileOperationError::new(virtual_path, fs::FILE_EXISTS));
        }

        let mut missing = 0u64;
        let mut probe = resolved.clone();
        while !probe.exists() && probe != *self.root() {
            missing += 1;
            if !probe.pop() {
                break;
            }
        }
        if !self.tracker.try_charge(missing * MINIMUM_FILE_SIZE) {
            return Err(FileOperationError::new(virtual_path, fs::OUT_OF_SPACE));
        }
        host_fs::create_dir_all(&resolved).map_err(|e| {
            self.tracker.refund(missing * MINIMUM_FILE_SIZE);
            remap_io_error(virtual_path, &e)
        })
    }

    fn delete(&self, virtual_path: &str) -> Result<(), FileOperationError> {
        if virtual_path.is_empty() {
            return Err(FileOperationError::new(virtual_path, fs::ACCESS_DENIED));
        }
        let resolved = self.inner.resolve(virtual_path)?;
        let Ok(metadata) = host_fs::metadata(&resolved) else { return Ok(()) };

        let refund = if metadata.is_dir() {
            measure_used_space(&resolved)
        } else {
            metadata.len().max(MINIMUM_FILE_SIZE)
        };
        let result = if metadata.is_dir() {
            host_fs::remove_dir_all(&resolved)
        } else {
            host_fs::remove_file(&resolved)
        };
        result.map_err(|e| remap_io_error(virtual_path, &e))?;
        self.tracker.refund(refund);
        Ok(())
    }

    fn rename(&self, source: &str, dest: &str) -> Result<(), FileOperationError> {
        if path::contains(source, dest) {
            return Err(FileOperationError::new(source, fs::ACCESS_DENIED));
        }
        let resolved_source = self.inner.resolve(source)?;
        let resolved_dest = self.inner.resolve(dest)?;
        if !resolved_source.exists() {
            return Err(FileOperationError::new(source, fs::NO_SUCH_FILE));
        }
        if resolved_dest.exists() {
            return Err(FileOperationError::new(dest, fs::FILE_EXISTS));
        }
        host_fs::rename(&resolved_source, &resolved_dest)
            .map_err(|e| remap_io_error(source, &e))
    }

    fn open_file(
        &self,
        virtual_path: &str,
        flags: OpenFlags,
    ) -> Result<Box<dyn SeekableChannel>, FileOperationError> {
        flags.validate().map_err(|e| e.or_located(virtual_path))?;
        if !flags.contains(OpenFlags::WRITE) {
            return self.open_for_read(virtual_path);
        }

        let resolved = self.inner.resolve(virtual_path)?;
        let existing = host_fs::metadata(&resolved).ok();
        if existing.as_ref().is_some_and(|m| m.is_dir()) {
            return Err(FileOperationError::new(virtual_path, fs::CANNOT_WRITE_TO_DIRECTORY));
        }
        if existing.is_none() && !flags.contains(OpenFlags::CREATE) {
            return Err(FileOperationError::new(virtual_path, fs::NO_SUCH_FILE));
        }

        if existing.is_none() {
            self.create_parents(virtual_path, &resolved)?;
        }

        // Every file is charged at least the minimum size; writes past the
        // high-water mark are charged per byte by the channel.
        let charged_len = match &existing {
            Some(metadata) if !flags.contains(OpenFlags::TRUNCATE) => {
                metadata.len().max(MINIMUM_FILE_SIZE)
            }
            Some(metadata) => {
                self.tracker.refund(metadata.len().max(MINIMUM_FILE_SIZE));
                if !self.tracker.try_charge(MINIMUM_FILE_SIZE) {
                    return Err(FileOperationError::new(virtual_path, fs::OUT_OF_SPACE));
                }
                MINIMUM_FILE_SIZE
            }
            None => {
                if !self.tracker.try_charge(MINIMUM_FILE_SIZE) {
                    return Err(FileOperationError::new(virtual_path, fs::OUT_OF_SPACE));
                }
                MINIMUM_FILE_SIZE
            }
        };

        let mut options = host_fs::OpenOptions::new();
        options
            .read(flags.contains(OpenFlags::READ))
            .write(true)
            .create(flags.contains(OpenFlags::CREATE))
            .truncate(flags.contains(OpenFlags::TRUNCATE));
        let mut file = options.open(&resolved).map_err(|e| {
            if existing.is_none() || flags.contains(OpenFlags::TRUNCATE) {
                self.tracker.refund(MINIMUM_FILE_SIZE);
            }
            remap_io_error(virtual_path, &e)
        })?;

        let mut position = 0;
        if flags.contains(OpenFlags::APPEND) {
            position = file
                .seek(SeekFrom::End(0))
                .map_err(|e| remap_io_error(virtual_path, &e))?;
        }
        Ok(Box::new(CountingChannel {
            file,
            tracker: self.tracker.clone(),
            position,
            charged_len,
        }))
    }

    fn remaining_space(&self) -> Result<u64, FileOperationError> {
        Ok(self.tracker.capacity.saturating_sub(self.tracker.used()))
    }

    fn capacity(&self) -> u64 {
        self.tracker.capacity - MINIMUM_FILE_SIZE
    }
}

/// Sum the quota charges for everything under `root`, the root directory
/// itself included.
fn measure_used_space(root: &Path) -> u64 {
    if !root.exists() {
        return MINIMUM_FILE_SIZE;
    }
    let mut total = 0;
    for entry in WalkDir::new(root) {
        match entry {
            Ok(entry) => match entry.metadata() {
                Ok(metadata) if metadata.is_dir() => total += MINIMUM_FILE_SIZE,
                Ok(metadata) => total += metadata.len().max(MINIMUM_FILE_SIZE),
                Err(err) => {
                    log::warn!("cannot stat {}: {err}", entry.path().display());
                    total += MINIMUM_FILE_SIZE;
                }
            },
            Err(err) => log::warn!("cannot walk {}: {err}", root.display()),
        }
    }
    total
}

struct ReadOnlyFile {
    file: host_fs::File,
}

impl Read for ReadOnlyFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for ReadOnlyFile {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, fs::ACCESS_DENIED))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ReadOnlyFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// A file channel which charges the quota for growth past the file's
/// high-water mark.
struct CountingChannel {
    file: host_fs::File,
    tracker: Arc<SpaceTracker>,
    position: u64,
    charged_len: u64,
}

impl Read for CountingChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for CountingChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let end = self.position + buf.len() as u64;
        let mut charged = 0;
        if end > self.charged_len {
            charged = end - self.charged_len;
            if !self.tracker.try_charge(charged) {
                return Err(io::Error::other(fs::OUT_OF_SPACE));
            }
            self.charged_len = end;
        }
        match self.file.write(buf) {
            Ok(n) => {
                let written_end = self.position + n as u64;
                // Refund the part of this call's charge that was not written.
                if charged > 0 && written_end < self.charged_len {
                    let floor = self.charged_len - charged;
                    let excess = self.charged_len - written_end.max(floor);
                    self.tracker.refund(excess);
                    self.charged_len -= excess;
                }
                self.position = written_end;
                Ok(n)
            }
            Err(err) => {
                if charged > 0 {
                    self.tracker.refund(charged);
                    self.charged_len -= charged;
                }
                Err(err)
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for CountingChannel {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.position = self.file.seek(pos)?;
        Ok(self.position)
    }
}

fn lock_used(used: &Mutex<u64>) -> std::sync::MutexGuard<'_, u64> {
    match used.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn read_only_mount_lists_and_reads() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/file"), b"contents").unwrap();

        let mount = FileMount::new(dir.path());
        assert!(mount.is_directory("sub").unwrap());
        assert_eq!(mount.size("sub/file").unwrap(), 8);

        let mut listing = Vec::new();
        mount.list("", &mut listing).unwrap();
        assert_eq!(listing, ["sub"]);

        let mut out = Vec::new();
        mount.open_for_read("sub/file").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"contents");

        let err = mount.open_for_read("missing").unwrap_err();
        assert_eq!(err.message(), fs::NO_SUCH_FILE);
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mount = FileMount::new(dir.path());
        let err = mount.exists("../escape").unwrap_err();
        assert_eq!(err.message(), fs::ACCESS_DENIED);
    }

    #[test]
    fn quota_charges_minimum_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let mount = WritableFileMount::new(dir.path().join("computer"), 1_000);
        assert_eq!(mount.remaining_space().unwrap(), 1_000);

        let mut channel = mount.open_file("tiny", OpenFlags::WRITE_DEFAULTS).unwrap();
        channel.write_all(b"x").unwrap();
        drop(channel);
        // One byte still costs the 500-byte floor.
        assert_eq!(mount.remaining_space().unwrap(), 500);
    }

    #[test]
    fn quota_rejects_writes_past_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mount = WritableFileMount::new(dir.path().join("computer"), 1_000);

        let mut a = mount.open_file("a", OpenFlags::WRITE_DEFAULTS).unwrap();
        a.write_all(&[0u8; 10]).unwrap();
        drop(a);

        let mut b = mount.open_file("b", OpenFlags::WRITE_DEFAULTS).unwrap();
        // The first 500 bytes ride on the floor charge; the 501st does not fit.
        b.write_all(&[0u8; 500]).unwrap();
        let err = b.write_all(&[0u8; 100]).unwrap_err();
        assert_eq!(err.to_string(), fs::OUT_OF_SPACE);
    }

    #[test]
    fn delete_refunds_quota() {
        let dir = tempfile::tempdir().unwrap();
        let mount = WritableFileMount::new(dir.path().join("computer"), 2_000);
        let mut channel = mount.open_file("f", OpenFlags::WRITE_DEFAULTS).unwrap();
        channel.write_all(&[0u8; 700]).unwrap();
        drop(channel);
        assert_eq!(mount.remaining_space().unwrap(), 1_300);
        mount.delete("f").unwrap();
        assert_eq!(mount.remaining_space().unwrap(), 2_000);
    }

    #[test]
    fn append_only_charges_growth() {
        let dir = tempfile::tempdir().unwrap();
        let mount = WritableFileMount::new(dir.path().join("computer"), 2_000);
        let mut channel = mount.open_file("f", OpenFlags::WRITE_DEFAULTS).unwrap();
        channel.write_all(&[0u8; 600]).unwrap();
        drop(channel);
        assert_eq!(mount.remaining_space().unwrap(), 1_400);

        let mut channel = mount.open_file("f", OpenFlags::APPEND_DEFAULTS).unwrap();
        channel.write_all(&[0u8; 100]).unwrap();
        drop(channel);
        assert_eq!(mount.remaining_space().unwrap(), 1_300);
    }

    #[test]
    fn make_directory_charges_each_level() {
        let dir = tempfile::tempdir().unwrap();
        let mount = WritableFileMount::new(dir.path().join("computer"), 2_000);
        mount.make_directory("a/b").unwrap();
        // Root, "a" and "a/b" are created; the root charge is part of the
        // internal capacity offset.
        assert_eq!(mount.remaining_space().unwrap(), 1_000);
        mount.make_directory("a/b").unwrap();
        assert_eq!(mount.remaining_space().unwrap(), 1_000);
    }

    #[test]
    fn existing_tree_is_measured_at_mount() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("computer");
        std::fs::create_dir_all(root.join("d")).unwrap();
        std::fs::write(root.join("d/file"), [0u8; 700]).unwrap();

        let mount = WritableFileMount::new(&root, 5_000);
        // Directory "d" (500) + file (700); the root itself is covered by the
        // capacity offset.
        assert_eq!(mount.remaining_space().unwrap(), 5_000 - 500 - 700);
    }
}
