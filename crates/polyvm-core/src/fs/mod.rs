//! The virtual filesystem: a mount table over heterogeneous backends plus
//! leak-safe open-handle bookkeeping.
//!
//! Paths are sanitized on entry, resolved to the deepest matching mount, and
//! rewritten to mount-local form. Every open file lives in a
//! generation-stamped arena so handles can be force-closed when their mount
//! disappears or the session ends, and a dropped handle always releases its
//! slot.

pub mod archive;
pub mod disk;
pub mod memory;
pub mod path;

pub use archive::ArchiveMount;
pub use disk::{FileMount, WritableFileMount};
pub use memory::MemoryMount;

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use polyvm_api::fs::{
    self, remap_io_error, FileAttributes, FileOperationError, Mount, OpenFlags, SeekableChannel,
    WritableMount,
};

/// How deep a recursive copy may go before it is assumed to be cyclic.
const MAX_COPY_DEPTH: usize = 128;

const INVALID_PATH: &str = "Invalid path";
const CLOSED_FILE: &str = "attempt to use a closed file";

pub struct FileSystem {
    mounts: Mutex<HashMap<String, MountWrapper>>,
    open_files: Mutex<HandleTable>,
    max_open: usize,
}

enum Backing {
    ReadOnly(Arc<dyn Mount>),
    Writable(Arc<dyn WritableMount>),
}

impl Clone for Backing {
    fn clone(&self) -> Self {
        match self {
            Backing::ReadOnly(m) => Backing::ReadOnly(m.clone()),
            Backing::Writable(m) => Backing::Writable(m.clone()),
        }
    }
}

/// A mount plus where it lives in the virtual tree. Operations take
/// mount-local paths; errors are re-rooted by the filesystem.
#[derive(Clone)]
struct MountWrapper {
    label: String,
    location: String,
    backing: Backing,
}

impl MountWrapper {
    fn exists(&self, local: &str) -> Result<bool, FileOperationError> {
        match &self.backing {
            Backing::ReadOnly(m) => m.exists(local),
            Backing::Writable(m) => m.exists(local),
        }
    }

    fn is_directory(&self, local: &str) -> Result<bool, FileOperationError> {
        match &self.backing {
            Backing::ReadOnly(m) => m.is_directory(local),
            Backing::Writable(m) => m.is_directory(local),
        }
    }

    fn list(&self, local: &str, contents: &mut Vec<String>) -> Result<(), FileOperationError> {
        if !self.exists(local)? {
            return Err(FileOperationError::new(local, fs::NO_SUCH_FILE));
        }
        if !self.is_directory(local)? {
            return Err(FileOperationError::new(local, fs::NOT_A_DIRECTORY));
        }
        match &self.backing {
            Backing::ReadOnly(m) => m.list(local, contents),
            Backing::Writable(m) => m.list(local, contents),
        }
    }

    fn size(&self, local: &str) -> Result<u64, FileOperationError> {
        match &self.backing {
            Backing::ReadOnly(m) => m.size(local),
            Backing::Writable(m) => m.size(local),
        }
    }

    fn attributes(&self, local: &str) -> Result<FileAttributes, FileOperationError> {
        match &self.backing {
            Backing::ReadOnly(m) => m.attributes(local),
            Backing::Writable(m) => m.attributes(local),
        }
    }

    fn open_for_read(&self, local: &str) -> Result<Box<dyn SeekableChannel>, FileOperationError> {
        match &self.backing {
            Backing::ReadOnly(m) => m.open_for_read(local),
            Backing::Writable(m) => m.open_for_read(local),
        }
    }

    fn is_read_only(&self, local: &str) -> Result<bool, FileOperationError> {
        match &self.backing {
            Backing::ReadOnly(_) => Ok(true),
            Backing::Writable(m) => m.is_read_only(local),
        }
    }

    fn writable(&self, local: &str) -> Result<&Arc<dyn WritableMount>, FileOperationError> {
        match &self.backing {
            Backing::Writable(m) => Ok(m),
            Backing::ReadOnly(_) => Err(FileOperationError::new(local, fs::ACCESS_DENIED)),
        }
    }

    fn free_space(&self) -> Result<u64, FileOperationError> {
        match &self.backing {
            Backing::ReadOnly(_) => Ok(0),
            Backing::Writable(m) => m.remaining_space(),
        }
    }

    fn capacity(&self) -> Option<u64> {
        match &self.backing {
            Backing::ReadOnly(_) => None,
            Backing::Writable(m) => Some(m.capacity()),
        }
    }
}

impl FileSystem {
    /// Create a filesystem with the given writable mount as its root.
    pub fn new(label: &str, root: Arc<dyn WritableMount>, max_open: usize) -> Arc<FileSystem> {
        let filesystem = FileSystem {
            mounts: Mutex::new(HashMap::new()),
            open_files: Mutex::new(HandleTable::default()),
            max_open,
        };
        lock(&filesystem.mounts).insert(
            String::new(),
            MountWrapper {
                label: label.to_owned(),
                location: String::new(),
                backing: Backing::Writable(root),
            },
        );
        Arc::new(filesystem)
    }

    pub fn mount(
        &self,
        label: &str,
        location: &str,
        mount: Arc<dyn Mount>,
    ) -> Result<(), FileOperationError> {
        self.mount_wrapper(label, location, Backing::ReadOnly(mount))
    }

    pub fn mount_writable(
        &self,
        label: &str,
        location: &str,
        mount: Arc<dyn WritableMount>,
    ) -> Result<(), FileOperationError> {
        self.mount_wrapper(label, location, Backing::Writable(mount))
    }

    fn mount_wrapper(
        &self,
        label: &str,
        location: &str,
        backing: Backing,
    ) -> Result<(), FileOperationError> {
        let location = path::sanitize(location);
        if location == ".." || location.starts_with("../") {
            return Err(FileOperationError::new(location, fs::ACCESS_DENIED));
        }
        lock(&self.mounts).insert(
            location.clone(),
            MountWrapper { label: label.to_owned(), location, backing },
        );
        Ok(())
    }

    /// Remove a mount, force-closing any files still open on it.
    pub fn unmount(&self, location: &str) {
        let location = path::sanitize(location);
        if lock(&self.mounts).remove(&location).is_some() {
            lock(&self.open_files).close_matching(|entry| entry.mount_location == location);
        }
    }

    /// Force-close all open handles and drop every mount. The filesystem is
    /// unusable afterwards.
    pub fn close(&self) {
        lock(&self.open_files).close_matching(|_| true);
        lock(&self.mounts).clear();
    }

    /// The deepest mount containing `path`.
    fn get_mount(&self, path: &str) -> Result<MountWrapper, FileOperationError> {
        let mounts = lock(&self.mounts);
        mounts
            .values()
            .filter(|wrapper| path::contains(&wrapper.location, path))
            .max_by_key(|wrapper| wrapper.location.len())
            .cloned()
            .ok_or_else(|| FileOperationError::new(path, INVALID_PATH))
    }

    pub fn list(&self, raw_path: &str) -> Result<Vec<String>, FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        let local = path::to_local(&full, &wrapper.location);

        let mut contents = Vec::new();
        wrapper
            .list(&local, &mut contents)
            .map_err(|e| localize(e, &wrapper.location, &full))?;

        // Mount points also show up as entries of their parent directory.
        let mounts = lock(&self.mounts);
        for other in mounts.values() {
            if !other.location.is_empty() && path::get_directory(&other.location) == full {
                let name = path::get_name(&other.location);
                if !contents.contains(&name) {
                    contents.push(name);
                }
            }
        }
        drop(mounts);
        contents.sort();
        Ok(contents)
    }

    pub fn exists(&self, raw_path: &str) -> Result<bool, FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        wrapper.exists(&path::to_local(&full, &wrapper.location))
    }

    pub fn is_dir(&self, raw_path: &str) -> Result<bool, FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        wrapper.is_directory(&path::to_local(&full, &wrapper.location))
    }

    pub fn is_read_only(&self, raw_path: &str) -> Result<bool, FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        wrapper.is_read_only(&path::to_local(&full, &wrapper.location))
    }

    pub fn get_size(&self, raw_path: &str) -> Result<u64, FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        let local = path::to_local(&full, &wrapper.location);
        if !wrapper.exists(&local)? {
            return Err(FileOperationError::new(&full, fs::NO_SUCH_FILE));
        }
        wrapper.size(&local).map_err(|e| localize(e, &wrapper.location, &full))
    }

    pub fn get_attributes(&self, raw_path: &str) -> Result<FileAttributes, FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        let local = path::to_local(&full, &wrapper.location);
        wrapper.attributes(&local).map_err(|e| localize(e, &wrapper.location, &full))
    }

    pub fn get_mount_label(&self, raw_path: &str) -> Result<String, FileOperationError> {
        Ok(self.get_mount(&path::sanitize(raw_path))?.label)
    }

    pub fn get_free_space(&self, raw_path: &str) -> Result<u64, FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        wrapper.free_space().map_err(|e| localize(e, &wrapper.location, &full))
    }

    /// The capacity of the mount containing `path`, or `None` for mounts
    /// without a meaningful limit (read-only ones).
    pub fn get_capacity(&self, raw_path: &str) -> Result<Option<u64>, FileOperationError> {
        Ok(self.get_mount(&path::sanitize(raw_path))?.capacity())
    }

    pub fn make_dir(&self, raw_path: &str) -> Result<(), FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        let local = path::to_local(&full, &wrapper.location);
        wrapper
            .writable(&local)
            .and_then(|m| m.make_directory(&local))
            .map_err(|e| localize(e, &wrapper.location, &full))
    }

    pub fn delete(&self, raw_path: &str) -> Result<(), FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        let local = path::to_local(&full, &wrapper.location);
        wrapper
            .writable(&local)
            .and_then(|m| m.delete(&local))
            .map_err(|e| localize(e, &wrapper.location, &full))
    }

    pub fn move_(&self, raw_source: &str, raw_dest: &str) -> Result<(), FileOperationError> {
        let source = path::sanitize(raw_source);
        let dest = path::sanitize(raw_dest);
        self.check_transfer(&source, &dest, "Can't move a directory inside itself")?;

        let source_mount = self.get_mount(&source)?;
        let dest_mount = self.get_mount(&dest)?;
        let source_local = path::to_local(&source, &source_mount.location);
        let dest_local = path::to_local(&dest, &dest_mount.location);
        if source_mount.is_read_only(&source_local)? {
            return Err(FileOperationError::new(&source, fs::ACCESS_DENIED));
        }
        if dest_mount.is_read_only(&dest_local)? {
            return Err(FileOperationError::new(&dest, fs::ACCESS_DENIED));
        }

        if source_mount.location == dest_mount.location {
            source_mount
                .writable(&source_local)
                .and_then(|m| m.rename(&source_local, &dest_local))
                .map_err(|e| localize(e, &source_mount.location, &source))
        } else {
            self.copy_recursive(&source_mount, &source_local, &dest_mount, &dest_local, 0)
                .map_err(|e| e.or_located(&source))?;
            source_mount
                .writable(&source_local)
                .and_then(|m| m.delete(&source_local))
                .map_err(|e| localize(e, &source_mount.location, &source))
        }
    }

    pub fn copy(&self, raw_source: &str, raw_dest: &str) -> Result<(), FileOperationError> {
        let source = path::sanitize(raw_source);
        let dest = path::sanitize(raw_dest);
        self.check_transfer(&source, &dest, "Can't copy a directory inside itself")?;

        let source_mount = self.get_mount(&source)?;
        let dest_mount = self.get_mount(&dest)?;
        let source_local = path::to_local(&source, &source_mount.location);
        let dest_local = path::to_local(&dest, &dest_mount.location);
        if dest_mount.is_read_only(&dest_local)? {
            return Err(FileOperationError::new(&dest, fs::ACCESS_DENIED));
        }
        self.copy_recursive(&source_mount, &source_local, &dest_mount, &dest_local, 0)
            .map_err(|e| e.or_located(&source))
    }

    fn check_transfer(
        &self,
        source: &str,
        dest: &str,
        cycle_message: &str,
    ) -> Result<(), FileOperationError> {
        if !self.exists(source)? {
            return Err(FileOperationError::new(source, fs::NO_SUCH_FILE));
        }
        if self.exists(dest)? {
            return Err(FileOperationError::new(dest, fs::FILE_EXISTS));
        }
        if path::contains(source, dest) {
            return Err(FileOperationError::new(source, cycle_message));
        }
        Ok(())
    }

    fn copy_recursive(
        &self,
        source_mount: &MountWrapper,
        source: &str,
        dest_mount: &MountWrapper,
        dest: &str,
        depth: usize,
    ) -> Result<(), FileOperationError> {
        if depth >= MAX_COPY_DEPTH {
            return Err(FileOperationError::general("Too many directories to copy"));
        }
        if !source_mount.exists(source)? {
            return Ok(());
        }

        if source_mount.is_directory(source)? {
            dest_mount.writable(dest).and_then(|m| m.make_directory(dest))?;
            let mut children = Vec::new();
            source_mount.list(source, &mut children)?;
            for child in children {
                self.copy_recursive(
                    source_mount,
                    &path::combine(source, &child),
                    dest_mount,
                    &path::combine(dest, &child),
                    depth + 1,
                )?;
            }
            Ok(())
        } else {
            let mut from = source_mount.open_for_read(source)?;
            let mut to = dest_mount
                .writable(dest)
                .and_then(|m| m.open_file(dest, OpenFlags::WRITE_DEFAULTS))?;
            io::copy(&mut from, &mut to).map_err(|e| remap_io_error(dest, &e))?;
            to.flush().map_err(|e| remap_io_error(dest, &e))?;
            Ok(())
        }
    }

    pub fn open_for_read(
        self: &Arc<Self>,
        raw_path: &str,
    ) -> Result<FileHandle, FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        let local = path::to_local(&full, &wrapper.location);
        let channel = wrapper
            .open_for_read(&local)
            .map_err(|e| localize(e, &wrapper.location, &full))?;
        self.insert_handle(&full, &wrapper.location, channel)
    }

    pub fn open_for_write(
        self: &Arc<Self>,
        raw_path: &str,
        flags: OpenFlags,
    ) -> Result<FileHandle, FileOperationError> {
        let full = path::sanitize(raw_path);
        let wrapper = self.get_mount(&full)?;
        let local = path::to_local(&full, &wrapper.location);
        let channel = wrapper
            .writable(&local)
            .and_then(|m| m.open_file(&local, flags))
            .map_err(|e| localize(e, &wrapper.location, &full))?;
        self.insert_handle(&full, &wrapper.location, channel)
    }

    /// Number of files currently open.
    pub fn open_count(&self) -> usize {
        lock(&self.open_files).open
    }

    fn insert_handle(
        self: &Arc<Self>,
        full_path: &str,
        mount_location: &str,
        channel: Box<dyn SeekableChannel>,
    ) -> Result<FileHandle, FileOperationError> {
        let mut table = lock(&self.open_files);
        if table.open >= self.max_open {
            return Err(FileOperationError::new(full_path, fs::TOO_MANY_FILES));
        }
        let cell = Arc::new(ChannelCell { channel: Mutex::new(Some(channel)) });
        let (index, generation) = table.insert(OpenEntry {
            cell: cell.clone(),
            mount_location: mount_location.to_owned(),
        });
        Ok(FileHandle { filesystem: Arc::downgrade(self), index, generation, cell })
    }
}

fn localize(err: FileOperationError, location: &str, full_path: &str) -> FileOperationError {
    match err {
        FileOperationError::Located { path: local, message } => {
            FileOperationError::new(path::combine(location, &local), message)
        }
        FileOperationError::General { message } => FileOperationError::new(full_path, message),
    }
}

#[derive(Default)]
struct HandleTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
    open: usize,
}

struct Slot {
    generation: u32,
    entry: Option<OpenEntry>,
}

struct OpenEntry {
    cell: Arc<ChannelCell>,
    mount_location: String,
}

impl HandleTable {
    fn insert(&mut self, entry: OpenEntry) -> (usize, u32) {
        self.open += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index];
                slot.entry = Some(entry);
                (index, slot.generation)
            }
            None => {
                self.slots.push(Slot { generation: 0, entry: Some(entry) });
                (self.slots.len() - 1, 0)
            }
        }
    }

    /// Release a slot if the generation still matches (it will not if the
    /// handle was already force-closed).
    fn release(&mut self, index: usize, generation: u32) {
        let Some(slot) = self.slots.get_mut(index) else { return };
        if slot.generation != generation || slot.entry.is_none() {
            return;
        }
        slot.entry = None;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        self.open -= 1;
    }

    fn close_matching(&mut self, mut predicate: impl FnMut(&OpenEntry) -> bool) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let matched = slot.entry.as_ref().is_some_and(&mut predicate);
            if !matched {
                continue;
            }
            if let Some(entry) = slot.entry.take() {
                entry.cell.force_close();
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index);
                self.open -= 1;
            }
        }
    }
}

struct ChannelCell {
    channel: Mutex<Option<Box<dyn SeekableChannel>>>,
}

impl ChannelCell {
    fn force_close(&self) {
        let channel = lock(&self.channel).take();
        if let Some(mut channel) = channel {
            if let Err(err) = channel.flush() {
                log::warn!("failed to flush file on forced close: {err}");
            }
        }
    }
}

/// An open file. Closing is automatic on drop; a handle whose mount was
/// removed fails all further operations.
pub struct FileHandle {
    filesystem: Weak<FileSystem>,
    index: usize,
    generation: u32,
    cell: Arc<ChannelCell>,
}

impl std::fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl FileHandle {
    pub fn is_open(&self) -> bool {
        lock(&self.cell.channel).is_some()
    }

    pub fn close(mut self) {
        self.close_impl();
    }

    fn close_impl(&mut self) {
        self.cell.force_close();
        if let Some(filesystem) = self.filesystem.upgrade() {
            lock(&filesystem.open_files).release(self.index, self.generation);
        }
    }

    fn with_channel<R>(
        &mut self,
        op: impl FnOnce(&mut dyn SeekableChannel) -> io::Result<R>,
    ) -> io::Result<R> {
        let mut guard = lock(&self.cell.channel);
        match guard.as_mut() {
            Some(channel) => op(channel.as_mut()),
            None => Err(io::Error::other(CLOSED_FILE)),
        }
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        self.close_impl();
    }
}

impl Read for FileHandle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_channel(|c| c.read(buf))
    }
}

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_channel(|c| c.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_channel(|c| c.flush())
    }
}

impl Seek for FileHandle {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.with_channel(|c| c.seek(pos))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn test_fs() -> Arc<FileSystem> {
        FileSystem::new("hdd", Arc::new(MemoryMount::new()), 16)
    }

    fn rom() -> Arc<MemoryMount> {
        let rom = MemoryMount::new();
        rom.add_file("programs/ls", "list things").unwrap();
        rom.add_file("startup", "boot").unwrap();
        Arc::new(rom)
    }

    #[test]
    fn deepest_mount_wins() {
        let fs = test_fs();
        fs.mount("rom", "rom", rom()).unwrap();
        let nested = MemoryMount::new();
        nested.add_file("inner", "nested data").unwrap();
        fs.mount("nested", "rom/programs/extra", Arc::new(nested)).unwrap();

        assert_eq!(fs.get_mount_label("").unwrap(), "hdd");
        assert_eq!(fs.get_mount_label("rom/startup").unwrap(), "rom");
        assert_eq!(fs.get_mount_label("rom/programs/extra/inner").unwrap(), "nested");
        assert_eq!(fs.get_size("rom/programs/extra/inner").unwrap(), 11);
    }

    #[test]
    fn list_merges_mount_points() {
        let fs = test_fs();
        fs.mount("rom", "rom", rom()).unwrap();
        fs.make_dir("files").unwrap();
        assert_eq!(fs.list("").unwrap(), ["files", "rom"]);
        assert_eq!(fs.list("rom").unwrap(), ["programs", "startup"]);
    }

    #[test]
    fn escaping_paths_are_invalid() {
        let fs = test_fs();
        let err = fs.exists("../escape").unwrap_err();
        assert_eq!(err.message(), INVALID_PATH);
    }

    #[test]
    fn read_only_mounts_reject_writes() {
        let fs = test_fs();
        fs.mount("rom", "rom", rom()).unwrap();
        let err = fs.make_dir("rom/new").unwrap_err();
        assert_eq!(err.message(), fs::ACCESS_DENIED);
        assert!(fs.is_read_only("rom/startup").unwrap());
        assert!(!fs.is_read_only("anything").unwrap());
    }

    #[test]
    fn deep_copies_are_cut_off() {
        let fs = test_fs();
        let deep = MemoryMount::new();
        let chain = vec!["d"; 2 * MAX_COPY_DEPTH].join("/");
        deep.add_file(&format!("{chain}/file"), "x").unwrap();
        fs.mount("deep", "deep", Arc::new(deep)).unwrap();

        let err = fs.copy("deep", "copied").unwrap_err();
        assert_eq!(err.message(), "Too many directories to copy");
    }

    #[test]
    fn copy_across_mounts() {
        let fs = test_fs();
        fs.mount("rom", "rom", rom()).unwrap();
        fs.copy("rom/programs", "local").unwrap();
        assert_eq!(fs.list("local").unwrap(), ["ls"]);

        let mut handle = fs.open_for_read("local/ls").unwrap();
        let mut contents = String::new();
        handle.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "list things");
    }

    #[test]
    fn move_within_a_mount() {
        let fs = test_fs();
        {
            let mut handle = fs.open_for_write("a", OpenFlags::WRITE_DEFAULTS).unwrap();
            handle.write_all(b"data").unwrap();
        }
        fs.move_("a", "b").unwrap();
        assert!(!fs.exists("a").unwrap());
        assert_eq!(fs.get_size("b").unwrap(), 4);
    }

    #[test]
    fn transfers_reject_cycles_and_collisions() {
        let fs = test_fs();
        fs.make_dir("dir").unwrap();
        let err = fs.copy("dir", "dir/inner").unwrap_err();
        assert_eq!(err.message(), "Can't copy a directory inside itself");

        fs.make_dir("other").unwrap();
        let err = fs.move_("dir", "other").unwrap_err();
        assert_eq!(err.message(), fs::FILE_EXISTS);

        let err = fs.copy("missing", "dest").unwrap_err();
        assert_eq!(err.message(), fs::NO_SUCH_FILE);
    }

    #[test]
    fn unmount_closes_open_handles() {
        let fs = test_fs();
        fs.mount("rom", "rom", rom()).unwrap();
        let mut handle = fs.open_for_read("rom/startup").unwrap();
        assert_eq!(fs.open_count(), 1);

        fs.unmount("rom");
        assert!(!handle.is_open());
        assert_eq!(fs.open_count(), 0);
        let mut buf = [0u8; 4];
        let err = handle.read(&mut buf).unwrap_err();
        assert_eq!(err.to_string(), CLOSED_FILE);
        assert!(fs.exists("rom/startup").is_ok());
        assert!(!fs.exists("rom/startup").unwrap());
    }

    #[test]
    fn dropping_a_handle_releases_its_slot() {
        let fs = test_fs();
        {
            let _handle = fs.open_for_write("f", OpenFlags::WRITE_DEFAULTS).unwrap();
            assert_eq!(fs.open_count(), 1);
        }
        assert_eq!(fs.open_count(), 0);
    }

    #[test]
    fn open_file_cap_is_enforced() {
        let fs = FileSystem::new("hdd", Arc::new(MemoryMount::new()), 2);
        let _a = fs.open_for_write("a", OpenFlags::WRITE_DEFAULTS).unwrap();
        let _b = fs.open_for_write("b", OpenFlags::WRITE_DEFAULTS).unwrap();
        let err = fs.open_for_write("c", OpenFlags::WRITE_DEFAULTS).unwrap_err();
        assert_eq!(err.message(), fs::TOO_MANY_FILES);
        drop(_a);
        fs.open_for_write("c", OpenFlags::WRITE_DEFAULTS).unwrap();
    }

    #[test]
    fn close_tears_everything_down() {
        let fs = test_fs();
        let handle = fs.open_for_write("f", OpenFlags::WRITE_DEFAULTS).unwrap();
        fs.close();
        assert!(!handle.is_open());
        assert!(fs.exists("f").is_err());
    }

    #[test]
    fn errors_are_rooted_at_the_full_path() {
        let fs = test_fs();
        fs.mount("rom", "rom", rom()).unwrap();
        let err = fs.get_size("rom/missing").unwrap_err();
        assert_eq!(err.to_string(), "/rom/missing: No such file");
    }
}
