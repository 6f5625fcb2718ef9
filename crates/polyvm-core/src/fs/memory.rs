//! A writable file tree held entirely in memory.
//!
//! Used for rom-style resource trees and for tests. Each entry is shared
//! behind its own lock, so an open channel keeps its file alive (and
//! readable) even if the file is deleted from the tree underneath it.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use polyvm_api::fs::{
    self, FileAttributes, FileOperationError, Mount, OpenFlags, SeekableChannel, WritableMount,
    MINIMUM_FILE_SIZE,
};

use super::path;

type EntryRef = Arc<Mutex<Entry>>;

struct Entry {
    /// `Some` for directories.
    children: Option<HashMap<String, EntryRef>>,
    /// `Some` for files.
    contents: Option<Vec<u8>>,
    created: SystemTime,
    modified: SystemTime,
}

impl Entry {
    fn directory() -> EntryRef {
        let now = SystemTime::now();
        Arc::new(Mutex::new(Entry {
            children: Some(HashMap::new()),
            contents: None,
            created: now,
            modified: now,
        }))
    }

    fn file(contents: Vec<u8>) -> EntryRef {
        let now = SystemTime::now();
        Arc::new(Mutex::new(Entry {
            children: None,
            contents: Some(contents),
            created: now,
            modified: now,
        }))
    }

    fn is_directory(&self) -> bool {
        self.children.is_some()
    }
}

pub struct MemoryMount {
    root: EntryRef,
    capacity: u64,
}

impl Default for MemoryMount {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMount {
    /// An empty mount with no capacity limit.
    pub fn new() -> Self {
        MemoryMount { root: Entry::directory(), capacity: 0 }
    }

    /// An empty mount reporting the given capacity. The limit is advisory:
    /// writes are not rejected, only reported via `remaining_space`.
    pub fn with_capacity(capacity: u64) -> Self {
        MemoryMount { root: Entry::directory(), capacity }
    }

    /// Add a file, creating parent directories as needed. Convenient for
    /// building resource trees.
    pub fn add_file(
        &self,
        path: &str,
        contents: impl Into<Vec<u8>>,
    ) -> Result<(), FileOperationError> {
        let path = path::sanitize(path);
        let parent = path::get_directory(&path);
        if parent != ".." && !parent.is_empty() {
            self.make_directory(&parent)?;
        }
        let (parent, name) = self.find_parent(&path)?;
        let mut guard = lock(&parent);
        let children = guard.children.as_mut().ok_or_else(not_a_dir(&path))?;
        children.insert(name, Entry::file(contents.into()));
        Ok(())
    }

    fn find(&self, path: &str) -> Option<EntryRef> {
        let mut current = self.root.clone();
        if path.is_empty() {
            return Some(current);
        }
        for segment in path.split('/') {
            let next = {
                let guard = lock(&current);
                guard.children.as_ref()?.get(segment).cloned()?
            };
            current = next;
        }
        Some(current)
    }

    /// The parent entry of `path` and the final segment. Fails if any
    /// ancestor is missing or a file.
    fn find_parent(&self, path: &str) -> Result<(EntryRef, String), FileOperationError> {
        let parent = path::get_directory(path);
        if parent == ".." {
            return Err(FileOperationError::new(path, fs::ACCESS_DENIED));
        }
        let entry = self.find(&parent).ok_or_else(no_such_file(path))?;
        if !lock(&entry).is_directory() {
            return Err(FileOperationError::new(path, fs::NOT_A_DIRECTORY));
        }
        Ok((entry, path::get_name(path)))
    }

    fn used_space(&self) -> u64 {
        fn visit(entry: &EntryRef) -> u64 {
            let guard = lock(entry);
            match (&guard.children, &guard.contents) {
                (Some(children), _) => {
                    MINIMUM_FILE_SIZE + children.values().map(visit).sum::<u64>()
                }
                (None, Some(contents)) => (contents.len() as u64).max(MINIMUM_FILE_SIZE),
                (None, None) => MINIMUM_FILE_SIZE,
            }
        }
        // The root directory itself is free.
        visit(&self.root) - MINIMUM_FILE_SIZE
    }
}

impl Mount for MemoryMount {
    fn exists(&self, path: &str) -> Result<bool, FileOperationError> {
        Ok(self.find(path).is_some())
    }

    fn is_directory(&self, path: &str) -> Result<bool, FileOperationError> {
        Ok(self.find(path).is_some_and(|e| lock(&e).is_directory()))
    }

    fn list(&self, path: &str, contents: &mut Vec<String>) -> Result<(), FileOperationError> {
        let entry = self.find(path).ok_or_else(no_such_file(path))?;
        let guard = lock(&entry);
        let children = guard.children.as_ref().ok_or_else(not_a_dir(path))?;
        contents.extend(children.keys().cloned());
        Ok(())
    }

    fn size(&self, path: &str) -> Result<u64, FileOperationError> {
        let entry = self.find(path).ok_or_else(no_such_file(path))?;
        let guard = lock(&entry);
        Ok(guard.contents.as_ref().map_or(0, |c| c.len() as u64))
    }

    fn attributes(&self, path: &str) -> Result<FileAttributes, FileOperationError> {
        let entry = self.find(path).ok_or_else(no_such_file(path))?;
        let guard = lock(&entry);
        Ok(FileAttributes::with_times(
            guard.is_directory(),
            guard.contents.as_ref().map_or(0, |c| c.len() as u64),
            Some(guard.created),
            Some(guard.modified),
        ))
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn SeekableChannel>, FileOperationError> {
        let entry = self.find(path).ok_or_else(no_such_file(path))?;
        if lock(&entry).is_directory() {
            return Err(FileOperationError::new(path, fs::NOT_A_FILE));
        }
        Ok(Box::new(EntryChannel { entry, position: 0, writable: false }))
    }
}

impl WritableMount for MemoryMount {
    fn is_read_only(&self, _path: &str) -> Result<bool, FileOperationError> {
        Ok(false)
    }

    fn make_directory(&self, path: &str) -> Result<(), FileOperationError> {
        let path = path::sanitize(path);
        let mut current = self.root.clone();
        for segment in path.split('/') {
            if segment.is_empty() {
                continue;
            }
            let next = {
                let mut guard = lock(&current);
                let children = guard.children.as_mut().ok_or_else(not_a_dir(&path))?;
                children.entry(segment.to_owned()).or_insert_with(Entry::directory).clone()
            };
            if !lock(&next).is_directory() {
                return Err(FileOperationError::new(&path, fs::FILE_EXISTS));
            }
            current = next;
        }
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<(), FileOperationError> {
        if path.is_empty() {
            return Err(FileOperationError::new(path, fs::ACCESS_DENIED));
        }
        if let Ok((parent, name)) = self.find_parent(path) {
            let mut guard = lock(&parent);
            if let Some(children) = guard.children.as_mut() {
                children.remove(&name);
            }
        }
        Ok(())
    }

    fn rename(&self, source: &str, dest: &str) -> Result<(), FileOperationError> {
        if path::contains(source, dest) {
            return Err(FileOperationError::new(source, fs::ACCESS_DENIED));
        }
        let (dest_parent, dest_name) = self.find_parent(dest)?;
        if self.find(dest).is_some() {
            return Err(FileOperationError::new(dest, fs::FILE_EXISTS));
        }
        let (source_parent, source_name) = self.find_parent(source)?;
        let moved = {
            let mut guard = lock(&source_parent);
            let children =
                guard.children.as_mut().ok_or_else(not_a_dir(source))?;
            children.remove(&source_name).ok_or_else(no_such_file(source))?
        };
        lock(&dest_parent)
            .children
            .as_mut()
            .ok_or_else(not_a_dir(dest))?
            .insert(dest_name, moved);
        Ok(())
    }

    fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Box<dyn SeekableChannel>, FileOperationError> {
        flags.validate().map_err(|e| e.or_located(path))?;
        if !flags.contains(OpenFlags::WRITE) {
            return self.open_for_read(path);
        }

        let entry = match self.find(path) {
            Some(entry) => {
                if lock(&entry).is_directory() {
                    return Err(FileOperationError::new(path, fs::CANNOT_WRITE_TO_DIRECTORY));
                }
                entry
            }
            None if flags.contains(OpenFlags::CREATE) => {
                let (parent, name) = self.find_parent(path)?;
                let entry = Entry::file(Vec::new());
                lock(&parent)
                    .children
                    .as_mut()
                    .ok_or_else(not_a_dir(path))?
                    .insert(name, entry.clone());
                entry
            }
            None => return Err(FileOperationError::new(path, fs::NO_SUCH_FILE)),
        };

        let mut position = 0;
        {
            let mut guard = lock(&entry);
            let contents = guard.contents.get_or_insert_with(Vec::new);
            if flags.contains(OpenFlags::TRUNCATE) {
                contents.clear();
            } else if flags.contains(OpenFlags::APPEND) {
                position = contents.len() as u64;
            }
        }
        Ok(Box::new(EntryChannel { entry, position, writable: true }))
    }

    fn remaining_space(&self) -> Result<u64, FileOperationError> {
        if self.capacity == 0 {
            Ok(u64::MAX)
        } else {
            Ok(self.capacity.saturating_sub(self.used_space()))
        }
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

struct EntryChannel {
    entry: EntryRef,
    position: u64,
    writable: bool,
}

impl Read for EntryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let guard = lock(&self.entry);
        let contents = guard
            .contents
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, fs::NOT_A_FILE))?;
        let start = (self.position as usize).min(contents.len());
        let n = (contents.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&contents[start..start + n]);
        drop(guard);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for EntryChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if !self.writable {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, fs::ACCESS_DENIED));
        }
        let mut guard = lock(&self.entry);
        let contents = guard
            .contents
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, fs::NOT_A_FILE))?;
        let start = self.position as usize;
        if start > contents.len() {
            contents.resize(start, 0);
        }
        let overlap = (contents.len() - start).min(buf.len());
        contents[start..start + overlap].copy_from_slice(&buf[..overlap]);
        contents.extend_from_slice(&buf[overlap..]);
        guard.modified = SystemTime::now();
        drop(guard);
        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for EntryChannel {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = {
            let guard = lock(&self.entry);
            guard.contents.as_ref().map_or(0, |c| c.len() as i64)
        };
        let target = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::End(n) => len + n,
            SeekFrom::Current(n) => self.position as i64 + n,
        };
        if target < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}

fn lock(entry: &EntryRef) -> MutexGuard<'_, Entry> {
    match entry.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn no_such_file(path: &str) -> impl FnOnce() -> FileOperationError + '_ {
    move || FileOperationError::new(path, fs::NO_SUCH_FILE)
}

fn not_a_dir(path: &str) -> impl FnOnce() -> FileOperationError + '_ {
    move || FileOperationError::new(path, fs::NOT_A_DIRECTORY)
}
