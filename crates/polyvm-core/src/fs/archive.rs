//! A read-only mount over a zip archive.
//!
//! The entry tree is built eagerly from the central directory, so metadata
//! queries never touch the archive. File contents are decompressed lazily and
//! held in a process-wide cache, bounded by size and age, so hot files (rom
//! programs shared by many computers) are decompressed once.

use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use anyhow::Context;
use once_cell::sync::Lazy;
use polyvm_api::fs::{
    self, FileAttributes, FileOperationError, Mount, SeekableChannel,
};
use zip::ZipArchive;

use super::path;

/// Total bytes of decompressed archive contents kept in memory.
const MAX_CACHE_SIZE: usize = 64 << 20;

/// How long an unused cache entry survives.
const CACHE_EXPIRY: Duration = Duration::from_secs(60);

static CACHE: Lazy<Mutex<ContentsCache>> =
    Lazy::new(|| Mutex::new(ContentsCache::new(MAX_CACHE_SIZE, CACHE_EXPIRY)));

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(0);

pub struct ArchiveMount<R: Read + Seek + Send> {
    archive: Mutex<ZipArchive<R>>,
    root: Arc<FileEntry>,
}

struct FileEntry {
    /// Stable identity for the shared contents cache.
    cache_id: u64,
    /// Index into the archive, absent for synthesized directories.
    index: Option<usize>,
    size: u64,
    children: Option<HashMap<String, Arc<FileEntry>>>,
}

impl FileEntry {
    fn is_directory(&self) -> bool {
        self.children.is_some()
    }
}

impl<R: Read + Seek + Send> ArchiveMount<R> {
    /// Open a mount over the whole archive.
    pub fn new(reader: R) -> anyhow::Result<Self> {
        Self::new_at(reader, "")
    }

    /// Open a mount rooted at a directory inside the archive.
    pub fn new_at(reader: R, sub_path: &str) -> anyhow::Result<Self> {
        let mut archive = ZipArchive::new(reader).context("failed to read archive")?;

        let mut builder = TreeBuilder::default();
        for index in 0..archive.len() {
            let entry = archive.by_index(index).context("failed to read archive entry")?;
            let name = path::sanitize(entry.name());
            if name.is_empty() {
                continue;
            }
            builder.insert(&name, entry.is_dir(), index, entry.size());
        }

        let root = builder
            .freeze(&path::sanitize(sub_path))
            .with_context(|| format!("no such directory {sub_path:?} in archive"))?;
        Ok(ArchiveMount { archive: Mutex::new(archive), root })
    }

    fn find(&self, path: &str) -> Option<Arc<FileEntry>> {
        let mut current = self.root.clone();
        if path.is_empty() {
            return Some(current);
        }
        for segment in path.split('/') {
            let next = current.children.as_ref()?.get(segment)?.clone();
            current = next;
        }
        Some(current)
    }

    fn contents(&self, path: &str, entry: &Arc<FileEntry>) -> Result<Arc<[u8]>, FileOperationError> {
        if let Some(contents) = lock_cache().get(entry.cache_id) {
            return Ok(contents);
        }

        let index = entry.index.ok_or_else(|| FileOperationError::new(path, fs::NO_SUCH_FILE))?;
        let mut buffer = Vec::with_capacity(entry.size as usize);
        {
            let mut archive = match self.archive.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let mut file = archive
                .by_index(index)
                .map_err(|_| FileOperationError::new(path, fs::ACCESS_DENIED))?;
            file.read_to_end(&mut buffer)
                .map_err(|e| fs::remap_io_error(path, &e))?;
        }

        let contents: Arc<[u8]> = buffer.into();
        lock_cache().insert(entry.cache_id, contents.clone(), Arc::downgrade(entry));
        Ok(contents)
    }
}

impl<R: Read + Seek + Send> Mount for ArchiveMount<R> {
    fn exists(&self, path: &str) -> Result<bool, FileOperationError> {
        Ok(self.find(path).is_some())
    }

    fn is_directory(&self, path: &str) -> Result<bool, FileOperationError> {
        Ok(self.find(path).is_some_and(|e| e.is_directory()))
    }

    fn list(&self, path: &str, contents: &mut Vec<String>) -> Result<(), FileOperationError> {
        let entry = self.find(path).ok_or_else(|| FileOperationError::new(path, fs::NO_SUCH_FILE))?;
        let children = entry
            .children
            .as_ref()
            .ok_or_else(|| FileOperationError::new(path, fs::NOT_A_DIRECTORY))?;
        contents.extend(children.keys().cloned());
        Ok(())
    }

    fn size(&self, path: &str) -> Result<u64, FileOperationError> {
        let entry = self.find(path).ok_or_else(|| FileOperationError::new(path, fs::NO_SUCH_FILE))?;
        Ok(if entry.is_directory() { 0 } else { entry.size })
    }

    fn attributes(&self, path: &str) -> Result<FileAttributes, FileOperationError> {
        let entry = self.find(path).ok_or_else(|| FileOperationError::new(path, fs::NO_SUCH_FILE))?;
        Ok(FileAttributes::new(entry.is_directory(), if entry.is_directory() { 0 } else { entry.size }))
    }

    fn open_for_read(&self, path: &str) -> Result<Box<dyn SeekableChannel>, FileOperationError> {
        let entry = self.find(path).ok_or_else(|| FileOperationError::new(path, fs::NO_SUCH_FILE))?;
        if entry.is_directory() {
            return Err(FileOperationError::new(path, fs::NOT_A_FILE));
        }
        let contents = self.contents(path, &entry)?;
        Ok(Box::new(ArrayChannel { contents, position: 0 }))
    }
}

#[derive(Default)]
struct TreeBuilder {
    root: Node,
}

#[derive(Default)]
struct Node {
    index: Option<usize>,
    size: u64,
    is_dir: bool,
    children: HashMap<String, Node>,
}

impl TreeBuilder {
    fn insert(&mut self, name: &str, is_dir: bool, index: usize, size: u64) {
        let mut node = &mut self.root;
        for segment in name.split('/') {
            node.is_dir = true;
            node = node.children.entry(segment.to_owned()).or_default();
        }
        if is_dir {
            node.is_dir = true;
        } else {
            node.index = Some(index);
            node.size = size;
        }
    }

    fn freeze(mut self, sub_path: &str) -> Option<Arc<FileEntry>> {
        self.root.is_dir = true;
        let mut node = self.root;
        if !sub_path.is_empty() {
            for segment in sub_path.split('/') {
                node = node.children.remove(segment)?;
            }
            if !node.is_dir {
                return None;
            }
        }

        fn build(node: Node) -> Arc<FileEntry> {
            let children = if node.is_dir {
                Some(
                    node.children
                        .into_iter()
                        .map(|(name, child)| (name, build(child)))
                        .collect(),
                )
            } else {
                None
            };
            Arc::new(FileEntry {
                cache_id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
                index: node.index,
                size: node.size,
                children,
            })
        }
        Some(build(node))
    }
}

/// A read-only channel over shared bytes.
struct ArrayChannel {
    contents: Arc<[u8]>,
    position: u64,
}

impl Read for ArrayChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = (self.position as usize).min(self.contents.len());
        let n = (self.contents.len() - start).min(buf.len());
        buf[..n].copy_from_slice(&self.contents[start..start + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Write for ArrayChannel {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::PermissionDenied, fs::ACCESS_DENIED))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for ArrayChannel {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.contents.len() as i64;
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

struct ContentsCache {
    capacity: usize,
    expiry: Duration,
    total: usize,
    entries: HashMap<u64, CacheEntry>,
}

struct CacheEntry {
    contents: Arc<[u8]>,
    last_access: Instant,
    /// Dropping the mount drops its tree, making this dead and the entry
    /// collectable.
    live: Weak<FileEntry>,
}

impl ContentsCache {
    fn new(capacity: usize, expiry: Duration) -> Self {
        ContentsCache { capacity, expiry, total: 0, entries: HashMap::new() }
    }

    fn get(&mut self, id: u64) -> Option<Arc<[u8]>> {
        self.prune();
        let entry = self.entries.get_mut(&id)?;
        entry.last_access = Instant::now();
        Some(entry.contents.clone())
    }

    fn insert(&mut self, id: u64, contents: Arc<[u8]>, live: Weak<FileEntry>) {
        self.prune();
        self.total += contents.len();
        self.entries
            .insert(id, CacheEntry { contents, last_access: Instant::now(), live });

        // Evict least-recently-used until back under capacity.
        while self.total > self.capacity && self.entries.len() > 1 {
            let oldest = self
                .entries
                .iter()
                .filter(|(&key, _)| key != id)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(&key, _)| key);
            match oldest {
                Some(key) => self.remove(key),
                None => break,
            }
        }
    }

    fn prune(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| {
                e.live.strong_count() == 0 || now.duration_since(e.last_access) >= self.expiry
            })
            .map(|(&key, _)| key)
            .collect();
        for key in expired {
            self.remove(key);
        }
    }

    fn remove(&mut self, id: u64) {
        if let Some(entry) = self.entries.remove(&id) {
            self.total -= entry.contents.len();
        }
    }

    #[cfg(test)]
    fn clear(&mut self) {
        self.entries.clear();
        self.total = 0;
    }
}

fn lock_cache() -> std::sync::MutexGuard<'static, ContentsCache> {
    match CACHE.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
