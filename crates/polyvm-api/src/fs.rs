//! Mount contracts shared between the filesystem core and host-supplied
//! backends.
//!
//! A [`Mount`] is a read-only file tree; [`WritableMount`] extends it with the
//! mutating half. All paths handed to a mount are local, `/`-separated and
//! already sanitized by the filesystem layer (no `..`, no leading slash, `""`
//! meaning the mount root).

use std::io::{self, Read, Seek, Write};
use std::time::SystemTime;

use thiserror::Error;

/// The minimum size of a file or directory for quota accounting, in bytes.
///
/// Charging a floor per entry stops many tiny files from bypassing capacity
/// tracking.
pub const MINIMUM_FILE_SIZE: u64 = 500;

pub const NO_SUCH_FILE: &str = "No such file";
pub const NOT_A_FILE: &str = "Not a file";
pub const NOT_A_DIRECTORY: &str = "Not a directory";
pub const FILE_EXISTS: &str = "File exists";
pub const ACCESS_DENIED: &str = "Access denied";
pub const OUT_OF_SPACE: &str = "Out of space";
pub const UNSUPPORTED_MODE: &str = "Unsupported mode";
pub const CANNOT_WRITE_TO_DIRECTORY: &str = "Cannot write to directory";
pub const TOO_MANY_FILES: &str = "Too many files already open";

bitflags::bitflags! {
    /// Flags for opening a file, mirroring the standard open semantics.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const TRUNCATE = 1 << 3;
        const CREATE = 1 << 4;
    }
}

impl OpenFlags {
    /// The default flag set for `open_for_write`: truncate-or-create.
    pub const WRITE_DEFAULTS: OpenFlags = OpenFlags::WRITE
        .union(OpenFlags::CREATE)
        .union(OpenFlags::TRUNCATE);

    /// The default flag set for appending.
    pub const APPEND_DEFAULTS: OpenFlags = OpenFlags::WRITE
        .union(OpenFlags::CREATE)
        .union(OpenFlags::APPEND);

    /// Check this is a supported combination of flags.
    ///
    /// A file must be opened for reading or writing, appending requires
    /// writing, and appending to a truncated file makes no sense.
    pub fn validate(self) -> Result<(), FileOperationError> {
        let ok = self.intersects(OpenFlags::READ | OpenFlags::WRITE)
            && (!self.contains(OpenFlags::APPEND) || self.contains(OpenFlags::WRITE))
            && !(self.contains(OpenFlags::APPEND) && self.contains(OpenFlags::TRUNCATE))
            && (!self.contains(OpenFlags::CREATE) || self.contains(OpenFlags::WRITE));
        if ok {
            Ok(())
        } else {
            Err(FileOperationError::general(UNSUPPORTED_MODE))
        }
    }
}

/// Basic attributes of a file or directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    pub is_directory: bool,
    pub size: u64,
    pub created: Option<SystemTime>,
    pub modified: Option<SystemTime>,
}

impl FileAttributes {
    pub fn new(is_directory: bool, size: u64) -> Self {
        FileAttributes { is_directory, size, created: None, modified: None }
    }

    pub fn with_times(
        is_directory: bool,
        size: u64,
        created: Option<SystemTime>,
        modified: Option<SystemTime>,
    ) -> Self {
        FileAttributes { is_directory, size, created, modified }
    }
}

/// A failed filesystem operation.
///
/// The reason is always one of the short constants in this module: host
/// `io::Error` text is remapped via [`remap_io_error`] and never reaches the
/// sandboxed side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FileOperationError {
    /// An error referring to a specific path.
    #[error("/{path}: {message}")]
    Located { path: String, message: String },
    /// An error with no useful path attached.
    #[error("{message}")]
    General { message: String },
}

impl FileOperationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        FileOperationError::Located { path: path.into(), message: message.into() }
    }

    pub fn general(message: impl Into<String>) -> Self {
        FileOperationError::General { message: message.into() }
    }

    pub fn path(&self) -> Option<&str> {
        match self {
            FileOperationError::Located { path, .. } => Some(path),
            FileOperationError::General { .. } => None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            FileOperationError::Located { message, .. } => message,
            FileOperationError::General { message } => message,
        }
    }

    /// Attach a path to a general error, leaving located errors untouched.
    pub fn or_located(self, path: &str) -> Self {
        match self {
            FileOperationError::General { message } => FileOperationError::new(path, message),
            located => located,
        }
    }
}

/// Remap a host I/O error onto the closed reason set, dropping any
/// host-specific text (which may leak install paths).
pub fn remap_io_error(path: &str, error: &io::Error) -> FileOperationError {
    let message = match error.kind() {
        io::ErrorKind::NotFound => NO_SUCH_FILE,
        io::ErrorKind::AlreadyExists => FILE_EXISTS,
        io::ErrorKind::PermissionDenied => ACCESS_DENIED,
        _ => ACCESS_DENIED,
    };
    FileOperationError::new(path, message)
}

/// A seekable byte channel over an open file.
///
/// Read-only channels implement `Write` by failing, matching the behaviour of
/// non-writable channels elsewhere.
pub trait SeekableChannel: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send + ?Sized> SeekableChannel for T {}

impl std::fmt::Debug for dyn SeekableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SeekableChannel")
    }
}

/// A read-only file tree.
pub trait Mount: Send + Sync {
    fn exists(&self, path: &str) -> Result<bool, FileOperationError>;

    fn is_directory(&self, path: &str) -> Result<bool, FileOperationError>;

    /// Append the names of this directory's children to `contents`.
    fn list(&self, path: &str, contents: &mut Vec<String>) -> Result<(), FileOperationError>;

    /// The size of a file in bytes, or 0 for directories.
    fn size(&self, path: &str) -> Result<u64, FileOperationError>;

    fn attributes(&self, path: &str) -> Result<FileAttributes, FileOperationError>;

    fn open_for_read(&self, path: &str) -> Result<Box<dyn SeekableChannel>, FileOperationError>;
}

/// A file tree which can also be written to.
pub trait WritableMount: Mount {
    fn is_read_only(&self, path: &str) -> Result<bool, FileOperationError>;

    fn make_directory(&self, path: &str) -> Result<(), FileOperationError>;

    fn delete(&self, path: &str) -> Result<(), FileOperationError>;

    fn rename(&self, source: &str, dest: &str) -> Result<(), FileOperationError>;

    /// Open a file with an explicit set of flags. Unsupported combinations
    /// are rejected with [`UNSUPPORTED_MODE`].
    fn open_file(
        &self,
        path: &str,
        flags: OpenFlags,
    ) -> Result<Box<dyn SeekableChannel>, FileOperationError>;

    /// Space remaining before this mount hits its capacity, in bytes.
    fn remaining_space(&self) -> Result<u64, FileOperationError>;

    /// The total capacity of this mount, in bytes.
    fn capacity(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_defaults_are_valid() {
        OpenFlags::WRITE_DEFAULTS.validate().unwrap();
        OpenFlags::APPEND_DEFAULTS.validate().unwrap();
        OpenFlags::READ.validate().unwrap();
    }

    #[test]
    fn invalid_flag_combinations_are_rejected() {
        assert!(OpenFlags::empty().validate().is_err());
        assert!(OpenFlags::APPEND.validate().is_err());
        assert!((OpenFlags::WRITE | OpenFlags::APPEND | OpenFlags::TRUNCATE)
            .validate()
            .is_err());
        assert!((OpenFlags::CREATE | OpenFlags::READ).validate().is_err());
    }

    #[test]
    fn io_errors_remap_to_closed_set() {
        let err = io::Error::new(io::ErrorKind::NotFound, "/secret/host/path missing");
        let remapped = remap_io_error("disk/file", &err);
        assert_eq!(remapped.message(), NO_SUCH_FILE);
        assert_eq!(remapped.to_string(), "/disk/file: No such file");

        let err = io::Error::other("ENOSPC or something host specific");
        assert_eq!(remap_io_error("x", &err).message(), ACCESS_DENIED);
    }
}
