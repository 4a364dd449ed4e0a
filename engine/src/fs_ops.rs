//! Filesystem operations module.
//!
//! The engine never touches the disk directly; it goes through the
//! [`Filesystem`] trait so hosts can plug in remote volumes, and tests can
//! inject failures. [`LocalFilesystem`] is the std-backed implementation:
//! - Enumerating a selected entry into a `SourceEntry` tree
//! - Copying files with modification time preservation
//! - Creating parent directories lazily, right before a file is written
//! - Reporting free space of the volume holding a destination

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sysinfo::Disks;

use crate::error::EngineError;
use crate::model::SourceEntry;

/// Result of listing one selected entry.
#[derive(Debug)]
pub struct Listing {
    pub entry: SourceEntry,
    /// Children that vanished or could not be read while listing
    pub skipped: Vec<EngineError>,
}

/// Filesystem primitives consumed by the engine.
pub trait Filesystem: Send + Sync {
    /// List `root/relative` recursively. Paths in the returned tree are
    /// relative to `root`.
    ///
    /// # Errors
    /// Returns `EngineError::Enumeration` if the entry itself cannot be read.
    fn enumerate(&self, root: &Path, relative: &Path) -> Result<Listing, EngineError>;

    /// Copy `src` to `dst`, creating `dst`'s parent if needed. Returns bytes copied.
    fn copy_file(&self, src: &Path, dst: &Path) -> Result<u64, EngineError>;

    fn delete_file(&self, path: &Path) -> Result<(), EngineError>;

    /// Remove `path` if it is an empty directory. Returns whether it was removed.
    fn remove_empty_dir(&self, path: &Path) -> Result<bool, EngineError>;

    /// Bytes available on the volume that holds (or will hold) `path`.
    fn free_space(&self, path: &Path) -> Result<u64, EngineError>;
}

/// Filesystem backed by `std::fs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    pub fn new() -> Self {
        LocalFilesystem
    }
}

impl Filesystem for LocalFilesystem {
    fn enumerate(&self, root: &Path, relative: &Path) -> Result<Listing, EngineError> {
        let full = root.join(relative);
        let metadata = fs::metadata(&full).map_err(|e| EngineError::Enumeration {
            path: relative.to_path_buf(),
            source: e,
        })?;

        let mut skipped = Vec::new();
        let entry = if metadata.is_dir() {
            let children = list_children(&full, relative, &mut skipped)?;
            SourceEntry::directory(relative, children)
        } else {
            SourceEntry::file(relative, metadata.len())
        };

        Ok(Listing { entry, skipped })
    }

    fn copy_file(&self, src: &Path, dst: &Path) -> Result<u64, EngineError> {
        copy_file_with_metadata(src, dst)
    }

    fn delete_file(&self, path: &Path) -> Result<(), EngineError> {
        fs::remove_file(path).map_err(|e| EngineError::Delete {
            path: path.to_path_buf(),
            source: e,
        })
    }

    fn remove_empty_dir(&self, path: &Path) -> Result<bool, EngineError> {
        match fs::read_dir(path) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(EngineError::Delete {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        }

        fs::remove_dir(path).map_err(|e| EngineError::Delete {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(true)
    }

    fn free_space(&self, path: &Path) -> Result<u64, EngineError> {
        let probe = existing_ancestor(path).ok_or_else(|| EngineError::FreeSpaceUnavailable {
            path: path.to_path_buf(),
            reason: "no existing ancestor".to_string(),
        })?;
        let probe = probe
            .canonicalize()
            .map_err(|e| EngineError::FreeSpaceUnavailable {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let disks = Disks::new_with_refreshed_list();
        disks
            .iter()
            .filter(|disk| probe.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| EngineError::FreeSpaceUnavailable {
                path: path.to_path_buf(),
                reason: "no mounted volume contains the destination".to_string(),
            })
    }
}

fn list_children(
    dir: &Path,
    relative: &Path,
    skipped: &mut Vec<EngineError>,
) -> Result<Vec<SourceEntry>, EngineError> {
    let entries = fs::read_dir(dir).map_err(|e| EngineError::Enumeration {
        path: relative.to_path_buf(),
        source: e,
    })?;

    let mut children = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                skipped.push(EngineError::Enumeration {
                    path: relative.to_path_buf(),
                    source: e,
                });
                continue;
            }
        };

        let child_relative = relative.join(entry.file_name());

        // The entry may have been deleted between read_dir and metadata.
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                skipped.push(EngineError::Enumeration {
                    path: child_relative,
                    source: e,
                });
                continue;
            }
        };

        if metadata.is_dir() {
            match list_children(&entry.path(), &child_relative, skipped) {
                Ok(grandchildren) => {
                    children.push(SourceEntry::directory(child_relative, grandchildren));
                }
                Err(e) => skipped.push(e),
            }
        } else {
            children.push(SourceEntry::file(child_relative, metadata.len()));
        }
    }

    children.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(children)
}

fn existing_ancestor(path: &Path) -> Option<PathBuf> {
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            return Some(candidate.to_path_buf());
        }
        current = candidate.parent();
    }
    None
}

/// Copy a file from source to destination with metadata preservation.
///
/// A partially written destination file is removed if the copy fails.
///
/// # Errors
/// Returns EngineError if the copy fails
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<u64, EngineError> {
    let mut src_file = fs::File::open(src).map_err(|e| EngineError::Read {
        path: src.to_path_buf(),
        source: e,
    })?;

    let src_mtime = src_file
        .metadata()
        .map_err(|e| EngineError::Read {
            path: src.to_path_buf(),
            source: e,
        })?
        .modified()
        .ok();

    ensure_parent_dir_exists(dst)?;
    let mut dst_file = fs::File::create(dst).map_err(|e| EngineError::Write {
        path: dst.to_path_buf(),
        source: e,
    })?;

    let bytes_copied = match io::copy(&mut src_file, &mut dst_file) {
        Ok(bytes) => bytes,
        Err(e) => {
            drop(dst_file);
            let _ = fs::remove_file(dst);
            return Err(if e.kind() == io::ErrorKind::PermissionDenied {
                EngineError::Write {
                    path: dst.to_path_buf(),
                    source: e,
                }
            } else {
                EngineError::Read {
                    path: src.to_path_buf(),
                    source: e,
                }
            });
        }
    };
    drop(dst_file);

    if let Some(mtime) = src_mtime {
        let _ = filetime::set_file_mtime(dst, filetime::FileTime::from_system_time(mtime));
    }

    Ok(bytes_copied)
}

/// Ensure the parent directory of a path exists, creating it if necessary.
///
/// # Errors
/// Returns EngineError if directory creation fails
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), EngineError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(EngineError::DirectoryCreation {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            fs::create_dir_all(parent).map_err(|e| EngineError::DirectoryCreation {
                path: parent.to_path_buf(),
                source: e,
            })
        }
        Err(e) => Err(EngineError::DirectoryCreation {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}
