//! Entry enumeration for a transfer request.
//!
//! Each selected entry is listed into its own `SourceEntry` tree. An entry
//! that disappears before it can be listed is reported and dropped from the
//! transfer; the remaining entries carry on.

use crate::error::EngineError;
use crate::fs_ops::Filesystem;
use crate::model::{SourceEntry, TransferRequest};

/// The enumerated selection.
#[derive(Debug, Default)]
pub struct Enumeration {
    /// One tree per selected entry that could be listed, in selection order
    pub roots: Vec<SourceEntry>,
    /// Entries (top-level or nested) that could not be listed
    pub errors: Vec<EngineError>,
}

impl Enumeration {
    pub fn file_count(&self) -> usize {
        self.roots.iter().map(SourceEntry::file_count).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.roots.iter().map(SourceEntry::total_bytes).sum()
    }

    /// Every file across all roots, in tree order.
    pub fn files(&self) -> Vec<&SourceEntry> {
        self.roots.iter().flat_map(|root| root.files()).collect()
    }
}

/// Enumerate every selected entry of `request`.
pub fn enumerate_selection(fs: &dyn Filesystem, request: &TransferRequest) -> Enumeration {
    let mut enumeration = Enumeration::default();

    for selected in request.selected() {
        match fs.enumerate(request.source_root(), selected) {
            Ok(listing) => {
                for skipped in &listing.skipped {
                    tracing::warn!(error = %skipped, "Entry vanished during enumeration");
                }
                enumeration.errors.extend(listing.skipped);
                enumeration.roots.push(listing.entry);
            }
            Err(e) => {
                tracing::warn!(
                    entry = %selected.display(),
                    error = %e,
                    "Selected entry excluded from transfer"
                );
                enumeration.errors.push(e);
            }
        }
    }

    tracing::debug!(
        roots = enumeration.roots.len(),
        files = enumeration.file_count(),
        bytes = enumeration.total_bytes(),
        "Enumeration finished"
    );

    enumeration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops::LocalFilesystem;
    use crate::model::{OperationKind, PolicyMode};
    use std::fs;
    use std::path::PathBuf;

    #[test]
    fn test_vanished_entry_is_reported_and_excluded() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir(&src).expect("Failed to create src dir");
        fs::write(src.join("a_allowed.jpg"), b"aaaa").expect("Failed to write file");
        fs::write(src.join("gone.jpg"), b"bb").expect("Failed to write file");

        let request = TransferRequest::new(
            &src,
            &temp_dir.path().join("dst"),
            vec![PathBuf::from("a_allowed.jpg"), PathBuf::from("gone.jpg")],
            OperationKind::Copy,
            PolicyMode::Blocking,
        )
        .expect("Failed to create request");

        fs::remove_file(src.join("gone.jpg")).expect("Failed to delete file");

        let enumeration = enumerate_selection(&LocalFilesystem, &request);
        assert_eq!(enumeration.roots.len(), 1);
        assert_eq!(enumeration.errors.len(), 1);
        assert!(enumeration.errors[0].is_not_found());
        assert_eq!(enumeration.total_bytes(), 4);
    }

    #[test]
    fn test_directories_keep_relative_structure() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp_dir.path().join("src");
        fs::create_dir_all(src.join("album").join("2023")).expect("Failed to create dirs");
        fs::write(src.join("album").join("2023").join("x.png"), b"x").expect("write");

        let request = TransferRequest::new(
            &src,
            &temp_dir.path().join("dst"),
            vec![PathBuf::from("album")],
            OperationKind::Copy,
            PolicyMode::Blocking,
        )
        .expect("Failed to create request");

        let enumeration = enumerate_selection(&LocalFilesystem, &request);
        let files = enumeration.files();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, PathBuf::from("album").join("2023").join("x.png"));
    }
}
