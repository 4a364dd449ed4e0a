//! Core data model for guarded transfers.
//!
//! This module defines the data structures shared by every stage:
//! - TransferRequest: one copy/move operation under a policy mode
//! - SourceEntry: the enumerated tree of selected entries
//! - Verdict / VerdictSet: per-file scan results, write-once
//! - FileItem: a single file the executor delivers (or not)
//! - UserDecision: the answer to a warning review

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// The operation a transfer performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationKind {
    /// Copy files; source remains unchanged
    Copy,
    /// Move files; a source file is deleted once it has been delivered
    Move,
}

impl OperationKind {
    /// Capitalized noun used in messages ("Copy", "Move").
    pub fn noun(&self) -> &'static str {
        match self {
            OperationKind::Copy => "Copy",
            OperationKind::Move => "Move",
        }
    }

    /// Lowercase gerund used in messages ("copying", "moving").
    pub fn gerund(&self) -> &'static str {
        match self {
            OperationKind::Copy => "copying",
            OperationKind::Move => "moving",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Copy => write!(f, "copy"),
            OperationKind::Move => write!(f, "move"),
        }
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "copy" => Ok(OperationKind::Copy),
            "move" => Ok(OperationKind::Move),
            other => Err(format!("invalid operation '{other}', expected 'copy' or 'move'")),
        }
    }
}

/// How scan verdicts affect the transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyMode {
    /// Blocked files are withheld, warnings need review
    #[default]
    Blocking,
    /// Everything is transferred; verdicts only feed the audit report
    ReportOnly,
}

impl fmt::Display for PolicyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyMode::Blocking => write!(f, "blocking"),
            PolicyMode::ReportOnly => write!(f, "report-only"),
        }
    }
}

impl FromStr for PolicyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blocking" | "block" => Ok(PolicyMode::Blocking),
            "report-only" | "report_only" | "report" => Ok(PolicyMode::ReportOnly),
            other => Err(format!(
                "invalid policy mode '{other}', expected 'blocking' or 'report-only'"
            )),
        }
    }
}

/// A single guarded transfer.
///
/// Immutable once created. The policy mode is resolved here, once, and the
/// rest of the engine only ever reads it from the request.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    id: Uuid,
    source_root: PathBuf,
    destination: PathBuf,
    selected: Vec<PathBuf>,
    operation: OperationKind,
    policy_mode: PolicyMode,
    created_at: DateTime<Utc>,
}

impl TransferRequest {
    /// Create a new transfer request.
    ///
    /// `selected` holds the user-selected entries, relative to `source_root`.
    /// `.` components are stripped; duplicates and entries nested under
    /// another selected entry are dropped.
    ///
    /// # Errors
    /// Returns EngineError if the source root is missing or not a directory,
    /// the destination is empty, nothing is selected, or a selected entry
    /// escapes the source root.
    pub fn new<P: AsRef<Path>, D: AsRef<Path>>(
        source_root: P,
        destination: D,
        selected: Vec<PathBuf>,
        operation: OperationKind,
        policy_mode: PolicyMode,
    ) -> Result<Self, EngineError> {
        let source_root = source_root.as_ref();
        let destination = destination.as_ref();

        match std::fs::metadata(source_root) {
            Ok(metadata) => {
                if !metadata.is_dir() {
                    return Err(EngineError::InvalidRequest {
                        path: source_root.to_path_buf(),
                        reason: "source root must be a directory".to_string(),
                    });
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::SourceNotFound {
                    path: source_root.to_path_buf(),
                });
            }
            Err(e) => {
                return Err(EngineError::Enumeration {
                    path: source_root.to_path_buf(),
                    source: e,
                });
            }
        }

        if destination.as_os_str().is_empty() {
            return Err(EngineError::InvalidRequest {
                path: destination.to_path_buf(),
                reason: "destination path is empty".to_string(),
            });
        }

        if selected.is_empty() {
            return Err(EngineError::InvalidRequest {
                path: source_root.to_path_buf(),
                reason: "no entries selected".to_string(),
            });
        }

        let mut normalized = Vec::with_capacity(selected.len());
        for entry in &selected {
            match normalize_selection(entry) {
                Some(path) => normalized.push(path),
                None => {
                    return Err(EngineError::InvalidRequest {
                        path: entry.clone(),
                        reason: "selected entries must be relative to the source root".to_string(),
                    });
                }
            }
        }
        let selected = collapse_overlapping(normalized);

        Ok(TransferRequest {
            id: Uuid::new_v4(),
            source_root: source_root.to_path_buf(),
            destination: destination.to_path_buf(),
            selected,
            operation,
            policy_mode,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Selected top-level entries, relative to the source root.
    pub fn selected(&self) -> &[PathBuf] {
        &self.selected
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn policy_mode(&self) -> PolicyMode {
        self.policy_mode
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Strip `.` components. `None` if the entry escapes or names the root itself.
fn normalize_selection(path: &Path) -> Option<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if normalized.as_os_str().is_empty() {
        None
    } else {
        Some(normalized)
    }
}

/// Drop duplicates and entries nested under another selected entry, keeping
/// the first-seen order of the survivors.
fn collapse_overlapping(selected: Vec<PathBuf>) -> Vec<PathBuf> {
    let mut kept: Vec<PathBuf> = Vec::with_capacity(selected.len());
    for entry in &selected {
        let covered = selected
            .iter()
            .any(|other| other != entry && entry.starts_with(other));
        if !covered && !kept.contains(entry) {
            kept.push(entry.clone());
        }
    }
    kept
}

/// Whether an entry is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One node of the enumerated source tree.
///
/// `path` is relative to the request's source root; it is what the executor
/// uses to rebuild the layout under the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceEntry {
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Size in bytes (0 for directories)
    pub size: u64,
    pub children: Vec<SourceEntry>,
}

impl SourceEntry {
    /// A file leaf.
    pub fn file(path: impl Into<PathBuf>, size: u64) -> Self {
        SourceEntry {
            path: path.into(),
            kind: EntryKind::File,
            size,
            children: Vec::new(),
        }
    }

    /// A directory node with the given children.
    pub fn directory(path: impl Into<PathBuf>, children: Vec<SourceEntry>) -> Self {
        SourceEntry {
            path: path.into(),
            kind: EntryKind::Directory,
            size: 0,
            children,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Final path component, lossily converted.
    pub fn name(&self) -> String {
        display_name(&self.path)
    }

    /// All file descendants (or the entry itself if it is a file), depth first.
    pub fn files(&self) -> Vec<&SourceEntry> {
        let mut out = Vec::new();
        self.collect_files(&mut out);
        out
    }

    fn collect_files<'a>(&'a self, out: &mut Vec<&'a SourceEntry>) {
        match self.kind {
            EntryKind::File => out.push(self),
            EntryKind::Directory => {
                for child in &self.children {
                    child.collect_files(out);
                }
            }
        }
    }

    /// All directory nodes including this one, parents before children.
    pub fn directories(&self) -> Vec<&SourceEntry> {
        let mut out = Vec::new();
        if self.is_dir() {
            out.push(self);
            for child in &self.children {
                out.extend(child.directories());
            }
        }
        out
    }

    pub fn file_count(&self) -> usize {
        self.files().len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files().iter().map(|f| f.size).sum()
    }

    /// True if `path` is this entry or lies beneath it.
    pub fn covers(&self, path: &Path) -> bool {
        path.starts_with(&self.path)
    }
}

/// Final path component of `path` as a display string.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Scan verdict for a single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allowed,
    Warned,
    Blocked,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allowed => write!(f, "allowed"),
            Verdict::Warned => write!(f, "warned"),
            Verdict::Blocked => write!(f, "blocked"),
        }
    }
}

/// Verdicts keyed by relative file path.
///
/// A verdict can be recorded once per path and never changed afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerdictSet {
    verdicts: BTreeMap<PathBuf, Verdict>,
}

impl VerdictSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the verdict for `path`.
    ///
    /// # Errors
    /// Returns `VerdictAlreadyAssigned` if the path already carries a verdict;
    /// the existing verdict is kept.
    pub fn record(&mut self, path: impl Into<PathBuf>, verdict: Verdict) -> Result<(), EngineError> {
        let path = path.into();
        if self.verdicts.contains_key(&path) {
            return Err(EngineError::VerdictAlreadyAssigned { path });
        }
        self.verdicts.insert(path, verdict);
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<Verdict> {
        self.verdicts.get(path).copied()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.verdicts.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, Verdict)> {
        self.verdicts.iter().map(|(p, v)| (p, *v))
    }

    /// Paths carrying `verdict`, in path order.
    pub fn paths_with(&self, verdict: Verdict) -> Vec<PathBuf> {
        self.verdicts
            .iter()
            .filter(|(_, v)| **v == verdict)
            .map(|(p, _)| p.clone())
            .collect()
    }
}

/// A single file the executor is asked to deliver.
#[derive(Debug, Clone)]
pub struct FileItem {
    /// Unique identifier for this file within the transfer
    pub id: Uuid,

    /// Path relative to the source root
    pub relative_path: PathBuf,

    /// Full source path
    pub source_path: PathBuf,

    /// Full destination path
    pub destination_path: PathBuf,

    /// File size in bytes
    pub file_size: u64,

    /// Current state of this file
    pub state: FileState,

    /// OS error code if state is Failed
    pub error_code: Option<u32>,

    /// Human-readable error message
    pub error_message: Option<String>,
}

impl FileItem {
    /// Build an item for `entry`, mapping it under both roots.
    pub fn for_entry(entry: &SourceEntry, source_root: &Path, destination_root: &Path) -> Self {
        FileItem {
            id: Uuid::new_v4(),
            relative_path: entry.path.clone(),
            source_path: source_root.join(&entry.path),
            destination_path: destination_root.join(&entry.path),
            file_size: entry.size,
            state: FileState::Pending,
            error_code: None,
            error_message: None,
        }
    }

    pub fn name(&self) -> String {
        display_name(&self.relative_path)
    }
}

/// The state of an individual file within a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Not yet processed
    Pending,
    /// Currently transferring
    Copying,
    /// Written to the destination (and removed from source for a move)
    Delivered,
    /// Withheld by policy or by a cancelled review
    Excluded,
    /// I/O error occurred; file not delivered
    Failed,
}

impl FileState {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FileState::Delivered | FileState::Excluded | FileState::Failed
        )
    }
}

/// What the user chose when asked to review warned files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    Proceed,
    Cancel,
}

/// Answer to a warning review. Consumed once by the decision engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDecision {
    pub action: ReviewAction,
    pub justification: Option<String>,
}

impl UserDecision {
    pub fn proceed(justification: Option<String>) -> Self {
        UserDecision {
            action: ReviewAction::Proceed,
            justification: justification.filter(|j| !j.trim().is_empty()),
        }
    }

    pub fn cancel() -> Self {
        UserDecision {
            action: ReviewAction::Cancel,
            justification: None,
        }
    }
}

/// How a transfer ended, as reported to the host and the audit sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferResultKind {
    /// Every considered file was delivered
    Completed,
    /// Some files were withheld by policy or failed to transfer
    PolicyBlocked,
    /// The warning review was cancelled; nothing was transferred
    UserCancelled,
    /// The destination lacks space; nothing was transferred
    NoSpace,
}

impl fmt::Display for TransferResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransferResultKind::Completed => "completed",
            TransferResultKind::PolicyBlocked => "policy_blocked",
            TransferResultKind::UserCancelled => "user_cancelled",
            TransferResultKind::NoSpace => "no_space",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tree() -> SourceEntry {
        SourceEntry::directory(
            "docs",
            vec![
                SourceEntry::file("docs/a.txt", 3),
                SourceEntry::directory("docs/sub", vec![SourceEntry::file("docs/sub/b.txt", 4)]),
            ],
        )
    }

    #[test]
    fn test_files_are_flattened_depth_first() {
        let tree = sample_tree();
        let files: Vec<_> = tree.files().iter().map(|f| f.path.clone()).collect();
        assert_eq!(
            files,
            vec![PathBuf::from("docs/a.txt"), PathBuf::from("docs/sub/b.txt")]
        );
        assert_eq!(tree.total_bytes(), 7);
        assert_eq!(tree.directories().len(), 2);
    }

    #[test]
    fn test_verdict_is_write_once() {
        let mut verdicts = VerdictSet::new();
        verdicts.record("a.txt", Verdict::Allowed).expect("first record");
        let second = verdicts.record("a.txt", Verdict::Blocked);
        assert!(matches!(second, Err(EngineError::VerdictAlreadyAssigned { .. })));
        assert_eq!(verdicts.get(Path::new("a.txt")), Some(Verdict::Allowed));
    }

    #[test]
    fn test_request_rejects_escaping_selection() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = TransferRequest::new(
            temp_dir.path(),
            temp_dir.path().join("dst"),
            vec![PathBuf::from("../outside.txt")],
            OperationKind::Copy,
            PolicyMode::Blocking,
        );
        assert!(matches!(result, Err(EngineError::InvalidRequest { .. })));
    }

    #[test]
    fn test_request_collapses_overlapping_selection() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let request = TransferRequest::new(
            temp_dir.path(),
            temp_dir.path().join("dst"),
            vec![
                PathBuf::from("photos/a.jpg"),
                PathBuf::from("notes.txt"),
                PathBuf::from("photos"),
                PathBuf::from("notes.txt"),
                PathBuf::from("photos/raw/b.cr2"),
            ],
            OperationKind::Move,
            PolicyMode::Blocking,
        )
        .expect("Failed to create request");

        assert_eq!(
            request.selected(),
            &[PathBuf::from("notes.txt"), PathBuf::from("photos")]
        );
    }

    #[test]
    fn test_request_strips_current_dir_components() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let request = TransferRequest::new(
            temp_dir.path(),
            temp_dir.path().join("dst"),
            vec![PathBuf::from("./photos"), PathBuf::from("docs/./a.txt")],
            OperationKind::Copy,
            PolicyMode::Blocking,
        )
        .expect("Failed to create request");

        assert_eq!(
            request.selected(),
            &[PathBuf::from("photos"), PathBuf::from("docs/a.txt")]
        );

        let root_only = TransferRequest::new(
            temp_dir.path(),
            temp_dir.path().join("dst"),
            vec![PathBuf::from(".")],
            OperationKind::Copy,
            PolicyMode::Blocking,
        );
        assert!(matches!(root_only, Err(EngineError::InvalidRequest { .. })));
    }

    #[test]
    fn test_request_rejects_missing_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = TransferRequest::new(
            temp_dir.path().join("nonexistent"),
            temp_dir.path().join("dst"),
            vec![PathBuf::from("a.txt")],
            OperationKind::Copy,
            PolicyMode::Blocking,
        );
        assert!(matches!(result, Err(EngineError::SourceNotFound { .. })));
    }

    #[test]
    fn test_request_rejects_file_as_source() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("file.txt");
        std::fs::File::create(&file).expect("Failed to create file");
        let result = TransferRequest::new(
            &file,
            &temp_dir.path().join("dst"),
            vec![PathBuf::from("a.txt")],
            OperationKind::Move,
            PolicyMode::ReportOnly,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_modes() {
        assert_eq!("Move".parse::<OperationKind>(), Ok(OperationKind::Move));
        assert_eq!("report-only".parse::<PolicyMode>(), Ok(PolicyMode::ReportOnly));
        assert!("sideways".parse::<OperationKind>().is_err());
    }

    #[test]
    fn test_blank_justification_is_dropped() {
        let decision = UserDecision::proceed(Some("   ".to_string()));
        assert_eq!(decision.justification, None);
    }
}
