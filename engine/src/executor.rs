//! Transfer executor.
//!
//! Delivers the authorized files of a transfer, rebuilding the relative
//! layout recorded by the enumerator under the destination:
//! - A file's parent directory is created right before the file is written,
//!   so subtrees without authorized files never appear at the destination
//! - A move deletes the source file only after its copy succeeded
//! - A failed file is recorded and the run continues with its siblings
//! - A cancel request stops the run between files

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::decision::Authorization;
use crate::error::EngineError;
use crate::fs_ops::Filesystem;
use crate::model::{FileItem, FileState, OperationKind, SourceEntry, TransferRequest};
use crate::progress::ProgressCallback;

/// Shared flag used to stop an executor run between files.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the executor did with every file of the transfer.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub files: Vec<FileItem>,
    pub bytes_delivered: u64,
    /// Source directories removed after a move emptied them
    pub pruned_directories: Vec<PathBuf>,
    pub cancelled: bool,
}

impl ExecutionReport {
    fn with_state(&self, state: FileState) -> Vec<&FileItem> {
        self.files.iter().filter(|f| f.state == state).collect()
    }

    pub fn delivered(&self) -> Vec<&FileItem> {
        self.with_state(FileState::Delivered)
    }

    pub fn excluded(&self) -> Vec<&FileItem> {
        self.with_state(FileState::Excluded)
    }

    pub fn failed(&self) -> Vec<&FileItem> {
        self.with_state(FileState::Failed)
    }

    /// Relative paths of delivered files.
    pub fn delivered_paths(&self) -> Vec<PathBuf> {
        self.delivered()
            .into_iter()
            .map(|f| f.relative_path.clone())
            .collect()
    }
}

/// Deliver the files `authorization` allows.
///
/// Files of `roots` that are not authorized are marked `Excluded` and left
/// untouched at the source.
pub fn execute(
    fs: &dyn Filesystem,
    request: &TransferRequest,
    roots: &[SourceEntry],
    authorization: &Authorization,
    progress: Option<&dyn ProgressCallback>,
    cancel: &CancelToken,
) -> ExecutionReport {
    let mut report = ExecutionReport {
        files: roots
            .iter()
            .flat_map(|root| root.files())
            .map(|entry| FileItem::for_entry(entry, request.source_root(), request.destination()))
            .collect(),
        ..ExecutionReport::default()
    };

    let mut bytes_to_deliver = 0;
    for file in report.files.iter_mut() {
        if authorization.is_authorized(&file.relative_path) {
            bytes_to_deliver += file.file_size;
        } else {
            file.state = FileState::Excluded;
        }
    }

    tracing::info!(
        operation = %request.operation(),
        files = report.files.len(),
        excluded = report.excluded().len(),
        bytes = bytes_to_deliver,
        "Transfer started"
    );

    if let Some(callback) = progress {
        callback.on_transfer_started(&report.files, bytes_to_deliver);
    }

    for file_index in 0..report.files.len() {
        if report.files[file_index].state != FileState::Pending {
            continue;
        }
        if cancel.is_cancelled() {
            tracing::info!("Transfer cancelled, remaining files left in place");
            report.cancelled = true;
            break;
        }

        if let Some(callback) = progress {
            callback.on_file_started(file_index, &report.files[file_index]);
        }

        let file = &mut report.files[file_index];
        file.state = FileState::Copying;
        deliver(fs, request.operation(), file);
        if file.state == FileState::Delivered {
            report.bytes_delivered += file.file_size;
        }

        if let Some(callback) = progress {
            callback.on_file_completed(file_index, &report.files[file_index], report.bytes_delivered);
        }
    }

    if request.operation() == OperationKind::Move && !report.cancelled {
        report.pruned_directories = prune_moved_directories(fs, request, roots, &report.files);
    }

    tracing::info!(
        delivered = report.delivered().len(),
        failed = report.failed().len(),
        excluded = report.excluded().len(),
        bytes = report.bytes_delivered,
        "Transfer finished"
    );

    if let Some(callback) = progress {
        callback.on_transfer_completed(&report);
    }

    report
}

fn deliver(fs: &dyn Filesystem, operation: OperationKind, file: &mut FileItem) {
    let copied = match fs.copy_file(&file.source_path, &file.destination_path) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(file = %file.relative_path.display(), error = %e, "File copy failed");
            file.state = FileState::Failed;
            file.error_code = e.raw_os_error();
            file.error_message = Some(describe(&e));
            return;
        }
    };

    if operation == OperationKind::Move {
        if let Err(e) = fs.delete_file(&file.source_path) {
            // Undo the copy so the file exists in exactly one place.
            tracing::warn!(file = %file.relative_path.display(), error = %e, "Source delete failed, rolling back copy");
            let mut message = describe(&e);
            if let Err(rollback) = fs.delete_file(&file.destination_path) {
                tracing::warn!(
                    file = %file.relative_path.display(),
                    error = %rollback,
                    "Rollback failed, file left at both ends"
                );
                message = format!("{message}; copy left at destination: {}", describe(&rollback));
            }
            file.state = FileState::Failed;
            file.error_code = e.raw_os_error();
            file.error_message = Some(message);
            return;
        }
    }

    tracing::debug!(file = %file.relative_path.display(), bytes = copied, "File delivered");
    file.state = FileState::Delivered;
}

fn describe(error: &EngineError) -> String {
    match std::error::Error::source(error) {
        Some(source) => format!("{error}: {source}"),
        None => error.to_string(),
    }
}

/// Remove source directories that held delivered files and are now empty,
/// deepest first. Directories still holding excluded or failed files stay.
fn prune_moved_directories(
    fs: &dyn Filesystem,
    request: &TransferRequest,
    roots: &[SourceEntry],
    files: &[FileItem],
) -> Vec<PathBuf> {
    let mut directories: Vec<&SourceEntry> = roots.iter().flat_map(|r| r.directories()).collect();
    directories.sort_by_key(|dir| std::cmp::Reverse(dir.path.components().count()));

    let mut pruned = Vec::new();
    for dir in directories {
        let had_delivery = files
            .iter()
            .any(|f| f.state == FileState::Delivered && f.relative_path.starts_with(&dir.path));
        if !had_delivery {
            continue;
        }
        match fs.remove_empty_dir(&request.source_root().join(&dir.path)) {
            Ok(true) => pruned.push(dir.path.clone()),
            Ok(false) => {}
            Err(e) => tracing::warn!(dir = %dir.path.display(), error = %e, "Could not remove moved directory"),
        }
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs_ops::LocalFilesystem;
    use crate::model::PolicyMode;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    struct Fixture {
        _temp: tempfile::TempDir,
        src: PathBuf,
        dst: PathBuf,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("album").join("blocked_sub")).expect("Failed to create dirs");
        fs::create_dir(&dst).expect("Failed to create dst dir");
        fs::write(src.join("album").join("a.jpg"), b"aaa").expect("write");
        fs::write(src.join("album").join("blocked_sub").join("b.jpg"), b"bb").expect("write");
        fs::write(src.join("c.txt"), b"c").expect("write");
        Fixture { _temp: temp, src, dst }
    }

    fn roots(f: &Fixture, selected: &[&str]) -> Vec<SourceEntry> {
        selected
            .iter()
            .map(|s| LocalFilesystem.enumerate(&f.src, Path::new(s)).expect("enumerate").entry)
            .collect()
    }

    fn request(f: &Fixture, selected: &[&str], operation: OperationKind) -> TransferRequest {
        TransferRequest::new(
            &f.src,
            &f.dst,
            selected.iter().map(PathBuf::from).collect(),
            operation,
            PolicyMode::Blocking,
        )
        .expect("Failed to create request")
    }

    fn authorize(paths: &[PathBuf]) -> Authorization {
        Authorization {
            authorized: paths.iter().cloned().collect(),
            ..Authorization::default()
        }
    }

    #[test]
    fn test_copy_delivers_only_authorized_files() {
        let f = fixture();
        let request = request(&f, &["album", "c.txt"], OperationKind::Copy);
        let roots = roots(&f, &["album", "c.txt"]);
        let a = Path::new("album").join("a.jpg");

        let report = execute(
            &LocalFilesystem,
            &request,
            &roots,
            &authorize(&[a.clone(), PathBuf::from("c.txt")]),
            None,
            &CancelToken::new(),
        );

        assert_eq!(report.delivered().len(), 2);
        assert_eq!(report.excluded().len(), 1);
        assert_eq!(report.bytes_delivered, 4);
        assert!(f.dst.join(&a).exists());
        assert!(!f.dst.join("album").join("blocked_sub").exists());
        assert!(f.src.join(&a).exists(), "copy must keep the source");
    }

    #[test]
    fn test_move_deletes_only_delivered_sources() {
        let f = fixture();
        let request = request(&f, &["album"], OperationKind::Move);
        let roots = roots(&f, &["album"]);
        let a = Path::new("album").join("a.jpg");

        let report = execute(
            &LocalFilesystem,
            &request,
            &roots,
            &authorize(&[a.clone()]),
            None,
            &CancelToken::new(),
        );

        assert_eq!(report.delivered_paths(), vec![a.clone()]);
        assert!(!f.src.join(&a).exists());
        assert!(f.src.join("album").join("blocked_sub").join("b.jpg").exists());
        assert!(f.src.join("album").exists(), "directory with excluded files stays");
        assert!(report.pruned_directories.is_empty());
    }

    #[test]
    fn test_move_prunes_fully_delivered_directories() {
        let f = fixture();
        let request = request(&f, &["album"], OperationKind::Move);
        let roots = roots(&f, &["album"]);
        let all: Vec<PathBuf> = roots[0].files().iter().map(|e| e.path.clone()).collect();

        let report = execute(&LocalFilesystem, &request, &roots, &authorize(&all), None, &CancelToken::new());

        assert_eq!(report.delivered().len(), 2);
        assert!(!f.src.join("album").exists());
        assert_eq!(
            report.pruned_directories,
            vec![Path::new("album").join("blocked_sub"), PathBuf::from("album")]
        );
        assert!(f.dst.join("album").join("blocked_sub").join("b.jpg").exists());
    }

    #[test]
    fn test_failed_file_does_not_stop_siblings() {
        let f = fixture();
        let request = request(&f, &["album", "c.txt"], OperationKind::Copy);
        let roots = roots(&f, &["album", "c.txt"]);
        let a = Path::new("album").join("a.jpg");

        // Vanishes between enumeration and delivery.
        fs::remove_file(f.src.join(&a)).expect("remove");

        let report = execute(
            &LocalFilesystem,
            &request,
            &roots,
            &authorize(&[a, PathBuf::from("c.txt")]),
            None,
            &CancelToken::new(),
        );

        assert_eq!(report.failed().len(), 1);
        assert!(report.failed()[0].error_message.is_some());
        assert_eq!(report.delivered_paths(), vec![PathBuf::from("c.txt")]);
        assert!(!f.dst.join("album").exists(), "no directory for a file that was never written");
    }

    /// Local filesystem whose deletes always fail.
    struct UndeletableFilesystem;

    impl Filesystem for UndeletableFilesystem {
        fn enumerate(&self, root: &Path, relative: &Path) -> Result<crate::fs_ops::Listing, EngineError> {
            LocalFilesystem.enumerate(root, relative)
        }

        fn copy_file(&self, src: &Path, dst: &Path) -> Result<u64, EngineError> {
            LocalFilesystem.copy_file(src, dst)
        }

        fn delete_file(&self, path: &Path) -> Result<(), EngineError> {
            Err(EngineError::Delete {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only volume"),
            })
        }

        fn remove_empty_dir(&self, path: &Path) -> Result<bool, EngineError> {
            LocalFilesystem.remove_empty_dir(path)
        }

        fn free_space(&self, path: &Path) -> Result<u64, EngineError> {
            LocalFilesystem.free_space(path)
        }
    }

    #[test]
    fn test_failed_rollback_is_reported_on_the_file() {
        let f = fixture();
        let request = request(&f, &["c.txt"], OperationKind::Move);
        let roots = roots(&f, &["c.txt"]);

        let report = execute(
            &UndeletableFilesystem,
            &request,
            &roots,
            &authorize(&[PathBuf::from("c.txt")]),
            None,
            &CancelToken::new(),
        );

        assert_eq!(report.failed().len(), 1);
        let message = report.failed()[0].error_message.as_deref().expect("error message");
        assert!(message.contains("copy left at destination"), "got: {message}");
        assert!(f.src.join("c.txt").exists());
        assert!(f.dst.join("c.txt").exists());
    }

    #[test]
    fn test_cancelled_run_leaves_files_pending() {
        let f = fixture();
        let request = request(&f, &["c.txt"], OperationKind::Move);
        let roots = roots(&f, &["c.txt"]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = execute(
            &LocalFilesystem,
            &request,
            &roots,
            &authorize(&[PathBuf::from("c.txt")]),
            None,
            &cancel,
        );

        assert!(report.cancelled);
        assert_eq!(report.files[0].state, FileState::Pending);
        assert!(f.src.join("c.txt").exists());
        assert!(!f.dst.join("c.txt").exists());
    }

    #[derive(Default)]
    struct RecordingProgress {
        calls: Mutex<Vec<String>>,
    }

    impl ProgressCallback for RecordingProgress {
        fn on_transfer_started(&self, files: &[FileItem], bytes_to_deliver: u64) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("started({}, {})", files.len(), bytes_to_deliver));
        }

        fn on_file_started(&self, file_index: usize, _file: &FileItem) {
            self.calls.lock().unwrap().push(format!("file_started({file_index})"));
        }

        fn on_file_completed(&self, file_index: usize, _file: &FileItem, bytes_delivered: u64) {
            self.calls
                .lock()
                .unwrap()
                .push(format!("file_completed({file_index}, {bytes_delivered})"));
        }

        fn on_transfer_completed(&self, _report: &ExecutionReport) {
            self.calls.lock().unwrap().push("completed".to_string());
        }
    }

    #[test]
    fn test_progress_callbacks_in_order() {
        let f = fixture();
        let request = request(&f, &["album", "c.txt"], OperationKind::Copy);
        let roots = roots(&f, &["album", "c.txt"]);
        let progress = RecordingProgress::default();

        execute(
            &LocalFilesystem,
            &request,
            &roots,
            &authorize(&[PathBuf::from("c.txt")]),
            Some(&progress),
            &CancelToken::new(),
        );

        let calls = progress.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "started(3, 1)".to_string(),
                "file_started(2)".to_string(),
                "file_completed(2, 1)".to_string(),
                "completed".to_string(),
            ]
        );
    }
}
