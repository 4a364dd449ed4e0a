//! Scan classifier.
//!
//! Dispatches one scanning delegate per top-level entry, in parallel, and
//! collects their verdicts into a shared write-once `VerdictSet`. The
//! verdicts only become readable through [`ScanSession::wait`], which first
//! awaits the delegate barrier; a partial verdict set is never handed out.
//!
//! Inspector errors are settled here. A delegate that fails, times out or is
//! cancelled leaves some files without a verdict, and every such file is
//! recorded as `Blocked` once the barrier opens.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::barrier::DelegateBarrier;
use crate::error::ScanError;
use crate::inspector::ContentInspector;
use crate::model::{SourceEntry, Verdict, VerdictSet};

/// Why a delegate did not report cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanIssueKind {
    Timeout,
    Failure,
    Cancelled,
    /// The delegate finished but skipped some files
    Unreported,
}

/// A delegate-level problem, kept for the audit report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanIssue {
    /// Top-level entry the delegate was scanning
    pub entry: PathBuf,
    pub kind: ScanIssueKind,
    pub message: String,
    /// Files resolved as blocked because of this issue
    pub files_blocked: usize,
}

/// Everything the classifier learned, available once all delegates arrived.
#[derive(Debug, Clone, Default)]
pub struct ScanResults {
    pub verdicts: VerdictSet,
    pub issues: Vec<ScanIssue>,
    pub delegates: usize,
}

#[derive(Debug, Default)]
struct Shared {
    verdicts: Mutex<VerdictSet>,
    issues: Mutex<Vec<ScanIssue>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Arrives at the barrier when dropped, so aborted or panicking delegates
/// are still counted.
struct ArrivalGuard {
    barrier: Arc<DelegateBarrier>,
    shared: Arc<Shared>,
    entry: PathBuf,
    settled: bool,
}

impl ArrivalGuard {
    fn settle(&mut self, issue: Option<(ScanIssueKind, String)>) {
        if let Some((kind, message)) = issue {
            lock(&self.shared.issues).push(ScanIssue {
                entry: self.entry.clone(),
                kind,
                message,
                files_blocked: 0,
            });
        }
        self.settled = true;
    }
}

impl Drop for ArrivalGuard {
    fn drop(&mut self) {
        if !self.settled {
            lock(&self.shared.issues).push(ScanIssue {
                entry: self.entry.clone(),
                kind: ScanIssueKind::Cancelled,
                message: "delegate cancelled before reporting".to_string(),
                files_blocked: 0,
            });
        }
        let remaining = self.barrier.arrive();
        tracing::debug!(entry = %self.entry.display(), remaining, "Scan delegate arrived");
    }
}

/// Parameters shared by every delegate of one transfer.
#[derive(Debug, Clone)]
pub struct ScanClassifier {
    inspector: Arc<dyn ContentInspector>,
    root: PathBuf,
    timeout: Duration,
}

impl ScanClassifier {
    pub fn new(inspector: Arc<dyn ContentInspector>, root: impl Into<PathBuf>, timeout: Duration) -> Self {
        ScanClassifier {
            inspector,
            root: root.into(),
            timeout,
        }
    }

    /// Start one delegate per top-level entry. Must be called from within a
    /// tokio runtime.
    pub fn dispatch(&self, entries: &[SourceEntry]) -> ScanSession {
        let barrier = Arc::new(DelegateBarrier::new(entries.len()));
        let shared = Arc::new(Shared::default());
        let mut tasks = Vec::with_capacity(entries.len());
        let mut expected = Vec::with_capacity(entries.len());

        tracing::info!(
            inspector = self.inspector.name(),
            delegates = entries.len(),
            "Dispatching scan delegates"
        );

        for entry in entries {
            let files: Vec<PathBuf> = entry.files().iter().map(|f| f.path.clone()).collect();
            expected.push((entry.path.clone(), files.clone()));

            // Built outside the task so an abort before the first poll still arrives.
            let guard = ArrivalGuard {
                barrier: Arc::clone(&barrier),
                shared: Arc::clone(&shared),
                entry: entry.path.clone(),
                settled: false,
            };
            let inspector = Arc::clone(&self.inspector);
            let root = self.root.clone();
            let entry = entry.clone();
            let timeout = self.timeout;
            let known: HashSet<PathBuf> = files.into_iter().collect();

            tasks.push(tokio::spawn(async move {
                let mut guard = guard;
                let scan = run_delegate(inspector.as_ref(), &root, &entry, &known, &guard.shared);
                let issue = match tokio::time::timeout(timeout, scan).await {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => {
                        tracing::warn!(entry = %entry.path.display(), error = %e, "Scan delegate failed");
                        Some((ScanIssueKind::Failure, e.to_string()))
                    }
                    Err(_) => {
                        let e = ScanError::Timeout {
                            path: entry.path.clone(),
                            elapsed: timeout,
                        };
                        tracing::warn!(entry = %entry.path.display(), error = %e, "Scan delegate timed out");
                        Some((ScanIssueKind::Timeout, e.to_string()))
                    }
                };
                guard.settle(issue);
            }));
        }

        ScanSession {
            barrier,
            shared,
            tasks,
            expected,
        }
    }
}

async fn run_delegate(
    inspector: &dyn ContentInspector,
    root: &std::path::Path,
    entry: &SourceEntry,
    known: &HashSet<PathBuf>,
    shared: &Shared,
) -> Result<(), ScanError> {
    let mut stream = inspector.scan(root, entry).await?;

    while let Some(item) = stream.next().await {
        let reported = item?;
        if !known.contains(&reported.path) {
            tracing::warn!(
                entry = %entry.path.display(),
                path = %reported.path.display(),
                "Ignoring verdict for a file outside the delegate"
            );
            continue;
        }
        if let Err(e) = lock(&shared.verdicts).record(reported.path, reported.verdict) {
            tracing::warn!(error = %e, "Ignoring duplicate verdict");
        }
    }

    Ok(())
}

/// In-flight scan of one transfer.
pub struct ScanSession {
    barrier: Arc<DelegateBarrier>,
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
    expected: Vec<(PathBuf, Vec<PathBuf>)>,
}

impl ScanSession {
    /// The join barrier over this session's delegates.
    pub fn barrier(&self) -> &DelegateBarrier {
        &self.barrier
    }

    pub fn delegate_count(&self) -> usize {
        self.barrier.expected()
    }

    /// Abort every delegate that has not reported yet.
    pub fn cancel(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    /// Let the delegates finish in the background and hand the results to
    /// `on_complete`. Used when the transfer has already failed but the scan
    /// still feeds the audit report.
    pub fn detach_for_audit<F>(self, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(ScanResults) + Send + 'static,
    {
        tokio::spawn(async move {
            let results = self.wait().await;
            on_complete(results);
        })
    }

    /// Wait for every delegate, then settle unreported files as blocked.
    pub async fn wait(self) -> ScanResults {
        self.barrier.wait().await;

        let mut verdicts = std::mem::take(&mut *lock(&self.shared.verdicts));
        let mut issues = std::mem::take(&mut *lock(&self.shared.issues));

        for (entry, files) in &self.expected {
            let mut blocked = 0;
            for file in files {
                if !verdicts.contains(file) && verdicts.record(file.clone(), Verdict::Blocked).is_ok() {
                    blocked += 1;
                }
            }
            if blocked == 0 {
                continue;
            }

            tracing::warn!(
                entry = %entry.display(),
                files = blocked,
                "Files without a verdict treated as blocked"
            );
            match issues.iter_mut().find(|issue| &issue.entry == entry) {
                Some(issue) => issue.files_blocked += blocked,
                None => issues.push(ScanIssue {
                    entry: entry.clone(),
                    kind: ScanIssueKind::Unreported,
                    message: "inspector did not report every file".to_string(),
                    files_blocked: blocked,
                }),
            }
        }

        ScanResults {
            verdicts,
            issues,
            delegates: self.barrier.expected(),
        }
    }
}

impl std::fmt::Debug for ScanSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanSession")
            .field("expected", &self.barrier.expected())
            .field("remaining", &self.barrier.remaining())
            .finish()
    }
}
