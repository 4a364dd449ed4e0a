//! Content inspector interface and bundled inspectors.
//!
//! An inspector is handed one top-level entry at a time and streams back a
//! verdict for every file beneath it. The engine only consumes verdicts; how
//! an inspector reaches them (local rules, a remote service) is its own
//! business.

use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::config::InspectorConfig;
use crate::error::ScanError;
use crate::model::{SourceEntry, Verdict};

/// Verdict for a single file, as reported by an inspector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVerdict {
    /// Path relative to the source root
    pub path: PathBuf,
    pub verdict: Verdict,
}

impl FileVerdict {
    pub fn new(path: impl Into<PathBuf>, verdict: Verdict) -> Self {
        FileVerdict {
            path: path.into(),
            verdict,
        }
    }
}

/// Stream of verdicts produced by one delegate.
pub type VerdictStream = BoxStream<'static, Result<FileVerdict, ScanError>>;

/// An external content inspector.
///
/// Implementations must be `Send + Sync`; the classifier calls `scan` once
/// per top-level entry, concurrently. Errors should be returned, never
/// panicked.
#[async_trait]
pub trait ContentInspector: Send + Sync + Debug {
    /// Stable identifier used in logs and audit records.
    fn name(&self) -> &str;

    /// Start scanning `entry` (located under `root`).
    ///
    /// The returned stream should yield one verdict per file beneath the
    /// entry and then end. Files it never reports are treated as blocked.
    async fn scan(&self, root: &Path, entry: &SourceEntry) -> Result<VerdictStream, ScanError>;
}

/// Inspector that classifies files by substrings of their path.
///
/// Any path component containing a blocked pattern yields `Blocked`, then
/// any containing a warned pattern yields `Warned`; everything else is
/// `Allowed`. A directory named after a pattern therefore taints every
/// file beneath it. Matching is case-insensitive.
#[derive(Debug)]
pub struct NamePatternInspector {
    name: String,
    blocked: Vec<String>,
    warned: Vec<String>,
    failing: Vec<String>,
    latency: Option<Duration>,
    scan_count: AtomicU64,
}

impl NamePatternInspector {
    pub fn new(blocked: Vec<String>, warned: Vec<String>) -> Self {
        NamePatternInspector {
            name: "name-pattern".to_string(),
            blocked: lowercase_all(blocked),
            warned: lowercase_all(warned),
            failing: Vec::new(),
            latency: None,
            scan_count: AtomicU64::new(0),
        }
    }

    /// The "blocked"/"warned" naming convention.
    pub fn fixture() -> Self {
        Self::new(vec!["blocked".to_string()], vec!["warned".to_string()])
    }

    pub fn from_config(config: &InspectorConfig) -> Self {
        Self::new(config.blocked_patterns.clone(), config.warned_patterns.clone())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Simulated per-delegate latency before verdicts are streamed.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Top-level entries whose name contains `pattern` fail to scan.
    pub fn with_failure_for(mut self, pattern: impl Into<String>) -> Self {
        self.failing.push(pattern.into().to_lowercase());
        self
    }

    /// Number of delegates served so far.
    pub fn scan_count(&self) -> u64 {
        self.scan_count.load(Ordering::Relaxed)
    }

    pub fn classify(&self, path: &Path) -> Verdict {
        let components: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().to_lowercase())
            .collect();

        let matches = |patterns: &[String]| {
            components
                .iter()
                .any(|component| patterns.iter().any(|p| component.contains(p.as_str())))
        };

        if matches(&self.blocked) {
            Verdict::Blocked
        } else if matches(&self.warned) {
            Verdict::Warned
        } else {
            Verdict::Allowed
        }
    }
}

impl Default for NamePatternInspector {
    fn default() -> Self {
        Self::fixture()
    }
}

fn lowercase_all(patterns: Vec<String>) -> Vec<String> {
    patterns
        .into_iter()
        .filter(|p| !p.is_empty())
        .map(|p| p.to_lowercase())
        .collect()
}

#[async_trait]
impl ContentInspector for NamePatternInspector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, _root: &Path, entry: &SourceEntry) -> Result<VerdictStream, ScanError> {
        self.scan_count.fetch_add(1, Ordering::Relaxed);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let name = entry.name().to_lowercase();
        if self.failing.iter().any(|p| name.contains(p.as_str())) {
            return Err(ScanError::failure(
                entry.path.clone(),
                self.name.clone(),
                "inspector rejected the entry",
            ));
        }

        let verdicts: Vec<Result<FileVerdict, ScanError>> = entry
            .files()
            .into_iter()
            .map(|file| Ok(FileVerdict::new(file.path.clone(), self.classify(&file.path))))
            .collect();

        Ok(stream::iter(verdicts).boxed())
    }
}

/// Holds every delegate of an inner inspector until `release` is called.
///
/// Lets a host observe that all delegates were dispatched before any of
/// them answers, then issue every response at once.
#[derive(Debug)]
pub struct GatedInspector<I> {
    inner: I,
    open: watch::Sender<bool>,
    dispatched: watch::Sender<usize>,
}

impl<I: ContentInspector> GatedInspector<I> {
    pub fn new(inner: I) -> Self {
        let (open, _) = watch::channel(false);
        let (dispatched, _) = watch::channel(0);
        GatedInspector {
            inner,
            open,
            dispatched,
        }
    }

    /// Let every held and future delegate proceed.
    pub fn release(&self) {
        self.open.send_replace(true);
    }

    pub fn dispatched(&self) -> usize {
        *self.dispatched.borrow()
    }

    /// Suspend until at least `count` delegates have been dispatched.
    pub async fn wait_dispatched(&self, count: usize) {
        let mut rx = self.dispatched.subscribe();
        let _ = rx.wait_for(|n| *n >= count).await;
    }

    pub fn inner(&self) -> &I {
        &self.inner
    }
}

#[async_trait]
impl<I: ContentInspector> ContentInspector for GatedInspector<I> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn scan(&self, root: &Path, entry: &SourceEntry) -> Result<VerdictStream, ScanError> {
        self.dispatched.send_modify(|n| *n += 1);
        let mut open = self.open.subscribe();
        let _ = open.wait_for(|released| *released).await;
        self.inner.scan(root, entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_convention() {
        let inspector = NamePatternInspector::fixture();
        assert_eq!(inspector.classify(Path::new("a_allowed.jpg")), Verdict::Allowed);
        assert_eq!(inspector.classify(Path::new("b_blocked.jpg")), Verdict::Blocked);
        assert_eq!(inspector.classify(Path::new("c_Warned.jpg")), Verdict::Warned);
        assert_eq!(
            inspector.classify(Path::new("blocked_dir/plain.txt")),
            Verdict::Blocked
        );
        assert_eq!(
            inspector.classify(Path::new("warned_dir/blocked.txt")),
            Verdict::Blocked
        );
    }

    #[tokio::test]
    async fn test_scan_streams_every_file() {
        let inspector = NamePatternInspector::fixture();
        let entry = SourceEntry::directory(
            "dir",
            vec![
                SourceEntry::file("dir/a.txt", 1),
                SourceEntry::file("dir/b_warned.txt", 1),
            ],
        );

        let stream = inspector
            .scan(Path::new("/src"), &entry)
            .await
            .expect("scan should start");
        let verdicts: Vec<_> = stream.collect().await;

        assert_eq!(verdicts.len(), 2);
        assert_eq!(
            verdicts[1].as_ref().expect("verdict").verdict,
            Verdict::Warned
        );
        assert_eq!(inspector.scan_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let inspector = NamePatternInspector::fixture().with_failure_for("broken");
        let entry = SourceEntry::file("broken.pdf", 10);
        let result = inspector.scan(Path::new("/src"), &entry).await;
        assert!(matches!(result, Err(ScanError::Failure { .. })));
    }

    #[tokio::test]
    async fn test_gated_inspector_holds_until_release() {
        let gated = std::sync::Arc::new(GatedInspector::new(NamePatternInspector::fixture()));
        let entry = SourceEntry::file("a.txt", 1);

        let task = {
            let gated = std::sync::Arc::clone(&gated);
            tokio::spawn(async move { gated.scan(Path::new("/src"), &entry).await.is_ok() })
        };

        gated.wait_dispatched(1).await;
        assert_eq!(gated.dispatched(), 1);
        assert!(!task.is_finished());

        gated.release();
        assert!(task.await.expect("task panicked"));
    }
}
