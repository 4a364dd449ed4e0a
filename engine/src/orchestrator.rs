//! Transfer orchestration.
//!
//! `TransferGuard` runs one guarded transfer end to end:
//!
//! 1. enter `Scanning` and enumerate the selection
//! 2. dispatch one scan delegate per selected entry
//! 3. check destination free space while the scans run
//! 4. wait for every delegate, then decide
//! 5. ask for a review when warned files need one
//! 6. deliver the authorized files
//! 7. publish the final state and submit the audit report

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::audit::{AuditReport, AuditReporter, AuditSink, FanoutAuditSink, JsonLinesAuditSink, TracingAuditSink};
use crate::classifier::{ScanClassifier, ScanSession};
use crate::config::EngineConfig;
use crate::decision::{Authorization, Decision, PolicyDecisionEngine, TransferOutcome};
use crate::enumerator::{enumerate_selection, Enumeration};
use crate::error::EngineError;
use crate::executor::{execute, CancelToken, ExecutionReport};
use crate::feedback::{
    blocked_message, cancelled_message, complete_message, no_space_message, FeedbackReporter, FeedbackSink,
    FeedbackState, ReviewSurface,
};
use crate::fs_ops::{Filesystem, LocalFilesystem};
use crate::inspector::{ContentInspector, NamePatternInspector};
use crate::model::{PolicyMode, TransferRequest, TransferResultKind};
use crate::progress::ProgressCallback;

/// What a finished transfer did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    pub request_id: Uuid,
    pub result: TransferResultKind,
    /// Verdict counts; `None` when the transfer failed before the scan completed
    pub outcome: Option<TransferOutcome>,
    /// Files delivered to the destination
    pub transferred: Vec<PathBuf>,
    /// Files withheld by policy or by a cancelled review
    pub excluded: Vec<PathBuf>,
    /// Files whose transfer failed
    pub failed: Vec<PathBuf>,
    pub final_state: FeedbackState,
    pub final_message: String,
    pub warning_proceeded: bool,
    /// The audit report is still being produced in the background
    pub audit_pending: bool,
}

/// Runs guarded transfers.
pub struct TransferGuard {
    fs: Arc<dyn Filesystem>,
    inspector: Arc<dyn ContentInspector>,
    feedback: Arc<dyn FeedbackSink>,
    review: Arc<dyn ReviewSurface>,
    audit: AuditReporter,
    config: EngineConfig,
    pending_audits: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

#[derive(Default)]
pub struct TransferGuardBuilder {
    fs: Option<Arc<dyn Filesystem>>,
    inspector: Option<Arc<dyn ContentInspector>>,
    feedback: Option<Arc<dyn FeedbackSink>>,
    review: Option<Arc<dyn ReviewSurface>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    config: EngineConfig,
}

impl TransferGuardBuilder {
    pub fn filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn inspector(mut self, inspector: Arc<dyn ContentInspector>) -> Self {
        self.inspector = Some(inspector);
        self
    }

    pub fn feedback(mut self, feedback: Arc<dyn FeedbackSink>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn review(mut self, review: Arc<dyn ReviewSurface>) -> Self {
        self.review = Some(review);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the guard.
    ///
    /// Defaults: the local filesystem, a name-pattern inspector from the
    /// config, and `tracing` audit events (plus a JSON-lines file when
    /// `audit.log_path` is set).
    ///
    /// # Errors
    /// Returns `EngineError::Configuration` when no feedback sink or review
    /// surface was given.
    pub fn build(self) -> Result<TransferGuard, EngineError> {
        let feedback = self.feedback.ok_or_else(|| EngineError::Configuration {
            message: "a feedback sink is required".to_string(),
        })?;
        let review = self.review.ok_or_else(|| EngineError::Configuration {
            message: "a review surface is required".to_string(),
        })?;

        let fs = self.fs.unwrap_or_else(|| Arc::new(LocalFilesystem::new()));
        let inspector = self
            .inspector
            .unwrap_or_else(|| Arc::new(NamePatternInspector::from_config(&self.config.inspector)));

        let mut sink = self.audit_sink.unwrap_or_else(|| Arc::new(TracingAuditSink));
        if let Some(log_path) = &self.config.audit.log_path {
            let json_lines: Arc<dyn AuditSink> = Arc::new(JsonLinesAuditSink::new(log_path));
            sink = Arc::new(FanoutAuditSink::new(vec![sink, json_lines]));
        }
        let audit = AuditReporter::new(sink, self.config.audit.include_digests);

        Ok(TransferGuard {
            fs,
            inspector,
            feedback,
            review,
            audit,
            config: self.config,
            pending_audits: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TransferGuard {
    pub fn builder() -> TransferGuardBuilder {
        TransferGuardBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one transfer to its final state.
    ///
    /// A transfer that ends `Failed` (blocked files, cancelled review, no
    /// space) is still an `Ok` summary.
    ///
    /// # Errors
    /// Returns EngineError if a background task dies or the feedback state
    /// machine is driven out of order.
    pub async fn run(&self, request: TransferRequest) -> Result<TransferSummary, EngineError> {
        self.run_with_cancel(request, CancelToken::new()).await
    }

    /// Like `run`, with a token that stops delivery between files.
    pub async fn run_with_cancel(
        &self,
        request: TransferRequest,
        cancel: CancelToken,
    ) -> Result<TransferSummary, EngineError> {
        let request = Arc::new(request);
        let operation = request.operation();
        let reporter = Arc::new(FeedbackReporter::start(operation, Arc::clone(&self.feedback)));

        tracing::info!(
            transfer_id = %request.id(),
            operation = %operation,
            policy_mode = %request.policy_mode(),
            selected = request.selected().len(),
            "Guarded transfer started"
        );

        let enumeration = {
            let fs = Arc::clone(&self.fs);
            let request = Arc::clone(&request);
            tokio::task::spawn_blocking(move || enumerate_selection(fs.as_ref(), &request)).await?
        };

        let classifier = ScanClassifier::new(
            Arc::clone(&self.inspector),
            request.source_root(),
            self.config.scan.timeout(),
        );
        let session = classifier.dispatch(&enumeration.roots);

        if self.lacks_space(&request, &enumeration).await {
            return self.fail_no_space(request, enumeration, session, &reporter);
        }

        let scan = session.wait().await;
        let outcome = TransferOutcome::from_verdicts(&scan.verdicts);
        tracing::info!(
            allowed = outcome.allowed(),
            warned = outcome.warned(),
            blocked = outcome.blocked(),
            issues = scan.issues.len(),
            "Scan complete"
        );

        let engine = PolicyDecisionEngine::new(self.config.review);
        let authorization = match engine.decide(&scan.verdicts, request.policy_mode(), operation) {
            Decision::Proceed(authorization) => authorization,
            Decision::Review(review_request) => {
                reporter.review_required(&review_request)?;
                let decision = self.review.request_decision(&review_request).await;
                match engine.resolve_review(review_request, decision) {
                    Ok(authorization) => authorization,
                    Err(EngineError::UserCancelledReview) => {
                        reporter.cancelled()?;
                        let report = AuditReport::new(&request, &scan, TransferResultKind::UserCancelled)
                            .with_enumeration_errors(&enumeration.errors);
                        self.submit_audit(report);
                        return Ok(TransferSummary {
                            request_id: request.id(),
                            result: TransferResultKind::UserCancelled,
                            outcome: Some(outcome),
                            transferred: Vec::new(),
                            excluded: scan.verdicts.iter().map(|(path, _)| path.clone()).collect(),
                            failed: Vec::new(),
                            final_state: FeedbackState::Failed,
                            final_message: cancelled_message(operation),
                            warning_proceeded: false,
                            audit_pending: true,
                        });
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        reporter.transferring()?;
        let execution = {
            let fs = Arc::clone(&self.fs);
            let request = Arc::clone(&request);
            let roots = enumeration.roots.clone();
            let authorization = authorization.clone();
            let progress = Arc::clone(&reporter);
            let cancel = cancel.clone();
            tokio::task::spawn_blocking(move || {
                execute(
                    fs.as_ref(),
                    &request,
                    &roots,
                    &authorization,
                    Some(progress.as_ref() as &dyn ProgressCallback),
                    &cancel,
                )
            })
            .await?
        };

        let (result, final_message) = self.finish(&reporter, &request, &authorization, &execution)?;

        let report = AuditReport::new(&request, &scan, result)
            .with_authorization(&authorization)
            .with_execution(&execution)
            .with_enumeration_errors(&enumeration.errors);
        self.submit_audit(report);

        Ok(TransferSummary {
            request_id: request.id(),
            result,
            outcome: Some(outcome),
            transferred: execution.delivered_paths(),
            excluded: authorization.excluded.clone(),
            failed: execution.failed().iter().map(|f| f.relative_path.clone()).collect(),
            final_state: reporter.state(),
            final_message,
            warning_proceeded: authorization.warning_proceeded,
            audit_pending: true,
        })
    }

    /// Wait until every audit report submitted so far has reached its sink,
    /// including reports of scans still finishing in the background.
    pub async fn flush_audit(&self) {
        loop {
            let handles = std::mem::take(&mut *lock(&self.pending_audits));
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "Audit task failed");
                }
            }
        }
    }

    fn submit_audit(&self, report: AuditReport) {
        let handle = self.audit.emit(report);
        lock(&self.pending_audits).push(handle);
    }

    async fn lacks_space(&self, request: &Arc<TransferRequest>, enumeration: &Enumeration) -> bool {
        let required = enumeration.total_bytes();
        if required == 0 {
            return false;
        }

        let fs = Arc::clone(&self.fs);
        let destination = request.destination().to_path_buf();
        let available = match tokio::task::spawn_blocking(move || fs.free_space(&destination)).await {
            Ok(Ok(available)) => available,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Free space check failed, continuing");
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Free space check task failed, continuing");
                return false;
            }
        };

        if available < required {
            tracing::warn!(required, available, "Not enough space at destination");
            return true;
        }
        false
    }

    /// Fail the transfer for lack of space. Blocking scans are cancelled;
    /// report-only scans finish in the background and are still audited.
    fn fail_no_space(
        &self,
        request: Arc<TransferRequest>,
        enumeration: Enumeration,
        session: ScanSession,
        reporter: &FeedbackReporter,
    ) -> Result<TransferSummary, EngineError> {
        let operation = request.operation();
        reporter.no_space()?;

        let audit_pending = match request.policy_mode() {
            PolicyMode::Blocking => {
                session.cancel();
                false
            }
            PolicyMode::ReportOnly => {
                let audit = self.audit.clone();
                let pending = Arc::clone(&self.pending_audits);
                let request = Arc::clone(&request);
                let errors = enumeration.errors;
                let detached = session.detach_for_audit(move |scan| {
                    let report = AuditReport::new(&request, &scan, TransferResultKind::NoSpace)
                        .with_enumeration_errors(&errors);
                    let handle = audit.emit(report);
                    lock(&pending).push(handle);
                });
                lock(&self.pending_audits).push(detached);
                true
            }
        };

        Ok(TransferSummary {
            request_id: request.id(),
            result: TransferResultKind::NoSpace,
            outcome: None,
            transferred: Vec::new(),
            excluded: enumeration
                .roots
                .iter()
                .flat_map(|root| root.files())
                .map(|f| f.path.clone())
                .collect(),
            failed: Vec::new(),
            final_state: FeedbackState::Failed,
            final_message: no_space_message(operation),
            warning_proceeded: false,
            audit_pending,
        })
    }

    /// Publish the final state. Withheld and failed files are reported
    /// together.
    fn finish(
        &self,
        reporter: &FeedbackReporter,
        request: &TransferRequest,
        authorization: &Authorization,
        execution: &ExecutionReport,
    ) -> Result<(TransferResultKind, String), EngineError> {
        let operation = request.operation();

        if execution.cancelled {
            reporter.cancelled()?;
            return Ok((TransferResultKind::UserCancelled, cancelled_message(operation)));
        }

        let mut withheld = authorization.excluded.clone();
        let mut details: Vec<String> = authorization
            .excluded
            .iter()
            .map(|path| format!("{}: blocked by policy", path.display()))
            .collect();
        for file in execution.failed() {
            withheld.push(file.relative_path.clone());
            details.push(format!(
                "{}: {}",
                file.relative_path.display(),
                file.error_message.as_deref().unwrap_or("transfer failed")
            ));
        }

        if withheld.is_empty() {
            reporter.completed()?;
            return Ok((TransferResultKind::Completed, complete_message(operation)));
        }

        reporter.blocked(&withheld, details)?;
        Ok((
            TransferResultKind::PolicyBlocked,
            blocked_message(operation, withheld.len()),
        ))
    }
}

impl std::fmt::Debug for TransferGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferGuard")
            .field("inspector", &self.inspector)
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::feedback::{RecordingFeedback, ScriptedReview};
    use crate::model::OperationKind;
    use std::fs;

    fn guard(review: ScriptedReview) -> (TransferGuard, Arc<RecordingFeedback>, Arc<MemoryAuditSink>) {
        let feedback = Arc::new(RecordingFeedback::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let guard = TransferGuard::builder()
            .feedback(feedback.clone())
            .review(Arc::new(review))
            .audit_sink(audit.clone())
            .build()
            .expect("Failed to build guard");
        (guard, feedback, audit)
    }

    #[test]
    fn test_builder_requires_feedback_and_review() {
        assert!(matches!(
            TransferGuard::builder().build(),
            Err(EngineError::Configuration { .. })
        ));
        assert!(matches!(
            TransferGuard::builder()
                .feedback(Arc::new(RecordingFeedback::new()))
                .build(),
            Err(EngineError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_clean_copy_completes() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        let dst = temp.path().join("dst");
        fs::create_dir_all(src.join("photos")).expect("create src");
        fs::write(src.join("photos").join("a.jpg"), b"a").expect("write");
        fs::write(src.join("notes.txt"), b"n").expect("write");

        let (guard, feedback, audit) = guard(ScriptedReview::default());
        let request = TransferRequest::new(
            &src,
            &dst,
            vec![PathBuf::from("photos"), PathBuf::from("notes.txt")],
            OperationKind::Copy,
            PolicyMode::Blocking,
        )
        .expect("Failed to create request");

        let summary = guard.run(request).await.expect("transfer failed");
        guard.flush_audit().await;

        assert_eq!(summary.result, TransferResultKind::Completed);
        assert_eq!(summary.final_message, "Copy complete");
        assert_eq!(summary.transferred.len(), 2);
        assert!(dst.join("photos").join("a.jpg").exists());
        assert_eq!(
            feedback.states(),
            vec![FeedbackState::Scanning, FeedbackState::Transferring, FeedbackState::Completed]
        );
        assert_eq!(audit.reports().len(), 1);
    }

    #[tokio::test]
    async fn test_vanished_selection_still_completes() {
        let temp = tempfile::tempdir().expect("Failed to create temp dir");
        let src = temp.path().join("src");
        fs::create_dir_all(&src).expect("create src");

        let (guard, _feedback, audit) = guard(ScriptedReview::default());
        let request = TransferRequest::new(
            &src,
            temp.path().join("dst"),
            vec![PathBuf::from("gone.txt")],
            OperationKind::Move,
            PolicyMode::Blocking,
        )
        .expect("Failed to create request");

        let summary = guard.run(request).await.expect("transfer failed");
        guard.flush_audit().await;

        assert_eq!(summary.result, TransferResultKind::Completed);
        assert!(summary.transferred.is_empty());
        assert_eq!(audit.reports()[0].enumeration_errors.len(), 1);
    }
}
