//! User-facing feedback for a guarded transfer.
//!
//! A transfer walks a one-directional state machine:
//!
//! ```text
//! Scanning -> ReviewRequired -> Transferring -> Completed
//!         \                 \               \
//!          +-> Transferring  +-> Failed      +-> Failed
//!          +-> Failed
//! ```
//!
//! `FeedbackReporter` owns the current state, rejects any other move and
//! publishes one `FeedbackUpdate` per transition to a `FeedbackSink`. While
//! `Transferring` it also publishes per-file progress as the executor's
//! `ProgressCallback`.
//!
//! The review dialog lives behind `ReviewSurface`: the engine asks it for a
//! `UserDecision` and waits for the answer.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::decision::ReviewRequest;
use crate::error::EngineError;
use crate::executor::ExecutionReport;
use crate::model::{display_name, FileItem, OperationKind, UserDecision};
use crate::progress::ProgressCallback;

/// Label of the affordance that leads to per-file details.
pub const REVIEW_AFFORDANCE: &str = "Review for further details";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackState {
    Scanning,
    ReviewRequired,
    Transferring,
    Completed,
    Failed,
}

impl FeedbackState {
    pub fn can_transition_to(self, next: FeedbackState) -> bool {
        use FeedbackState::*;
        matches!(
            (self, next),
            (Scanning, ReviewRequired)
                | (Scanning, Transferring)
                | (Scanning, Failed)
                | (ReviewRequired, Transferring)
                | (ReviewRequired, Failed)
                | (Transferring, Completed)
                | (Transferring, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, FeedbackState::Completed | FeedbackState::Failed)
    }
}

impl fmt::Display for FeedbackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeedbackState::Scanning => "scanning",
            FeedbackState::ReviewRequired => "review_required",
            FeedbackState::Transferring => "transferring",
            FeedbackState::Completed => "completed",
            FeedbackState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-file progress while transferring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferProgress {
    pub files_done: usize,
    pub files_total: usize,
    pub bytes_delivered: u64,
    pub bytes_total: u64,
}

/// One message for the host to render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackUpdate {
    pub state: FeedbackState,
    pub primary: String,
    pub secondary: Option<String>,
    /// Per-file lines, shown inline or behind `review_affordance`
    pub details: Vec<String>,
    pub review_affordance: Option<String>,
    pub progress: Option<TransferProgress>,
}

impl FeedbackUpdate {
    fn new(state: FeedbackState, primary: String) -> Self {
        FeedbackUpdate {
            state,
            primary,
            secondary: None,
            details: Vec::new(),
            review_affordance: None,
            progress: None,
        }
    }

    fn with_secondary(mut self, secondary: impl Into<String>) -> Self {
        self.secondary = Some(secondary.into());
        self
    }
}

pub fn scanning_message() -> String {
    "Checking…".to_string()
}

pub fn in_progress_message(operation: OperationKind) -> String {
    match operation {
        OperationKind::Copy => "Copying…".to_string(),
        OperationKind::Move => "Moving…".to_string(),
    }
}

pub fn review_required_message(operation: OperationKind) -> String {
    format!("Review is required before {}", operation.gerund())
}

/// "<name> may contain sensitive content", or "N files ..." for more than one.
pub fn review_summary_message(warned: &[PathBuf]) -> String {
    match warned {
        [single] => format!("{} may contain sensitive content", display_name(single)),
        many => format!("{} files may contain sensitive content", many.len()),
    }
}

pub fn blocked_message(operation: OperationKind, blocked: usize) -> String {
    if blocked == 1 {
        format!("File blocked from {}", operation.gerund())
    } else {
        format!("{} files blocked from {}", blocked, operation.gerund())
    }
}

pub fn no_space_message(operation: OperationKind) -> String {
    format!("{} operation failed. There is not enough space.", operation.noun())
}

pub fn cancelled_message(operation: OperationKind) -> String {
    format!("{} cancelled", operation.noun())
}

pub fn complete_message(operation: OperationKind) -> String {
    format!("{} complete", operation.noun())
}

/// Receives feedback updates. Called from the orchestrator and from the
/// executor's worker thread.
pub trait FeedbackSink: Send + Sync {
    fn publish(&self, update: FeedbackUpdate);
}

/// Forwards updates to a channel; the host renders them on its own thread.
pub struct ChannelFeedback {
    sender: Sender<FeedbackUpdate>,
}

impl ChannelFeedback {
    pub fn new(sender: Sender<FeedbackUpdate>) -> Self {
        ChannelFeedback { sender }
    }

    /// Create a sink together with the receiving end of its channel.
    pub fn unbounded() -> (Self, Receiver<FeedbackUpdate>) {
        let (tx, rx) = unbounded();
        (ChannelFeedback::new(tx), rx)
    }
}

impl FeedbackSink for ChannelFeedback {
    fn publish(&self, update: FeedbackUpdate) {
        // A host that stopped listening does not stop the transfer.
        let _ = self.sender.send(update);
    }
}

/// Keeps every update in memory.
#[derive(Debug, Default)]
pub struct RecordingFeedback {
    updates: Mutex<Vec<FeedbackUpdate>>,
}

impl RecordingFeedback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<FeedbackUpdate> {
        lock(&self.updates).clone()
    }

    /// States in the order they were entered, without repeated progress updates.
    pub fn states(&self) -> Vec<FeedbackState> {
        let mut states: Vec<FeedbackState> = Vec::new();
        for update in lock(&self.updates).iter() {
            if states.last() != Some(&update.state) {
                states.push(update.state);
            }
        }
        states
    }

    pub fn last(&self) -> Option<FeedbackUpdate> {
        lock(&self.updates).last().cloned()
    }
}

impl FeedbackSink for RecordingFeedback {
    fn publish(&self, update: FeedbackUpdate) {
        lock(&self.updates).push(update);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drives the feedback state machine of one transfer.
pub struct FeedbackReporter {
    operation: OperationKind,
    sink: Arc<dyn FeedbackSink>,
    state: Mutex<FeedbackState>,
    progress: Mutex<TransferProgress>,
}

impl FeedbackReporter {
    /// Enter `Scanning` and publish it.
    pub fn start(operation: OperationKind, sink: Arc<dyn FeedbackSink>) -> Self {
        let reporter = FeedbackReporter {
            operation,
            sink,
            state: Mutex::new(FeedbackState::Scanning),
            progress: Mutex::new(TransferProgress::default()),
        };
        reporter.sink.publish(
            FeedbackUpdate::new(FeedbackState::Scanning, scanning_message())
                .with_secondary(in_progress_message(operation)),
        );
        reporter
    }

    pub fn state(&self) -> FeedbackState {
        *lock(&self.state)
    }

    fn transition(&self, update: FeedbackUpdate) -> Result<(), EngineError> {
        {
            let mut state = lock(&self.state);
            if !state.can_transition_to(update.state) {
                return Err(EngineError::InvalidTransition {
                    from: *state,
                    to: update.state,
                });
            }
            *state = update.state;
        }
        tracing::debug!(state = %update.state, primary = %update.primary, "Feedback state changed");
        self.sink.publish(update);
        Ok(())
    }

    /// The transfer waits for a `UserDecision`.
    pub fn review_required(&self, request: &ReviewRequest) -> Result<(), EngineError> {
        self.transition(
            FeedbackUpdate::new(FeedbackState::ReviewRequired, review_required_message(self.operation))
                .with_secondary(review_summary_message(&request.warned)),
        )
    }

    pub fn transferring(&self) -> Result<(), EngineError> {
        self.transition(
            FeedbackUpdate::new(FeedbackState::Transferring, in_progress_message(self.operation)),
        )
    }

    pub fn completed(&self) -> Result<(), EngineError> {
        self.transition(FeedbackUpdate::new(
            FeedbackState::Completed,
            complete_message(self.operation),
        ))
    }

    /// Some files were withheld or failed. A single file is named inline;
    /// several are summarized behind the review affordance.
    pub fn blocked(&self, blocked: &[PathBuf], details: Vec<String>) -> Result<(), EngineError> {
        let mut update = FeedbackUpdate::new(
            FeedbackState::Failed,
            blocked_message(self.operation, blocked.len()),
        );
        if let [single] = blocked {
            update.secondary = Some(display_name(single));
        } else {
            update.review_affordance = Some(REVIEW_AFFORDANCE.to_string());
        }
        update.details = details;
        self.transition(update)
    }

    pub fn no_space(&self) -> Result<(), EngineError> {
        self.transition(FeedbackUpdate::new(
            FeedbackState::Failed,
            no_space_message(self.operation),
        ))
    }

    pub fn cancelled(&self) -> Result<(), EngineError> {
        self.transition(FeedbackUpdate::new(
            FeedbackState::Failed,
            cancelled_message(self.operation),
        ))
    }

    fn publish_progress(&self, secondary: Option<String>) {
        if self.state() != FeedbackState::Transferring {
            return;
        }
        let mut update = FeedbackUpdate::new(FeedbackState::Transferring, in_progress_message(self.operation));
        update.secondary = secondary;
        update.progress = Some(*lock(&self.progress));
        self.sink.publish(update);
    }
}

impl ProgressCallback for FeedbackReporter {
    fn on_transfer_started(&self, files: &[FileItem], bytes_to_deliver: u64) {
        {
            let mut progress = lock(&self.progress);
            progress.files_total = files.iter().filter(|f| !f.state.is_terminal()).count();
            progress.bytes_total = bytes_to_deliver;
        }
        self.publish_progress(None);
    }

    fn on_file_started(&self, _file_index: usize, file: &FileItem) {
        self.publish_progress(Some(file.name()));
    }

    fn on_file_completed(&self, _file_index: usize, _file: &FileItem, bytes_delivered: u64) {
        {
            let mut progress = lock(&self.progress);
            progress.files_done += 1;
            progress.bytes_delivered = bytes_delivered;
        }
        self.publish_progress(None);
    }

    fn on_transfer_completed(&self, _report: &ExecutionReport) {}
}

impl fmt::Debug for FeedbackReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedbackReporter")
            .field("operation", &self.operation)
            .field("state", &self.state())
            .finish()
    }
}

/// The dialog surface that answers warning reviews.
#[async_trait]
pub trait ReviewSurface: Send + Sync {
    async fn request_decision(&self, request: &ReviewRequest) -> UserDecision;
}

/// Answers reviews from a fixed script, in order. Once the script runs out
/// every review is cancelled.
#[derive(Debug, Default)]
pub struct ScriptedReview {
    decisions: Mutex<VecDeque<UserDecision>>,
    requests: Mutex<Vec<ReviewRequest>>,
}

impl ScriptedReview {
    pub fn new(decisions: impl IntoIterator<Item = UserDecision>) -> Self {
        ScriptedReview {
            decisions: Mutex::new(decisions.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn proceed(justification: Option<String>) -> Self {
        Self::new([UserDecision::proceed(justification)])
    }

    pub fn cancel() -> Self {
        Self::new([UserDecision::cancel()])
    }

    /// Every review request received so far.
    pub fn requests(&self) -> Vec<ReviewRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl ReviewSurface for ScriptedReview {
    async fn request_decision(&self, request: &ReviewRequest) -> UserDecision {
        lock(&self.requests).push(request.clone());
        lock(&self.decisions)
            .pop_front()
            .unwrap_or_else(UserDecision::cancel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::ReviewPrompt;
    use crate::model::ReviewAction;

    fn reporter(operation: OperationKind) -> (FeedbackReporter, Arc<RecordingFeedback>) {
        let sink = Arc::new(RecordingFeedback::new());
        (FeedbackReporter::start(operation, sink.clone()), sink)
    }

    fn review_request(warned: &[&str]) -> ReviewRequest {
        ReviewRequest {
            operation: OperationKind::Copy,
            prompt: ReviewPrompt::SingleProceed,
            warned: warned.iter().map(PathBuf::from).collect(),
            allowed: Vec::new(),
            blocked: Vec::new(),
        }
    }

    #[test]
    fn test_start_publishes_scanning() {
        let (reporter, sink) = reporter(OperationKind::Move);
        assert_eq!(reporter.state(), FeedbackState::Scanning);

        let first = sink.last().expect("scanning update");
        assert_eq!(first.primary, "Checking…");
        assert_eq!(first.secondary.as_deref(), Some("Moving…"));
    }

    #[test]
    fn test_review_path_to_completion() {
        let (reporter, sink) = reporter(OperationKind::Copy);
        reporter
            .review_required(&review_request(&["docs/warned.txt"]))
            .expect("review");
        let review = sink.last().expect("review update");
        assert_eq!(review.primary, "Review is required before copying");
        assert_eq!(review.secondary.as_deref(), Some("warned.txt may contain sensitive content"));

        reporter.transferring().expect("transferring");
        reporter.completed().expect("completed");
        assert_eq!(sink.last().expect("final").primary, "Copy complete");
        assert_eq!(
            sink.states(),
            vec![
                FeedbackState::Scanning,
                FeedbackState::ReviewRequired,
                FeedbackState::Transferring,
                FeedbackState::Completed,
            ]
        );
    }

    #[test]
    fn test_review_summary_pluralizes() {
        let warned = vec![PathBuf::from("a_warned"), PathBuf::from("b_warned")];
        assert_eq!(review_summary_message(&warned), "2 files may contain sensitive content");
    }

    #[test]
    fn test_states_are_not_revisited() {
        let (reporter, _sink) = reporter(OperationKind::Copy);
        reporter.transferring().expect("transferring");

        match reporter.review_required(&review_request(&["warned"])) {
            Err(EngineError::InvalidTransition { from, to }) => {
                assert_eq!(from, FeedbackState::Transferring);
                assert_eq!(to, FeedbackState::ReviewRequired);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }

        reporter.completed().expect("completed");
        assert!(reporter.cancelled().is_err());
        assert!(reporter.state().is_terminal());
    }

    #[test]
    fn test_cannot_complete_straight_from_scanning() {
        let (reporter, _sink) = reporter(OperationKind::Copy);
        assert!(reporter.completed().is_err());
        assert_eq!(reporter.state(), FeedbackState::Scanning);
    }

    #[test]
    fn test_single_blocked_file_is_named() {
        let (reporter, sink) = reporter(OperationKind::Copy);
        reporter.transferring().expect("transferring");
        reporter
            .blocked(&[PathBuf::from("b_blocked.jpg")], vec!["b_blocked.jpg: blocked by policy".to_string()])
            .expect("blocked");

        let update = sink.last().expect("blocked update");
        assert_eq!(update.state, FeedbackState::Failed);
        assert_eq!(update.primary, "File blocked from copying");
        assert_eq!(update.secondary.as_deref(), Some("b_blocked.jpg"));
        assert_eq!(update.review_affordance, None);
    }

    #[test]
    fn test_several_blocked_files_get_affordance() {
        let (reporter, sink) = reporter(OperationKind::Move);
        reporter.transferring().expect("transferring");
        reporter
            .blocked(&[PathBuf::from("a_blocked"), PathBuf::from("b_blocked")], Vec::new())
            .expect("blocked");

        let update = sink.last().expect("blocked update");
        assert_eq!(update.primary, "2 files blocked from moving");
        assert_eq!(update.secondary, None);
        assert_eq!(update.review_affordance.as_deref(), Some(REVIEW_AFFORDANCE));
    }

    #[test]
    fn test_no_space_and_cancel_messages() {
        assert_eq!(
            no_space_message(OperationKind::Copy),
            "Copy operation failed. There is not enough space."
        );
        assert_eq!(cancelled_message(OperationKind::Move), "Move cancelled");

        let (reporter, sink) = reporter(OperationKind::Copy);
        reporter.no_space().expect("no space from scanning");
        assert_eq!(sink.states(), vec![FeedbackState::Scanning, FeedbackState::Failed]);
    }

    #[test]
    fn test_progress_only_while_transferring() {
        let (reporter, sink) = reporter(OperationKind::Copy);
        reporter.on_file_completed(0, &dummy_item(), 10);
        assert_eq!(sink.updates().len(), 1);

        reporter.transferring().expect("transferring");
        reporter.on_transfer_started(&[dummy_item()], 10);
        reporter.on_file_completed(0, &dummy_item(), 10);

        let last = sink.last().expect("progress update");
        let progress = last.progress.expect("progress attached");
        assert_eq!(progress.files_done, 1);
        assert_eq!(progress.files_total, 1);
        assert_eq!(progress.bytes_delivered, 10);
    }

    fn dummy_item() -> FileItem {
        FileItem::for_entry(
            &crate::model::SourceEntry::file("a.txt", 10),
            std::path::Path::new("/src"),
            std::path::Path::new("/dst"),
        )
    }

    #[test]
    fn test_channel_feedback_forwards_updates() {
        let (sink, rx) = ChannelFeedback::unbounded();
        let _reporter = FeedbackReporter::start(OperationKind::Copy, Arc::new(sink));
        let update = rx.try_recv().expect("scanning update sent");
        assert_eq!(update.state, FeedbackState::Scanning);
    }

    #[tokio::test]
    async fn test_scripted_review_cancels_when_exhausted() {
        let review = ScriptedReview::proceed(Some("quarterly report".to_string()));
        let request = review_request(&["warned"]);

        let first = review.request_decision(&request).await;
        assert_eq!(first.action, ReviewAction::Proceed);
        let second = review.request_decision(&request).await;
        assert_eq!(second.action, ReviewAction::Cancel);
        assert_eq!(review.requests().len(), 2);
    }
}
