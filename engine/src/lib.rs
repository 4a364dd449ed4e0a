//! # DLP Engine - Guarded File Transfer Library
//!
//! A content-scanning and policy-enforcement engine for file copy and move
//! operations between volumes. Designed as the foundation for multiple hosts
//! (CLI, file manager, automation).
//!
//! ## Overview
//!
//! Before a transfer is allowed to proceed, every file it would touch is
//! classified by an external content inspector as allowed, warned or
//! blocked. The engine then:
//! - Waits for every scan delegate through a counting join barrier
//! - Decides per policy mode which files may be transferred
//! - Suspends for a user review when warned files need one
//! - Delivers the authorized files, keeping blocked ones at the source
//! - Reports progress through a one-directional feedback state machine
//! - Submits one audit report per scanned transfer
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::path::PathBuf;
//! use std::sync::Arc;
//! use dlp_engine::{
//!     OperationKind, PolicyMode, RecordingFeedback, ScriptedReview, TransferGuard, TransferRequest,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let guard = TransferGuard::builder()
//!     .feedback(Arc::new(RecordingFeedback::new()))
//!     .review(Arc::new(ScriptedReview::proceed(None)))
//!     .build()?;
//!
//! let request = TransferRequest::new(
//!     "/mnt/usb",
//!     "/home/user/Documents",
//!     vec![PathBuf::from("reports")],
//!     OperationKind::Copy,
//!     PolicyMode::Blocking,
//! )?;
//!
//! let summary = guard.run(request).await?;
//! println!("{}: {} files transferred", summary.final_message, summary.transferred.len());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (TransferRequest, SourceEntry, VerdictSet, FileItem)
//! - **error**: Error types and handling
//! - **config**: TOML engine configuration
//! - **fs_ops**: Filesystem primitives
//! - **enumerator**: Recursive listing of the selection
//! - **inspector**: Content inspector interface and the name-pattern inspector
//! - **barrier**: Counting join barrier over scan delegates
//! - **classifier**: Parallel scan dispatch and fail-closed settlement
//! - **decision**: Policy decision engine and warning review
//! - **executor**: File delivery
//! - **progress**: Progress callback trait
//! - **feedback**: Feedback state machine, messages and review surface
//! - **audit**: Audit reports and sinks
//! - **orchestrator**: End-to-end transfer flow

pub mod model;
pub mod error;
pub mod config;
pub mod fs_ops;
pub mod enumerator;
pub mod inspector;
pub mod barrier;
pub mod classifier;
pub mod decision;
pub mod executor;
pub mod progress;
pub mod feedback;
pub mod audit;
pub mod orchestrator;

// Re-export main types and functions
pub use model::{
    EntryKind, FileItem, FileState, OperationKind, PolicyMode, ReviewAction, SourceEntry,
    TransferRequest, TransferResultKind, UserDecision, Verdict, VerdictSet,
};
pub use error::{EngineError, ScanError};
pub use config::EngineConfig;
pub use fs_ops::{Filesystem, LocalFilesystem};
pub use inspector::{ContentInspector, FileVerdict, GatedInspector, NamePatternInspector};
pub use barrier::DelegateBarrier;
pub use decision::{directory_status, DirectoryStatus, ReviewPrompt, ReviewRequest, TransferOutcome};
pub use executor::{CancelToken, ExecutionReport};
pub use progress::ProgressCallback;
pub use feedback::{
    ChannelFeedback, FeedbackSink, FeedbackState, FeedbackUpdate, RecordingFeedback, ReviewSurface,
    ScriptedReview,
};
pub use audit::{
    AuditReport, AuditSink, JsonLinesAuditSink, MemoryAuditSink, TracingAuditSink,
};
pub use orchestrator::{TransferGuard, TransferSummary};
