//! Policy decision engine.
//!
//! Turns the frozen verdict set into a transfer-level decision:
//!
//! | blocked | warned | mode       | decision                                   |
//! |---------|--------|------------|--------------------------------------------|
//! | 0       | 0      | any        | proceed with every file                    |
//! | any     | > 0    | Blocking   | review; blocked files stay excluded        |
//! | > 0     | 0      | Blocking   | proceed with allowed files only            |
//! | any     | any    | ReportOnly | proceed with every file, blocked included  |

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::config::ReviewConfig;
use crate::error::EngineError;
use crate::model::{OperationKind, PolicyMode, ReviewAction, UserDecision, Verdict, VerdictSet};

/// Verdict counts of one transfer.
///
/// Only built from a complete `VerdictSet`; there are no setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransferOutcome {
    allowed: usize,
    warned: usize,
    blocked: usize,
}

impl TransferOutcome {
    pub fn from_verdicts(verdicts: &VerdictSet) -> Self {
        verdicts
            .iter()
            .fold(TransferOutcome::default(), |mut outcome, (_, verdict)| {
                match verdict {
                    Verdict::Allowed => outcome.allowed += 1,
                    Verdict::Warned => outcome.warned += 1,
                    Verdict::Blocked => outcome.blocked += 1,
                }
                outcome
            })
    }

    pub fn allowed(&self) -> usize {
        self.allowed
    }

    pub fn warned(&self) -> usize {
        self.warned
    }

    pub fn blocked(&self) -> usize {
        self.blocked
    }

    pub fn total(&self) -> usize {
        self.allowed + self.warned + self.blocked
    }

    pub fn needs_review(&self) -> bool {
        self.warned > 0
    }

    pub fn has_blocking(&self) -> bool {
        self.blocked > 0
    }
}

/// Effective status of a directory, derived from the files beneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryStatus {
    /// No file with a verdict lies beneath the directory
    Empty,
    /// Every descendant file is allowed
    Clean,
    /// At least one warned file, none blocked
    Warned,
    /// At least one blocked file
    Blocked,
}

/// Status of `dir` computed from `verdicts`. Safe to call at any time; it
/// reads whatever verdicts exist when it is called.
pub fn directory_status(dir: &Path, verdicts: &VerdictSet) -> DirectoryStatus {
    let mut status = DirectoryStatus::Empty;
    for (path, verdict) in verdicts.iter() {
        if !path.starts_with(dir) || path == dir {
            continue;
        }
        status = match (status, verdict) {
            (_, Verdict::Blocked) => return DirectoryStatus::Blocked,
            (_, Verdict::Warned) => DirectoryStatus::Warned,
            (DirectoryStatus::Empty, Verdict::Allowed) => DirectoryStatus::Clean,
            (current, Verdict::Allowed) => current,
        };
    }
    status
}

/// How the review is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewPrompt {
    /// One warned file, no justification needed: a single "proceed" action.
    SingleProceed,
    /// Confirmation dialog collecting a decision and optional justification.
    Dialog { justification_required: bool },
}

/// A suspended transfer waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequest {
    pub operation: OperationKind,
    pub prompt: ReviewPrompt,
    pub warned: Vec<PathBuf>,
    pub allowed: Vec<PathBuf>,
    pub blocked: Vec<PathBuf>,
}

/// The files a transfer may deliver.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Authorization {
    pub authorized: BTreeSet<PathBuf>,
    /// Files withheld by policy
    pub excluded: Vec<PathBuf>,
    pub warning_proceeded: bool,
    pub justification: Option<String>,
}

impl Authorization {
    pub fn is_authorized(&self, path: &Path) -> bool {
        self.authorized.contains(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Proceed(Authorization),
    Review(ReviewRequest),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PolicyDecisionEngine {
    review: ReviewConfig,
}

impl PolicyDecisionEngine {
    pub fn new(review: ReviewConfig) -> Self {
        PolicyDecisionEngine { review }
    }

    /// Decide what happens to a transfer whose scan is complete.
    pub fn decide(&self, verdicts: &VerdictSet, mode: PolicyMode, operation: OperationKind) -> Decision {
        let outcome = TransferOutcome::from_verdicts(verdicts);

        if mode == PolicyMode::ReportOnly {
            tracing::debug!(files = outcome.total(), "Report-only mode, every file authorized");
            return Decision::Proceed(Authorization {
                authorized: verdicts.iter().map(|(p, _)| p.clone()).collect(),
                ..Authorization::default()
            });
        }

        let allowed = verdicts.paths_with(Verdict::Allowed);
        let warned = verdicts.paths_with(Verdict::Warned);
        let blocked = verdicts.paths_with(Verdict::Blocked);

        if outcome.needs_review() {
            let justification_required = self.review.justification_required();
            let prompt = if outcome.warned() == 1 && !justification_required {
                ReviewPrompt::SingleProceed
            } else {
                ReviewPrompt::Dialog {
                    justification_required,
                }
            };
            tracing::info!(
                warned = outcome.warned(),
                blocked = outcome.blocked(),
                ?prompt,
                "Transfer suspended for review"
            );
            return Decision::Review(ReviewRequest {
                operation,
                prompt,
                warned,
                allowed,
                blocked,
            });
        }

        if outcome.has_blocking() {
            tracing::info!(blocked = outcome.blocked(), "Blocked files excluded from transfer");
        }

        Decision::Proceed(Authorization {
            authorized: allowed.into_iter().collect(),
            excluded: blocked,
            warning_proceeded: false,
            justification: None,
        })
    }

    /// Apply the user's answer to a review.
    ///
    /// # Errors
    /// Returns `UserCancelledReview` when the user cancels, or proceeds
    /// without a justification the policy requires. Nothing is authorized in
    /// that case, not even allowed files.
    pub fn resolve_review(
        &self,
        request: ReviewRequest,
        decision: UserDecision,
    ) -> Result<Authorization, EngineError> {
        if decision.action == ReviewAction::Cancel {
            tracing::info!("Review cancelled, nothing will be transferred");
            return Err(EngineError::UserCancelledReview);
        }

        let justification_required = matches!(
            request.prompt,
            ReviewPrompt::Dialog {
                justification_required: true
            }
        );
        let justification = decision
            .justification
            .filter(|j| !j.trim().is_empty());
        if justification_required && justification.is_none() {
            tracing::warn!("Proceed without required justification treated as cancel");
            return Err(EngineError::UserCancelledReview);
        }

        let authorized = request.allowed.into_iter().chain(request.warned).collect();

        Ok(Authorization {
            authorized,
            excluded: request.blocked,
            warning_proceeded: true,
            justification,
        })
    }
}
