//! Audit reporting.
//!
//! Every transfer whose scan completed produces exactly one `AuditReport`,
//! whatever happened to the transfer afterwards. Reports are handed to an
//! `AuditSink` on a background task; the transfer never waits for the sink
//! and the sink never answers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::classifier::{ScanIssue, ScanResults};
use crate::decision::{Authorization, TransferOutcome};
use crate::error::EngineError;
use crate::executor::ExecutionReport;
use crate::model::{
    FileState, OperationKind, PolicyMode, TransferRequest, TransferResultKind, Verdict,
};

/// Event type of a report where the user proceeded through a warning.
pub const EVENT_WARNING_PROCEEDED: &str = "proceed_warning_reports";
/// Event type of every other report.
pub const EVENT_TRANSFER_SCAN: &str = "file_transfer_scan";

/// One file considered by the transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditFileRecord {
    pub path: PathBuf,
    pub verdict: Verdict,
    pub delivered: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Where the content can be read when digests are requested.
    #[serde(skip)]
    content_path: PathBuf,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditCounts {
    pub allowed: usize,
    pub warned: usize,
    pub blocked: usize,
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub report_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub event_type: String,
    pub transfer_id: Uuid,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub operation: OperationKind,
    pub policy_mode: PolicyMode,
    pub files: Vec<AuditFileRecord>,
    pub counts: AuditCounts,
    pub warning_proceeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,
    pub scan_issues: Vec<ScanIssue>,
    pub enumeration_errors: Vec<String>,
    pub result: TransferResultKind,
}

impl AuditReport {
    /// Start a report from a completed scan. Every scanned file is listed as
    /// not delivered until `with_execution` says otherwise.
    pub fn new(request: &TransferRequest, scan: &ScanResults, result: TransferResultKind) -> Self {
        let outcome = TransferOutcome::from_verdicts(&scan.verdicts);
        let files = scan
            .verdicts
            .iter()
            .map(|(path, verdict)| AuditFileRecord {
                path: path.clone(),
                verdict,
                delivered: false,
                sha256: None,
                content_path: request.source_root().join(path),
            })
            .collect();

        AuditReport {
            report_id: Uuid::new_v4(),
            created_at: Utc::now(),
            event_type: EVENT_TRANSFER_SCAN.to_string(),
            transfer_id: request.id(),
            source: request.source_root().to_path_buf(),
            destination: request.destination().to_path_buf(),
            operation: request.operation(),
            policy_mode: request.policy_mode(),
            files,
            counts: AuditCounts {
                allowed: outcome.allowed(),
                warned: outcome.warned(),
                blocked: outcome.blocked(),
                ..AuditCounts::default()
            },
            warning_proceeded: false,
            justification: None,
            scan_issues: scan.issues.clone(),
            enumeration_errors: Vec::new(),
            result,
        }
    }

    pub fn with_authorization(mut self, authorization: &Authorization) -> Self {
        if authorization.warning_proceeded {
            self.warning_proceeded = true;
            self.event_type = EVENT_WARNING_PROCEEDED.to_string();
        }
        self.justification = authorization.justification.clone();
        self
    }

    pub fn with_execution(mut self, execution: &ExecutionReport) -> Self {
        for item in &execution.files {
            let Some(record) = self.files.iter_mut().find(|r| r.path == item.relative_path) else {
                continue;
            };
            match item.state {
                FileState::Delivered => {
                    record.delivered = true;
                    record.content_path = item.destination_path.clone();
                    self.counts.delivered += 1;
                }
                FileState::Failed => self.counts.failed += 1,
                _ => {}
            }
        }
        self
    }

    pub fn with_enumeration_errors(mut self, errors: &[EngineError]) -> Self {
        self.enumeration_errors = errors.iter().map(|e| e.to_string()).collect();
        self
    }

    pub fn paths(&self) -> Vec<&Path> {
        self.files.iter().map(|f| f.path.as_path()).collect()
    }
}

/// Destination of audit reports. Fire-and-forget: failures stay inside the sink.
pub trait AuditSink: Send + Sync {
    fn submit(&self, report: AuditReport);
}

/// Emits each report as a structured `tracing` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn submit(&self, report: AuditReport) {
        tracing::info!(
            target: "dlp_engine::audit",
            event_type = %report.event_type,
            report_id = %report.report_id,
            transfer_id = %report.transfer_id,
            source = %report.source.display(),
            destination = %report.destination.display(),
            operation = %report.operation,
            policy_mode = %report.policy_mode,
            files = report.files.len(),
            allowed = report.counts.allowed,
            warned = report.counts.warned,
            blocked = report.counts.blocked,
            delivered = report.counts.delivered,
            failed = report.counts.failed,
            warning_proceeded = report.warning_proceeded,
            justification = ?report.justification,
            scan_issues = report.scan_issues.len(),
            result = %report.result,
            "Transfer audit report"
        );
    }
}

/// Appends each report as one JSON line.
#[derive(Debug, Clone)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
}

impl JsonLinesAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonLinesAuditSink { path: path.into() }
    }

    fn append(&self, report: &AuditReport) -> std::io::Result<()> {
        let line = serde_json::to_string(report)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn submit(&self, report: AuditReport) {
        if let Err(e) = self.append(&report) {
            tracing::error!(
                path = %self.path.display(),
                report_id = %report.report_id,
                error = %e,
                "Failed to write audit report"
            );
        }
    }
}

/// Keeps reports in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    reports: Mutex<Vec<AuditReport>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reports(&self) -> Vec<AuditReport> {
        lock(&self.reports).clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn submit(&self, report: AuditReport) {
        lock(&self.reports).push(report);
    }
}

/// Forwards each report to several sinks.
#[derive(Default)]
pub struct FanoutAuditSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutAuditSink {
    pub fn new(sinks: Vec<Arc<dyn AuditSink>>) -> Self {
        FanoutAuditSink { sinks }
    }
}

impl AuditSink for FanoutAuditSink {
    fn submit(&self, report: AuditReport) {
        for sink in &self.sinks {
            sink.submit(report.clone());
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Submits reports in the background.
#[derive(Clone)]
pub struct AuditReporter {
    sink: Arc<dyn AuditSink>,
    include_digests: bool,
}

impl AuditReporter {
    pub fn new(sink: Arc<dyn AuditSink>, include_digests: bool) -> Self {
        AuditReporter {
            sink,
            include_digests,
        }
    }

    /// Hand `report` to the sink on a blocking task. Digests, when enabled,
    /// are computed there too. Must be called from within a tokio runtime.
    pub fn emit(&self, mut report: AuditReport) -> JoinHandle<()> {
        let sink = Arc::clone(&self.sink);
        let include_digests = self.include_digests;
        tokio::task::spawn_blocking(move || {
            if include_digests {
                attach_digests(&mut report);
            }
            tracing::debug!(report_id = %report.report_id, event_type = %report.event_type, "Submitting audit report");
            sink.submit(report);
        })
    }
}

fn attach_digests(report: &mut AuditReport) {
    for record in report.files.iter_mut() {
        match sha256_file(&record.content_path) {
            Ok(digest) => record.sha256 = Some(digest),
            Err(e) => tracing::debug!(path = %record.path.display(), error = %e, "No digest for audited file"),
        }
    }
}

/// SHA-256 of a file's content, hex encoded.
///
/// # Errors
/// Returns `EngineError::Read` if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String, EngineError> {
    let read_error = |e: std::io::Error| EngineError::Read {
        path: path.to_path_buf(),
        source: e,
    };
    let mut file = File::open(path).map_err(read_error)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 65536]; // 64 KB buffer
    loop {
        match file.read(&mut buffer).map_err(read_error)? {
            0 => break,
            n => hasher.update(&buffer[..n]),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}
