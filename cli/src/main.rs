//! guarded-transfer - Command-line interface for the DLP transfer engine.
//!
//! Runs one scanned copy or move and reports its feedback states to stderr.
//! Warning reviews are answered on stdin unless `--yes` or
//! `--cancel-on-review` is given.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use dlp_engine::{
    EngineConfig, FeedbackSink, FeedbackState, FeedbackUpdate, OperationKind, PolicyMode, ReviewPrompt,
    ReviewRequest, ReviewSurface, TransferGuard, TransferRequest, TransferResultKind, TransferSummary,
    UserDecision,
};
use tracing_subscriber::EnvFilter;

/// guarded-transfer - Copy or move files after a content scan
#[derive(Parser, Debug)]
#[command(name = "guarded-transfer")]
#[command(version = "0.1.0")]
#[command(about = "Copy or move files after checking them against a content policy")]
struct Args {
    /// Source root directory
    #[arg(long, value_name = "PATH")]
    src: PathBuf,

    /// Entries to transfer, relative to the source root
    #[arg(long, value_name = "ENTRY", num_args = 1.., required = true)]
    select: Vec<PathBuf>,

    /// Destination directory
    #[arg(long, value_name = "PATH")]
    dst: PathBuf,

    /// Operation mode: copy or move
    #[arg(long, value_name = "MODE", default_value = "copy")]
    mode: String,

    /// Policy mode: blocking or report-only (overrides the config file)
    #[arg(long, value_name = "POLICY")]
    policy: Option<String>,

    /// Engine configuration file (TOML)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Justification used when proceeding through a warning
    #[arg(long, value_name = "TEXT")]
    justification: Option<String>,

    /// Proceed through warning reviews without prompting
    #[arg(long, conflicts_with = "cancel_on_review")]
    yes: bool,

    /// Cancel any warning review without prompting
    #[arg(long)]
    cancel_on_review: bool,

    /// Append audit reports as JSON lines to this file
    #[arg(long, value_name = "FILE")]
    audit_log: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long)]
    verbose: bool,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// Prints feedback updates to stderr.
struct CliFeedback {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Option<Instant>>,
}

impl CliFeedback {
    fn new(verbose: bool) -> Self {
        CliFeedback {
            verbose,
            start_time: Instant::now(),
            last_progress_update: Mutex::new(None),
        }
    }

    fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    fn format_duration(elapsed: std::time::Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    fn print_progress_bar(percent: u32) -> String {
        let filled = (percent.min(100) / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    fn print_progress(&self, update: &FeedbackUpdate) {
        let Some(progress) = update.progress else {
            if self.verbose {
                if let Some(name) = &update.secondary {
                    eprintln!("  {}", name);
                }
            }
            return;
        };

        // Throttle progress updates to avoid spam (max once per 200ms)
        let done = progress.files_done == progress.files_total;
        {
            let mut last = self
                .last_progress_update
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !done && last.is_some_and(|t| t.elapsed().as_millis() < 200) {
                return;
            }
            *last = Some(Instant::now());
        }

        let total_bytes = progress.bytes_total.max(1);
        let percent = (progress.bytes_delivered as f64 / total_bytes as f64 * 100.0) as u32;
        eprint!(
            "\rProgress: {} | {}/{} files | {}",
            Self::print_progress_bar(percent),
            progress.files_done,
            progress.files_total,
            Self::format_bytes(progress.bytes_delivered)
        );
        let _ = std::io::stderr().flush();
    }
}

impl FeedbackSink for CliFeedback {
    fn publish(&self, update: FeedbackUpdate) {
        match update.state {
            FeedbackState::Transferring if update.progress.is_some() || update.secondary.is_some() => {
                self.print_progress(&update);
                return;
            }
            FeedbackState::Completed | FeedbackState::Failed => eprintln!(),
            _ => {}
        }

        eprintln!("{}", update.primary);
        if let Some(secondary) = &update.secondary {
            eprintln!("  {}", secondary);
        }
        if update.state.is_terminal() {
            if let Some(affordance) = &update.review_affordance {
                eprintln!("  {}:", affordance);
            }
            if update.review_affordance.is_some() || self.verbose {
                for line in &update.details {
                    eprintln!("    {}", line);
                }
            }
            eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReviewMode {
    Prompt,
    AutoProceed,
    AutoCancel,
}

/// Answers warning reviews from the terminal.
struct TerminalReview {
    mode: ReviewMode,
    justification: Option<String>,
}

impl TerminalReview {
    fn new(mode: ReviewMode, justification: Option<String>) -> Self {
        TerminalReview { mode, justification }
    }

    fn prompt(request: ReviewRequest, justification: Option<String>) -> UserDecision {
        eprintln!("The following files may contain sensitive content:");
        for path in &request.warned {
            eprintln!("  {}", path.display());
        }
        if !request.blocked.is_empty() {
            eprintln!("{} blocked file(s) will not be transferred.", request.blocked.len());
        }

        if !ask(&format!("Proceed with {}? [y/N] ", request.operation.gerund())) {
            return UserDecision::cancel();
        }

        let needs_text = matches!(request.prompt, ReviewPrompt::Dialog { .. });
        if needs_text && justification.is_none() {
            let text = read_line("Justification: ").unwrap_or_default();
            return UserDecision::proceed(Some(text));
        }
        UserDecision::proceed(justification)
    }
}

fn read_line(prompt: &str) -> Option<String> {
    eprint!("{}", prompt);
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(line.trim().to_string()),
    }
}

fn ask(prompt: &str) -> bool {
    read_line(prompt).is_some_and(|answer| matches!(answer.to_lowercase().as_str(), "y" | "yes"))
}

#[async_trait]
impl ReviewSurface for TerminalReview {
    async fn request_decision(&self, request: &ReviewRequest) -> UserDecision {
        match self.mode {
            ReviewMode::AutoProceed => UserDecision::proceed(self.justification.clone()),
            ReviewMode::AutoCancel => UserDecision::cancel(),
            ReviewMode::Prompt => {
                let request = request.clone();
                let justification = self.justification.clone();
                tokio::task::spawn_blocking(move || TerminalReview::prompt(request, justification))
                    .await
                    .unwrap_or_else(|_| UserDecision::cancel())
            }
        }
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(verbose);

    // A subscriber may already be installed (tests); keep it.
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}

/// Parse and validate command-line arguments, then run the transfer
#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose, args.json_logs);

    let exit_code = match run_cli(&args).await {
        Ok(summary) => exit_code_for(&summary),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            2
        }
    };

    std::process::exit(exit_code);
}

fn exit_code_for(summary: &TransferSummary) -> i32 {
    match summary.result {
        TransferResultKind::Completed => 0,
        _ => 1,
    }
}

/// Merge command-line flags over the configuration file.
fn load_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(policy) = &args.policy {
        config.policy.default_mode = policy.parse::<PolicyMode>().map_err(anyhow::Error::msg)?;
    }
    if let Some(log_path) = &args.audit_log {
        config.audit.log_path = Some(log_path.clone());
    }
    Ok(config)
}

/// Main CLI logic - separated for testability
async fn run_cli(args: &Args) -> Result<TransferSummary> {
    let operation = args.mode.parse::<OperationKind>().map_err(anyhow::Error::msg)?;
    let config = load_config(args)?;

    let review_mode = if args.yes {
        ReviewMode::AutoProceed
    } else if args.cancel_on_review {
        ReviewMode::AutoCancel
    } else {
        ReviewMode::Prompt
    };

    let request = TransferRequest::new(
        &args.src,
        &args.dst,
        args.select.clone(),
        operation,
        config.policy.default_mode,
    )
    .context("Invalid transfer request")?;

    let guard = TransferGuard::builder()
        .feedback(Arc::new(CliFeedback::new(args.verbose)))
        .review(Arc::new(TerminalReview::new(review_mode, args.justification.clone())))
        .config(config)
        .build()
        .context("Failed to set up transfer engine")?;

    let summary = guard.run(request).await.context("Transfer aborted")?;
    guard.flush_audit().await;

    tracing::info!(
        result = %summary.result,
        transferred = summary.transferred.len(),
        excluded = summary.excluded.len(),
        failed = summary.failed.len(),
        "Transfer finished"
    );
    Ok(summary)
}
