//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which decouples the
//! executor from whatever surface shows per-file progress. The feedback
//! reporter implements it to drive the `Transferring` state.

use crate::executor::ExecutionReport;
use crate::model::FileItem;

/// Trait for receiving per-file progress from the executor.
///
/// All methods are called synchronously from the executor's worker thread.
pub trait ProgressCallback: Send + Sync {
    /// Called once before the first file, with every file of the transfer
    /// (excluded ones included) and the bytes that will be written.
    fn on_transfer_started(&self, files: &[FileItem], bytes_to_deliver: u64);

    /// Called when an authorized file is about to be written.
    fn on_file_started(&self, file_index: usize, file: &FileItem);

    /// Called when a file is done (delivered or failed).
    ///
    /// `bytes_delivered` is the running total across the transfer.
    fn on_file_completed(&self, file_index: usize, file: &FileItem, bytes_delivered: u64);

    /// Called after the last file.
    fn on_transfer_completed(&self, report: &ExecutionReport);
}
