//! FIFO transfer queue with a per-file attempt budget.

use crate::error::UploadError;
use crate::progress;
use crate::transfer::FileTransfer;
use crate::types::FileRecord;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One pending transfer of `records[index]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferJob {
    pub index: usize,
    pub attempts_remaining: u32,
}

/// Counters collected while draining the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Files that reached a final outcome.
    pub processed: usize,
    /// Files newly written to storage.
    pub copied: usize,
    /// Files already present at the destination.
    pub skipped: usize,
    /// Files that ran out of attempts.
    pub failed: usize,
    /// Transfer attempts made, retries included.
    pub attempts: usize,
    /// Draining stopped early because the run was cancelled.
    pub interrupted: bool,
}

impl DrainStats {
    /// At least one new file was written, or everything processed already existed.
    pub fn succeeded(&self) -> bool {
        self.copied > 0 || (self.processed > 0 && self.skipped == self.processed)
    }
}

#[derive(Debug, Default)]
pub struct RetryQueue {
    jobs: VecDeque<TransferJob>,
}

impl RetryQueue {
    /// Queues every record that is still pending, in order.
    pub fn new(records: &[FileRecord], attempts: u32) -> Self {
        let jobs = records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_pending())
            .map(|(index, _)| TransferJob {
                index,
                attempts_remaining: attempts.max(1),
            })
            .collect();
        Self { jobs }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Runs jobs until the queue is empty or `cancel` fires.
    ///
    /// Jobs left in the queue after cancellation keep their records pending.
    pub async fn drain<T: FileTransfer + ?Sized>(
        &mut self,
        records: &mut [FileRecord],
        transfer: &mut T,
        cancel: &CancellationToken,
    ) -> DrainStats {
        let mut stats = DrainStats::default();
        let pb = progress::files_bar(self.jobs.len() as u64, "Uploading files");

        while let Some(mut job) = self.jobs.pop_front() {
            if cancel.is_cancelled() {
                self.jobs.push_front(job);
                stats.interrupted = true;
                break;
            }

            let record = &records[job.index];
            pb.set_message(record.upload_name().to_string());
            job.attempts_remaining -= 1;
            stats.attempts += 1;

            // The transfer watches `cancel` itself so it can abort what it started.
            let result = transfer.transfer(record).await;

            let record = &mut records[job.index];
            match result {
                Ok(outcome) => {
                    record.mark_succeeded(outcome.skipped);
                    stats.processed += 1;
                    if outcome.skipped {
                        stats.skipped += 1;
                    } else {
                        stats.copied += 1;
                        info!("✅ Uploaded {}", record.upload_name());
                    }
                    pb.inc(1);
                }
                Err(UploadError::Interrupted) => {
                    job.attempts_remaining += 1;
                    self.jobs.push_front(job);
                    stats.interrupted = true;
                    break;
                }
                Err(e) if job.attempts_remaining > 0 => {
                    warn!(
                        "⚠️  {} failed, {} attempt(s) left: {}",
                        record.upload_name(),
                        job.attempts_remaining,
                        e
                    );
                    self.jobs.push_back(job);
                }
                Err(e) => {
                    record.mark_failed(e.to_string());
                    stats.processed += 1;
                    stats.failed += 1;
                    pb.inc(1);
                }
            }
        }
        pb.finish_and_clear();

        info!(
            "📊 Processed {} file(s): {} uploaded, {} already existed, {} failed ({} attempt(s))",
            stats.processed, stats.copied, stats.skipped, stats.failed, stats.attempts
        );
        stats
    }

    /// Records whose jobs were never finished.
    pub fn remaining(&self) -> impl Iterator<Item = usize> + '_ {
        self.jobs.iter().map(|j| j.index)
    }
}
