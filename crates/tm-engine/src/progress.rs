//! Weighted job progress.
//!
//! A job reports 5 on claim. Files share the 10..90 band equally, file `i`
//! of `n` starting at `10 + 80·i/n`; the last 10 points are reserved for
//! storing results and completion.

use std::sync::Arc;
use tm_core::events::{EventBus, JobEventKind};
use tm_core::JobId;
use tm_db::JobStore;

use crate::tools::ProgressSink;

/// Reported as soon as a job is claimed.
pub const CLAIMED: u8 = 5;
/// Start of the per-file band.
pub const BAND_START: f64 = 10.0;
/// Width of the per-file band.
pub const BAND_SPAN: f64 = 80.0;

/// Job progress at the start of file `index` out of `total`.
pub fn file_start(index: usize, total: usize) -> u8 {
    scaled(index, total, 0)
}

/// Job progress when file `index` of `total` is `percent` done.
pub fn scaled(index: usize, total: usize, percent: u8) -> u8 {
    if total == 0 {
        return BAND_START as u8;
    }
    let within = f64::from(percent.min(100)) / 100.0;
    let value = BAND_START + BAND_SPAN * (index as f64 + within) / total as f64;
    value.round().clamp(0.0, 100.0) as u8
}

/// Records job progress in the store and publishes it when it advanced.
///
/// Store failures are logged and swallowed; progress is advisory.
#[derive(Clone)]
pub struct ProgressRecorder {
    job_id: JobId,
    store: Arc<dyn JobStore>,
    bus: Arc<EventBus>,
}

impl ProgressRecorder {
    pub fn new(job_id: JobId, store: Arc<dyn JobStore>, bus: Arc<EventBus>) -> Self {
        Self { job_id, store, bus }
    }

    /// Record an absolute job progress value.
    pub fn record(&self, progress: u8) {
        match self.store.append_progress(self.job_id, progress) {
            Ok(true) => self
                .bus
                .publish(self.job_id, JobEventKind::Progress { progress }),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    progress,
                    error = %e,
                    "Failed to record progress"
                );
            }
        }
    }

    /// Sink for file `index` of `total`, mapping handler percentages into
    /// the file's slice of the band.
    pub fn for_file(&self, index: usize, total: usize) -> FileProgress<'_> {
        FileProgress {
            recorder: self,
            index,
            total,
        }
    }
}

/// [`ProgressSink`] for one file of a job.
pub struct FileProgress<'a> {
    recorder: &'a ProgressRecorder,
    index: usize,
    total: usize,
}

impl ProgressSink for FileProgress<'_> {
    fn report(&self, percent: u8) {
        self.recorder
            .record(scaled(self.index, self.total, percent));
    }
}
