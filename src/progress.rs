//! # Progress Aggregator
//!
//! Converts streamed tool trigger messages and per-image internal progress
//! into one 0-100 job-level value. The checkpoint table is static and
//! ordered; the multi-image scaling splits the 0-95 band evenly across the
//! image count, and the final 5% is reserved for job finalization. A
//! monotonic-maximum guard keeps the emitted value non-decreasing even when
//! the image-count denominator is revised mid-run.

use once_cell::sync::Lazy;
use regex::Regex;

/// Portion of the job-level band spent by phase execution. The remainder is
/// assigned only at finalization.
pub const EXECUTION_BAND: f64 = 95.0;

struct Checkpoint {
    pattern: Regex,
    /// Per-image internal target (0-100) reached when the pattern matches.
    internal_pct: u8,
}

fn checkpoint(pattern: &str, internal_pct: u8) -> Checkpoint {
    Checkpoint {
        pattern: Regex::new(pattern).unwrap_or_else(|e| panic!("invalid checkpoint pattern: {e}")),
        internal_pct,
    }
}

/// Static ordered trigger-message checkpoint table.
static CHECKPOINTS: Lazy<Vec<Checkpoint>> = Lazy::new(|| {
    vec![
        checkpoint(r"(?i)identification started", 2),
        checkpoint(r"(?i)image mounted", 4),
        checkpoint(r"(?i)profile selected", 6),
        checkpoint(r"(?i)identification complete", 8),
        checkpoint(r"(?i)collection started", 10),
        checkpoint(r"(?i)collecting artefacts", 18),
        checkpoint(r"(?i)collection complete", 30),
        checkpoint(r"(?i)processing started", 34),
        checkpoint(r"(?i)parsing artefacts", 48),
        checkpoint(r"(?i)processing complete", 68),
        checkpoint(r"(?i)memory analysis started", 72),
        checkpoint(r"(?i)memory analysis complete", 84),
        checkpoint(r"(?i)analysis started", 88),
        checkpoint(r"(?i)analysis complete", 100),
    ]
});

/// `processing image X of Y` revises the image-count denominator with a
/// tool-reported authoritative value.
static IMAGE_OF_TOTAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)image\s+(\d+)\s+of\s+(\d+)").unwrap_or_else(|e| panic!("invalid pattern: {e}"))
});

/// Ephemeral per-run progress state. The emitted job progress is the
/// monotonic projection of this state.
#[derive(Debug, Clone)]
pub struct ProgressState {
    /// Image-count estimate; starts from the job's image count and is
    /// revised by tool-reported counts.
    pub total_images: usize,
    /// Whether a tool-reported count has confirmed the estimate.
    pub total_confirmed: bool,
    /// Zero-based index of the image currently driving progress.
    pub image_index: usize,
    /// Internal 0-100 progress of the current image.
    pub internal_pct: u8,
}

/// Outcome of feeding one trigger message to the aggregator.
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    /// Job-level progress after the message, already monotone.
    pub progress: u8,
    /// Whether the batching interval elapsed and the caller should persist.
    pub should_persist: bool,
}

pub struct ProgressAggregator {
    state: ProgressState,
    /// Highest job-level value emitted so far; denominator revisions can
    /// never pull the emitted value below this floor.
    floor: f64,
    batch: u32,
    lines_since_flush: u32,
}

impl ProgressAggregator {
    /// `initial_total` is the estimate from the job's image count at
    /// creation; `batch` is the persistence interval in trigger lines.
    pub fn new(initial_total: usize, batch: u32) -> Self {
        Self {
            state: ProgressState {
                total_images: initial_total.max(1),
                total_confirmed: false,
                image_index: 0,
                internal_pct: 0,
            },
            floor: 0.0,
            batch: batch.max(1),
            lines_since_flush: 0,
        }
    }

    pub fn state(&self) -> &ProgressState {
        &self.state
    }

    /// Per-image share of the execution band: `95 / total_images`.
    pub fn image_range(&self) -> f64 {
        EXECUTION_BAND / self.state.total_images as f64
    }

    /// Band offset of image `index`: `index * image_range`.
    pub fn image_base(&self, index: usize) -> f64 {
        index as f64 * self.image_range()
    }

    /// Switch the aggregator to a new current image. Internal progress
    /// restarts at zero; the emitted floor keeps the job-level value from
    /// regressing.
    pub fn begin_image(&mut self, index: usize) {
        self.state.image_index = index.min(self.state.total_images.saturating_sub(1));
        self.state.internal_pct = 0;
    }

    /// Revise the image-count denominator with an authoritative total. All
    /// subsequent computations use the new denominator; already-emitted
    /// progress is retained as a floor.
    pub fn revise_total(&mut self, total: usize, current_index: usize) {
        let total = total.max(1);
        self.state.total_images = total;
        self.state.total_confirmed = true;
        self.state.image_index = current_index.min(total - 1);
    }

    /// Feed one trigger message. Matches the denominator-revision pattern
    /// first, then the ordered checkpoint table.
    pub fn observe(&mut self, message: &str) -> Observation {
        if let Some(caps) = IMAGE_OF_TOTAL.captures(message) {
            let index = caps
                .get(1)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .unwrap_or(1)
                .saturating_sub(1);
            let total = caps
                .get(2)
                .and_then(|m| m.as_str().parse::<usize>().ok())
                .unwrap_or(self.state.total_images);
            self.revise_total(total, index);
        }

        for checkpoint in CHECKPOINTS.iter() {
            if checkpoint.pattern.is_match(message) {
                self.state.internal_pct = self.state.internal_pct.max(checkpoint.internal_pct);
                break;
            }
        }

        self.lines_since_flush += 1;
        let should_persist = self.lines_since_flush >= self.batch;
        if should_persist {
            self.lines_since_flush = 0;
        }

        Observation {
            progress: self.emit(),
            should_persist,
        }
    }

    /// Record tool-reported internal progress for the current image.
    pub fn set_internal(&mut self, pct: u8) -> u8 {
        self.state.internal_pct = self.state.internal_pct.max(pct.min(100));
        self.emit()
    }

    /// Job-level progress before rounding:
    /// `base + range * internal/100`, floored at the highest value already
    /// emitted.
    pub fn overall(&self) -> f64 {
        let raw = self.image_base(self.state.image_index)
            + self.image_range() * (self.state.internal_pct as f64 / 100.0);
        raw.max(self.floor)
    }

    fn emit(&mut self) -> u8 {
        let overall = self.overall();
        self.floor = overall;
        overall.min(EXECUTION_BAND) as u8
    }

    /// Highest job-level value emitted so far.
    pub fn emitted(&self) -> u8 {
        self.floor.min(100.0) as u8
    }

    /// Force the next observation to report `should_persist`.
    pub fn request_flush(&mut self) {
        self.lines_since_flush = self.batch;
    }

    /// Assign the reserved final band. Only called at job finalization.
    pub fn finalize(&mut self) -> u8 {
        self.floor = 100.0;
        100
    }
}
