//! Differential comparator
//!
//! Compares two per-frame hash sequences, turns runs of mismatching frames
//! into timecode spans and classifies the result. A difference confined to
//! the final compared frame is handed to the sample-level boundary
//! classifier, which may downgrade it to a warning.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cadence::CadencePlan;
use crate::hashing::FrameHashSequence;
use crate::timecode::Timecode;

// ═══════════════════════════════════════════════════════════════════════════════
// VERDICT
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity of a comparison, ordered Match < Warning < Error
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Match,
    Warning,
    Error,
}

impl Verdict {
    /// Process exit code for this verdict
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Match => 0,
            Self::Warning => 1,
            Self::Error => 2,
        }
    }
}

impl Default for Verdict {
    fn default() -> Self {
        Self::Match
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Match => write!(f, "MATCH"),
            Self::Warning => write!(f, "WARNING"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SPANS
// ═══════════════════════════════════════════════════════════════════════════════

/// A run of mismatching video frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MismatchSpan {
    /// First mismatching frame index
    pub start_frame: u64,
    /// Frame index after the last mismatching frame
    pub end_frame: u64,
    pub start_timecode: Option<Timecode>,
    pub end_timecode: Option<Timecode>,
}

impl MismatchSpan {
    pub fn frames(&self) -> u64 {
        self.end_frame - self.start_frame
    }
}

/// A run of mismatching samples inside the boundary frame
///
/// Positions are 1-based and inclusive, the way editors count samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SampleSpan {
    pub start_sample: u64,
    pub end_sample: u64,
}

impl SampleSpan {
    pub fn samples(&self) -> u64 {
        self.end_sample - self.start_sample + 1
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// BOUNDARY CLASSIFIER
// ═══════════════════════════════════════════════════════════════════════════════

/// Thresholds of the boundary classifier
///
/// These are tuned QC policy, not derived from the signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundaryPolicy {
    /// Length difference (samples) at which a boundary difference is an Error
    pub error_min_length_samples: u64,
    /// Most sample runs that still classify as Warning
    pub max_warning_runs: usize,
}

impl Default for BoundaryPolicy {
    fn default() -> Self {
        Self {
            error_min_length_samples: 6,
            max_warning_runs: 1,
        }
    }
}

/// Result of comparing two boundary frames sample by sample
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BoundaryClassification {
    pub verdict: Verdict,
    pub runs: Vec<SampleSpan>,
    pub length_difference_samples: u64,
    /// No sample differs and lengths agree, although the hashes did not
    pub internal_inconsistency: bool,
}

/// Walk two raw frame blocks sample by sample and classify the difference
pub fn classify_boundary(
    a: &[u8],
    b: &[u8],
    sample_bytes: usize,
    policy: &BoundaryPolicy,
) -> BoundaryClassification {
    let sample_bytes = sample_bytes.max(1);
    let length_difference_samples = (a.len().abs_diff(b.len()) / sample_bytes) as u64;

    let mut runs = Vec::new();
    let mut open: Option<u64> = None;
    let mut index = 0u64;
    for (x, y) in a.chunks_exact(sample_bytes).zip(b.chunks_exact(sample_bytes)) {
        index += 1;
        match (x != y, open) {
            (true, None) => open = Some(index),
            (false, Some(start)) => {
                runs.push(SampleSpan { start_sample: start, end_sample: index - 1 });
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        runs.push(SampleSpan { start_sample: start, end_sample: index });
    }

    let mut verdict = if length_difference_samples == 0 {
        Verdict::Match
    } else if length_difference_samples >= policy.error_min_length_samples {
        Verdict::Error
    } else {
        Verdict::Warning
    };
    if runs.len() > policy.max_warning_runs {
        verdict = Verdict::Error;
    } else if !runs.is_empty() {
        verdict = verdict.max(Verdict::Warning);
    }

    BoundaryClassification {
        verdict,
        internal_inconsistency: runs.is_empty() && length_difference_samples == 0,
        runs,
        length_difference_samples,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// DIVERGENCE REPORT
// ═══════════════════════════════════════════════════════════════════════════════

/// Comparison result for one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DivergenceReport {
    pub channel: String,
    pub verdict: Verdict,
    /// Mismatching frame runs in order
    pub spans: Vec<MismatchSpan>,
    /// Sample runs inside the boundary frame, when it was inspected
    pub sample_level_detail: Option<Vec<SampleSpan>>,
    /// Boundary frame length difference in samples, when it was inspected
    pub boundary_length_difference_samples: Option<u64>,
    /// Frame count difference between the two sequences, when non-zero
    pub length_difference_frames: Option<u64>,
    pub compared_frames: u64,
    pub internal_inconsistency: bool,
    /// False when the cadence has no timecode mapping (44.1 kHz)
    pub timecode_available: bool,
}

impl DivergenceReport {
    /// Report for a channel whose checksums already matched
    pub fn matched(channel: impl Into<String>, frames: u64) -> Self {
        Self {
            channel: channel.into(),
            verdict: Verdict::Match,
            spans: Vec::new(),
            sample_level_detail: None,
            boundary_length_difference_samples: None,
            length_difference_frames: None,
            compared_frames: frames,
            internal_inconsistency: false,
            timecode_available: true,
        }
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        let mut out = format!("{}: {}", self.channel, self.verdict);
        if !self.spans.is_empty() {
            out.push_str(&format!(", {} mismatch span(s)", self.spans.len()));
        }
        if let Some(diff) = self.length_difference_frames {
            out.push_str(&format!(", length differs by {diff} frame(s)"));
        }
        if let Some(detail) = &self.sample_level_detail {
            out.push_str(&format!(", {} sample run(s) in last frame", detail.len()));
        }
        out
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPARATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Frame-level comparator for one run
#[derive(Debug, Clone)]
pub struct Comparator {
    origin: Timecode,
    timecode_capable: bool,
    policy: BoundaryPolicy,
    escalate_warnings: bool,
}

impl Comparator {
    /// `origin` is the timecode of frame 0
    pub fn new(plan: &CadencePlan, origin: Timecode, policy: BoundaryPolicy) -> Self {
        Self {
            origin,
            timecode_capable: plan.timecode_capable(),
            policy,
            escalate_warnings: false,
        }
    }

    /// Treat every Warning as Error (silence verification)
    pub fn with_warning_escalation(mut self) -> Self {
        self.escalate_warnings = true;
        self
    }

    /// Compare two finished hash sequences
    pub fn compare(
        &self,
        channel: &str,
        source: &FrameHashSequence,
        reference: &FrameHashSequence,
    ) -> DivergenceReport {
        self.compare_frames(
            channel,
            &source.frame_hashes,
            &reference.frame_hashes,
            (&source.last_frame, &reference.last_frame),
            (&source.last_prev_frame, &reference.last_prev_frame),
            source.sample_bytes,
        )
    }

    /// Compare per-frame hashes plus the two retained tail blocks of each side
    pub fn compare_frames(
        &self,
        channel: &str,
        src_hashes: &[u64],
        ref_hashes: &[u64],
        tails: (&[u8], &[u8]),
        prev_tails: (&[u8], &[u8]),
        sample_bytes: usize,
    ) -> DivergenceReport {
        let check_length = src_hashes.len().min(ref_hashes.len());
        let length_diff = src_hashes.len().abs_diff(ref_hashes.len()) as u64;
        let runs = mismatch_runs(&src_hashes[..check_length], &ref_hashes[..check_length]);

        log::info!(
            "compare[{channel}]: source {} frames, reference {} frames, {} mismatch run(s)",
            src_hashes.len(),
            ref_hashes.len(),
            runs.len()
        );

        let mut report = DivergenceReport {
            channel: channel.to_string(),
            verdict: Verdict::Match,
            spans: Vec::new(),
            sample_level_detail: None,
            boundary_length_difference_samples: None,
            length_difference_frames: (length_diff > 0).then_some(length_diff),
            compared_frames: check_length as u64,
            internal_inconsistency: false,
            timecode_available: self.timecode_capable,
        };

        if !self.timecode_capable {
            if !runs.is_empty() || length_diff > 0 {
                log::error!(
                    "compare[{channel}]: streams differ; no timecode mapping at this sample rate (length difference {length_diff} frame(s))"
                );
                report.verdict = Verdict::Error;
            }
            return report;
        }

        report.spans = runs
            .iter()
            .map(|&(start, end)| MismatchSpan {
                start_frame: start as u64,
                end_frame: end as u64,
                start_timecode: Some(self.origin.offset(start as u64)),
                end_timecode: Some(self.origin.offset(end as u64)),
            })
            .collect();
        for (n, span) in report.spans.iter().enumerate() {
            if let (Some(start), Some(end)) = (&span.start_timecode, &span.end_timecode) {
                log::error!("compare[{channel}]: section {n}: {start} - {end}");
            }
        }

        let boundary_only = match runs.as_slice() {
            [] => true,
            [(start, end)] => *end == check_length && *start + 1 == check_length,
            _ => false,
        };

        let last_differs =
            check_length > 0 && src_hashes[check_length - 1] != ref_hashes[check_length - 1];

        report.verdict = match length_diff {
            0 if runs.is_empty() => Verdict::Match,
            0 => {
                let mut verdict = Verdict::Error;
                if last_differs {
                    let boundary =
                        self.inspect_boundary(&mut report, tails.0, tails.1, sample_bytes);
                    if report.internal_inconsistency {
                        log::error!(
                            "compare[{channel}]: hashes differ but boundary frames are identical"
                        );
                    }
                    if boundary_only {
                        verdict = boundary;
                    }
                }
                verdict
            }
            1 => {
                log::error!("compare[{channel}]: length differs by 1 frame");
                let boundary =
                    self.inspect_boundary(&mut report, prev_tails.0, prev_tails.1, sample_bytes);
                // Identical previous frames are expected when only the extra frame differs
                report.internal_inconsistency = false;
                if boundary_only {
                    boundary.max(Verdict::Warning)
                } else {
                    Verdict::Error
                }
            }
            _ => Verdict::Error,
        };

        if length_diff > 1 {
            log::error!("compare[{channel}]: length differs by {length_diff} frames");
        }

        if self.escalate_warnings && report.verdict == Verdict::Warning {
            log::warn!("compare[{channel}]: boundary warning escalated to error");
            report.verdict = Verdict::Error;
        }
        report
    }

    fn inspect_boundary(
        &self,
        report: &mut DivergenceReport,
        a: &[u8],
        b: &[u8],
        sample_bytes: usize,
    ) -> Verdict {
        let class = classify_boundary(a, b, sample_bytes, &self.policy);
        for run in &class.runs {
            log::warn!(
                "compare[{}]: last frame samples {} - {} differ",
                report.channel,
                run.start_sample,
                run.end_sample
            );
        }
        report.internal_inconsistency = class.internal_inconsistency;
        report.boundary_length_difference_samples = Some(class.length_difference_samples);
        report.sample_level_detail = Some(class.runs);
        class.verdict
    }
}

/// Half-open index ranges where the two slices differ
fn mismatch_runs(a: &[u64], b: &[u64]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut open: Option<usize> = None;
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        match (x != y, open) {
            (true, None) => open = Some(i),
            (false, Some(start)) => {
                runs.push((start, i));
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        runs.push((start, a.len().min(b.len())));
    }
    runs
}
