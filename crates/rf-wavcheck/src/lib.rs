//! # rf-wavcheck
//!
//! Frame-accurate PCM verification for broadcast deliverables.
//!
//! Two renderings of the same program (a source, usually pulled out of a
//! QuickTime/MXF container, and a reference WAV set) are hashed one video
//! frame at a time and compared. Divergences are reported as timecode spans
//! and, at the last frame, as sample spans.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         ORCHESTRATOR                             │
//! │  Idle → Extracting → Hashing → Comparing → Done | Cancelled     │
//! └──────────────────────────────────────────────────────────────────┘
//!         │                    │                        │
//!         ▼                    ▼                        ▼
//!  ┌─────────────┐    ┌─────────────────┐    ┌────────────────────┐
//!  │  Extractor  │    │  Hashing Engine │    │    Comparator      │
//!  │  (ffmpeg)   │    │  WavStream +    │    │  frame runs +      │
//!  │  MetaProbe  │    │  CadencePlan    │    │  boundary classify │
//!  └─────────────┘    └─────────────────┘    └────────────────────┘
//!                             ▲
//!                             │
//!                    ┌─────────────────┐
//!                    │ Insertion-Bug   │
//!                    │ Locator         │
//!                    └─────────────────┘
//! ```
//!
//! ## Features
//!
//! - **RIFF / RF64 / BW64** reading with 64-bit data sizes
//! - **NTSC cadence**: 29.97 pulldown cycles at 48 kHz and 96 kHz, 23.98
//! - **xxh3-64** per-frame and cumulative stream hashes
//! - **Insertion-bug locator**: coarse-to-fine search for a displaced span
//! - **Cooperative cancellation** checked on every hashed frame
//!
//! ## Example
//!
//! ```rust,ignore
//! use rf_wavcheck::{CadencePlan, FrameRate, RunContext, Side, WavStream, hash_channel};
//!
//! let ctx = RunContext::new();
//! let mut src = WavStream::open("source.wav")?;
//! let plan = CadencePlan::new(FrameRate::parse("29.97", Some("01:00:00;00"))?, src.sample_rate())?;
//! let hashes = hash_channel(&mut src, plan, None, &ctx, Side::Source)?;
//! println!("{:016x}", hashes.stream_hash);
//! ```

pub mod cadence;
pub mod channels;
pub mod compare;
pub mod config;
pub mod context;
pub mod extract;
pub mod hashing;
pub mod insertion;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod timecode;
pub mod wav;

#[cfg(test)]
mod test_util;

pub use cadence::{CadencePlan, FrameRate};
pub use channels::{ChannelRole, CheckMode, ChecksumSet, OaLayout, Trim};
pub use compare::{
    BoundaryPolicy, Comparator, DivergenceReport, MismatchSpan, SampleSpan, Verdict,
};
pub use config::CheckConfig;
pub use context::{CancellationToken, ProgressCounters, ProgressSnapshot, RunContext, RunEvent, Side};
pub use extract::{ExtractLayout, ExtractRequest, Extractor, FfmpegExtractor};
pub use hashing::{FrameHashSequence, hash_channel, silence_reference};
pub use insertion::{InsertionCorrection, InsertionLocator};
pub use orchestrator::{
    ChannelOutcome, MediaInput, Orchestrator, RunOutcome, RunRequest, RunState, RunStatus,
};
pub use probe::{AudioStreamInfo, FfprobeProbe, MediaDescription, MetadataProbe};
pub use report::{ReportFormat, RunReport};
pub use timecode::Timecode;
pub use wav::WavStream;

use thiserror::Error;

/// Errors that can occur during a verification run
#[derive(Error, Debug)]
pub enum WavCheckError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unsupported format: {0}")]
    Format(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Metadata probe failed: {0}")]
    Probe(String),

    #[error("Cannot locate insertion: {0}")]
    InsertionAmbiguous(String),

    #[error("Channel layout mismatch: expected {expected}, got {actual}")]
    ChannelLayout { expected: usize, actual: usize },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run cancelled")]
    Cancelled,
}

impl WavCheckError {
    /// True for the cancellation terminal state, which is not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Result type for verification operations
pub type Result<T> = std::result::Result<T, WavCheckError>;
