//! Insertion-bug locator
//!
//! Finds a span of samples that one stream carries and the other does not.
//! The search runs coarse to fine:
//!
//! 1. Midpoint probe: equal windows at both midpoints mean there is nothing
//!    to correct, and the run must not continue in correction mode.
//! 2. Lock-step block scan from the start of both streams.
//! 3. Sample scan inside the first mismatching block.
//! 4. Re-synchronization: a window of the intact stream taken at the
//!    divergence point is searched for, sample by sample, in the displaced
//!    stream. Everything skipped over is the displaced span.
//! 5. Tail pad taken from the end of the intact stream.

use std::io::{Read, Seek};

use serde::Serialize;

use crate::cadence::CadencePlan;
use crate::config::CheckConfig;
use crate::context::{RunContext, Side};
use crate::hashing::content_hash;
use crate::wav::WavStream;
use crate::{Result, WavCheckError};

/// Candidate offsets tested between cancellation checks
const CANCEL_CHECK_EVERY: u64 = 4096;

// ═══════════════════════════════════════════════════════════════════════════════
// CORRECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a displaced span sits and how to undo it before hashing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsertionCorrection {
    /// The stream that carries the extra span
    pub displaced_side: Side,
    /// Bytes of the extra span
    #[serde(skip)]
    pub displaced_head_bytes: Vec<u8>,
    /// Bytes from the end of the intact stream, appended to the displaced
    /// stream after the span is cut out so both end at the same sample
    #[serde(skip)]
    pub displaced_tail_bytes: Vec<u8>,
    /// First sample of the span in the displaced stream
    pub displacement_sample_offset: u64,
    /// Video frame containing that sample
    pub matched_frame_index: u64,
    pub sample_bytes: usize,
}

impl InsertionCorrection {
    /// Length of the displaced span in samples
    pub fn span_samples(&self) -> u64 {
        if self.sample_bytes == 0 {
            0
        } else {
            (self.displaced_head_bytes.len() / self.sample_bytes) as u64
        }
    }

    pub fn pad_samples(&self) -> u64 {
        if self.sample_bytes == 0 {
            0
        } else {
            (self.displaced_tail_bytes.len() / self.sample_bytes) as u64
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LOCATOR
// ═══════════════════════════════════════════════════════════════════════════════

/// Coarse-to-fine search for one displaced span
#[derive(Debug, Clone)]
pub struct InsertionLocator {
    probe_window_secs: f64,
    coarse_block_secs: f64,
    resync_window_secs: f64,
    max_span_secs: f64,
}

impl Default for InsertionLocator {
    fn default() -> Self {
        Self::from_config(&CheckConfig::default())
    }
}

impl InsertionLocator {
    pub fn from_config(config: &CheckConfig) -> Self {
        Self {
            probe_window_secs: config.insertion_probe_window_secs,
            coarse_block_secs: config.insertion_coarse_block_secs,
            resync_window_secs: config.insertion_resync_window_secs,
            max_span_secs: config.insertion_max_span_secs,
        }
    }

    /// Locate the span and build the correction for it
    pub fn locate<R1: Read + Seek, R2: Read + Seek>(
        &self,
        source: &mut WavStream<R1>,
        reference: &mut WavStream<R2>,
        plan: &CadencePlan,
        ctx: &RunContext,
    ) -> Result<InsertionCorrection> {
        if source.sample_bytes() != reference.sample_bytes()
            || source.sample_rate() != reference.sample_rate()
        {
            return Err(WavCheckError::Format(format!(
                "insertion search needs matching formats: source {}Hz/{}B, reference {}Hz/{}B",
                source.sample_rate(),
                source.sample_bytes(),
                reference.sample_rate(),
                reference.sample_bytes()
            )));
        }
        let rate = source.sample_rate();
        if !plan.timecode_capable() {
            return Err(WavCheckError::Format(format!(
                "insertion search is not supported at {rate}Hz"
            )));
        }

        let probe = CheckConfig::secs_to_samples(self.probe_window_secs, rate);
        let block = CheckConfig::secs_to_samples(self.coarse_block_secs, rate);
        let window = CheckConfig::secs_to_samples(self.resync_window_secs, rate);
        let max_span = CheckConfig::secs_to_samples(self.max_span_secs, rate);

        self.midpoint_probe(source, reference, probe)?;
        ctx.checkpoint()?;

        let divergence = first_divergence(source, reference, block, ctx)?;
        ctx.status(format!("insertion: streams diverge at sample {divergence}"));

        // Each direction tests at most max_span candidate offsets
        let found = match resync(source, reference, divergence, window, max_span, ctx)? {
            Some(end) => Some((Side::Source, end)),
            None => resync(reference, source, divergence, window, max_span, ctx)?
                .map(|end| (Side::Reference, end)),
        };
        let Some((displaced_side, resync_at)) = found else {
            return Err(WavCheckError::InsertionAmbiguous(format!(
                "no re-synchronization point within {max_span} samples after sample {divergence}"
            )));
        };

        let span = resync_at - divergence;
        let (head, tail) = match displaced_side {
            Side::Source => capture(source, reference, divergence, span)?,
            Side::Reference => capture(reference, source, divergence, span)?,
        };

        let correction = InsertionCorrection {
            displaced_side,
            displaced_head_bytes: head,
            displaced_tail_bytes: tail,
            displacement_sample_offset: divergence,
            matched_frame_index: plan.frame_index_of_sample(divergence),
            sample_bytes: source.sample_bytes(),
        };
        ctx.status(format!(
            "insertion: {} carries {} extra samples at sample {} (frame {}), pad {} samples",
            displaced_side,
            correction.span_samples(),
            divergence,
            correction.matched_frame_index,
            correction.pad_samples()
        ));
        Ok(correction)
    }

    fn midpoint_probe<R1: Read + Seek, R2: Read + Seek>(
        &self,
        source: &mut WavStream<R1>,
        reference: &mut WavStream<R2>,
        probe: u64,
    ) -> Result<()> {
        let src_mid = source.total_frames() / 2;
        let ref_mid = reference.total_frames() / 2;
        let mut a = Vec::new();
        let mut b = Vec::new();
        source.seek_to(src_mid)?;
        reference.seek_to(ref_mid)?;
        source.read_frames(probe, &mut a)?;
        reference.read_frames(probe, &mut b)?;

        if content_hash(&a) == content_hash(&b) {
            log::error!(
                "insertion: midpoint windows match (samples {}..{}), no displaced span to correct",
                src_mid,
                src_mid + probe
            );
            return Err(WavCheckError::InsertionAmbiguous(
                "streams are equal at the midpoint".into(),
            ));
        }
        Ok(())
    }
}

/// First sample at which the two streams differ
fn first_divergence<R1: Read + Seek, R2: Read + Seek>(
    source: &mut WavStream<R1>,
    reference: &mut WavStream<R2>,
    block: u64,
    ctx: &RunContext,
) -> Result<u64> {
    let sample_bytes = source.sample_bytes();
    source.rewind()?;
    reference.rewind()?;
    let mut a = Vec::new();
    let mut b = Vec::new();

    loop {
        ctx.checkpoint()?;
        let block_start = source.position();
        source.read_frames(block, &mut a)?;
        reference.read_frames(block, &mut b)?;

        if a == b {
            if a.is_empty() {
                return Err(WavCheckError::InsertionAmbiguous(
                    "source and reference are identical".into(),
                ));
            }
            continue;
        }

        // Mismatching block: drop to sample granularity inside it
        let first = a
            .chunks(sample_bytes)
            .zip(b.chunks(sample_bytes))
            .position(|(x, y)| x != y)
            .unwrap_or(a.len().min(b.len()) / sample_bytes);
        return Ok(block_start + first as u64);
    }
}

/// Search `displaced` for the window of `intact` that starts at `divergence`
///
/// Candidates run from `divergence + 1` to `divergence + max_span`. Returns
/// the sample in `displaced` where that window begins.
fn resync<R1: Read + Seek, R2: Read + Seek>(
    displaced: &mut WavStream<R1>,
    intact: &mut WavStream<R2>,
    divergence: u64,
    window: u64,
    max_span: u64,
    ctx: &RunContext,
) -> Result<Option<u64>> {
    let sample_bytes = displaced.sample_bytes();
    let mut target = Vec::new();
    intact.seek_to(divergence)?;
    intact.read_frames(window, &mut target)?;
    if target.is_empty() {
        return Ok(None);
    }
    let target_hash = content_hash(&target);
    let target_len = target.len() as u64 / sample_bytes as u64;
    let first_sample = &target[..sample_bytes];

    let last_candidate = divergence.saturating_add(max_span);
    let total = displaced.total_frames();
    let refill = window.max(1024);
    let mut buf = Vec::new();
    let mut buf_start = divergence;
    let mut candidate = divergence + 1;

    while candidate <= last_candidate && candidate + target_len <= total {
        if (candidate - divergence) % CANCEL_CHECK_EVERY == 0 {
            ctx.checkpoint()?;
        }

        let buf_end = buf_start + (buf.len() / sample_bytes) as u64;
        if candidate < buf_start || candidate + target_len > buf_end {
            buf_start = candidate;
            displaced.seek_to(candidate)?;
            displaced.read_frames(target_len + refill, &mut buf)?;
        }

        let offset = ((candidate - buf_start) as usize) * sample_bytes;
        let end = offset + target.len();
        if &buf[offset..offset + sample_bytes] == first_sample
            && content_hash(&buf[offset..end]) == target_hash
        {
            log::debug!(
                "insertion: window at {} found at {} in displaced stream",
                divergence,
                candidate
            );
            return Ok(Some(candidate));
        }
        candidate += 1;
    }
    Ok(None)
}

/// (displaced span bytes, tail pad bytes)
fn capture<R1: Read + Seek, R2: Read + Seek>(
    displaced: &mut WavStream<R1>,
    intact: &mut WavStream<R2>,
    divergence: u64,
    span: u64,
) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut head = Vec::new();
    displaced.seek_to(divergence)?;
    displaced.read_frames(span, &mut head)?;

    let corrected_len = displaced.total_frames() - span;
    let pad = intact.total_frames().saturating_sub(corrected_len);
    let tail = intact.read_tail(pad)?;

    displaced.rewind()?;
    intact.rewind()?;
    Ok((head, tail))
}
