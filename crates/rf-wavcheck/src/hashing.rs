//! Hashing engine
//!
//! Streams PCM through a [`CadencePlan`], producing one xxh3-64 hash per video
//! frame plus one cumulative hash for the whole stream.

use std::collections::HashMap;
use std::io::{Read, Seek};

use serde::Serialize;
use xxhash_rust::xxh3::{Xxh3, xxh3_64};

use crate::cadence::CadencePlan;
use crate::context::{RunContext, Side};
use crate::insertion::InsertionCorrection;
use crate::wav::WavStream;
use crate::Result;

/// Frames between progress events
const PROGRESS_EVERY_FRAMES: usize = 250;

// ═══════════════════════════════════════════════════════════════════════════════
// FRAME HASH SEQUENCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-frame hashes of one channel (or interleaved stream)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameHashSequence {
    /// One content hash per video frame, in order
    pub frame_hashes: Vec<u64>,
    /// Hash of every byte hashed, never reset
    pub stream_hash: u64,
    /// Raw bytes of the final frame
    #[serde(skip)]
    pub last_frame: Vec<u8>,
    /// Raw bytes of the frame before it
    #[serde(skip)]
    pub last_prev_frame: Vec<u8>,
    /// Bytes per PCM sample frame
    pub sample_bytes: usize,
    pub sample_rate: u32,
    /// Bytes hashed in total
    pub total_bytes: u64,
    /// Final frame held fewer samples than the cadence asked for
    pub short_final_frame: bool,
}

impl FrameHashSequence {
    pub fn len(&self) -> usize {
        self.frame_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_hashes.is_empty()
    }

    pub fn total_samples(&self) -> u64 {
        if self.sample_bytes == 0 {
            0
        } else {
            self.total_bytes / self.sample_bytes as u64
        }
    }
}

/// 64-bit content hash used for frames and search windows
pub(crate) fn content_hash(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

// ═══════════════════════════════════════════════════════════════════════════════
// SAMPLE FEED
// ═══════════════════════════════════════════════════════════════════════════════

/// Logical byte stream: the file with an optional span cut out and an
/// optional pad appended after end of data
struct SampleFeed<'a, R> {
    stream: &'a mut WavStream<R>,
    excise: Option<(u64, u64)>,
    pad: &'a [u8],
    pad_pos: usize,
    scratch: Vec<u8>,
}

impl<'a, R: Read + Seek> SampleFeed<'a, R> {
    fn new(stream: &'a mut WavStream<R>, correction: Option<&'a InsertionCorrection>) -> Self {
        let (excise, pad) = match correction {
            Some(c) => (
                Some((c.displacement_sample_offset, c.span_samples())),
                c.displaced_tail_bytes.as_slice(),
            ),
            None => (None, &[][..]),
        };
        Self {
            stream,
            excise,
            pad,
            pad_pos: 0,
            scratch: Vec::new(),
        }
    }

    /// Fill `buf` with up to `frames` sample frames; 0 bytes means done
    fn read(&mut self, frames: u64, buf: &mut Vec<u8>) -> Result<usize> {
        let sample_bytes = self.stream.sample_bytes();
        let want = frames as usize * sample_bytes;
        buf.clear();

        while buf.len() < want {
            if let Some((start, len)) = self.excise {
                if self.stream.position() >= start {
                    self.stream.skip(len)?;
                    self.excise = None;
                }
            }

            let mut frames_left = ((want - buf.len()) / sample_bytes) as u64;
            if let Some((start, _)) = self.excise {
                frames_left = frames_left.min(start - self.stream.position());
            }

            let got = self.stream.read_frames(frames_left, &mut self.scratch)?;
            if got > 0 {
                buf.extend_from_slice(&self.scratch);
                continue;
            }
            if self.excise.is_some() && self.stream.remaining_frames() > 0 {
                continue;
            }

            let take = (want - buf.len()).min(self.pad.len() - self.pad_pos);
            if take == 0 {
                break;
            }
            buf.extend_from_slice(&self.pad[self.pad_pos..self.pad_pos + take]);
            self.pad_pos += take;
        }
        Ok(buf.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HASH CHANNEL
// ═══════════════════════════════════════════════════════════════════════════════

/// Hash a stream frame by frame
///
/// A correction is applied only when it names `side` as the displaced side:
/// the displaced span is cut out at its offset and the tail pad is read after
/// end of data. Cancellation is checked before every frame; a cancelled run
/// returns `Err(Cancelled)` and no partial sequence.
pub fn hash_channel<R: Read + Seek>(
    stream: &mut WavStream<R>,
    mut plan: CadencePlan,
    correction: Option<&InsertionCorrection>,
    ctx: &RunContext,
    side: Side,
) -> Result<FrameHashSequence> {
    let correction = correction.filter(|c| c.displaced_side == side);
    let sample_bytes = stream.sample_bytes();
    stream.rewind()?;

    if let Some(c) = correction {
        log::info!(
            "hash[{side}]: excising {} samples at sample {} and padding {} bytes",
            c.span_samples(),
            c.displacement_sample_offset,
            c.displaced_tail_bytes.len()
        );
    }

    let capacity = plan.max_frame_samples() as usize * sample_bytes;
    let mut feed = SampleFeed::new(stream, correction);
    let mut buf = Vec::with_capacity(capacity);
    let mut last_frame = Vec::with_capacity(capacity);
    let mut last_prev_frame = Vec::with_capacity(capacity);

    let mut frame_hashes = Vec::new();
    let mut stream_hasher = Xxh3::new();
    let mut total_bytes = 0u64;
    let mut short_final_frame = false;

    loop {
        ctx.checkpoint()?;

        let frame_samples = plan.next_frame_size();
        let got = feed.read(frame_samples, &mut buf)?;
        if got == 0 {
            break;
        }

        frame_hashes.push(content_hash(&buf));
        stream_hasher.update(&buf);
        total_bytes += got as u64;
        ctx.progress().add_hashed(side, got as u64);

        if got < frame_samples as usize * sample_bytes {
            short_final_frame = true;
        }

        std::mem::swap(&mut last_prev_frame, &mut last_frame);
        std::mem::swap(&mut last_frame, &mut buf);

        if frame_hashes.len() % PROGRESS_EVERY_FRAMES == 0 {
            ctx.publish_progress();
        }
    }

    if short_final_frame {
        log::warn!(
            "hash[{side}]: final frame holds {} of {} bytes",
            last_frame.len(),
            plan.peek_frame_size() as usize * sample_bytes
        );
    }
    log::debug!(
        "hash[{side}]: {} frames, {} bytes, stream hash {:016x}",
        frame_hashes.len(),
        total_bytes,
        stream_hasher.digest()
    );

    Ok(FrameHashSequence {
        frame_hashes,
        stream_hash: stream_hasher.digest(),
        last_frame,
        last_prev_frame,
        sample_bytes,
        sample_rate: plan.sample_rate(),
        total_bytes,
        short_final_frame,
    })
}

// ═══════════════════════════════════════════════════════════════════════════════
// SILENCE REFERENCE
// ═══════════════════════════════════════════════════════════════════════════════

/// Hashes of digital silence laid out exactly like `source`
///
/// Same frame count and cadence; the final frame has the source's final frame
/// length so a truncated tail does not count as a difference.
pub fn silence_reference(
    source: &FrameHashSequence,
    mut plan: CadencePlan,
    ctx: &RunContext,
) -> Result<FrameHashSequence> {
    plan.reset();
    let sample_bytes = source.sample_bytes;
    let frames = source.len();

    let mut zero_hashes: HashMap<usize, u64> = HashMap::new();
    let mut zeros: Vec<u8> = Vec::new();
    let mut frame_hashes = Vec::with_capacity(frames);
    let mut stream_hasher = Xxh3::new();
    let mut total_bytes = 0u64;
    let mut last_len = 0usize;
    let mut prev_len = 0usize;

    for index in 0..frames {
        if index % PROGRESS_EVERY_FRAMES == 0 {
            ctx.checkpoint()?;
        }
        let nominal = plan.next_frame_size() as usize * sample_bytes;
        let len = if index + 1 == frames {
            source.last_frame.len()
        } else {
            nominal
        };
        if zeros.len() < len {
            zeros.resize(len, 0);
        }
        let hash = *zero_hashes
            .entry(len)
            .or_insert_with(|| content_hash(&zeros[..len]));
        frame_hashes.push(hash);
        stream_hasher.update(&zeros[..len]);
        total_bytes += len as u64;
        prev_len = last_len;
        last_len = len;
    }

    Ok(FrameHashSequence {
        frame_hashes,
        stream_hash: stream_hasher.digest(),
        last_frame: vec![0; last_len],
        last_prev_frame: vec![0; prev_len],
        sample_bytes,
        sample_rate: source.sample_rate,
        total_bytes,
        short_final_frame: source.short_final_frame,
    })
}
