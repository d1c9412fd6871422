//! End-to-end verification runs on WAV fixtures
//!
//! Fixtures are written with hound into temporary directories; the RF64
//! fixture is assembled by hand because hound does not write RF64.

use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::PathBuf;

use rf_wavcheck::{
    CadencePlan, CheckConfig, CheckMode, FrameRate, MediaInput, Orchestrator, RunContext,
    RunOutcome, RunRequest, RunStatus, Side, Trim, Verdict, WavCheckError, WavStream,
    hash_channel,
};
use tempfile::TempDir;

// ============================================================================
// TEST UTILITIES
// ============================================================================

const RATE: u32 = 48_000;

/// Reproducible white noise
fn noise(len: usize, seed: u64) -> Vec<i16> {
    let mut state = seed;
    (0..len)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 48) as i16
        })
        .collect()
}

fn write_mono(dir: &TempDir, name: &str, samples: &[i16]) -> PathBuf {
    let path = dir.path().join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: RATE,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for &sample in samples {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
    path
}

/// Reproducible noise in the signed 24-bit range
fn noise_24(len: usize, seed: u64) -> Vec<i32> {
    noise(len, seed)
        .into_iter()
        .zip(noise(len, seed ^ 0x5A5A))
        .map(|(hi, lo)| ((hi as i32) << 8) | (lo as i32 & 0xFF))
        .collect()
}

fn write_mono_24(dir: &TempDir, name: &str, samples: &[i32], sample_rate: u32) -> PathBuf {
    let path = dir.path().join(name);
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 24,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec).unwrap();
    for &sample in samples {
        writer.write_sample(sample).unwrap();
    }
    writer.finalize().unwrap();
    path
}

/// RF64 with the data size only in ds64
fn rf64_bytes(samples: &[i16]) -> Vec<u8> {
    let pcm: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let mut out = Vec::new();
    out.extend_from_slice(b"RF64");
    out.extend_from_slice(&u32::MAX.to_le_bytes());
    out.extend_from_slice(b"WAVE");

    out.extend_from_slice(b"ds64");
    out.extend_from_slice(&28u32.to_le_bytes());
    out.extend_from_slice(&(pcm.len() as u64 + 72).to_le_bytes());
    out.extend_from_slice(&(pcm.len() as u64).to_le_bytes());
    out.extend_from_slice(&(samples.len() as u64).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes());

    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&RATE.to_le_bytes());
    out.extend_from_slice(&(RATE * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());

    out.extend_from_slice(b"data");
    out.extend_from_slice(&u32::MAX.to_le_bytes());
    out.extend_from_slice(&pcm);
    out
}

fn ntsc() -> FrameRate {
    FrameRate::Fps29_97 { drop_frame: false }
}

fn mono_request(source: PathBuf, reference: PathBuf, correct_insertion: bool) -> RunRequest {
    RunRequest::new(
        CheckMode::Interleaved {
            stream_index: 0,
            trim: Trim::default(),
            correct_insertion,
        },
        MediaInput::Wav(vec![source]),
    )
    .with_reference(MediaInput::Wav(vec![reference]))
    .with_frame_rate(ntsc())
    .with_start_timecode("01:00:00:00")
}

fn run(config: CheckConfig, request: &RunRequest) -> RunOutcome {
    match Orchestrator::new(config).unwrap().run(request).unwrap() {
        RunStatus::Completed(outcome) => outcome,
        RunStatus::Cancelled => panic!("run was cancelled"),
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn identical_streams_match() {
    let dir = TempDir::new().unwrap();
    let samples = noise(10 * RATE as usize, 1);
    let source = write_mono(&dir, "source.wav", &samples);
    let reference = write_mono(&dir, "reference.wav", &samples);

    let outcome = run(CheckConfig::default(), &mono_request(source, reference, false));

    assert_eq!(outcome.verdict, Verdict::Match);
    assert_eq!(outcome.exit_code(), 0);
    let report = outcome.channels[0].report.as_ref().unwrap();
    assert!(report.spans.is_empty());
    assert_eq!(report.compared_frames, 300);
}

#[test]
fn single_dropped_frame_is_an_error() {
    let dir = TempDir::new().unwrap();
    let samples = noise(20 * RATE as usize, 2);

    let plan = CadencePlan::new(ntsc(), RATE).unwrap();
    let frame = plan.frame_index_of_sample(480_000);
    let frame_len = (plan.frame_start_sample(frame + 1) - plan.frame_start_sample(frame)) as usize;
    let mut dropped = samples.clone();
    dropped.drain(480_000..480_000 + frame_len);

    let source = write_mono(&dir, "source.wav", &samples);
    let reference = write_mono(&dir, "reference.wav", &dropped);
    let outcome = run(CheckConfig::default(), &mono_request(source, reference, false));

    assert_eq!(outcome.verdict, Verdict::Error);
    let report = outcome.channels[0].report.as_ref().unwrap();
    assert_eq!(report.length_difference_frames, Some(1));
    assert_eq!(report.spans.len(), 1);
    assert_eq!(report.spans[0].start_frame, frame);
    assert_eq!(
        report.spans[0].start_timecode.map(|tc| tc.to_string()).as_deref(),
        Some("01:00:09:29")
    );
}

#[test]
fn silence_with_one_sample_is_an_error() {
    let dir = TempDir::new().unwrap();
    let mut samples = vec![0i16; 4 * RATE as usize];
    samples[2 * RATE as usize + 17] = 1;
    let source = write_mono(&dir, "muon.wav", &samples);

    let request = RunRequest::new(
        CheckMode::Silence { trim: Trim::default() },
        MediaInput::Wav(vec![source]),
    )
    .with_frame_rate(ntsc());
    let outcome = run(CheckConfig::default(), &request);

    assert_eq!(outcome.verdict, Verdict::Error);
    assert_eq!(outcome.channels[0].report.as_ref().unwrap().spans.len(), 1);
}

#[test]
fn boundary_sample_in_silence_escalates_to_error() {
    let dir = TempDir::new().unwrap();
    let mut samples = vec![0i16; 2 * RATE as usize];
    let last = samples.len() - 1;
    samples[last] = -1;
    let source = write_mono(&dir, "tail.wav", &samples);

    let request = RunRequest::new(
        CheckMode::Silence { trim: Trim::default() },
        MediaInput::Wav(vec![source]),
    )
    .with_frame_rate(ntsc());
    let outcome = run(CheckConfig::default(), &request);

    assert_eq!(outcome.verdict, Verdict::Error);
}

#[test]
fn insertion_is_corrected_and_reported() {
    let dir = TempDir::new().unwrap();
    let reference = noise(2 * RATE as usize, 3);
    let mut source = reference[..20_000].to_vec();
    source.extend(noise(37, 99));
    source.extend_from_slice(&reference[20_000..]);

    let source_path = write_mono(&dir, "source.wav", &source);
    let reference_path = write_mono(&dir, "reference.wav", &reference);
    let config = CheckConfig::default().with_insertion_windows(0.25, 0.1, 0.25);
    let outcome = run(config, &mono_request(source_path, reference_path, true));

    assert_eq!(outcome.verdict, Verdict::Warning);
    assert_eq!(outcome.source_checksums, outcome.reference_checksums);
    let correction = outcome.channels[0].correction.as_ref().unwrap();
    assert_eq!(correction.displaced_side, Side::Source);
    assert_eq!(correction.span_samples(), 37);
    assert!((20_000..20_037).contains(&correction.displacement_sample_offset));
}

#[test]
fn insertion_is_corrected_at_96k_24bit() {
    const HIRES: u32 = 96_000;
    let dir = TempDir::new().unwrap();
    let reference = noise_24(2 * HIRES as usize, 13);
    let mut source = reference[..40_000].to_vec();
    source.extend(noise_24(37, 77));
    source.extend_from_slice(&reference[40_000..]);

    let source_path = write_mono_24(&dir, "source.wav", &source, HIRES);
    let reference_path = write_mono_24(&dir, "reference.wav", &reference, HIRES);
    assert_eq!(WavStream::open(&source_path).unwrap().sample_width(), 3);

    let config = CheckConfig::default().with_insertion_windows(0.25, 0.1, 0.25);
    let outcome = run(config, &mono_request(source_path, reference_path, true));

    assert_eq!(outcome.verdict, Verdict::Warning);
    assert_eq!(outcome.source_checksums, outcome.reference_checksums);
    let correction = outcome.channels[0].correction.as_ref().unwrap();
    assert_eq!(correction.displaced_side, Side::Source);
    assert_eq!(correction.span_samples(), 37);
    assert_eq!(correction.sample_bytes, 3);
    assert!((40_000..40_037).contains(&correction.displacement_sample_offset));

    // 96 kHz 29.97 frames: 3203, 3203, 3204, 3203, 3203
    let plan = CadencePlan::new(ntsc(), HIRES).unwrap();
    assert_eq!(
        correction.matched_frame_index,
        plan.frame_index_of_sample(correction.displacement_sample_offset)
    );
    let report = outcome.channels[0].report.as_ref().unwrap();
    assert!(report.spans.is_empty());
}

#[test]
fn rf64_matches_riff() {
    let dir = TempDir::new().unwrap();
    let samples = noise(3 * RATE as usize, 4);
    let riff = write_mono(&dir, "riff.wav", &samples);
    let rf64 = dir.path().join("big.wav");
    std::fs::write(&rf64, rf64_bytes(&samples)).unwrap();

    let stream = WavStream::open(&rf64).unwrap();
    assert_eq!(stream.total_frames(), samples.len() as u64);

    let outcome = run(CheckConfig::default(), &mono_request(rf64, riff, false));
    assert_eq!(outcome.verdict, Verdict::Match);
}

#[test]
fn missing_file_is_fatal() {
    let dir = TempDir::new().unwrap();
    let reference = write_mono(&dir, "reference.wav", &noise(1000, 5));
    let request = mono_request(dir.path().join("absent.wav"), reference, false);

    let orchestrator = Orchestrator::new(CheckConfig::default()).unwrap();
    let err = orchestrator.run(&request).unwrap_err();
    assert!(matches!(err, WavCheckError::Io(_)));
}

// ============================================================================
// CANCELLATION
// ============================================================================

/// Cancels the run once a given number of PCM bytes has been read
struct CancelAfter<R> {
    inner: R,
    ctx: RunContext,
    remaining: u64,
}

impl<R: Read> Read for CancelAfter<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.remaining = self.remaining.saturating_sub(n as u64);
        if self.remaining == 0 {
            self.ctx.cancel();
        }
        Ok(n)
    }
}

impl<R: Seek> Seek for CancelAfter<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[test]
fn cancellation_stops_within_one_frame() {
    // Five minutes of mono PCM; the run is cancelled after one second
    let samples = vec![0x55i16; 300 * RATE as usize];
    let bytes = rf64_bytes(&samples);
    let header_len = (bytes.len() - samples.len() * 2) as u64;
    let ctx = RunContext::new();

    let reader = CancelAfter {
        inner: Cursor::new(bytes),
        ctx: ctx.clone(),
        remaining: header_len + 2 * RATE as u64,
    };
    let mut stream = WavStream::from_reader(reader).unwrap();
    let plan = CadencePlan::new(ntsc(), RATE).unwrap();

    let err = hash_channel(&mut stream, plan.clone(), None, &ctx, Side::Source).unwrap_err();
    assert!(err.is_cancelled());

    let hashed = ctx.progress().snapshot().source_hashed;
    let one_frame = plan.max_frame_samples() * 2;
    assert!(hashed <= 2 * RATE as u64 + one_frame, "hashed {hashed} bytes after cancel");
    assert!(hashed < (samples.len() * 2) as u64 / 100);
}

#[test]
fn config_round_trips_through_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wavcheck.json");
    let config = CheckConfig::strict().with_max_parallel_channels(2);
    config.to_json_file(&path).unwrap();

    let loaded = CheckConfig::from_json_file(&path).unwrap();
    assert_eq!(loaded.boundary_error_min_samples, 1);
    assert_eq!(loaded.max_parallel_channels, 2);
}
