//! Channel-set orchestrator
//!
//! Drives one verification run:
//!
//! ```text
//! Idle → Extracting → Hashing → Comparing → Done(verdict)
//!                                          ↘ Cancelled | Fatal(error)
//! ```
//!
//! Container sides are extracted concurrently (one collaborator call per
//! side); WAV sides skip extraction. Hashing runs every (side, channel) pair
//! on a bounded rayon pool. The combined checksums are compared first and the
//! per-frame comparator only runs when they differ.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use tempfile::TempDir;

use crate::cadence::{CadencePlan, FrameRate};
use crate::channels::{ChannelRole, CheckMode, ChecksumSet};
use crate::compare::{Comparator, DivergenceReport, Verdict};
use crate::config::CheckConfig;
use crate::context::{RunContext, RunEvent, Side};
use crate::extract::{ExtractLayout, ExtractRequest, Extractor, FfmpegExtractor};
use crate::hashing::{FrameHashSequence, hash_channel, silence_reference};
use crate::insertion::{InsertionCorrection, InsertionLocator};
use crate::probe::{
    AudioStreamInfo, FfprobeProbe, MediaDescription, MetadataProbe, check_compatible,
    pcm_codec_for_bits,
};
use crate::timecode::Timecode;
use crate::wav::WavStream;
use crate::{Result, WavCheckError};

/// WAV file per channel role, for one side
type RoleFiles = BTreeMap<ChannelRole, PathBuf>;

// ═══════════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Where a run is
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum RunState {
    #[default]
    Idle,
    Extracting,
    Hashing,
    Comparing,
    Done(Verdict),
    Cancelled,
    Fatal(String),
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Cancelled | Self::Fatal(_))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST
// ═══════════════════════════════════════════════════════════════════════════════

/// One side of a run
#[derive(Debug, Clone, PartialEq)]
pub enum MediaInput {
    /// Container the channels are extracted from
    Container(PathBuf),
    /// WAV files, one per channel role in the mode's canonical order
    Wav(Vec<PathBuf>),
}

impl MediaInput {
    pub fn is_container(&self) -> bool {
        matches!(self, Self::Container(_))
    }
}

/// Everything one run needs besides the configuration
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub mode: CheckMode,
    pub source: MediaInput,
    /// Not used by the silence check
    pub reference: Option<MediaInput>,
    /// Overrides the rate found by the probe
    pub frame_rate: Option<FrameRate>,
    /// Overrides the timecode found by the probe
    pub start_timecode: Option<String>,
}

impl RunRequest {
    pub fn new(mode: CheckMode, source: MediaInput) -> Self {
        Self {
            mode,
            source,
            reference: None,
            frame_rate: None,
            start_timecode: None,
        }
    }

    pub fn with_reference(mut self, reference: MediaInput) -> Self {
        self.reference = Some(reference);
        self
    }

    pub fn with_frame_rate(mut self, rate: FrameRate) -> Self {
        self.frame_rate = Some(rate);
        self
    }

    pub fn with_start_timecode(mut self, timecode: impl Into<String>) -> Self {
        self.start_timecode = Some(timecode.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTCOME
// ═══════════════════════════════════════════════════════════════════════════════

/// Result for one channel role
#[derive(Debug, Clone, Serialize)]
pub struct ChannelOutcome {
    pub role: ChannelRole,
    pub report: Option<DivergenceReport>,
    /// Insertion correction applied before hashing
    pub correction: Option<InsertionCorrection>,
    /// Why this channel could not be compared
    pub error: Option<String>,
}

impl ChannelOutcome {
    /// A failed channel is an Error; a corrected one is at least a Warning
    pub fn verdict(&self) -> Verdict {
        if self.error.is_some() {
            return Verdict::Error;
        }
        let verdict = self.report.as_ref().map_or(Verdict::Error, |r| r.verdict);
        if self.correction.is_some() {
            verdict.max(Verdict::Warning)
        } else {
            verdict
        }
    }
}

/// Aggregate result of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub mode: String,
    pub verdict: Verdict,
    pub frame_rate: String,
    pub sample_rate: u32,
    /// Timecode of the first frame
    pub origin: Timecode,
    /// No start timecode was known; spans count from 00:00:00:00
    pub virtual_timecode: bool,
    pub source_checksums: ChecksumSet,
    pub reference_checksums: ChecksumSet,
    pub channels: Vec<ChannelOutcome>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }

    pub fn failed_channels(&self) -> impl Iterator<Item = &ChannelOutcome> {
        self.channels.iter().filter(|c| c.error.is_some())
    }
}

/// How a run ended without a fatal error
#[derive(Debug, Clone)]
pub enum RunStatus {
    Completed(RunOutcome),
    Cancelled,
}

// ═══════════════════════════════════════════════════════════════════════════════
// ORCHESTRATOR
// ═══════════════════════════════════════════════════════════════════════════════

struct Timing {
    rate: FrameRate,
    origin: Timecode,
    virtual_timecode: bool,
}

/// Runs verification requests
///
/// Cancellation is sticky: once [`Orchestrator::cancel`] is called, every
/// later run on this instance ends as Cancelled.
pub struct Orchestrator {
    config: CheckConfig,
    extractor: Arc<dyn Extractor>,
    probe: Arc<dyn MetadataProbe>,
    state: Arc<RwLock<RunState>>,
    ctx: RunContext,
}

impl Orchestrator {
    /// Orchestrator backed by ffmpeg/ffprobe from `config`
    pub fn new(config: CheckConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            extractor: Arc::new(FfmpegExtractor::from_config(&config)),
            probe: Arc::new(FfprobeProbe::from_config(&config)),
            config,
            state: Arc::new(RwLock::new(RunState::Idle)),
            ctx: RunContext::new(),
        })
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn MetadataProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Use an externally built context (event channel, shared token)
    pub fn with_context(mut self, ctx: RunContext) -> Self {
        self.ctx = ctx;
        self
    }

    pub fn config(&self) -> &CheckConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.state.read().clone()
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    /// Request cancellation of the current run
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Run one verification to a terminal state
    ///
    /// Cancellation is reported as `Ok(RunStatus::Cancelled)`; every other
    /// failure leaves the state at `Fatal` and is returned as `Err`.
    pub fn run(&self, request: &RunRequest) -> Result<RunStatus> {
        self.ctx.progress().reset();
        self.set_state(RunState::Idle);

        match self.execute(request) {
            Ok(outcome) => {
                self.ctx.status(format!("run: {} check finished, {}", outcome.mode, outcome.verdict));
                self.set_state(RunState::Done(outcome.verdict));
                Ok(RunStatus::Completed(outcome))
            }
            Err(WavCheckError::Cancelled) => {
                self.ctx.log(log::Level::Warn, "run: cancelled");
                self.set_state(RunState::Cancelled);
                Ok(RunStatus::Cancelled)
            }
            Err(e) => {
                self.ctx.log(log::Level::Error, format!("run: {e}"));
                self.set_state(RunState::Fatal(e.to_string()));
                Err(e)
            }
        }
    }

    fn set_state(&self, state: RunState) {
        log::debug!("orchestrator: {:?} -> {:?}", *self.state.read(), state);
        *self.state.write() = state.clone();
        self.ctx.emit(RunEvent::StateChanged(state));
    }

    fn execute(&self, request: &RunRequest) -> Result<RunOutcome> {
        let mode = &request.mode;
        let roles = mode.roles();
        let reference = match (&request.reference, mode.needs_reference()) {
            (Some(reference), true) => Some(reference),
            (None, true) => {
                return Err(WavCheckError::Config(format!("{mode} check needs a reference")));
            }
            (_, false) => None,
        };
        self.ctx.status(format!("run: {mode} check of {} channel(s)", roles.len()));

        // Metadata first: nothing is extracted for an incompatible pair
        let source_desc = self.describe(&request.source)?;
        let reference_desc = match reference {
            Some(input) => self.describe(input)?,
            None => None,
        };
        let timing = self.timing(request, source_desc.as_ref())?;
        self.check_metadata(mode, source_desc.as_ref(), reference, reference_desc.as_ref())?;
        self.ctx.checkpoint()?;

        let work_dir = self.work_dir()?;
        let mut sides = vec![(Side::Source, &request.source, source_desc.as_ref())];
        if let Some(input) = reference {
            sides.push((Side::Reference, input, reference_desc.as_ref()));
        }
        let files = self.resolve_inputs(mode, &roles, &sides, work_dir.path())?;

        let (sample_rate, sample_width) = self.check_files(mode, &files)?;
        let plan = CadencePlan::new(timing.rate, sample_rate)?;
        log::info!(
            "run: {} at {sample_rate} Hz, {}-bit, {} samples per frame",
            timing.rate,
            sample_width * 8,
            plan.nominal_frame_samples()
        );

        self.set_state(RunState::Hashing);
        let pool = self.pool()?;
        let (corrections, failures) = if mode.correct_insertion() {
            self.locate_insertions(&pool, &roles, &files, &plan)?
        } else {
            (BTreeMap::new(), BTreeMap::new())
        };
        let mut sequences = self.hash_all(&pool, &files, &plan, &corrections)?;

        if !mode.needs_reference() {
            for role in &roles {
                let source = sequences
                    .get(&(Side::Source, *role))
                    .ok_or_else(|| missing_sequence(Side::Source, *role))?;
                let silence = silence_reference(source, plan.clone(), &self.ctx)?;
                sequences.insert((Side::Reference, *role), silence);
            }
        }

        self.set_state(RunState::Comparing);
        let checksums = |side: Side| {
            let mut set = ChecksumSet::new();
            for ((s, role), seq) in &sequences {
                if *s == side {
                    set.insert(*role, seq.stream_hash);
                }
            }
            set
        };
        let source_checksums = checksums(Side::Source);
        let reference_checksums = checksums(Side::Reference);
        let identical = source_checksums.matches(&reference_checksums);
        self.ctx.status(format!(
            "compare: combined checksums {}",
            if identical { "match" } else { "differ" }
        ));

        let mut comparator = Comparator::new(&plan, timing.origin, self.config.boundary_policy());
        if mode.escalates_warnings() {
            comparator = comparator.with_warning_escalation();
        }

        let mut channels = Vec::with_capacity(roles.len());
        for role in &roles {
            if let Some(message) = failures.get(role) {
                channels.push(ChannelOutcome {
                    role: *role,
                    report: None,
                    correction: None,
                    error: Some(message.clone()),
                });
                continue;
            }
            let source = sequences
                .get(&(Side::Source, *role))
                .ok_or_else(|| missing_sequence(Side::Source, *role))?;
            let reference = sequences
                .get(&(Side::Reference, *role))
                .ok_or_else(|| missing_sequence(Side::Reference, *role))?;

            let report = if identical {
                let mut report = DivergenceReport::matched(role.label(), source.len() as u64);
                report.timecode_available = plan.timecode_capable();
                report
            } else {
                comparator.compare(role.label(), source, reference)
            };
            log::info!("compare: {}", report.summary());
            channels.push(ChannelOutcome {
                role: *role,
                report: Some(report),
                correction: corrections.get(role).cloned(),
                error: None,
            });
        }

        // A late cancel still means no verdict
        self.ctx.checkpoint()?;

        let verdict = channels
            .iter()
            .map(ChannelOutcome::verdict)
            .max()
            .unwrap_or(Verdict::Match);
        Ok(RunOutcome {
            mode: mode.name().to_string(),
            verdict,
            frame_rate: timing.rate.to_string(),
            sample_rate,
            origin: timing.origin,
            virtual_timecode: timing.virtual_timecode,
            source_checksums,
            reference_checksums,
            channels,
        })
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Metadata
    // ───────────────────────────────────────────────────────────────────────────

    fn describe(&self, input: &MediaInput) -> Result<Option<MediaDescription>> {
        match input {
            MediaInput::Container(path) => self.probe.describe(path).map(Some),
            MediaInput::Wav(_) => Ok(None),
        }
    }

    fn timing(&self, request: &RunRequest, source: Option<&MediaDescription>) -> Result<Timing> {
        let rate = match (request.frame_rate, source) {
            (Some(rate), _) => rate,
            (None, Some(desc)) => desc.frame_rate()?,
            (None, None) => FrameRate::Fps29_97 { drop_frame: false },
        };
        let (origin, virtual_timecode) = match (&request.start_timecode, source) {
            (Some(tc), _) => (Timecode::parse(tc, rate)?, false),
            (None, Some(desc)) if desc.has_video() && desc.start_timecode.is_some() => {
                (desc.origin(rate)?, false)
            }
            _ => (Timecode::zero(rate), true),
        };
        if virtual_timecode {
            log::warn!("run: no start timecode, counting from {origin}");
        }
        Ok(Timing {
            rate,
            origin,
            virtual_timecode,
        })
    }

    fn check_metadata(
        &self,
        mode: &CheckMode,
        source: Option<&MediaDescription>,
        reference: Option<&MediaInput>,
        reference_desc: Option<&MediaDescription>,
    ) -> Result<()> {
        let source_info = source.map(|desc| stream_for_mode(mode, desc)).transpose()?;
        let reference_info = match (reference, reference_desc) {
            (_, Some(desc)) => Some(stream_for_mode(mode, desc)?.clone()),
            (Some(MediaInput::Wav(paths)), None) => match paths.first() {
                Some(path) => Some(AudioStreamInfo::from_wav(&WavStream::open(path)?)),
                None => None,
            },
            _ => None,
        };

        match (source_info, reference_info) {
            (Some(source), Some(reference)) => check_compatible(
                source,
                &reference,
                matches!(mode.extract_layout(), ExtractLayout::Interleaved { .. }),
                self.config.force_16bit_source,
            ),
            (Some(source), None) if !source.is_pcm() => Err(WavCheckError::Format(format!(
                "source audio is {}, not PCM",
                source.codec
            ))),
            _ => Ok(()),
        }
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Extraction
    // ───────────────────────────────────────────────────────────────────────────

    fn work_dir(&self) -> Result<TempDir> {
        let dir = match &self.config.work_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                tempfile::Builder::new().prefix("wavcheck-").tempdir_in(root)?
            }
            None => tempfile::Builder::new().prefix("wavcheck-").tempdir()?,
        };
        log::debug!("run: work directory {}", dir.path().display());
        Ok(dir)
    }

    /// Per-role WAV files for every side, extracting containers concurrently
    fn resolve_inputs(
        &self,
        mode: &CheckMode,
        roles: &[ChannelRole],
        sides: &[(Side, &MediaInput, Option<&MediaDescription>)],
        work_dir: &Path,
    ) -> Result<BTreeMap<Side, RoleFiles>> {
        if sides.iter().any(|(_, input, _)| input.is_container()) {
            self.set_state(RunState::Extracting);
        }

        let results: Vec<Result<(Side, RoleFiles)>> = thread::scope(|scope| {
            let handles: Vec<_> = sides
                .iter()
                .map(|&(side, input, desc)| {
                    scope.spawn(move || {
                        self.resolve_side(mode, roles, side, input, desc, work_dir)
                            .map(|files| (side, files))
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(WavCheckError::Extraction("extraction thread panicked".into()))
                    })
                })
                .collect()
        });

        let mut files = BTreeMap::new();
        let mut failure: Option<WavCheckError> = None;
        for result in results {
            match result {
                Ok((side, roles)) => {
                    files.insert(side, roles);
                }
                Err(e) if failure.is_none() || e.is_cancelled() => failure = Some(e),
                Err(e) => log::error!("extract: {e}"),
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(files),
        }
    }

    fn resolve_side(
        &self,
        mode: &CheckMode,
        roles: &[ChannelRole],
        side: Side,
        input: &MediaInput,
        desc: Option<&MediaDescription>,
        work_dir: &Path,
    ) -> Result<RoleFiles> {
        match input {
            MediaInput::Wav(paths) => {
                if paths.len() != roles.len() {
                    return Err(WavCheckError::ChannelLayout {
                        expected: roles.len(),
                        actual: paths.len(),
                    });
                }
                Ok(roles.iter().copied().zip(paths.iter().cloned()).collect())
            }
            MediaInput::Container(path) => {
                let outputs: Vec<PathBuf> = roles
                    .iter()
                    .map(|role| work_dir.join(format!("{side}_{}.wav", role.file_stem())))
                    .collect();
                let codec = match desc {
                    _ if side == Side::Source && self.config.force_16bit_source => "pcm_s16le",
                    Some(desc) => pcm_codec_for_bits(stream_for_mode(mode, desc)?.bits_per_sample),
                    None => "pcm_s24le",
                };
                if let Some(desc) = desc {
                    self.ctx
                        .progress()
                        .add_extract_expected(side, expected_extract_bytes(mode, desc));
                }

                let request = ExtractRequest::new(path, mode.extract_layout(), outputs)
                    .with_trim(mode.trim())
                    .with_codec(codec);
                self.ctx.status(format!("extract[{side}]: {}", path.display()));
                let written = self.extractor.extract(&request, &self.ctx, side)?;
                if written.len() != roles.len() {
                    return Err(WavCheckError::ChannelLayout {
                        expected: roles.len(),
                        actual: written.len(),
                    });
                }
                Ok(roles.iter().copied().zip(written).collect())
            }
        }
    }

    /// Open every header once: channel counts fixed by the mode, and one
    /// sample rate and width across all files
    fn check_files(&self, mode: &CheckMode, files: &BTreeMap<Side, RoleFiles>) -> Result<(u32, usize)> {
        let mut format: Option<(u32, usize, u16)> = None;
        for (side, roles) in files {
            for (role, path) in roles {
                let stream = WavStream::open(path)?;
                let channels = stream.channels();
                if let Some(expected) = mode.channels_per_file() {
                    if channels != expected {
                        return Err(WavCheckError::ChannelLayout {
                            expected: expected as usize,
                            actual: channels as usize,
                        });
                    }
                }

                let (rate, width, first_channels) =
                    *format.get_or_insert((stream.sample_rate(), stream.sample_width(), channels));
                if rate != stream.sample_rate() || width != stream.sample_width() {
                    return Err(WavCheckError::Format(format!(
                        "{side} {role}: {} Hz/{}-bit differs from {rate} Hz/{}-bit",
                        stream.sample_rate(),
                        stream.sample_width() * 8,
                        width * 8
                    )));
                }
                if channels != first_channels {
                    return Err(WavCheckError::ChannelLayout {
                        expected: first_channels as usize,
                        actual: channels as usize,
                    });
                }
                self.ctx.progress().add_hash_expected(*side, stream.data_len());
            }
        }
        format
            .map(|(rate, width, _)| (rate, width))
            .ok_or_else(|| WavCheckError::Config("no channels to check".into()))
    }

    // ───────────────────────────────────────────────────────────────────────────
    // Hashing
    // ───────────────────────────────────────────────────────────────────────────

    fn pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.max_parallel_channels)
            .thread_name(|i| format!("wavcheck-{i}"))
            .build()
            .map_err(|e| WavCheckError::Config(format!("cannot build worker pool: {e}")))
    }

    /// Locate the displaced span for every role
    ///
    /// An ambiguous search fails only its own channel; anything else ends the run.
    #[allow(clippy::type_complexity)]
    fn locate_insertions(
        &self,
        pool: &rayon::ThreadPool,
        roles: &[ChannelRole],
        files: &BTreeMap<Side, RoleFiles>,
        plan: &CadencePlan,
    ) -> Result<(BTreeMap<ChannelRole, InsertionCorrection>, BTreeMap<ChannelRole, String>)> {
        let locator = InsertionLocator::from_config(&self.config);
        let found: Vec<(ChannelRole, Result<InsertionCorrection>)> = pool.install(|| {
            roles
                .par_iter()
                .map(|role| (*role, self.locate_role(&locator, *role, files, plan)))
                .collect()
        });

        let mut corrections = BTreeMap::new();
        let mut failures = BTreeMap::new();
        for (role, result) in found {
            match result {
                Ok(correction) => {
                    self.ctx.status(format!(
                        "insertion[{role}]: {} samples displaced in {} at sample {}",
                        correction.span_samples(),
                        correction.displaced_side,
                        correction.displacement_sample_offset
                    ));
                    corrections.insert(role, correction);
                }
                Err(WavCheckError::InsertionAmbiguous(message)) => {
                    self.ctx.log(log::Level::Error, format!("insertion[{role}]: {message}"));
                    failures.insert(role, format!("insertion search failed: {message}"));
                }
                Err(e) => return Err(e),
            }
        }
        Ok((corrections, failures))
    }

    fn locate_role(
        &self,
        locator: &InsertionLocator,
        role: ChannelRole,
        files: &BTreeMap<Side, RoleFiles>,
        plan: &CadencePlan,
    ) -> Result<InsertionCorrection> {
        let mut source = WavStream::open(role_file(files, Side::Source, role)?)?;
        let mut reference = WavStream::open(role_file(files, Side::Reference, role)?)?;
        locator.locate(&mut source, &mut reference, plan, &self.ctx)
    }

    fn hash_all(
        &self,
        pool: &rayon::ThreadPool,
        files: &BTreeMap<Side, RoleFiles>,
        plan: &CadencePlan,
        corrections: &BTreeMap<ChannelRole, InsertionCorrection>,
    ) -> Result<BTreeMap<(Side, ChannelRole), FrameHashSequence>> {
        let jobs: Vec<(Side, ChannelRole, &Path)> = files
            .iter()
            .flat_map(|(side, roles)| {
                roles
                    .iter()
                    .map(move |(role, path)| (*side, *role, path.as_path()))
            })
            .collect();

        let hashed: Vec<((Side, ChannelRole), FrameHashSequence)> = pool.install(|| {
            jobs.par_iter()
                .map(|&(side, role, path)| -> Result<((Side, ChannelRole), FrameHashSequence)> {
                    let mut stream = WavStream::open(path)?;
                    let sequence =
                        hash_channel(&mut stream, plan.clone(), corrections.get(&role), &self.ctx, side)?;
                    log::info!(
                        "hash[{side}] {role}: {} frames, {:016x}",
                        sequence.len(),
                        sequence.stream_hash
                    );
                    Ok(((side, role), sequence))
                })
                .collect::<Result<Vec<_>>>()
        })?;
        self.ctx.publish_progress();
        Ok(hashed.into_iter().collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPERS
// ═══════════════════════════════════════════════════════════════════════════════

/// The audio stream a mode reads, checked against the layout it expects
fn stream_for_mode<'a>(mode: &CheckMode, desc: &'a MediaDescription) -> Result<&'a AudioStreamInfo> {
    match mode.extract_layout() {
        ExtractLayout::Interleaved { stream_index } => desc.audio_stream(stream_index),
        ExtractLayout::SplitStereo => stream_with_channels(desc, 2),
        ExtractLayout::Split51 => stream_with_channels(desc, 6),
        ExtractLayout::StreamsToMono { count } => mono_streams(desc, count),
        ExtractLayout::JoinStereo => mono_streams(desc, 2),
    }
}

fn stream_with_channels(desc: &MediaDescription, channels: u16) -> Result<&AudioStreamInfo> {
    let stream = desc.audio_stream(0)?;
    if stream.channels != channels {
        return Err(WavCheckError::ChannelLayout {
            expected: channels as usize,
            actual: stream.channels as usize,
        });
    }
    Ok(stream)
}

fn mono_streams(desc: &MediaDescription, count: usize) -> Result<&AudioStreamInfo> {
    if desc.audio_streams.len() < count {
        return Err(WavCheckError::ChannelLayout {
            expected: count,
            actual: desc.audio_streams.len(),
        });
    }
    if let Some(stream) = desc.audio_streams[..count].iter().find(|s| s.channels != 1) {
        return Err(WavCheckError::ChannelLayout {
            expected: 1,
            actual: stream.channels as usize,
        });
    }
    desc.audio_stream(0)
}

/// Bytes the extraction of `desc` writes, after trims
fn expected_extract_bytes(mode: &CheckMode, desc: &MediaDescription) -> u64 {
    let Some(total) = desc.duration_secs else {
        return 0;
    };
    let trim = mode.trim();
    let mut secs = total - trim.head_secs.unwrap_or(0.0);
    if let Some(duration) = trim.duration_secs {
        secs = secs.min(duration);
    }
    let streams: Vec<&AudioStreamInfo> = match mode.extract_layout() {
        ExtractLayout::Interleaved { stream_index } => desc.audio_streams.get(stream_index).into_iter().collect(),
        ExtractLayout::SplitStereo | ExtractLayout::Split51 => desc.audio_streams.first().into_iter().collect(),
        ExtractLayout::StreamsToMono { count } => desc.audio_streams.iter().take(count).collect(),
        ExtractLayout::JoinStereo => desc.audio_streams.iter().take(2).collect(),
    };
    streams.iter().map(|s| s.predicted_bytes(secs)).sum()
}

fn role_file(files: &BTreeMap<Side, RoleFiles>, side: Side, role: ChannelRole) -> Result<&Path> {
    files
        .get(&side)
        .and_then(|roles| roles.get(&role))
        .map(PathBuf::as_path)
        .ok_or_else(|| WavCheckError::Config(format!("no {side} file for {role}")))
}

fn missing_sequence(side: Side, role: ChannelRole) -> WavCheckError {
    WavCheckError::Config(format!("no {side} hashes for {role}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{OaLayout, Trim};
    use crate::test_util::{noise, wav_bytes};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    const RATE: u32 = 48_000;

    fn write_wav(dir: &TempDir, name: &str, samples: &[i16], channels: u16) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, wav_bytes(samples, channels, RATE)).unwrap();
        path
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(CheckConfig::default()).unwrap()
    }

    fn completed(status: RunStatus) -> RunOutcome {
        match status {
            RunStatus::Completed(outcome) => outcome,
            RunStatus::Cancelled => panic!("run was cancelled"),
        }
    }

    /// Writes prepared WAV bytes to the requested outputs
    struct CopyExtractor {
        fixtures: Vec<Vec<u8>>,
        calls: AtomicUsize,
    }

    impl Extractor for CopyExtractor {
        fn extract(&self, request: &ExtractRequest, ctx: &RunContext, side: Side) -> Result<Vec<PathBuf>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ctx.checkpoint()?;
            let mut written = 0u64;
            for (path, bytes) in request.outputs.iter().zip(&self.fixtures) {
                std::fs::write(path, bytes)?;
                written += bytes.len() as u64;
            }
            ctx.progress().set_extracted(side, written);
            Ok(request.outputs.clone())
        }
    }

    /// Never finishes on its own
    struct StallingExtractor;

    impl Extractor for StallingExtractor {
        fn extract(&self, _: &ExtractRequest, ctx: &RunContext, _: Side) -> Result<Vec<PathBuf>> {
            loop {
                ctx.checkpoint()?;
                thread::sleep(Duration::from_millis(5));
            }
        }
    }

    struct FixedProbe(MediaDescription);

    impl MetadataProbe for FixedProbe {
        fn describe(&self, _: &Path) -> Result<MediaDescription> {
            Ok(self.0.clone())
        }
    }

    fn surround_description(codec: &str) -> MediaDescription {
        MediaDescription {
            audio_streams: vec![AudioStreamInfo {
                index: 0,
                codec: codec.into(),
                bits_per_sample: 16,
                sample_rate: RATE,
                channels: 6,
            }],
            video_frame_rate: Some("25/1".into()),
            start_timecode: Some("10:00:00:00".into()),
            duration_secs: Some(1.0),
        }
    }

    #[test]
    fn test_identical_wavs_match_through_checksum_gate() {
        let dir = TempDir::new().unwrap();
        let samples = noise(2 * RATE as usize, 1);
        let src = write_wav(&dir, "src.wav", &samples, 2);
        let reference = write_wav(&dir, "ref.wav", &samples, 2);

        let mode = CheckMode::Interleaved {
            stream_index: 0,
            trim: Trim::default(),
            correct_insertion: false,
        };
        let request = RunRequest::new(mode, MediaInput::Wav(vec![src]))
            .with_reference(MediaInput::Wav(vec![reference]));
        let orch = orchestrator();
        let outcome = completed(orch.run(&request).unwrap());

        assert_eq!(outcome.verdict, Verdict::Match);
        assert!(outcome.virtual_timecode);
        assert_eq!(outcome.source_checksums, outcome.reference_checksums);
        assert_eq!(orch.state(), RunState::Done(Verdict::Match));
        assert!(outcome.channels[0].report.as_ref().unwrap().spans.is_empty());
    }

    #[test]
    fn test_container_source_is_extracted_and_compared() {
        let dir = TempDir::new().unwrap();
        let channels: Vec<Vec<i16>> = (0..6).map(|seed| noise(RATE as usize, seed)).collect();
        let fixtures: Vec<Vec<u8>> = channels.iter().map(|c| wav_bytes(c, 1, RATE)).collect();
        let references: Vec<PathBuf> = channels
            .iter()
            .enumerate()
            .map(|(i, c)| write_wav(&dir, &format!("ref{i}.wav"), c, 1))
            .collect();

        let extractor = Arc::new(CopyExtractor {
            fixtures,
            calls: AtomicUsize::new(0),
        });
        let (tx, rx) = crossbeam_channel::unbounded();
        let orch = orchestrator()
            .with_extractor(extractor.clone())
            .with_probe(Arc::new(FixedProbe(surround_description("pcm_s16le"))))
            .with_context(RunContext::new().with_events(tx));

        let request = RunRequest::new(
            CheckMode::Surround51 { trim: Trim::default() },
            MediaInput::Container(dir.path().join("program.mov")),
        )
        .with_reference(MediaInput::Wav(references));
        let outcome = completed(orch.run(&request).unwrap());

        assert_eq!(outcome.verdict, Verdict::Match);
        assert_eq!(outcome.channels.len(), 6);
        assert_eq!(outcome.origin.to_string(), "10:00:00:00");
        assert!(!outcome.virtual_timecode);
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 1);

        let states: Vec<RunState> = rx
            .try_iter()
            .filter_map(|event| match event {
                RunEvent::StateChanged(state) => Some(state),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                RunState::Idle,
                RunState::Extracting,
                RunState::Hashing,
                RunState::Comparing,
                RunState::Done(Verdict::Match),
            ]
        );
    }

    #[test]
    fn test_non_pcm_source_fails_before_extraction() {
        let dir = TempDir::new().unwrap();
        let references: Vec<PathBuf> = (0..6)
            .map(|i| write_wav(&dir, &format!("ref{i}.wav"), &noise(1000, i), 1))
            .collect();
        let extractor = Arc::new(CopyExtractor {
            fixtures: Vec::new(),
            calls: AtomicUsize::new(0),
        });
        let orch = orchestrator()
            .with_extractor(extractor.clone())
            .with_probe(Arc::new(FixedProbe(surround_description("aac"))));

        let request = RunRequest::new(
            CheckMode::Surround51 { trim: Trim::default() },
            MediaInput::Container(dir.path().join("program.mov")),
        )
        .with_reference(MediaInput::Wav(references));

        assert!(matches!(orch.run(&request), Err(WavCheckError::Format(_))));
        assert_eq!(extractor.calls.load(Ordering::SeqCst), 0);
        assert!(matches!(orch.state(), RunState::Fatal(_)));
    }

    #[test]
    fn test_cancel_during_extraction() {
        let dir = TempDir::new().unwrap();
        let reference = write_wav(&dir, "ref.wav", &noise(1000, 3), 1);
        let orch = orchestrator()
            .with_extractor(Arc::new(StallingExtractor))
            .with_probe(Arc::new(FixedProbe(MediaDescription {
                audio_streams: vec![AudioStreamInfo {
                    index: 0,
                    codec: "pcm_s16le".into(),
                    bits_per_sample: 16,
                    sample_rate: RATE,
                    channels: 1,
                }],
                ..MediaDescription::default()
            })));

        let request = RunRequest::new(
            CheckMode::Interleaved {
                stream_index: 0,
                trim: Trim::default(),
                correct_insertion: false,
            },
            MediaInput::Container(dir.path().join("program.mxf")),
        )
        .with_reference(MediaInput::Wav(vec![reference]));

        let status = thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(50));
                orch.cancel();
            });
            orch.run(&request).unwrap()
        });

        assert!(matches!(status, RunStatus::Cancelled));
        assert_eq!(orch.state(), RunState::Cancelled);
    }

    #[test]
    fn test_wrong_file_count_is_fatal() {
        let dir = TempDir::new().unwrap();
        let a = write_wav(&dir, "a.wav", &noise(1000, 1), 1);
        let b = write_wav(&dir, "b.wav", &noise(1000, 2), 1);
        let request = RunRequest::new(
            CheckMode::Surround51 { trim: Trim::default() },
            MediaInput::Wav(vec![a.clone(), b.clone()]),
        )
        .with_reference(MediaInput::Wav(vec![a, b]));

        let orch = orchestrator();
        let err = orch.run(&request).unwrap_err();
        assert!(matches!(err, WavCheckError::ChannelLayout { expected: 6, actual: 2 }));
        assert!(matches!(orch.state(), RunState::Fatal(_)));
    }

    #[test]
    fn test_stereo_file_in_mono_mode_is_fatal() {
        let dir = TempDir::new().unwrap();
        let stereo = write_wav(&dir, "st.wav", &noise(2000, 1), 2);
        let request = RunRequest::new(
            CheckMode::MultiMonoStereo { trim: Trim::default() },
            MediaInput::Wav(vec![stereo.clone(), stereo.clone()]),
        )
        .with_reference(MediaInput::Wav(vec![stereo.clone(), stereo]));

        let err = orchestrator().run(&request).unwrap_err();
        assert!(matches!(err, WavCheckError::ChannelLayout { expected: 1, actual: 2 }));
    }

    #[test]
    fn test_swapped_channels_are_errors() {
        let dir = TempDir::new().unwrap();
        let left = write_wav(&dir, "l.wav", &noise(RATE as usize, 10), 1);
        let right = write_wav(&dir, "r.wav", &noise(RATE as usize, 11), 1);
        let request = RunRequest::new(
            CheckMode::OaEightChannel {
                layout: OaLayout::TwoStreams,
                trim: Trim::default(),
                correct_insertion: false,
            },
            MediaInput::Wav(vec![right.clone(), left.clone()]),
        )
        .with_reference(MediaInput::Wav(vec![left, right]));

        let outcome = completed(orchestrator().run(&request).unwrap());
        assert_eq!(outcome.verdict, Verdict::Error);
        for channel in &outcome.channels {
            let report = channel.report.as_ref().unwrap();
            assert_eq!(report.verdict, Verdict::Error);
            assert_eq!(report.spans.len(), 1);
            assert_eq!(report.spans[0].start_frame, 0);
        }
    }

    #[test]
    fn test_silence_check() {
        let dir = TempDir::new().unwrap();
        let mut samples = vec![0i16; RATE as usize];
        let silent = write_wav(&dir, "silent.wav", &samples, 1);
        samples[RATE as usize - 10] = 1;
        let blip = write_wav(&dir, "blip.wav", &samples, 1);
        let mode = CheckMode::Silence { trim: Trim::default() };

        let outcome = completed(
            orchestrator()
                .run(&RunRequest::new(mode.clone(), MediaInput::Wav(vec![silent])))
                .unwrap(),
        );
        assert_eq!(outcome.verdict, Verdict::Match);

        let outcome = completed(
            orchestrator()
                .run(&RunRequest::new(mode, MediaInput::Wav(vec![blip])))
                .unwrap(),
        );
        assert_eq!(outcome.verdict, Verdict::Error);
    }

    #[test]
    fn test_missing_reference_is_config_error() {
        let dir = TempDir::new().unwrap();
        let src = write_wav(&dir, "src.wav", &noise(100, 1), 1);
        let request = RunRequest::new(
            CheckMode::MultiMonoInterleave {
                trim: Trim::default(),
                correct_insertion: false,
            },
            MediaInput::Wav(vec![src]),
        );
        assert!(matches!(orchestrator().run(&request), Err(WavCheckError::Config(_))));
    }
}
