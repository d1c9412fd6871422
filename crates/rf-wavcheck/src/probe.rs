//! Container metadata probe
//!
//! Reads what the run needs to know before extraction: audio stream formats,
//! the video frame rate and the start timecode.

use std::collections::HashMap;
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};

use crate::cadence::FrameRate;
use crate::config::CheckConfig;
use crate::timecode::Timecode;
use crate::wav::WavStream;
use crate::{Result, WavCheckError};

/// Something that can describe a media file
pub trait MetadataProbe: Send + Sync {
    fn describe(&self, path: &Path) -> Result<MediaDescription>;
}

/// Format of one audio stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    /// Index among the audio streams (the `N` in `0:a:N`)
    pub index: usize,
    pub codec: String,
    pub bits_per_sample: u16,
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioStreamInfo {
    /// Format of an already extracted WAV
    pub fn from_wav<R: Read + Seek>(stream: &WavStream<R>) -> Self {
        let bits = (stream.sample_width() * 8) as u16;
        Self {
            index: 0,
            codec: pcm_codec_for_bits(bits).to_string(),
            bits_per_sample: bits,
            sample_rate: stream.sample_rate(),
            channels: stream.channels(),
        }
    }

    pub fn is_pcm(&self) -> bool {
        self.codec.starts_with("pcm_")
    }

    /// Size of an extracted WAV of `duration_secs`, used as progress maximum
    pub fn predicted_bytes(&self, duration_secs: f64) -> u64 {
        let bytes_per_sec = self.sample_rate as f64 * self.channels as f64 * (self.bits_per_sample / 8) as f64;
        (duration_secs.max(0.0) * bytes_per_sec) as u64
    }
}

/// What a probe found in a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaDescription {
    pub audio_streams: Vec<AudioStreamInfo>,
    /// ffprobe `r_frame_rate` of the first video stream
    pub video_frame_rate: Option<String>,
    pub start_timecode: Option<String>,
    pub duration_secs: Option<f64>,
}

impl MediaDescription {
    /// Parse `ffprobe -show_streams -show_format -of json` output
    pub fn from_ffprobe_json(json: &str) -> Result<Self> {
        let output: FfprobeOutput =
            serde_json::from_str(json).map_err(|e| WavCheckError::Probe(format!("bad ffprobe output: {e}")))?;

        let mut description = MediaDescription::default();
        let mut stream_timecode = None;
        for stream in &output.streams {
            match stream.codec_type.as_deref() {
                Some("audio") => {
                    let index = description.audio_streams.len();
                    description.audio_streams.push(stream.audio_info(index)?);
                }
                Some("video") if description.video_frame_rate.is_none() => {
                    description.video_frame_rate = stream.r_frame_rate.clone();
                    if let Some(tc) = stream.tag("timecode") {
                        stream_timecode = Some(tc);
                    }
                }
                _ => {
                    if stream_timecode.is_none() {
                        stream_timecode = stream.tag("timecode");
                    }
                }
            }
        }

        let format = output.format.unwrap_or_default();
        description.start_timecode = stream_timecode.or_else(|| tag(&format.tags, "timecode"));
        description.duration_secs = format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok());
        Ok(description)
    }

    pub fn has_video(&self) -> bool {
        self.video_frame_rate.is_some()
    }

    /// Frame rate for the cadence; files without video count as 29.97 NDF
    pub fn frame_rate(&self) -> Result<FrameRate> {
        match &self.video_frame_rate {
            Some(rate) => FrameRate::from_ffprobe(rate, self.start_timecode.as_deref()),
            None => Ok(FrameRate::Fps29_97 { drop_frame: false }),
        }
    }

    /// Start timecode on `rate`'s grid; 00:00:00:00 when absent
    pub fn origin(&self, rate: FrameRate) -> Result<Timecode> {
        match (&self.start_timecode, self.has_video()) {
            (Some(tc), true) => Timecode::parse(tc, rate),
            _ => Ok(Timecode::zero(rate)),
        }
    }

    pub fn audio_stream(&self, index: usize) -> Result<&AudioStreamInfo> {
        self.audio_streams.get(index).ok_or_else(|| {
            WavCheckError::Probe(format!(
                "audio stream {index} requested, {} present",
                self.audio_streams.len()
            ))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMPATIBILITY
// ═══════════════════════════════════════════════════════════════════════════════

/// ffmpeg PCM codec for a bit depth
pub fn pcm_codec_for_bits(bits: u16) -> &'static str {
    match bits {
        8 => "pcm_u8",
        16 => "pcm_s16le",
        32 => "pcm_s32le",
        _ => "pcm_s24le",
    }
}

/// Refuse pairs that can never compare equal sample for sample
///
/// With `force_16bit` the source is decoded to 16 bit, so only the reference
/// depth has to be 16.
pub fn check_compatible(
    source: &AudioStreamInfo,
    reference: &AudioStreamInfo,
    compare_channel_count: bool,
    force_16bit: bool,
) -> Result<()> {
    for (side, info) in [("source", source), ("reference", reference)] {
        if !info.is_pcm() {
            return Err(WavCheckError::Format(format!("{side} audio is {}, not PCM", info.codec)));
        }
    }

    let source_bits = if force_16bit { 16 } else { source.bits_per_sample };
    if source_bits != reference.bits_per_sample {
        return Err(WavCheckError::Format(format!(
            "bit depth differs: source {source_bits}, reference {}",
            reference.bits_per_sample
        )));
    }
    if source.sample_rate != reference.sample_rate {
        return Err(WavCheckError::Format(format!(
            "sample rate differs: source {} Hz, reference {} Hz",
            source.sample_rate, reference.sample_rate
        )));
    }
    if compare_channel_count && source.channels != reference.channels {
        return Err(WavCheckError::ChannelLayout {
            expected: reference.channels as usize,
            actual: source.channels as usize,
        });
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// FFPROBE
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata through the `ffprobe` command line tool
#[derive(Debug, Clone)]
pub struct FfprobeProbe {
    program: PathBuf,
}

impl FfprobeProbe {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    pub fn from_config(config: &CheckConfig) -> Self {
        Self::new(config.ffprobe_path.clone())
    }
}

impl MetadataProbe for FfprobeProbe {
    fn describe(&self, path: &Path) -> Result<MediaDescription> {
        let output = Command::new(&self.program)
            .args(["-v", "warning", "-i"])
            .arg(path)
            .args(["-show_streams", "-show_format", "-of", "json"])
            .output()
            .map_err(|e| WavCheckError::Probe(format!("cannot start {}: {e}", self.program.display())))?;

        if !output.status.success() {
            return Err(WavCheckError::Probe(format!(
                "{}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let description = MediaDescription::from_ffprobe_json(&String::from_utf8_lossy(&output.stdout))?;
        log::debug!(
            "probe: {} audio stream(s), rate {:?}, tc {:?}",
            description.audio_streams.len(),
            description.video_frame_rate,
            description.start_timecode
        );
        Ok(description)
    }
}

#[derive(Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: Option<FfprobeFormat>,
}

#[derive(Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u16>,
    bits_per_sample: Option<u16>,
    bits_per_raw_sample: Option<String>,
    r_frame_rate: Option<String>,
    tags: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Default)]
struct FfprobeFormat {
    duration: Option<String>,
    tags: Option<HashMap<String, String>>,
}

impl FfprobeStream {
    fn tag(&self, key: &str) -> Option<String> {
        tag(&self.tags, key)
    }

    fn audio_info(&self, index: usize) -> Result<AudioStreamInfo> {
        let codec = self.codec_name.clone().unwrap_or_default();
        let bits = self
            .bits_per_sample
            .filter(|b| *b > 0)
            .or_else(|| self.bits_per_raw_sample.as_deref().and_then(|b| b.parse().ok()))
            .unwrap_or(0);
        let sample_rate = self
            .sample_rate
            .as_deref()
            .and_then(|r| r.parse().ok())
            .ok_or_else(|| WavCheckError::Probe(format!("audio stream {index} has no sample rate")))?;
        Ok(AudioStreamInfo {
            index,
            codec,
            bits_per_sample: bits,
            sample_rate,
            channels: self.channels.unwrap_or(0),
        })
    }
}

fn tag(tags: &Option<HashMap<String, String>>, key: &str) -> Option<String> {
    tags.as_ref()?
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.clone())
}
