//! Frame cadence model
//!
//! Maps video frames to PCM sample counts. NTSC-derived rates do not divide
//! the sample rate evenly, so individual frames carry a few extra samples in a
//! fixed repeating pattern that keeps long-term sync exact.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Result, WavCheckError};

// ═══════════════════════════════════════════════════════════════════════════════
// FRAME RATE
// ═══════════════════════════════════════════════════════════════════════════════

/// Video frame rate tag
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FrameRate {
    /// 24000/1001
    Fps23_98,
    Fps24,
    Fps25,
    /// 30000/1001, drop-frame or non-drop-frame counting
    Fps29_97 { drop_frame: bool },
    Fps30,
    /// Any other rate; frames are floor(sample_rate / fps) samples
    Other(f64),
}

impl FrameRate {
    /// Parse a rate tag such as "29.97" or "25"
    ///
    /// For 29.97 the timecode's last separator picks the counting mode:
    /// `;` (or `.`) is drop-frame, `:` is non-drop-frame.
    pub fn parse(tag: &str, timecode: Option<&str>) -> Result<Self> {
        let fps: f64 = tag
            .trim()
            .parse()
            .map_err(|_| WavCheckError::Format(format!("invalid frame rate '{tag}'")))?;
        Self::from_fps(fps, timecode)
    }

    /// Parse an ffprobe `r_frame_rate` fraction such as "30000/1001"
    ///
    /// The quotient is rounded to two decimals before classification, which
    /// is how 29.97 and 23.98 material is recognised.
    pub fn from_ffprobe(r_frame_rate: &str, timecode: Option<&str>) -> Result<Self> {
        let invalid = || WavCheckError::Format(format!("invalid r_frame_rate '{r_frame_rate}'"));
        let (num, den) = match r_frame_rate.split_once('/') {
            Some((n, d)) => (
                n.trim().parse::<f64>().map_err(|_| invalid())?,
                d.trim().parse::<f64>().map_err(|_| invalid())?,
            ),
            None => (r_frame_rate.trim().parse::<f64>().map_err(|_| invalid())?, 1.0),
        };
        if den == 0.0 {
            return Err(invalid());
        }
        let rounded = (num / den * 100.0).round() / 100.0;
        Self::from_fps(rounded, timecode)
    }

    fn from_fps(fps: f64, timecode: Option<&str>) -> Result<Self> {
        if !fps.is_finite() || fps <= 0.0 {
            return Err(WavCheckError::Format(format!("frame rate must be positive, got {fps}")));
        }
        let near = |target: f64| (fps - target).abs() < 0.005;
        Ok(if near(23.98) || near(23.976) {
            Self::Fps23_98
        } else if near(24.0) {
            Self::Fps24
        } else if near(25.0) {
            Self::Fps25
        } else if near(29.97) {
            Self::Fps29_97 {
                drop_frame: timecode.map(is_drop_frame_timecode).unwrap_or(false),
            }
        } else if near(30.0) {
            Self::Fps30
        } else {
            Self::Other(fps)
        })
    }

    /// Integer rate the base frame size is derived from
    pub fn nominal_fps(&self) -> f64 {
        match self {
            Self::Fps23_98 | Self::Fps24 => 24.0,
            Self::Fps25 => 25.0,
            Self::Fps29_97 { .. } | Self::Fps30 => 30.0,
            Self::Other(fps) => *fps,
        }
    }

    /// Frames per timecode second
    pub fn timecode_base(&self) -> u32 {
        match self {
            Self::Other(fps) => (fps.round() as u32).max(1),
            other => other.nominal_fps() as u32,
        }
    }

    pub fn is_drop_frame(&self) -> bool {
        matches!(self, Self::Fps29_97 { drop_frame: true })
    }
}

impl fmt::Display for FrameRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fps23_98 => write!(f, "23.98"),
            Self::Fps24 => write!(f, "24"),
            Self::Fps25 => write!(f, "25"),
            Self::Fps29_97 { drop_frame: true } => write!(f, "29.97 DF"),
            Self::Fps29_97 { drop_frame: false } => write!(f, "29.97 NDF"),
            Self::Fps30 => write!(f, "30"),
            Self::Other(fps) => write!(f, "{fps}"),
        }
    }
}

/// `HH:MM:SS;FF` style timecode (separator before the frame field)
fn is_drop_frame_timecode(tc: &str) -> bool {
    let tc = tc.trim();
    tc.len() >= 3 && matches!(tc.as_bytes()[tc.len() - 3], b';' | b'.')
}

// ═══════════════════════════════════════════════════════════════════════════════
// CADENCE PLAN
// ═══════════════════════════════════════════════════════════════════════════════

/// 29.97 @ 48 kHz: 8008 samples per 5 frames
const NTSC_48K_DELTAS: [u64; 5] = [2, 1, 2, 1, 2];
/// 29.97 @ 96 kHz: 16016 samples per 5 frames
const NTSC_96K_DELTAS: [u64; 5] = [3, 3, 4, 3, 3];

/// Frame rate used for 44.1 kHz family material, which has no video mapping
const VIRTUAL_FPS_44K: u64 = 30;

/// Restartable sequence of per-frame sample counts
#[derive(Debug, Clone, PartialEq)]
pub struct CadencePlan {
    frame_rate: FrameRate,
    sample_rate: u32,
    base: u64,
    deltas: Vec<u64>,
    phase: usize,
    timecode_capable: bool,
}

impl CadencePlan {
    pub fn new(frame_rate: FrameRate, sample_rate: u32) -> Result<Self> {
        if sample_rate == 0 {
            return Err(WavCheckError::Format("sample rate is zero".into()));
        }
        let sr = sample_rate as u64;

        if sr % 44_100 == 0 {
            log::debug!(
                "cadence: {}Hz has no video mapping, using a virtual {} fps grid",
                sample_rate,
                VIRTUAL_FPS_44K
            );
            return Ok(Self {
                frame_rate,
                sample_rate,
                base: sr / VIRTUAL_FPS_44K,
                deltas: Vec::new(),
                phase: 0,
                timecode_capable: false,
            });
        }

        let (base, deltas) = match frame_rate {
            FrameRate::Fps23_98 => {
                let base = sr / 24;
                (base, vec![base / 1000])
            }
            FrameRate::Fps24 => (sr / 24, Vec::new()),
            FrameRate::Fps25 => (sr / 25, Vec::new()),
            FrameRate::Fps30 => (sr / 30, Vec::new()),
            FrameRate::Fps29_97 { .. } => {
                let base = sr / 30;
                let deltas = match sample_rate {
                    48_000 => NTSC_48K_DELTAS.to_vec(),
                    96_000 => NTSC_96K_DELTAS.to_vec(),
                    _ => ntsc_deltas(sr, base)?,
                };
                (base, deltas)
            }
            FrameRate::Other(fps) => ((sr as f64 / fps).floor() as u64, Vec::new()),
        };

        if base == 0 {
            return Err(WavCheckError::Format(format!(
                "{frame_rate} fps at {sample_rate}Hz gives empty frames"
            )));
        }

        Ok(Self {
            frame_rate,
            sample_rate,
            base,
            deltas,
            phase: 0,
            timecode_capable: true,
        })
    }

    /// Samples in the next frame; advances the cycle
    pub fn next_frame_size(&mut self) -> u64 {
        let size = self.peek_frame_size();
        if !self.deltas.is_empty() {
            self.phase = (self.phase + 1) % self.deltas.len();
        }
        size
    }

    /// Samples in the next frame without advancing
    pub fn peek_frame_size(&self) -> u64 {
        self.base + self.deltas.get(self.phase).copied().unwrap_or(0)
    }

    /// Position in the cycle (0 for non-cyclic rates)
    pub fn phase(&self) -> usize {
        self.phase
    }

    /// Same plan, resumed at a given cycle position
    pub fn with_phase(mut self, phase: usize) -> Self {
        self.phase = phase % self.cycle_len();
        self
    }

    pub fn reset(&mut self) {
        self.phase = 0;
    }

    pub fn cycle_len(&self) -> usize {
        self.deltas.len().max(1)
    }

    /// Sum of frame sizes over one full cycle
    pub fn cycle_total(&self) -> u64 {
        self.base * self.cycle_len() as u64 + self.deltas.iter().sum::<u64>()
    }

    /// floor(sample_rate / nominal_fps)
    pub fn nominal_frame_samples(&self) -> u64 {
        self.base
    }

    pub fn max_frame_samples(&self) -> u64 {
        self.base + self.deltas.iter().copied().max().unwrap_or(0)
    }

    /// False for 44.1 kHz material: spans are reported without timecode
    pub fn timecode_capable(&self) -> bool {
        self.timecode_capable
    }

    pub fn frame_rate(&self) -> FrameRate {
        self.frame_rate
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Index of the video frame containing `sample`, counting from phase 0
    pub fn frame_index_of_sample(&self, sample: u64) -> u64 {
        let total = self.cycle_total();
        let cycles = sample / total;
        let mut rest = sample % total;
        let mut index = cycles * self.cycle_len() as u64;
        let mut walker = self.clone();
        walker.reset();
        loop {
            let size = walker.next_frame_size();
            if rest < size {
                return index;
            }
            rest -= size;
            index += 1;
        }
    }

    /// First sample of video frame `frame`, counting from phase 0
    pub fn frame_start_sample(&self, frame: u64) -> u64 {
        let len = self.cycle_len() as u64;
        let mut start = (frame / len) * self.cycle_total();
        let mut walker = self.clone();
        walker.reset();
        for _ in 0..frame % len {
            start += walker.next_frame_size();
        }
        start
    }
}

impl Iterator for CadencePlan {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        Some(self.next_frame_size())
    }
}

/// Spread the 5-frame surplus of 29.97 evenly for rates without a fixed table
fn ntsc_deltas(sr: u64, base: u64) -> Result<Vec<u64>> {
    let numerator = sr * 5 * 1001;
    if numerator % 30_000 != 0 {
        return Err(WavCheckError::Format(format!(
            "29.97 fps cadence is not defined at {sr}Hz"
        )));
    }
    let extra = numerator / 30_000 - base * 5;
    Ok((0..5u64)
        .map(|i| (i + 1) * extra / 5 - i * extra / 5)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ntsc(sr: u32) -> CadencePlan {
        CadencePlan::new(FrameRate::Fps29_97 { drop_frame: false }, sr).unwrap()
    }

    #[test]
    fn test_ntsc_48k_pattern() {
        let sizes: Vec<u64> = ntsc(48000).take(6).collect();
        assert_eq!(sizes, vec![1602, 1601, 1602, 1601, 1602, 1602]);
    }

    #[test]
    fn test_ntsc_96k_pattern() {
        let sizes: Vec<u64> = ntsc(96000).take(5).collect();
        assert_eq!(sizes, vec![3203, 3203, 3204, 3203, 3203]);
    }

    // Policy check: 5 consecutive frames from any phase sum to rate * 5 * 1001 / 30000
    #[test]
    fn test_cycle_sum_from_any_phase() {
        for (sr, expected) in [(48000u32, 8008u64), (96000, 16016)] {
            for phase in 0..5 {
                let sum: u64 = ntsc(sr).with_phase(phase).take(5).sum();
                assert_eq!(sum, expected, "sr={sr} phase={phase}");
            }
        }
    }

    // 24000/1001 fps: every frame carries sample_rate * 1001 / 24000 samples
    #[test]
    fn test_film_cycle_sum_per_rate() {
        for (sr, per_frame) in [(48000u32, 2002u64), (96000, 4004), (192000, 8008)] {
            let plan = CadencePlan::new(FrameRate::Fps23_98, sr).unwrap();
            assert_eq!(plan.cycle_total(), per_frame, "sr={sr}");
            let second: u64 = plan.clone().take(24).sum();
            assert_eq!(second, 24 * per_frame, "sr={sr}");
            assert_eq!(plan.frame_start_sample(24), 24 * per_frame);
            assert_eq!(plan.frame_index_of_sample(24 * per_frame - 1), 23);
            assert!(plan.timecode_capable());
        }
    }

    #[test]
    fn test_other_ntsc_rate_keeps_sync() {
        let sum: u64 = ntsc(192000).take(5).sum();
        assert_eq!(sum, 32032);
        assert!(CadencePlan::new(FrameRate::Fps29_97 { drop_frame: true }, 32000).is_err());
    }

    #[test]
    fn test_film_and_integer_rates() {
        let mut film = CadencePlan::new(FrameRate::Fps23_98, 48000).unwrap();
        assert_eq!(film.next_frame_size(), 2002);
        assert_eq!(film.next_frame_size(), 2002);

        assert_eq!(CadencePlan::new(FrameRate::Fps24, 48000).unwrap().peek_frame_size(), 2000);
        assert_eq!(CadencePlan::new(FrameRate::Fps25, 48000).unwrap().peek_frame_size(), 1920);
        assert_eq!(CadencePlan::new(FrameRate::Fps30, 48000).unwrap().peek_frame_size(), 1600);
        assert_eq!(CadencePlan::new(FrameRate::Other(50.0), 48000).unwrap().peek_frame_size(), 960);
    }

    #[test]
    fn test_44k_uses_virtual_grid() {
        let plan = CadencePlan::new(FrameRate::Fps25, 44100).unwrap();
        assert_eq!(plan.peek_frame_size(), 1470);
        assert!(!plan.timecode_capable());
        assert!(ntsc(48000).timecode_capable());
    }

    #[test]
    fn test_restart_is_deterministic() {
        let mut plan = ntsc(48000);
        let first: Vec<u64> = plan.by_ref().take(7).collect();
        plan.reset();
        let second: Vec<u64> = plan.take(7).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_frame_index_of_sample() {
        let plan = ntsc(48000);
        assert_eq!(plan.frame_index_of_sample(0), 0);
        assert_eq!(plan.frame_index_of_sample(1601), 0);
        assert_eq!(plan.frame_index_of_sample(1602), 1);
        assert_eq!(plan.frame_index_of_sample(8008), 5);
        assert_eq!(plan.frame_start_sample(5), 8008);
        assert_eq!(plan.frame_start_sample(2), 3203);
        assert_eq!(plan.frame_index_of_sample(480_000), 299);
    }

    #[test]
    fn test_parse_drop_frame_from_timecode() {
        assert_eq!(
            FrameRate::parse("29.97", Some("01:00:00;00")).unwrap(),
            FrameRate::Fps29_97 { drop_frame: true }
        );
        assert_eq!(
            FrameRate::parse("29.97", Some("01:00:00:00")).unwrap(),
            FrameRate::Fps29_97 { drop_frame: false }
        );
        assert_eq!(FrameRate::parse("25", None).unwrap(), FrameRate::Fps25);
        assert!(FrameRate::parse("abc", None).is_err());
    }

    #[test]
    fn test_from_ffprobe_fraction() {
        assert_eq!(
            FrameRate::from_ffprobe("30000/1001", None).unwrap(),
            FrameRate::Fps29_97 { drop_frame: false }
        );
        assert_eq!(FrameRate::from_ffprobe("24000/1001", None).unwrap(), FrameRate::Fps23_98);
        assert_eq!(FrameRate::from_ffprobe("25/1", None).unwrap(), FrameRate::Fps25);
        assert!(FrameRate::from_ffprobe("0/0", None).is_err());
    }
}
