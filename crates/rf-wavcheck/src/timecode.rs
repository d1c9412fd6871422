//! SMPTE timecode arithmetic
//!
//! Timecodes are kept as an absolute frame count. Drop-frame labels skip
//! frame numbers 00 and 01 at the start of every minute except each tenth.

use std::fmt;

use serde::{Serialize, Serializer};

use crate::cadence::FrameRate;
use crate::{Result, WavCheckError};

/// Frames in ten drop-frame minutes
const DF_FRAMES_PER_10_MIN: u64 = 17_982;
/// Frames in a drop-frame minute that is not a tenth minute
const DF_FRAMES_PER_MIN: u64 = 1_798;

/// A frame position on a timecode grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timecode {
    frames: u64,
    base: u32,
    drop_frame: bool,
}

impl Timecode {
    pub fn zero(rate: FrameRate) -> Self {
        Self::from_frames(0, rate)
    }

    pub fn from_frames(frames: u64, rate: FrameRate) -> Self {
        Self {
            frames,
            base: rate.timecode_base(),
            drop_frame: rate.is_drop_frame(),
        }
    }

    /// Parse `HH:MM:SS:FF` (any of `:;.,` as separators)
    pub fn parse(text: &str, rate: FrameRate) -> Result<Self> {
        let invalid = |why: &str| WavCheckError::Format(format!("invalid timecode '{text}': {why}"));
        let fields: Vec<u64> = text
            .trim()
            .split([':', ';', '.', ','])
            .map(|f| f.parse::<u64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| invalid("non-numeric field"))?;
        let [hh, mm, ss, ff] = fields[..] else {
            return Err(invalid("expected four fields"));
        };

        let base = rate.timecode_base() as u64;
        if hh > 23 || mm > 59 || ss > 59 || ff >= base {
            return Err(invalid("field out of range"));
        }

        let mut frames = ((hh * 60 + mm) * 60 + ss) * base + ff;
        if rate.is_drop_frame() {
            if ss == 0 && ff < 2 && mm % 10 != 0 {
                return Err(invalid("dropped frame label"));
            }
            let minutes = hh * 60 + mm;
            frames -= 2 * (minutes - minutes / 10);
        }
        Ok(Self::from_frames(frames, rate))
    }

    /// Absolute frame count since 00:00:00:00
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn is_drop_frame(&self) -> bool {
        self.drop_frame
    }

    /// This timecode advanced by `frames`
    pub fn offset(&self, frames: u64) -> Self {
        Self {
            frames: self.frames + frames,
            ..*self
        }
    }

    /// (hh, mm, ss, ff) as displayed
    pub fn components(&self) -> (u64, u64, u64, u64) {
        let base = self.base as u64;
        let label = if self.drop_frame {
            let tens = self.frames / DF_FRAMES_PER_10_MIN;
            let rest = self.frames % DF_FRAMES_PER_10_MIN;
            let skipped = if rest < 2 {
                18 * tens
            } else {
                18 * tens + 2 * ((rest - 2) / DF_FRAMES_PER_MIN)
            };
            self.frames + skipped
        } else {
            self.frames
        };
        let ff = label % base;
        let ss = (label / base) % 60;
        let mm = (label / (base * 60)) % 60;
        let hh = (label / (base * 3600)) % 24;
        (hh, mm, ss, ff)
    }
}

impl fmt::Display for Timecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (hh, mm, ss, ff) = self.components();
        let sep = if self.drop_frame { ';' } else { ':' };
        write!(f, "{hh:02}:{mm:02}:{ss:02}{sep}{ff:02}")
    }
}

impl Serialize for Timecode {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
