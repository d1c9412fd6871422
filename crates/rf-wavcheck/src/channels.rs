//! Channel roles, check modes and checksum sets

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::extract::ExtractLayout;

// ═══════════════════════════════════════════════════════════════════════════════
// CHANNEL ROLE
// ═══════════════════════════════════════════════════════════════════════════════

/// Semantic channel label
///
/// Declaration order is the canonical order used for combined checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ChannelRole {
    Interleaved,
    L,
    R,
    FL,
    FR,
    FC,
    LFE,
    RL,
    RR,
}

impl ChannelRole {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Interleaved => "INTERLEAVED",
            Self::L => "L",
            Self::R => "R",
            Self::FL => "FL",
            Self::FR => "FR",
            Self::FC => "FC",
            Self::LFE => "LFE",
            Self::RL => "RL",
            Self::RR => "RR",
        }
    }

    /// File name stem used for extracted channels
    pub fn file_stem(&self) -> String {
        self.label().to_ascii_lowercase()
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

const SURROUND_51: [ChannelRole; 6] = [
    ChannelRole::FL,
    ChannelRole::FR,
    ChannelRole::FC,
    ChannelRole::LFE,
    ChannelRole::RL,
    ChannelRole::RR,
];

const OA_EIGHT: [ChannelRole; 8] = [
    ChannelRole::L,
    ChannelRole::R,
    ChannelRole::FL,
    ChannelRole::FR,
    ChannelRole::FC,
    ChannelRole::LFE,
    ChannelRole::RL,
    ChannelRole::RR,
];

// ═══════════════════════════════════════════════════════════════════════════════
// CHECK MODE
// ═══════════════════════════════════════════════════════════════════════════════

/// Head skip and duration applied during extraction (seconds)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Trim {
    pub head_secs: Option<f64>,
    pub duration_secs: Option<f64>,
}

impl Trim {
    pub fn is_empty(&self) -> bool {
        self.head_secs.is_none() && self.duration_secs.is_none()
    }
}

/// Number of mono audio streams in an 8-channel OA deliverable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OaLayout {
    /// L, R
    TwoStreams,
    /// L, R, FL, FR, FC, LFE, RL, RR
    EightStreams,
}

/// What to verify and how the source is laid out
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CheckMode {
    /// One interleaved stream against one interleaved reference
    Interleaved {
        stream_index: usize,
        trim: Trim,
        correct_insertion: bool,
    },
    /// A 6-channel stream split into mono channels
    Surround51 { trim: Trim },
    /// 2 or 8 mono audio streams
    OaEightChannel {
        layout: OaLayout,
        trim: Trim,
        correct_insertion: bool,
    },
    /// A stereo stream split into two mono channels
    MultiMonoStereo { trim: Trim },
    /// Two mono streams joined into one interleaved stereo stream
    MultiMonoInterleave { trim: Trim, correct_insertion: bool },
    /// The source must be digital silence
    Silence { trim: Trim },
}

impl CheckMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Interleaved { .. } => "interleave",
            Self::Surround51 { .. } => "5.1",
            Self::OaEightChannel { .. } => "oa",
            Self::MultiMonoStereo { .. } => "multimono",
            Self::MultiMonoInterleave { .. } => "multimono-interleave",
            Self::Silence { .. } => "silence",
        }
    }

    /// Channel roles checked, in canonical order
    pub fn roles(&self) -> Vec<ChannelRole> {
        match self {
            Self::Interleaved { .. } | Self::MultiMonoInterleave { .. } | Self::Silence { .. } => {
                vec![ChannelRole::Interleaved]
            }
            Self::Surround51 { .. } => SURROUND_51.to_vec(),
            Self::OaEightChannel { layout: OaLayout::TwoStreams, .. } => {
                vec![ChannelRole::L, ChannelRole::R]
            }
            Self::OaEightChannel { layout: OaLayout::EightStreams, .. } => OA_EIGHT.to_vec(),
            Self::MultiMonoStereo { .. } => vec![ChannelRole::FL, ChannelRole::FR],
        }
    }

    pub fn trim(&self) -> Trim {
        match self {
            Self::Interleaved { trim, .. }
            | Self::Surround51 { trim }
            | Self::OaEightChannel { trim, .. }
            | Self::MultiMonoStereo { trim }
            | Self::MultiMonoInterleave { trim, .. }
            | Self::Silence { trim } => *trim,
        }
    }

    pub fn correct_insertion(&self) -> bool {
        match self {
            Self::Interleaved { correct_insertion, .. }
            | Self::OaEightChannel { correct_insertion, .. }
            | Self::MultiMonoInterleave { correct_insertion, .. } => *correct_insertion,
            _ => false,
        }
    }

    /// Silence verification has no reference side
    pub fn needs_reference(&self) -> bool {
        !matches!(self, Self::Silence { .. })
    }

    /// Boundary warnings count as errors
    pub fn escalates_warnings(&self) -> bool {
        matches!(self, Self::Silence { .. })
    }

    /// How a container source is turned into per-role WAV files
    pub fn extract_layout(&self) -> ExtractLayout {
        match self {
            Self::Interleaved { stream_index, .. } => ExtractLayout::Interleaved {
                stream_index: *stream_index,
            },
            Self::Silence { .. } => ExtractLayout::Interleaved { stream_index: 0 },
            Self::Surround51 { .. } => ExtractLayout::Split51,
            Self::OaEightChannel { layout, .. } => ExtractLayout::StreamsToMono {
                count: match layout {
                    OaLayout::TwoStreams => 2,
                    OaLayout::EightStreams => 8,
                },
            },
            Self::MultiMonoStereo { .. } => ExtractLayout::SplitStereo,
            Self::MultiMonoInterleave { .. } => ExtractLayout::JoinStereo,
        }
    }

    /// Channel count every per-role WAV must have, when fixed by the mode
    pub fn channels_per_file(&self) -> Option<u16> {
        match self {
            Self::Interleaved { .. } | Self::Silence { .. } => None,
            Self::MultiMonoInterleave { .. } => Some(2),
            _ => Some(1),
        }
    }
}

impl fmt::Display for CheckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CHECKSUM SET
// ═══════════════════════════════════════════════════════════════════════════════

/// Cumulative stream hash per channel role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChecksumSet {
    per_role: BTreeMap<ChannelRole, u64>,
}

impl ChecksumSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, role: ChannelRole, hash: u64) {
        self.per_role.insert(role, hash);
    }

    pub fn get(&self, role: ChannelRole) -> Option<u64> {
        self.per_role.get(&role).copied()
    }

    pub fn len(&self) -> usize {
        self.per_role.len()
    }

    pub fn is_empty(&self) -> bool {
        self.per_role.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelRole, u64)> + '_ {
        self.per_role.iter().map(|(role, hash)| (*role, *hash))
    }

    /// Per-role hashes concatenated as hex in canonical order
    pub fn combined(&self) -> String {
        self.per_role
            .values()
            .map(|hash| format!("{hash:016x}"))
            .collect()
    }

    /// Fast gate: equal only if every role is present on both sides and equal
    pub fn matches(&self, other: &ChecksumSet) -> bool {
        !self.is_empty() && self.combined() == other.combined()
            && self.per_role.keys().eq(other.per_role.keys())
    }
}
