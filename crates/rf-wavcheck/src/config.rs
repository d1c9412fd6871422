//! Configuration for verification runs

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::compare::BoundaryPolicy;
use crate::{Result, WavCheckError};

/// Configuration for a verification run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckConfig {
    /// Length difference (in samples) at the boundary frame that forces Error
    pub boundary_error_min_samples: u64,

    /// Most mismatch runs inside the boundary frame still reported as Warning
    pub boundary_max_warning_runs: usize,

    /// Midpoint window compared before searching for an insertion (seconds)
    pub insertion_probe_window_secs: f64,

    /// Lock-step block size of the coarse insertion scan (seconds)
    pub insertion_coarse_block_secs: f64,

    /// Window hashed to find the re-synchronization point (seconds)
    pub insertion_resync_window_secs: f64,

    /// Longest displaced span searched for, per direction (seconds)
    pub insertion_max_span_secs: f64,

    /// Channels hashed in parallel (0 = one per core)
    pub max_parallel_channels: usize,

    /// Extraction tool executable
    pub ffmpeg_path: PathBuf,

    /// Metadata probe executable
    pub ffprobe_path: PathBuf,

    /// Parent of the per-run scratch directory (system temp when unset)
    pub work_root: Option<PathBuf>,

    /// Extract the source as 16-bit PCM regardless of its native depth
    pub force_16bit_source: bool,

    /// How often a running extraction is polled for exit and cancellation
    pub extraction_poll_interval_ms: u64,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            boundary_error_min_samples: 6,
            boundary_max_warning_runs: 1,
            insertion_probe_window_secs: 10.0,
            insertion_coarse_block_secs: 3.0,
            insertion_resync_window_secs: 10.0,
            insertion_max_span_secs: 10.0,
            max_parallel_channels: 0,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            work_root: None,
            force_16bit_source: false,
            extraction_poll_interval_ms: 50,
        }
    }
}

impl CheckConfig {
    /// Zero tolerance: any boundary difference is an Error
    pub fn strict() -> Self {
        Self {
            boundary_error_min_samples: 1,
            boundary_max_warning_runs: 0,
            ..Default::default()
        }
    }

    /// Short insertion windows for clips of a few seconds
    pub fn short_clips() -> Self {
        Self {
            insertion_probe_window_secs: 0.5,
            insertion_coarse_block_secs: 0.25,
            insertion_resync_window_secs: 0.5,
            insertion_max_span_secs: 1.0,
            ..Default::default()
        }
    }

    /// Load from a JSON file; missing keys take their defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| WavCheckError::Config(format!("{}: {}", path.as_ref().display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON
    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| WavCheckError::Config(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }

    /// Reject values the locator or comparator cannot work with
    pub fn validate(&self) -> Result<()> {
        for (name, secs) in [
            ("insertion_probe_window_secs", self.insertion_probe_window_secs),
            ("insertion_coarse_block_secs", self.insertion_coarse_block_secs),
            ("insertion_resync_window_secs", self.insertion_resync_window_secs),
            ("insertion_max_span_secs", self.insertion_max_span_secs),
        ] {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(WavCheckError::Config(format!("{name} must be positive, got {secs}")));
            }
        }
        if self.extraction_poll_interval_ms == 0 {
            return Err(WavCheckError::Config(
                "extraction_poll_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Boundary classifier thresholds
    pub fn boundary_policy(&self) -> BoundaryPolicy {
        BoundaryPolicy {
            error_min_length_samples: self.boundary_error_min_samples,
            max_warning_runs: self.boundary_max_warning_runs,
        }
    }

    /// Seconds to whole samples, never less than one
    pub fn secs_to_samples(secs: f64, sample_rate: u32) -> u64 {
        ((secs * sample_rate as f64).round() as u64).max(1)
    }

    /// Builder pattern: set insertion windows
    pub fn with_insertion_windows(mut self, probe_secs: f64, coarse_secs: f64, resync_secs: f64) -> Self {
        self.insertion_probe_window_secs = probe_secs;
        self.insertion_coarse_block_secs = coarse_secs;
        self.insertion_resync_window_secs = resync_secs;
        self
    }

    /// Builder pattern: bound the displaced span search
    pub fn with_insertion_max_span(mut self, secs: f64) -> Self {
        self.insertion_max_span_secs = secs;
        self
    }

    /// Builder pattern: set parallelism
    pub fn with_max_parallel_channels(mut self, max: usize) -> Self {
        self.max_parallel_channels = max;
        self
    }

    /// Builder pattern: set scratch directory parent
    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }

    /// Builder pattern: set tool paths
    pub fn with_tools(mut self, ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        self.ffmpeg_path = ffmpeg.into();
        self.ffprobe_path = ffprobe.into();
        self
    }

    /// Builder pattern: extract the source as 16-bit
    pub fn with_force_16bit(mut self) -> Self {
        self.force_16bit_source = true;
        self
    }
}
