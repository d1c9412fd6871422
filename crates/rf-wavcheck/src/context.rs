//! Per-run shared state
//!
//! Every concurrent unit of a run (extraction, hashing, insertion search)
//! receives a clone of the same [`RunContext`]. It is the only state shared
//! between them: one cancellation flag, atomic progress counters and an
//! optional event channel for a UI or CLI front end.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};

use crate::orchestrator::RunState;
use crate::{Result, WavCheckError};

/// Which side of the comparison a unit of work belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Side {
    Source,
    Reference,
}

impl Side {
    pub fn other(self) -> Self {
        match self {
            Self::Source => Self::Reference,
            Self::Reference => Self::Source,
        }
    }

    fn index(self) -> usize {
        match self {
            Self::Source => 0,
            Self::Reference => 1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Reference => write!(f, "reference"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CANCELLATION
// ═══════════════════════════════════════════════════════════════════════════════

/// Cooperative cancellation flag
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(WavCheckError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROGRESS
// ═══════════════════════════════════════════════════════════════════════════════

/// Byte counters, one pair per side and stage
///
/// Counters only grow between resets.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    extracted: [AtomicU64; 2],
    extract_expected: [AtomicU64; 2],
    hashed: [AtomicU64; 2],
    hash_expected: [AtomicU64; 2],
}

impl ProgressCounters {
    pub fn reset(&self) {
        for counter in self
            .extracted
            .iter()
            .chain(&self.extract_expected)
            .chain(&self.hashed)
            .chain(&self.hash_expected)
        {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Record the byte count an extraction has written so far
    pub fn set_extracted(&self, side: Side, bytes: u64) {
        self.extracted[side.index()].fetch_max(bytes, Ordering::Relaxed);
    }

    pub fn add_extract_expected(&self, side: Side, bytes: u64) {
        self.extract_expected[side.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_hashed(&self, side: Side, bytes: u64) {
        self.hashed[side.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_hash_expected(&self, side: Side, bytes: u64) {
        self.hash_expected[side.index()].fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let load = |c: &[AtomicU64; 2], side: Side| c[side.index()].load(Ordering::Relaxed);
        ProgressSnapshot {
            source_extracted: load(&self.extracted, Side::Source),
            source_extract_expected: load(&self.extract_expected, Side::Source),
            reference_extracted: load(&self.extracted, Side::Reference),
            reference_extract_expected: load(&self.extract_expected, Side::Reference),
            source_hashed: load(&self.hashed, Side::Source),
            source_hash_expected: load(&self.hash_expected, Side::Source),
            reference_hashed: load(&self.hashed, Side::Reference),
            reference_hash_expected: load(&self.hash_expected, Side::Reference),
        }
    }
}

/// Point-in-time copy of the progress counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub source_extracted: u64,
    pub source_extract_expected: u64,
    pub reference_extracted: u64,
    pub reference_extract_expected: u64,
    pub source_hashed: u64,
    pub source_hash_expected: u64,
    pub reference_hashed: u64,
    pub reference_hash_expected: u64,
}

impl ProgressSnapshot {
    /// Hashing progress across both sides (0.0 - 1.0)
    pub fn hash_fraction(&self) -> f64 {
        fraction(
            self.source_hashed + self.reference_hashed,
            self.source_hash_expected + self.reference_hash_expected,
        )
    }

    /// Extraction progress across both sides (0.0 - 1.0)
    pub fn extract_fraction(&self) -> f64 {
        fraction(
            self.source_extracted + self.reference_extracted,
            self.source_extract_expected + self.reference_extract_expected,
        )
    }
}

fn fraction(done: u64, expected: u64) -> f64 {
    if expected == 0 {
        0.0
    } else {
        (done as f64 / expected as f64).min(1.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════════

/// Structured notification for front ends
#[derive(Debug, Clone)]
pub enum RunEvent {
    StateChanged(RunState),
    Status(String),
    Progress(ProgressSnapshot),
    Log { level: log::Level, message: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// RUN CONTEXT
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle shared by every unit of work in one run
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    cancel: CancellationToken,
    progress: Arc<ProgressCounters>,
    events: Option<Sender<RunEvent>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward events to a channel
    pub fn with_events(mut self, sender: Sender<RunEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Share an existing cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.cancel.checkpoint()
    }

    pub fn progress(&self) -> &ProgressCounters {
        &self.progress
    }

    /// Send an event; a dropped receiver is not an error
    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        log::info!("{message}");
        self.emit(RunEvent::Status(message));
    }

    /// Log through the `log` facade and mirror the line as an event
    pub fn log(&self, level: log::Level, message: impl Into<String>) {
        let message = message.into();
        log::log!(level, "{message}");
        self.emit(RunEvent::Log { level, message });
    }

    pub fn publish_progress(&self) {
        if self.events.is_some() {
            self.emit(RunEvent::Progress(self.progress.snapshot()));
        }
    }
}
