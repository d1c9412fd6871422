//! Report generation for verification runs

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::compare::{DivergenceReport, MismatchSpan, Verdict};
use crate::orchestrator::{ChannelOutcome, RunOutcome};

/// Report format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportFormat {
    /// Plain text report
    Text,
    /// JSON report
    Json,
    /// Markdown report
    Markdown,
}

/// A finished run plus what it was run on
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Report title
    pub title: String,

    /// When the report was generated
    pub timestamp: DateTime<Utc>,

    /// Source description (path or container)
    pub source: String,

    /// Reference description; empty for the silence check
    pub reference: String,

    pub outcome: RunOutcome,
}

impl RunReport {
    pub fn new(
        title: impl Into<String>,
        source: impl Into<String>,
        reference: impl Into<String>,
        outcome: RunOutcome,
    ) -> Self {
        Self {
            title: title.into(),
            timestamp: Utc::now(),
            source: source.into(),
            reference: reference.into(),
            outcome,
        }
    }

    /// Generate report in specified format
    pub fn generate(&self, format: ReportFormat) -> String {
        match format {
            ReportFormat::Text => self.to_text(),
            ReportFormat::Json => self.to_json(),
            ReportFormat::Markdown => self.to_markdown(),
        }
    }

    /// Save report to file
    pub fn save<P: AsRef<Path>>(&self, path: P, format: ReportFormat) -> std::io::Result<()> {
        let content = self.generate(format);
        let mut file = std::fs::File::create(path)?;
        file.write_all(content.as_bytes())
    }

    fn to_text(&self) -> String {
        let outcome = &self.outcome;
        let mut output = String::new();

        output.push_str(&format!("{}\n", self.title));
        output.push_str(&format!("{}\n\n", "=".repeat(self.title.len())));

        output.push_str(&format!("Timestamp: {}\n", self.timestamp.to_rfc3339()));
        output.push_str(&format!("Source:    {}\n", self.source));
        if !self.reference.is_empty() {
            output.push_str(&format!("Reference: {}\n", self.reference));
        }
        output.push_str(&format!(
            "Mode: {} | {} | {} Hz | start {}{}\n\n",
            outcome.mode,
            outcome.frame_rate,
            outcome.sample_rate,
            outcome.origin,
            if outcome.virtual_timecode { " (virtual)" } else { "" }
        ));

        output.push_str("Checksums:\n");
        for (role, hash) in outcome.source_checksums.iter() {
            let reference = outcome
                .reference_checksums
                .get(role)
                .map_or_else(|| "-".to_string(), |h| format!("{h:016x}"));
            output.push_str(&format!("  {:<12} {hash:016x}  {reference}\n", role.label()));
        }
        output.push('\n');

        output.push_str("Channels:\n");
        output.push_str(&"-".repeat(80));
        output.push('\n');
        for channel in &outcome.channels {
            output.push_str(&format!("[{}] {}\n", channel.verdict(), channel.role));
            for line in channel_details(channel) {
                output.push_str(&format!("  {line}\n"));
            }
        }
        output.push_str(&"-".repeat(80));
        output.push('\n');
        output.push_str(&format!("Verdict: {}\n", outcome.verdict));

        output
    }

    fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".into())
    }

    fn to_markdown(&self) -> String {
        let outcome = &self.outcome;
        let mut output = String::new();

        output.push_str(&format!("# {}\n\n", self.title));
        output.push_str(&format!("**Timestamp:** {}\n\n", self.timestamp.to_rfc3339()));

        let status_emoji = match outcome.verdict {
            Verdict::Match => "✅",
            Verdict::Warning => "⚠️",
            Verdict::Error => "❌",
        };
        output.push_str(&format!("## {} {}\n\n", status_emoji, outcome.verdict));
        output.push_str("| Field | Value |\n");
        output.push_str("|-------|-------|\n");
        output.push_str(&format!("| Source | `{}` |\n", self.source));
        if !self.reference.is_empty() {
            output.push_str(&format!("| Reference | `{}` |\n", self.reference));
        }
        output.push_str(&format!("| Mode | {} |\n", outcome.mode));
        output.push_str(&format!("| Frame rate | {} |\n", outcome.frame_rate));
        output.push_str(&format!("| Sample rate | {} Hz |\n", outcome.sample_rate));
        output.push_str(&format!(
            "| Start | {}{} |\n\n",
            outcome.origin,
            if outcome.virtual_timecode { " (virtual)" } else { "" }
        ));

        output.push_str("## Channels\n\n");
        output.push_str("| Channel | Verdict | Source hash | Reference hash |\n");
        output.push_str("|---------|---------|-------------|----------------|\n");
        for channel in &outcome.channels {
            let hash = |set: &crate::channels::ChecksumSet| {
                set.get(channel.role)
                    .map_or_else(|| "-".to_string(), |h| format!("`{h:016x}`"))
            };
            output.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                channel.role,
                channel.verdict(),
                hash(&outcome.source_checksums),
                hash(&outcome.reference_checksums)
            ));
        }
        output.push('\n');

        for channel in outcome.channels.iter().filter(|c| c.verdict() != Verdict::Match) {
            output.push_str(&format!("### {}\n\n", channel.role));
            for line in channel_details(channel) {
                output.push_str(&format!("- {line}\n"));
            }
            output.push('\n');
        }

        output
    }
}

/// Human-readable lines describing one channel's result
fn channel_details(channel: &ChannelOutcome) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(error) = &channel.error {
        lines.push(format!("failed: {error}"));
    }
    if let Some(correction) = &channel.correction {
        lines.push(format!(
            "insertion corrected: {} samples displaced in {} at sample {} (frame {})",
            correction.span_samples(),
            correction.displaced_side,
            correction.displacement_sample_offset,
            correction.matched_frame_index
        ));
    }
    if let Some(report) = &channel.report {
        lines.extend(report_details(report));
    }
    lines
}

fn report_details(report: &DivergenceReport) -> Vec<String> {
    let mut lines = Vec::new();
    if !report.timecode_available && report.verdict != Verdict::Match {
        lines.push("difference found; no timecode mapping at this sample rate".to_string());
    }
    for span in &report.spans {
        lines.push(span_line(span));
    }
    if let Some(frames) = report.length_difference_frames {
        lines.push(format!("length differs by {frames} frame(s)"));
    }
    if let Some(samples) = report.boundary_length_difference_samples {
        if samples > 0 {
            lines.push(format!("last frame length differs by {samples} sample(s)"));
        }
    }
    if let Some(detail) = &report.sample_level_detail {
        for run in detail {
            lines.push(format!(
                "last frame samples {}-{} differ",
                run.start_sample, run.end_sample
            ));
        }
    }
    if report.internal_inconsistency {
        lines.push("internal inconsistency: hashes differ but the compared samples are identical".to_string());
    }
    lines
}

fn span_line(span: &MismatchSpan) -> String {
    match (&span.start_timecode, &span.end_timecode) {
        (Some(start), Some(end)) => format!(
            "mismatch {start} - {end} ({} frame(s))",
            span.frames()
        ),
        _ => format!(
            "mismatch frames {} - {} ({} frame(s))",
            span.start_frame,
            span.end_frame,
            span.frames()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadence::FrameRate;
    use crate::channels::{ChannelRole, ChecksumSet};
    use crate::compare::SampleSpan;
    use crate::timecode::Timecode;

    fn outcome(verdict: Verdict) -> RunOutcome {
        let rate = FrameRate::Fps25;
        let mut source = ChecksumSet::new();
        source.insert(ChannelRole::FL, 0xabc);
        source.insert(ChannelRole::FR, 0xdef);
        let mut reference = source.clone();

        let mut fr = DivergenceReport::matched("FR", 250);
        if verdict != Verdict::Match {
            reference.insert(ChannelRole::FR, 0x123);
            fr.verdict = verdict;
            fr.spans.push(MismatchSpan {
                start_frame: 100,
                end_frame: 103,
                start_timecode: Some(Timecode::from_frames(900_100, rate)),
                end_timecode: Some(Timecode::from_frames(900_103, rate)),
            });
            fr.sample_level_detail = Some(vec![SampleSpan { start_sample: 3, end_sample: 4 }]);
        }

        RunOutcome {
            mode: "multimono".into(),
            verdict,
            frame_rate: rate.to_string(),
            sample_rate: 48_000,
            origin: Timecode::from_frames(900_000, rate),
            virtual_timecode: false,
            source_checksums: source,
            reference_checksums: reference,
            channels: vec![
                ChannelOutcome {
                    role: ChannelRole::FL,
                    report: Some(DivergenceReport::matched("FL", 250)),
                    correction: None,
                    error: None,
                },
                ChannelOutcome {
                    role: ChannelRole::FR,
                    report: Some(fr),
                    correction: None,
                    error: None,
                },
            ],
        }
    }

    #[test]
    fn test_text_report() {
        let report = RunReport::new("Delivery QC", "prog.mov", "prog_fr.wav", outcome(Verdict::Error));
        let text = report.generate(ReportFormat::Text);

        assert!(text.contains("Delivery QC"));
        assert!(text.contains("start 10:00:00:00"));
        assert!(text.contains("[ERROR] FR"));
        assert!(text.contains("mismatch 10:00:04:00 - 10:00:04:03 (3 frame(s))"));
        assert!(text.contains("last frame samples 3-4 differ"));
        assert!(text.ends_with("Verdict: ERROR\n"));
    }

    #[test]
    fn test_json_report() {
        let report = RunReport::new("Delivery QC", "prog.mov", "prog_fr.wav", outcome(Verdict::Match));
        let json = report.generate(ReportFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["outcome"]["verdict"], "Match");
        assert_eq!(value["outcome"]["origin"], "10:00:00:00");
        assert_eq!(value["outcome"]["channels"].as_array().unwrap().len(), 2);

        let stamp = value["timestamp"].as_str().unwrap();
        let parsed: DateTime<Utc> = stamp.parse().unwrap();
        assert_eq!(parsed, report.timestamp);
    }

    #[test]
    fn test_markdown_report() {
        let report = RunReport::new("Delivery QC", "prog.mov", "", outcome(Verdict::Warning));
        let md = report.generate(ReportFormat::Markdown);

        assert!(md.contains("# Delivery QC"));
        assert!(md.contains("## ⚠️ WARNING"));
        assert!(md.contains("| Channel | Verdict |"));
        assert!(md.contains("### FR"));
        assert!(!md.contains("### FL"));
        assert!(!md.contains("| Reference |"));
    }
}
