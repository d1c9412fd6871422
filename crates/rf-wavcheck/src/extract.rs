//! Channel extraction collaborator
//!
//! Turns a container (QuickTime, MXF) into the WAV files the hashing engine
//! reads. The core only starts an extraction, waits for it, watches its byte
//! progress and kills it on cancellation; [`FfmpegExtractor`] is the
//! production implementation.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};

use crate::channels::Trim;
use crate::config::CheckConfig;
use crate::context::{RunContext, Side};
use crate::{Result, WavCheckError};

/// Lines of tool output kept for error messages
const OUTPUT_TAIL_LINES: usize = 20;

// ═══════════════════════════════════════════════════════════════════════════════
// REQUEST
// ═══════════════════════════════════════════════════════════════════════════════

/// How the audio streams of a container map to output files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtractLayout {
    /// One audio stream, kept interleaved
    Interleaved { stream_index: usize },
    /// Stereo stream split into FL, FR
    SplitStereo,
    /// 5.1 stream split into FL, FR, FC, LFE, BL, BR
    Split51,
    /// The first `count` audio streams, one file each
    StreamsToMono { count: usize },
    /// Audio streams 0 and 1 joined into one stereo file
    JoinStereo,
}

impl ExtractLayout {
    pub fn output_count(&self) -> usize {
        match self {
            Self::Interleaved { .. } | Self::JoinStereo => 1,
            Self::SplitStereo => 2,
            Self::Split51 => 6,
            Self::StreamsToMono { count } => *count,
        }
    }
}

/// One extraction job
#[derive(Debug, Clone)]
pub struct ExtractRequest {
    pub input: PathBuf,
    pub layout: ExtractLayout,
    /// Output files, in the layout's channel order
    pub outputs: Vec<PathBuf>,
    pub trim: Trim,
    /// PCM codec of the outputs, e.g. `pcm_s24le`
    pub codec: String,
}

impl ExtractRequest {
    pub fn new(input: impl Into<PathBuf>, layout: ExtractLayout, outputs: Vec<PathBuf>) -> Self {
        Self {
            input: input.into(),
            layout,
            outputs,
            trim: Trim::default(),
            codec: "pcm_s24le".into(),
        }
    }

    pub fn with_trim(mut self, trim: Trim) -> Self {
        self.trim = trim;
        self
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    fn validate(&self) -> Result<()> {
        if self.outputs.len() != self.layout.output_count() {
            return Err(WavCheckError::Config(format!(
                "{:?} writes {} file(s), {} output path(s) given",
                self.layout,
                self.layout.output_count(),
                self.outputs.len()
            )));
        }
        if !self.codec.starts_with("pcm_") {
            return Err(WavCheckError::Format(format!(
                "extraction codec must be PCM, got {}",
                self.codec
            )));
        }
        Ok(())
    }
}

/// Something that can turn a container into WAV files
pub trait Extractor: Send + Sync {
    /// Run to completion, honouring cancellation; returns the written paths
    fn extract(&self, request: &ExtractRequest, ctx: &RunContext, side: Side) -> Result<Vec<PathBuf>>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// FFMPEG
// ═══════════════════════════════════════════════════════════════════════════════

/// Extraction through the `ffmpeg` command line tool
#[derive(Debug, Clone)]
pub struct FfmpegExtractor {
    program: PathBuf,
    poll_interval: Duration,
}

impl FfmpegExtractor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            poll_interval: Duration::from_millis(50),
        }
    }

    pub fn from_config(config: &CheckConfig) -> Self {
        Self {
            program: config.ffmpeg_path.clone(),
            poll_interval: Duration::from_millis(config.extraction_poll_interval_ms),
        }
    }

    /// Command line for a request (without the program name)
    pub fn build_args(request: &ExtractRequest) -> Vec<String> {
        let mut args: Vec<String> = vec!["-v".into(), "warning".into()];
        if let ExtractLayout::Interleaved { .. } = request.layout {
            args.extend(["-guess_layout_max".into(), "0".into()]);
        }
        if let Some(head) = request.trim.head_secs {
            args.extend(["-ss".into(), format!("{head}")]);
        }
        if let Some(duration) = request.trim.duration_secs {
            args.extend(["-t".into(), format!("{duration}")]);
        }
        args.extend([
            "-i".into(),
            request.input.display().to_string(),
            "-y".into(),
            "-vn".into(),
            "-stats".into(),
            "-stats_period".into(),
            "1".into(),
        ]);

        let maps: Vec<String> = match request.layout {
            ExtractLayout::Interleaved { stream_index } => vec![format!("0:a:{stream_index}")],
            ExtractLayout::StreamsToMono { count } => (0..count).map(|i| format!("0:a:{i}")).collect(),
            ExtractLayout::SplitStereo => {
                args.extend([
                    "-filter_complex".into(),
                    "channelsplit=channel_layout=stereo[FL][FR]".into(),
                ]);
                ["[FL]", "[FR]"].map(String::from).to_vec()
            }
            ExtractLayout::Split51 => {
                args.extend([
                    "-filter_complex".into(),
                    "channelsplit=channel_layout=5.1[FL][FR][FC][LFE][BL][BR]".into(),
                ]);
                ["[FL]", "[FR]", "[FC]", "[LFE]", "[BL]", "[BR]"]
                    .map(String::from)
                    .to_vec()
            }
            ExtractLayout::JoinStereo => {
                args.extend([
                    "-filter_complex".into(),
                    "[0:a:0][0:a:1]join=inputs=2:channel_layout=stereo[a]".into(),
                ]);
                vec!["[a]".into()]
            }
        };

        for (map, output) in maps.iter().zip(&request.outputs) {
            args.extend([
                "-map".into(),
                map.clone(),
                "-acodec".into(),
                request.codec.clone(),
                "-rf64".into(),
                "auto".into(),
                output.display().to_string(),
            ]);
        }
        args
    }
}

impl Extractor for FfmpegExtractor {
    fn extract(&self, request: &ExtractRequest, ctx: &RunContext, side: Side) -> Result<Vec<PathBuf>> {
        request.validate()?;
        let args = Self::build_args(request);
        log::info!("extract[{side}]: {} {}", self.program.display(), args.join(" "));

        let outputs = request.outputs.len() as u64;
        run_with_progress(&self.program, &args, ctx, self.poll_interval, |bytes| {
            ctx.progress().set_extracted(side, bytes * outputs);
            ctx.publish_progress();
        })?;

        for path in &request.outputs {
            if !path.is_file() {
                return Err(WavCheckError::Extraction(format!(
                    "{} was not written",
                    path.display()
                )));
            }
        }
        Ok(request.outputs.clone())
    }
}

/// Run a tool, feeding byte progress parsed from its stderr to `on_progress`
///
/// The child is killed as soon as cancellation is observed.
pub(crate) fn run_with_progress(
    program: &Path,
    args: &[String],
    ctx: &RunContext,
    poll_interval: Duration,
    mut on_progress: impl FnMut(u64),
) -> Result<()> {
    let rendered = format!("{} {}", program.display(), args.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| WavCheckError::Extraction(format!("cannot start {}: {e}", program.display())))?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| WavCheckError::Extraction("stderr not captured".into()))?;
    let lines = spawn_line_reader(stderr);
    let mut tail: Vec<String> = Vec::new();

    let mut handle_line = |line: String, tail: &mut Vec<String>| {
        if let Some(bytes) = parse_progress_bytes(&line) {
            on_progress(bytes);
        } else if !line.trim().is_empty() {
            log::debug!("extract: {line}");
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.remove(0);
            }
            tail.push(line);
        }
    };

    let status = loop {
        if ctx.is_cancelled() {
            log::warn!("extract: cancelled, killing {}", program.display());
            let _ = child.kill();
            let _ = child.wait();
            return Err(WavCheckError::Cancelled);
        }
        if let Some(status) = child.try_wait()? {
            break status;
        }
        match lines.recv_timeout(poll_interval) {
            Ok(line) => handle_line(line, &mut tail),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => thread::sleep(poll_interval),
        }
    };

    // The reader ends once the exited child's stderr reaches EOF
    for line in lines.iter() {
        handle_line(line, &mut tail);
    }

    if !status.success() {
        return Err(WavCheckError::Extraction(format!(
            "`{rendered}` exited with {}: {}",
            status.code().map_or_else(|| "signal".to_string(), |c| c.to_string()),
            tail.join(" | ")
        )));
    }
    Ok(())
}

/// Split a byte stream into lines on `\n` or `\r` (progress lines use `\r`)
fn spawn_line_reader<R: Read + Send + 'static>(mut reader: R) -> Receiver<String> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();
        loop {
            let n = match reader.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            for &byte in &chunk[..n] {
                if byte == b'\n' || byte == b'\r' {
                    if !pending.is_empty() {
                        let line = String::from_utf8_lossy(&pending).into_owned();
                        pending.clear();
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                } else {
                    pending.push(byte);
                }
            }
        }
        if !pending.is_empty() {
            let _ = tx.send(String::from_utf8_lossy(&pending).into_owned());
        }
    });
    rx
}

/// Bytes written so far, from a progress line such as
/// `size=   2085558KiB time=02:03:35.40 bitrate=2304.0kbits/s speed= 305x`
///
/// Older builds print `kB` instead of `KiB`; both are 1024 bytes.
pub fn parse_progress_bytes(line: &str) -> Option<u64> {
    let rest = line.split_once("size=")?.1.trim_start();
    let token = rest.split_whitespace().next()?;
    let digits = token
        .strip_suffix("KiB")
        .or_else(|| token.strip_suffix("kB"))?;
    digits.parse::<u64>().ok().map(|kib| kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn request(layout: ExtractLayout, outputs: &[&str]) -> ExtractRequest {
        ExtractRequest::new(
            "/media/program.mov",
            layout,
            outputs.iter().map(PathBuf::from).collect(),
        )
    }

    #[test]
    fn test_parse_progress_line() {
        assert_eq!(
            parse_progress_bytes("size=   2085558KiB time=02:03:35.40 bitrate=2304.0kbits/s speed= 305x"),
            Some(2_085_558 * 1024)
        );
        assert_eq!(parse_progress_bytes("size=100kB time=00:00:01.00"), Some(102_400));
        assert_eq!(parse_progress_bytes("size=N/A time=00:00:01.00"), None);
        assert_eq!(parse_progress_bytes("Stream mapping:"), None);
    }

    #[test]
    fn test_args_for_split51() {
        let req = request(
            ExtractLayout::Split51,
            &["fl.wav", "fr.wav", "fc.wav", "lfe.wav", "rl.wav", "rr.wav"],
        )
        .with_trim(Trim { head_secs: Some(1.5), duration_secs: Some(60.0) });
        let args = FfmpegExtractor::build_args(&req);
        let joined = args.join(" ");

        assert!(joined.contains("-ss 1.5 -t 60 -i /media/program.mov"));
        assert!(joined.contains("channelsplit=channel_layout=5.1[FL][FR][FC][LFE][BL][BR]"));
        assert!(joined.ends_with("-map [BR] -acodec pcm_s24le -rf64 auto rr.wav"));
        assert_eq!(args.iter().filter(|a| *a == "-map").count(), 6);
    }

    #[test]
    fn test_args_for_interleaved_stream_select() {
        let req = request(ExtractLayout::Interleaved { stream_index: 2 }, &["out.wav"]).with_codec("pcm_s16le");
        let joined = FfmpegExtractor::build_args(&req).join(" ");
        assert!(joined.starts_with("-v warning -guess_layout_max 0 -i"));
        assert!(joined.contains("-map 0:a:2 -acodec pcm_s16le"));
    }

    #[test]
    fn test_request_validation() {
        let req = request(ExtractLayout::SplitStereo, &["fl.wav"]);
        assert!(matches!(req.validate(), Err(WavCheckError::Config(_))));
        let req = request(ExtractLayout::JoinStereo, &["lr.wav"]).with_codec("aac");
        assert!(matches!(req.validate(), Err(WavCheckError::Format(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_reports_progress_and_failure() {
        let ctx = RunContext::new();
        let mut seen = Vec::new();
        let script = "printf 'size=     100KiB time=00:00:01.00\\r' >&2; echo 'broken input' >&2; exit 3".to_string();
        let err = run_with_progress(
            Path::new("sh"),
            &["-c".into(), script],
            &ctx,
            Duration::from_millis(10),
            |b| seen.push(b),
        )
        .unwrap_err();

        assert_eq!(seen, vec![102_400]);
        match err {
            WavCheckError::Extraction(msg) => assert!(msg.contains("broken input")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_runner_kills_on_cancel() {
        let ctx = RunContext::new();
        let canceller = ctx.clone();
        let started = Instant::now();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            canceller.cancel();
        });

        let err = run_with_progress(
            Path::new("sh"),
            &["-c".into(), "sleep 30".into()],
            &ctx,
            Duration::from_millis(10),
            |_| {},
        )
        .unwrap_err();
        handle.join().unwrap();

        assert!(matches!(err, WavCheckError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_missing_program_is_extraction_error() {
        let err = run_with_progress(
            Path::new("/nonexistent/ffmpeg-binary"),
            &[],
            &RunContext::new(),
            Duration::from_millis(10),
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, WavCheckError::Extraction(_)));
    }
}
