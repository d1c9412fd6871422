//! wavcheck - broadcast PCM verification
//!
//! Usage:
//!   wavcheck check --mode 5.1 --source prog.mov --reference fl.wav ... rr.wav
//!   wavcheck check --mode silence --source prog.mov
//!   wavcheck inspect mix.wav --fps 29.97
//!
//! Exit codes: 0 match, 1 warning, 2 error, 3 fatal, 130 cancelled.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};

use rf_wavcheck::{
    CadencePlan, CheckConfig, CheckMode, FrameRate, MediaInput, OaLayout, Orchestrator,
    ReportFormat, RunContext, RunEvent, RunReport, RunRequest, RunStatus, Side, Timecode, Trim,
    WavStream, hash_channel,
};

const EXIT_FATAL: i32 = 3;
const EXIT_CANCELLED: i32 = 130;

#[derive(Parser)]
#[command(name = "wavcheck", about = "Frame-accurate PCM verification", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a source against a reference (or against silence)
    Check(CheckArgs),
    /// Print a WAV header summary and its cumulative hash
    Inspect {
        /// WAV, RF64 or BW64 file
        file: PathBuf,

        /// Video frame rate for the frame count
        #[arg(long, default_value = "29.97")]
        fps: String,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// One interleaved stream
    Interleave,
    /// 5.1 stream split into six mono channels
    #[value(name = "5.1")]
    Surround51,
    /// Two mono streams (L, R)
    Oa2,
    /// Eight mono streams (L, R, FL, FR, FC, LFE, RL, RR)
    Oa8,
    /// Stereo stream split into two mono channels
    Multimono,
    /// Two mono streams joined to interleaved stereo
    MultimonoInterleave,
    /// Source must be digital silence
    Silence,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Text,
    Json,
    Markdown,
}

impl From<FormatArg> for ReportFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Text => ReportFormat::Text,
            FormatArg::Json => ReportFormat::Json,
            FormatArg::Markdown => ReportFormat::Markdown,
        }
    }
}

#[derive(clap::Args)]
struct CheckArgs {
    #[arg(short, long, value_enum)]
    mode: ModeArg,

    /// A container, or one WAV per channel
    #[arg(short, long, num_args = 1.., required = true)]
    source: Vec<PathBuf>,

    /// A container, or one WAV per channel
    #[arg(short, long, num_args = 1..)]
    reference: Vec<PathBuf>,

    /// Audio stream to check in interleave mode
    #[arg(long, default_value_t = 0)]
    stream: usize,

    /// Frame rate (23.98, 24, 25, 29.97, 30); probed when omitted
    #[arg(long)]
    fps: Option<String>,

    /// Start timecode; `;` before the frames selects 29.97 drop-frame
    #[arg(long)]
    tc: Option<String>,

    /// Seconds skipped at the head during extraction
    #[arg(long)]
    head: Option<f64>,

    /// Seconds extracted after the head skip
    #[arg(long)]
    duration: Option<f64>,

    /// Locate and undo a displaced span before comparing
    #[arg(long)]
    fix_insertion: bool,

    /// Extract the source as 16-bit PCM
    #[arg(long)]
    force_16bit: bool,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Parallel hashing threads (0 = all cores)
    #[arg(short, long)]
    jobs: Option<usize>,

    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    #[arg(long)]
    ffprobe: Option<PathBuf>,

    /// Parent directory of the per-run scratch directory
    #[arg(long)]
    work_dir: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value = "text")]
    format: FormatArg,

    /// Write the report here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print hashing progress to stderr
    #[arg(long)]
    progress: bool,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Check(args) => check(args),
        Commands::Inspect { file, fps } => inspect(&file, &fps).map(|_| 0),
    };
    match code {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            log::error!("{e:#}");
            std::process::exit(EXIT_FATAL);
        }
    }
}

fn check(args: CheckArgs) -> Result<i32> {
    let config = build_config(&args)?;
    let mode = build_mode(&args);
    let frame_rate = args
        .fps
        .as_deref()
        .map(|fps| FrameRate::parse(fps, args.tc.as_deref()))
        .transpose()?;

    let mut request = RunRequest::new(mode.clone(), media_input(&args.source)?);
    if mode.needs_reference() {
        if args.reference.is_empty() {
            bail!("{mode} check needs --reference");
        }
        request = request.with_reference(media_input(&args.reference)?);
    }
    if let Some(rate) = frame_rate {
        request = request.with_frame_rate(rate);
    }
    if let Some(tc) = &args.tc {
        request = request.with_start_timecode(tc.clone());
    }

    let (tx, rx) = crossbeam_channel::unbounded();
    let orchestrator = Orchestrator::new(config)?.with_context(RunContext::new().with_events(tx));
    let show_progress = args.progress;
    let events = thread::spawn(move || {
        for event in rx {
            match event {
                RunEvent::Progress(snapshot) if show_progress => {
                    eprint!(
                        "\rextract {:5.1}%  hash {:5.1}%",
                        snapshot.extract_fraction() * 100.0,
                        snapshot.hash_fraction() * 100.0
                    );
                }
                RunEvent::StateChanged(state) => log::debug!("state: {state:?}"),
                _ => {}
            }
        }
        if show_progress {
            eprintln!();
        }
    });

    let status = orchestrator.run(&request);
    drop(orchestrator);
    let _ = events.join();

    let outcome = match status? {
        RunStatus::Completed(outcome) => outcome,
        RunStatus::Cancelled => return Ok(EXIT_CANCELLED),
    };
    let code = outcome.exit_code();

    let report = RunReport::new(
        format!("wavcheck {}", outcome.mode),
        describe_paths(&args.source),
        describe_paths(&args.reference),
        outcome,
    );
    match &args.output {
        Some(path) => report
            .save(path, args.format.into())
            .with_context(|| format!("cannot write report to {}", path.display()))?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(report.generate(args.format.into()).as_bytes())?;
            stdout.flush()?;
        }
    }
    Ok(code)
}

fn build_config(args: &CheckArgs) -> Result<CheckConfig> {
    let mut config = match &args.config {
        Some(path) => CheckConfig::from_json_file(path)
            .with_context(|| format!("cannot load config {}", path.display()))?,
        None => CheckConfig::default(),
    };
    if let Some(jobs) = args.jobs {
        config = config.with_max_parallel_channels(jobs);
    }
    if args.ffmpeg.is_some() || args.ffprobe.is_some() {
        let ffmpeg = args.ffmpeg.clone().unwrap_or_else(|| config.ffmpeg_path.clone());
        let ffprobe = args.ffprobe.clone().unwrap_or_else(|| config.ffprobe_path.clone());
        config = config.with_tools(ffmpeg, ffprobe);
    }
    if let Some(dir) = &args.work_dir {
        config = config.with_work_root(dir);
    }
    if args.force_16bit {
        config = config.with_force_16bit();
    }
    config.validate()?;
    Ok(config)
}

fn build_mode(args: &CheckArgs) -> CheckMode {
    let trim = Trim {
        head_secs: args.head,
        duration_secs: args.duration,
    };
    let correct_insertion = args.fix_insertion;
    match args.mode {
        ModeArg::Interleave => CheckMode::Interleaved {
            stream_index: args.stream,
            trim,
            correct_insertion,
        },
        ModeArg::Surround51 => CheckMode::Surround51 { trim },
        ModeArg::Oa2 => CheckMode::OaEightChannel {
            layout: OaLayout::TwoStreams,
            trim,
            correct_insertion,
        },
        ModeArg::Oa8 => CheckMode::OaEightChannel {
            layout: OaLayout::EightStreams,
            trim,
            correct_insertion,
        },
        ModeArg::Multimono => CheckMode::MultiMonoStereo { trim },
        ModeArg::MultimonoInterleave => CheckMode::MultiMonoInterleave {
            trim,
            correct_insertion,
        },
        ModeArg::Silence => CheckMode::Silence { trim },
    }
}

/// WAV-family files are read directly; anything else goes through extraction
fn media_input(paths: &[PathBuf]) -> Result<MediaInput> {
    let is_wav = |path: &PathBuf| {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| matches!(e.to_ascii_lowercase().as_str(), "wav" | "rf64" | "bw64"))
    };
    match paths {
        [] => bail!("no input given"),
        [single] if !is_wav(single) => Ok(MediaInput::Container(single.clone())),
        many if many.iter().all(is_wav) => Ok(MediaInput::Wav(many.to_vec())),
        _ => bail!("mixing WAV files with a container is not supported"),
    }
}

fn describe_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn inspect(file: &Path, fps: &str) -> Result<()> {
    let mut stream =
        WavStream::open(file).with_context(|| format!("cannot open {}", file.display()))?;
    let rate = FrameRate::parse(fps, None)?;
    let plan = CadencePlan::new(rate, stream.sample_rate())?;

    println!("File:        {}", file.display());
    println!("Channels:    {}", stream.channels());
    println!("Sample rate: {} Hz", stream.sample_rate());
    println!("Bit depth:   {}", stream.sample_width() * 8);
    println!("Samples:     {}", stream.total_frames());
    println!(
        "Duration:    {:.3} s",
        stream.total_frames() as f64 / stream.sample_rate() as f64
    );

    let ctx = RunContext::new();
    let hashes = hash_channel(&mut stream, plan.clone(), None, &ctx, Side::Source)?;
    let end = Timecode::from_frames(hashes.len() as u64, rate);
    println!(
        "Frames:      {} @ {rate}{}",
        hashes.len(),
        if plan.timecode_capable() { "" } else { " (virtual grid)" }
    );
    println!("Length:      {end}");
    println!("xxh3-64:     {:016x}", hashes.stream_hash);
    Ok(())
}
