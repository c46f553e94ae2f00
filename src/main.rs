use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tapedeck::ascii::RenderOptions;
use tapedeck::cancel::CancelToken;
use tapedeck::decoding::{self, DecodeRequest, FfmpegDecoder};
use tapedeck::fingerprint;
use tapedeck::pipeline::{self, Captions, PlayerConfig, DEFAULT_LOOKAHEAD};
use tapedeck::subtitles::{self, SubtitleTrack};
use tapedeck::transcribe::{ChunkScheduler, StepOutcome};

const VERSION: &str = match option_env!("TAPEDECK_GIT_HASH") {
    Some(hash) => hash,
    None => env!("CARGO_PKG_VERSION"),
};

#[derive(Debug, Parser)]
#[command(name = "tapedeck")]
#[command(about = "Terminal video player with live captions")]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Play a video in the terminal.
    Play {
        source: String,
        /// Override the probed frame rate.
        #[arg(long)]
        fps: Option<f64>,
        /// Playback speed multiplier.
        #[arg(long, default_value_t = 1.0)]
        speed: f64,
        /// Start position in seconds.
        #[arg(long, default_value_t = 0.0)]
        start: f64,
        /// Replay at end of media: `--loop` forever, `--loop N` for N replays.
        #[arg(long = "loop", value_name = "N", num_args = 0..=1, default_missing_value = "0")]
        loop_count: Option<u32>,
        /// ANSI 256-color output instead of plain luma ramp.
        #[arg(long)]
        color: bool,
        /// Decoded frames buffered ahead of the display.
        #[arg(long, default_value_t = DEFAULT_LOOKAHEAD)]
        lookahead: usize,
        /// Attach a subtitle file (SRT or WebVTT) instead of live captions.
        #[arg(long)]
        subtitles: Option<PathBuf>,
        /// Speech model for live captions (requires the whisper feature).
        #[arg(long)]
        model: Option<PathBuf>,
        /// Caption language hint, e.g. "en".
        #[arg(long)]
        language: Option<String>,
    },
    /// Print stream metadata.
    Probe {
        source: String,
        #[arg(long)]
        json: bool,
    },
    /// Transcribe a whole file to SRT, WebVTT, or JSON.
    Transcribe {
        source: String,
        #[arg(short = 'o', long = "output")]
        output: PathBuf,
        #[arg(long)]
        model: PathBuf,
        #[arg(long)]
        language: Option<String>,
    },
    /// Extract visually distinct frames as text renders.
    Keyframes {
        source: String,
        #[arg(short = 'o', long = "output-dir")]
        output_dir: PathBuf,
        /// Seconds between sampled frames.
        #[arg(long, default_value_t = 1.0)]
        step: f64,
        /// Hamming distance at or below which frames count as duplicates.
        #[arg(long, default_value_t = 10)]
        threshold: u32,
        #[arg(long, default_value_t = 120)]
        cols: usize,
        #[arg(long, default_value_t = 40)]
        rows: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Play {
            source,
            fps,
            speed,
            start,
            loop_count,
            color,
            lookahead,
            subtitles,
            model,
            language,
        } => {
            let config = PlayerConfig {
                source,
                fps,
                speed,
                start_seconds: start,
                loop_count,
                color,
                lookahead,
            };
            run_play(&config, subtitles.as_deref(), model.as_deref(), language)
        }
        Commands::Probe { source, json } => run_probe(&source, json),
        Commands::Transcribe {
            source,
            output,
            model,
            language,
        } => run_transcribe(&source, &output, &model, language.as_deref()),
        Commands::Keyframes {
            source,
            output_dir,
            step,
            threshold,
            cols,
            rows,
        } => run_keyframes(&source, &output_dir, step, threshold, cols, rows),
    }
}

fn run_play(
    config: &PlayerConfig,
    subtitle_path: Option<&Path>,
    model: Option<&Path>,
    language: Option<String>,
) -> Result<()> {
    if config.speed <= 0.0 {
        bail!("--speed must be positive, got {}", config.speed);
    }
    let info = decoding::probe(&config.source)?;
    let cancel = CancelToken::new();

    let mut scheduler_handle = None;
    let mut scheduler_ref = None;
    let captions = if let Some(path) = subtitle_path {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read subtitles from {}", path.display()))?;
        let segments = subtitles::parse(&content)
            .with_context(|| format!("failed to parse subtitles from {}", path.display()))?;
        eprintln!(
            "[tapedeck] subtitles: {} cue(s) from {}",
            segments.len(),
            path.display()
        );
        Some(Captions {
            track: Arc::new(SubtitleTrack::from_segments(segments)),
            scheduler: None,
        })
    } else if let Some(model) = model {
        let scheduler = build_scheduler(&config.source, model, language.as_deref(), &cancel)?;
        scheduler_handle = Some(scheduler.start_background()?);
        scheduler_ref = Some(Arc::clone(&scheduler));
        Some(Captions {
            track: scheduler.track(),
            scheduler: Some(scheduler),
        })
    } else {
        None
    };

    let result = pipeline::run_player(&info, config, captions, cancel.clone());

    cancel.cancel();
    if let Some(handle) = scheduler_handle {
        let _ = handle.join();
    }
    if let Some(scheduler) = scheduler_ref {
        eprintln!(
            "[tapedeck] captions: {} segment(s), watermark {:.1}s",
            scheduler.track().len(),
            scheduler.watermark_seconds()
        );
    }
    result.map_err(Into::into)
}

#[cfg(feature = "whisper")]
fn build_scheduler(
    source: &str,
    model: &Path,
    language: Option<&str>,
    cancel: &CancelToken,
) -> Result<Arc<ChunkScheduler>> {
    use tapedeck::transcribe::{ChunkConfig, FfmpegAudioSource};

    let model = model
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("model path is not valid UTF-8"))?;
    eprintln!("[tapedeck] loading speech model {model}");
    let engine = tapedeck::whisper_engine::WhisperEngine::load(model, language)?;
    Ok(Arc::new(ChunkScheduler::new(
        Box::new(engine),
        Box::new(FfmpegAudioSource::new(source)?),
        Arc::new(SubtitleTrack::new()),
        ChunkConfig::default(),
        cancel.clone(),
    )))
}

#[cfg(not(feature = "whisper"))]
fn build_scheduler(
    _source: &str,
    _model: &Path,
    _language: Option<&str>,
    _cancel: &CancelToken,
) -> Result<Arc<ChunkScheduler>> {
    bail!("live captions need a build with the `whisper` feature; use --subtitles instead")
}

fn run_probe(source: &str, json: bool) -> Result<()> {
    let info = decoding::probe(source)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }
    println!(
        "{source}: {}x{}, {:.3} fps, {:.2}s, codec {}",
        info.width, info.height, info.frame_rate, info.duration_seconds, info.codec_name
    );
    Ok(())
}

fn run_transcribe(
    source: &str,
    output: &Path,
    model: &Path,
    language: Option<&str>,
) -> Result<()> {
    let cancel = CancelToken::new();
    let scheduler = build_scheduler(
        source,
        model,
        language,
        &cancel,
    )?;

    loop {
        match scheduler.step() {
            StepOutcome::Advanced => {
                eprintln!(
                    "[tapedeck] transcribed up to {:.1}s",
                    scheduler.watermark_seconds()
                );
            }
            StepOutcome::Failed => {
                eprintln!(
                    "[tapedeck] recognition failed near {:.1}s, retrying",
                    scheduler.watermark_seconds()
                );
            }
            StepOutcome::Complete => break,
            StepOutcome::Stalled => bail!(
                "transcription stalled at {:.1}s",
                scheduler.watermark_seconds()
            ),
            StepOutcome::Cancelled => break,
        }
    }

    let segments = scheduler.track().snapshot();
    let extension = output
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    let rendered = match extension.as_str() {
        "srt" => subtitles::format_srt(&segments),
        "vtt" => subtitles::format_vtt(&segments),
        "json" => {
            let mut text = serde_json::to_string_pretty(&segments)?;
            text.push('\n');
            text
        }
        other => bail!("unsupported output format .{other}; use .srt, .vtt, or .json"),
    };
    fs::write(output, rendered)
        .with_context(|| format!("failed to write {}", output.display()))?;
    println!("Wrote {} ({} segments)", output.display(), segments.len());
    Ok(())
}

fn run_keyframes(
    source: &str,
    output_dir: &Path,
    step: f64,
    threshold: u32,
    cols: usize,
    rows: usize,
) -> Result<()> {
    if step <= 0.0 {
        bail!("--step must be positive, got {step}");
    }
    let request = DecodeRequest {
        source: source.to_owned(),
        start_seconds: 0.0,
        fps: 1.0 / step,
        width: cols as u32,
        height: rows as u32,
    };
    let decoder = FfmpegDecoder::spawn(&request, 8)?;

    let mut frames = Vec::new();
    while let Some(pixels) = decoder.next_frame() {
        frames.push(pixels);
    }
    decoder.finish()?;
    if frames.is_empty() {
        bail!("no frames decoded from {source}");
    }

    let fingerprints: Vec<_> = frames
        .iter()
        .map(|pixels| fingerprint::compute(pixels, cols as u32, rows as u32))
        .collect();
    let kept = fingerprint::filter_similar(&fingerprints, threshold);
    eprintln!(
        "[tapedeck] keyframes: kept {} of {} sampled frame(s)",
        kept.len(),
        frames.len()
    );

    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    let options = RenderOptions::new(cols, rows);
    for &index in &kept {
        let frame = tapedeck::ascii::render(&frames[index], cols as u32, rows as u32, &options);
        let seconds = index as f64 * step;
        let path = output_dir.join(format!("keyframe_{:08.2}s.txt", seconds));
        fs::write(&path, frame.to_text())
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    println!(
        "Wrote {} keyframe(s) to {}",
        kept.len(),
        output_dir.display()
    );
    Ok(())
}
