//! External decoder interface: ffmpeg/ffprobe child processes.
//!
//! Video decoding streams raw RGBA frames from ffmpeg stdout through a
//! dedicated reader thread and a bounded channel. Audio extraction writes a
//! bounded window to a temporary WAV, then decodes it to mono f32 samples.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

pub const AUDIO_SAMPLE_RATE: u32 = 16_000;

#[derive(Debug, Clone, Serialize)]
pub struct MediaInfo {
    pub width: u32,
    pub height: u32,
    pub duration_seconds: f64,
    pub frame_rate: f64,
    pub codec_name: String,
}

/// Query stream metadata through ffprobe.
pub fn probe(source: &str) -> Result<MediaInfo> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height,codec_name,avg_frame_rate",
            "-show_entries",
            "format=duration",
            "-of",
            "json",
        ])
        .arg(source)
        .output()
        .context("failed to spawn ffprobe (is it installed?)")?;
    if !output.status.success() {
        return Err(anyhow!(
            "ffprobe failed for {source}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }

    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).context("failed to parse ffprobe JSON")?;
    let stream = value["streams"]
        .get(0)
        .ok_or_else(|| anyhow!("{source} has no video stream"))?;

    let width = stream["width"].as_u64().unwrap_or(0) as u32;
    let height = stream["height"].as_u64().unwrap_or(0) as u32;
    if width == 0 || height == 0 {
        return Err(anyhow!("{source}: video stream reports zero dimensions"));
    }
    let frame_rate = parse_frame_rate(stream["avg_frame_rate"].as_str().unwrap_or(""));
    let duration_seconds = value["format"]["duration"]
        .as_str()
        .and_then(|d| d.parse::<f64>().ok())
        .unwrap_or(0.0);

    Ok(MediaInfo {
        width,
        height,
        duration_seconds,
        frame_rate,
        codec_name: stream["codec_name"].as_str().unwrap_or("unknown").to_owned(),
    })
}

fn parse_frame_rate(raw: &str) -> f64 {
    let mut parts = raw.splitn(2, '/');
    let num = parts.next().and_then(|p| p.parse::<f64>().ok());
    let den = parts.next().and_then(|p| p.parse::<f64>().ok());
    match (num, den) {
        (Some(n), Some(d)) if d > 0.0 && n > 0.0 => n / d,
        (Some(n), None) if n > 0.0 => n,
        _ => 0.0,
    }
}

#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub source: String,
    pub start_seconds: f64,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

/// Streaming frame source backed by an ffmpeg child process.
///
/// Frames arrive in decode order on a bounded channel; `next_frame` returns
/// `None` at end-of-media. Reader-thread errors surface from `finish`.
pub struct FfmpegDecoder {
    receiver: mpsc::Receiver<Vec<u8>>,
    worker: Option<JoinHandle<Result<()>>>,
    child: Child,
    pub frame_size: usize,
}

impl FfmpegDecoder {
    pub fn spawn(request: &DecodeRequest, queue_bound: usize) -> Result<Self> {
        let filter = format!(
            "fps={},scale={}:{}",
            request.fps, request.width, request.height
        );
        let (sender, receiver) = mpsc::sync_channel::<Vec<u8>>(queue_bound.max(1));

        let mut child = Command::new("ffmpeg")
            .arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-ss")
            .arg(format!("{:.3}", request.start_seconds.max(0.0)))
            .arg("-i")
            .arg(&request.source)
            .arg("-f")
            .arg("rawvideo")
            .arg("-pix_fmt")
            .arg("rgba")
            .arg("-vf")
            .arg(filter)
            .arg("-sws_flags")
            .arg("area")
            .arg("-")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .stdin(Stdio::null())
            .spawn()
            .context("failed to spawn ffmpeg decoder (is it installed?)")?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("failed to capture ffmpeg stdout"))?;
        let frame_size = (request.width * request.height * 4) as usize;

        let worker = thread::Builder::new()
            .name("tapedeck-decoder".to_owned())
            .spawn(move || {
                loop {
                    let mut buffer = vec![0u8; frame_size];
                    match stdout.read_exact(&mut buffer) {
                        Ok(_) => {
                            if sender.send(buffer).is_err() {
                                break;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                        Err(e) => return Err(anyhow!("failed to read from ffmpeg: {e}")),
                    }
                }
                Ok(())
            })
            .context("failed to spawn ffmpeg reader thread")?;

        Ok(Self {
            receiver,
            worker: Some(worker),
            child,
            frame_size,
        })
    }

    /// Block until the next frame or end-of-media.
    pub fn next_frame(&self) -> Option<Vec<u8>> {
        self.receiver.recv().ok()
    }

    /// Bounded wait so callers can observe cancellation between frames.
    /// `Ok(None)` is end-of-media; `Err(WouldBlock)` means try again.
    pub fn next_frame_timeout(&self, timeout: Duration) -> Result<Option<Vec<u8>>, WouldBlock> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(None),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(WouldBlock),
        }
    }

    pub fn finish(mut self) -> Result<()> {
        let _ = self.child.kill();
        let _ = self.child.wait();

        if let Some(handle) = self.worker.take() {
            match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow!("ffmpeg reader thread panicked")),
            }
        } else {
            Ok(())
        }
    }
}

impl Drop for FfmpegDecoder {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WouldBlock;

/// One decoded audio window: mono f32 samples covering
/// `[start_seconds, start_seconds + duration_seconds)`.
#[derive(Debug, Clone)]
pub struct AudioWindow {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub start_seconds: f64,
    pub duration_seconds: f64,
}

/// Extract `[start, start + duration)` of audio as 16 kHz mono. The WAV
/// intermediate lives in `scratch_dir` and is removed when this call
/// returns. `Ok(None)` means the source has no audio left at that offset.
pub fn extract_audio_window(
    source: &str,
    start_seconds: f64,
    duration_seconds: f64,
    scratch_dir: &Path,
) -> Result<Option<AudioWindow>> {
    let wav = tempfile::Builder::new()
        .prefix("tapedeck-audio-")
        .suffix(".wav")
        .tempfile_in(scratch_dir)
        .context("failed to create temporary audio file")?;

    let status = Command::new("ffmpeg")
        .arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-ss")
        .arg(format!("{:.3}", start_seconds.max(0.0)))
        .arg("-t")
        .arg(format!("{:.3}", duration_seconds))
        .arg("-i")
        .arg(source)
        .arg("-vn")
        .arg("-ac")
        .arg("1")
        .arg("-ar")
        .arg(AUDIO_SAMPLE_RATE.to_string())
        .arg("-y")
        .arg(wav.path())
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("failed to spawn ffmpeg audio extractor")?;
    if !status.success() {
        return Err(anyhow!(
            "ffmpeg audio extraction failed at {start_seconds:.3}s"
        ));
    }

    let reader = match hound::WavReader::open(wav.path()) {
        Ok(reader) => reader,
        // Zero-byte output: ffmpeg ran past the end of the stream.
        Err(_) => return Ok(None),
    };
    let spec = reader.spec();
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => reader
            .into_samples::<i16>()
            .filter_map(|s| s.ok())
            .map(|s| f32::from(s) / f32::from(i16::MAX))
            .collect(),
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .filter_map(|s| s.ok())
            .collect(),
    };
    if samples.is_empty() {
        return Ok(None);
    }

    let actual = samples.len() as f64 / f64::from(spec.sample_rate.max(1));
    Ok(Some(AudioWindow {
        samples,
        sample_rate: spec.sample_rate,
        start_seconds,
        duration_seconds: actual,
    }))
}
