//! Subtitle data model and the two line-oriented interchange formats.
//!
//! SRT: numbered cues, blank-line delimited, `HH:MM:SS,mmm` timestamps.
//! WebVTT: fixed `WEBVTT` header, `HH:MM:SS.mmm` timestamps.
//! Both accept an optional `[speaker]` bracket prefix per cue line.

use std::sync::RwLock;

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

impl TranscriptSegment {
    pub fn new(start_seconds: f64, end_seconds: f64, text: impl Into<String>) -> Self {
        Self {
            start_seconds,
            end_seconds,
            text: text.into(),
            speaker: None,
        }
    }

    pub fn contains(&self, time_seconds: f64) -> bool {
        time_seconds >= self.start_seconds && time_seconds < self.end_seconds
    }
}

/// Append-only, time-ordered subtitle track. Safe to read concurrently with
/// appends; readers only need a time-indexed lookup, never mutation of an
/// existing entry.
#[derive(Debug, Default)]
pub struct SubtitleTrack {
    segments: RwLock<Vec<TranscriptSegment>>,
}

impl SubtitleTrack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_segments(mut segments: Vec<TranscriptSegment>) -> Self {
        segments.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));
        Self {
            segments: RwLock::new(segments),
        }
    }

    pub fn append(&self, segment: TranscriptSegment) {
        let mut segments = self.segments.write().unwrap_or_else(|e| e.into_inner());
        segments.push(segment);
    }

    /// Text active at `time_seconds`, with overlapping cues joined by spaces.
    pub fn text_at(&self, time_seconds: f64) -> Option<String> {
        let segments = self.segments.read().unwrap_or_else(|e| e.into_inner());
        let active: Vec<&str> = segments
            .iter()
            .filter(|segment| segment.contains(time_seconds))
            .map(|segment| segment.text.as_str())
            .collect();
        if active.is_empty() {
            None
        } else {
            Some(active.join(" "))
        }
    }

    pub fn snapshot(&self) -> Vec<TranscriptSegment> {
        self.segments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.segments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_end_seconds(&self) -> Option<f64> {
        self.segments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .last()
            .map(|segment| segment.end_seconds)
    }
}

fn format_timestamp(seconds: f64, fraction_separator: char) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let total_secs = total_ms / 1000;
    format!(
        "{:02}:{:02}:{:02}{}{:03}",
        total_secs / 3600,
        (total_secs / 60) % 60,
        total_secs % 60,
        fraction_separator,
        ms
    )
}

fn cue_line(segment: &TranscriptSegment) -> String {
    match &segment.speaker {
        Some(speaker) => format!("[{}] {}", speaker, segment.text),
        None => segment.text.clone(),
    }
}

pub fn format_srt(segments: &[TranscriptSegment]) -> String {
    let mut output = String::new();
    for (index, segment) in segments.iter().enumerate() {
        output.push_str(&format!("{}\n", index + 1));
        output.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(segment.start_seconds, ','),
            format_timestamp(segment.end_seconds, ','),
        ));
        output.push_str(&cue_line(segment));
        output.push_str("\n\n");
    }
    output
}

pub fn format_vtt(segments: &[TranscriptSegment]) -> String {
    let mut output = String::from("WEBVTT\n\n");
    for segment in segments {
        output.push_str(&format!(
            "{} --> {}\n",
            format_timestamp(segment.start_seconds, '.'),
            format_timestamp(segment.end_seconds, '.'),
        ));
        output.push_str(&cue_line(segment));
        output.push_str("\n\n");
    }
    output
}

fn timing_regex() -> Regex {
    // Both formats share shape; only the fraction separator differs.
    Regex::new(r"(\d{2}):(\d{2}):(\d{2})[,.](\d{3})\s*-->\s*(\d{2}):(\d{2}):(\d{2})[,.](\d{3})")
        .unwrap_or_else(|_| unreachable!("timing regex is valid"))
}

fn parse_cue_text(line: &str) -> (Option<String>, String) {
    let trimmed = line.trim();
    if let Some(rest) = trimmed.strip_prefix('[') {
        if let Some(close) = rest.find(']') {
            let speaker = rest[..close].trim().to_owned();
            let text = rest[close + 1..].trim().to_owned();
            if !speaker.is_empty() && !text.is_empty() {
                return (Some(speaker), text);
            }
        }
    }
    (None, trimmed.to_owned())
}

fn capture_seconds(caps: &regex::Captures<'_>, base: usize) -> Result<f64> {
    let field = |i: usize| -> Result<f64> {
        caps.get(base + i)
            .ok_or_else(|| anyhow!("missing timestamp field"))?
            .as_str()
            .parse::<f64>()
            .context("invalid timestamp field")
    };
    Ok(field(0)? * 3600.0 + field(1)? * 60.0 + field(2)? + field(3)? / 1000.0)
}

/// Parse either subtitle format: cue blocks separated by blank lines, each
/// with an optional numeric index (SRT), a timing line, and one or more text
/// lines. The WebVTT header and cue identifiers are skipped.
pub fn parse(content: &str) -> Result<Vec<TranscriptSegment>> {
    let timing = timing_regex();
    let mut segments = Vec::new();
    let mut lines = content.lines().peekable();

    while let Some(line) = lines.next() {
        let Some(caps) = timing.captures(line) else {
            continue;
        };
        let start_seconds = capture_seconds(&caps, 1)?;
        let end_seconds = capture_seconds(&caps, 5)?;
        if end_seconds < start_seconds {
            return Err(anyhow!(
                "cue ends before it starts: {start_seconds} --> {end_seconds}"
            ));
        }

        let mut text_lines = Vec::new();
        while let Some(next) = lines.peek() {
            if next.trim().is_empty() {
                break;
            }
            text_lines.push(lines.next().unwrap_or_default());
        }
        if text_lines.is_empty() {
            continue;
        }
        let (speaker, first) = parse_cue_text(text_lines[0]);
        let mut text = first;
        for extra in &text_lines[1..] {
            text.push(' ');
            text.push_str(extra.trim());
        }
        segments.push(TranscriptSegment {
            start_seconds,
            end_seconds,
            text,
            speaker,
        });
    }

    if segments.is_empty() {
        return Err(anyhow!("no subtitle cues found"));
    }
    segments.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));
    Ok(segments)
}
