//! Chunked ahead-of-playback transcription scheduler.
//!
//! Audio is pulled in fixed-size windows that overlap backward by
//! [`ChunkConfig::overlap_seconds`] so words are never cut at a boundary.
//! Each window is recognized, filtered for hallucinations, and appended to a
//! shared [`SubtitleTrack`]; a monotone watermark records how far
//! transcription is known complete. Every recognition step runs under one
//! lock, so a background worker and synchronous catch-up calls never drive
//! the (non-reentrant) recognition engine concurrently.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use crate::cancel::CancelToken;
use crate::decoding::{self, AudioWindow};
use crate::subtitles::{SubtitleTrack, TranscriptSegment};

/// One recognized span, with times relative to the start of the window the
/// recognizer was given.
#[derive(Debug, Clone)]
pub struct RecognizedSegment {
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
    pub confidence: f32,
    pub speaker: Option<String>,
}

/// The speech-to-text engine seam. Implementations may be slow to construct
/// (model loading); construct once per session. Calls are never concurrent:
/// the scheduler owns the only reference and serializes access.
pub trait SpeechRecognizer: Send {
    fn recognize(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        prompt: Option<&str>,
    ) -> Result<Vec<RecognizedSegment>>;
}

/// Bounded audio extraction seam. `Ok(None)` signals end of media.
pub trait AudioSource: Send {
    fn extract(&mut self, start_seconds: f64, duration_seconds: f64)
        -> Result<Option<AudioWindow>>;
}

/// Audio source backed by the external ffmpeg extractor. Window WAVs live in
/// an owned scratch directory that is deleted when the source is dropped.
pub struct FfmpegAudioSource {
    source: String,
    scratch: tempfile::TempDir,
}

impl FfmpegAudioSource {
    pub fn new(source: &str) -> Result<Self> {
        Ok(Self {
            source: source.to_owned(),
            scratch: tempfile::tempdir().context("failed to create audio scratch directory")?,
        })
    }
}

impl AudioSource for FfmpegAudioSource {
    fn extract(
        &mut self,
        start_seconds: f64,
        duration_seconds: f64,
    ) -> Result<Option<AudioWindow>> {
        decoding::extract_audio_window(
            &self.source,
            start_seconds,
            duration_seconds,
            self.scratch.path(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Nominal window length fed to the recognizer.
    pub chunk_seconds: f64,
    /// Backward overlap applied to every window except the first.
    pub overlap_seconds: f64,
    /// A window advancing less than this fraction of the nominal length is
    /// treated as end-of-media. Tunable heuristic, not a contract.
    pub tail_fraction: f64,
    /// Consecutive failed steps with no progress before entering Stalled.
    pub max_consecutive_failures: u32,
    /// Attempts on one window before skipping past it.
    pub retries_per_window: u32,
    /// Trailing accepted text carried into the next window's prompt hint.
    pub prompt_tail_chars: usize,
    /// How far past the playback position live captions stay transcribed.
    pub buffer_ahead_seconds: f64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_seconds: 30.0,
            overlap_seconds: 2.0,
            tail_fraction: 0.3,
            max_consecutive_failures: 3,
            retries_per_window: 2,
            prompt_tail_chars: 200,
            buffer_ahead_seconds: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    NotStarted,
    Running,
    Complete,
    Stalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Window recognized, watermark advanced.
    Advanced,
    /// Transient failure; the step will be retried or the window skipped.
    Failed,
    Complete,
    Stalled,
    Cancelled,
}

struct Inner {
    recognizer: Box<dyn SpeechRecognizer>,
    source: Box<dyn AudioSource>,
    prompt_tail: String,
    first_window: bool,
    window_attempts: u32,
    consecutive_failures: u32,
    repeat_text: Option<String>,
    repeat_count: u32,
}

pub struct ChunkScheduler {
    inner: Mutex<Inner>,
    track: Arc<SubtitleTrack>,
    config: ChunkConfig,
    cancel: CancelToken,
    watermark_ms: AtomicU64,
    playhead_ms: AtomicU64,
    complete: AtomicBool,
    stalled: AtomicBool,
    started: AtomicBool,
    background_running: AtomicBool,
}

impl ChunkScheduler {
    pub fn new(
        recognizer: Box<dyn SpeechRecognizer>,
        source: Box<dyn AudioSource>,
        track: Arc<SubtitleTrack>,
        config: ChunkConfig,
        cancel: CancelToken,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                recognizer,
                source,
                prompt_tail: String::new(),
                first_window: true,
                window_attempts: 0,
                consecutive_failures: 0,
                repeat_text: None,
                repeat_count: 0,
            }),
            track,
            config,
            cancel,
            watermark_ms: AtomicU64::new(0),
            playhead_ms: AtomicU64::new(0),
            complete: AtomicBool::new(false),
            stalled: AtomicBool::new(false),
            started: AtomicBool::new(false),
            background_running: AtomicBool::new(false),
        }
    }

    pub fn track(&self) -> Arc<SubtitleTrack> {
        Arc::clone(&self.track)
    }

    pub fn config(&self) -> &ChunkConfig {
        &self.config
    }

    /// Furthest point up to which transcription is known complete.
    /// Non-decreasing for the lifetime of the scheduler.
    pub fn watermark_seconds(&self) -> f64 {
        self.watermark_ms.load(Ordering::SeqCst) as f64 / 1000.0
    }

    /// Publish the playback position. The background worker transcribes
    /// until the watermark leads the playhead by
    /// [`ChunkConfig::buffer_ahead_seconds`], then idles. The playhead only
    /// moves forward; the watermark is monotone, so a backward seek needs
    /// no new work.
    pub fn note_playhead(&self, position_seconds: f64) {
        let ms = (position_seconds.max(0.0) * 1000.0).round() as u64;
        self.playhead_ms.fetch_max(ms, Ordering::SeqCst);
    }

    fn behind_playhead(&self) -> bool {
        let playhead = self.playhead_ms.load(Ordering::SeqCst) as f64 / 1000.0;
        self.watermark_seconds() < playhead + self.config.buffer_ahead_seconds
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SchedulerState {
        if self.complete.load(Ordering::SeqCst) {
            SchedulerState::Complete
        } else if self.stalled.load(Ordering::SeqCst) {
            SchedulerState::Stalled
        } else if self.started.load(Ordering::SeqCst) {
            SchedulerState::Running
        } else {
            SchedulerState::NotStarted
        }
    }

    /// Non-blocking: are captions for `time_seconds` already in the track?
    pub fn has_subtitles_ready_for(&self, time_seconds: f64) -> bool {
        self.is_complete() || self.watermark_seconds() >= time_seconds
    }

    /// Run extraction/recognition steps synchronously until the watermark
    /// passes `target_seconds`, completion, stall, or cancellation. Safe to
    /// call concurrently: each window is recognized exactly once because the
    /// watermark only advances under the step lock.
    pub fn ensure_transcribed_up_to(&self, target_seconds: f64) {
        loop {
            if self.has_subtitles_ready_for(target_seconds) || self.cancel.is_cancelled() {
                return;
            }
            match self.step() {
                StepOutcome::Advanced | StepOutcome::Failed => continue,
                StepOutcome::Complete | StepOutcome::Stalled | StepOutcome::Cancelled => return,
            }
        }
    }

    /// Block until captions cover `time_seconds`, completion, or timeout.
    /// Polls a running background worker; otherwise does the work itself.
    /// Returns false only on timeout or stall without coverage.
    pub fn wait_until_ready(&self, time_seconds: f64, timeout: Duration) -> bool {
        self.note_playhead(time_seconds);
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_subtitles_ready_for(time_seconds) {
                return true;
            }
            if self.cancel.is_cancelled() || self.state() == SchedulerState::Stalled {
                return false;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if self.background_running.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(25));
            } else {
                self.step();
            }
        }
    }

    /// Launch the background scheduler. It paces itself against the last
    /// reported playhead, keeping the watermark `buffer_ahead_seconds` in
    /// front and idling once that lead exists. It shares the step lock with
    /// synchronous callers, yielding briefly between steps so catch-up
    /// calls can interleave.
    pub fn start_background(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        self.background_running.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        thread::Builder::new()
            .name("tapedeck-transcriber".to_owned())
            .spawn(move || {
                loop {
                    if this.cancel.is_cancelled() {
                        break;
                    }
                    if !this.behind_playhead() && !this.is_complete() {
                        thread::sleep(Duration::from_millis(25));
                        continue;
                    }
                    match this.step() {
                        StepOutcome::Advanced => thread::sleep(Duration::from_millis(10)),
                        StepOutcome::Failed => thread::sleep(Duration::from_millis(100)),
                        StepOutcome::Complete
                        | StepOutcome::Stalled
                        | StepOutcome::Cancelled => break,
                    }
                }
                this.background_running.store(false, Ordering::SeqCst);
            })
            .context("failed to spawn transcription worker")
    }

    /// One extract-recognize-filter-append step under the single-owner lock.
    pub fn step(&self) -> StepOutcome {
        let mut inner = self.lock_inner();
        if self.complete.load(Ordering::SeqCst) {
            return StepOutcome::Complete;
        }
        if self.cancel.is_cancelled() {
            return StepOutcome::Cancelled;
        }
        self.started.store(true, Ordering::SeqCst);

        let watermark = self.watermark_seconds();
        let first = inner.first_window;
        let overlap = if first {
            0.0
        } else {
            self.config.overlap_seconds
        };
        let extract_start = (watermark - overlap).max(0.0);

        let window = match inner.source.extract(extract_start, self.config.chunk_seconds) {
            Err(err) => return self.note_failure(&mut inner, &err),
            Ok(None) => {
                self.complete.store(true, Ordering::SeqCst);
                return StepOutcome::Complete;
            }
            Ok(Some(window)) => window,
        };

        let prompt = (!inner.prompt_tail.is_empty()).then(|| inner.prompt_tail.clone());
        let raw = match inner
            .recognizer
            .recognize(&window.samples, window.sample_rate, prompt.as_deref())
        {
            Err(err) => return self.note_failure(&mut inner, &err),
            Ok(raw) => raw,
        };

        let accepted = filter_window(&mut inner, raw, &window, watermark, first);
        for segment in &accepted {
            self.track.append(segment.clone());
            push_prompt_tail(
                &mut inner.prompt_tail,
                &segment.text,
                self.config.prompt_tail_chars,
            );
        }

        self.advance_watermark(extract_start + window.duration_seconds);
        inner.first_window = false;
        inner.window_attempts = 0;
        inner.consecutive_failures = 0;
        // A successful foreground catch-up clears a stall.
        self.stalled.store(false, Ordering::SeqCst);

        let advanced = window.duration_seconds - overlap;
        if advanced < self.config.tail_fraction * self.config.chunk_seconds {
            self.complete.store(true, Ordering::SeqCst);
            StepOutcome::Complete
        } else {
            StepOutcome::Advanced
        }
    }

    fn note_failure(&self, inner: &mut Inner, err: &anyhow::Error) -> StepOutcome {
        inner.consecutive_failures += 1;
        inner.window_attempts += 1;
        eprintln!(
            "[tapedeck] transcription window failed ({} in a row): {err:#}",
            inner.consecutive_failures
        );
        if inner.consecutive_failures >= self.config.max_consecutive_failures {
            self.stalled.store(true, Ordering::SeqCst);
            return StepOutcome::Stalled;
        }
        if inner.window_attempts >= self.config.retries_per_window {
            // Skip past the bad window so one chunk cannot stall the track.
            let overlap = if inner.first_window {
                0.0
            } else {
                self.config.overlap_seconds
            };
            self.advance_watermark(
                self.watermark_seconds() + self.config.chunk_seconds - overlap,
            );
            inner.window_attempts = 0;
            inner.first_window = false;
            // The skip moved the watermark, so the streak is broken.
            inner.consecutive_failures = 0;
        }
        StepOutcome::Failed
    }

    fn advance_watermark(&self, seconds: f64) {
        let ms = (seconds.max(0.0) * 1000.0).round() as u64;
        self.watermark_ms.fetch_max(ms, Ordering::SeqCst);
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Per-window output filtering: drop empties, drop segments fully inside the
/// previous window's overlap zone, drop repeating n-gram hallucinations, and
/// collapse runs of byte-identical consecutive segments to at most one
/// repeat (runs may span window boundaries).
fn filter_window(
    inner: &mut Inner,
    raw: Vec<RecognizedSegment>,
    window: &AudioWindow,
    true_start: f64,
    first: bool,
) -> Vec<TranscriptSegment> {
    let mut cleaned: Vec<TranscriptSegment> = Vec::new();
    for segment in raw {
        let text = segment.text.trim();
        if text.is_empty() {
            continue;
        }
        if is_repetitive_text(text) {
            continue;
        }
        let start = window.start_seconds + segment.start_seconds.max(0.0);
        let end = window.start_seconds + segment.end_seconds.max(0.0);
        // Content ending at or before the chunk's true start duplicates what
        // the previous chunk already emitted.
        if !first && end <= true_start + 1e-9 {
            continue;
        }
        cleaned.push(TranscriptSegment {
            start_seconds: start,
            end_seconds: end,
            text: text.to_owned(),
            speaker: segment.speaker,
        });
    }
    cleaned.sort_by(|a, b| a.start_seconds.total_cmp(&b.start_seconds));

    let mut accepted = Vec::with_capacity(cleaned.len());
    for segment in cleaned {
        if inner.repeat_text.as_deref() == Some(segment.text.as_str()) {
            inner.repeat_count += 1;
            if inner.repeat_count > 2 {
                continue;
            }
        } else {
            inner.repeat_text = Some(segment.text.clone());
            inner.repeat_count = 1;
        }
        accepted.push(segment);
    }
    accepted
}

/// Hallucination signature: the whole segment is one short phrase (1-4
/// words) repeated three or more times.
pub fn is_repetitive_text(text: &str) -> bool {
    let words: Vec<&str> = text.split_whitespace().collect();
    for phrase_len in 1..=4usize {
        if words.len() < phrase_len * 3 || words.len() % phrase_len != 0 {
            continue;
        }
        let phrase = &words[..phrase_len];
        if words.chunks(phrase_len).all(|chunk| chunk == phrase) {
            return true;
        }
    }
    false
}

fn push_prompt_tail(tail: &mut String, text: &str, max_chars: usize) {
    if !tail.is_empty() {
        tail.push(' ');
    }
    tail.push_str(text);
    let excess = tail.chars().count().saturating_sub(max_chars);
    if excess > 0 {
        let cut = tail
            .char_indices()
            .nth(excess)
            .map(|(idx, _)| idx)
            .unwrap_or(0);
        tail.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Recognizer that replays a fixed script per window and counts calls.
    struct ScriptedRecognizer {
        // window index -> window-relative segments
        script: Vec<Vec<RecognizedSegment>>,
        calls: Arc<AtomicU64>,
        fail_times: u32,
    }

    impl SpeechRecognizer for ScriptedRecognizer {
        fn recognize(
            &mut self,
            _samples: &[f32],
            _sample_rate: u32,
            _prompt: Option<&str>,
        ) -> Result<Vec<RecognizedSegment>> {
            if self.fail_times > 0 {
                self.fail_times -= 1;
                anyhow::bail!("scripted failure");
            }
            let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            Ok(self.script.get(call).cloned().unwrap_or_default())
        }
    }

    /// Audio source over a fixed media duration; windows past the end shrink
    /// and windows starting at/after the end return `None`. Records every
    /// extraction start so tests can prove no window is processed twice.
    struct SyntheticAudio {
        media_seconds: f64,
        starts: Arc<Mutex<Vec<f64>>>,
    }

    impl SyntheticAudio {
        fn over(media_seconds: f64) -> Self {
            Self {
                media_seconds,
                starts: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl AudioSource for SyntheticAudio {
        fn extract(
            &mut self,
            start_seconds: f64,
            duration_seconds: f64,
        ) -> Result<Option<AudioWindow>> {
            self.starts.lock().unwrap().push(start_seconds);
            if start_seconds >= self.media_seconds {
                return Ok(None);
            }
            let actual = (self.media_seconds - start_seconds).min(duration_seconds);
            let sample_rate = 16_000u32;
            Ok(Some(AudioWindow {
                samples: vec![0.0; (actual * f64::from(sample_rate)) as usize],
                sample_rate,
                start_seconds,
                duration_seconds: actual,
            }))
        }
    }

    fn seg(start: f64, end: f64, text: &str) -> RecognizedSegment {
        RecognizedSegment {
            start_seconds: start,
            end_seconds: end,
            text: text.to_owned(),
            confidence: 0.9,
            speaker: None,
        }
    }

    fn scheduler_over(
        script: Vec<Vec<RecognizedSegment>>,
        media_seconds: f64,
        fail_times: u32,
    ) -> (Arc<ChunkScheduler>, Arc<AtomicU64>, Arc<Mutex<Vec<f64>>>) {
        scheduler_with(script, media_seconds, fail_times, ChunkConfig::default())
    }

    fn scheduler_with(
        script: Vec<Vec<RecognizedSegment>>,
        media_seconds: f64,
        fail_times: u32,
        config: ChunkConfig,
    ) -> (Arc<ChunkScheduler>, Arc<AtomicU64>, Arc<Mutex<Vec<f64>>>) {
        let calls = Arc::new(AtomicU64::new(0));
        let recognizer = ScriptedRecognizer {
            script,
            calls: Arc::clone(&calls),
            fail_times,
        };
        let source = SyntheticAudio::over(media_seconds);
        let starts = Arc::clone(&source.starts);
        let scheduler = Arc::new(ChunkScheduler::new(
            Box::new(recognizer),
            Box::new(source),
            Arc::new(SubtitleTrack::new()),
            config,
            CancelToken::new(),
        ));
        (scheduler, calls, starts)
    }

    #[test]
    fn repetitive_phrase_six_times_is_rejected() {
        assert!(is_repetitive_text("thank you thank you thank you thank you thank you thank you"));
    }

    #[test]
    fn repetitive_phrase_twice_is_accepted() {
        assert!(!is_repetitive_text("thank you thank you"));
    }

    #[test]
    fn single_word_spam_is_rejected() {
        assert!(is_repetitive_text("la la la la la"));
        assert!(!is_repetitive_text("well well"));
    }

    #[test]
    fn watermark_is_monotone_and_freezes_on_complete() {
        let (scheduler, _, _) = scheduler_over(
            vec![
                vec![seg(0.0, 28.0, "first window")],
                vec![seg(1.0, 29.0, "second window")],
                vec![seg(1.0, 29.0, "third window")],
            ],
            90.0,
            0,
        );
        let mut last = 0.0;
        loop {
            let outcome = scheduler.step();
            let watermark = scheduler.watermark_seconds();
            assert!(watermark >= last, "watermark must never decrease");
            last = watermark;
            if outcome != StepOutcome::Advanced {
                break;
            }
        }
        assert!(scheduler.is_complete());
        let frozen = scheduler.watermark_seconds();
        assert_eq!(scheduler.step(), StepOutcome::Complete);
        assert_eq!(scheduler.watermark_seconds(), frozen);
    }

    #[test]
    fn three_chunk_media_covers_the_track() {
        // 90s media, 30s chunks, 2s overlap: windows at 0, 28, 56, 84.
        let (scheduler, calls, _) = scheduler_over(
            vec![
                vec![seg(0.0, 29.5, "one")],
                vec![seg(2.0, 30.0, "two")],
                vec![seg(2.0, 30.0, "three")],
                vec![seg(2.0, 6.0, "four")],
            ],
            90.0,
            0,
        );
        scheduler.ensure_transcribed_up_to(f64::MAX);
        assert!(scheduler.is_complete());
        assert!(scheduler.watermark_seconds() >= 88.0);
        assert!(scheduler.watermark_seconds() <= 90.0);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let track = scheduler.track();
        let last_end = track.last_end_seconds().unwrap();
        assert!(last_end >= 88.0 && last_end <= 90.0, "last end {last_end}");
        let snapshot = track.snapshot();
        for pair in snapshot.windows(2) {
            let gap = pair[0].end_seconds - pair[1].start_seconds;
            assert!(
                gap <= scheduler.config().overlap_seconds + 1e-9,
                "segments overlap by more than the overlap window: {gap}"
            );
        }
    }

    #[test]
    fn overlap_zone_segments_are_discarded() {
        // Second window starts at 28s (watermark 30 - overlap 2); a segment
        // ending at 29.5s duplicates the first window's output.
        let (scheduler, _, _) = scheduler_over(
            vec![
                vec![seg(0.0, 30.0, "kept one")],
                vec![seg(0.0, 1.5, "dup"), seg(2.0, 20.0, "kept two")],
            ],
            60.0,
            0,
        );
        scheduler.step();
        scheduler.step();
        let texts: Vec<String> = scheduler
            .track()
            .snapshot()
            .iter()
            .map(|s| s.text.clone())
            .collect();
        assert_eq!(texts, vec!["kept one", "kept two"]);
    }

    #[test]
    fn identical_consecutive_segments_collapse_to_one_repeat() {
        let window: Vec<RecognizedSegment> = (0..6)
            .map(|i| seg(f64::from(i) * 4.0, f64::from(i) * 4.0 + 4.0, "silence"))
            .collect();
        let (scheduler, _, _) = scheduler_over(vec![window], 30.0, 0);
        scheduler.step();
        assert_eq!(scheduler.track().len(), 2);
    }

    #[test]
    fn empty_and_whitespace_segments_are_dropped() {
        let (scheduler, _, _) = scheduler_over(
            vec![vec![seg(0.0, 2.0, "   "), seg(3.0, 6.0, "real text")]],
            30.0,
            0,
        );
        scheduler.step();
        assert_eq!(scheduler.track().len(), 1);
    }

    #[test]
    fn short_tail_window_completes() {
        // 34s media: second window advances 34-28-2 = 4s < 30% of 30s.
        let (scheduler, _, _) = scheduler_over(
            vec![vec![seg(0.0, 30.0, "body")], vec![seg(2.0, 6.0, "tail")]],
            34.0,
            0,
        );
        assert_eq!(scheduler.step(), StepOutcome::Advanced);
        assert_eq!(scheduler.step(), StepOutcome::Complete);
        assert_eq!(scheduler.state(), SchedulerState::Complete);
    }

    #[test]
    fn three_consecutive_failures_stall_without_panicking() {
        // Retries above the failure limit keep the watermark pinned to one
        // window, so the failures really are "without progress".
        let config = ChunkConfig {
            retries_per_window: 5,
            ..ChunkConfig::default()
        };
        let (scheduler, _, _) = scheduler_with(vec![], 90.0, 99, config);
        assert_eq!(scheduler.step(), StepOutcome::Failed);
        assert_eq!(scheduler.step(), StepOutcome::Failed);
        assert_eq!(scheduler.step(), StepOutcome::Stalled);
        assert_eq!(scheduler.state(), SchedulerState::Stalled);
        // wait_until_ready must not hang on a stalled scheduler.
        assert!(!scheduler.wait_until_ready(50.0, Duration::from_millis(200)));
    }

    #[test]
    fn skipping_a_window_breaks_the_failure_streak() {
        // Two failures skip window zero; that skip is progress, so a third
        // failure on the next window must not count as the third in a row.
        let (scheduler, _, _) =
            scheduler_over(vec![vec![seg(2.0, 30.0, "after the rough patch")]], 90.0, 3);
        assert_eq!(scheduler.step(), StepOutcome::Failed);
        assert_eq!(scheduler.step(), StepOutcome::Failed);
        assert!(scheduler.watermark_seconds() >= 29.9);
        assert_eq!(scheduler.step(), StepOutcome::Failed);
        assert_eq!(scheduler.state(), SchedulerState::Running);
        assert_eq!(scheduler.step(), StepOutcome::Advanced);
        assert_eq!(scheduler.track().snapshot()[0].text, "after the rough patch");
    }

    #[test]
    fn failed_window_is_skipped_after_retries() {
        let (scheduler, _, _) = scheduler_over(vec![vec![seg(2.0, 30.0, "after skip")]], 90.0, 2);
        assert_eq!(scheduler.step(), StepOutcome::Failed);
        assert_eq!(scheduler.step(), StepOutcome::Failed);
        // Two attempts on window zero: skipped, watermark moved past it.
        assert!(scheduler.watermark_seconds() >= 29.9);
        assert_eq!(scheduler.step(), StepOutcome::Advanced);
        assert_eq!(scheduler.state(), SchedulerState::Running);
    }

    #[test]
    fn concurrent_ensure_calls_share_the_work() {
        let script: Vec<Vec<RecognizedSegment>> = (0..4)
            .map(|i| vec![seg(2.0, 30.0, &format!("window {i}"))])
            .collect();
        let (scheduler, calls, starts) = scheduler_over(script, 90.0, 0);
        let a = Arc::clone(&scheduler);
        let b = Arc::clone(&scheduler);
        let ta = thread::spawn(move || a.ensure_transcribed_up_to(85.0));
        let tb = thread::spawn(move || b.ensure_transcribed_up_to(85.0));
        ta.join().unwrap();
        tb.join().unwrap();
        // Each window is extracted and recognized at most once, no matter
        // how many callers race.
        let starts = starts.lock().unwrap();
        let mut sorted = starts.clone();
        sorted.sort_by(f64::total_cmp);
        sorted.dedup();
        assert_eq!(sorted.len(), starts.len(), "a window was extracted twice");
        assert!(calls.load(Ordering::SeqCst) <= 4);
        assert!(scheduler.has_subtitles_ready_for(85.0));
    }

    #[test]
    fn background_worker_runs_to_completion() {
        let (scheduler, _, _) = scheduler_over(
            vec![vec![seg(0.0, 30.0, "a")], vec![seg(2.0, 30.0, "b")]],
            58.0,
            0,
        );
        let handle = scheduler.start_background().unwrap();
        assert!(scheduler.wait_until_ready(55.0, Duration::from_secs(5)));
        handle.join().unwrap();
        assert!(scheduler.is_complete());
    }

    #[test]
    fn background_worker_paces_against_the_playhead() {
        let cancel = CancelToken::new();
        let scheduler = Arc::new(ChunkScheduler::new(
            Box::new(ScriptedRecognizer {
                script: vec![],
                calls: Arc::new(AtomicU64::new(0)),
                fail_times: 0,
            }),
            Box::new(SyntheticAudio::over(1e9)),
            Arc::new(SubtitleTrack::new()),
            ChunkConfig {
                chunk_seconds: 5.0,
                overlap_seconds: 1.0,
                buffer_ahead_seconds: 10.0,
                ..ChunkConfig::default()
            },
            cancel.clone(),
        ));
        let handle = scheduler.start_background().unwrap();

        // The worker builds the initial lead over playhead zero, then idles
        // instead of racing through the whole stream.
        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.watermark_seconds() < 10.0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        let mut settled = scheduler.watermark_seconds();
        loop {
            thread::sleep(Duration::from_millis(100));
            let mark = scheduler.watermark_seconds();
            if mark == settled {
                break;
            }
            settled = mark;
            assert!(settled < 60.0, "worker ran far past the lead: {settled}");
        }
        assert!(settled >= 10.0 && settled < 60.0, "settled at {settled}");

        // A later playhead wakes it back up.
        scheduler.note_playhead(settled + 20.0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.watermark_seconds() < settled + 20.0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(scheduler.watermark_seconds() >= settled + 20.0);

        cancel.cancel();
        handle.join().unwrap();
    }

    #[test]
    fn cancellation_unblocks_waiters() {
        let cancel = CancelToken::new();
        let scheduler = Arc::new(ChunkScheduler::new(
            Box::new(ScriptedRecognizer {
                script: vec![],
                calls: Arc::new(AtomicU64::new(0)),
                fail_times: 0,
            }),
            Box::new(SyntheticAudio::over(1e9)),
            Arc::new(SubtitleTrack::new()),
            ChunkConfig::default(),
            cancel.clone(),
        ));
        cancel.cancel();
        assert_eq!(scheduler.step(), StepOutcome::Cancelled);
        assert!(!scheduler.wait_until_ready(10.0, Duration::from_secs(5)));
    }

    #[test]
    fn prompt_tail_keeps_trailing_characters() {
        let mut tail = String::new();
        push_prompt_tail(&mut tail, "hello", 200);
        push_prompt_tail(&mut tail, "world", 200);
        assert_eq!(tail, "hello world");
        let long = "x".repeat(300);
        push_prompt_tail(&mut tail, &long, 200);
        assert_eq!(tail.chars().count(), 200);
        assert!(tail.chars().all(|c| c == 'x'));
    }
}
