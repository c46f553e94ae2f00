//! Decode-ahead playback pipeline and the interactive display loop.
//!
//! A worker thread decodes and renders frames ahead of the display, feeding a
//! bounded channel so a slow terminal backpressures the decoder instead of
//! growing a queue. The display loop paces frames against a pausable clock,
//! handles keyboard control and resize, and presents through the diff
//! renderer. Seek and resize tear the worker down and respawn it at the new
//! position; the clock survives.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal::{self, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{cursor, execute};
use thiserror::Error;

use crate::ascii::RenderOptions;
use crate::cancel::CancelToken;
use crate::decoding::{DecodeRequest, FfmpegDecoder, MediaInfo, WouldBlock};
use crate::subtitles::SubtitleTrack;
use crate::term_diff::{TermDiff, OVERLAY_ROWS};
use crate::text_frame::TextFrame;
use crate::transcribe::{ChunkScheduler, SchedulerState};

const SEEK_STEP_SECONDS: f64 = 5.0;
/// Upper bound on any single blocking wait in the display loop, so input
/// and cancellation are observed promptly.
const SLICE: Duration = Duration::from_millis(50);
pub const DEFAULT_LOOKAHEAD: usize = 4;

#[derive(Debug, Error)]
pub enum PlayError {
    #[error("no frames decoded from {media}; not a playable video?")]
    NoFrames { media: String },
    #[error("terminal I/O failed: {0}")]
    Terminal(#[from] io::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct PlayerConfig {
    pub source: String,
    /// Override the probed frame rate.
    pub fps: Option<f64>,
    pub speed: f64,
    pub start_seconds: f64,
    /// `None` plays once, `Some(0)` loops forever, `Some(n)` replays n times.
    pub loop_count: Option<u32>,
    pub color: bool,
    pub lookahead: usize,
}

/// Caption state for a session: a track to read cues from, and optionally
/// the live scheduler that is still filling it.
pub struct Captions {
    pub track: Arc<SubtitleTrack>,
    pub scheduler: Option<Arc<ChunkScheduler>>,
}

/// Wall-clock playback position with pause and seek. Pausing freezes the
/// position; resuming re-anchors so paused time never counts.
pub struct PlaybackClock {
    anchor: Instant,
    anchor_seconds: f64,
    speed: f64,
    playing: bool,
}

impl PlaybackClock {
    pub fn new(start_seconds: f64, speed: f64) -> Self {
        Self {
            anchor: Instant::now(),
            anchor_seconds: start_seconds.max(0.0),
            speed: if speed > 0.0 { speed } else { 1.0 },
            playing: true,
        }
    }

    pub fn position(&self) -> f64 {
        if self.playing {
            self.anchor_seconds + self.anchor.elapsed().as_secs_f64() * self.speed
        } else {
            self.anchor_seconds
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    pub fn toggle(&mut self) {
        if self.playing {
            self.anchor_seconds = self.position();
            self.playing = false;
        } else {
            self.anchor = Instant::now();
            self.playing = true;
        }
    }

    /// Jump to `seconds` (clamped to zero) without changing play state.
    pub fn seek_to(&mut self, seconds: f64) {
        self.anchor_seconds = seconds.max(0.0);
        self.anchor = Instant::now();
    }

    pub fn seek_relative(&mut self, delta_seconds: f64) -> f64 {
        let target = (self.position() + delta_seconds).max(0.0);
        self.seek_to(target);
        target
    }
}

/// Character cell grid for a terminal size, reserving the overlay rows and
/// compensating for cells being roughly twice as tall as wide.
fn fit_grid(term_cols: u16, term_rows: u16, info: &MediaInfo) -> (usize, usize) {
    let max_cols = (term_cols as usize).max(2);
    let max_rows = (term_rows as usize).saturating_sub(OVERLAY_ROWS).max(1);
    let aspect = if info.height > 0 {
        f64::from(info.width) / f64::from(info.height)
    } else {
        16.0 / 9.0
    };

    let mut cols = max_cols;
    let mut rows = ((cols as f64 / aspect) / 2.0).round() as usize;
    if rows > max_rows {
        rows = max_rows;
        cols = (rows as f64 * aspect * 2.0).round() as usize;
        cols = cols.clamp(1, max_cols);
    }
    (cols.max(1), rows.max(1))
}

/// Background decode-and-render worker. Frames arrive already rendered; the
/// bounded channel is the lookahead budget. Dropping the worker unblocks and
/// joins the thread.
struct FrameWorker {
    receiver: Option<mpsc::Receiver<TextFrame>>,
    handle: Option<JoinHandle<()>>,
    stop: CancelToken,
}

impl FrameWorker {
    fn spawn(request: DecodeRequest, options: RenderOptions, lookahead: usize) -> Result<Self> {
        let source_width = request.width;
        let source_height = request.height;
        Self::spawn_with(lookahead, move |stop, frames| {
            let decoder = match FfmpegDecoder::spawn(&request, 2) {
                Ok(decoder) => decoder,
                Err(error) => {
                    eprintln!("[tapedeck] decoder failed to start: {error:#}");
                    return;
                }
            };
            loop {
                if stop.is_cancelled() {
                    break;
                }
                match decoder.next_frame_timeout(SLICE) {
                    Ok(Some(pixels)) => {
                        let frame =
                            crate::ascii::render(&pixels, source_width, source_height, &options);
                        if frames.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(WouldBlock) => continue,
                }
            }
            let cancelled = stop.is_cancelled();
            if let Err(error) = decoder.finish() {
                if !cancelled {
                    eprintln!("[tapedeck] decoder error: {error:#}");
                }
            }
        })
    }

    /// The channel capacity is the lookahead budget: a producer that outruns
    /// the display parks in `send` until the display frees a slot.
    fn spawn_with<F>(lookahead: usize, produce: F) -> Result<Self>
    where
        F: FnOnce(CancelToken, mpsc::SyncSender<TextFrame>) + Send + 'static,
    {
        let (sender, receiver) = mpsc::sync_channel::<TextFrame>(lookahead.max(1));
        let stop = CancelToken::new();
        let worker_stop = stop.clone();
        let handle = thread::Builder::new()
            .name("tapedeck-frames".to_owned())
            .spawn(move || produce(worker_stop, sender))
            .context("failed to spawn frame worker thread")?;

        Ok(Self {
            receiver: Some(receiver),
            handle: Some(handle),
            stop,
        })
    }

    fn next(&self, timeout: Duration) -> Result<Option<TextFrame>, WouldBlock> {
        let Some(receiver) = self.receiver.as_ref() else {
            return Ok(None);
        };
        match receiver.recv_timeout(timeout) {
            Ok(frame) => Ok(Some(frame)),
            Err(mpsc::RecvTimeoutError::Disconnected) => Ok(None),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(WouldBlock),
        }
    }
}

impl Drop for FrameWorker {
    fn drop(&mut self) {
        self.stop.cancel();
        // Dropping the receiver unblocks a worker parked on a full channel.
        drop(self.receiver.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Raw mode and alternate screen, restored on drop no matter how the
/// session ends.
struct TerminalGuard;

impl TerminalGuard {
    fn enter() -> io::Result<Self> {
        terminal::enable_raw_mode()?;
        execute!(io::stdout(), EnterAlternateScreen, cursor::Hide)?;
        Ok(Self)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        let _ = execute!(io::stdout(), cursor::Show, LeaveAlternateScreen);
        let _ = terminal::disable_raw_mode();
    }
}

enum Control {
    Continue,
    Quit,
    Seek(f64),
    Resize(u16, u16),
    TogglePause,
}

fn read_control(timeout: Duration) -> io::Result<Control> {
    if !event::poll(timeout)? {
        return Ok(Control::Continue);
    }
    match event::read()? {
        Event::Key(key) if key.kind != KeyEventKind::Release => match key.code {
            KeyCode::Char('q') | KeyCode::Esc => Ok(Control::Quit),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => {
                Ok(Control::Quit)
            }
            KeyCode::Char(' ') => Ok(Control::TogglePause),
            KeyCode::Left => Ok(Control::Seek(-SEEK_STEP_SECONDS)),
            KeyCode::Right => Ok(Control::Seek(SEEK_STEP_SECONDS)),
            _ => Ok(Control::Continue),
        },
        Event::Resize(cols, rows) => Ok(Control::Resize(cols, rows)),
        _ => Ok(Control::Continue),
    }
}

fn format_position(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    format!("{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}

fn status_line(
    clock: &PlaybackClock,
    info: &MediaInfo,
    speed: f64,
    loops_completed: u32,
    caption_note: &str,
) -> String {
    let mut line = format!(
        "{} {} / {}",
        if clock.is_playing() { ">" } else { "||" },
        format_position(clock.position()),
        format_position(info.duration_seconds),
    );
    if (speed - 1.0).abs() > f64::EPSILON {
        line.push_str(&format!("  x{speed:.2}"));
    }
    if loops_completed > 0 {
        line.push_str(&format!("  loop {loops_completed}"));
    }
    if !caption_note.is_empty() {
        line.push_str("  ");
        line.push_str(caption_note);
    }
    line
}

struct Session<'a> {
    config: &'a PlayerConfig,
    info: &'a MediaInfo,
    fps: f64,
    captions: Option<Captions>,
    cancel: CancelToken,
}

impl Session<'_> {
    fn spawn_worker(&self, start_seconds: f64, grid: (usize, usize)) -> Result<FrameWorker> {
        let request = DecodeRequest {
            source: self.config.source.clone(),
            start_seconds,
            fps: self.fps,
            width: grid.0 as u32,
            height: grid.1 as u32,
        };
        let options = RenderOptions::new(grid.0, grid.1).with_color(self.config.color);
        FrameWorker::spawn(request, options, self.config.lookahead)
    }

    /// Seek: move the clock, respawn the worker at the target, and make the
    /// next present repaint from scratch instead of diffing against stale
    /// content.
    fn seek(
        &self,
        clock: &mut PlaybackClock,
        delta_seconds: f64,
        grid: (usize, usize),
        diff: &mut TermDiff,
    ) -> Result<FrameWorker> {
        let target = clock.seek_relative(delta_seconds);
        diff.force_full_repaint();
        self.spawn_worker(target, grid)
    }

    /// Begin another pass from the configured start offset.
    fn restart(
        &self,
        clock: &mut PlaybackClock,
        grid: (usize, usize),
        diff: &mut TermDiff,
    ) -> Result<FrameWorker> {
        clock.seek_to(self.config.start_seconds);
        diff.force_full_repaint();
        self.spawn_worker(self.config.start_seconds, grid)
    }

    fn overlays(&self, clock: &PlaybackClock, loops_completed: u32, note: &str) -> Vec<String> {
        let caption = self
            .captions
            .as_ref()
            .and_then(|c| c.track.text_at(clock.position()))
            .unwrap_or_default();
        vec![
            status_line(clock, self.info, self.config.speed, loops_completed, note),
            caption,
        ]
    }

    /// True while the live scheduler is behind the playhead and still able
    /// to catch up. Playback holds while this returns true; a stalled or
    /// finished scheduler never holds playback.
    fn captions_buffering(&self, position: f64) -> bool {
        let Some(captions) = self.captions.as_ref() else {
            return false;
        };
        let Some(scheduler) = captions.scheduler.as_ref() else {
            return false;
        };
        // The background worker paces itself buffer_ahead_seconds in front
        // of the last reported playhead.
        scheduler.note_playhead(position);
        if scheduler.has_subtitles_ready_for(position) {
            return false;
        }
        match scheduler.state() {
            SchedulerState::Stalled | SchedulerState::Complete => false,
            _ => {
                scheduler.wait_until_ready(position, SLICE);
                !scheduler.has_subtitles_ready_for(position)
            }
        }
    }

    fn caption_note(&self, position: f64) -> &'static str {
        let stalled = self
            .captions
            .as_ref()
            .and_then(|c| c.scheduler.as_ref())
            .is_some_and(|s| {
                s.state() == SchedulerState::Stalled && !s.has_subtitles_ready_for(position)
            });
        if stalled {
            "captions stalled"
        } else {
            ""
        }
    }
}

/// Whether another pass starts at end of media: `None` plays once,
/// `Some(0)` loops forever, `Some(n)` allows n restarts.
fn should_loop(loop_count: Option<u32>, loops_completed: u32) -> bool {
    match loop_count {
        None => false,
        Some(0) => true,
        Some(limit) => loops_completed < limit,
    }
}

/// Keep the clock consistent with the two independent hold reasons.
fn sync_clock(clock: &mut PlaybackClock, user_paused: bool, buffering: bool) {
    let should_play = !user_paused && !buffering;
    if clock.is_playing() != should_play {
        clock.toggle();
    }
}

pub fn run_player(
    info: &MediaInfo,
    config: &PlayerConfig,
    captions: Option<Captions>,
    cancel: CancelToken,
) -> Result<(), PlayError> {
    let fps = config
        .fps
        .unwrap_or(info.frame_rate)
        .max(1.0)
        .min(240.0);
    eprintln!(
        "[tapedeck] play: {} ({}x{} @ {:.2}fps, {:.1}s)",
        config.source, info.width, info.height, fps, info.duration_seconds
    );
    eprintln!("[tapedeck] controls: Space play/pause, Left/Right seek 5s, q quit");

    let session = Session {
        config,
        info,
        fps,
        captions,
        cancel,
    };

    let guard = TerminalGuard::enter()?;
    let (term_cols, term_rows) = terminal::size()?;
    let mut grid = fit_grid(term_cols, term_rows, info);
    let mut clock = PlaybackClock::new(config.start_seconds, config.speed);
    let mut worker = session.spawn_worker(clock.position(), grid)?;
    let mut diff = TermDiff::new();
    let mut stdout = io::BufWriter::new(io::stdout());

    let frame_interval = Duration::from_secs_f64(1.0 / (fps * config.speed));
    let mut next_frame_at = Instant::now();
    let mut current: Option<TextFrame> = None;
    let mut first_frame_seen = false;
    let mut loops_completed = 0u32;
    let mut user_paused = false;
    let mut buffering = false;
    // Set after a seek while paused so one frame is pulled to refresh the
    // screen without resuming.
    let mut paint_one = false;

    loop {
        if session.cancel.is_cancelled() {
            break;
        }

        match read_control(Duration::ZERO)? {
            Control::Quit => break,
            Control::TogglePause => {
                user_paused = !user_paused;
                sync_clock(&mut clock, user_paused, buffering);
                if clock.is_playing() {
                    next_frame_at = Instant::now();
                }
            }
            Control::Seek(delta) => {
                worker = session.seek(&mut clock, delta, grid, &mut diff)?;
                next_frame_at = Instant::now();
                paint_one = user_paused;
                current = None;
            }
            Control::Resize(cols, rows) => {
                grid = fit_grid(cols, rows, info);
                worker = session.spawn_worker(clock.position(), grid)?;
                diff.force_full_repaint();
                next_frame_at = Instant::now();
                paint_one = user_paused;
                current = None;
            }
            Control::Continue => {}
        }

        if user_paused && !paint_one {
            if let Some(frame) = &current {
                let overlays = session.overlays(&clock, loops_completed, "");
                diff.present(&mut stdout, frame, &overlays)?;
            }
            thread::sleep(SLICE);
            continue;
        }

        if clock.is_playing() {
            let now = Instant::now();
            if now < next_frame_at {
                let wait = (next_frame_at - now).min(SLICE);
                thread::sleep(wait);
                continue;
            }
        }

        // Hold playback (clock included) while live captions lag behind.
        let now_buffering = !paint_one && session.captions_buffering(clock.position());
        if now_buffering != buffering {
            buffering = now_buffering;
            sync_clock(&mut clock, user_paused, buffering);
            if clock.is_playing() {
                next_frame_at = Instant::now();
            }
        }
        if buffering {
            if let Some(frame) = &current {
                let overlays = session.overlays(&clock, loops_completed, "buffering captions");
                diff.present(&mut stdout, frame, &overlays)?;
            }
            continue;
        }

        match worker.next(SLICE) {
            Ok(Some(frame)) => {
                let note = session.caption_note(clock.position());
                let overlays = session.overlays(&clock, loops_completed, note);
                diff.present(&mut stdout, &frame, &overlays)?;
                current = Some(frame);
                first_frame_seen = true;
                paint_one = false;
                next_frame_at += frame_interval;
                // A long stall (pause in raw decode, swap) should not cause
                // a burst of catch-up frames.
                let now = Instant::now();
                if next_frame_at + frame_interval < now {
                    next_frame_at = now;
                }
            }
            Ok(None) => {
                if !first_frame_seen {
                    return Err(PlayError::NoFrames {
                        media: config.source.clone(),
                    });
                }
                if should_loop(config.loop_count, loops_completed) {
                    loops_completed += 1;
                    worker = session.restart(&mut clock, grid, &mut diff)?;
                    next_frame_at = Instant::now();
                } else {
                    break;
                }
            }
            Err(WouldBlock) => continue,
        }
    }

    drop(worker);
    drop(guard);
    eprintln!(
        "[tapedeck] play: stopped at {} ({} loop(s))",
        format_position(clock.position()),
        loops_completed
    );
    Ok(())
}
