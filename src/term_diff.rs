//! Minimal-update terminal presenter.
//!
//! Each frame is compared line-by-line against the previously presented one
//! and only changed rows are rewritten in place. When most of the screen
//! changed anyway, a full clear-and-repaint is cheaper than many cursor
//! moves. All output for one frame is bracketed in a synchronized update so
//! terminals that support it paint atomically.

use std::io::{self, Write};

use crossterm::cursor::MoveTo;
use crossterm::queue;
use crossterm::style::Print;
use crossterm::terminal::{BeginSynchronizedUpdate, Clear, ClearType, EndSynchronizedUpdate};

use crate::text_frame::{visible_width, TextFrame};

/// Fraction of rows (as a percentage) above which a diff degenerates into a
/// full repaint.
const FULL_REPAINT_PERCENT: usize = 60;

/// Rows reserved under the frame for overlay text (status line, captions).
pub const OVERLAY_ROWS: usize = 2;

#[derive(Debug, Default)]
pub struct TermDiff {
    prev_lines: Vec<String>,
    prev_overlays: [String; OVERLAY_ROWS],
    prev_width: usize,
    force_full: bool,
}

impl TermDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `present` call repaints everything, regardless of diff.
    /// Required after resize or anything else that invalidated the screen.
    pub fn force_full_repaint(&mut self) {
        self.force_full = true;
    }

    /// Write the patch that turns the previously presented frame into
    /// `frame`, with up to [`OVERLAY_ROWS`] overlay lines below it, then
    /// flush.
    pub fn present<W: Write>(
        &mut self,
        out: &mut W,
        frame: &TextFrame,
        overlays: &[String],
    ) -> io::Result<()> {
        let lines = frame.lines();
        let full = self.force_full
            || self.prev_lines.len() != lines.len()
            || self.prev_width != frame.width()
            || changed_rows(&self.prev_lines, lines) * 100 > lines.len() * FULL_REPAINT_PERCENT;

        queue!(out, BeginSynchronizedUpdate)?;
        if full {
            queue!(out, Clear(ClearType::All))?;
            for (row, line) in lines.iter().enumerate() {
                queue!(out, MoveTo(0, row as u16), Print(line))?;
            }
            self.prev_overlays = Default::default();
        } else {
            for (row, line) in lines.iter().enumerate() {
                if self.prev_lines[row] != *line {
                    let padded = pad_over(line, &self.prev_lines[row]);
                    queue!(out, MoveTo(0, row as u16), Print(padded))?;
                }
            }
        }
        self.present_overlays(out, overlays, lines.len())?;
        queue!(out, EndSynchronizedUpdate)?;
        out.flush()?;

        self.prev_lines = lines.to_vec();
        self.prev_width = frame.width();
        self.force_full = false;
        Ok(())
    }

    fn present_overlays<W: Write>(
        &mut self,
        out: &mut W,
        overlays: &[String],
        first_row: usize,
    ) -> io::Result<()> {
        for slot in 0..OVERLAY_ROWS {
            let line = overlays.get(slot).map(String::as_str).unwrap_or("");
            if self.prev_overlays[slot] == line {
                continue;
            }
            let padded = pad_over(line, &self.prev_overlays[slot]);
            queue!(out, MoveTo(0, (first_row + slot) as u16), Print(padded))?;
            self.prev_overlays[slot] = line.to_owned();
        }
        Ok(())
    }
}

fn changed_rows(prev: &[String], next: &[String]) -> usize {
    prev.iter().zip(next).filter(|(a, b)| a != b).count()
}

/// Pad `line` with spaces until it covers at least the visible width of the
/// row it replaces, so stale trailing cells are erased without a clear.
/// Widths are measured with ANSI escapes stripped.
fn pad_over(line: &str, previous: &str) -> String {
    let want = visible_width(previous);
    let have = visible_width(line);
    if have >= want {
        return line.to_owned();
    }
    let mut padded = String::with_capacity(line.len() + (want - have));
    padded.push_str(line);
    for _ in have..want {
        padded.push(' ');
    }
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNC_BEGIN: &str = "\x1b[?2026h";
    const SYNC_END: &str = "\x1b[?2026l";
    const CLEAR_ALL: &str = "\x1b[2J";

    fn frame(lines: &[&str]) -> TextFrame {
        let width = lines.iter().map(|l| visible_width(l)).max().unwrap_or(0);
        TextFrame::from_lines(lines, width, lines.len())
    }

    fn move_to(row: u16) -> String {
        // crossterm MoveTo is 1-based in the emitted sequence.
        format!("\x1b[{};1H", row + 1)
    }

    fn present(diff: &mut TermDiff, f: &TextFrame, overlays: &[String]) -> String {
        let mut out = Vec::new();
        diff.present(&mut out, f, overlays).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn first_frame_is_a_full_repaint() {
        let mut diff = TermDiff::new();
        let out = present(&mut diff, &frame(&["aa", "bb"]), &[]);
        assert!(out.contains(CLEAR_ALL));
        assert!(out.contains("aa"));
        assert!(out.contains("bb"));
        assert!(out.starts_with(SYNC_BEGIN));
        assert!(out.contains(SYNC_END));
    }

    #[test]
    fn identical_frame_emits_no_content() {
        let mut diff = TermDiff::new();
        let f = frame(&["aa", "bb", "cc", "dd", "ee"]);
        present(&mut diff, &f, &[]);
        let out = present(&mut diff, &f, &[]);
        assert!(!out.contains(CLEAR_ALL));
        assert!(!out.contains("aa"));
        assert!(!out.contains("ee"));
    }

    #[test]
    fn single_changed_row_is_patched_in_place() {
        let mut diff = TermDiff::new();
        present(&mut diff, &frame(&["aa", "bb", "cc", "dd", "ee"]), &[]);
        let out = present(&mut diff, &frame(&["aa", "bb", "XX", "dd", "ee"]), &[]);
        assert!(!out.contains(CLEAR_ALL));
        assert!(out.contains(&format!("{}XX", move_to(2))));
        assert!(!out.contains("aa"));
        assert!(!out.contains("dd"));
    }

    #[test]
    fn mostly_changed_frame_falls_back_to_full_repaint() {
        let mut diff = TermDiff::new();
        present(&mut diff, &frame(&["a", "b", "c", "d", "e"]), &[]);
        // 4 of 5 rows changed: 80% > 60%.
        let out = present(&mut diff, &frame(&["1", "2", "3", "4", "e"]), &[]);
        assert!(out.contains(CLEAR_ALL));
    }

    #[test]
    fn exactly_at_threshold_still_diffs() {
        let mut diff = TermDiff::new();
        present(&mut diff, &frame(&["a", "b", "c", "d", "e"]), &[]);
        // 3 of 5 rows changed: 60% is not above 60%.
        let out = present(&mut diff, &frame(&["1", "2", "3", "d", "e"]), &[]);
        assert!(!out.contains(CLEAR_ALL));
    }

    #[test]
    fn dimension_change_always_repaints() {
        let mut diff = TermDiff::new();
        present(&mut diff, &frame(&["aaaa", "bbbb"]), &[]);
        let out = present(&mut diff, &frame(&["aa", "bb"]), &[]);
        assert!(out.contains(CLEAR_ALL));
    }

    #[test]
    fn forced_repaint_clears_even_for_an_identical_frame() {
        let mut diff = TermDiff::new();
        let f = frame(&["aa", "bb"]);
        present(&mut diff, &f, &[]);
        diff.force_full_repaint();
        let out = present(&mut diff, &f, &[]);
        assert!(out.contains(CLEAR_ALL));
    }

    #[test]
    fn shorter_row_is_padded_to_erase_stale_cells() {
        let mut diff = TermDiff::new();
        let wide = TextFrame::from_lines(["long line here", "bb"], 14, 2);
        let narrow = TextFrame::from_lines(["ok", "bb"], 14, 2);
        present(&mut diff, &wide, &[]);
        let out = present(&mut diff, &narrow, &[]);
        assert!(!out.contains(CLEAR_ALL));
        assert!(out.contains(&format!("{}ok{}", move_to(0), " ".repeat(12))));
    }

    #[test]
    fn overlays_render_below_the_frame_and_are_padded_on_change() {
        let mut diff = TermDiff::new();
        let f = frame(&["aa", "bb"]);
        let out = present(&mut diff, &f, &["status: playing".to_owned()]);
        assert!(out.contains(&format!("{}status: playing", move_to(2))));

        let out = present(&mut diff, &f, &["paused".to_owned()]);
        assert!(out.contains(&format!("{}paused{}", move_to(2), " ".repeat(9))));

        // Dropping the overlay blanks the row.
        let out = present(&mut diff, &f, &[]);
        assert!(out.contains(&format!("{}{}", move_to(2), " ".repeat(6))));
    }

    #[test]
    fn overlay_padding_measures_visible_width_of_styled_text() {
        let mut diff = TermDiff::new();
        let f = frame(&["aa"]);
        present(&mut diff, &f, &["\x1b[7m REC \x1b[0m".to_owned()]);
        // Styled overlay occupies 5 cells; the replacement pads to match.
        let out = present(&mut diff, &f, &["ok".to_owned()]);
        assert!(out.contains(&format!("{}ok{}", move_to(1), " ".repeat(3))));
    }

    /// Minimal terminal model: applies cursor moves, clears, and printable
    /// text; style sequences change no cells.
    struct ModelTerminal {
        cells: Vec<Vec<char>>,
        row: usize,
        col: usize,
    }

    impl ModelTerminal {
        fn new(cols: usize, rows: usize) -> Self {
            Self {
                cells: vec![vec![' '; cols]; rows],
                row: 0,
                col: 0,
            }
        }

        fn apply(&mut self, output: &str) {
            let mut chars = output.chars().peekable();
            while let Some(ch) = chars.next() {
                if ch != '\x1b' {
                    if self.row < self.cells.len() && self.col < self.cells[self.row].len() {
                        self.cells[self.row][self.col] = ch;
                    }
                    self.col += 1;
                    continue;
                }
                assert_eq!(chars.next(), Some('['), "only CSI sequences are emitted");
                let mut params = String::new();
                let mut terminator = ' ';
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        terminator = c;
                        break;
                    }
                    params.push(c);
                }
                match terminator {
                    'H' => {
                        let mut parts = params.split(';');
                        let row: usize = parts.next().unwrap_or("1").parse().unwrap_or(1);
                        let col: usize = parts.next().unwrap_or("1").parse().unwrap_or(1);
                        self.row = row - 1;
                        self.col = col - 1;
                    }
                    'J' => {
                        for line in &mut self.cells {
                            line.fill(' ');
                        }
                    }
                    _ => {}
                }
            }
        }

        fn line(&self, row: usize) -> String {
            self.cells[row].iter().collect::<String>().trim_end().to_owned()
        }
    }

    #[test]
    fn patch_stream_reproduces_the_frame_on_a_model_terminal() {
        let mut diff = TermDiff::new();
        let mut terminal = ModelTerminal::new(20, 8);
        let frames = [
            frame(&["hello world", "second row", "third", "fourth", "fifth"]),
            frame(&["hello there", "second row", "third", "fourth", "fifth"]),
            frame(&["hi", "second row", "third", "4", "fifth"]),
            frame(&["a", "b", "c", "d", "e"]),
        ];
        for f in &frames {
            let out = present(&mut diff, f, &["status".to_owned()]);
            terminal.apply(&out);
            for (row, expected) in f.lines().iter().enumerate() {
                assert_eq!(
                    terminal.line(row),
                    expected.trim_end(),
                    "row {row} diverged from the presented frame"
                );
            }
            assert_eq!(terminal.line(f.height()), "status");
        }
    }

    #[test]
    fn styled_patches_round_trip_ignoring_style_markers() {
        use crate::text_frame::strip_ansi;

        let mut diff = TermDiff::new();
        let mut terminal = ModelTerminal::new(12, 4);
        let styled = frame(&["\x1b[38;5;10mAB\x1b[0m", "CD"]);
        let plain = frame(&["AB", "XY"]);
        for f in [&styled, &plain] {
            let out = present(&mut diff, f, &[]);
            terminal.apply(&out);
            for (row, expected) in f.lines().iter().enumerate() {
                assert_eq!(terminal.line(row), strip_ansi(expected).trim_end());
            }
        }
    }

    #[test]
    fn second_overlay_row_is_independent() {
        let mut diff = TermDiff::new();
        let f = frame(&["aa"]);
        present(
            &mut diff,
            &f,
            &["status".to_owned(), "caption one".to_owned()],
        );
        let out = present(
            &mut diff,
            &f,
            &["status".to_owned(), "caption two".to_owned()],
        );
        assert!(!out.contains("status"));
        assert!(out.contains(&format!("{}caption two", move_to(2))));
    }
}
