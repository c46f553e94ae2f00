use std::borrow::Cow;

/// A rendered text buffer: ordered lines of characters, optionally carrying
/// embedded ANSI style markers, plus the pixel dimensions it was derived from.
///
/// Produced once by the render worker, consumed once by the display loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextFrame {
    width: usize,
    height: usize,
    lines: Vec<String>,
    pub source_width: u32,
    pub source_height: u32,
}

impl TextFrame {
    pub fn blank(width: usize, height: usize) -> Self {
        let line = " ".repeat(width);
        Self {
            width,
            height,
            lines: vec![line; height],
            source_width: 0,
            source_height: 0,
        }
    }

    pub fn from_lines<I>(lines: I, width: usize, height: usize) -> Self
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let normalized = normalize_lines(lines, width, height);
        Self {
            width,
            height,
            lines: normalized,
            source_width: 0,
            source_height: 0,
        }
    }

    pub fn with_source_dimensions(mut self, width: u32, height: u32) -> Self {
        self.source_width = width;
        self.source_height = height;
        self
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn to_text(&self) -> String {
        if self.lines.is_empty() {
            return String::new();
        }
        let mut value = self.lines.join("\n");
        value.push('\n');
        value
    }
}

/// Number of terminal cells a string occupies, ignoring embedded ANSI escape
/// sequences. Padding math in the diff renderer depends on this, not on byte
/// or char length.
pub fn visible_width(line: &str) -> usize {
    let mut width = 0usize;
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            // CSI sequence: ESC '[' params, terminated by a byte in 0x40..=0x7e.
            if chars.next() == Some('[') {
                for term in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&term) {
                        break;
                    }
                }
            }
            continue;
        }
        width += 1;
    }
    width
}

/// Strip ANSI escape sequences, leaving only visible characters.
pub fn strip_ansi(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        if ch == '\x1b' {
            if chars.next() == Some('[') {
                for term in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&term) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(ch);
    }
    out
}

fn normalize_lines<I>(lines: I, width: usize, height: usize) -> Vec<String>
where
    I: IntoIterator,
    I::Item: AsRef<str>,
{
    let mut normalized = lines
        .into_iter()
        .take(height)
        .map(|line| normalize_line(line.as_ref(), width))
        .collect::<Vec<_>>();

    if normalized.len() < height {
        normalized.extend(std::iter::repeat(" ".repeat(width)).take(height - normalized.len()));
    }

    normalized
}

fn normalize_line(line: &str, width: usize) -> String {
    let expanded = if line.contains('\t') {
        Cow::Owned(line.replace('\t', "    "))
    } else {
        Cow::Borrowed(line)
    };

    let visible = visible_width(&expanded);
    if visible >= width {
        if expanded.contains('\x1b') {
            // Styled lines are produced at the correct width by the renderer;
            // never truncate mid-escape.
            return expanded.into_owned();
        }
        return expanded.chars().take(width).collect();
    }

    let mut output = expanded.into_owned();
    output.push_str(&" ".repeat(width - visible));
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_normalizes_short_and_missing_lines() {
        let frame = TextFrame::from_lines(["A", "BB"], 3, 3);
        assert_eq!(
            frame.lines(),
            &vec!["A  ".to_owned(), "BB ".to_owned(), "   ".to_owned()]
        );
    }

    #[test]
    fn frame_to_text_uses_stable_newlines() {
        let frame = TextFrame::from_lines(["AB", "CD"], 2, 2);
        assert_eq!(frame.to_text(), "AB\nCD\n");
    }

    #[test]
    fn long_lines_are_truncated_to_width() {
        let frame = TextFrame::from_lines(["ABCDEF"], 4, 1);
        assert_eq!(frame.lines(), &vec!["ABCD".to_owned()]);
    }

    #[test]
    fn visible_width_ignores_style_markers() {
        assert_eq!(visible_width("abc"), 3);
        assert_eq!(visible_width("\x1b[38;5;120mab\x1b[0m"), 2);
        assert_eq!(visible_width("\x1b[0m"), 0);
    }

    #[test]
    fn styled_lines_pad_to_visible_width() {
        let frame = TextFrame::from_lines(["\x1b[31mX\x1b[0m"], 3, 1);
        assert_eq!(visible_width(&frame.lines()[0]), 3);
    }

    #[test]
    fn strip_ansi_leaves_plain_text() {
        assert_eq!(strip_ansi("\x1b[38;5;9mhi\x1b[0m there"), "hi there");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn tabs_expand_before_measuring() {
        let frame = TextFrame::from_lines(["\tA"], 6, 1);
        assert_eq!(frame.lines(), &vec!["    A ".to_owned()]);
    }
}
