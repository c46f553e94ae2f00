//! Pure pixel-to-text rendering: RGBA buffer in, `TextFrame` out.
//!
//! Deterministic given the same inputs and options. The playback pipeline
//! treats this as an opaque render function; nothing here touches the
//! terminal or the decoder.

use crate::text_frame::TextFrame;

const BT709_R_WEIGHT: u32 = 2126;
const BT709_G_WEIGHT: u32 = 7152;
const BT709_B_WEIGHT: u32 = 722;
const BT709_WEIGHT_SUM: u32 = 10_000;

/// Dark-to-light character ramp. Index 0 is emptiest.
pub const DEFAULT_RAMP: &str = " .:-=+*#%@";

#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub cols: usize,
    pub rows: usize,
    pub ramp: Vec<char>,
    pub color: bool,
}

impl RenderOptions {
    pub fn new(cols: usize, rows: usize) -> Self {
        Self {
            cols,
            rows,
            ramp: DEFAULT_RAMP.chars().collect(),
            color: false,
        }
    }

    pub fn with_color(mut self, color: bool) -> Self {
        self.color = color;
        self
    }
}

pub fn bt709_luma_u8(r: u8, g: u8, b: u8) -> u8 {
    let weighted = BT709_R_WEIGHT * u32::from(r)
        + BT709_G_WEIGHT * u32::from(g)
        + BT709_B_WEIGHT * u32::from(b);
    ((weighted + (BT709_WEIGHT_SUM / 2)) / BT709_WEIGHT_SUM) as u8
}

pub fn quantize_luma_to_index(y8: u8, ramp_len: usize) -> usize {
    if ramp_len <= 1 {
        return 0;
    }
    let n = ramp_len as u32;
    ((u32::from(y8) * (n - 1) + 127) / 255) as usize
}

/// Map an RGB triple onto the xterm 256-color cube (indices 16..=231).
pub fn rgb_to_ansi256(r: u8, g: u8, b: u8) -> u8 {
    let quant = |v: u8| -> u8 {
        if v < 48 {
            0
        } else if v < 115 {
            1
        } else {
            ((u16::from(v) - 35) / 40) as u8
        }
    };
    16 + 36 * quant(r) + 6 * quant(g) + quant(b)
}

/// Render an RGBA pixel buffer into a text frame of `opts.cols` x `opts.rows`
/// cells. Each cell averages the pixel block it covers; brightness picks the
/// ramp glyph, and in color mode the averaged RGB picks a 256-color
/// foreground marker (reset appended per line so rows are self-contained).
pub fn render(pixels: &[u8], width: u32, height: u32, opts: &RenderOptions) -> TextFrame {
    let w = width as usize;
    let h = height as usize;
    let cols = opts.cols.max(1);
    let rows = opts.rows.max(1);
    let ramp_len = opts.ramp.len();

    let mut lines = Vec::with_capacity(rows);
    for row in 0..rows {
        let y_start = row * h / rows;
        let y_end = (((row + 1) * h) / rows).max(y_start + 1).min(h.max(1));
        let mut line = String::with_capacity(cols);
        let mut styled = false;
        for col in 0..cols {
            let x_start = col * w / cols;
            let x_end = (((col + 1) * w) / cols).max(x_start + 1).min(w.max(1));

            let (mut r_sum, mut g_sum, mut b_sum, mut count) = (0u32, 0u32, 0u32, 0u32);
            for y in y_start..y_end {
                for x in x_start..x_end {
                    let idx = (y * w + x) * 4;
                    if idx + 2 < pixels.len() {
                        r_sum += u32::from(pixels[idx]);
                        g_sum += u32::from(pixels[idx + 1]);
                        b_sum += u32::from(pixels[idx + 2]);
                        count += 1;
                    }
                }
            }
            let (r, g, b) = if count > 0 {
                (
                    (r_sum / count) as u8,
                    (g_sum / count) as u8,
                    (b_sum / count) as u8,
                )
            } else {
                (0, 0, 0)
            };

            let luma = bt709_luma_u8(r, g, b);
            let glyph = opts.ramp[quantize_luma_to_index(luma, ramp_len)];
            if opts.color && glyph != ' ' {
                line.push_str(&format!("\x1b[38;5;{}m", rgb_to_ansi256(r, g, b)));
                styled = true;
            }
            line.push(glyph);
        }
        if styled {
            line.push_str("\x1b[0m");
        }
        lines.push(line);
    }

    TextFrame::from_lines(lines, cols, rows).with_source_dimensions(width, height)
}
