//! Perceptual fingerprints for near-duplicate frame detection.
//!
//! Offline/batch utility for keyframe extraction; never on the live
//! playback path. The fingerprint is a 64-bit dHash: downscale to a 9x8
//! grayscale grid and set one bit per horizontally-adjacent comparison.

use std::collections::VecDeque;

use image::imageops::FilterType;
use image::RgbaImage;

const GRID_COLS: u32 = 9;
const GRID_ROWS: u32 = 8;

/// Fingerprints within this many kept predecessors are compared.
const DEDUP_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Hamming distance, range [0, 64].
    pub fn distance(self, other: Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }
}

/// Compute the dHash of an RGBA frame. Roughly constant time regardless of
/// source resolution. Returns `None` when the buffer does not match the
/// stated dimensions; callers treat unhashable frames as unique (fail open).
pub fn compute(pixels: &[u8], width: u32, height: u32) -> Option<Fingerprint> {
    if width == 0 || height == 0 {
        return None;
    }
    let img = RgbaImage::from_raw(width, height, pixels.to_vec())?;
    let small = image::imageops::resize(&img, GRID_COLS, GRID_ROWS, FilterType::Triangle);

    let mut gray = [[0u8; GRID_COLS as usize]; GRID_ROWS as usize];
    for (x, y, pixel) in small.enumerate_pixels() {
        let [r, g, b, _] = pixel.0;
        gray[y as usize][x as usize] = crate::ascii::bt709_luma_u8(r, g, b);
    }

    let mut bits = 0u64;
    let mut bit = 0u32;
    for row in gray.iter() {
        for x in 0..(GRID_COLS as usize - 1) {
            if row[x] > row[x + 1] {
                bits |= 1 << bit;
            }
            bit += 1;
        }
    }
    Some(Fingerprint(bits))
}

/// Walk fingerprints in order and return the indices to keep: an entry is
/// dropped when it is within `threshold` Hamming distance of any fingerprint
/// in the rolling window of the last [`DEDUP_WINDOW`] kept entries.
/// `None` entries (frames that failed to hash) are always kept.
pub fn filter_similar(fingerprints: &[Option<Fingerprint>], threshold: u32) -> Vec<usize> {
    let mut kept = Vec::new();
    let mut window: VecDeque<Fingerprint> = VecDeque::with_capacity(DEDUP_WINDOW);

    for (index, entry) in fingerprints.iter().enumerate() {
        match entry {
            None => kept.push(index),
            Some(fp) => {
                let duplicate = window.iter().any(|prev| prev.distance(*fp) <= threshold);
                if duplicate {
                    continue;
                }
                kept.push(index);
                window.push_back(*fp);
                if window.len() > DEDUP_WINDOW {
                    window.pop_front();
                }
            }
        }
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(offset: u8) -> Vec<u8> {
        let (w, h) = (36u32, 16u32);
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for y in 0..h {
            for x in 0..w {
                let v = ((x * 7 + y * 3) as u8).wrapping_add(offset);
                data.extend_from_slice(&[v, v, v, 255]);
            }
        }
        data
    }

    fn noise_frame(seed: u64) -> Vec<u8> {
        let (w, h) = (36u32, 16u32);
        let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        let mut data = Vec::with_capacity((w * h * 4) as usize);
        for _ in 0..w * h {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let v = (state >> 24) as u8;
            data.extend_from_slice(&[v, v, v, 255]);
        }
        data
    }

    #[test]
    fn distance_to_self_is_zero() {
        let fp = compute(&gradient_frame(0), 36, 16).unwrap();
        assert_eq!(fp.distance(fp), 0);
    }

    #[test]
    fn distance_is_symmetric_and_bounded() {
        let a = compute(&noise_frame(1), 36, 16).unwrap();
        let b = compute(&noise_frame(2), 36, 16).unwrap();
        assert_eq!(a.distance(b), b.distance(a));
        assert!(a.distance(b) <= 64);
    }

    #[test]
    fn mismatched_buffer_fails_open() {
        assert!(compute(&[0u8; 8], 36, 16).is_none());
        assert!(compute(&[], 0, 0).is_none());
    }

    #[test]
    fn near_duplicates_are_dropped() {
        let a = compute(&gradient_frame(0), 36, 16);
        let b = compute(&gradient_frame(1), 36, 16); // nearly identical
        let c = compute(&noise_frame(7), 36, 16);
        let kept = filter_similar(&[a, b, c], 10);
        assert!(kept.contains(&0));
        assert!(!kept.contains(&1));
        assert!(kept.contains(&2));
    }

    #[test]
    fn unhashable_frames_are_always_kept() {
        let a = compute(&gradient_frame(0), 36, 16);
        let kept = filter_similar(&[a, None, a], 10);
        assert_eq!(kept, vec![0, 1]);
    }

    #[test]
    fn filtering_is_idempotent() {
        let fingerprints: Vec<_> = (0..30)
            .map(|i| compute(&noise_frame(i % 6), 36, 16))
            .collect();
        let first = filter_similar(&fingerprints, 12);
        let survivors: Vec<_> = first.iter().map(|&i| fingerprints[i]).collect();
        let second = filter_similar(&survivors, 12);
        assert_eq!(second.len(), survivors.len());
        assert_eq!(second, (0..survivors.len()).collect::<Vec<_>>());
    }
}
