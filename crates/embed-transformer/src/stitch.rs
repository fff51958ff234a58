//! Stitching overlapping sentence windows back into one sequence.
//!
//! Consecutive windows share `stride` subwords. The earlier window keeps the
//! first `stride - stride / 2` of them and the later window the last
//! `stride / 2`, so every subword position is served by exactly one window
//! and each kept position sits at least `stride / 2` away from a cut.

use candle_core::Tensor;

use crate::error::EmbeddingError;

/// Marker and overlap sizes needed to undo [`crate::window::sentence_windows`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowTrim {
    /// Marker positions before each window's content
    pub begin_offset: usize,
    /// Marker positions after each window's content
    pub end_offset: usize,
    /// Subwords shared by consecutive windows
    pub stride: usize,
}

impl WindowTrim {
    /// Positions dropped from the start of window `index`.
    pub fn head(&self, index: usize) -> usize {
        if index == 0 {
            self.begin_offset
        } else {
            self.begin_offset + (self.stride - self.stride / 2)
        }
    }

    /// Positions dropped from the end of window `index` of `count`.
    pub fn tail(&self, index: usize, count: usize) -> usize {
        if index + 1 == count {
            self.end_offset
        } else {
            self.end_offset + self.stride / 2
        }
    }
}

/// Join per-window hidden states into one `(layers, expected, hidden)` tensor.
///
/// Each window tensor is `(layers, window_len, hidden)` with padding already
/// removed. The result must hold exactly `expected` positions.
pub fn stitch_windows(windows: &[Tensor], trim: &WindowTrim, expected: usize) -> Result<Tensor, EmbeddingError> {
    let count = windows.len();
    let mut kept = Vec::with_capacity(count);
    for (index, window) in windows.iter().enumerate() {
        let (_, len, _) = window.dims3()?;
        let head = trim.head(index);
        let tail = trim.tail(index, count);
        if head + tail > len {
            return Err(EmbeddingError::StitchMismatch {
                expected,
                actual: 0,
            });
        }
        kept.push(window.narrow(1, head, len - head - tail)?);
    }

    let stitched = Tensor::cat(&kept, 1)?;
    let actual = stitched.dim(1)?;
    if actual != expected {
        return Err(EmbeddingError::StitchMismatch { expected, actual });
    }
    Ok(stitched)
}
