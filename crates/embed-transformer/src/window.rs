//! Model-input windows.
//!
//! Three ways of turning subword ids into model inputs:
//! - sentence windows: one sentence, split into overlapping windows when it
//!   does not fit the model
//! - context windows: one window per sentence, filled with the neighbouring
//!   sentences' subwords from the same document
//! - strided document windows: the whole document as one stream, each
//!   position taken from the window where it sits closest to the centre

use std::ops::Range;

use candle_core::{Device, Tensor};
use embed_types::{ContextWindow, DocumentLayout};

use crate::error::EmbeddingError;
use crate::tokenizer::SubwordTokenizer;

/// Marker ids resolved against a tokenizer's vocabulary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MarkerIds {
    pub begin: Option<u32>,
    pub separator: Option<u32>,
    /// Closing marker: the end marker, else the separator
    pub closing: Option<u32>,
    /// Marker after the closing one, if the family has it
    pub trailing: Option<u32>,
}

impl MarkerIds {
    /// Look up the profile's markers. A declared marker missing from the
    /// vocabulary is a configuration error.
    pub fn resolve<T>(tokenizer: &T) -> Result<Self, EmbeddingError>
    where
        T: SubwordTokenizer + ?Sized,
    {
        let profile = tokenizer.profile();
        let lookup = |marker: Option<&str>| -> Result<Option<u32>, EmbeddingError> {
            marker
                .map(|m| {
                    tokenizer.token_to_id(m).ok_or_else(|| {
                        EmbeddingError::Config(format!("marker '{}' is not in the vocabulary", m))
                    })
                })
                .transpose()
        };
        Ok(Self {
            begin: lookup(profile.begin_token.as_deref())?,
            separator: lookup(profile.separator_token.as_deref())?,
            closing: lookup(profile.closing_token())?,
            trailing: lookup(profile.trailing_token.as_deref())?,
        })
    }

    pub fn begin_offset(&self) -> usize {
        usize::from(self.begin.is_some())
    }

    pub fn end_offset(&self) -> usize {
        usize::from(self.closing.is_some()) + usize::from(self.trailing.is_some())
    }

    /// `[begin] content [closing] [trailing]`
    pub fn wrap(&self, content: &[u32]) -> Vec<u32> {
        let mut ids = Vec::with_capacity(content.len() + 3);
        ids.extend(self.begin);
        ids.extend_from_slice(content);
        ids.extend(self.closing);
        ids.extend(self.trailing);
        ids
    }
}

/// Window size and overlap for sentence windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGeometry {
    /// Window length, markers included
    pub max_length: usize,
    /// Subwords shared by consecutive windows
    pub stride: usize,
    /// Split long sentences instead of truncating them
    pub allow_long_sentences: bool,
}

impl WindowGeometry {
    /// Content positions per window once markers are placed.
    pub fn capacity(&self, markers: &MarkerIds) -> usize {
        self.max_length
            .saturating_sub(markers.begin_offset() + markers.end_offset())
    }
}

/// One model input cut from a sentence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentenceWindow {
    /// Marker-wrapped ids
    pub input_ids: Vec<u32>,
    /// Subword positions of the sentence covered by this window
    pub content: Range<usize>,
}

/// Cut a sentence's ids into marker-wrapped windows.
///
/// Consecutive windows overlap by exactly `stride` subwords; the last window
/// ends at the sentence end. Without long-sentence support the sentence is
/// truncated to a single window.
pub fn sentence_windows(ids: &[u32], geometry: &WindowGeometry, markers: &MarkerIds) -> Vec<SentenceWindow> {
    let n = ids.len();
    let capacity = geometry.capacity(markers);
    let window = |content: Range<usize>| SentenceWindow {
        input_ids: markers.wrap(&ids[content.clone()]),
        content,
    };

    if !geometry.allow_long_sentences || n <= capacity {
        return vec![window(0..n.min(capacity))];
    }

    let mut windows = Vec::new();
    let mut start = 0;
    loop {
        let end = (start + capacity).min(n);
        windows.push(window(start..end));
        if end == n {
            break;
        }
        start = end - geometry.stride;
    }
    windows
}

/// Left and right context sizes for a sentence of `sentence_len` subwords
/// with `left` subwords before it and `right` after it in its document.
///
/// The smaller side is capped at half of the free budget first; the other
/// side takes what is left.
pub fn context_budget(left: usize, right: usize, sentence_len: usize, max_len: usize) -> (usize, usize) {
    let half = max_len.saturating_sub(sentence_len) / 2;
    if left < right {
        let left_ctx = left.min(half);
        let right_ctx = right.min(max_len.saturating_sub(left_ctx + sentence_len));
        (left_ctx, right_ctx)
    } else {
        let right_ctx = right.min(half);
        let left_ctx = left.min(max_len.saturating_sub(right_ctx + sentence_len));
        (left_ctx, right_ctx)
    }
}

/// Placement of each sentence inside the concatenated document stream.
pub fn document_layout(lengths: &[usize]) -> DocumentLayout {
    let mut spans = Vec::with_capacity(lengths.len());
    let mut offset = 0;
    for &len in lengths {
        spans.push(offset..offset + len);
        offset += len;
    }
    DocumentLayout {
        spans,
        total: offset,
    }
}

/// Window for one sentence with its document context.
///
/// `doc_ids` is the whole document stream and `span` the sentence's place in
/// it. A sentence longer than `max_len` is cut to its first `max_len`
/// subwords and gets no context.
pub fn context_window(doc_ids: &[u32], span: Range<usize>, max_len: usize, markers: &MarkerIds) -> ContextWindow {
    let sentence_len = span.len().min(max_len);
    let (left_ctx, right_ctx) = context_budget(span.start, doc_ids.len() - span.end, span.len(), max_len);
    let offset = span.start - left_ctx;
    let slice_end = span.start + sentence_len + right_ctx;

    let mut input_ids = Vec::with_capacity(slice_end - offset + 3);
    input_ids.extend(markers.begin);
    input_ids.extend_from_slice(&doc_ids[offset..slice_end]);
    input_ids.extend(markers.separator);
    input_ids.extend(markers.trailing);

    let start = span.start - offset + markers.begin_offset();
    ContextWindow {
        start,
        end: start + sentence_len,
        input_ids,
    }
}

/// A window of the strided document stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StridedWindow {
    /// First document position inside the window
    pub start: usize,
    /// Unwrapped ids `doc_ids[start..start + window_size]`
    pub input_ids: Vec<u32>,
    /// Document positions whose vectors come from this window
    pub extract: Range<usize>,
}

/// Strided windows over a whole document.
///
/// Each window contributes the `stride + 1` positions around its centre;
/// the first window also owns everything before its centre and the last
/// everything after it.
pub fn strided_document_windows(doc_ids: &[u32], window_size: usize, stride: usize) -> Vec<StridedWindow> {
    let n = doc_ids.len();
    let mut windows = Vec::new();
    let mut i = 0;
    while i < n {
        let center = i + window_size / 2;
        let extract_start = center.saturating_sub(stride / 2).min(n);
        let extract_end = (center + stride / 2 + 1).clamp(extract_start, n);

        let from = if i == 0 { 0 } else { extract_start };
        let to = if i + stride >= n { n } else { extract_end };
        if from >= to {
            break;
        }

        windows.push(StridedWindow {
            start: i,
            input_ids: doc_ids[i..(i + window_size).min(n)].to_vec(),
            extract: from..to,
        });
        if to == n {
            break;
        }
        i += stride;
    }
    windows
}

/// Right-pad rows with id 0 and build the matching attention mask.
pub fn pad_batch(rows: &[&[u32]], device: &Device) -> Result<(Tensor, Tensor), EmbeddingError> {
    let width = rows.iter().map(|r| r.len()).max().unwrap_or(0);
    let mut ids = Vec::with_capacity(rows.len() * width);
    let mut mask = Vec::with_capacity(rows.len() * width);
    for row in rows {
        ids.extend_from_slice(row);
        ids.resize(ids.len() + width - row.len(), 0);
        mask.extend(std::iter::repeat(1u32).take(row.len()));
        mask.extend(std::iter::repeat(0u32).take(width - row.len()));
    }
    let input_ids = Tensor::from_vec(ids, (rows.len(), width), device)?;
    let attention_mask = Tensor::from_vec(mask, (rows.len(), width), device)?;
    Ok((input_ids, attention_mask))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BERT_MARKERS: MarkerIds = MarkerIds {
        begin: Some(101),
        separator: Some(102),
        closing: Some(102),
        trailing: None,
    };

    const XLNET_MARKERS: MarkerIds = MarkerIds {
        begin: None,
        separator: Some(4),
        closing: Some(4),
        trailing: Some(3),
    };

    fn ids(n: usize) -> Vec<u32> {
        (0..n as u32).map(|i| i + 1000).collect()
    }

    #[test]
    fn test_short_sentence_single_window() {
        let geometry = WindowGeometry {
            max_length: 512,
            stride: 256,
            allow_long_sentences: true,
        };
        let windows = sentence_windows(&ids(10), &geometry, &BERT_MARKERS);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].content, 0..10);
        assert_eq!(windows[0].input_ids.len(), 12);
        assert_eq!(windows[0].input_ids[0], 101);
        assert_eq!(windows[0].input_ids[11], 102);
    }

    #[test]
    fn test_long_sentence_windows_overlap_by_stride() {
        let geometry = WindowGeometry {
            max_length: 512,
            stride: 256,
            allow_long_sentences: true,
        };
        let windows = sentence_windows(&ids(600), &geometry, &BERT_MARKERS);
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].content, 0..510);
        assert_eq!(windows[1].content, 254..600);
        assert!(windows.iter().all(|w| w.input_ids.len() <= 512));
    }

    #[test]
    fn test_windows_without_markers() {
        let geometry = WindowGeometry {
            max_length: 512,
            stride: 256,
            allow_long_sentences: true,
        };
        let windows = sentence_windows(&ids(600), &geometry, &MarkerIds::default());
        assert_eq!(windows[0].content, 0..512);
        assert_eq!(windows[1].content, 256..600);
    }

    #[test]
    fn test_trailing_marker_closes_window() {
        let geometry = WindowGeometry {
            max_length: 12,
            stride: 4,
            allow_long_sentences: true,
        };
        assert_eq!(geometry.capacity(&XLNET_MARKERS), 10);
        let windows = sentence_windows(&ids(15), &geometry, &XLNET_MARKERS);
        assert_eq!(windows[0].content, 0..10);
        assert_eq!(windows[1].content, 6..15);
        for w in &windows {
            assert_eq!(w.input_ids[0], 1000 + w.content.start as u32);
            assert_eq!(&w.input_ids[w.input_ids.len() - 2..], &[4, 3]);
        }
    }

    #[test]
    fn test_truncation_without_long_sentence_support() {
        let geometry = WindowGeometry {
            max_length: 512,
            stride: 0,
            allow_long_sentences: false,
        };
        let windows = sentence_windows(&ids(600), &geometry, &BERT_MARKERS);
        assert_eq!(windows.len(), 1);
        assert_eq!(windows[0].content, 0..510);
    }

    #[test]
    fn test_context_budget_smaller_side_first() {
        assert_eq!(context_budget(2, 300, 10, 20), (2, 8));
        assert_eq!(context_budget(300, 2, 10, 20), (8, 2));
        assert_eq!(context_budget(100, 100, 10, 20), (5, 5));
    }

    #[test]
    fn test_context_budget_oversized_sentence() {
        assert_eq!(context_budget(50, 50, 30, 20), (0, 0));
    }

    #[test]
    fn test_document_layout() {
        let layout = document_layout(&[3, 0, 2]);
        assert_eq!(layout.spans, vec![0..3, 3..3, 3..5]);
        assert_eq!(layout.total, 5);
    }

    #[test]
    fn test_context_window_positions() {
        let doc = ids(312);
        // 2 subwords before, 300 after
        let window = context_window(&doc, 2..12, 20, &BERT_MARKERS);
        assert_eq!(window.input_ids.len(), 22);
        assert_eq!(window.start, 3);
        assert_eq!(window.end, 13);
        assert_eq!(&window.input_ids[window.start..window.end], &doc[2..12]);
        assert_eq!(window.input_ids[21], 102);
    }

    #[test]
    fn test_context_window_truncates_oversized_sentence() {
        let doc = ids(40);
        let window = context_window(&doc, 5..35, 20, &BERT_MARKERS);
        assert_eq!(window.span_len(), 20);
        assert_eq!(window.input_ids.len(), 22);
        assert_eq!(window.input_ids[1], doc[5]);
    }

    #[test]
    fn test_strided_windows_cover_every_position_once() {
        for n in [1usize, 5, 17, 100, 257, 1000] {
            let doc = ids(n);
            let windows = strided_document_windows(&doc, 15, 6);
            let mut next = 0;
            for w in &windows {
                assert!(w.extract.start <= next, "gap before {:?} (n={})", w.extract, n);
                assert!(w.extract.end > next);
                assert!(w.extract.start >= w.start);
                assert!(w.extract.end <= w.start + w.input_ids.len());
                next = w.extract.end;
            }
            assert_eq!(next, n);
        }
    }

    #[test]
    fn test_pad_batch() {
        let a = [1u32, 2, 3];
        let b = [4u32];
        let (ids, mask) = pad_batch(&[&a, &b], &Device::Cpu).unwrap();
        assert_eq!(ids.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3], vec![4, 0, 0]]);
        assert_eq!(mask.to_vec2::<u32>().unwrap(), vec![vec![1, 1, 1], vec![1, 0, 0]]);
    }
}
