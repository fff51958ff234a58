//! Transformer word embeddings.
//!
//! [`TransformerWordEmbeddings`] ties the pipeline together: subtokenize and
//! align each sentence, build windows for the configured context mode, run the
//! model in micro-batches, then pool, stitch and attach one vector per token.

use std::mem;
use std::ops::Range;

use candle_core::Tensor;
use embed_types::{
    ContextMode, Document, DocumentLayout, NamedCache, Sentence, SentenceSubwords, Token, TransformerSettings,
};
use tracing::{debug, info, warn};

use crate::error::EmbeddingError;
use crate::extract::{LayerExtractor, LayerSelection, ScalarMix};
use crate::model::{probe, HiddenStateModel, ModelInfo, ModelProbe, TokenEmbeddings};
use crate::reconstruct::{align_subwords, clip_lengths, truncate_long_tokens};
use crate::stitch::{stitch_windows, WindowTrim};
use crate::tokenizer::SubwordTokenizer;
use crate::window::{
    context_window, document_layout, pad_batch, sentence_windows, strided_document_windows, MarkerIds,
    WindowGeometry,
};

/// Token text standing for an end-of-sequence marker.
pub const EOS_PLACEHOLDER: &str = "<EOS>";

/// Largest context window, markers excluded, in document-context mode.
const MAX_CONTEXT_LENGTH: usize = 510;

/// Word embeddings from a transformer, aligned to caller tokens.
pub struct TransformerWordEmbeddings<T, M> {
    name: String,
    settings: TransformerSettings,
    tokenizer: T,
    model: M,
    markers: MarkerIds,
    probe: ModelProbe,
    extractor: LayerExtractor,
    geometry: WindowGeometry,
    context_max_length: usize,
    document_window: usize,
    training: bool,
}

impl<T, M> TransformerWordEmbeddings<T, M>
where
    T: SubwordTokenizer,
    M: HiddenStateModel,
{
    /// Build a provider, probing the model once for its output shape.
    ///
    /// Every configuration problem surfaces here rather than at batch time.
    pub fn new(tokenizer: T, model: M, settings: TransformerSettings) -> Result<Self, EmbeddingError> {
        settings.validate().map_err(EmbeddingError::Config)?;

        let markers = MarkerIds::resolve(&tokenizer)?;
        let probe = probe(&model)?;
        let layers = LayerSelection::parse(&settings.layers)?.resolve(probe.num_hidden_states)?;
        let extractor = LayerExtractor::new(layers, settings.pooling, settings.use_scalar_mix, probe.hidden_size);

        let model_max_length = tokenizer.model_max_length();
        let geometry = window_geometry(&settings, model_max_length);
        let capacity = geometry.capacity(&markers);
        if capacity == 0 {
            return Err(EmbeddingError::Config(format!(
                "window of {} leaves no room for content",
                geometry.max_length
            )));
        }
        if geometry.allow_long_sentences && geometry.stride >= capacity {
            return Err(EmbeddingError::Config(format!(
                "stride {} must be smaller than the window content length {}",
                geometry.stride, capacity
            )));
        }

        let context_max_length = model_max_length
            .saturating_sub(markers.begin_offset() + markers.end_offset())
            .min(MAX_CONTEXT_LENGTH);
        let document_window = model_max_length.saturating_sub(1);
        match settings.context_mode {
            ContextMode::Sentence => {}
            ContextMode::DocumentContext => {
                if markers.begin.is_none() {
                    return Err(EmbeddingError::MissingMarker {
                        marker: "begin",
                        mode: "document_context",
                    });
                }
                if markers.separator.is_none() {
                    return Err(EmbeddingError::MissingMarker {
                        marker: "separator",
                        mode: "document_context",
                    });
                }
                if context_max_length == 0 {
                    return Err(EmbeddingError::Config("model too short for document context".to_string()));
                }
            }
            ContextMode::DocumentSliding => {
                let stride = geometry.stride;
                if stride == 0 || stride >= document_window || document_window / 2 + stride / 2 + 1 > document_window {
                    return Err(EmbeddingError::Config(format!(
                        "stride {} does not fit document windows of {}",
                        stride, document_window
                    )));
                }
            }
        }

        let name = settings.resolved_name();
        info!(
            name = %name,
            layers = ?extractor.layers(),
            pooling = %settings.pooling,
            dim = extractor.output_width(),
            max_len = geometry.max_length,
            stride = geometry.stride,
            mode = ?settings.context_mode,
            "Transformer embeddings ready"
        );

        Ok(Self {
            name,
            settings,
            tokenizer,
            model,
            markers,
            probe,
            extractor,
            geometry,
            context_max_length,
            document_window,
            training: false,
        })
    }

    /// Use learned scalar-mix parameters instead of the uniform mix.
    pub fn with_scalar_mix(mut self, mix: ScalarMix) -> Result<Self, EmbeddingError> {
        if !self.settings.use_scalar_mix {
            return Err(EmbeddingError::Config("use_scalar_mix is disabled".to_string()));
        }
        self.extractor = self.extractor.with_scalar_mix(mix)?;
        Ok(self)
    }

    /// Follow the surrounding loop's training flag; only matters when
    /// fine-tuning.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// True when hidden states keep their gradient graph.
    pub fn gradients_enabled(&self) -> bool {
        self.settings.fine_tune && self.training
    }

    pub fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.name.clone(),
            dimension: self.extractor.output_width(),
            max_sequence_length: self.tokenizer.model_max_length(),
        }
    }

    pub fn settings(&self) -> &TransformerSettings {
        &self.settings
    }

    pub fn probe(&self) -> ModelProbe {
        self.probe
    }

    pub fn geometry(&self) -> WindowGeometry {
        self.geometry
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Subtokenize `tokens` and align the pieces back to them.
    pub fn subtokenize(&self, tokens: &[Token]) -> Result<SentenceSubwords, EmbeddingError> {
        let texts: Vec<String> = tokens.iter().map(|t| self.render(t.text())).collect();
        let pieces = self.tokenizer.tokenize(&texts.join(" "))?;
        if pieces.is_empty() {
            return Ok(SentenceSubwords {
                pieces,
                lengths: vec![0; texts.len()],
                ids: Vec::new(),
            });
        }

        let alignment = align_subwords(&self.tokenizer, &texts, &pieces)?;
        let consumed = &pieces[alignment.skip_leading..alignment.skip_leading + alignment.total()];
        let ids = self.tokenizer.convert_tokens_to_ids(consumed)?;

        let max = self.settings.maximum_subtoken_length;
        if alignment.lengths.iter().any(|&l| l > max) {
            warn!(max, lengths = ?alignment.lengths, "Truncating over-long token spans");
        }
        let (ids, lengths) = truncate_long_tokens(&ids, &alignment.lengths, max);
        Ok(SentenceSubwords { pieces, lengths, ids })
    }

    fn render(&self, text: &str) -> String {
        if text == EOS_PLACEHOLDER {
            if let Some(marker) = self.tokenizer.profile().closing_token() {
                return marker.to_string();
            }
        }
        text.to_string()
    }

    fn prepare_subwords(&self, sentences: &mut [Sentence]) -> Result<(), EmbeddingError> {
        for sentence in sentences {
            sentence.subwords_or_compute(&self.name, |tokens| self.subtokenize(tokens))?;
        }
        Ok(())
    }

    fn cached_subwords<'a>(&self, sentence: &'a Sentence) -> Result<&'a SentenceSubwords, EmbeddingError> {
        sentence
            .subwords()
            .get(&self.name)
            .ok_or_else(|| EmbeddingError::InvalidInput(format!("no subwords cached under '{}'", self.name)))
    }

    /// Run the model over `rows`; `(states, batch, seq, hidden)`.
    fn run_model(&self, rows: &[&[u32]]) -> Result<Tensor, EmbeddingError> {
        let (input_ids, attention_mask) = pad_batch(rows, self.model.device())?;
        debug!(rows = rows.len(), width = input_ids.dim(1)?, "Running model");
        let states = self.model.forward(&input_ids, &attention_mask)?;
        if self.gradients_enabled() {
            Ok(states)
        } else {
            Ok(states.detach())
        }
    }

    /// Selected layers of one batch row, padding removed: `(layers, len, hidden)`.
    fn row_states(&self, states: &Tensor, row: usize, len: usize) -> Result<Tensor, EmbeddingError> {
        let row_states = states.narrow(1, row, 1)?.squeeze(1)?.narrow(1, 0, len)?;
        self.extractor.select_layers(&row_states)
    }

    fn attach(&self, sentence: &mut Sentence, vectors: Vec<Vec<f32>>) -> Result<(), EmbeddingError> {
        let width = self.extractor.output_width();
        if let Some(bad) = vectors.iter().find(|v| v.len() != width) {
            return Err(EmbeddingError::DimensionMismatch {
                expected: width,
                actual: bad.len(),
            });
        }
        for (token, vector) in sentence.tokens_mut().iter_mut().zip(vectors) {
            token.set_embedding(self.name.clone(), vector);
        }
        Ok(())
    }

    fn attach_zeros(&self, sentence: &mut Sentence) {
        if !sentence.is_empty() {
            warn!(
                sentence = %sentence.to_tokenized_string(),
                "Tokenizer produced no subwords, using zero vectors"
            );
        }
        let width = self.extractor.output_width();
        for token in sentence.tokens_mut() {
            token.set_embedding(self.name.clone(), vec![0.0; width]);
        }
    }

    /// Sentence mode: each sentence alone, long ones split and stitched.
    fn embed_sentence_batch(&self, batch: &mut [Sentence]) -> Result<(), EmbeddingError> {
        struct Plan {
            index: usize,
            rows: Range<usize>,
            covered: usize,
            lengths: Vec<usize>,
        }

        self.prepare_subwords(batch)?;

        let mut rows: Vec<Vec<u32>> = Vec::new();
        let mut plans = Vec::new();
        for (index, sentence) in batch.iter().enumerate() {
            let subwords = self.cached_subwords(sentence)?;
            if subwords.is_empty() {
                continue;
            }
            let windows = sentence_windows(&subwords.ids, &self.geometry, &self.markers);
            let covered = windows.last().map(|w| w.content.end).unwrap_or(0);
            let lengths = if covered < subwords.subword_count() {
                warn!(
                    subwords = subwords.subword_count(),
                    kept = covered,
                    "Sentence exceeds the model window, truncating"
                );
                clip_lengths(&subwords.lengths, covered)
            } else {
                subwords.lengths.clone()
            };
            let first = rows.len();
            rows.extend(windows.into_iter().map(|w| w.input_ids));
            plans.push(Plan {
                index,
                rows: first..rows.len(),
                covered,
                lengths,
            });
        }

        for sentence in batch.iter_mut() {
            if self.cached_subwords(sentence)?.is_empty() {
                self.attach_zeros(sentence);
            }
        }
        if plans.is_empty() {
            return Ok(());
        }

        let row_refs: Vec<&[u32]> = rows.iter().map(Vec::as_slice).collect();
        let states = self.run_model(&row_refs)?;
        let trim = WindowTrim {
            begin_offset: self.markers.begin_offset(),
            end_offset: self.markers.end_offset(),
            stride: self.geometry.stride,
        };

        for plan in plans {
            let windows = plan
                .rows
                .clone()
                .map(|row| self.row_states(&states, row, rows[row].len()))
                .collect::<Result<Vec<_>, _>>()?;
            let stitched = stitch_windows(&windows, &trim, plan.covered)?;
            let vectors = self.extractor.token_vectors(&stitched, 0, &plan.lengths)?;
            self.attach(&mut batch[plan.index], vectors)?;
        }
        Ok(())
    }

    /// The document's layout for this provider, rebuilt when missing or when
    /// it no longer matches the sentences' subword counts. The flag is true
    /// when the layout was rebuilt.
    fn current_layout(
        &self,
        layouts: &mut NamedCache<DocumentLayout>,
        sentences: &[Sentence],
    ) -> Result<(DocumentLayout, bool), EmbeddingError> {
        let lengths = sentences
            .iter()
            .map(|s| self.cached_subwords(s).map(SentenceSubwords::subword_count))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(layout) = layouts.get(&self.name) {
            if layout_matches(layout, &lengths) {
                return Ok((layout.clone(), false));
            }
            debug!(name = %self.name, "Sentences changed, rebuilding document layout");
        }
        let layout = document_layout(&lengths);
        layouts.insert(&self.name, layout.clone());
        Ok((layout, true))
    }

    /// Document modes, dispatched on the configured strategy.
    fn add_document_embeddings(&self, document: &mut Document) -> Result<(), EmbeddingError> {
        match self.settings.context_mode {
            ContextMode::Sentence => self.add_embeddings(document.sentences_mut()),
            ContextMode::DocumentContext => self.embed_document_context(document),
            ContextMode::DocumentSliding => self.embed_document_sliding(document),
        }
    }

    /// One window per sentence, padded with neighbouring context.
    ///
    /// A rebuilt layout means the document is new to this provider or its
    /// sentences changed, so every window is rebuilt with it.
    fn embed_document_context(&self, document: &mut Document) -> Result<(), EmbeddingError> {
        self.prepare_subwords(document.sentences_mut())?;
        let (layouts, sentences) = document.parts_mut();
        let (layout, rebuilt) = self.current_layout(layouts, sentences)?;

        if rebuilt || sentences.iter().any(|s| !s.context_windows().contains(&self.name)) {
            let doc_ids = document_ids(sentences, &self.name)?;
            for (sentence, span) in sentences.iter_mut().zip(layout.spans) {
                if !rebuilt && sentence.context_windows().contains(&self.name) {
                    continue;
                }
                if span.len() > self.context_max_length {
                    warn!(
                        subwords = span.len(),
                        max = self.context_max_length,
                        "Sentence exceeds the context window, truncating"
                    );
                }
                let window = context_window(&doc_ids, span, self.context_max_length, &self.markers);
                sentence.context_windows_mut().insert(&self.name, window);
            }
        }

        let mut pending = Vec::new();
        for (index, sentence) in sentences.iter_mut().enumerate() {
            if self.cached_subwords(sentence)?.is_empty() {
                self.attach_zeros(sentence);
            } else {
                pending.push(index);
            }
        }

        for chunk in pending.chunks(self.settings.doc_batch_size) {
            let windows = chunk
                .iter()
                .map(|&i| {
                    sentences[i].context_windows().get(&self.name).cloned().ok_or_else(|| {
                        EmbeddingError::InvalidInput(format!("no context window cached under '{}'", self.name))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            let row_refs: Vec<&[u32]> = windows.iter().map(|w| w.input_ids.as_slice()).collect();
            let states = self.run_model(&row_refs)?;

            for (row, (&index, window)) in chunk.iter().zip(&windows).enumerate() {
                let lengths = clip_lengths(&self.cached_subwords(&sentences[index])?.lengths, window.span_len());
                let total: usize = lengths.iter().sum();
                if total != window.span_len() {
                    return Err(EmbeddingError::SpanMismatch {
                        expected: total,
                        actual: window.span_len(),
                    });
                }
                let selected = self.row_states(&states, row, window.input_ids.len())?;
                let vectors = self.extractor.token_vectors(&selected, window.start, &lengths)?;
                self.attach(&mut sentences[index], vectors)?;
            }
        }
        Ok(())
    }

    /// Whole document as one strided stream.
    fn embed_document_sliding(&self, document: &mut Document) -> Result<(), EmbeddingError> {
        self.prepare_subwords(document.sentences_mut())?;
        let (layouts, sentences) = document.parts_mut();

        let (layout, _) = self.current_layout(layouts, sentences)?;
        if layout.total == 0 {
            for sentence in sentences.iter_mut() {
                self.attach_zeros(sentence);
            }
            return Ok(());
        }

        let doc_ids = document_ids(sentences, &self.name)?;
        let windows = strided_document_windows(&doc_ids, self.document_window, self.geometry.stride);

        let mut segments: Vec<(Range<usize>, Tensor)> = Vec::new();
        for chunk in windows.chunks(self.settings.doc_batch_size) {
            let row_refs: Vec<&[u32]> = chunk.iter().map(|w| w.input_ids.as_slice()).collect();
            let states = self.run_model(&row_refs)?;
            for (row, window) in chunk.iter().enumerate() {
                let selected = self.row_states(&states, row, window.input_ids.len())?;
                let part = selected.narrow(1, window.extract.start - window.start, window.extract.len())?;

                // the shared position belongs to the later window
                if let Some((range, previous)) = segments.last_mut() {
                    if range.end > window.extract.start {
                        let keep = window.extract.start.saturating_sub(range.start);
                        *previous = previous.narrow(1, 0, keep)?;
                        range.end = range.start + keep;
                    }
                }
                if segments.last().is_some_and(|(range, _)| range.is_empty()) {
                    segments.pop();
                }
                segments.push((window.extract.clone(), part));
            }
        }

        let mut covered = 0;
        for (range, _) in &segments {
            if range.start != covered {
                return Err(EmbeddingError::SpanMismatch {
                    expected: covered,
                    actual: range.start,
                });
            }
            covered = range.end;
        }
        if covered != layout.total {
            return Err(EmbeddingError::SpanMismatch {
                expected: layout.total,
                actual: covered,
            });
        }
        let parts: Vec<Tensor> = segments.into_iter().map(|(_, t)| t).collect();
        let doc_states = Tensor::cat(&parts, 1)?;

        for (sentence, span) in sentences.iter_mut().zip(layout.spans) {
            if span.is_empty() {
                self.attach_zeros(sentence);
                continue;
            }
            let lengths = self.cached_subwords(sentence)?.lengths.clone();
            let vectors = self.extractor.token_vectors(&doc_states, span.start, &lengths)?;
            self.attach(sentence, vectors)?;
        }
        Ok(())
    }
}

impl<T, M> TokenEmbeddings for TransformerWordEmbeddings<T, M>
where
    T: SubwordTokenizer,
    M: HiddenStateModel,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn embedding_length(&self) -> usize {
        self.extractor.output_width()
    }

    fn is_static(&self) -> bool {
        !self.settings.fine_tune
    }

    /// Sentence mode batches by `batch_size`. The document modes treat the
    /// given sentences as one temporary document.
    fn add_embeddings(&self, sentences: &mut [Sentence]) -> Result<(), EmbeddingError> {
        if self.settings.context_mode == ContextMode::Sentence {
            for batch in sentences.chunks_mut(self.settings.batch_size) {
                self.embed_sentence_batch(batch)?;
            }
            return Ok(());
        }

        let owned: Vec<Sentence> = sentences.iter_mut().map(mem::take).collect();
        let mut document = Document::new(owned);
        let result = self.add_document_embeddings(&mut document);
        // windows built from an ad hoc document are not kept
        for (slot, mut sentence) in sentences.iter_mut().zip(document.into_sentences()) {
            sentence.context_windows_mut().invalidate(&self.name);
            *slot = sentence;
        }
        result
    }

    fn embed_document(&self, document: &mut Document) -> Result<(), EmbeddingError> {
        if self.is_static() && document.sentences().iter().all(|s| s.is_embedded(&self.name)) {
            return Ok(());
        }
        self.add_document_embeddings(document)
    }
}

/// Window size and stride for sentence windows.
///
/// An explicit stride doubles into the window size unless the model's full
/// window is requested; the window never exceeds the model's maximum.
pub fn window_geometry(settings: &TransformerSettings, model_max_length: usize) -> WindowGeometry {
    let stride = settings.stride.unwrap_or(model_max_length / 2);
    let max_length = match settings.stride {
        Some(s) if !settings.maximum_window => (2 * s).min(model_max_length),
        _ => model_max_length,
    };
    WindowGeometry {
        max_length,
        stride,
        allow_long_sentences: settings.allow_long_sentences,
    }
}

fn layout_matches(layout: &DocumentLayout, lengths: &[usize]) -> bool {
    layout.spans.len() == lengths.len()
        && layout
            .spans
            .iter()
            .zip(lengths)
            .all(|(span, &len)| span.len() == len)
}

fn document_ids(sentences: &[Sentence], name: &str) -> Result<Vec<u32>, EmbeddingError> {
    let mut ids = Vec::new();
    for sentence in sentences {
        let subwords = sentence
            .subwords()
            .get(name)
            .ok_or_else(|| EmbeddingError::InvalidInput(format!("no subwords cached under '{}'", name)))?;
        ids.extend_from_slice(&subwords.ids);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockModel, MockTokenizer};
    use crate::tokenizer::TokenizerProfile;
    use embed_types::Pooling;

    fn settings() -> TransformerSettings {
        TransformerSettings {
            layers: "-1".to_string(),
            ..TransformerSettings::default()
        }
    }

    fn provider(settings: TransformerSettings) -> TransformerWordEmbeddings<MockTokenizer, MockModel> {
        let tokenizer = MockTokenizer::bert(512).with_morphs(&["eat", "ing", "quick"]);
        TransformerWordEmbeddings::new(tokenizer, MockModel::new(3, 4), settings).unwrap()
    }

    fn vector(sentence: &Sentence, i: usize, name: &str) -> Vec<f32> {
        sentence.tokens()[i].embedding(name).unwrap().to_vec()
    }

    #[test]
    fn test_embedding_length_from_probe() {
        let mut s = settings();
        s.layers = "-1,-2".to_string();
        s.pooling = Pooling::FirstLast;
        let p = provider(s);
        assert_eq!(p.probe().num_hidden_states, 3);
        assert_eq!(p.embedding_length(), 2 * 4 * 2);
        assert_eq!(p.info().dimension, 16);
    }

    #[test]
    fn test_first_pooling_uses_first_subword() {
        let p = provider(settings());
        let mut sentences = vec![Sentence::from_whitespace("Eating quickly")];
        p.embed(&mut sentences).unwrap();

        let eat = MockTokenizer::piece_id("eat");
        assert_eq!(vector(&sentences[0], 0, p.name()), p.model().state_vector(eat, 2));
        let quick = MockTokenizer::piece_id("quick");
        assert_eq!(vector(&sentences[0], 1, p.name()), p.model().state_vector(quick, 2));
    }

    #[test]
    fn test_last_pooling_uses_last_subword() {
        let mut s = settings();
        s.pooling = Pooling::Last;
        let p = provider(s);
        let mut sentences = vec![Sentence::from_whitespace("Eating")];
        p.embed(&mut sentences).unwrap();
        let ing = MockTokenizer::piece_id("##ing");
        assert_eq!(vector(&sentences[0], 0, p.name()), p.model().state_vector(ing, 2));
    }

    #[test]
    fn test_empty_sentence_gets_zero_vectors() {
        let tokenizer = MockTokenizer::bert(512).with_dropped(&["\u{200b}"]);
        let p = TransformerWordEmbeddings::new(tokenizer, MockModel::new(3, 4), settings()).unwrap();
        let mut sentences = vec![Sentence::new(["\u{200b}", "\u{200b}"])];
        p.embed(&mut sentences).unwrap();
        assert_eq!(vector(&sentences[0], 0, p.name()), vec![0.0; 4]);
        assert_eq!(vector(&sentences[0], 1, p.name()), vec![0.0; 4]);
        assert_eq!(p.model().forward_calls(), 1); // the probe only
    }

    #[test]
    fn test_eos_placeholder_renders_as_closing_marker() {
        let p = provider(settings());
        let tokens = vec![Token::new(1, "end"), Token::new(2, EOS_PLACEHOLDER)];
        let subwords = p.subtokenize(&tokens).unwrap();
        assert_eq!(subwords.lengths, vec![1, 1]);
        assert_eq!(subwords.ids[1], p.tokenizer().token_to_id("[SEP]").unwrap());
    }

    #[test]
    fn test_over_long_token_is_truncated_from_the_middle() {
        let mut s = settings();
        s.maximum_subtoken_length = 2;
        let tokenizer = MockTokenizer::bert(512).with_morphs(&["a", "b", "c", "d"]);
        let p = TransformerWordEmbeddings::new(tokenizer, MockModel::new(3, 4), s).unwrap();
        let subwords = p.subtokenize(&[Token::new(1, "abcd")]).unwrap();
        assert_eq!(subwords.lengths, vec![2]);
        assert_eq!(
            subwords.ids,
            vec![MockTokenizer::piece_id("a"), MockTokenizer::piece_id("##d")]
        );
    }

    #[test]
    fn test_subwords_are_cached_per_name() {
        let p = provider(settings());
        let mut sentences = vec![Sentence::from_whitespace("Eating quickly")];
        p.embed(&mut sentences).unwrap();
        let cached = sentences[0].subwords().get(p.name()).unwrap();
        assert_eq!(cached.lengths, vec![2, 2]);
    }

    #[test]
    fn test_static_provider_skips_second_call() {
        let p = provider(settings());
        let mut sentences = vec![Sentence::from_whitespace("Eating quickly")];
        p.embed(&mut sentences).unwrap();
        let calls = p.model().forward_calls();
        p.embed(&mut sentences).unwrap();
        assert_eq!(p.model().forward_calls(), calls);
    }

    #[test]
    fn test_fine_tune_provider_recomputes() {
        let mut s = settings();
        s.fine_tune = true;
        let mut p = provider(s);
        assert!(!p.is_static());
        assert!(!p.gradients_enabled());
        p.set_training(true);
        assert!(p.gradients_enabled());

        let mut sentences = vec![Sentence::from_whitespace("now")];
        p.embed(&mut sentences).unwrap();
        let calls = p.model().forward_calls();
        p.embed(&mut sentences).unwrap();
        assert_eq!(p.model().forward_calls(), calls + 1);
    }

    #[test]
    fn test_training_flag_ignored_without_fine_tune() {
        let mut p = provider(settings());
        p.set_training(true);
        assert!(!p.gradients_enabled());
    }

    #[test]
    fn test_batches_respect_batch_size() {
        let mut s = settings();
        s.batch_size = 2;
        let p = provider(s);
        let mut sentences: Vec<Sentence> = ["a b", "c", "d e f", "g", "h"]
            .iter()
            .map(|t| Sentence::from_whitespace(t))
            .collect();
        p.embed(&mut sentences).unwrap();
        // probe, then 2 + 2 + 1
        assert_eq!(p.model().batch_sizes(), vec![1, 2, 2, 1]);
    }

    #[test]
    fn test_long_sentence_uses_consecutive_rows() {
        let tokenizer = MockTokenizer::bert(12);
        let p = TransformerWordEmbeddings::new(tokenizer, MockModel::new(3, 4), settings()).unwrap();
        assert_eq!(p.geometry().stride, 6);
        let words: Vec<String> = (0..25).map(|i| format!("w{}", i)).collect();
        let mut sentences = vec![Sentence::new(words.clone())];
        p.embed(&mut sentences).unwrap();

        assert!(p.model().max_row_len() <= 12);
        for (i, word) in words.iter().enumerate() {
            let id = MockTokenizer::piece_id(word);
            assert_eq!(vector(&sentences[0], i, p.name()), p.model().state_vector(id, 2), "token {}", i);
        }
    }

    #[test]
    fn test_xlnet_windows_end_with_sep_cls() {
        let tokenizer = MockTokenizer::new(TokenizerProfile::xlnet(12));
        let p = TransformerWordEmbeddings::new(tokenizer, MockModel::new(3, 4), settings()).unwrap();
        assert_eq!(p.geometry().capacity(&p.markers), 10);

        let words: Vec<String> = (0..25).map(|i| format!("w{}", i)).collect();
        let mut sentences = vec![Sentence::new(words.clone())];
        p.embed(&mut sentences).unwrap();

        assert!(p.model().max_row_len() <= 12);
        for (i, word) in words.iter().enumerate() {
            let id = MockTokenizer::piece_id(&format!("▁{}", word));
            assert_eq!(vector(&sentences[0], i, p.name()), p.model().state_vector(id, 2), "token {}", i);
        }
    }

    #[test]
    fn test_truncation_without_long_sentences() {
        let mut s = settings();
        s.allow_long_sentences = false;
        let p = TransformerWordEmbeddings::new(MockTokenizer::bert(6), MockModel::new(3, 4), s).unwrap();
        let mut sentences = vec![Sentence::from_whitespace("a b c d e f")];
        p.embed(&mut sentences).unwrap();
        let id = MockTokenizer::piece_id("d");
        assert_eq!(vector(&sentences[0], 3, p.name()), p.model().state_vector(id, 2));
        assert_eq!(vector(&sentences[0], 4, p.name()), vec![0.0; 4]);
        assert_eq!(vector(&sentences[0], 5, p.name()), vec![0.0; 4]);
    }

    #[test]
    fn test_window_geometry() {
        let mut s = TransformerSettings::default();
        assert_eq!(window_geometry(&s, 512).max_length, 512);
        assert_eq!(window_geometry(&s, 512).stride, 256);

        s.stride = Some(100);
        assert_eq!(window_geometry(&s, 512).max_length, 200);
        s.maximum_window = true;
        assert_eq!(window_geometry(&s, 512).max_length, 512);
        s.maximum_window = false;
        s.stride = Some(400);
        assert_eq!(window_geometry(&s, 512).max_length, 512);
    }

    #[test]
    fn test_construction_errors() {
        let mut s = settings();
        s.layers = "-9".to_string();
        assert!(matches!(
            TransformerWordEmbeddings::new(MockTokenizer::bert(512), MockModel::new(3, 4), s),
            Err(EmbeddingError::Config(_))
        ));

        let mut s = settings();
        s.stride = Some(2);
        assert!(TransformerWordEmbeddings::new(MockTokenizer::bert(512), MockModel::new(3, 4), s).is_err());

        let mut s = settings();
        s.context_mode = ContextMode::DocumentContext;
        let tokenizer = MockTokenizer::new(TokenizerProfile::xlnet(512));
        assert!(matches!(
            TransformerWordEmbeddings::new(tokenizer, MockModel::new(3, 4), s),
            Err(EmbeddingError::MissingMarker { marker: "begin", .. })
        ));
    }

    #[test]
    fn test_document_context_uses_neighbours() {
        let mut s = settings();
        s.context_mode = ContextMode::DocumentContext;
        let p = TransformerWordEmbeddings::new(MockTokenizer::bert(512), MockModel::contextual(3, 4), s).unwrap();
        assert_eq!(p.name(), "bert-base-uncased_v2doc");

        let mut doc = Document::new(vec![
            Sentence::from_whitespace("the cat sat"),
            Sentence::from_whitespace("on the mat"),
        ]);
        p.embed_document(&mut doc).unwrap();

        let mut alone = vec![Sentence::from_whitespace("the cat sat")];
        let solo = TransformerWordEmbeddings::new(MockTokenizer::bert(512), MockModel::contextual(3, 4), settings())
            .unwrap();
        solo.embed(&mut alone).unwrap();

        assert!(doc.sentences().iter().all(|s| s.is_embedded(p.name())));
        assert_ne!(vector(&doc.sentences()[0], 0, p.name()), vector(&alone[0], 0, solo.name()));

        let window = doc.sentences()[1].context_windows().get(p.name()).unwrap();
        assert_eq!(window.start, 4);
        assert_eq!(window.span_len(), 3);
        assert_eq!(doc.layouts().get(p.name()).unwrap().total, 6);
    }

    #[test]
    fn test_changed_document_rebuilds_windows() {
        let mut s = settings();
        s.context_mode = ContextMode::DocumentContext;
        let p = TransformerWordEmbeddings::new(MockTokenizer::bert(512), MockModel::new(3, 4), s).unwrap();

        let mut doc = Document::new(vec![Sentence::from_whitespace("a b c"), Sentence::from_whitespace("d")]);
        p.embed_document(&mut doc).unwrap();
        assert_eq!(doc.sentences()[1].context_windows().get(p.name()).unwrap().start, 4);

        // same sentence count, different lengths
        doc.sentences_mut()[0] = Sentence::from_whitespace("e");
        p.embed_document(&mut doc).unwrap();
        assert_eq!(doc.layouts().get(p.name()).unwrap().total, 2);
        assert_eq!(doc.sentences()[1].context_windows().get(p.name()).unwrap().start, 2);
    }

    #[test]
    fn test_document_sliding_covers_every_token() {
        let mut s = settings();
        s.context_mode = ContextMode::DocumentSliding;
        s.stride = Some(4);
        s.maximum_window = true;
        let p = TransformerWordEmbeddings::new(MockTokenizer::bert(11), MockModel::new(3, 4), s).unwrap();

        let sentences: Vec<Sentence> = (0..6)
            .map(|k| Sentence::new((0..5).map(|i| format!("s{}w{}", k, i))))
            .collect();
        let mut doc = Document::new(sentences);
        p.embed_document(&mut doc).unwrap();

        for sentence in doc.sentences() {
            for (i, token) in sentence.tokens().iter().enumerate() {
                let id = MockTokenizer::piece_id(token.text());
                assert_eq!(vector(sentence, i, p.name()), p.model().state_vector(id, 2));
            }
        }
        assert!(p.model().max_row_len() <= 10);
    }

    #[test]
    fn test_loose_sentences_in_document_mode() {
        let mut s = settings();
        s.context_mode = ContextMode::DocumentContext;
        let p = TransformerWordEmbeddings::new(MockTokenizer::bert(512), MockModel::new(3, 4), s).unwrap();
        let mut sentences = vec![Sentence::from_whitespace("a b"), Sentence::from_whitespace("c")];
        p.embed(&mut sentences).unwrap();
        assert_eq!(sentences[0].len(), 2);
        assert!(sentences.iter().all(|s| s.is_embedded(p.name())));
        assert!(sentences.iter().all(|s| !s.context_windows().contains(p.name())));
        let id = MockTokenizer::piece_id("c");
        assert_eq!(vector(&sentences[1], 0, p.name()), p.model().state_vector(id, 2));
    }
}
