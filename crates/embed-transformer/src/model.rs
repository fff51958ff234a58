//! Model-facing and caller-facing traits.
//!
//! [`HiddenStateModel`] is the opaque transformer: ids in, every layer's
//! hidden states out. [`TokenEmbeddings`] is what callers see: something
//! that attaches a named vector to every token of a sentence.

use candle_core::{Device, Tensor};
use embed_types::{Document, Sentence};

use crate::error::EmbeddingError;

/// Provider information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    /// Name vectors are stored under
    pub name: String,
    /// Width of every per-token vector
    pub dimension: usize,
    /// Maximum model input length, markers included
    pub max_sequence_length: usize,
}

/// A transformer exposing the hidden states of all its layers.
///
/// Providers call it from one thread, one batch at a time.
pub trait HiddenStateModel {
    /// Run the model over a padded batch.
    ///
    /// `input_ids` and `attention_mask` are `(batch, seq)` u32 tensors.
    /// Returns `(states, batch, seq, hidden)` f32, where index 0 is the
    /// embedding layer when the model exposes it.
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor, EmbeddingError>;

    fn device(&self) -> &Device;
}

/// Shape facts learned by running the model once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelProbe {
    /// Number of hidden-state tensors returned per forward pass
    pub num_hidden_states: usize,
    /// Width of each hidden state
    pub hidden_size: usize,
}

/// Feed a single dummy id through `model` to learn its output shape.
pub fn probe<M: HiddenStateModel + ?Sized>(model: &M) -> Result<ModelProbe, EmbeddingError> {
    let device = model.device();
    let ids = Tensor::new(&[[1u32]], device)?;
    let mask = Tensor::new(&[[1u32]], device)?;
    let states = model.forward(&ids, &mask)?;
    let (num_hidden_states, _, _, hidden_size) = states.dims4()?;
    if num_hidden_states == 0 || hidden_size == 0 {
        return Err(EmbeddingError::Config(format!(
            "model returned an empty hidden-state stack {:?}",
            states.dims()
        )));
    }
    Ok(ModelProbe {
        num_hidden_states,
        hidden_size,
    })
}

/// Attaches one named vector to every token of a sentence.
pub trait TokenEmbeddings {
    /// Name vectors are stored under on each token
    fn name(&self) -> &str;

    /// Width of every vector this provider writes
    fn embedding_length(&self) -> usize;

    /// Static providers always produce the same vector for the same input,
    /// so already-embedded sentences can be skipped.
    fn is_static(&self) -> bool {
        true
    }

    /// Compute and attach vectors unconditionally.
    fn add_embeddings(&self, sentences: &mut [Sentence]) -> Result<(), EmbeddingError>;

    /// Attach vectors, skipping the work when a static provider already
    /// embedded every sentence.
    fn embed(&self, sentences: &mut [Sentence]) -> Result<(), EmbeddingError> {
        if self.is_static() && sentences.iter().all(|s| s.is_embedded(self.name())) {
            return Ok(());
        }
        self.add_embeddings(sentences)
    }

    /// Embed a document's sentences; providers that use cross-sentence
    /// context override this.
    fn embed_document(&self, document: &mut Document) -> Result<(), EmbeddingError> {
        self.embed(document.sentences_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct Counting {
        calls: Cell<usize>,
        static_: bool,
    }

    impl TokenEmbeddings for Counting {
        fn name(&self) -> &str {
            "count"
        }

        fn embedding_length(&self) -> usize {
            1
        }

        fn is_static(&self) -> bool {
            self.static_
        }

        fn add_embeddings(&self, sentences: &mut [Sentence]) -> Result<(), EmbeddingError> {
            self.calls.set(self.calls.get() + 1);
            for sentence in sentences {
                for token in sentence.tokens_mut() {
                    token.set_embedding("count", vec![1.0]);
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_static_provider_skips_embedded_sentences() {
        let provider = Counting {
            calls: Cell::new(0),
            static_: true,
        };
        let mut sentences = vec![Sentence::new(["a", "b"])];
        provider.embed(&mut sentences).unwrap();
        provider.embed(&mut sentences).unwrap();
        assert_eq!(provider.calls.get(), 1);
    }

    #[test]
    fn test_non_static_provider_always_runs() {
        let provider = Counting {
            calls: Cell::new(0),
            static_: false,
        };
        let mut sentences = vec![Sentence::new(["a"])];
        provider.embed(&mut sentences).unwrap();
        provider.embed(&mut sentences).unwrap();
        assert_eq!(provider.calls.get(), 2);
    }

    #[test]
    fn test_partially_embedded_batch_is_recomputed() {
        let provider = Counting {
            calls: Cell::new(0),
            static_: true,
        };
        let mut sentences = vec![Sentence::new(["a"])];
        provider.embed(&mut sentences).unwrap();
        sentences.push(Sentence::new(["b"]));
        provider.embed(&mut sentences).unwrap();
        assert_eq!(provider.calls.get(), 2);
    }

    #[test]
    fn test_default_document_embedding_covers_all_sentences() {
        let provider = Counting {
            calls: Cell::new(0),
            static_: true,
        };
        let mut doc = Document::new(vec![Sentence::new(["a"]), Sentence::new(["b", "c"])]);
        provider.embed_document(&mut doc).unwrap();
        assert!(doc.sentences().iter().all(|s| s.is_embedded("count")));
    }
}
