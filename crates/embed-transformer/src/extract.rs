//! Per-token vectors from hidden states.
//!
//! Selects the configured layers, pools each token's subword span and either
//! concatenates the layers (layer-major) or mixes them into one.

use std::ops::Range;

use candle_core::{Device, Tensor};
use embed_types::Pooling;

use crate::error::EmbeddingError;

/// Parse a pooling rule name (`first`, `last`, `first_last`, `mean`).
pub fn parse_pooling(name: &str) -> Result<Pooling, EmbeddingError> {
    name.parse()
        .map_err(|_| EmbeddingError::UnknownPooling(name.to_string()))
}

/// Parsed `layers` setting: `"all"` or comma-separated indices, where
/// negative indices count from the top.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerSelection {
    All,
    Indices(Vec<i64>),
}

impl LayerSelection {
    pub fn parse(spec: &str) -> Result<Self, EmbeddingError> {
        let spec = spec.trim();
        if spec.eq_ignore_ascii_case("all") {
            return Ok(LayerSelection::All);
        }
        let indices = spec
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<i64>()
                    .map_err(|_| EmbeddingError::Config(format!("invalid layer index '{}'", part.trim())))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if indices.is_empty() {
            return Err(EmbeddingError::Config("no layers selected".to_string()));
        }
        Ok(LayerSelection::Indices(indices))
    }

    /// Absolute hidden-state indices, in selection order.
    pub fn resolve(&self, num_hidden_states: usize) -> Result<Vec<usize>, EmbeddingError> {
        match self {
            LayerSelection::All => Ok((0..num_hidden_states).collect()),
            LayerSelection::Indices(indices) => indices
                .iter()
                .map(|&i| {
                    let absolute = if i < 0 { num_hidden_states as i64 + i } else { i };
                    if absolute < 0 || absolute >= num_hidden_states as i64 {
                        Err(EmbeddingError::Config(format!(
                            "layer {} out of range for a model with {} hidden states",
                            i, num_hidden_states
                        )))
                    } else {
                        Ok(absolute as usize)
                    }
                })
                .collect(),
        }
    }
}

/// Softmax-weighted sum of layers, scaled by `gamma`.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalarMix {
    weights: Vec<f32>,
    gamma: f32,
}

impl ScalarMix {
    /// Uniform mix: zero logits, unit scale.
    pub fn new(mixture_size: usize) -> Self {
        Self {
            weights: vec![0.0; mixture_size],
            gamma: 1.0,
        }
    }

    /// Mix with learned logits and scale.
    pub fn with_parameters(weights: Vec<f32>, gamma: f32) -> Result<Self, EmbeddingError> {
        if weights.is_empty() {
            return Err(EmbeddingError::Config("scalar mix needs at least one weight".to_string()));
        }
        Ok(Self { weights, gamma })
    }

    pub fn mixture_size(&self) -> usize {
        self.weights.len()
    }

    pub fn gamma(&self) -> f32 {
        self.gamma
    }

    fn normalized(&self, device: &Device) -> Result<Tensor, EmbeddingError> {
        let logits = Tensor::new(self.weights.as_slice(), device)?;
        Ok(candle_nn::ops::softmax(&logits, 0)?)
    }

    /// Softmax of the logits.
    pub fn normalized_weights(&self) -> Result<Vec<f32>, EmbeddingError> {
        Ok(self.normalized(&Device::Cpu)?.to_vec1::<f32>()?)
    }

    /// Mix `(layers, width)` into `(width,)`.
    pub fn mix(&self, layers: &Tensor) -> Result<Tensor, EmbeddingError> {
        let (count, _) = layers.dims2()?;
        if count != self.weights.len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.weights.len(),
                actual: count,
            });
        }
        let weights = self
            .normalized(layers.device())?
            .reshape((count, 1))?
            .to_dtype(layers.dtype())?;
        let mixed = layers.broadcast_mul(&weights)?.sum(0)?;
        Ok(mixed.affine(f64::from(self.gamma), 0.0)?)
    }
}

/// Turns a sentence's hidden states into one vector per token.
#[derive(Debug, Clone)]
pub struct LayerExtractor {
    layers: Vec<usize>,
    pooling: Pooling,
    scalar_mix: Option<ScalarMix>,
    hidden_size: usize,
}

impl LayerExtractor {
    pub fn new(layers: Vec<usize>, pooling: Pooling, use_scalar_mix: bool, hidden_size: usize) -> Self {
        let scalar_mix = use_scalar_mix.then(|| ScalarMix::new(layers.len()));
        Self {
            layers,
            pooling,
            scalar_mix,
            hidden_size,
        }
    }

    /// Replace the uniform mix with learned parameters.
    pub fn with_scalar_mix(mut self, mix: ScalarMix) -> Result<Self, EmbeddingError> {
        if mix.mixture_size() != self.layers.len() {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.layers.len(),
                actual: mix.mixture_size(),
            });
        }
        self.scalar_mix = Some(mix);
        Ok(self)
    }

    pub fn layers(&self) -> &[usize] {
        &self.layers
    }

    pub fn pooling(&self) -> Pooling {
        self.pooling
    }

    /// Width of every vector produced.
    pub fn output_width(&self) -> usize {
        let layer_count = if self.scalar_mix.is_some() { 1 } else { self.layers.len() };
        layer_count * self.hidden_size * self.pooling.width_factor()
    }

    /// Keep the configured layers of `(states, seq, hidden)`, in order.
    pub fn select_layers(&self, states: &Tensor) -> Result<Tensor, EmbeddingError> {
        let index: Vec<u32> = self.layers.iter().map(|&l| l as u32).collect();
        let index = Tensor::new(index.as_slice(), states.device())?;
        Ok(states.contiguous()?.index_select(&index, 0)?)
    }

    /// Pool one token's span of `(layers, seq, hidden)` into a flat vector.
    ///
    /// An empty span yields zeros.
    pub fn pool_span(&self, selected: &Tensor, span: Range<usize>) -> Result<Vec<f32>, EmbeddingError> {
        let len = span.len();
        if len == 0 {
            return Ok(vec![0.0; self.output_width()]);
        }
        let seq = selected.dim(1)?;
        if span.end > seq {
            return Err(EmbeddingError::SpanMismatch {
                expected: span.end,
                actual: seq,
            });
        }

        let current = selected.narrow(1, span.start, len)?;
        let first = || current.narrow(1, 0, 1).and_then(|t| t.squeeze(1));
        let last = || current.narrow(1, len - 1, 1).and_then(|t| t.squeeze(1));
        let pooled = match self.pooling {
            Pooling::First => first()?,
            Pooling::Last => last()?,
            Pooling::FirstLast => Tensor::cat(&[first()?, last()?], 1)?,
            Pooling::Mean => current.mean(1)?,
        };

        let flat = match &self.scalar_mix {
            Some(mix) => mix.mix(&pooled)?,
            None => pooled.flatten_all()?,
        };
        Ok(flat.to_vec1::<f32>()?)
    }

    /// One vector per token, walking `lengths` from position `start` of
    /// `(layers, seq, hidden)`.
    pub fn token_vectors(
        &self,
        selected: &Tensor,
        start: usize,
        lengths: &[usize],
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let mut offset = start;
        let mut vectors = Vec::with_capacity(lengths.len());
        for &len in lengths {
            vectors.push(self.pool_span(selected, offset..offset + len)?);
            offset += len;
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `(2 layers, 3 positions, 2 hidden)`: value = layer * 100 + pos * 10 + dim
    fn states() -> Tensor {
        let mut data = Vec::new();
        for layer in 0..2 {
            for pos in 0..3 {
                for dim in 0..2 {
                    data.push((layer * 100 + pos * 10 + dim) as f32);
                }
            }
        }
        Tensor::from_vec(data, (2, 3, 2), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_parse_pooling() {
        assert_eq!(parse_pooling("first_last").unwrap(), Pooling::FirstLast);
        assert!(matches!(
            parse_pooling("max"),
            Err(EmbeddingError::UnknownPooling(name)) if name == "max"
        ));
    }

    #[test]
    fn test_parse_layers() {
        assert_eq!(LayerSelection::parse("all").unwrap(), LayerSelection::All);
        assert_eq!(
            LayerSelection::parse("-1, -2,0").unwrap(),
            LayerSelection::Indices(vec![-1, -2, 0])
        );
        assert!(LayerSelection::parse("-1,x").is_err());
    }

    #[test]
    fn test_resolve_negative_layers() {
        let selection = LayerSelection::parse("-1,-2,-3,-4").unwrap();
        assert_eq!(selection.resolve(13).unwrap(), vec![12, 11, 10, 9]);
        assert_eq!(LayerSelection::All.resolve(3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_resolve_out_of_range() {
        let selection = LayerSelection::parse("-5").unwrap();
        assert!(matches!(selection.resolve(4), Err(EmbeddingError::Config(_))));
        let selection = LayerSelection::parse("4").unwrap();
        assert!(selection.resolve(4).is_err());
    }

    #[test]
    fn test_first_pooling_is_layer_major() {
        let extractor = LayerExtractor::new(vec![1, 0], Pooling::First, false, 2);
        let selected = extractor.select_layers(&states()).unwrap();
        let v = extractor.pool_span(&selected, 1..3).unwrap();
        assert_eq!(v, vec![110.0, 111.0, 10.0, 11.0]);
        assert_eq!(extractor.output_width(), 4);
    }

    #[test]
    fn test_last_and_first_last_pooling() {
        let last = LayerExtractor::new(vec![0], Pooling::Last, false, 2);
        let selected = last.select_layers(&states()).unwrap();
        assert_eq!(last.pool_span(&selected, 0..2).unwrap(), vec![10.0, 11.0]);

        let first_last = LayerExtractor::new(vec![0], Pooling::FirstLast, false, 2);
        assert_eq!(
            first_last.pool_span(&selected, 0..2).unwrap(),
            vec![0.0, 1.0, 10.0, 11.0]
        );
        assert_eq!(first_last.output_width(), 4);
    }

    #[test]
    fn test_mean_pooling() {
        let extractor = LayerExtractor::new(vec![0], Pooling::Mean, false, 2);
        let selected = extractor.select_layers(&states()).unwrap();
        assert_eq!(extractor.pool_span(&selected, 0..3).unwrap(), vec![10.0, 11.0]);
    }

    #[test]
    fn test_empty_span_is_zeros() {
        let extractor = LayerExtractor::new(vec![0, 1], Pooling::FirstLast, false, 2);
        let selected = extractor.select_layers(&states()).unwrap();
        assert_eq!(extractor.pool_span(&selected, 2..2).unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn test_uniform_scalar_mix_is_mean_of_layers() {
        let extractor = LayerExtractor::new(vec![0, 1], Pooling::First, true, 2);
        assert_eq!(extractor.output_width(), 2);
        let selected = extractor.select_layers(&states()).unwrap();
        let v = extractor.pool_span(&selected, 0..1).unwrap();
        assert!((v[0] - 50.0).abs() < 1e-4);
        assert!((v[1] - 51.0).abs() < 1e-4);
    }

    #[test]
    fn test_learned_scalar_mix() {
        let mix = ScalarMix::with_parameters(vec![0.0, 1000.0], 2.0).unwrap();
        let weights = mix.normalized_weights().unwrap();
        assert!(weights[1] > 0.999);
        let extractor = LayerExtractor::new(vec![0, 1], Pooling::First, true, 2)
            .with_scalar_mix(mix)
            .unwrap();
        let selected = extractor.select_layers(&states()).unwrap();
        let v = extractor.pool_span(&selected, 0..1).unwrap();
        assert!((v[0] - 200.0).abs() < 1e-2);
    }

    #[test]
    fn test_scalar_mix_size_must_match() {
        let mix = ScalarMix::new(3);
        let result = LayerExtractor::new(vec![0, 1], Pooling::First, true, 2).with_scalar_mix(mix);
        assert!(matches!(result, Err(EmbeddingError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_token_vectors_walks_lengths() {
        let extractor = LayerExtractor::new(vec![0], Pooling::First, false, 2);
        let selected = extractor.select_layers(&states()).unwrap();
        let vectors = extractor.token_vectors(&selected, 0, &[2, 0, 1]).unwrap();
        assert_eq!(vectors, vec![vec![0.0, 1.0], vec![0.0, 0.0], vec![20.0, 21.0]]);
    }

    #[test]
    fn test_span_past_end_is_an_error() {
        let extractor = LayerExtractor::new(vec![0], Pooling::First, false, 2);
        let selected = extractor.select_layers(&states()).unwrap();
        assert!(matches!(
            extractor.pool_span(&selected, 2..4),
            Err(EmbeddingError::SpanMismatch { .. })
        ));
    }
}
