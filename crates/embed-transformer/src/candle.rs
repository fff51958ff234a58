//! Candle-based BERT hidden states.
//!
//! The encoder is run layer by layer so that every hidden state, the
//! embedding output included, can be returned: a checkpoint with `L` encoder
//! layers reports `L + 1` states.

use std::path::{Path, PathBuf};

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::ops::softmax_last_dim;
use candle_nn::{embedding, Embedding, LayerNorm, VarBuilder};
use candle_transformers::models::with_tracing::{linear, Linear};
use embed_types::EmbedSettings;
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::EmbeddingError;
use crate::model::HiddenStateModel;
use crate::tokenizer::{HfTokenizer, TokenizerProfile};

pub const CONFIG_FILE: &str = "config.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Additive mask value for padded key positions.
const MASKED_SCORE: f64 = -10_000.0;

/// The parts of a BERT `config.json` the encoder needs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BertConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

fn default_max_position_embeddings() -> usize {
    512
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

impl BertConfig {
    pub fn from_file(path: &Path) -> Result<Self, EmbeddingError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| EmbeddingError::ModelNotFound(format!("Invalid config {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EmbeddingError> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(EmbeddingError::Config(format!(
                "hidden_size {} is not divisible into {} attention heads",
                self.hidden_size, self.num_attention_heads
            )));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }
}

/// Older checkpoints name layer-norm parameters gamma/beta.
fn layer_norm(size: usize, eps: f64, vb: VarBuilder) -> candle_core::Result<LayerNorm> {
    let (weight, bias) = match (vb.get(size, "weight"), vb.get(size, "bias")) {
        (Ok(weight), Ok(bias)) => (weight, bias),
        _ => (vb.get(size, "gamma")?, vb.get(size, "beta")?),
    };
    Ok(LayerNorm::new(weight, bias, eps))
}

struct BertEmbeddings {
    word: Embedding,
    position: Embedding,
    token_type: Embedding,
    norm: LayerNorm,
}

impl BertEmbeddings {
    fn load(vb: VarBuilder, config: &BertConfig) -> candle_core::Result<Self> {
        Ok(Self {
            word: embedding(config.vocab_size, config.hidden_size, vb.pp("word_embeddings"))?,
            position: embedding(
                config.max_position_embeddings,
                config.hidden_size,
                vb.pp("position_embeddings"),
            )?,
            token_type: embedding(config.type_vocab_size, config.hidden_size, vb.pp("token_type_embeddings"))?,
            norm: layer_norm(config.hidden_size, config.layer_norm_eps, vb.pp("LayerNorm"))?,
        })
    }

    fn forward(&self, input_ids: &Tensor) -> candle_core::Result<Tensor> {
        let (_, seq) = input_ids.dims2()?;
        let positions = Tensor::arange(0u32, seq as u32, input_ids.device())?;
        let token_types = input_ids.zeros_like()?;
        let summed = self
            .word
            .forward(input_ids)?
            .broadcast_add(&self.position.forward(&positions)?)?
            .broadcast_add(&self.token_type.forward(&token_types)?)?;
        self.norm.forward(&summed)
    }
}

struct EncoderLayer {
    query: Linear,
    key: Linear,
    value: Linear,
    attention_output: Linear,
    attention_norm: LayerNorm,
    intermediate: Linear,
    output: Linear,
    output_norm: LayerNorm,
    num_heads: usize,
    head_dim: usize,
}

impl EncoderLayer {
    fn load(vb: VarBuilder, config: &BertConfig) -> candle_core::Result<Self> {
        let hidden = config.hidden_size;
        let attention = vb.pp("attention");
        Ok(Self {
            query: linear(hidden, hidden, attention.pp("self").pp("query"))?,
            key: linear(hidden, hidden, attention.pp("self").pp("key"))?,
            value: linear(hidden, hidden, attention.pp("self").pp("value"))?,
            attention_output: linear(hidden, hidden, attention.pp("output").pp("dense"))?,
            attention_norm: layer_norm(hidden, config.layer_norm_eps, attention.pp("output").pp("LayerNorm"))?,
            intermediate: linear(hidden, config.intermediate_size, vb.pp("intermediate").pp("dense"))?,
            output: linear(config.intermediate_size, hidden, vb.pp("output").pp("dense"))?,
            output_norm: layer_norm(hidden, config.layer_norm_eps, vb.pp("output").pp("LayerNorm"))?,
            num_heads: config.num_attention_heads,
            head_dim: config.head_dim(),
        })
    }

    /// `mask` is the additive `(batch, 1, 1, seq)` key mask.
    fn forward(&self, hidden: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, seq, width) = hidden.dims3()?;
        let split_heads = |t: Tensor| -> candle_core::Result<Tensor> {
            t.reshape((batch, seq, self.num_heads, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let query = split_heads(self.query.forward(hidden)?)?;
        let key = split_heads(self.key.forward(hidden)?)?;
        let value = split_heads(self.value.forward(hidden)?)?;

        let scores = (query.matmul(&key.t()?.contiguous()?)? / (self.head_dim as f64).sqrt())?;
        let probs = softmax_last_dim(&scores.broadcast_add(mask)?)?;
        let context = probs
            .matmul(&value)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, seq, width))?;

        let attended = self
            .attention_norm
            .forward(&(self.attention_output.forward(&context)? + hidden)?)?;
        let inner = self.intermediate.forward(&attended)?.gelu_erf()?;
        self.output_norm
            .forward(&(self.output.forward(&inner)? + &attended)?)
    }
}

/// BERT encoder returning the embedding output and every layer's output.
pub struct CandleBertModel {
    embeddings: BertEmbeddings,
    layers: Vec<EncoderLayer>,
    config: BertConfig,
    device: Device,
}

impl CandleBertModel {
    /// Load from explicit file paths
    pub fn load_from_paths(config_path: &Path, weights_path: &Path) -> Result<Self, EmbeddingError> {
        info!(config = ?config_path, "Loading BERT model...");

        // GPU support can be added later with feature flags
        let device = Device::Cpu;
        let config = BertConfig::from_file(config_path)?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path.to_path_buf()], DType::F32, &device)? };
        let model = Self::from_var_builder(vb, config)?;

        info!(
            layers = model.config.num_hidden_layers,
            hidden = model.config.hidden_size,
            max_positions = model.config.max_position_embeddings,
            "Model loaded successfully"
        );
        Ok(model)
    }

    /// Build from weights named as in a HuggingFace BERT checkpoint, with or
    /// without the `bert.` prefix.
    pub fn from_var_builder(vb: VarBuilder, config: BertConfig) -> Result<Self, EmbeddingError> {
        config.validate()?;
        let vb = if vb.contains_tensor("embeddings.word_embeddings.weight") {
            vb
        } else {
            vb.pp("bert")
        };
        let device = vb.device().clone();
        let embeddings = BertEmbeddings::load(vb.pp("embeddings"), &config)?;
        let layers = (0..config.num_hidden_layers)
            .map(|i| EncoderLayer::load(vb.pp("encoder").pp("layer").pp(i), &config))
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self {
            embeddings,
            layers,
            config,
            device,
        })
    }

    pub fn config(&self) -> &BertConfig {
        &self.config
    }

    /// Maximum input length from config.json
    pub fn max_positions(&self) -> usize {
        self.config.max_position_embeddings
    }
}

impl HiddenStateModel for CandleBertModel {
    fn forward(&self, input_ids: &Tensor, attention_mask: &Tensor) -> Result<Tensor, EmbeddingError> {
        let mask = attention_mask
            .to_dtype(DType::F32)?
            .affine(-MASKED_SCORE, MASKED_SCORE)?
            .unsqueeze(1)?
            .unsqueeze(1)?;

        let mut hidden = self.embeddings.forward(input_ids)?;
        let mut states = Vec::with_capacity(self.layers.len() + 1);
        states.push(hidden.clone());
        for layer in &self.layers {
            hidden = layer.forward(&hidden, &mask)?;
            states.push(hidden.clone());
        }
        Ok(Tensor::stack(&states, 0)?)
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

/// Files of a BERT checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl CheckpointFiles {
    /// The files of a checkpoint saved into `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            config: dir.join(CONFIG_FILE),
            tokenizer: dir.join(TOKENIZER_FILE),
            weights: dir.join(WEIGHTS_FILE),
        }
    }

    pub fn exist(&self) -> bool {
        self.config.exists() && self.tokenizer.exists() && self.weights.exists()
    }
}

/// Locate the checkpoint named by `settings.transformer.model`.
///
/// A local directory is used as is. Anything else is a HuggingFace Hub
/// repository id, fetched into `model_cache_dir` on first use.
pub fn resolve_checkpoint(settings: &EmbedSettings) -> Result<CheckpointFiles, EmbeddingError> {
    let model = &settings.transformer.model;
    let local = Path::new(model);
    if local.is_dir() {
        let files = CheckpointFiles::in_dir(local);
        if !files.exist() {
            return Err(EmbeddingError::ModelNotFound(format!(
                "{} needs {}, {} and {}",
                local.display(),
                CONFIG_FILE,
                TOKENIZER_FILE,
                WEIGHTS_FILE
            )));
        }
        debug!(path = ?local, "Using local checkpoint");
        return Ok(files);
    }

    use hf_hub::api::sync::ApiBuilder;

    let cache_dir = settings.expanded_model_cache_dir();
    info!(repo = %model, cache = ?cache_dir, "Resolving checkpoint from the hub cache");
    let api = ApiBuilder::new()
        .with_cache_dir(cache_dir)
        .build()
        .map_err(|e| EmbeddingError::Download(e.to_string()))?;
    let repo = api.model(model.clone());
    let fetch = |file: &str| {
        repo.get(file)
            .map_err(|e| EmbeddingError::Download(format!("{}: {}", file, e)))
    };
    Ok(CheckpointFiles {
        config: fetch(CONFIG_FILE)?,
        tokenizer: fetch(TOKENIZER_FILE)?,
        weights: fetch(WEIGHTS_FILE)?,
    })
}

/// Tokenizer and model of the BERT checkpoint named in `settings`.
pub fn load_bert(settings: &EmbedSettings) -> Result<(HfTokenizer, CandleBertModel), EmbeddingError> {
    let files = resolve_checkpoint(settings)?;
    let model = CandleBertModel::load_from_paths(&files.config, &files.weights)?;
    let profile = TokenizerProfile::bert(model.max_positions());
    let tokenizer = HfTokenizer::from_file(&files.tokenizer, profile)?;
    Ok((tokenizer, model))
}
