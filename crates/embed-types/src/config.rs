//! Configuration loading for token-embed.
//!
//! Layered config: defaults -> config file -> explicit file -> env vars.
//! The default config file lives at `<config_dir>/token-embed/config.toml`.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use config::{Config, Environment, File};
use directories::{BaseDirs, ProjectDirs};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;

/// How the subword vectors of one token collapse into a single vector.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Pooling {
    /// Vector of the token's first subword
    #[default]
    First,
    /// Vector of the token's last subword
    Last,
    /// First and last subword vectors, concatenated
    FirstLast,
    /// Elementwise mean over all of the token's subwords
    Mean,
}

impl Pooling {
    /// Multiplier applied to the hidden size by this rule.
    pub fn width_factor(&self) -> usize {
        match self {
            Pooling::FirstLast => 2,
            _ => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Pooling::First => "first",
            Pooling::Last => "last",
            Pooling::FirstLast => "first_last",
            Pooling::Mean => "mean",
        }
    }
}

impl fmt::Display for Pooling {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Pooling {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "first" => Ok(Pooling::First),
            "last" => Ok(Pooling::Last),
            "first_last" => Ok(Pooling::FirstLast),
            "mean" => Ok(Pooling::Mean),
            other => Err(TypesError::InvalidInput(format!(
                "unknown pooling rule '{}' (expected first, last, first_last or mean)",
                other
            ))),
        }
    }
}

/// Where a sentence's context comes from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextMode {
    /// Each sentence alone; long sentences use overlapping windows
    #[default]
    Sentence,
    /// Whole document as one stream, strided windows, centre extraction
    DocumentSliding,
    /// One window per sentence with left/right context from its document
    DocumentContext,
}

/// Settings of a transformer word-embedding provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransformerSettings {
    /// Model repository id (e.g., "bert-base-uncased")
    #[serde(default = "default_model")]
    pub model: String,

    /// Comma-separated layer indices (negative counts from the top) or "all"
    #[serde(default = "default_layers")]
    pub layers: String,

    /// Subword pooling rule
    #[serde(default)]
    pub pooling: Pooling,

    /// Sentences per forward pass in sentence mode
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Mix the selected layers into one instead of concatenating them
    #[serde(default)]
    pub use_scalar_mix: bool,

    /// Track gradients while the surrounding loop is training
    #[serde(default)]
    pub fine_tune: bool,

    /// Split over-long sentences into overlapping windows instead of truncating
    #[serde(default = "default_true")]
    pub allow_long_sentences: bool,

    /// Window stride; defaults to half the model's maximum length
    #[serde(default)]
    pub stride: Option<usize>,

    /// Keep the model's maximum window even when an explicit stride is set
    #[serde(default)]
    pub maximum_window: bool,

    /// Sentence or document context strategy
    #[serde(default)]
    pub context_mode: ContextMode,

    /// Windows per forward pass in the document modes
    #[serde(default = "default_doc_batch_size")]
    pub doc_batch_size: usize,

    /// Subwords kept per token; longer tokens lose subwords from the middle
    #[serde(default = "default_maximum_subtoken_length")]
    pub maximum_subtoken_length: usize,

    /// Name the vectors are stored under (defaults to the model id)
    #[serde(default)]
    pub embedding_name: Option<String>,
}

fn default_model() -> String {
    "bert-base-uncased".to_string()
}

fn default_layers() -> String {
    "-1,-2,-3,-4".to_string()
}

fn default_batch_size() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_doc_batch_size() -> usize {
    32
}

fn default_maximum_subtoken_length() -> usize {
    999
}

impl Default for TransformerSettings {
    fn default() -> Self {
        Self {
            model: default_model(),
            layers: default_layers(),
            pooling: Pooling::default(),
            batch_size: default_batch_size(),
            use_scalar_mix: false,
            fine_tune: false,
            allow_long_sentences: default_true(),
            stride: None,
            maximum_window: false,
            context_mode: ContextMode::default(),
            doc_batch_size: default_doc_batch_size(),
            maximum_subtoken_length: default_maximum_subtoken_length(),
            embedding_name: None,
        }
    }
}

impl TransformerSettings {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be > 0".to_string());
        }
        if self.doc_batch_size == 0 {
            return Err("doc_batch_size must be > 0".to_string());
        }
        if self.maximum_subtoken_length == 0 {
            return Err("maximum_subtoken_length must be > 0".to_string());
        }
        if self.stride == Some(0) {
            return Err("stride must be > 0".to_string());
        }
        if self.layers.trim().is_empty() {
            return Err("layers must not be empty".to_string());
        }
        Ok(())
    }

    /// Name the provider stores its vectors under.
    ///
    /// Document-context vectors differ from sentence-level ones, so that mode
    /// gets its own suffix.
    pub fn resolved_name(&self) -> String {
        let base = self
            .embedding_name
            .clone()
            .unwrap_or_else(|| self.model.clone());
        match self.context_mode {
            ContextMode::DocumentContext => format!("{}_v2doc", base),
            _ => base,
        }
    }
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedSettings {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding downloaded model files
    #[serde(default = "default_model_cache_dir")]
    pub model_cache_dir: String,

    /// Transformer provider settings
    #[serde(default)]
    pub transformer: TransformerSettings,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_model_cache_dir() -> String {
    ProjectDirs::from("", "", "token-embed")
        .map(|p| p.cache_dir().join("models"))
        .unwrap_or_else(|| PathBuf::from(".cache/models"))
        .to_string_lossy()
        .to_string()
}

impl Default for EmbedSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            model_cache_dir: default_model_cache_dir(),
            transformer: TransformerSettings::default(),
        }
    }
}

impl EmbedSettings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (`<config_dir>/token-embed/config.toml`)
    /// 3. Explicit config file (optional)
    /// 4. Environment variables (`EMBED_LOG_LEVEL`, `EMBED_TRANSFORMER__POOLING`, ...)
    pub fn load(config_path: Option<&str>) -> Result<Self, TypesError> {
        let config_dir = ProjectDirs::from("", "", "token-embed")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("log_level", default_log_level())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .set_default("model_cache_dir", default_model_cache_dir())
            .map_err(|e| TypesError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("EMBED")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        let settings: EmbedSettings = config
            .try_deserialize()
            .map_err(|e| TypesError::Config(e.to_string()))?;

        settings.transformer.validate().map_err(TypesError::Config)?;
        Ok(settings)
    }

    /// Expand `~/` in the model cache directory.
    pub fn expanded_model_cache_dir(&self) -> PathBuf {
        if let Some(rest) = self.model_cache_dir.strip_prefix("~/") {
            if let Some(base) = BaseDirs::new() {
                return base.home_dir().join(rest);
            }
        }
        PathBuf::from(&self.model_cache_dir)
    }
}
