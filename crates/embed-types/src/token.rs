//! Tokens and the named vectors attached to them.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A token has no vector under the requested embedding name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("No embedding '{name}' on token {idx}")]
pub struct LookupMiss {
    /// Embedding name that was looked up
    pub name: String,
    /// 1-based index of the token
    pub idx: usize,
}

/// A caller-level token.
///
/// Several providers may attach vectors to the same token over its lifetime,
/// each under its own name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Token {
    idx: usize,
    text: String,
    #[serde(default)]
    embeddings: BTreeMap<String, Vec<f32>>,
}

impl Token {
    /// Create a token at 1-based position `idx`.
    pub fn new(idx: usize, text: impl Into<String>) -> Self {
        Self {
            idx,
            text: text.into(),
            embeddings: BTreeMap::new(),
        }
    }

    /// 1-based position within the sentence
    pub fn idx(&self) -> usize {
        self.idx
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Attach (or replace) the vector stored under `name`.
    pub fn set_embedding(&mut self, name: impl Into<String>, vector: Vec<f32>) {
        self.embeddings.insert(name.into(), vector);
    }

    /// Vector stored under `name`.
    pub fn embedding(&self, name: &str) -> Result<&[f32], LookupMiss> {
        self.embeddings
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| LookupMiss {
                name: name.to_string(),
                idx: self.idx,
            })
    }

    /// Vector stored under `name`, or a zero vector of `width` on a miss.
    pub fn embedding_or_zeros(&self, name: &str, width: usize) -> Vec<f32> {
        match self.embedding(name) {
            Ok(values) => values.to_vec(),
            Err(_) => vec![0.0; width],
        }
    }

    pub fn has_embedding(&self, name: &str) -> bool {
        self.embeddings.contains_key(name)
    }

    /// Names of all attached vectors, sorted.
    pub fn embedding_names(&self) -> impl Iterator<Item = &str> {
        self.embeddings.keys().map(String::as_str)
    }

    /// Concatenate the vectors stored under `names`, in the given order.
    pub fn concatenated(&self, names: &[&str]) -> Result<Vec<f32>, LookupMiss> {
        let mut out = Vec::new();
        for name in names {
            out.extend_from_slice(self.embedding(name)?);
        }
        Ok(out)
    }

    /// Drop every attached vector.
    pub fn clear_embeddings(&mut self) {
        self.embeddings.clear();
    }

    /// Drop the vector stored under `name`, if any.
    pub fn remove_embedding(&mut self, name: &str) -> Option<Vec<f32>> {
        self.embeddings.remove(name)
    }
}
