//! Several providers run in a fixed order.

use embed_types::{Document, LookupMiss, Sentence, Token};

use crate::error::EmbeddingError;
use crate::model::TokenEmbeddings;

/// Runs its members in order; a token's stacked vector is the concatenation
/// of the members' vectors in that same order.
pub struct StackedEmbeddings {
    embeddings: Vec<Box<dyn TokenEmbeddings>>,
    name: String,
    length: usize,
}

impl StackedEmbeddings {
    pub fn new(embeddings: Vec<Box<dyn TokenEmbeddings>>) -> Result<Self, EmbeddingError> {
        if embeddings.is_empty() {
            return Err(EmbeddingError::Config("stack needs at least one embedding".to_string()));
        }
        let length = embeddings.iter().map(|e| e.embedding_length()).sum();
        let name = format!(
            "Stack({})",
            embeddings.iter().map(|e| e.name()).collect::<Vec<_>>().join(",")
        );
        Ok(Self {
            embeddings,
            name,
            length,
        })
    }

    /// Member names, in stacking order.
    pub fn names(&self) -> Vec<&str> {
        self.embeddings.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }

    /// Concatenated member vectors of `token`.
    pub fn token_vector(&self, token: &Token) -> Result<Vec<f32>, LookupMiss> {
        token.concatenated(&self.names())
    }

    /// Like [`Self::token_vector`], with zeros for any member that has not
    /// embedded the token.
    pub fn token_vector_or_zeros(&self, token: &Token) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.length);
        for embedding in &self.embeddings {
            out.extend(token.embedding_or_zeros(embedding.name(), embedding.embedding_length()));
        }
        out
    }
}

impl TokenEmbeddings for StackedEmbeddings {
    fn name(&self) -> &str {
        &self.name
    }

    fn embedding_length(&self) -> usize {
        self.length
    }

    fn is_static(&self) -> bool {
        self.embeddings.iter().all(|e| e.is_static())
    }

    fn add_embeddings(&self, sentences: &mut [Sentence]) -> Result<(), EmbeddingError> {
        for embedding in &self.embeddings {
            embedding.embed(sentences)?;
        }
        Ok(())
    }

    // members decide for themselves whether to skip
    fn embed(&self, sentences: &mut [Sentence]) -> Result<(), EmbeddingError> {
        self.add_embeddings(sentences)
    }

    fn embed_document(&self, document: &mut Document) -> Result<(), EmbeddingError> {
        for embedding in &self.embeddings {
            embedding.embed_document(document)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant {
        name: &'static str,
        value: f32,
        width: usize,
    }

    impl TokenEmbeddings for Constant {
        fn name(&self) -> &str {
            self.name
        }

        fn embedding_length(&self) -> usize {
            self.width
        }

        fn add_embeddings(&self, sentences: &mut [Sentence]) -> Result<(), EmbeddingError> {
            for sentence in sentences {
                for token in sentence.tokens_mut() {
                    token.set_embedding(self.name, vec![self.value; self.width]);
                }
            }
            Ok(())
        }
    }

    fn stack() -> StackedEmbeddings {
        StackedEmbeddings::new(vec![
            Box::new(Constant {
                name: "glove",
                value: 1.0,
                width: 2,
            }),
            Box::new(Constant {
                name: "char",
                value: 2.0,
                width: 1,
            }),
        ])
        .unwrap()
    }

    #[test]
    fn test_width_is_sum_of_members() {
        let stack = stack();
        assert_eq!(stack.embedding_length(), 3);
        assert_eq!(stack.names(), vec!["glove", "char"]);
        assert_eq!(stack.name(), "Stack(glove,char)");
    }

    #[test]
    fn test_concatenation_follows_member_order() {
        let stack = stack();
        let mut sentences = vec![Sentence::new(["a", "b"])];
        stack.embed(&mut sentences).unwrap();
        let token = &sentences[0].tokens()[1];
        assert_eq!(stack.token_vector(token).unwrap(), vec![1.0, 1.0, 2.0]);
    }

    #[test]
    fn test_missing_member_vector() {
        let stack = stack();
        let mut token = Token::new(1, "a");
        token.set_embedding("glove", vec![1.0, 1.0]);
        let miss = stack.token_vector(&token).unwrap_err();
        assert_eq!(miss.name, "char");
        assert_eq!(stack.token_vector_or_zeros(&token), vec![1.0, 1.0, 0.0]);
    }

    #[test]
    fn test_empty_stack_is_rejected() {
        assert!(StackedEmbeddings::new(Vec::new()).is_err());
    }

    #[test]
    fn test_document_embedding_runs_every_member() {
        let stack = stack();
        let mut doc = Document::new(vec![Sentence::new(["x"]), Sentence::new(["y"])]);
        stack.embed_document(&mut doc).unwrap();
        for sentence in doc.sentences() {
            assert!(sentence.is_embedded("glove"));
            assert!(sentence.is_embedded("char"));
        }
    }
}
