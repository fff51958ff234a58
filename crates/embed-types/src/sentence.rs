//! Sentences and documents.

use crate::cache::{ContextWindow, DocumentLayout, NamedCache, SentenceSubwords};
use crate::token::Token;

/// An ordered sequence of tokens.
///
/// Carries the caches providers fill while embedding it. Adding a token
/// invalidates them.
#[derive(Debug, Clone, Default)]
pub struct Sentence {
    tokens: Vec<Token>,
    subwords: NamedCache<SentenceSubwords>,
    context_windows: NamedCache<ContextWindow>,
}

impl Sentence {
    /// Build a sentence from token texts; indices start at 1.
    pub fn new<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tokens = texts
            .into_iter()
            .enumerate()
            .map(|(i, text)| Token::new(i + 1, text))
            .collect();
        Self {
            tokens,
            ..Self::default()
        }
    }

    /// Build a sentence by splitting `text` on whitespace.
    pub fn from_whitespace(text: &str) -> Self {
        Self::new(text.split_whitespace())
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    /// Mutable access to the tokens, for attaching vectors.
    pub fn tokens_mut(&mut self) -> &mut [Token] {
        &mut self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Append a token; cached subword and window data become stale.
    pub fn push_token(&mut self, text: impl Into<String>) {
        let idx = self.tokens.len() + 1;
        self.tokens.push(Token::new(idx, text));
        self.subwords.clear();
        self.context_windows.clear();
    }

    /// Token texts joined by single spaces.
    pub fn to_tokenized_string(&self) -> String {
        self.tokens
            .iter()
            .map(Token::text)
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// True if every token carries a vector named `name`.
    pub fn is_embedded(&self, name: &str) -> bool {
        self.tokens.iter().all(|t| t.has_embedding(name))
    }

    pub fn subwords(&self) -> &NamedCache<SentenceSubwords> {
        &self.subwords
    }

    pub fn subwords_mut(&mut self) -> &mut NamedCache<SentenceSubwords> {
        &mut self.subwords
    }

    /// Cached subwords for `name`, computed from the tokens on a miss.
    pub fn subwords_or_compute<E, F>(&mut self, name: &str, compute: F) -> Result<&SentenceSubwords, E>
    where
        F: FnOnce(&[Token]) -> Result<SentenceSubwords, E>,
    {
        let tokens = &self.tokens;
        self.subwords.get_or_compute(name, || compute(tokens))
    }

    pub fn context_windows(&self) -> &NamedCache<ContextWindow> {
        &self.context_windows
    }

    pub fn context_windows_mut(&mut self) -> &mut NamedCache<ContextWindow> {
        &mut self.context_windows
    }
}

/// An ordered sequence of sentences that share context.
#[derive(Debug, Clone, Default)]
pub struct Document {
    sentences: Vec<Sentence>,
    layouts: NamedCache<DocumentLayout>,
}

impl Document {
    pub fn new(sentences: Vec<Sentence>) -> Self {
        Self {
            sentences,
            layouts: NamedCache::new(),
        }
    }

    pub fn sentences(&self) -> &[Sentence] {
        &self.sentences
    }

    pub fn sentences_mut(&mut self) -> &mut [Sentence] {
        &mut self.sentences
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    /// Append a sentence; every sentence's context window becomes stale.
    pub fn push_sentence(&mut self, sentence: Sentence) {
        self.sentences.push(sentence);
        self.layouts.clear();
        for sentence in &mut self.sentences {
            sentence.context_windows_mut().clear();
        }
    }

    pub fn layouts(&self) -> &NamedCache<DocumentLayout> {
        &self.layouts
    }

    /// Split borrow: the layout cache together with the sentences.
    pub fn parts_mut(&mut self) -> (&mut NamedCache<DocumentLayout>, &mut [Sentence]) {
        (&mut self.layouts, &mut self.sentences)
    }

    pub fn into_sentences(self) -> Vec<Sentence> {
        self.sentences
    }
}
