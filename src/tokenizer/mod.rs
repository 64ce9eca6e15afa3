use rust_stemmers::{Algorithm, Stemmer};
use std::collections::HashSet;
use stop_words::{get, LANGUAGE};
use unicode_segmentation::UnicodeSegmentation;

use crate::config::TokenizerConfig;

/// Text tokenizer with stemming and stopword removal
pub struct Tokenizer {
    config: TokenizerConfig,
    stemmer: Option<Stemmer>,
    stopwords: HashSet<String>,
}

impl Tokenizer {
    /// Create a new tokenizer from configuration
    pub fn new(config: &TokenizerConfig) -> Self {
        let stemmer = if config.stem {
            Some(Stemmer::create(Algorithm::English))
        } else {
            None
        };

        let stopwords = if config.remove_stopwords {
            get(LANGUAGE::English)
                .into_iter()
                .map(|s| s.to_lowercase())
                .collect()
        } else {
            HashSet::new()
        };

        Self {
            config: config.clone(),
            stemmer,
            stopwords,
        }
    }

    /// Tokenize text into a vector of terms
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let tokens = text
            .unicode_words()
            .map(|word| {
                if self.config.lowercase {
                    word.to_lowercase()
                } else {
                    word.to_string()
                }
            })
            .filter(|token| {
                token.len() >= self.config.min_token_length
                    && token.len() <= self.config.max_token_length
                    && !self.stopwords.contains(token)
            });

        match &self.stemmer {
            Some(stemmer) => tokens.map(|t| stemmer.stem(&t).to_string()).collect(),
            None => tokens.collect(),
        }
    }

    /// Get the set of unique terms in text
    pub fn unique_terms(&self, text: &str) -> HashSet<String> {
        self.tokenize(text).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain_config() -> TokenizerConfig {
        TokenizerConfig {
            lowercase: true,
            remove_stopwords: false,
            stem: false,
            min_token_length: 2,
            max_token_length: 50,
            language: "english".to_string(),
        }
    }

    #[test]
    fn test_basic_tokenization() {
        let tokenizer = Tokenizer::new(&plain_config());
        let tokens = tokenizer.tokenize("Hello World! This is a test.");

        assert!(tokens.contains(&"hello".to_string()));
        assert!(tokens.contains(&"world".to_string()));
        assert!(tokens.contains(&"test".to_string()));
        // single-char token filtered by min_token_length
        assert!(!tokens.contains(&"a".to_string()));
    }

    #[test]
    fn test_stopword_removal() {
        let mut config = plain_config();
        config.remove_stopwords = true;

        let tokenizer = Tokenizer::new(&config);
        let tokens = tokenizer.tokenize("the quick brown fox");
        assert!(!tokens.contains(&"the".to_string()));
        assert!(tokens.contains(&"quick".to_string()));
    }

    #[test]
    fn test_stemming() {
        let mut config = plain_config();
        config.stem = true;

        let tokenizer = Tokenizer::new(&config);
        let tokens = tokenizer.tokenize("running runs");
        assert!(tokens.iter().all(|t| t.starts_with("run")));
    }

    #[test]
    fn test_unique_terms() {
        let tokenizer = Tokenizer::new(&plain_config());
        let terms = tokenizer.unique_terms("beer beer beer ale");
        assert_eq!(terms.len(), 2);
    }
}
