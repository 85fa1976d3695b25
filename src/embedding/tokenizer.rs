//! Token counting and budget truncation.

use std::path::Path;

use super::EmbeddingError;

/// Counts tokens the way an embedding model would.
pub trait TextTokenizer: Send + Sync {
    /// Number of tokens in `text`.
    fn count(&self, text: &str) -> Result<usize, EmbeddingError>;
}

/// The `cl100k_base` byte-pair encoding used by OpenAI embedding models.
pub struct TiktokenTokenizer {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenTokenizer {
    pub fn cl100k() -> Result<Self, EmbeddingError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| EmbeddingError::Tokenizer(format!("load cl100k_base: {}", e)))?;
        Ok(Self { bpe })
    }
}

impl TextTokenizer for TiktokenTokenizer {
    fn count(&self, text: &str) -> Result<usize, EmbeddingError> {
        Ok(self.bpe.encode_ordinary(text).len())
    }
}

impl std::fmt::Debug for TiktokenTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TiktokenTokenizer").finish_non_exhaustive()
    }
}

/// Estimates token counts without a vocabulary, erring high.
///
/// ASCII letters and ASCII digits are grouped into pieces of at most three
/// characters. Other ASCII symbols are one token each. Every byte of a
/// non-ASCII character is a token, which is the most a byte-level BPE can
/// spend on it. A whitespace character is free after a non-whitespace one
/// and a token when repeated.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenizer;

const PIECE_CHARS: usize = 3;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Run {
    Letters(usize),
    Digits(usize),
    Space,
    Other,
}

impl TextTokenizer for HeuristicTokenizer {
    fn count(&self, text: &str) -> Result<usize, EmbeddingError> {
        let mut tokens = 0;
        let mut run = Run::Other;

        for ch in text.chars() {
            run = match (run, ch) {
                (Run::Letters(n), c) if c.is_ascii_alphabetic() && n < PIECE_CHARS => Run::Letters(n + 1),
                (_, c) if c.is_ascii_alphabetic() => {
                    tokens += 1;
                    Run::Letters(1)
                }
                (Run::Digits(n), c) if c.is_ascii_digit() && n < PIECE_CHARS => Run::Digits(n + 1),
                (_, c) if c.is_ascii_digit() => {
                    tokens += 1;
                    Run::Digits(1)
                }
                (Run::Space, c) if c.is_whitespace() => {
                    tokens += ch.len_utf8();
                    Run::Space
                }
                (_, c) if c.is_whitespace() => Run::Space,
                (_, c) => {
                    tokens += c.len_utf8();
                    Run::Other
                }
            };
        }
        Ok(tokens)
    }
}

/// A HuggingFace `tokenizer.json` vocabulary.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Loads a tokenizer definition from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, EmbeddingError> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            EmbeddingError::Tokenizer(format!("load {}: {}", path.display(), e))
        })?;
        Ok(Self { inner })
    }
}

impl TextTokenizer for HfTokenizer {
    fn count(&self, text: &str) -> Result<usize, EmbeddingError> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| EmbeddingError::Tokenizer(e.to_string()))?;
        Ok(encoding.len())
    }
}

impl std::fmt::Debug for HfTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HfTokenizer").finish_non_exhaustive()
    }
}

/// Cuts `text` to its longest prefix that holds at most `budget` tokens.
///
/// The cut lands on a char boundary and every accepted prefix is counted,
/// so the result always fits. Trailing whitespace is dropped when the
/// trimmed text still fits.
pub fn truncate_to_budget(
    tokenizer: &dyn TextTokenizer,
    text: &str,
    budget: usize,
) -> Result<String, EmbeddingError> {
    if tokenizer.count(text)? <= budget {
        return Ok(text.to_string());
    }

    // boundaries[k] is the byte offset after k chars.
    let mut boundaries: Vec<usize> = text.char_indices().map(|(i, _)| i).collect();
    boundaries.push(text.len());

    // Invariant: the prefix at `fits` is within budget, the one at `exceeds` is not.
    let (mut fits, mut exceeds) = (0, boundaries.len() - 1);
    while exceeds - fits > 1 {
        let mid = fits + (exceeds - fits) / 2;
        if tokenizer.count(&text[..boundaries[mid]])? <= budget {
            fits = mid;
        } else {
            exceeds = mid;
        }
    }

    let kept = &text[..boundaries[fits]];
    let trimmed = kept.trim_end();
    if tokenizer.count(trimmed)? <= budget {
        Ok(trimmed.to_string())
    } else {
        Ok(kept.to_string())
    }
}
