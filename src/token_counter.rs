// Token Accounting
// Counting and truncation primitives for the embedding token budget. The
// approximate counter is always available and intentionally overestimates, so
// budgeted context never exceeds a model limit. Exact counting via the
// HuggingFace tokenizers crate sits behind the `exact-tokens` feature.

#[cfg(feature = "exact-tokens")]
use anyhow::Result;

/// Marker inserted between the preserved head and tail of a smart-truncated
/// element.
pub const ELISION_MARKER: &str = "\n\n[... content truncated ...]\n\n";

/// Token counter with word-boundary truncation.
pub enum TokenCounter {
    /// 1 token ≈ 4 characters or 0.75 words, whichever counts higher.
    Approximate,
    #[cfg(feature = "exact-tokens")]
    Exact(Box<tokenizers::Tokenizer>),
}

impl Default for TokenCounter {
    fn default() -> Self {
        TokenCounter::Approximate
    }
}

impl TokenCounter {
    pub fn approximate() -> Self {
        TokenCounter::Approximate
    }

    /// Load an exact tokenizer from a `tokenizer.json` file.
    #[cfg(feature = "exact-tokens")]
    pub fn exact_from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {e}"))?;
        Ok(TokenCounter::Exact(Box::new(tokenizer)))
    }

    /// Count tokens in `text`.
    pub fn count(&self, text: &str) -> usize {
        match self {
            TokenCounter::Approximate => {
                let by_chars = text.len() / 4;
                let by_words = text.split_whitespace().count() * 4 / 3;
                by_chars.max(by_words)
            }
            #[cfg(feature = "exact-tokens")]
            TokenCounter::Exact(tokenizer) => tokenizer
                .encode(text, false)
                .map(|enc| enc.len())
                .unwrap_or_else(|_| text.len() / 4),
        }
    }

    /// Truncate `text` from the end until it fits in `max_tokens`.
    /// Cuts at word boundaries; returns an empty string for a zero budget.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        // Proportional first cut, then trim until the count fits.
        let current = self.count(text).max(1);
        let mut keep = (words.len() * max_tokens / current).min(words.len());
        let mut candidate = words[..keep].join(" ");
        while keep > 0 && self.count(&candidate) > max_tokens {
            keep -= 1;
            candidate = words[..keep].join(" ");
        }
        candidate
    }

    /// Truncate `text` from the beginning, keeping its tail.
    pub fn truncate_tail(&self, text: &str, max_tokens: usize) -> String {
        if max_tokens == 0 {
            return String::new();
        }
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        let words: Vec<&str> = text.split_whitespace().collect();
        let current = self.count(text).max(1);
        let mut keep = (words.len() * max_tokens / current).min(words.len());
        let mut candidate = words[words.len() - keep..].join(" ");
        while keep > 0 && self.count(&candidate) > max_tokens {
            keep -= 1;
            candidate = words[words.len() - keep..].join(" ");
        }
        candidate
    }

    /// Beginning-and-end-preserving truncation: keep the first two thirds
    /// of the budget from the head and the final third from the tail, with
    /// an explicit elision marker between. The marker's own tokens are
    /// charged against the budget.
    pub fn smart_truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }

        let marker_tokens = self.count(ELISION_MARKER);
        if max_tokens <= marker_tokens {
            // Budget too small for head + marker + tail; plain head cut.
            return self.truncate(text, max_tokens);
        }

        let content_budget = max_tokens - marker_tokens;
        let head_budget = content_budget * 2 / 3;
        let tail_budget = content_budget - head_budget;

        let head = self.truncate(text, head_budget);
        let tail = self.truncate_tail(text, tail_budget);
        format!("{head}{ELISION_MARKER}{tail}")
    }
}
