//! Document chunking.
//!
//! Lengths are measured in characters; chunk offsets are byte offsets into the
//! document text, so `&document.text[chunk.start..chunk.end] == chunk.text`.

use serde::{Deserialize, Serialize};
use vassago_core::{Chunk, Document, Error, Result};

/// Chunk sizing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerConfig {
    /// Maximum chunk length in characters.
    pub max_length: usize,
    /// Characters shared with the previous chunk.
    pub overlap: usize,
    /// How far back from the hard limit to look for a sentence or word break.
    pub lookback: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self::new(1200, 200)
    }
}

impl ChunkerConfig {
    /// Creates a config with the default lookback of a quarter of `max_length`.
    #[must_use]
    pub fn new(max_length: usize, overlap: usize) -> Self {
        Self {
            max_length,
            overlap,
            lookback: (max_length / 4).max(1),
        }
    }

    /// Sets the break lookback window.
    #[must_use]
    pub fn with_lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback;
        self
    }

    /// Checks the sizing preconditions.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `max_length` is zero or `overlap >= max_length`.
    pub fn validate(&self) -> Result<()> {
        if self.max_length == 0 {
            return Err(Error::invalid_config("chunk max_length must be positive"));
        }
        if self.overlap >= self.max_length {
            return Err(Error::invalid_config(format!(
                "chunk overlap ({}) must be smaller than max_length ({})",
                self.overlap, self.max_length
            )));
        }
        Ok(())
    }
}

/// Splits documents into bounded, overlapping chunks.
#[derive(Debug, Clone)]
pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    /// Creates a chunker after validating its config.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the config is invalid.
    pub fn new(config: ChunkerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Returns the chunker configuration.
    #[must_use]
    pub fn config(&self) -> &ChunkerConfig {
        &self.config
    }

    /// Chunks a document. Empty text yields no chunks.
    #[must_use]
    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        let text = document.text.as_str();
        let chars: Vec<char> = text.chars().collect();
        let offsets: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .chain(std::iter::once(text.len()))
            .collect();

        let total = chars.len();
        let mut chunks = Vec::new();
        let mut start = 0;

        while start < total {
            let hard_end = (start + self.config.max_length).min(total);
            let end = if hard_end == total {
                total
            } else {
                self.find_break(&chars, start, hard_end)
            };

            chunks.push(Chunk::new(
                document,
                chunks.len(),
                offsets[start],
                offsets[end],
            ));

            if end == total {
                break;
            }

            // find_break never returns an end at or before start + overlap.
            start = end - self.config.overlap;
        }

        chunks
    }

    /// Picks the end of a chunk that starts at `start` and may not pass `hard_end`.
    fn find_break(&self, chars: &[char], start: usize, hard_end: usize) -> usize {
        let lo = hard_end
            .saturating_sub(self.config.lookback)
            .max(start + self.config.overlap + 1);
        if lo > hard_end {
            return hard_end;
        }

        let sentence = (lo..=hard_end)
            .rev()
            .find(|&end| matches!(chars[end - 1], '.' | '!' | '?') && chars[end].is_whitespace());
        if let Some(end) = sentence {
            return end;
        }

        (lo..=hard_end)
            .rev()
            .find(|&end| chars[end].is_whitespace())
            .unwrap_or(hard_end)
    }
}

/// Chunks `document` into segments of at most `max_length` characters sharing `overlap`.
///
/// # Errors
///
/// Returns `InvalidConfig` if `overlap >= max_length` or `max_length` is zero.
pub fn chunk(document: &Document, max_length: usize, overlap: usize) -> Result<Vec<Chunk>> {
    Ok(Chunker::new(ChunkerConfig::new(max_length, overlap))?.chunk(document))
}

/// Rebuilds the original text from ordered chunks by dropping overlap regions.
#[must_use]
pub fn reconstruct(chunks: &[Chunk]) -> String {
    let mut text = String::new();
    let mut covered = 0;

    for chunk in chunks {
        if chunk.end <= covered && !text.is_empty() {
            continue;
        }
        let skip = covered.saturating_sub(chunk.start);
        text.push_str(&chunk.text[skip..]);
        covered = covered.max(chunk.end);
    }

    text
}
