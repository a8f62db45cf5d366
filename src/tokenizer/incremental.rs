//! Incremental detokenization for streaming output.
//!
//! Only the window of tokens since the previous emission point is decoded on
//! each step, so the cost per token does not grow with the generated prefix.
//! Text is held back while it ends in an incomplete character (U+FFFD) and
//! released once the following token completes it.

use super::TokenizerAdapter;
use crate::errors::StreamError;
use std::sync::Arc;

/// Tokens held back waiting for a character to complete. A UTF-8 character
/// spans at most four bytes, so a longer run is invalid and is released.
const MAX_PENDING_TOKENS: usize = 4;

fn text_after(prefix_text: &str, new_text: &str) -> String {
    match new_text.get(prefix_text.len()..) {
        Some(d) => d.to_string(),
        None => String::from_utf8_lossy(&new_text.as_bytes()[prefix_text.len()..]).into_owned(),
    }
}

pub struct IncrementalDecoder {
    tokenizer: Arc<dyn TokenizerAdapter>,
    ids: Vec<u32>,
    /// Start of the decode window; text before it has been emitted.
    prefix_offset: usize,
    /// End of the last emitted text inside the window.
    read_offset: usize,
}

impl IncrementalDecoder {
    pub fn new(tokenizer: Arc<dyn TokenizerAdapter>) -> Self {
        Self {
            tokenizer,
            ids: Vec::new(),
            prefix_offset: 0,
            read_offset: 0,
        }
    }

    /// Add one generated token. Returns the newly completed text, if any.
    pub fn push(&mut self, id: u32) -> Result<Option<String>, StreamError> {
        self.ids.push(id);
        let (prefix_text, new_text) = self.decode_window()?;
        let pending = self.ids.len() - self.read_offset;
        let held = new_text.len() <= prefix_text.len() || new_text.ends_with('\u{FFFD}');
        if held && pending < MAX_PENDING_TOKENS {
            return Ok(None);
        }
        // Past the cap the held text can never complete; release it as is.
        let delta = if new_text.len() > prefix_text.len() {
            Some(text_after(&prefix_text, &new_text))
        } else {
            None
        };
        self.prefix_offset = self.read_offset;
        self.read_offset = self.ids.len();
        Ok(delta)
    }

    /// Flush whatever is still held back (e.g. a trailing partial character).
    pub fn finish(&mut self) -> Result<Option<String>, StreamError> {
        if self.read_offset == self.ids.len() {
            return Ok(None);
        }
        let (prefix_text, new_text) = self.decode_window()?;
        self.prefix_offset = self.ids.len();
        self.read_offset = self.ids.len();
        if new_text.len() <= prefix_text.len() {
            return Ok(None);
        }
        Ok(Some(text_after(&prefix_text, &new_text)))
    }

    /// Generated token ids seen so far.
    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    /// Number of tokens currently inside the decode window.
    pub fn window_len(&self) -> usize {
        self.ids.len() - self.prefix_offset
    }

    fn decode_window(&self) -> Result<(String, String), StreamError> {
        let prefix_text = if self.read_offset > self.prefix_offset {
            self.tokenizer
                .decode(&self.ids[self.prefix_offset..self.read_offset])?
        } else {
            String::new()
        };
        let new_text = self.tokenizer.decode(&self.ids[self.prefix_offset..])?;
        Ok((prefix_text, new_text))
    }
}
