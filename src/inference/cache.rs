//! KV cache for fast autoregressive generation.

use anyhow::Result;

/// Per-session decode cache: one entry per processed position.
///
/// The demo backend attends only to its recent context, so an entry is the
/// token id seen at that position. Capacity is fixed at creation.
#[derive(Clone, Debug)]
pub struct KVCache {
    entries: Vec<u32>,
    max_length: usize,
}

impl KVCache {
    pub fn new(max_length: usize) -> Self {
        Self {
            entries: Vec::with_capacity(max_length.min(4096)),
            max_length,
        }
    }

    /// Append the state for the next position.
    pub fn append(&mut self, token_id: u32) -> Result<()> {
        if self.entries.len() >= self.max_length {
            anyhow::bail!("KV cache full ({} positions)", self.max_length);
        }
        self.entries.push(token_id);
        Ok(())
    }

    /// Current sequence length in cache.
    pub fn current_length(&self) -> usize {
        self.entries.len()
    }

    /// The last `n` positions (fewer at the start of a sequence).
    pub fn tail(&self, n: usize) -> &[u32] {
        let start = self.entries.len().saturating_sub(n);
        &self.entries[start..]
    }
}
