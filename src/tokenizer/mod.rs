//! Tokenizer integration for encode/decode.

pub mod incremental;

pub use incremental::IncrementalDecoder;

use crate::errors::StreamError;
use std::collections::HashSet;
use std::path::Path;

/// Text ↔ token-id conversion used by the generation pipeline.
///
/// Implementations are immutable after construction and shared across sessions.
pub trait TokenizerAdapter: Send + Sync {
    /// Encode text into a token sequence (including any BOS the model expects).
    fn encode(&self, text: &str) -> Result<TokenSequence, StreamError>;

    /// Decode ids to text, skipping special tokens.
    fn decode(&self, ids: &[u32]) -> Result<String, StreamError>;

    fn vocab_size(&self) -> usize;

    fn eos_token_id(&self) -> Option<u32>;

    fn pad_token_id(&self) -> Option<u32> {
        None
    }

    /// Ids that never render as text (pad, bos, eos, control tokens).
    fn special_token_ids(&self) -> HashSet<u32>;
}

/// Encoded prompt. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    ids: Vec<u32>,
}

impl TokenSequence {
    pub fn new(ids: Vec<u32>) -> Self {
        Self { ids }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Token names probed, in order, when a tokenizer file does not say which id is EOS.
const EOS_CANDIDATES: &[&str] = &["</s>", "<|endoftext|>", "<|im_end|>", "<eos>", "<|eot_id|>"];
const PAD_CANDIDATES: &[&str] = &["<pad>", "[PAD]", "<|pad|>"];

/// Wrapper around HuggingFace tokenizers (`tokenizer.json`).
pub struct HfTokenizer {
    tokenizer: tokenizers::Tokenizer,
    eos_token_id: Option<u32>,
    pad_token_id: Option<u32>,
    special: HashSet<u32>,
}

impl HfTokenizer {
    /// Load tokenizer from a JSON file (e.g. tokenizer.json).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, StreamError> {
        let tokenizer = tokenizers::Tokenizer::from_file(path.as_ref())
            .map_err(|e| StreamError::Encoding(e.to_string()))?;
        let eos_token_id = EOS_CANDIDATES
            .iter()
            .find_map(|t| tokenizer.token_to_id(t));
        let pad_token_id = PAD_CANDIDATES
            .iter()
            .find_map(|t| tokenizer.token_to_id(t))
            // same fallback as the fine-tune: pad = eos
            .or(eos_token_id);
        let special = tokenizer
            .get_added_tokens_decoder()
            .into_iter()
            .filter(|(_, tok)| tok.special)
            .map(|(id, _)| id)
            .collect();
        Ok(Self {
            tokenizer,
            eos_token_id,
            pad_token_id,
            special,
        })
    }
}

impl TokenizerAdapter for HfTokenizer {
    fn encode(&self, text: &str) -> Result<TokenSequence, StreamError> {
        let encoding = self
            .tokenizer
            .encode(text, true)
            .map_err(|e| StreamError::Encoding(e.to_string()))?;
        Ok(TokenSequence::new(encoding.get_ids().to_vec()))
    }

    fn decode(&self, ids: &[u32]) -> Result<String, StreamError> {
        self.tokenizer
            .decode(ids, true)
            .map_err(|e| StreamError::Encoding(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_token_id
    }

    fn special_token_ids(&self) -> HashSet<u32> {
        self.special.clone()
    }
}

/// Byte-level tokenizer: one token per UTF-8 byte, three reserved ids.
///
/// Needs no vocabulary file, so it backs the demo model and the test suite.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const PAD: u32 = 0;
    pub const BOS: u32 = 1;
    pub const EOS: u32 = 2;
    /// Id of byte 0x00.
    pub const BYTE_OFFSET: u32 = 3;
    pub const VOCAB_SIZE: usize = 256 + Self::BYTE_OFFSET as usize;

    pub fn new() -> Self {
        Self
    }

    pub fn byte_to_id(b: u8) -> u32 {
        b as u32 + Self::BYTE_OFFSET
    }

    pub fn id_to_byte(id: u32) -> Option<u8> {
        id.checked_sub(Self::BYTE_OFFSET)
            .and_then(|b| u8::try_from(b).ok())
    }
}

impl TokenizerAdapter for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<TokenSequence, StreamError> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        ids.push(Self::BOS);
        ids.extend(text.bytes().map(Self::byte_to_id));
        Ok(TokenSequence::new(ids))
    }

    fn decode(&self, ids: &[u32]) -> Result<String, StreamError> {
        let mut bytes = Vec::with_capacity(ids.len());
        for &id in ids {
            if id < Self::BYTE_OFFSET {
                continue;
            }
            match Self::id_to_byte(id) {
                Some(b) => bytes.push(b),
                None => {
                    return Err(StreamError::Encoding(format!(
                        "token {} out of vocabulary range",
                        id
                    )))
                }
            }
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }

    fn eos_token_id(&self) -> Option<u32> {
        Some(Self::EOS)
    }

    fn pad_token_id(&self) -> Option<u32> {
        Some(Self::PAD)
    }

    fn special_token_ids(&self) -> HashSet<u32> {
        [Self::PAD, Self::BOS, Self::EOS].into_iter().collect()
    }
}
