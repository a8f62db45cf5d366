//! Demo generator: a small n-gram language model fit from a text corpus.
//!
//! Used when no real checkpoint backend is configured. Counts are collected
//! once through the active tokenizer and are read-only afterwards; each
//! session only owns its KV cache.

use super::{DecodeSession, Generator, ModelInfo};
use crate::inference::cache::KVCache;
use crate::tokenizer::{ByteTokenizer, TokenizerAdapter};
use anyhow::{anyhow, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Built-in corpus of short Turkish recipes.
pub const DEMO_CORPUS: &str = include_str!("demo_corpus.txt");

/// Default context length for demo sessions.
pub const DEMO_MAX_CONTEXT: usize = 4096;

/// Upper bound of the seeded tie-breaking noise added to each weight.
const JITTER: f32 = 0.01;

type Distribution = Vec<(u32, f32)>;

struct NgramTables {
    name: String,
    vocab_size: usize,
    max_context: usize,
    unigram: Distribution,
    bigram: HashMap<u32, Distribution>,
    trigram: HashMap<(u32, u32), Distribution>,
}

/// Trigram model with bigram and unigram backoff over token ids.
#[derive(Clone)]
pub struct NgramModel {
    tables: Arc<NgramTables>,
}

impl NgramModel {
    /// Fit counts from `corpus`. Documents are separated by blank lines and
    /// each one ends with the tokenizer's EOS.
    pub fn fit(
        tokenizer: &dyn TokenizerAdapter,
        corpus: &str,
        seed: u64,
        max_context: usize,
    ) -> Result<Self> {
        let eos = tokenizer
            .eos_token_id()
            .ok_or_else(|| anyhow!("tokenizer has no EOS token"))?;

        let mut uni: BTreeMap<u32, u32> = BTreeMap::new();
        let mut bi: BTreeMap<u32, BTreeMap<u32, u32>> = BTreeMap::new();
        let mut tri: BTreeMap<(u32, u32), BTreeMap<u32, u32>> = BTreeMap::new();
        let mut max_id = 0u32;

        for doc in corpus.split("\n\n").map(str::trim).filter(|d| !d.is_empty()) {
            let mut ids = tokenizer.encode(&format!("{}\n", doc))?.ids().to_vec();
            ids.push(eos);
            for i in 1..ids.len() {
                let next = ids[i];
                max_id = max_id.max(next).max(ids[i - 1]);
                *uni.entry(next).or_default() += 1;
                *bi.entry(ids[i - 1]).or_default().entry(next).or_default() += 1;
                if i >= 2 {
                    *tri.entry((ids[i - 2], ids[i - 1]))
                        .or_default()
                        .entry(next)
                        .or_default() += 1;
                }
            }
        }
        if uni.is_empty() {
            anyhow::bail!("corpus produced no tokens");
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let unigram = weigh(&uni, &mut rng);
        let bigram = bi
            .iter()
            .map(|(&k, counts)| (k, weigh(counts, &mut rng)))
            .collect();
        let trigram = tri
            .iter()
            .map(|(&k, counts)| (k, weigh(counts, &mut rng)))
            .collect();

        Ok(Self {
            tables: Arc::new(NgramTables {
                name: format!("ngram-demo-{:x}", seed),
                vocab_size: tokenizer.vocab_size().max(max_id as usize + 1),
                max_context,
                unigram,
                bigram,
                trigram,
            }),
        })
    }
}

fn weigh(counts: &BTreeMap<u32, u32>, rng: &mut StdRng) -> Distribution {
    counts
        .iter()
        .map(|(&id, &c)| (id, (1.0 + c as f32).ln() + rng.gen_range(0.0..JITTER)))
        .collect()
}

impl Generator for NgramModel {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: self.tables.name.clone(),
            vocab_size: self.tables.vocab_size,
            max_context: self.tables.max_context,
        }
    }

    fn start_session(&self) -> Result<Box<dyn DecodeSession>> {
        Ok(Box::new(NgramSession {
            tables: Arc::clone(&self.tables),
            cache: KVCache::new(self.tables.max_context),
        }))
    }
}

struct NgramSession {
    tables: Arc<NgramTables>,
    cache: KVCache,
}

impl DecodeSession for NgramSession {
    fn forward_step(&mut self, token_id: u32) -> Result<Vec<f32>> {
        if token_id as usize >= self.tables.vocab_size {
            anyhow::bail!("token {} out of vocabulary range", token_id);
        }
        self.cache.append(token_id)?;
        let t = &self.tables;
        let dist = match self.cache.tail(2) {
            [a, b] => t.trigram.get(&(*a, *b)).or_else(|| t.bigram.get(b)),
            [b] => t.bigram.get(b),
            _ => None,
        }
        .unwrap_or(&t.unigram);

        let mut logits = vec![f32::NEG_INFINITY; t.vocab_size];
        for &(id, w) in dist {
            logits[id as usize] = w;
        }
        Ok(logits)
    }

    fn position(&self) -> usize {
        self.cache.current_length()
    }
}

/// Create the demo model over [`ByteTokenizer`] with a random seed.
pub fn create_demo_model() -> Result<NgramModel> {
    create_demo_model_seeded(rand::random::<u64>())
}

/// Create a deterministic demo model from a seed (for tests and golden outputs).
pub fn create_demo_model_seeded(seed: u64) -> Result<NgramModel> {
    NgramModel::fit(&ByteTokenizer::new(), DEMO_CORPUS, seed, DEMO_MAX_CONTEXT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::sampling::argmax;

    #[test]
    fn test_forward_step_returns_vocab_logits() {
        let model = create_demo_model_seeded(7).unwrap();
        let mut session = model.start_session().unwrap();
        let logits = session.forward_step(ByteTokenizer::BOS).unwrap();
        assert_eq!(logits.len(), ByteTokenizer::VOCAB_SIZE);
        assert!(logits.iter().any(|l| l.is_finite()));
        assert_eq!(session.position(), 1);
    }

    #[test]
    fn test_seeded_models_agree() {
        let a = create_demo_model_seeded(42).unwrap();
        let b = create_demo_model_seeded(42).unwrap();
        let mut sa = a.start_session().unwrap();
        let mut sb = b.start_session().unwrap();
        for byte in "Tarifin:".bytes() {
            let id = ByteTokenizer::byte_to_id(byte);
            assert_eq!(sa.forward_step(id).unwrap(), sb.forward_step(id).unwrap());
        }
    }

    #[test]
    fn test_greedy_continuation_is_valid_utf8() {
        let tok = ByteTokenizer::new();
        let model = create_demo_model_seeded(3).unwrap();
        let mut session = model.start_session().unwrap();
        let mut logits = Vec::new();
        for &id in tok.encode("Tavuk").unwrap().ids() {
            logits = session.forward_step(id).unwrap();
        }
        let mut bytes = Vec::new();
        for _ in 0..64 {
            let next = argmax(&logits).unwrap() as u32;
            if next == ByteTokenizer::EOS {
                break;
            }
            bytes.push(ByteTokenizer::id_to_byte(next).unwrap());
            logits = session.forward_step(next).unwrap();
        }
        // Complete multi-byte sequences only ever follow observed transitions.
        let valid_up_to = match std::str::from_utf8(&bytes) {
            Ok(_) => bytes.len(),
            Err(e) => e.valid_up_to(),
        };
        assert!(bytes.len() - valid_up_to < 4);
    }

    #[test]
    fn test_cache_full_is_an_error() {
        let model = NgramModel::fit(&ByteTokenizer::new(), DEMO_CORPUS, 1, 2).unwrap();
        let mut session = model.start_session().unwrap();
        session.forward_step(ByteTokenizer::BOS).unwrap();
        session.forward_step(ByteTokenizer::byte_to_id(b'a')).unwrap();
        assert!(session.forward_step(ByteTokenizer::byte_to_id(b'b')).is_err());
    }

    #[test]
    fn test_empty_corpus_rejected() {
        assert!(NgramModel::fit(&ByteTokenizer::new(), "\n\n  \n\n", 1, 16).is_err());
    }
}
