//! Next-token selection: greedy, top-k, and top-p (nucleus) with temperature.

use crate::errors::StreamError;
use anyhow::Result;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Decoding parameters. The default (temperature 0) is greedy decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    /// 0 selects greedy decoding.
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub top_p: Option<f32>,
    /// 1.0 disables the penalty.
    pub repetition_penalty: f32,
    /// Fixed seed for reproducible sampling.
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_k: None,
            top_p: None,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn validate(&self) -> Result<(), StreamError> {
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(StreamError::Validation(
                "temperature must be a finite number >= 0".into(),
            ));
        }
        if let Some(p) = self.top_p {
            if !(p > 0.0 && p <= 1.0) {
                return Err(StreamError::Validation("top_p must be in (0, 1]".into()));
            }
        }
        if self.top_k == Some(0) {
            return Err(StreamError::Validation("top_k must be > 0".into()));
        }
        if !self.repetition_penalty.is_finite() || self.repetition_penalty <= 0.0 {
            return Err(StreamError::Validation(
                "repetition_penalty must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature < 1e-6
    }
}

/// Per-session sampler; owns its RNG so sessions never share random state.
pub struct Sampler {
    params: SamplingParams,
    rng: StdRng,
}

impl Sampler {
    pub fn new(params: SamplingParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { params, rng }
    }

    pub fn params(&self) -> &SamplingParams {
        &self.params
    }

    /// Pick the next token id from (already processed) logits.
    pub fn sample(&mut self, logits: &[f32]) -> Result<u32> {
        if logits.is_empty() {
            anyhow::bail!("empty logits");
        }
        let t = self.params.temperature;
        let id = if self.params.is_greedy() {
            argmax(logits).unwrap_or(0)
        } else if let Some(p) = self.params.top_p {
            let k = self.params.top_k.unwrap_or(logits.len());
            sample_top_p(logits, k, p, t, &mut self.rng)?
        } else {
            let k = self.params.top_k.unwrap_or(logits.len());
            sample_top_k(logits, k, t, &mut self.rng)?
        };
        Ok(id as u32)
    }
}

/// Argmax over a slice of f32.
pub fn argmax(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
        .map(|(i, _)| i)
}

/// Logits sorted descending after temperature scaling, truncated to `k`.
fn ranked(logits: &[f32], k: usize, temperature: f32) -> Vec<(usize, f32)> {
    let t = temperature.max(1e-6);
    let mut indexed: Vec<(usize, f32)> = logits
        .iter()
        .enumerate()
        .filter(|(_, v)| **v > f32::NEG_INFINITY)
        .map(|(i, &v)| (i, v / t))
        .collect();
    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    indexed.truncate(k.max(1));
    indexed
}

/// Sample one token using top-k: keep top k logits, softmax, sample.
pub fn sample_top_k(logits: &[f32], k: usize, temperature: f32, rng: &mut impl Rng) -> Result<usize> {
    let indexed = ranked(logits, k, temperature);
    if indexed.is_empty() {
        anyhow::bail!("no token has a finite logit");
    }
    let max_ln = indexed[0].1;
    let sum: f32 = indexed.iter().map(|(_, v)| (v - max_ln).exp()).sum();
    let r: f32 = rng.gen();
    let mut cum = 0.0f32;
    for (idx, v) in &indexed {
        cum += (v - max_ln).exp() / sum;
        if r <= cum {
            return Ok(*idx);
        }
    }
    Ok(indexed.last().map(|(i, _)| *i).unwrap_or(0))
}

/// Sample one token using top-p: smallest set (within the top k) whose
/// cumulative probability >= p.
pub fn sample_top_p(
    logits: &[f32],
    k: usize,
    p: f32,
    temperature: f32,
    rng: &mut impl Rng,
) -> Result<usize> {
    let indexed = ranked(logits, k, temperature);
    if indexed.is_empty() {
        anyhow::bail!("no token has a finite logit");
    }
    let max_ln = indexed[0].1;
    let exp: Vec<f32> = indexed.iter().map(|(_, v)| (v - max_ln).exp()).collect();
    let sum_all: f32 = exp.iter().sum();
    let probs: Vec<f32> = exp.iter().map(|e| e / sum_all).collect();

    let mut cum = 0.0f32;
    let mut n = 0;
    for (i, &pr) in probs.iter().enumerate() {
        cum += pr;
        n = i + 1;
        if cum >= p {
            break;
        }
    }
    let top_n = n.max(1);
    let sum_top: f32 = probs[..top_n].iter().sum();
    let r: f32 = rng.gen();
    let mut cum = 0.0f32;
    for (i, &pr) in probs[..top_n].iter().enumerate() {
        cum += pr / sum_top;
        if r <= cum {
            return Ok(indexed[i].0);
        }
    }
    Ok(indexed[top_n - 1].0)
}
