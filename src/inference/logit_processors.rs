//! Logit processors: composable transformations before sampling.
//!
//! Processors can be chained: logits → proc1 → proc2 → sample.

use anyhow::Result;
use std::collections::HashSet;

/// Process logits in place before sampling (e.g. penalties, masking).
pub trait LogitProcessor: Send + Sync {
    /// Apply the processor. May modify `logits` and use `generated` for context.
    fn process(&self, logits: &mut [f32], generated: &[u32]) -> Result<()>;
}

/// Repetition penalty (transformers-style): scale down logits of already-generated tokens.
#[derive(Clone, Debug)]
pub struct RepetitionPenaltyProcessor {
    pub penalty: f32,
}

impl RepetitionPenaltyProcessor {
    pub fn new(penalty: f32) -> Self {
        Self { penalty }
    }
}

impl LogitProcessor for RepetitionPenaltyProcessor {
    fn process(&self, logits: &mut [f32], generated: &[u32]) -> Result<()> {
        if self.penalty <= 0.0 || (self.penalty - 1.0).abs() < 1e-6 {
            return Ok(());
        }
        let seen: HashSet<u32> = generated.iter().copied().collect();
        for tid in seen {
            if let Some(v) = logits.get_mut(tid as usize) {
                *v = if *v > 0.0 {
                    *v / self.penalty
                } else {
                    *v * self.penalty
                };
            }
        }
        Ok(())
    }
}

/// Masks tokens that must never be sampled (pad, bos, control tokens).
#[derive(Clone, Debug, Default)]
pub struct SuppressTokensProcessor {
    pub tokens: HashSet<u32>,
}

impl SuppressTokensProcessor {
    pub fn new(tokens: impl IntoIterator<Item = u32>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

impl LogitProcessor for SuppressTokensProcessor {
    fn process(&self, logits: &mut [f32], _generated: &[u32]) -> Result<()> {
        for &tid in &self.tokens {
            if let Some(v) = logits.get_mut(tid as usize) {
                *v = f32::NEG_INFINITY;
            }
        }
        Ok(())
    }
}

/// Ordered chain of processors.
#[derive(Default)]
pub struct ProcessorChain {
    processors: Vec<Box<dyn LogitProcessor>>,
}

impl ProcessorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<P: LogitProcessor + 'static>(&mut self, p: P) -> &mut Self {
        self.processors.push(Box::new(p));
        self
    }

    pub fn process(&self, logits: &mut [f32], generated: &[u32]) -> Result<()> {
        for p in &self.processors {
            p.process(logits, generated)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repetition_penalty_applies_once_per_token() {
        let p = RepetitionPenaltyProcessor::new(2.0);
        let mut logits = vec![4.0, -1.0, 1.0];
        p.process(&mut logits, &[0, 0, 1]).unwrap();
        assert_eq!(logits, vec![2.0, -2.0, 1.0]);
    }

    #[test]
    fn test_suppress_masks_tokens() {
        let mut chain = ProcessorChain::new();
        chain.add(SuppressTokensProcessor::new([0, 1]));
        let mut logits = vec![1.0, 1.0, 1.0];
        chain.process(&mut logits, &[]).unwrap();
        assert_eq!(logits[0], f32::NEG_INFINITY);
        assert_eq!(logits[1], f32::NEG_INFINITY);
        assert_eq!(logits[2], 1.0);
    }
}
