//! Scripted generator used by the integration tests.
//!
//! The generator replays a fixed token script after the prompt and counts
//! sessions and decode steps so tests can check that resources are released.

#![allow(dead_code)]

use anyhow::{bail, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tarifin_stream::config::GenerationConfig;
use tarifin_stream::inference::Pipeline;
use tarifin_stream::model::{DecodeSession, Generator, ModelInfo};
use tarifin_stream::tokenizer::{ByteTokenizer, TokenizerAdapter};

#[derive(Default)]
pub struct Counters {
    pub sessions_started: AtomicUsize,
    pub sessions_live: AtomicUsize,
    pub steps: AtomicUsize,
}

impl Counters {
    pub fn started(&self) -> usize {
        self.sessions_started.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.sessions_live.load(Ordering::SeqCst)
    }

    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct ScriptedGenerator {
    /// Forward steps spent on the prompt, including BOS.
    pub prompt_len: usize,
    /// Tokens produced after the prompt, in order.
    pub script: Vec<u32>,
    /// Produced once the script runs out.
    pub fallback: u32,
    /// Generated-token index whose logits fail to compute.
    pub fail_at: Option<usize>,
    pub panic_at: Option<usize>,
    pub step_delay: Duration,
    /// Generated-token index whose logits take this long to compute.
    pub stall_at: Option<(usize, Duration)>,
    pub counters: Arc<Counters>,
}

impl ScriptedGenerator {
    pub fn new(prompt: &str) -> Self {
        Self {
            prompt_len: prompt_len(prompt),
            script: Vec::new(),
            fallback: ByteTokenizer::byte_to_id(b'a'),
            fail_at: None,
            panic_at: None,
            step_delay: Duration::ZERO,
            stall_at: None,
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn script_text(mut self, text: &str) -> Self {
        self.script = text.bytes().map(ByteTokenizer::byte_to_id).collect();
        self
    }

    pub fn script_ids(mut self, ids: Vec<u32>) -> Self {
        self.script = ids;
        self
    }

    pub fn fail_at(mut self, index: usize) -> Self {
        self.fail_at = Some(index);
        self
    }

    pub fn panic_at(mut self, index: usize) -> Self {
        self.panic_at = Some(index);
        self
    }

    pub fn step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn stall_at(mut self, index: usize, delay: Duration) -> Self {
        self.stall_at = Some((index, delay));
        self
    }
}

impl Generator for ScriptedGenerator {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            name: "scripted".to_string(),
            vocab_size: ByteTokenizer::VOCAB_SIZE,
            max_context: 4096,
        }
    }

    fn start_session(&self) -> Result<Box<dyn DecodeSession>> {
        self.counters.sessions_started.fetch_add(1, Ordering::SeqCst);
        self.counters.sessions_live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedSession {
            source: self.clone(),
            calls: 0,
        }))
    }
}

struct ScriptedSession {
    source: ScriptedGenerator,
    calls: usize,
}

impl DecodeSession for ScriptedSession {
    fn forward_step(&mut self, _token_id: u32) -> Result<Vec<f32>> {
        self.calls += 1;
        self.source.counters.steps.fetch_add(1, Ordering::SeqCst);
        if !self.source.step_delay.is_zero() {
            std::thread::sleep(self.source.step_delay);
        }
        let mut logits = vec![f32::NEG_INFINITY; ByteTokenizer::VOCAB_SIZE];
        if self.calls < self.source.prompt_len {
            logits[0] = 0.0;
            return Ok(logits);
        }
        let index = self.calls - self.source.prompt_len;
        if self.source.fail_at == Some(index) {
            bail!("scripted failure at token {}", index);
        }
        if self.source.panic_at == Some(index) {
            panic!("scripted panic at token {}", index);
        }
        if let Some((at, delay)) = self.source.stall_at {
            if at == index {
                std::thread::sleep(delay);
            }
        }
        let next = self
            .source
            .script
            .get(index)
            .copied()
            .unwrap_or(self.source.fallback);
        logits[next as usize] = 0.0;
        Ok(logits)
    }

    fn position(&self) -> usize {
        self.calls
    }
}

impl Drop for ScriptedSession {
    fn drop(&mut self) {
        self.source.counters.sessions_live.fetch_sub(1, Ordering::SeqCst);
    }
}

pub fn prompt_len(prompt: &str) -> usize {
    ByteTokenizer::new().encode(prompt).unwrap().len()
}

pub fn pipeline(generator: &ScriptedGenerator, config: GenerationConfig) -> Pipeline {
    Pipeline::new(
        Arc::new(generator.clone()),
        Arc::new(ByteTokenizer::new()),
        config,
    )
    .unwrap()
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    cond()
}
