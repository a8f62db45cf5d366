//! Generator backends and decode-device discipline.
//!
//! The streaming pipeline only sees [`Generator`]: a read-only, process-wide
//! capability that hands out per-session [`DecodeSession`]s. Each session owns
//! its KV cache; dropping the session releases it.

pub mod demo;
pub mod device;

pub use demo::{create_demo_model, create_demo_model_seeded, NgramModel, DEMO_CORPUS};
pub use device::{DeviceGate, DevicePermit};

use anyhow::Result;

/// Static description of a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
    pub name: String,
    pub vocab_size: usize,
    /// Maximum positions a session can hold (prompt + generated).
    pub max_context: usize,
}

/// A ready-to-use model bound to a checkpoint.
pub trait Generator: Send + Sync {
    fn info(&self) -> ModelInfo;

    /// Allocate decode state for one session.
    fn start_session(&self) -> Result<Box<dyn DecodeSession>>;
}

/// Decode state for one session. Not shared between sessions.
pub trait DecodeSession: Send {
    /// Feed one token at the next position; returns logits for the following token.
    fn forward_step(&mut self, token_id: u32) -> Result<Vec<f32>>;

    /// Number of positions processed so far.
    fn position(&self) -> usize;
}
