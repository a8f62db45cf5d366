//! # tarifin-stream
//!
//! Streaming text generation for a fine-tuned recipe language model.
//!
//! ## Architecture
//!
//! - **Tokenizer**: text ↔ token ids, with an incremental decoder that emits only new text
//! - **Generation worker**: the decode loop on its own thread, publishing fragments into a
//!   bounded handoff channel and ending with exactly one end-of-stream marker
//! - **Stream relay**: drains the channel toward an HTTP body or a synchronous iterator
//! - **Pipeline**: validates requests and wires one worker to one session per request
//! - **Server**: `POST /generate` streamed as chunked `text/plain`

pub mod config;
pub mod errors;
pub mod inference;
pub mod model;
pub mod monitoring;
pub mod server;
pub mod tokenizer;

pub use config::{CheckpointGenerationConfig, GenerationConfig, ServerConfig, ServiceConfig};
pub use errors::{CancelReason, StreamError};
pub use inference::{
    EndOfStream, Fragment, Fragments, GenerationRequest, Pipeline, SamplingParams, SessionStatus,
    StreamEvent, StreamRelay, StreamSession,
};
pub use model::{create_demo_model, create_demo_model_seeded, DecodeSession, Generator, NgramModel};
pub use monitoring::Telemetry;
pub use tokenizer::{ByteTokenizer, HfTokenizer, IncrementalDecoder, TokenSequence, TokenizerAdapter};
