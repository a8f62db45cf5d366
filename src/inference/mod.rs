//! Streaming generation: sessions, the decode worker, and the relay.

pub mod cache;
pub mod logit_processors;
pub mod pipeline;
pub mod sampling;
pub mod session;
pub mod streaming;
pub mod worker;

pub use cache::KVCache;
pub use logit_processors::{LogitProcessor, ProcessorChain};
pub use pipeline::{GenerationRequest, Pipeline};
pub use sampling::{Sampler, SamplingParams};
pub use session::{
    EndOfStream, FinishReason, Fragment, SessionState, SessionStatus, StreamEvent, StreamSession,
};
pub use streaming::{Cumulative, Fragments, RelayBody, RelayStart, StreamRelay};
pub use worker::{GenerationWorker, WorkerParams};
