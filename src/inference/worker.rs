//! Generation worker: the decode loop, run on its own thread.
//!
//! The worker owns the decode session (and so the KV cache) and the device
//! permit. It publishes fragments into the bounded handoff channel, checks
//! for cancellation and the session deadline at every step boundary and
//! while waiting for channel space, releases its resources on every exit
//! path, and then places at most one end marker on the channel.

use crate::errors::CancelReason;
use crate::inference::logit_processors::{
    ProcessorChain, RepetitionPenaltyProcessor, SuppressTokensProcessor,
};
use crate::inference::sampling::{Sampler, SamplingParams};
use crate::inference::session::{
    EndOfStream, FinishReason, Fragment, SessionState, SessionStatus, StreamEvent,
};
use crate::model::{DevicePermit, Generator};
use crate::tokenizer::{IncrementalDecoder, TokenSequence, TokenizerAdapter};
use anyhow::Result;
use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

/// Everything the decode loop needs for one request.
#[derive(Debug, Clone)]
pub struct WorkerParams {
    pub prompt: TokenSequence,
    pub max_new_tokens: usize,
    pub stop_token_ids: HashSet<u32>,
    /// Tokens masked out before sampling.
    pub suppress_token_ids: HashSet<u32>,
    pub sampling: SamplingParams,
    pub deadline: Instant,
}

/// How the decode loop left off, before the end marker is built.
enum Exit {
    Finished(FinishReason),
    Interrupted(CancelReason),
}

enum Publish {
    Sent,
    Closed,
    Cancelled,
    TimedOut,
}

pub struct GenerationWorker {
    generator: Arc<dyn Generator>,
    tokenizer: Arc<dyn TokenizerAdapter>,
    params: WorkerParams,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    state: Arc<SessionState>,
    permit: Option<DevicePermit>,
    fragments: usize,
    generated: usize,
}

impl GenerationWorker {
    pub fn new(
        generator: Arc<dyn Generator>,
        tokenizer: Arc<dyn TokenizerAdapter>,
        params: WorkerParams,
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
        state: Arc<SessionState>,
        permit: Option<DevicePermit>,
    ) -> Self {
        Self {
            generator,
            tokenizer,
            params,
            tx,
            cancel,
            state,
            permit,
            fragments: 0,
            generated: 0,
        }
    }

    /// Start the decode loop on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("generation-{}", self.state.id()))
            .spawn(move || self.run())
    }

    /// Run to completion on the current thread.
    pub fn run(mut self) {
        let span = tracing::info_span!("generation", session = self.state.id());
        let _enter = span.enter();
        self.state.transition(SessionStatus::Running);
        tracing::debug!(
            prompt_tokens = self.params.prompt.len(),
            max_new_tokens = self.params.max_new_tokens,
            "decode loop starting"
        );

        // Blocking publishes race the session deadline on this timer.
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                drop(self.permit.take());
                let end = EndOfStream::Failed {
                    error: format!("worker timer unavailable: {}", e),
                    generated_tokens: 0,
                };
                self.state.transition(end.status());
                if self.tx.try_send(StreamEvent::End(end)).is_err() {
                    tracing::debug!("relay gone before end marker");
                }
                return;
            }
        };

        let outcome = catch_unwind(AssertUnwindSafe(|| self.decode_loop(&rt)));
        // Decode state is gone by now; free the device before announcing the end.
        drop(self.permit.take());

        let end = match outcome {
            Ok(Ok(Exit::Finished(reason))) => EndOfStream::Completed {
                reason,
                generated_tokens: self.generated,
            },
            Ok(Ok(Exit::Interrupted(reason))) => EndOfStream::Cancelled {
                reason,
                generated_tokens: self.generated,
            },
            Ok(Err(e)) => {
                tracing::error!("decode error: {:#}", e);
                EndOfStream::Failed {
                    error: e.to_string(),
                    generated_tokens: self.generated,
                }
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!("decode loop panicked: {}", msg);
                EndOfStream::Failed {
                    error: format!("decode loop panicked: {}", msg),
                    generated_tokens: self.generated,
                }
            }
        };
        self.state.transition(end.status());
        self.publish_end(&rt, end);
    }

    fn decode_loop(&mut self, rt: &Runtime) -> Result<Exit> {
        let mut session = self.generator.start_session()?;
        let mut decoder = IncrementalDecoder::new(Arc::clone(&self.tokenizer));
        let mut sampler = Sampler::new(self.params.sampling.clone());
        let mut chain = ProcessorChain::new();
        let suppress: HashSet<u32> = self
            .params
            .suppress_token_ids
            .difference(&self.params.stop_token_ids)
            .copied()
            .collect();
        if !suppress.is_empty() {
            chain.add(SuppressTokensProcessor::new(suppress));
        }
        let penalty = sampler.params().repetition_penalty;
        if (penalty - 1.0).abs() > 1e-6 {
            chain.add(RepetitionPenaltyProcessor::new(penalty));
        }

        let mut logits = Vec::new();
        for &token_id in self.params.prompt.ids() {
            if let Some(reason) = self.interrupted() {
                return Ok(Exit::Interrupted(reason));
            }
            logits = session.forward_step(token_id)?;
        }
        if logits.is_empty() {
            anyhow::bail!("prompt produced no logits");
        }

        let mut generated: Vec<u32> = Vec::with_capacity(self.params.max_new_tokens);
        let reason = loop {
            if let Some(reason) = self.interrupted() {
                return Ok(Exit::Interrupted(reason));
            }
            chain.process(&mut logits, &generated)?;
            let next = sampler.sample(&logits)?;
            if self.params.stop_token_ids.contains(&next) {
                break FinishReason::Stop;
            }
            generated.push(next);
            self.generated = generated.len();
            self.state.record_token();

            if let Some(text) = decoder.push(next)? {
                if !self.publish_fragment(rt, text) {
                    return Ok(Exit::Interrupted(self.cancel_reason()));
                }
            }
            if generated.len() >= self.params.max_new_tokens {
                break FinishReason::Length;
            }
            logits = session.forward_step(next)?;
        };
        drop(session);

        if let Some(text) = decoder.finish()? {
            if !self.publish_fragment(rt, text) {
                return Ok(Exit::Interrupted(self.cancel_reason()));
            }
        }
        Ok(Exit::Finished(reason))
    }

    /// Cancellation or deadline, checked at each step boundary.
    fn interrupted(&self) -> Option<CancelReason> {
        if self.cancel.is_cancelled() {
            return Some(self.cancel_reason());
        }
        if Instant::now() >= self.params.deadline {
            self.state.set_cancel_reason(CancelReason::Timeout);
            return Some(CancelReason::Timeout);
        }
        None
    }

    fn cancel_reason(&self) -> CancelReason {
        // A bare token cancellation comes from the server-wide shutdown token.
        self.state.cancel_reason().unwrap_or(if self.cancel.is_cancelled() {
            CancelReason::Shutdown
        } else {
            CancelReason::ClientDisconnected
        })
    }

    /// Hand a fragment to the relay, suspending while the channel is full.
    /// Returns false when the consumer is gone, the session was cancelled,
    /// or the deadline passed while waiting for space.
    fn publish_fragment(&mut self, rt: &Runtime, text: String) -> bool {
        let event = StreamEvent::Fragment(Fragment {
            index: self.fragments,
            text,
        });
        let tx = &self.tx;
        let cancel = &self.cancel;
        let deadline = tokio::time::Instant::from_std(self.params.deadline);
        let outcome = rt.block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Publish::Cancelled,
                res = tx.send(event) => match res {
                    Ok(()) => Publish::Sent,
                    Err(_) => Publish::Closed,
                },
                _ = tokio::time::sleep_until(deadline) => Publish::TimedOut,
            }
        });
        match outcome {
            Publish::Sent => {
                self.fragments += 1;
                self.state.record_published();
                true
            }
            Publish::TimedOut => {
                tracing::debug!("deadline passed with the channel full");
                self.state.set_cancel_reason(CancelReason::Timeout);
                false
            }
            Publish::Cancelled | Publish::Closed => false,
        }
    }

    /// Place the end marker, waiting for channel space while the relay is
    /// still reading and the deadline has not passed. Returns at once when
    /// the relay has closed the channel (consumer dropped, cancelled, or
    /// timed out). A marker that cannot be placed is left out; the consumer
    /// then reads the terminal state recorded on the session.
    fn publish_end(&self, rt: &Runtime, end: EndOfStream) {
        let event = match self.tx.try_send(StreamEvent::End(end)) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("relay gone before end marker");
                return;
            }
            Err(TrySendError::Full(event)) => event,
        };
        let tx = &self.tx;
        let deadline = tokio::time::Instant::from_std(self.params.deadline);
        let placed = rt.block_on(async {
            tokio::select! {
                biased;
                res = tx.send(event) => res.is_ok(),
                _ = tokio::time::sleep_until(deadline) => false,
            }
        });
        if !placed {
            tracing::debug!("end marker not placed; relay closed or stalled past the deadline");
        }
    }
}
