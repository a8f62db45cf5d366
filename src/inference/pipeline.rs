//! Request handling: validate a request, then wire a worker to a session.
//!
//! [`Pipeline`] is built once at startup from a ready generator, tokenizer,
//! and resolved generation config. Every accepted request gets its own
//! handoff channel, cancellation token, and decode session; nothing is
//! allocated for a request that fails validation.

use crate::config::GenerationConfig;
use crate::errors::StreamError;
use crate::inference::sampling::SamplingParams;
use crate::inference::session::{SessionState, StreamSession};
use crate::inference::streaming::Fragments;
use crate::inference::worker::{GenerationWorker, WorkerParams};
use crate::model::{DeviceGate, Generator};
use crate::monitoring::Telemetry;
use crate::tokenizer::{TokenSequence, TokenizerAdapter};
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One generation request, as received from a transport.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GenerationRequest {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub max_new_tokens: Option<usize>,
    /// Extra stop tokens for this request, on top of the service's stop set.
    /// Accepts a list, or a comma-separated string from form posts.
    #[serde(default, deserialize_with = "token_ids")]
    pub stop_token_ids: Vec<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl GenerationRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_max_new_tokens(mut self, n: usize) -> Self {
        self.max_new_tokens = Some(n);
        self
    }
}

fn token_ids<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        List(Vec<u32>),
        One(u32),
        Csv(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::List(ids) => Ok(ids),
        Raw::One(id) => Ok(vec![id]),
        Raw::Csv(s) => s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| {
                p.parse::<u32>()
                    .map_err(|_| serde::de::Error::custom(format!("invalid token id '{}'", p)))
            })
            .collect(),
    }
}

/// A request that passed validation, ready to be launched.
struct Job {
    prompt: TokenSequence,
    max_new_tokens: usize,
    stop_token_ids: HashSet<u32>,
    sampling: SamplingParams,
}

/// Process-wide entry point for starting generation sessions.
pub struct Pipeline {
    generator: Arc<dyn Generator>,
    tokenizer: Arc<dyn TokenizerAdapter>,
    config: GenerationConfig,
    device: DeviceGate,
    stop_token_ids: HashSet<u32>,
    suppress_token_ids: HashSet<u32>,
    max_context: usize,
    telemetry: Option<Arc<Telemetry>>,
    shutdown: CancellationToken,
    next_id: AtomicU64,
}

impl Pipeline {
    pub fn new(
        generator: Arc<dyn Generator>,
        tokenizer: Arc<dyn TokenizerAdapter>,
        config: GenerationConfig,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let info = generator.info();
        if info.vocab_size != tokenizer.vocab_size() {
            tracing::warn!(
                model_vocab = info.vocab_size,
                tokenizer_vocab = tokenizer.vocab_size(),
                "model and tokenizer vocabulary sizes differ"
            );
        }

        let mut stop_token_ids: HashSet<u32> = config.stop_token_ids.iter().copied().collect();
        if stop_token_ids.is_empty() {
            stop_token_ids.extend(tokenizer.eos_token_id());
        }
        if stop_token_ids.is_empty() {
            tracing::warn!(
                "no stop tokens configured; sessions end only at the token budget or timeout"
            );
        }

        let mut suppress_token_ids = tokenizer.special_token_ids();
        suppress_token_ids.extend(config.pad_token_id.or_else(|| tokenizer.pad_token_id()));

        tracing::info!(
            model = %info.name,
            vocab_size = info.vocab_size,
            max_context = info.max_context,
            stop_tokens = ?stop_token_ids,
            max_sessions = config.max_concurrent_sessions,
            "generation pipeline ready"
        );

        Ok(Self {
            device: DeviceGate::new(config.max_concurrent_sessions),
            generator,
            tokenizer,
            stop_token_ids,
            suppress_token_ids,
            max_context: info.max_context,
            config,
            telemetry: None,
            shutdown: CancellationToken::new(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn telemetry(&self) -> Option<&Arc<Telemetry>> {
        self.telemetry.as_ref()
    }

    pub fn config(&self) -> &GenerationConfig {
        &self.config
    }

    pub fn tokenizer(&self) -> &Arc<dyn TokenizerAdapter> {
        &self.tokenizer
    }

    pub fn stop_token_ids(&self) -> &HashSet<u32> {
        &self.stop_token_ids
    }

    pub fn device(&self) -> &DeviceGate {
        &self.device
    }

    /// Parent of every session's cancellation token. Cancelling it stops all
    /// in-flight sessions.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Check a request without touching the tokenizer or the model.
    pub fn validate(&self, req: &GenerationRequest) -> Result<(), StreamError> {
        if req.text.trim().is_empty() {
            return Err(StreamError::Validation("no input text provided".into()));
        }
        self.config.resolve_max_new_tokens(req.max_new_tokens)?;
        self.sampling_for(req).validate()?;
        let vocab = self.tokenizer.vocab_size();
        if let Some(&id) = req.stop_token_ids.iter().find(|&&id| id as usize >= vocab) {
            return Err(StreamError::Validation(format!(
                "stop token id {} outside vocabulary of {}",
                id, vocab
            )));
        }
        Ok(())
    }

    /// Validate, encode and launch a session for `req`.
    ///
    /// The worker is running by the time this returns; its fragments are read
    /// from the returned session.
    pub fn start(&self, req: GenerationRequest) -> Result<StreamSession, StreamError> {
        let result = self.prepare(&req).and_then(|job| self.launch(job));
        if let Err(e) = &result {
            if let Some(t) = &self.telemetry {
                if e.is_client_error() || matches!(e, StreamError::Busy) {
                    t.record_rejection(e);
                }
            }
        }
        result
    }

    /// Synchronous front end: the lazy fragment sequence for `text`.
    /// Must not be called from inside an async runtime.
    pub fn stream_blocking(&self, text: &str) -> Result<Fragments, StreamError> {
        self.start(GenerationRequest::new(text)).map(Fragments::new)
    }

    fn sampling_for(&self, req: &GenerationRequest) -> SamplingParams {
        let mut sampling = self.config.sampling.clone();
        if let Some(t) = req.temperature {
            sampling.temperature = t;
        }
        if req.top_p.is_some() {
            sampling.top_p = req.top_p;
        }
        if req.top_k.is_some() {
            sampling.top_k = req.top_k;
        }
        if req.seed.is_some() {
            sampling.seed = req.seed;
        }
        sampling
    }

    fn prepare(&self, req: &GenerationRequest) -> Result<Job, StreamError> {
        self.validate(req)?;
        let mut max_new_tokens = self.config.resolve_max_new_tokens(req.max_new_tokens)?;

        let prompt = self.tokenizer.encode(&req.text)?;
        if prompt.is_empty() {
            return Err(StreamError::Encoding("prompt encoded to no tokens".into()));
        }
        if prompt.len() >= self.max_context {
            return Err(StreamError::Validation(format!(
                "prompt is {} tokens; the model context holds {}",
                prompt.len(),
                self.max_context
            )));
        }
        let room = self.max_context - prompt.len();
        if max_new_tokens > room {
            tracing::debug!(requested = max_new_tokens, room, "token budget limited by context");
            max_new_tokens = room;
        }

        let mut stop_token_ids = self.stop_token_ids.clone();
        stop_token_ids.extend(req.stop_token_ids.iter().copied());

        Ok(Job {
            prompt,
            max_new_tokens,
            stop_token_ids,
            sampling: self.sampling_for(req),
        })
    }

    fn launch(&self, job: Job) -> Result<StreamSession, StreamError> {
        let permit = self.device.try_acquire()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let cancel = self.shutdown.child_token();
        let state = Arc::new(SessionState::new(id));
        let deadline = Instant::now() + self.config.session_timeout();

        tracing::info!(
            session = id,
            prompt_tokens = job.prompt.len(),
            max_new_tokens = job.max_new_tokens,
            "session accepted"
        );

        let worker = GenerationWorker::new(
            Arc::clone(&self.generator),
            Arc::clone(&self.tokenizer),
            WorkerParams {
                prompt: job.prompt,
                max_new_tokens: job.max_new_tokens,
                stop_token_ids: job.stop_token_ids,
                suppress_token_ids: self.suppress_token_ids.clone(),
                sampling: job.sampling,
                deadline,
            },
            tx,
            cancel.clone(),
            Arc::clone(&state),
            Some(permit),
        );
        let handle = worker.spawn()?;

        Ok(StreamSession::new(
            state,
            rx,
            cancel,
            handle,
            deadline,
            self.telemetry.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::create_demo_model_seeded;
    use crate::tokenizer::ByteTokenizer;

    fn pipeline(config: GenerationConfig) -> Pipeline {
        let model = create_demo_model_seeded(11).unwrap();
        Pipeline::new(Arc::new(model), Arc::new(ByteTokenizer::new()), config).unwrap()
    }

    #[test]
    fn test_blank_text_rejected() {
        let p = pipeline(GenerationConfig::default());
        let err = p.validate(&GenerationRequest::new("  \n\t ")).unwrap_err();
        assert!(matches!(err, StreamError::Validation(_)));
        assert_eq!(p.device().available(), 1);
    }

    #[test]
    fn test_zero_budget_rejected() {
        let p = pipeline(GenerationConfig::default());
        let req = GenerationRequest::new("Tarifin:").with_max_new_tokens(0);
        assert!(matches!(p.validate(&req), Err(StreamError::Validation(_))));
    }

    #[test]
    fn test_stop_set_defaults_to_eos() {
        let p = pipeline(GenerationConfig::default());
        assert!(p.stop_token_ids().contains(&ByteTokenizer::EOS));
    }

    #[test]
    fn test_out_of_vocab_stop_token_rejected() {
        let p = pipeline(GenerationConfig::default());
        let mut req = GenerationRequest::new("Tarifin:");
        req.stop_token_ids = vec![100_000];
        assert!(matches!(p.validate(&req), Err(StreamError::Validation(_))));
    }

    #[test]
    fn test_request_parses_csv_stop_ids() {
        let req: GenerationRequest =
            serde_json::from_str(r#"{"text":"x","stop_token_ids":"2, 13"}"#).unwrap();
        assert_eq!(req.stop_token_ids, vec![2, 13]);
        let req: GenerationRequest =
            serde_json::from_str(r#"{"text":"x","stop_token_ids":[5]}"#).unwrap();
        assert_eq!(req.stop_token_ids, vec![5]);
    }

    #[test]
    fn test_busy_when_device_taken() {
        let p = pipeline(GenerationConfig::default());
        let _held = p.device().try_acquire().unwrap();
        let err = p.start(GenerationRequest::new("Tarifin:")).unwrap_err();
        assert!(matches!(err, StreamError::Busy));
    }

    #[test]
    fn test_stream_blocking_completes() {
        let p = pipeline(GenerationConfig::default());
        let mut text = String::new();
        for f in p.stream_blocking("Tarifin: çorba").unwrap() {
            text.push_str(&f.unwrap().text);
        }
        assert!(!text.is_empty());
        assert_eq!(p.device().available(), 1);
    }
}
