//! Stream sessions: the handoff channel, its events, and the session state machine.
//!
//! A session is `Created → Running → {Completed, Failed, Cancelled}`. Terminal
//! states are absorbing: the first terminal transition wins and every later
//! attempt is ignored.

use crate::errors::CancelReason;
use crate::monitoring::Telemetry;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionStatus {
    Created = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::Completed => "completed",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionStatus::Created,
            1 => SessionStatus::Running,
            2 => SessionStatus::Completed,
            3 => SessionStatus::Failed,
            _ => SessionStatus::Cancelled,
        }
    }
}

/// Why a completed session stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// A stop token was produced.
    Stop,
    /// The token budget was used up.
    Length,
}

impl FinishReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
        }
    }
}

/// Incremental decoded text, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Position in the session's fragment sequence, starting at 0.
    pub index: usize,
    pub text: String,
}

/// Terminal marker: nothing follows it on the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum EndOfStream {
    Completed {
        reason: FinishReason,
        generated_tokens: usize,
    },
    Failed {
        error: String,
        generated_tokens: usize,
    },
    Cancelled {
        reason: CancelReason,
        generated_tokens: usize,
    },
}

impl EndOfStream {
    pub fn status(&self) -> SessionStatus {
        match self {
            EndOfStream::Completed { .. } => SessionStatus::Completed,
            EndOfStream::Failed { .. } => SessionStatus::Failed,
            EndOfStream::Cancelled { .. } => SessionStatus::Cancelled,
        }
    }

    pub fn generated_tokens(&self) -> usize {
        match self {
            EndOfStream::Completed {
                generated_tokens, ..
            }
            | EndOfStream::Failed {
                generated_tokens, ..
            }
            | EndOfStream::Cancelled {
                generated_tokens, ..
            } => *generated_tokens,
        }
    }
}

/// Item carried by the handoff channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Fragment(Fragment),
    End(EndOfStream),
}

const NO_REASON: u8 = u8::MAX;

fn encode_reason(r: CancelReason) -> u8 {
    match r {
        CancelReason::ClientDisconnected => 0,
        CancelReason::Timeout => 1,
        CancelReason::Shutdown => 2,
    }
}

fn decode_reason(v: u8) -> Option<CancelReason> {
    match v {
        0 => Some(CancelReason::ClientDisconnected),
        1 => Some(CancelReason::Timeout),
        2 => Some(CancelReason::Shutdown),
        _ => None,
    }
}

/// Status and counters shared by the worker and the consumer of one session.
#[derive(Debug)]
pub struct SessionState {
    id: u64,
    status: AtomicU8,
    cancel_reason: AtomicU8,
    tokens_generated: AtomicUsize,
    fragments_published: AtomicUsize,
    fragments_delivered: AtomicUsize,
    started: Instant,
}

impl SessionState {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            status: AtomicU8::new(SessionStatus::Created as u8),
            cancel_reason: AtomicU8::new(NO_REASON),
            tokens_generated: AtomicUsize::new(0),
            fragments_published: AtomicUsize::new(0),
            fragments_delivered: AtomicUsize::new(0),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Move to `to` if the transition is legal. Returns false when the
    /// session is already terminal or the move would go backwards.
    pub fn transition(&self, to: SessionStatus) -> bool {
        let mut current = self.status.load(Ordering::Acquire);
        loop {
            let from = SessionStatus::from_u8(current);
            let legal = match (from, to) {
                (SessionStatus::Created, SessionStatus::Running) => true,
                (SessionStatus::Created | SessionStatus::Running, t) => t.is_terminal(),
                _ => false,
            };
            if !legal {
                return false;
            }
            match self.status.compare_exchange(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// First recorded cancellation reason, if any.
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        decode_reason(self.cancel_reason.load(Ordering::Acquire))
    }

    pub(crate) fn set_cancel_reason(&self, reason: CancelReason) {
        let _ = self.cancel_reason.compare_exchange(
            NO_REASON,
            encode_reason(reason),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn tokens_generated(&self) -> usize {
        self.tokens_generated.load(Ordering::Relaxed)
    }

    pub(crate) fn record_token(&self) {
        self.tokens_generated.fetch_add(1, Ordering::Relaxed);
    }

    /// Fragments the worker has handed to the channel.
    pub fn fragments_published(&self) -> usize {
        self.fragments_published.load(Ordering::Acquire)
    }

    pub(crate) fn record_published(&self) {
        self.fragments_published.fetch_add(1, Ordering::AcqRel);
    }

    /// Fragments the consumer has taken off the channel.
    pub fn fragments_delivered(&self) -> usize {
        self.fragments_delivered.load(Ordering::Acquire)
    }

    pub(crate) fn record_delivered(&self) {
        self.fragments_delivered.fetch_add(1, Ordering::AcqRel);
    }

    /// Fragments sitting in the channel right now.
    pub fn in_flight(&self) -> usize {
        self.fragments_published()
            .saturating_sub(self.fragments_delivered())
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }
}

/// Consumer end of one generation: the receive side of the handoff channel,
/// the worker's cancellation token and thread handle.
///
/// Dropping a session before its end marker cancels the worker.
pub struct StreamSession {
    state: Arc<SessionState>,
    rx: mpsc::Receiver<StreamEvent>,
    cancel: CancellationToken,
    worker: Option<JoinHandle<()>>,
    deadline: Instant,
    telemetry: Option<Arc<Telemetry>>,
    finished: bool,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("deadline", &self.deadline)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    pub(crate) fn new(
        state: Arc<SessionState>,
        rx: mpsc::Receiver<StreamEvent>,
        cancel: CancellationToken,
        worker: JoinHandle<()>,
        deadline: Instant,
        telemetry: Option<Arc<Telemetry>>,
    ) -> Self {
        if let Some(t) = &telemetry {
            t.record_session_start();
        }
        Self {
            state,
            rx,
            cancel,
            worker: Some(worker),
            deadline,
            telemetry,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.state.id()
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub fn status(&self) -> SessionStatus {
        self.state.status()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Receive the next event. Suspends while the channel is empty and
    /// yields a `Cancelled { Timeout }` marker once the session deadline passes.
    ///
    /// Returns `None` after the end marker has been returned.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let deadline = tokio::time::Instant::from_std(self.deadline);
        let received = tokio::select! {
            ev = self.rx.recv() => Some(ev),
            _ = tokio::time::sleep_until(deadline) => None,
        };
        let event = match received {
            Some(ev) => ev,
            None => {
                self.interrupt(CancelReason::Timeout);
                Some(StreamEvent::End(EndOfStream::Cancelled {
                    reason: CancelReason::Timeout,
                    generated_tokens: self.state.tokens_generated(),
                }))
            }
        };
        Some(self.observe(event))
    }

    /// Blocking variant of [`recv`](Self::recv) for synchronous front ends.
    /// Must not be called from inside an async runtime.
    pub fn blocking_recv(&mut self) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }
        let event = self.rx.blocking_recv();
        Some(self.observe(event))
    }

    /// Stop the worker. The reason is kept on the session state; the worker
    /// notices at its next decode step.
    pub fn cancel(&mut self, reason: CancelReason) {
        if self.finished {
            return;
        }
        self.interrupt(reason);
        let end = EndOfStream::Cancelled {
            reason,
            generated_tokens: self.state.tokens_generated(),
        };
        self.finish(&end);
    }

    fn interrupt(&mut self, reason: CancelReason) {
        self.state.set_cancel_reason(reason);
        self.cancel.cancel();
        self.rx.close();
    }

    fn observe(&mut self, event: Option<StreamEvent>) -> StreamEvent {
        match event {
            Some(StreamEvent::Fragment(f)) => {
                self.state.record_delivered();
                StreamEvent::Fragment(f)
            }
            Some(StreamEvent::End(end)) => {
                self.finish(&end);
                StreamEvent::End(end)
            }
            None => {
                // Sender dropped without an end marker. A worker that gave up
                // on a stalled consumer has already recorded why it stopped.
                let generated_tokens = self.state.tokens_generated();
                let end = match (self.state.status(), self.state.cancel_reason()) {
                    (SessionStatus::Cancelled, Some(reason)) => EndOfStream::Cancelled {
                        reason,
                        generated_tokens,
                    },
                    _ => EndOfStream::Failed {
                        error: "generation worker exited without end-of-stream".to_string(),
                        generated_tokens,
                    },
                };
                self.finish(&end);
                StreamEvent::End(end)
            }
        }
    }

    fn finish(&mut self, end: &EndOfStream) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.state.transition(end.status());
        let status = self.state.status();
        if let Some(t) = &self.telemetry {
            t.record_session_end(
                status,
                end.generated_tokens(),
                self.state.fragments_delivered(),
                self.state.elapsed_ms(),
            );
        }
        match end {
            EndOfStream::Failed { error, .. } => {
                tracing::warn!(session = self.state.id(), "generation failed: {}", error)
            }
            EndOfStream::Cancelled { reason, .. } => {
                tracing::info!(session = self.state.id(), "generation cancelled: {}", reason)
            }
            EndOfStream::Completed {
                reason,
                generated_tokens,
            } => tracing::info!(
                session = self.state.id(),
                finish_reason = reason.as_str(),
                tokens = generated_tokens,
                elapsed_ms = self.state.elapsed_ms(),
                "generation completed"
            ),
        }
    }

    /// Wait for the worker thread to exit. Only call once the session has
    /// finished or been cancelled; the worker exits at its next step boundary.
    pub fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                tracing::error!(session = self.state.id(), "generation worker panicked");
            }
        }
    }

    /// True once the worker thread has returned.
    pub fn worker_exited(&self) -> bool {
        self.worker.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel(CancelReason::ClientDisconnected);
        }
        // Never block here: a worker mid-step is left to exit on its own.
        if self.worker_exited() {
            self.join();
        }
    }
}
