//! Observability and Prometheus metrics for tarifin-stream.

use crate::errors::StreamError;
use crate::inference::session::SessionStatus;
use std::sync::atomic::{AtomicU64, Ordering};

/// Session duration histogram buckets (milliseconds).
const LATENCY_BUCKETS_MS: &[f64] = &[
    50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0, 60000.0,
];

/// Session counters and latency histogram, exported in Prometheus text format.
#[derive(Default)]
pub struct Telemetry {
    sessions_started: AtomicU64,
    sessions_completed: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_cancelled: AtomicU64,
    validation_rejections: AtomicU64,
    busy_rejections: AtomicU64,
    token_counter: AtomicU64,
    fragment_counter: AtomicU64,
    /// Cumulative session duration in microseconds.
    latency_sum_us: AtomicU64,
    /// Bucket counts: index i = sessions with duration <= LATENCY_BUCKETS_MS[i].
    bucket_counts: [AtomicU64; 10],
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_session_start(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request refused before any session was created.
    pub fn record_rejection(&self, err: &StreamError) {
        match err {
            StreamError::Busy => self.busy_rejections.fetch_add(1, Ordering::Relaxed),
            _ => self.validation_rejections.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// Record a session reaching a terminal state.
    pub fn record_session_end(
        &self,
        status: SessionStatus,
        tokens: usize,
        fragments: usize,
        duration_ms: f64,
    ) {
        let counter = match status {
            SessionStatus::Completed => &self.sessions_completed,
            SessionStatus::Failed => &self.sessions_failed,
            SessionStatus::Cancelled => &self.sessions_cancelled,
            _ => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.token_counter
            .fetch_add(tokens as u64, Ordering::Relaxed);
        self.fragment_counter
            .fetch_add(fragments as u64, Ordering::Relaxed);
        self.latency_sum_us
            .fetch_add((duration_ms * 1000.0) as u64, Ordering::Relaxed);
        for (i, &bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if duration_ms <= bound {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn sessions_ended(&self) -> u64 {
        self.sessions_completed.load(Ordering::Relaxed)
            + self.sessions_failed.load(Ordering::Relaxed)
            + self.sessions_cancelled.load(Ordering::Relaxed)
    }

    pub fn validation_rejections(&self) -> u64 {
        self.validation_rejections.load(Ordering::Relaxed)
    }

    /// Export metrics in Prometheus text exposition format.
    pub fn export_metrics(&self) -> String {
        let started = self.sessions_started.load(Ordering::Relaxed);
        let ended = self.sessions_ended();
        let sum_us = self.latency_sum_us.load(Ordering::Relaxed);

        let mut out = String::new();
        out.push_str("# HELP tarifin_sessions_started_total Generation sessions started.\n");
        out.push_str("# TYPE tarifin_sessions_started_total counter\n");
        out.push_str(&format!("tarifin_sessions_started_total {}\n", started));

        out.push_str("# HELP tarifin_sessions_total Generation sessions by terminal status.\n");
        out.push_str("# TYPE tarifin_sessions_total counter\n");
        for (status, counter) in [
            ("completed", &self.sessions_completed),
            ("failed", &self.sessions_failed),
            ("cancelled", &self.sessions_cancelled),
        ] {
            out.push_str(&format!(
                "tarifin_sessions_total{{status=\"{}\"}} {}\n",
                status,
                counter.load(Ordering::Relaxed)
            ));
        }

        out.push_str("# HELP tarifin_rejections_total Requests refused before a session started.\n");
        out.push_str("# TYPE tarifin_rejections_total counter\n");
        out.push_str(&format!(
            "tarifin_rejections_total{{reason=\"invalid\"}} {}\n",
            self.validation_rejections.load(Ordering::Relaxed)
        ));
        out.push_str(&format!(
            "tarifin_rejections_total{{reason=\"busy\"}} {}\n",
            self.busy_rejections.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP tarifin_tokens_generated_total Total tokens generated.\n");
        out.push_str("# TYPE tarifin_tokens_generated_total counter\n");
        out.push_str(&format!(
            "tarifin_tokens_generated_total {}\n",
            self.token_counter.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP tarifin_fragments_total Text fragments delivered.\n");
        out.push_str("# TYPE tarifin_fragments_total counter\n");
        out.push_str(&format!(
            "tarifin_fragments_total {}\n",
            self.fragment_counter.load(Ordering::Relaxed)
        ));

        out.push_str("# HELP tarifin_session_duration_ms Session duration histogram (ms).\n");
        out.push_str("# TYPE tarifin_session_duration_ms histogram\n");
        for (i, &bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
            out.push_str(&format!(
                "tarifin_session_duration_ms_bucket{{le=\"{}\"}} {}\n",
                bound,
                self.bucket_counts[i].load(Ordering::Relaxed)
            ));
        }
        out.push_str(&format!(
            "tarifin_session_duration_ms_bucket{{le=\"+Inf\"}} {}\n",
            ended
        ));
        out.push_str(&format!(
            "tarifin_session_duration_ms_sum {}\n",
            sum_us as f64 / 1000.0
        ));
        out.push_str(&format!("tarifin_session_duration_ms_count {}\n", ended));
        out
    }
}
