use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retry_phases: u32,
    pub backoff: Backoff,
    pub initial_ms: u64,
    pub cap_ms: u64,
    pub jitter_pct: f64,
    /// Unknown-class failures retried this many times before terminal.
    pub max_unknown_retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Exponential,
    Constant,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retry_phases: 2,
            backoff: Backoff::Exponential,
            initial_ms: 500,
            cap_ms: 60_000,
            jitter_pct: 0.20,
            max_unknown_retries: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Terminal,
}

/// Failure kinds recorded in task errors. String forms are what lands in the
/// store and in log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimited,
    ServerError,
    ClientError,
    Network,
    Timeout,
    StoreConflict,
    Cancelled,
    Poisoned,
    HandlerFailure,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "RATE_LIMITED",
            ErrorKind::ServerError => "SERVER_ERROR",
            ErrorKind::ClientError => "CLIENT_ERROR",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::StoreConflict => "STORE_CONFLICT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Poisoned => "POISONED",
            ErrorKind::HandlerFailure => "HANDLER_FAILURE",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

/// External-call classification per status code: 429 and 5xx retry, other
/// 4xx are deterministic input errors.
pub fn classify_status(status: u16) -> (ErrorKind, ErrorClass) {
    match status {
        429 => (ErrorKind::RateLimited, ErrorClass::Retryable),
        500..=599 => (ErrorKind::ServerError, ErrorClass::Retryable),
        400..=499 => (ErrorKind::ClientError, ErrorClass::Terminal),
        _ => (ErrorKind::Unknown, ErrorClass::Retryable),
    }
}

/// Delay before the k-th retry phase (k >= 1), with jitter.
pub fn next_delay_ms(phase: u32, cfg: &RetryConfig, rng: &mut impl Rng) -> u64 {
    let phase = phase.max(1);
    let base = match cfg.backoff {
        Backoff::Constant => cfg.initial_ms,
        Backoff::Exponential => {
            let exp = phase.saturating_sub(1).min(32);
            cfg.initial_ms.saturating_mul(1u64 << exp)
        }
    };
    let capped = base.min(cfg.cap_ms);

    let jitter_range = capped as f64 * cfg.jitter_pct;
    let jitter = rng.gen_range(-jitter_range..=jitter_range);
    let jittered = (capped as f64 + jitter).round();
    jittered.clamp(0.0, cfg.cap_ms as f64) as u64
}
