//! Error classification: the single authority every step's error path
//! calls through, so classification cannot drift between steps.

/// The four categories the engine's retry/stall/fail routing is driven
/// by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network timeouts, RPC unreachable, upload service down. Retried
    /// with backoff; exhausts to `STALLED`, never `FAILED`.
    Transient,
    /// Nonce too low, insufficient funding. Retried; often resolves to a
    /// no-op once reconciliation catches up with chain state.
    Recoverable,
    /// Protocol-level reverts. Never retried; the step fails immediately.
    Permanent,
    /// No classifier rule matched. Retried cautiously; the next attempt
    /// reconciles before acting again.
    Unknown,
}

const TRANSIENT_PATTERNS: &[&str] = &[
    "timed out",
    "timeout",
    "connection refused",
    "connection reset",
    "unreachable",
    "temporarily unavailable",
    "service unavailable",
    "upload failed",
];

const RECOVERABLE_PATTERNS: &[&str] = &[
    "nonce too low",
    "nonce too high",
    "insufficient funds",
    "insufficient balance",
    "replacement transaction underpriced",
];

const PERMANENT_PATTERNS: &[&str] = &[
    "revert",
    "reverted",
    "execution reverted",
    "invalid signature",
    "unauthorized",
];

/// Idempotent-success substrings: a "failure" at a registration-like step
/// that actually means the action already landed. Each is matched
/// independently, not as a compound phrase, so e.g. "registered
/// previously, already on file" still counts.
const ALREADY_DONE_PATTERNS: &[&str] = &["already", "registered", "already submitted"];

pub fn is_already_done(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ALREADY_DONE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Ordered substring match against `message`. First match wins; absence
/// of any match yields `Unknown`.
pub fn classify(message: &str) -> ErrorCategory {
    let lower = message.to_ascii_lowercase();
    if PERMANENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorCategory::Permanent;
    }
    if RECOVERABLE_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorCategory::Recoverable;
    }
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return ErrorCategory::Transient;
    }
    ErrorCategory::Unknown
}
