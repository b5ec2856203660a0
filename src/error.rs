// =============================================================================
// Classified error taxonomy for the Meridian runtime
// =============================================================================
//
// Everything that flows through the Retry Coordinator is an `EngineError`
// with a stable [`ErrorKind`]. Adapters classify at the boundary; the
// coordinator decides retryability per operation type; whatever escapes the
// coordinator is terminal for the calling executor.
//
// `anyhow` remains the application-boundary error type (startup, API
// plumbing); this enum is for the chain/swap/strategy pipeline only.
// =============================================================================

use serde::Serialize;

/// Coarse classification used by the retry tables and the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Network / 5xx / gateway timeout / rate-limit. Always a retry candidate.
    TransientRpc,
    /// Program error, insufficient funds, slippage tolerance exceeded on
    /// chain. Never retried.
    OnChainTerminal,
    /// Route expired or price moved between quote and execution. Retryable
    /// with a fresh quote.
    SlippageTransient,
    /// Bad config, illegal state transition, schema violation.
    Validation,
    /// Unknown instance or position.
    NotFound,
    /// Wallet refused or missing.
    Unauthorized,
    /// Cooperative cancellation (user stop) observed mid-operation.
    Cancelled,
    /// Invariant violation inside the runtime.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TransientRpc => "transient-rpc",
            Self::OnChainTerminal => "on-chain-terminal",
            Self::SlippageTransient => "slippage-transient",
            Self::Validation => "validation",
            Self::NotFound => "not-found",
            Self::Unauthorized => "unauthorized",
            Self::Cancelled => "cancelled",
            Self::Internal => "internal",
        };
        write!(f, "{s}")
    }
}

/// Classified runtime error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("transient rpc failure: {0}")]
    TransientRpc(String),

    #[error("on-chain failure: {0}")]
    OnChainTerminal(String),

    #[error("slippage/route failure: {0}")]
    SlippageTransient(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::TransientRpc(_) => ErrorKind::TransientRpc,
            Self::OnChainTerminal(_) => ErrorKind::OnChainTerminal,
            Self::SlippageTransient(_) => ErrorKind::SlippageTransient,
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Short machine-readable reason code for API responses and
    /// `strategy.status.update` payloads.
    pub fn reason_code(&self) -> String {
        self.kind().to_string()
    }
}

/// Classify a message coming back from an RPC endpoint or the swap
/// aggregator. String matching is the lowest common denominator across
/// providers; anything unrecognised defaults to transient so the bounded
/// retry tables get a chance to resolve it.
pub fn classify_remote_error(message: &str) -> EngineError {
    let lower = message.to_lowercase();

    if lower.contains("slippage") && lower.contains("exceed") {
        return EngineError::OnChainTerminal(message.to_string());
    }
    if lower.contains("route expired")
        || lower.contains("quote expired")
        || lower.contains("price moved")
        || lower.contains("could not find any route")
    {
        return EngineError::SlippageTransient(message.to_string());
    }
    if lower.contains("insufficient")
        && (lower.contains("funds") || lower.contains("lamports") || lower.contains("balance"))
    {
        return EngineError::OnChainTerminal(message.to_string());
    }
    if lower.contains("accountnotfound")
        || lower.contains("account not found")
        || lower.contains("could not find account")
        || lower.contains("does not exist")
    {
        return EngineError::NotFound(message.to_string());
    }
    if lower.contains("custom program error") || lower.contains("instructionerror") {
        return EngineError::OnChainTerminal(message.to_string());
    }
    if lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("rate limit")
        || lower.contains("429")
        || lower.contains("502")
        || lower.contains("503")
        || lower.contains("gateway")
    {
        return EngineError::TransientRpc(message.to_string());
    }

    EngineError::TransientRpc(message.to_string())
}
