use thiserror::Error;

/// Policy reason a request was rejected before reaching the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
    /// Request guard rejection (duplicate or too-short input).
    Guard,
    /// Cost circuit breaker in stop mode.
    Breaker,
    /// Per-user budget exhausted.
    UserBudget,
    /// Too many requests in the sliding minute window.
    RateLimit,
    /// Hourly cost gate exceeded.
    CostGate,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Guard => "guard",
            Self::Breaker => "breaker",
            Self::UserBudget => "user-budget",
            Self::RateLimit => "rate-limit",
            Self::CostGate => "cost-gate",
        }
    }
}

impl std::fmt::Display for BlockReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed error hierarchy for tokenshield.
///
/// Use at module boundaries (pipeline entrypoints, config validation, provider
/// wrapping). Internal/leaf functions can continue using `anyhow::Result` — the
/// `Internal` variant allows seamless conversion via the `?` operator.
#[derive(Debug, Error)]
pub enum ShieldError {
    #[error("Request blocked ({reason}): {message}")]
    Blocked {
        reason: BlockReason,
        message: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Budget error: {0}")]
    Budget(String),

    #[error("Provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Convenience alias for results using ShieldError.
pub type ShieldResult<T> = std::result::Result<T, ShieldError>;

impl ShieldError {
    pub fn blocked(reason: BlockReason, message: impl Into<String>) -> Self {
        Self::Blocked {
            reason,
            message: message.into(),
        }
    }

    pub fn provider(source: anyhow::Error) -> Self {
        let message = format!("{:#}", source);
        let retryable = is_transient_provider_error(&message);
        Self::Provider { message, retryable }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Blocked { reason, .. } => match reason {
                BlockReason::Guard => "blocked/guard",
                BlockReason::Breaker => "blocked/breaker",
                BlockReason::UserBudget => "blocked/user-budget",
                BlockReason::RateLimit => "blocked/rate-limit",
                BlockReason::CostGate => "blocked/cost-gate",
            },
            Self::Config(_) => "config",
            Self::Budget(_) => "budget",
            Self::Provider { .. } => "provider",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether this error is retryable (transient provider failures).
    /// Policy blocks are never retryable at this layer.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Provider { retryable, .. } => *retryable,
            _ => false,
        }
    }
}

/// Classify a provider error message as transient. Non-transient markers take
/// priority over transient ones.
fn is_transient_provider_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    let non_transient = [
        "authentication",
        "unauthorized",
        "invalid api key",
        "invalid_api_key",
        "permission",
        "forbidden",
        "context length",
    ];
    if non_transient.iter().any(|p| lower.contains(p)) {
        return false;
    }
    let transient = [
        "rate limit",
        "429",
        "500",
        "502",
        "503",
        "504",
        "timeout",
        "connection refused",
        "connection reset",
        "broken pipe",
        "overloaded",
    ];
    transient.iter().any(|p| lower.contains(p))
}
