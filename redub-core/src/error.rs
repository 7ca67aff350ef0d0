use serde::{Deserialize, Serialize};

/// The error taxonomy every crate in the workspace classifies into.
///
/// Kinds map one-to-one onto client-visible behavior: the HTTP surface
/// turns them into status codes, the worker turns `Transient` into bounded
/// retries and `Fatal` into a failed job, and the boot path refuses to
/// start on `Corruption`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed or out-of-contract input
    Validation,
    /// No identity could be established
    Auth,
    /// Identity established but the policy denies the action
    Forbidden,
    /// Resource does not exist (or must appear not to)
    NotFound,
    /// State precondition failed (upload overlap, CAS mismatch, redeemed invite)
    Conflict,
    /// A per-user quota would be exceeded
    QuotaExceeded,
    /// A rate limit bucket is empty
    RateLimited,
    /// The process is draining and refuses new work
    Draining,
    /// Retryable infrastructure failure
    Transient,
    /// Non-retryable failure
    Fatal,
    /// Durable state is damaged; operator intervention required
    Corruption,
}

impl ErrorKind {
    /// HTTP status code this kind surfaces as
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::QuotaExceeded => 429,
            Self::RateLimited => 429,
            Self::Draining => 503,
            Self::Transient => 503,
            Self::Fatal => 500,
            Self::Corruption => 500,
        }
    }

    /// Stable wire name for structured error bodies
    pub fn name(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimited => "rate_limited",
            Self::Draining => "draining",
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Corruption => "corruption",
        }
    }

    /// Whether a worker should retry an operation failing with this kind
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether this kind is worth an audit record when it denies a request
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            Self::Auth | Self::Forbidden | Self::QuotaExceeded | Self::RateLimited
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Structured detail attached to quota and rate-limit refusals.
///
/// Serialized into the `429` body as
/// `{error, action, reason, limit, current}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaDetail {
    /// The action that was refused, e.g. `submit_job`
    pub action: String,
    /// Machine-readable reason, e.g. `concurrent_jobs_limit`
    pub reason: String,
    /// The configured ceiling
    pub limit: u64,
    /// The observed value that tripped the ceiling
    pub current: u64,
}

impl QuotaDetail {
    pub fn new(action: impl Into<String>, reason: impl Into<String>, limit: u64, current: u64) -> Self {
        Self {
            action: action.into(),
            reason: reason.into(),
            limit,
            current,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_contract() {
        assert_eq!(ErrorKind::Validation.status_code(), 400);
        assert_eq!(ErrorKind::Auth.status_code(), 401);
        assert_eq!(ErrorKind::Forbidden.status_code(), 403);
        assert_eq!(ErrorKind::Conflict.status_code(), 409);
        assert_eq!(ErrorKind::QuotaExceeded.status_code(), 429);
        assert_eq!(ErrorKind::Draining.status_code(), 503);
    }

    #[test]
    fn only_transient_is_retryable() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::Fatal,
            ErrorKind::Conflict,
            ErrorKind::Corruption,
        ] {
            assert!(!kind.is_retryable(), "{kind} must not be retryable");
        }
        assert!(ErrorKind::Transient.is_retryable());
    }
}
