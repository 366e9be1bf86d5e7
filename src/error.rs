//! Error taxonomy for the translation core.
//! Errors are plain values: every fallible operation returns
//! `Result<_, TranslateError>` and callers pattern-match on the kind.
//! Upstream rejections keep their classification all the way up — UI glue
//! depends on telling "fix your license" apart from "try again later".

/// Every failure class the core can produce.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranslateError {
    /// No usable API key / license key configured. Fails before any network call.
    NotConfigured,
    /// Empty or malformed input; a caller error, never retried.
    InvalidRequest(String),
    /// Credential rejected by the upstream service (401).
    Unauthorized,
    /// Credential valid but not allowed for this request (403).
    Forbidden,
    /// Out of credits/quota (402). `balance` is the remaining credit balance
    /// when the proxy reports one.
    QuotaExceeded { balance: Option<i64> },
    /// Upstream rate limit (429). Transient.
    RateLimited,
    /// Upstream overloaded (529). Transient, clears slowly.
    Overloaded,
    /// Upstream 5xx. Transient.
    ServerError { status: u16 },
    /// Connectivity failure or per-attempt timeout. Transient.
    TransportError(String),
    /// Model output violated the expected format (e.g. non-JSON batch reply).
    ParseError(String),
    /// Translation memory storage unavailable. Distinct from "no match found".
    Persistence(String),
}

impl TranslateError {
    /// Whether the retry loop may re-attempt after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TranslateError::RateLimited
                | TranslateError::Overloaded
                | TranslateError::ServerError { .. }
                | TranslateError::TransportError(_)
        )
    }
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::NotConfigured => {
                write!(f, "no API key or license key configured; set a credential before translating")
            }
            TranslateError::InvalidRequest(msg) => write!(f, "invalid request: {msg}"),
            TranslateError::Unauthorized => {
                write!(f, "translation service rejected the credential; check your API key")
            }
            TranslateError::Forbidden => {
                write!(f, "translation service refused this request; check your plan or registered domain")
            }
            TranslateError::QuotaExceeded { balance } => match balance {
                Some(b) => write!(f, "translation quota exhausted (remaining balance: {b})"),
                None => write!(f, "translation quota exhausted; top up credits to continue"),
            },
            TranslateError::RateLimited => write!(f, "rate limited by the translation service"),
            TranslateError::Overloaded => write!(f, "translation service overloaded"),
            TranslateError::ServerError { status } => {
                write!(f, "translation service error (HTTP {status})")
            }
            TranslateError::TransportError(msg) => write!(f, "network error: {msg}"),
            TranslateError::ParseError(msg) => write!(f, "unparseable model output: {msg}"),
            TranslateError::Persistence(msg) => write!(f, "translation memory storage error: {msg}"),
        }
    }
}

impl std::error::Error for TranslateError {}

impl From<rusqlite::Error> for TranslateError {
    fn from(e: rusqlite::Error) -> Self {
        TranslateError::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classes_are_retryable() {
        assert!(TranslateError::RateLimited.is_retryable());
        assert!(TranslateError::Overloaded.is_retryable());
        assert!(TranslateError::ServerError { status: 502 }.is_retryable());
        assert!(TranslateError::TransportError("reset".into()).is_retryable());
    }

    #[test]
    fn terminal_classes_are_not_retryable() {
        assert!(!TranslateError::Unauthorized.is_retryable());
        assert!(!TranslateError::Forbidden.is_retryable());
        assert!(!TranslateError::QuotaExceeded { balance: Some(0) }.is_retryable());
        assert!(!TranslateError::NotConfigured.is_retryable());
        assert!(!TranslateError::InvalidRequest("empty".into()).is_retryable());
        assert!(!TranslateError::ParseError("bad json".into()).is_retryable());
        assert!(!TranslateError::Persistence("disk".into()).is_retryable());
    }
}
