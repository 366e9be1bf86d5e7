//! Service configuration: credentials, endpoint, content budgets, retry
//! budget, and the fuzzy-search narrowing tunables.

use std::time::Duration;

use serde::Deserialize;

use crate::error::TranslateError;

/// How the core authenticates against the upstream service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub enum Credential {
    /// Direct model API access with a bearer API key.
    Direct { api_key: String },
    /// Proxy service access with a license key; the proxy meters credits.
    Proxy { license_key: String },
}

impl Credential {
    fn is_empty(&self) -> bool {
        match self {
            Credential::Direct { api_key } => api_key.trim().is_empty(),
            Credential::Proxy { license_key } => license_key.trim().is_empty(),
        }
    }
}

/// Narrowing constants for the fuzzy candidate pre-filter. These are
/// heuristics tuned for precision/cost, not correctness requirements.
#[derive(Debug, Clone, Deserialize)]
pub struct FuzzyTuning {
    /// Candidates must be within this fraction of the query length.
    pub length_window: f64,
    /// Maximum candidate rows fetched per fuzzy query.
    pub candidate_cap: usize,
    /// Fuzzy search is skipped below this normalized length.
    pub min_text_len: usize,
    /// Fuzzy search is skipped above this normalized length.
    pub max_text_len: usize,
    /// Minimum length for a word to qualify as a LIKE pre-filter keyword.
    pub significant_word_len: usize,
    /// How many leading tokens are scanned for a keyword.
    pub keyword_scan_tokens: usize,
}

impl Default for FuzzyTuning {
    fn default() -> Self {
        Self {
            length_window: 0.3,
            candidate_cap: 30,
            min_text_len: 10,
            max_text_len: 5000,
            significant_word_len: 4,
            keyword_scan_tokens: 5,
        }
    }
}

/// Top-level configuration for the translation service.
#[derive(Debug, Clone, Deserialize)]
pub struct TranslatorConfig {
    pub credential: Option<Credential>,
    /// Base URL of the model or proxy service.
    pub endpoint: String,
    /// Model identifier sent in the request body.
    pub model: String,
    /// Single-item budget above which the chunker engages.
    pub max_content_chars: usize,
    /// Total attempt budget for one logical request (first try included).
    pub max_attempts: u32,
    /// Per-attempt network timeout.
    #[serde(skip, default = "default_timeout")]
    pub request_timeout: Duration,
    #[serde(default)]
    pub fuzzy: FuzzyTuning,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for TranslatorConfig {
    fn default() -> Self {
        Self {
            credential: None,
            endpoint: "https://api.openai.com".into(),
            model: "gpt-4o-mini".into(),
            max_content_chars: 12_000,
            max_attempts: 5,
            request_timeout: default_timeout(),
            fuzzy: FuzzyTuning::default(),
        }
    }
}

impl TranslatorConfig {
    /// Build a config from environment variables. `TRANSMEM_API_KEY` selects
    /// direct mode; otherwise `TRANSMEM_LICENSE_KEY` selects proxy mode.
    /// `TRANSMEM_ENDPOINT` and `TRANSMEM_MODEL` override the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(api_key) = std::env::var("TRANSMEM_API_KEY") {
            config.credential = Some(Credential::Direct { api_key });
        } else if let Ok(license_key) = std::env::var("TRANSMEM_LICENSE_KEY") {
            config.credential = Some(Credential::Proxy { license_key });
        }
        if let Ok(endpoint) = std::env::var("TRANSMEM_ENDPOINT") {
            config.endpoint = endpoint;
        }
        if let Ok(model) = std::env::var("TRANSMEM_MODEL") {
            config.model = model;
        }
        config
    }

    /// The configured credential, or `NotConfigured` if missing/blank.
    pub fn require_credential(&self) -> Result<&Credential, TranslateError> {
        match &self.credential {
            Some(c) if !c.is_empty() => Ok(c),
            _ => Err(TranslateError::NotConfigured),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credential_is_not_configured() {
        let config = TranslatorConfig::default();
        assert_eq!(
            config.require_credential().unwrap_err(),
            TranslateError::NotConfigured
        );
    }

    #[test]
    fn blank_api_key_is_not_configured() {
        let config = TranslatorConfig {
            credential: Some(Credential::Direct { api_key: "  ".into() }),
            ..TranslatorConfig::default()
        };
        assert!(config.require_credential().is_err());
    }

    #[test]
    fn proxy_credential_is_accepted() {
        let config = TranslatorConfig {
            credential: Some(Credential::Proxy { license_key: "lk-123".into() }),
            ..TranslatorConfig::default()
        };
        assert!(config.require_credential().is_ok());
    }
}
