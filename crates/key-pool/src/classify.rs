//! Exhaustion detection for upstream error responses
//!
//! The email API does not use a dedicated status for spent or revoked keys:
//! quota and invalid-key failures arrive as 402, 429, 401 or even 404 with a
//! descriptive message. Classification is therefore a case-insensitive
//! substring match of the response body against a configurable phrase list.

use transport::ErrorClassification;

/// Phrases that mark a response as a credential/quota problem.
pub const DEFAULT_EXHAUSTION_PHRASES: &[&str] = &[
    "user not found for api key",
    "not found",
    "invalid api key",
    "invalid",
    "exceeded",
];

/// Configurable predicate over error bodies.
#[derive(Debug, Clone)]
pub struct ExhaustionClassifier {
    phrases: Vec<String>,
}

impl Default for ExhaustionClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_EXHAUSTION_PHRASES.iter().copied())
    }
}

impl ExhaustionClassifier {
    pub fn new<I, S>(phrases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            phrases: phrases
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Same classifier with additional phrases.
    pub fn extended<I, S>(&self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut phrases = self.phrases.clone();
        phrases.extend(
            extra
                .into_iter()
                .map(|p| p.as_ref().trim().to_lowercase())
                .filter(|p| !p.is_empty()),
        );
        Self { phrases }
    }

    pub fn phrases(&self) -> &[String] {
        &self.phrases
    }

    /// Whether `text` contains any phrase, ignoring case.
    pub fn matches(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.phrases.iter().any(|p| lower.contains(p.as_str()))
    }

    /// Classify a non-2xx response.
    ///
    /// The status is not consulted: a 500 quoting an exceeded quota still
    /// rotates, a 429 without a matching phrase does not.
    pub fn classify(&self, _status: u16, body: &str) -> ErrorClassification {
        if self.matches(body) {
            ErrorClassification::CredentialExhausted
        } else {
            ErrorClassification::Rejected
        }
    }
}
