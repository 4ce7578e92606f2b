//! Failure Categories
//!
//! Every failure is tagged with a [`FailureCategory`] where it happens.
//! Recovery decisions read the category, never the message text.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed set of failure causes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    // === Terminal (bad input or denied access) ===
    Validation,
    Parse,
    Checksum,
    Authentication,
    Authorization,

    // === Transient (dependency trouble) ===
    Timeout,
    Connection,
    Unavailable,
    Network,
    Throttling,
    Temporary,

    /// Cause could not be determined
    Unknown,
}

impl FailureCategory {
    /// Transient failures are eligible for bounded automatic recovery.
    /// `Unknown` stays non-recoverable.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FailureCategory::Timeout
                | FailureCategory::Connection
                | FailureCategory::Unavailable
                | FailureCategory::Network
                | FailureCategory::Throttling
                | FailureCategory::Temporary
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Validation => "VALIDATION",
            FailureCategory::Parse => "PARSE",
            FailureCategory::Checksum => "CHECKSUM",
            FailureCategory::Authentication => "AUTHENTICATION",
            FailureCategory::Authorization => "AUTHORIZATION",
            FailureCategory::Timeout => "TIMEOUT",
            FailureCategory::Connection => "CONNECTION",
            FailureCategory::Unavailable => "UNAVAILABLE",
            FailureCategory::Network => "NETWORK",
            FailureCategory::Throttling => "THROTTLING",
            FailureCategory::Temporary => "TEMPORARY",
            FailureCategory::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        use FailureCategory::*;
        [
            Validation,
            Parse,
            Checksum,
            Authentication,
            Authorization,
            Timeout,
            Connection,
            Unavailable,
            Network,
            Throttling,
            Temporary,
            Unknown,
        ]
        .into_iter()
        .find(|c| c.as_str() == s)
    }

    /// Infer a category from free text.
    ///
    /// Only used for records persisted before categories were stored, or
    /// for messages from collaborators that do not tag their failures.
    /// Terminal markers win over transient ones.
    pub fn classify_message(message: &str) -> Self {
        const TERMINAL: [(&str, FailureCategory); 8] = [
            ("validation", FailureCategory::Validation),
            ("invalid format", FailureCategory::Validation),
            ("parse", FailureCategory::Parse),
            ("checksum", FailureCategory::Checksum),
            ("authentication", FailureCategory::Authentication),
            ("authorization", FailureCategory::Authorization),
            ("access denied", FailureCategory::Authorization),
            ("forbidden", FailureCategory::Authorization),
        ];
        const TRANSIENT: [(&str, FailureCategory); 7] = [
            ("timeout", FailureCategory::Timeout),
            ("timed out", FailureCategory::Timeout),
            ("connection", FailureCategory::Connection),
            ("unavailable", FailureCategory::Unavailable),
            ("network", FailureCategory::Network),
            ("throttl", FailureCategory::Throttling),
            ("temporary", FailureCategory::Temporary),
        ];

        let lower = message.to_lowercase();
        TERMINAL
            .iter()
            .chain(TRANSIENT.iter())
            .find(|(marker, _)| lower.contains(marker))
            .map(|(_, category)| *category)
            .unwrap_or(FailureCategory::Unknown)
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a batch failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub category: FailureCategory,
    pub message: String,
}

impl BatchFailure {
    pub fn new(category: FailureCategory, message: impl Into<String>) -> Self {
        Self {
            category,
            message: message.into(),
        }
    }

    /// Build from an untagged message (category inferred)
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            category: FailureCategory::classify_message(&message),
            message,
        }
    }

    #[inline]
    pub fn is_recoverable(&self) -> bool {
        self.category.is_recoverable()
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.category, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_timeout_is_recoverable() {
        let failure = BatchFailure::from_message("connection timeout to registry");
        assert!(failure.is_recoverable());
    }

    #[test]
    fn test_validation_error_is_not_recoverable() {
        let failure = BatchFailure::from_message("validation error: missing LEI");
        assert_eq!(failure.category, FailureCategory::Validation);
        assert!(!failure.is_recoverable());
    }

    #[test]
    fn test_terminal_marker_beats_transient_marker() {
        // "authentication" must win even though "timeout" is present
        let category = FailureCategory::classify_message("authentication timeout");
        assert_eq!(category, FailureCategory::Authentication);
    }

    #[test]
    fn test_unmarked_message_defaults_to_unknown() {
        let category = FailureCategory::classify_message("something odd happened");
        assert_eq!(category, FailureCategory::Unknown);
        assert!(!category.is_recoverable());
    }

    #[test]
    fn test_throttling_and_network() {
        assert_eq!(
            FailureCategory::classify_message("S3 Throttling: slow down"),
            FailureCategory::Throttling
        );
        assert!(FailureCategory::classify_message("network unreachable").is_recoverable());
    }

    #[test]
    fn test_category_string_roundtrip() {
        for c in [
            FailureCategory::Validation,
            FailureCategory::Timeout,
            FailureCategory::Unknown,
        ] {
            assert_eq!(FailureCategory::from_str_opt(c.as_str()), Some(c));
        }
        assert_eq!(FailureCategory::from_str_opt("nope"), None);
    }
}
