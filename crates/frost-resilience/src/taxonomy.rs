//! Failure taxonomy.
//!
//! Maps an error to one of seven failure categories using keyword tables over
//! the error message (and its source chain), plus a handful of well-known
//! concrete error types. Each category carries an ordered list of recovery
//! strategies that both the retry engine and the diagnoser consume.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Boxed error type returned by work functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Confidence assigned when no keyword table matches.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

/// Confidence assigned when a concrete error type identifies the category.
const TYPED_CONFIDENCE: f64 = 0.9;

/// Upper bound for keyword-derived confidence.
const MAX_KEYWORD_CONFIDENCE: f64 = 0.95;

/// Broad category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Config,
    Resource,
    Dependency,
    Logic,
    Timeout,
    Permission,
    Unknown,
}

impl FailureCategory {
    /// Every category, in declaration order.
    pub const ALL: [FailureCategory; 7] = [
        FailureCategory::Config,
        FailureCategory::Resource,
        FailureCategory::Dependency,
        FailureCategory::Logic,
        FailureCategory::Timeout,
        FailureCategory::Permission,
        FailureCategory::Unknown,
    ];

    /// Ordered recovery strategies for this category.
    pub fn strategies(self) -> &'static [RecoveryStrategy] {
        recovery_strategies(self)
    }

    /// Whether a plain retry is among the recovery strategies.
    pub fn is_retryable(self) -> bool {
        self.strategies().contains(&RecoveryStrategy::Retry)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::Config => "config",
            FailureCategory::Resource => "resource",
            FailureCategory::Dependency => "dependency",
            FailureCategory::Logic => "logic",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Permission => "permission",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A recovery action that may be applied to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    Retry,
    AdjustConfig,
    Fallback,
    Escalate,
    Skip,
    Restart,
}

impl RecoveryStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryStrategy::Retry => "retry",
            RecoveryStrategy::AdjustConfig => "adjust_config",
            RecoveryStrategy::Fallback => "fallback",
            RecoveryStrategy::Escalate => "escalate",
            RecoveryStrategy::Skip => "skip",
            RecoveryStrategy::Restart => "restart",
        }
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category -> ordered recovery strategies.
pub const RECOVERY_MAP: [(FailureCategory, &[RecoveryStrategy]); 7] = [
    (
        FailureCategory::Config,
        &[RecoveryStrategy::AdjustConfig, RecoveryStrategy::Escalate],
    ),
    (
        FailureCategory::Resource,
        &[
            RecoveryStrategy::Retry,
            RecoveryStrategy::AdjustConfig,
            RecoveryStrategy::Restart,
        ],
    ),
    (
        FailureCategory::Dependency,
        &[
            RecoveryStrategy::Retry,
            RecoveryStrategy::Fallback,
            RecoveryStrategy::Escalate,
        ],
    ),
    (
        FailureCategory::Logic,
        &[RecoveryStrategy::Escalate, RecoveryStrategy::Skip],
    ),
    (
        FailureCategory::Timeout,
        &[RecoveryStrategy::Retry, RecoveryStrategy::Escalate],
    ),
    (FailureCategory::Permission, &[RecoveryStrategy::Escalate]),
    (
        FailureCategory::Unknown,
        &[RecoveryStrategy::Retry, RecoveryStrategy::Escalate],
    ),
];

/// Look up the recovery strategies for a category.
pub fn recovery_strategies(category: FailureCategory) -> &'static [RecoveryStrategy] {
    RECOVERY_MAP
        .iter()
        .find(|(c, _)| *c == category)
        .map(|(_, s)| *s)
        .unwrap_or(&[RecoveryStrategy::Escalate])
}

/// Keyword tables, checked in order; earlier tables win ties.
const KEYWORD_TABLES: &[(FailureCategory, &[&str])] = &[
    (
        FailureCategory::Timeout,
        &[
            "timed out",
            "timeout",
            "deadline exceeded",
            "deadline has elapsed",
            "took too long",
        ],
    ),
    (
        FailureCategory::Permission,
        &[
            "permission denied",
            "access denied",
            "forbidden",
            "unauthorized",
            "not permitted",
            "insufficient privileges",
            "eacces",
            "401",
            "403",
        ],
    ),
    (
        FailureCategory::Config,
        &[
            "configuration",
            "config",
            "missing setting",
            "not configured",
            "environment variable",
            "invalid value",
            "invalid argument",
            "missing key",
            "no such file",
        ],
    ),
    (
        FailureCategory::Resource,
        &[
            "out of memory",
            "no space left",
            "disk full",
            "quota",
            "resource exhausted",
            "too many open files",
            "rate limit",
            "too many requests",
            "capacity",
            "429",
        ],
    ),
    (
        FailureCategory::Dependency,
        &[
            "connection refused",
            "connection reset",
            "connection aborted",
            "unreachable",
            "unavailable",
            "broken pipe",
            "upstream",
            "dns",
            "bad gateway",
            "502",
            "503",
        ],
    ),
    (
        FailureCategory::Logic,
        &[
            "assertion",
            "index out of",
            "out of bounds",
            "invalid state",
            "unexpected",
            "overflow",
            "divide by zero",
            "panicked",
            "unwrap",
        ],
    ),
];

/// Result of classifying an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// Assigned category.
    pub category: FailureCategory,
    /// Confidence in the assignment, in `[0, 1]`.
    pub confidence: f64,
    /// Ordered candidate recovery strategies.
    pub strategies: Vec<RecoveryStrategy>,
    /// The error message that was classified (source chain joined with `: `).
    pub message: String,
    /// Keywords that matched, if any.
    #[serde(default)]
    pub matched: Vec<String>,
}

impl ClassifiedError {
    fn new(category: FailureCategory, confidence: f64, message: String, matched: Vec<String>) -> Self {
        Self {
            category,
            confidence,
            strategies: category.strategies().to_vec(),
            message,
            matched,
        }
    }

    /// First recovery strategy, if any.
    pub fn primary_strategy(&self) -> Option<RecoveryStrategy> {
        self.strategies.first().copied()
    }
}

/// Keyword-heuristic failure classifier.
#[derive(Debug, Clone, Default)]
pub struct FailureTaxonomy {
    /// Extra keywords registered at runtime, checked before the built-in tables.
    extra: Vec<(FailureCategory, String)>,
}

impl FailureTaxonomy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an additional keyword for a category.
    pub fn with_keyword(mut self, category: FailureCategory, keyword: impl Into<String>) -> Self {
        self.extra.push((category, keyword.into().to_lowercase()));
        self
    }

    /// Classify an error, inspecting its source chain.
    pub fn classify(&self, error: &(dyn std::error::Error + 'static)) -> ClassifiedError {
        let message = error_chain_message(error);

        if let Some(category) = typed_category(error) {
            debug!(%category, %message, "classified failure by error type");
            return ClassifiedError::new(category, TYPED_CONFIDENCE, message, Vec::new());
        }

        self.classify_message(&message)
    }

    /// Classify a bare error message.
    pub fn classify_message(&self, message: &str) -> ClassifiedError {
        let lowered = message.to_lowercase();

        // Tally hits per category while preserving first-seen order.
        let mut tallies: Vec<(FailureCategory, Vec<String>)> = Vec::new();
        let mut tally = |category: FailureCategory, keyword: &str| {
            if !contains_keyword(&lowered, keyword) {
                return;
            }
            match tallies.iter_mut().find(|(c, _)| *c == category) {
                Some((_, hits)) => hits.push(keyword.to_string()),
                None => tallies.push((category, vec![keyword.to_string()])),
            }
        };
        for (category, keyword) in &self.extra {
            tally(*category, keyword.as_str());
        }
        for (category, keywords) in KEYWORD_TABLES {
            for &keyword in keywords.iter() {
                tally(*category, keyword);
            }
        }

        let mut best: Option<(FailureCategory, Vec<String>)> = None;
        for (category, hits) in tallies {
            let better = match &best {
                Some((_, best_hits)) => hits.len() > best_hits.len(),
                None => true,
            };
            if better {
                best = Some((category, hits));
            }
        }

        let classified = match best {
            Some((category, hits)) => {
                let confidence =
                    (0.6 + 0.1 * hits.len() as f64).min(MAX_KEYWORD_CONFIDENCE);
                ClassifiedError::new(category, confidence, message.to_string(), hits)
            }
            None => ClassifiedError::new(
                FailureCategory::Unknown,
                DEFAULT_CONFIDENCE,
                message.to_string(),
                Vec::new(),
            ),
        };

        debug!(
            category = %classified.category,
            confidence = classified.confidence,
            matched = ?classified.matched,
            "classified failure"
        );
        classified
    }
}

/// Whether `keyword` occurs in `text`. Numeric codes such as `403` only
/// count as whole tokens, so `14013` does not match.
fn contains_keyword(text: &str, keyword: &str) -> bool {
    if keyword.is_empty() || !keyword.bytes().all(|b| b.is_ascii_digit()) {
        return text.contains(keyword);
    }
    text.match_indices(keyword).any(|(start, _)| {
        let end = start + keyword.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Join an error and its sources into one message.
pub fn error_chain_message(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        let text = inner.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = inner.source();
    }
    message
}

/// Identify the category from well-known concrete error types in the chain.
fn typed_category(error: &(dyn std::error::Error + 'static)) -> Option<FailureCategory> {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if let Some(category) = io_category(io.kind()) {
                return Some(category);
            }
        }
        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return Some(FailureCategory::Timeout);
        }
        if err.downcast_ref::<serde_json::Error>().is_some() {
            return Some(FailureCategory::Config);
        }
        current = err.source();
    }
    None
}

fn io_category(kind: std::io::ErrorKind) -> Option<FailureCategory> {
    use std::io::ErrorKind;

    match kind {
        ErrorKind::PermissionDenied => Some(FailureCategory::Permission),
        ErrorKind::TimedOut => Some(FailureCategory::Timeout),
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => Some(FailureCategory::Dependency),
        ErrorKind::NotFound | ErrorKind::InvalidInput => Some(FailureCategory::Config),
        ErrorKind::OutOfMemory => Some(FailureCategory::Resource),
        ErrorKind::InvalidData => Some(FailureCategory::Logic),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_timed_out_is_timeout_with_retry_first() {
        let taxonomy = FailureTaxonomy::new();
        let classified = taxonomy.classify_message("connection timed out");
        assert_eq!(classified.category, FailureCategory::Timeout);
        assert_eq!(classified.primary_strategy(), Some(RecoveryStrategy::Retry));
    }

    #[test]
    fn test_unmatched_message_degrades_to_unknown() {
        let classified = FailureTaxonomy::new().classify_message("something odd happened");
        assert_eq!(classified.category, FailureCategory::Unknown);
        assert_eq!(classified.confidence, DEFAULT_CONFIDENCE);
        assert!(classified.matched.is_empty());
    }

    #[test]
    fn test_permission_only_escalates() {
        let classified = FailureTaxonomy::new().classify_message("Permission denied (publickey)");
        assert_eq!(classified.category, FailureCategory::Permission);
        assert_eq!(classified.strategies, vec![RecoveryStrategy::Escalate]);
        assert!(!classified.category.is_retryable());
    }

    #[test]
    fn test_more_hits_raise_confidence() {
        let taxonomy = FailureTaxonomy::new();
        let one = taxonomy.classify_message("disk full");
        let two = taxonomy.classify_message("disk full, quota reached");
        assert_eq!(one.category, FailureCategory::Resource);
        assert_eq!(two.category, FailureCategory::Resource);
        assert!(two.confidence > one.confidence);
        assert!(two.confidence <= MAX_KEYWORD_CONFIDENCE);
    }

    #[test]
    fn test_io_error_kind_is_classified_by_type() {
        let err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "nope");
        let classified = FailureTaxonomy::new().classify(&err);
        assert_eq!(classified.category, FailureCategory::Dependency);
        assert_eq!(classified.confidence, TYPED_CONFIDENCE);
    }

    #[test]
    fn test_boxed_error_source_chain_is_inspected() {
        #[derive(Debug)]
        struct Wrapper(std::io::Error);
        impl fmt::Display for Wrapper {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("sync step failed")
            }
        }
        impl std::error::Error for Wrapper {
            fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
                Some(&self.0)
            }
        }

        let boxed: BoxError = Box::new(Wrapper(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "read-only filesystem",
        )));
        let classified = FailureTaxonomy::new().classify(boxed.as_ref());
        assert_eq!(classified.category, FailureCategory::Permission);
        assert!(classified.message.contains("sync step failed"));
        assert!(classified.message.contains("read-only filesystem"));
    }

    #[test]
    fn test_custom_keyword_takes_part_in_classification() {
        let taxonomy =
            FailureTaxonomy::new().with_keyword(FailureCategory::Dependency, "ledger offline");
        let classified = taxonomy.classify_message("Ledger offline, try later");
        assert_eq!(classified.category, FailureCategory::Dependency);
    }

    #[test]
    fn test_status_codes_match_only_as_whole_numbers() {
        let taxonomy = FailureTaxonomy::new();
        assert_eq!(
            taxonomy.classify_message("processed 14013 rows").category,
            FailureCategory::Unknown
        );
        assert_eq!(
            taxonomy.classify_message("batch 15029 done").category,
            FailureCategory::Unknown
        );
        assert_eq!(
            taxonomy.classify_message("HTTP 403 returned").category,
            FailureCategory::Permission
        );
        assert_eq!(
            taxonomy.classify_message("status=429").category,
            FailureCategory::Resource
        );
        assert_eq!(
            taxonomy.classify_message("upstream returned (503)").category,
            FailureCategory::Dependency
        );
    }

    #[test]
    fn test_every_category_has_strategies() {
        for category in FailureCategory::ALL {
            assert!(!category.strategies().is_empty(), "{category} has no strategies");
        }
    }

    #[test]
    fn test_category_serializes_snake_case() {
        let json = serde_json::to_string(&RecoveryStrategy::AdjustConfig).unwrap();
        assert_eq!(json, "\"adjust_config\"");
    }
}
