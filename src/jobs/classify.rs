//! Message-based failure classification.
//!
//! Used for errors that arrive without a classification attached, typically a
//! backend refusing a task before any handle exists. Rules are checked in
//! order; anything unmatched is permanent.

use regex::Regex;

use crate::backend::ErrorClassification;

/// A single pattern → classification rule.
#[derive(Debug, Clone)]
pub struct FailureRule {
    pub regex: Regex,
    pub classification: ErrorClassification,
}

/// Ordered rule list.
#[derive(Debug, Clone)]
pub struct FailureClassifier {
    rules: Vec<FailureRule>,
}

const DEFAULT_RULES: &[(&str, ErrorClassification)] = &[
    (
        r"(?i)(econnreset|econnrefused|connection (reset|refused|closed)|broken pipe)",
        ErrorClassification::Transient,
    ),
    (
        r"(?i)(rate[ _-]?limit|too many requests|\b429\b)",
        ErrorClassification::Transient,
    ),
    (
        r"(?i)(\b5\d\d\b|service unavailable|bad gateway|overloaded)",
        ErrorClassification::Transient,
    ),
    (
        r"(?i)(out of memory|\boom\b|killed|signal 9|resource exhausted|no space left)",
        ErrorClassification::Resource,
    ),
    (
        r"(?i)(timed? ?out|deadline exceeded)",
        ErrorClassification::Timeout,
    ),
];

impl FailureClassifier {
    /// Create a classifier with the default rules.
    pub fn default_rules() -> Self {
        let mut classifier = Self::empty();
        for (pattern, classification) in DEFAULT_RULES {
            if let Err(e) = classifier.add_rule(pattern, *classification) {
                tracing::error!(pattern, "Skipping invalid failure rule: {}", e);
            }
        }
        classifier
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule; later rules only apply when earlier ones miss.
    pub fn add_rule(
        &mut self,
        pattern: &str,
        classification: ErrorClassification,
    ) -> Result<(), regex::Error> {
        self.rules.push(FailureRule {
            regex: Regex::new(pattern)?,
            classification,
        });
        Ok(())
    }

    pub fn classify(&self, message: &str) -> ErrorClassification {
        self.rules
            .iter()
            .find(|rule| rule.regex.is_match(message))
            .map(|rule| rule.classification)
            .unwrap_or(ErrorClassification::Permanent)
    }
}

impl Default for FailureClassifier {
    fn default() -> Self {
        Self::default_rules()
    }
}
