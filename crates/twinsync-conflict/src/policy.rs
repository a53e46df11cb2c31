//! Policy engine for automatic conflict resolution
//!
//! Evaluates the job's conflict rules to determine automatic resolution
//! strategies. Rules are matched using glob patterns in first-match-wins
//! order; the job's default strategy applies when nothing matches.
//!
//! Patterns are tried against the workspace path both with and without its
//! leading `/`, so `Documents/**` and `/Documents/**` behave alike.

use glob::Pattern;
use tracing::{debug, trace};

use twinsync_core::config::{ConflictRule, Strategy};
use twinsync_core::domain::{NodePath, Resolution};

use crate::error::ConflictError;

/// Validates a rule's glob pattern
pub fn validate_rule(rule: &ConflictRule) -> Result<(), ConflictError> {
    Pattern::new(&rule.pattern).map_err(|e| ConflictError::InvalidPattern {
        pattern: rule.pattern.clone(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Engine that evaluates conflict resolution rules
pub struct PolicyEngine {
    rules: Vec<(Pattern, Strategy)>,
    default_strategy: Strategy,
}

impl PolicyEngine {
    /// Creates a PolicyEngine from the default strategy and a list of rules
    ///
    /// Invalid rules are logged and skipped.
    pub fn new(default_strategy: Strategy, rules: &[ConflictRule]) -> Self {
        let compiled_rules: Vec<(Pattern, Strategy)> = rules
            .iter()
            .filter_map(|rule| match Pattern::new(&rule.pattern) {
                Ok(p) => Some((p, rule.strategy)),
                Err(e) => {
                    tracing::warn!(
                        pattern = %rule.pattern,
                        error = %e,
                        "Skipping invalid conflict rule pattern"
                    );
                    None
                }
            })
            .collect();

        debug!(
            rules_count = compiled_rules.len(),
            default = ?default_strategy,
            "PolicyEngine initialized"
        );

        Self {
            rules: compiled_rules,
            default_strategy,
        }
    }

    /// Evaluates the policy for a given workspace path
    ///
    /// Uses first-match-wins: the first rule whose glob matches the path
    /// determines the strategy. If no rule matches, returns the default.
    pub fn evaluate(&self, path: &NodePath) -> Strategy {
        let full = path.as_str();
        let relative = full.trim_start_matches('/');

        for (pattern, strategy) in &self.rules {
            if pattern.matches(relative) || pattern.matches(full) {
                trace!(
                    path = %path,
                    pattern = %pattern,
                    strategy = ?strategy,
                    "Conflict rule matched"
                );
                return *strategy;
            }
        }

        trace!(
            path = %path,
            default = ?self.default_strategy,
            "No conflict rule matched, using default"
        );
        self.default_strategy
    }

    /// The resolution to mark automatically, `None` when the user decides
    pub fn auto_resolution(&self, path: &NodePath) -> Option<Resolution> {
        self.evaluate(path).resolution()
    }

    /// Returns the default resolution strategy
    pub fn default_strategy(&self) -> Strategy {
        self.default_strategy
    }

    /// Returns the number of compiled rules
    pub fn rules_count(&self) -> usize {
        self.rules.len()
    }
}
