//! Condition evaluation and rule selection.
//!
//! A rule matches when every one of its conditions holds; the first
//! matching rule in configuration order wins.

use crate::config::{Condition, ResponsePayload};
use crate::extract::{extract, yields_match_list, Target};
use crate::operator::{apply, Operator};
use crate::patterns::CompiledPatterns;
use crate::request::RequestSnapshot;
use serde_json::Value;
use tracing::debug;

/// An ordered AND-group of conditions paired with a response.
///
/// Rules built from `scenarios` carry the scenario name.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: Option<String>,
    pub conditions: Vec<Condition>,
    pub response: ResponsePayload,
}

impl Rule {
    pub fn new(conditions: Vec<Condition>, response: ResponsePayload) -> Self {
        Self {
            name: None,
            conditions,
            response,
        }
    }

    pub fn named(
        name: impl Into<String>,
        conditions: Vec<Condition>,
        response: ResponsePayload,
    ) -> Self {
        Self {
            name: Some(name.into()),
            conditions,
            response,
        }
    }
}

/// Whether `operator` is meaningful for values extracted from `target`.
///
/// Unknown targets and operators are never supported.
pub fn is_supported(target: &Target, operator: &Operator) -> bool {
    use Operator::*;

    if matches!(operator, Unknown(_)) {
        return false;
    }
    match target {
        Target::Body | Target::Params | Target::Headers | Target::Cookies => true,
        Target::Method | Target::Path | Target::RouteParams => {
            matches!(operator, Equals | Regex | RegexCi | Null)
        }
        Target::Number => matches!(operator, Equals | Null | ValidJsonSchema),
        Target::GlobalVariable | Target::DataBucket => matches!(operator, Equals | Null),
        Target::Unknown(_) => false,
    }
}

/// Request matcher engine.
pub struct Matcher {
    patterns: CompiledPatterns,
}

impl Matcher {
    pub fn new(patterns: CompiledPatterns) -> Self {
        Self { patterns }
    }

    pub fn patterns(&self) -> &CompiledPatterns {
        &self.patterns
    }

    /// Evaluate one condition against the request.
    pub fn matches(&self, condition: &Condition, snapshot: &RequestSnapshot) -> bool {
        if !is_supported(&condition.target, &condition.operator) {
            debug!(
                condition_target = %condition.target,
                operator = %condition.operator,
                "Unsupported condition"
            );
            return false;
        }

        let property = condition.property.as_deref();
        let actual = match extract(&self.patterns, snapshot, &condition.target, property) {
            // A single match compares equal to a scalar operand
            Some(Value::Array(mut matches))
                if matches.len() == 1
                    && condition.operator == Operator::Equals
                    && !condition.value.is_array()
                    && yields_match_list(&condition.target, property) =>
            {
                matches.pop()
            }
            other => other,
        };
        let result = apply(
            &self.patterns,
            &condition.operator,
            actual.as_ref(),
            &condition.value,
        );

        if condition.invert {
            !result
        } else {
            result
        }
    }

    /// All conditions hold. Vacuously true for an empty list.
    pub fn matches_all(&self, conditions: &[Condition], snapshot: &RequestSnapshot) -> bool {
        conditions.iter().all(|c| self.matches(c, snapshot))
    }

    /// First rule whose conditions all hold.
    pub fn select<'r>(&self, rules: &'r [Rule], snapshot: &RequestSnapshot) -> Option<&'r Rule> {
        rules
            .iter()
            .find(|rule| self.matches_all(&rule.conditions, snapshot))
    }
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(CompiledPatterns::default())
    }
}
