//! Mapping rule data structures and evaluation

use super::{PatternError, PatternMatcher};
use crate::Claims;
use serde::{Deserialize, Serialize};

/// Routes callers whose claims satisfy every declared condition to an account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRule {
    /// Lower values are evaluated first
    pub priority: i32,
    /// Glob matched against the `sub` claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_pattern: Option<String>,
    /// Glob matched against the `iss` claim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer_pattern: Option<String>,
    /// Scopes that must all be present in the `scope` claim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_scopes: Vec<String>,
    /// Groups that must all be present in the `groups` claim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_groups: Vec<String>,
    /// Target service account id
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl MappingRule {
    /// Create a catch-all rule targeting an account
    pub fn new(priority: i32, account_id: impl Into<String>) -> Self {
        Self {
            priority,
            user_pattern: None,
            issuer_pattern: None,
            required_scopes: Vec::new(),
            required_groups: Vec::new(),
            account_id: account_id.into(),
            description: None,
        }
    }

    pub fn with_user_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.user_pattern = Some(pattern.into());
        self
    }

    pub fn with_issuer_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.issuer_pattern = Some(pattern.into());
        self
    }

    pub fn with_required_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A single compiled rule condition
#[derive(Debug, Clone)]
pub enum RuleCondition {
    /// Subject must match the pattern
    Subject(PatternMatcher),
    /// Issuer must match the pattern
    Issuer(PatternMatcher),
    /// All scopes must be granted
    Scopes(Vec<String>),
    /// All groups must be present
    Groups(Vec<String>),
}

impl RuleCondition {
    /// Evaluate the condition against caller claims
    pub fn holds(&self, claims: &Claims) -> bool {
        match self {
            RuleCondition::Subject(pattern) => {
                claims.sub.as_deref().is_some_and(|sub| pattern.test(sub))
            }

            RuleCondition::Issuer(pattern) => {
                claims.iss.as_deref().is_some_and(|iss| pattern.test(iss))
            }

            RuleCondition::Scopes(required) => {
                let granted: Vec<&str> = claims.scopes().collect();
                required.iter().all(|s| granted.contains(&s.as_str()))
            }

            RuleCondition::Groups(required) => match &claims.groups {
                Some(groups) => required.iter().all(|g| groups.contains(g)),
                None => false,
            },
        }
    }
}

/// A rule with its conditions compiled, ready for evaluation
#[derive(Debug, Clone)]
pub(crate) struct CompiledRule {
    pub(crate) rule: MappingRule,
    conditions: Vec<RuleCondition>,
}

impl CompiledRule {
    pub(crate) fn compile(rule: MappingRule) -> Result<Self, PatternError> {
        let mut conditions = Vec::new();

        if let Some(pattern) = &rule.user_pattern {
            conditions.push(RuleCondition::Subject(PatternMatcher::new(pattern)?));
        }
        if let Some(pattern) = &rule.issuer_pattern {
            conditions.push(RuleCondition::Issuer(PatternMatcher::new(pattern)?));
        }
        if !rule.required_scopes.is_empty() {
            conditions.push(RuleCondition::Scopes(rule.required_scopes.clone()));
        }
        if !rule.required_groups.is_empty() {
            conditions.push(RuleCondition::Groups(rule.required_groups.clone()));
        }

        Ok(Self { rule, conditions })
    }

    /// All declared conditions hold; a rule with none matches everyone
    pub(crate) fn matches(&self, claims: &Claims) -> bool {
        self.conditions.iter().all(|c| c.holds(claims))
    }
}

/// Find the target of the first matching rule; `rules` must be sorted
pub(crate) fn first_match<'a>(rules: &'a [CompiledRule], claims: &Claims) -> Option<&'a MappingRule> {
    rules
        .iter()
        .find(|r| r.matches(claims))
        .map(|r| &r.rule)
}
