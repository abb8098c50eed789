//! Rate limit rules: configuration values and YAML loading.
//!
//! A rule says how many events (`limit`) a partition of traffic (`scope`) may
//! produce per `period` seconds, and which algorithm enforces it. Rules are
//! immutable once registered; updating a rule means registering a new value
//! under the same name.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::info;

use crate::error::{RateLimitError, Result};

/// Priority assigned to rules that don't set one.
pub const DEFAULT_PRIORITY: i32 = 100;

/// The dimension along which a rule partitions traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// One counter shared by every caller
    Global,
    /// Per client IP address
    Ip,
    /// Per authenticated user id
    User,
    /// Per endpoint
    Endpoint,
    /// Per user type (role)
    UserType,
    /// Per API key
    ApiKey,
}

impl Scope {
    /// Prefix used in derived counter keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Global => "global",
            Scope::Ip => "ip",
            Scope::User => "user",
            Scope::Endpoint => "endpoint",
            Scope::UserType => "user_type",
            Scope::ApiKey => "api_key",
        }
    }
}

/// The algorithm enforcing a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    Adaptive,
}

/// What happens when a rule rejects.
///
/// `Warn` logs the violation and lets the request through. `Delay` and
/// `Throttle` are accepted in configuration and currently behave as `Reject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    #[default]
    Reject,
    Delay,
    Throttle,
    Warn,
}

/// A single rate limit rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Unique rule name
    pub name: String,
    /// Maximum events allowed per period
    pub limit: u64,
    /// Window size in seconds
    pub period: u64,
    /// How traffic is partitioned
    #[serde(default = "default_scope")]
    pub scope: Scope,
    /// Enforcing algorithm
    #[serde(default = "default_algorithm")]
    pub algorithm: Algorithm,
    /// Behavior on rejection
    #[serde(default)]
    pub action: Action,
    /// Reserved; not read by any algorithm.
    #[serde(default)]
    pub burst_allowance: u64,
    /// Reserved; not read by any algorithm.
    #[serde(default)]
    pub grace_period: u64,
    /// Lower values are evaluated first
    #[serde(default = "default_priority")]
    pub priority: i32,
    /// Disabled rules are never evaluated
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Context key -> expected value, or list of accepted values
    #[serde(default)]
    pub conditions: BTreeMap<String, Value>,
    /// User ids, IPs or user types that bypass this rule
    #[serde(default)]
    pub exemptions: BTreeSet<String>,
}

fn default_scope() -> Scope {
    Scope::Ip
}

fn default_algorithm() -> Algorithm {
    Algorithm::SlidingWindow
}

fn default_priority() -> i32 {
    DEFAULT_PRIORITY
}

fn default_enabled() -> bool {
    true
}

impl RateLimitRule {
    /// Create an IP-scoped sliding window rule.
    pub fn new(name: impl Into<String>, limit: u64, period: u64) -> Self {
        Self {
            name: name.into(),
            limit,
            period,
            scope: default_scope(),
            algorithm: default_algorithm(),
            action: Action::default(),
            burst_allowance: 0,
            grace_period: 0,
            priority: DEFAULT_PRIORITY,
            enabled: true,
            conditions: BTreeMap::new(),
            exemptions: BTreeSet::new(),
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Only apply the rule when the context field `key` matches `expected`.
    ///
    /// A JSON array as `expected` matches any of its members.
    pub fn with_condition(mut self, key: impl Into<String>, expected: impl Into<Value>) -> Self {
        self.conditions.insert(key.into(), expected.into());
        self
    }

    pub fn with_exemption(mut self, identifier: impl Into<String>) -> Self {
        self.exemptions.insert(identifier.into());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Copy of this rule with a different limit.
    pub fn with_limit(&self, limit: u64) -> Self {
        let mut rule = self.clone();
        rule.limit = limit;
        rule
    }

    /// Check the rule is usable.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| RateLimitError::InvalidRule {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if self.limit == 0 {
            return Err(invalid("limit must be positive"));
        }
        if self.period == 0 {
            return Err(invalid("period must be positive"));
        }
        Ok(())
    }

    /// Whether a rejection from this rule should block the request.
    pub fn blocks(&self) -> bool {
        self.action != Action::Warn
    }
}

/// A set of rules as written in configuration files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RateLimitRule>,
}

impl RuleSet {
    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse rules from YAML.
    ///
    /// Accepts either a bare list of rules or a mapping with a `rules` key.
    /// An empty document yields no rules.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let parse_error = |e: serde_yaml::Error| {
            RateLimitError::Config(format!("Failed to parse rate limit rules: {}", e))
        };

        let value: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(parse_error)?;
        match value {
            serde_yaml::Value::Null => Ok(Self::default()),
            serde_yaml::Value::Sequence(_) => {
                let rules = serde_yaml::from_value(value).map_err(parse_error)?;
                Ok(Self { rules })
            }
            _ => serde_yaml::from_value(value).map_err(parse_error),
        }
    }

    /// Validate every rule and reject duplicate names.
    pub fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !seen.insert(rule.name.as_str()) {
                return Err(RateLimitError::Config(format!(
                    "duplicate rule name '{}'",
                    rule.name
                )));
            }
        }
        Ok(())
    }
}

/// Sort rules into evaluation order: ascending priority, then name.
pub fn sort_by_priority(rules: &mut [RateLimitRule]) {
    rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.name.cmp(&b.name)));
}

/// Rules applied when configuration doesn't provide any.
///
/// Mirrors the limits the platform API shipped with: a general per-IP
/// ceiling, a larger per-user budget for authenticated callers, brute-force
/// protection on login, and a tighter budget for file uploads.
pub fn default_rules() -> Vec<RateLimitRule> {
    vec![
        RateLimitRule::new("auth_login", 5, 300)
            .with_scope(Scope::Ip)
            .with_priority(10)
            .with_condition("endpoint", Value::from(vec!["auth.login", "/api/v1/auth/login"])),
        RateLimitRule::new("file_upload", 10, 60)
            .with_scope(Scope::User)
            .with_priority(20)
            .with_condition("has_files", true),
        RateLimitRule::new("api_authenticated", 1000, 3600)
            .with_scope(Scope::User)
            .with_algorithm(Algorithm::TokenBucket)
            .with_priority(50)
            .with_condition("authenticated", true)
            .with_exemption("admin"),
        RateLimitRule::new("api_general", 100, 60)
            .with_scope(Scope::Ip)
            .with_priority(DEFAULT_PRIORITY)
            .with_condition("authenticated", false),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rule_list() {
        let yaml = r#"
- name: login
  limit: 5
  period: 300
  scope: ip
- name: uploads
  limit: 10
  period: 60
  scope: user
  algorithm: token_bucket
  priority: 5
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        assert_eq!(set.rules.len(), 2);

        let login = &set.rules[0];
        assert_eq!(login.scope, Scope::Ip);
        assert_eq!(login.algorithm, Algorithm::SlidingWindow);
        assert_eq!(login.priority, DEFAULT_PRIORITY);
        assert!(login.enabled);

        let uploads = &set.rules[1];
        assert_eq!(uploads.algorithm, Algorithm::TokenBucket);
        assert_eq!(uploads.priority, 5);
    }

    #[test]
    fn test_parse_rules_mapping_with_conditions() {
        let yaml = r#"
rules:
  - name: mentors
    limit: 50
    period: 60
    scope: user_type
    action: warn
    conditions:
      method: [POST, PUT]
      authenticated: true
    exemptions: [admin, 10.0.0.1]
"#;
        let set = RuleSet::from_yaml(yaml).unwrap();
        let rule = &set.rules[0];
        assert_eq!(rule.scope, Scope::UserType);
        assert_eq!(rule.action, Action::Warn);
        assert!(!rule.blocks());
        assert_eq!(rule.conditions["authenticated"], Value::Bool(true));
        assert!(rule.conditions["method"].is_array());
        assert!(rule.exemptions.contains("10.0.0.1"));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        let result = RuleSet::from_yaml("rules: [[[");
        assert!(matches!(result, Err(RateLimitError::Config(_))));
    }

    #[test]
    fn test_parse_rule_list_reports_field_error() {
        let yaml = r#"
- name: login
  limit: 5
  period: 300
  scope: ipp
"#;
        let err = RuleSet::from_yaml(yaml).unwrap_err().to_string();
        assert!(err.contains("ipp"), "unexpected error: {err}");
        assert!(!err.contains("missing field"), "unexpected error: {err}");
    }

    #[test]
    fn test_parse_empty_document() {
        assert!(RuleSet::from_yaml("").unwrap().rules.is_empty());
    }

    #[test]
    fn test_sort_by_priority_breaks_ties_by_name() {
        let mut rules = vec![
            RateLimitRule::new("b", 1, 1).with_priority(10),
            RateLimitRule::new("c", 1, 1).with_priority(1),
            RateLimitRule::new("a", 1, 1).with_priority(10),
        ];
        sort_by_priority(&mut rules);
        let names: Vec<&str> = rules.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["c", "a", "b"]);
    }

    #[test]
    fn test_validate_rejects_non_positive_values() {
        assert!(RateLimitRule::new("ok", 1, 1).validate().is_ok());
        assert!(matches!(
            RateLimitRule::new("zero_limit", 0, 60).validate(),
            Err(RateLimitError::InvalidRule { .. })
        ));
        assert!(matches!(
            RateLimitRule::new("zero_period", 5, 0).validate(),
            Err(RateLimitError::InvalidRule { .. })
        ));
        assert!(RateLimitRule::new("  ", 5, 10).validate().is_err());
    }

    #[test]
    fn test_rule_set_rejects_duplicates() {
        let set = RuleSet {
            rules: vec![RateLimitRule::new("a", 1, 1), RateLimitRule::new("a", 2, 2)],
        };
        assert!(set.validate().is_err());
    }

    #[test]
    fn test_default_rules_are_valid() {
        let set = RuleSet {
            rules: default_rules(),
        };
        set.validate().unwrap();
        assert!(set.rules.iter().any(|r| r.name == "auth_login" && r.limit == 5));
    }

    #[test]
    fn test_scope_prefixes() {
        assert_eq!(Scope::Global.as_str(), "global");
        assert_eq!(Scope::UserType.as_str(), "user_type");
        assert_eq!(Scope::ApiKey.as_str(), "api_key");
    }
}
