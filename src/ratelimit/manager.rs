//! Rule registry and request evaluation.
//!
//! The manager owns the registered rules and the allow/deny lists, derives a
//! counter key per rule from the request context, and runs each applicable
//! rule's limiter in priority order until one rejects.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::algorithm::{build_limiter, fixed_window_key, history_key};
use super::backend::RateLimitBackend;
use super::context::RequestContext;
use super::limiter::{FailurePolicy, Limiter, SharedBackend};
use super::result::{Outcome, RateLimitResult};
use super::rules::{sort_by_priority, Algorithm, RateLimitRule, Scope};
use crate::error::Result;

const ALGORITHMS: [Algorithm; 4] = [
    Algorithm::SlidingWindow,
    Algorithm::TokenBucket,
    Algorithm::FixedWindow,
    Algorithm::Adaptive,
];

/// Placeholder for missing user-like scope values.
const ANONYMOUS: &str = "anonymous";
/// Placeholder for missing network-like scope values.
const UNKNOWN: &str = "unknown";

/// Read-only view of one caller's counter for one rule.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsageSnapshot {
    pub rule_name: String,
    pub key: String,
    pub current_usage: u64,
    pub remaining: u64,
    pub limit: u64,
}

/// Evaluates requests against a set of rate limit rules.
///
/// Construct one per application and pass it to whatever handles requests.
/// Rule and list mutations take effect for subsequent checks.
pub struct RateLimitManager {
    rules: RwLock<HashMap<String, RateLimitRule>>,
    whitelist: RwLock<HashSet<String>>,
    blacklist: RwLock<HashSet<String>>,
    limiters: HashMap<Algorithm, Arc<dyn Limiter>>,
    backend: SharedBackend,
}

/// Builder for [`RateLimitManager`].
pub struct RateLimitManagerBuilder {
    backend: SharedBackend,
    policy: FailurePolicy,
    rules: Vec<RateLimitRule>,
    whitelist: HashSet<String>,
    blacklist: HashSet<String>,
    limiters: HashMap<Algorithm, Arc<dyn Limiter>>,
}

impl RateLimitManagerBuilder {
    /// How limiters resolve backend failures. Defaults to fail-open.
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn rule(mut self, rule: RateLimitRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(mut self, rules: impl IntoIterator<Item = RateLimitRule>) -> Self {
        self.rules.extend(rules);
        self
    }

    pub fn whitelist(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.whitelist.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn blacklist(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.blacklist.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Use a specific limiter for one algorithm instead of the default one
    /// built on the shared backend.
    pub fn limiter(mut self, algorithm: Algorithm, limiter: Arc<dyn Limiter>) -> Self {
        self.limiters.insert(algorithm, limiter);
        self
    }

    /// Validate the rules and build the manager.
    pub fn build(self) -> Result<RateLimitManager> {
        let mut limiters = self.limiters;
        for algorithm in ALGORITHMS {
            limiters
                .entry(algorithm)
                .or_insert_with(|| build_limiter(algorithm, self.backend.clone(), self.policy));
        }

        let manager = RateLimitManager {
            rules: RwLock::new(HashMap::new()),
            whitelist: RwLock::new(self.whitelist),
            blacklist: RwLock::new(self.blacklist),
            limiters,
            backend: self.backend,
        };
        for rule in self.rules {
            manager.add_rule(rule)?;
        }
        Ok(manager)
    }
}

impl RateLimitManager {
    /// Manager with no rules, fail-open limiters on `backend`.
    pub fn new(backend: SharedBackend) -> Self {
        let limiters = ALGORITHMS
            .into_iter()
            .map(|a| (a, build_limiter(a, backend.clone(), FailurePolicy::default())))
            .collect();
        Self {
            rules: RwLock::new(HashMap::new()),
            whitelist: RwLock::new(HashSet::new()),
            blacklist: RwLock::new(HashSet::new()),
            limiters,
            backend,
        }
    }

    pub fn builder(backend: SharedBackend) -> RateLimitManagerBuilder {
        RateLimitManagerBuilder {
            backend,
            policy: FailurePolicy::default(),
            rules: Vec::new(),
            whitelist: HashSet::new(),
            blacklist: HashSet::new(),
            limiters: HashMap::new(),
        }
    }

    /// The backend shared by the default limiters.
    pub fn backend(&self) -> &dyn RateLimitBackend {
        self.backend.as_ref()
    }

    /// Register a rule, replacing any rule with the same name.
    pub fn add_rule(&self, rule: RateLimitRule) -> Result<()> {
        rule.validate()?;
        info!(
            rule = %rule.name,
            limit = rule.limit,
            period = rule.period,
            scope = ?rule.scope,
            algorithm = ?rule.algorithm,
            priority = rule.priority,
            "Registered rate limit rule"
        );
        self.rules.write().insert(rule.name.clone(), rule);
        Ok(())
    }

    /// Unregister a rule by name.
    pub fn remove_rule(&self, name: &str) -> Option<RateLimitRule> {
        let removed = self.rules.write().remove(name);
        if removed.is_some() {
            info!(rule = %name, "Removed rate limit rule");
        }
        removed
    }

    pub fn get_rule(&self, name: &str) -> Option<RateLimitRule> {
        self.rules.read().get(name).cloned()
    }

    /// All rules in evaluation order.
    pub fn rules(&self) -> Vec<RateLimitRule> {
        let mut rules: Vec<RateLimitRule> = self.rules.read().values().cloned().collect();
        sort_by_priority(&mut rules);
        rules
    }

    /// Enable or disable a rule. Returns false if no such rule exists.
    pub fn set_rule_enabled(&self, name: &str, enabled: bool) -> bool {
        let mut rules = self.rules.write();
        match rules.get(name) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.enabled = enabled;
                rules.insert(name.to_string(), updated);
                true
            }
            None => false,
        }
    }

    pub fn add_to_whitelist(&self, id: impl Into<String>) {
        self.whitelist.write().insert(id.into());
    }

    pub fn remove_from_whitelist(&self, id: &str) -> bool {
        self.whitelist.write().remove(id)
    }

    pub fn add_to_blacklist(&self, id: impl Into<String>) {
        let id = id.into();
        info!(id = %id, "Blacklisted identity");
        self.blacklist.write().insert(id);
    }

    pub fn remove_from_blacklist(&self, id: &str) -> bool {
        self.blacklist.write().remove(id)
    }

    pub fn is_whitelisted(&self, id: &str) -> bool {
        self.whitelist.read().contains(id)
    }

    /// Whether the context's user id or IP is blacklisted.
    pub fn is_blacklisted(&self, ctx: &RequestContext) -> bool {
        let blacklist = self.blacklist.read();
        [&ctx.user_id, &ctx.ip]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .any(|id| blacklist.contains(id))
    }

    /// Counter key for `rule` under `ctx`: `{scope}:{value}:{rule}`.
    pub fn generate_key(rule: &RateLimitRule, ctx: &RequestContext) -> String {
        let value = |v: &Option<String>, fallback: &'static str| {
            v.as_deref().unwrap_or(fallback).to_string()
        };
        let scope_value = match rule.scope {
            Scope::Global => return format!("{}:{}", Scope::Global.as_str(), rule.name),
            Scope::Ip => value(&ctx.ip, UNKNOWN),
            Scope::User => value(&ctx.user_id, ANONYMOUS),
            Scope::Endpoint => value(&ctx.endpoint, UNKNOWN),
            Scope::UserType => value(&ctx.user_type, ANONYMOUS),
            Scope::ApiKey => value(&ctx.api_key, ANONYMOUS),
        };
        format!("{}:{}:{}", rule.scope.as_str(), scope_value, rule.name)
    }

    /// True when every condition of `rule` is satisfied by `ctx`.
    fn matches_conditions(rule: &RateLimitRule, ctx: &RequestContext) -> bool {
        rule.conditions.iter().all(|(key, expected)| match ctx.field(key) {
            Some(actual) => match expected {
                Value::Array(options) => options.iter().any(|o| values_match(o, &actual)),
                single => values_match(single, &actual),
            },
            None => false,
        })
    }

    /// True when the caller bypasses `rule` through its exemptions or the whitelist.
    fn is_exempt(&self, rule: &RateLimitRule, ctx: &RequestContext) -> bool {
        let whitelist = self.whitelist.read();
        ctx.identities()
            .any(|id| rule.exemptions.contains(id) || whitelist.contains(id))
    }

    /// Enabled rules in evaluation order.
    fn active_rules(&self) -> Vec<RateLimitRule> {
        let mut rules: Vec<RateLimitRule> = self
            .rules
            .read()
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();
        sort_by_priority(&mut rules);
        rules
    }

    fn limiter(&self, algorithm: Algorithm) -> &Arc<dyn Limiter> {
        // Every algorithm gets a limiter at construction.
        &self.limiters[&algorithm]
    }

    /// Evaluate every applicable rule for a request.
    ///
    /// Rules run in ascending priority and evaluation stops at the first
    /// rejection. Blacklisted callers get a single rejection without any rule
    /// being consulted. An empty outcome means no rule applied.
    pub async fn check_rate_limit(&self, ctx: &RequestContext) -> Result<Outcome> {
        if self.is_blacklisted(ctx) {
            debug!(ip = ?ctx.ip, user_id = ?ctx.user_id, "Rejected blacklisted caller");
            return Ok(Outcome::new(vec![RateLimitResult::blacklisted(
                self.backend.now(),
            )]));
        }

        let mut results = Vec::new();
        for rule in self.active_rules() {
            if !Self::matches_conditions(&rule, ctx) {
                trace!(rule = %rule.name, "Rule conditions not met");
                continue;
            }
            if self.is_exempt(&rule, ctx) {
                trace!(rule = %rule.name, "Caller exempt from rule");
                continue;
            }

            let key = Self::generate_key(&rule, ctx);
            let mut result = self.limiter(rule.algorithm).check_limit(&key, &rule).await?;

            if !result.allowed && !rule.blocks() {
                warn!(
                    rule = %rule.name,
                    key = %key,
                    usage = result.current_usage,
                    limit = result.total_limit,
                    "Rate limit exceeded (warn only)"
                );
                result = result.into_allowed();
            }

            let rejected = !result.allowed;
            results.push(result);
            if rejected {
                break;
            }
        }

        Ok(Outcome::new(results))
    }

    /// Clear the counters `rule_name` keeps for the caller described by `ctx`.
    ///
    /// Returns `Ok(false)` if the rule doesn't exist or held no state.
    pub async fn reset(&self, ctx: &RequestContext, rule_name: &str) -> Result<bool> {
        let Some(rule) = self.get_rule(rule_name) else {
            return Ok(false);
        };
        let key = Self::generate_key(&rule, ctx);
        let backend = self.limiter(rule.algorithm).backend().clone();

        let cleared = match rule.algorithm {
            Algorithm::SlidingWindow | Algorithm::TokenBucket => backend.reset(&key).await?,
            Algorithm::FixedWindow => {
                let window_key = fixed_window_key(&key, backend.now(), rule.period);
                backend.reset(&window_key).await?
            }
            Algorithm::Adaptive => {
                let window = backend.reset(&key).await?;
                let history = backend.reset(&history_key(&key)).await?;
                window || history
            }
        };

        info!(rule = %rule_name, key = %key, cleared, "Reset rate limit counters");
        Ok(cleared)
    }

    /// Current usage of `rule_name` by the caller described by `ctx`,
    /// without recording an event. `None` if the rule doesn't exist.
    pub async fn usage(&self, ctx: &RequestContext, rule_name: &str) -> Result<Option<UsageSnapshot>> {
        let Some(rule) = self.get_rule(rule_name) else {
            return Ok(None);
        };
        let key = Self::generate_key(&rule, ctx);
        let backend = self.limiter(rule.algorithm).backend().clone();

        let current_usage = match rule.algorithm {
            Algorithm::SlidingWindow | Algorithm::Adaptive => {
                backend.get_usage(&key, rule.period).await?
            }
            Algorithm::FixedWindow => {
                let window_key = fixed_window_key(&key, backend.now(), rule.period);
                backend.get_usage(&window_key, rule.period).await?
            }
            Algorithm::TokenBucket => {
                let rate = rule.limit as f64 / rule.period as f64;
                let tokens = backend.peek_tokens(&key, rule.limit, rate).await?;
                rule.limit - (tokens.floor() as u64).min(rule.limit)
            }
        };

        Ok(Some(UsageSnapshot {
            rule_name: rule.name,
            key,
            current_usage,
            remaining: rule.limit.saturating_sub(current_usage),
            limit: rule.limit,
        }))
    }

    /// Remove stale counter state from the shared backend.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let removed = self.backend.cleanup_expired().await?;
        debug!(removed, backend = self.backend.name(), "Expired rate limit state cleaned up");
        Ok(removed)
    }
}

/// Compare a condition value with a context value.
///
/// Scalars also match on their string form, so `"42"` matches `42` and
/// `"true"` matches `true`.
fn values_match(expected: &Value, actual: &Value) -> bool {
    if expected == actual {
        return true;
    }
    match (scalar_text(expected), scalar_text(actual)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::algorithm::{SlidingWindowLimiter, TokenBucketLimiter};
    use crate::ratelimit::backend::{MemoryBackend, SqliteBackend};
    use crate::ratelimit::result::BLACKLIST_RULE;
    use crate::ratelimit::rules::Action;
    use crate::ratelimit::testing::{CountingBackend, FailingBackend};
    use crate::RateLimitError;

    fn memory_manager() -> (RateLimitManager, Arc<MockClock>) {
        let clock = Arc::new(MockClock::default());
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        (RateLimitManager::new(backend), clock)
    }

    fn login_rule() -> RateLimitRule {
        RateLimitRule::new("login", 5, 300).with_scope(Scope::Ip)
    }

    #[test]
    fn test_generate_key_per_scope() {
        let ctx = RequestContext::new()
            .with_ip("1.2.3.4")
            .with_user("u1")
            .with_user_type("ally")
            .with_endpoint("users.list")
            .with_api_key("k-123");

        let key = |scope| RateLimitManager::generate_key(&RateLimitRule::new("r", 1, 1).with_scope(scope), &ctx);
        assert_eq!(key(Scope::Global), "global:r");
        assert_eq!(key(Scope::Ip), "ip:1.2.3.4:r");
        assert_eq!(key(Scope::User), "user:u1:r");
        assert_eq!(key(Scope::Endpoint), "endpoint:users.list:r");
        assert_eq!(key(Scope::UserType), "user_type:ally:r");
        assert_eq!(key(Scope::ApiKey), "api_key:k-123:r");
    }

    #[test]
    fn test_generate_key_missing_values() {
        let ctx = RequestContext::new();
        let user = RateLimitRule::new("r", 1, 1).with_scope(Scope::User);
        let ip = RateLimitRule::new("r", 1, 1).with_scope(Scope::Ip);
        assert_eq!(RateLimitManager::generate_key(&user, &ctx), "user:anonymous:r");
        assert_eq!(RateLimitManager::generate_key(&ip, &ctx), "ip:unknown:r");
    }

    #[test]
    fn test_matches_conditions() {
        let ctx = RequestContext::new()
            .with_method("POST")
            .with_user("42")
            .with_extra("plan", "pro");

        let rule = RateLimitRule::new("r", 1, 1)
            .with_condition("method", Value::from(vec!["POST", "PUT"]))
            .with_condition("authenticated", true)
            .with_condition("user_id", 42)
            .with_condition("plan", "pro");
        assert!(RateLimitManager::matches_conditions(&rule, &ctx));

        let wrong_method = RateLimitRule::new("r", 1, 1).with_condition("method", "GET");
        assert!(!RateLimitManager::matches_conditions(&wrong_method, &ctx));

        let absent_key = RateLimitRule::new("r", 1, 1).with_condition("endpoint", "x");
        assert!(!RateLimitManager::matches_conditions(&absent_key, &ctx));

        let no_conditions = RateLimitRule::new("r", 1, 1);
        assert!(RateLimitManager::matches_conditions(&no_conditions, &ctx));
    }

    #[test]
    fn test_add_rule_validates() {
        let (manager, _) = memory_manager();
        assert!(matches!(
            manager.add_rule(RateLimitRule::new("bad", 5, 0)),
            Err(RateLimitError::InvalidRule { .. })
        ));
        assert!(manager.add_rule(RateLimitRule::new("bad", 0, 10)).is_err());
        assert!(manager.rules().is_empty());
    }

    #[test]
    fn test_registry_last_write_wins() {
        let (manager, _) = memory_manager();
        manager.add_rule(RateLimitRule::new("r", 5, 60)).unwrap();
        manager.add_rule(RateLimitRule::new("r", 10, 60)).unwrap();

        assert_eq!(manager.rules().len(), 1);
        assert_eq!(manager.get_rule("r").unwrap().limit, 10);

        assert!(manager.remove_rule("r").is_some());
        assert!(manager.remove_rule("r").is_none());
    }

    #[test]
    fn test_rules_sorted_by_priority_then_name() {
        let (manager, _) = memory_manager();
        manager.add_rule(RateLimitRule::new("c", 1, 1).with_priority(5)).unwrap();
        manager.add_rule(RateLimitRule::new("b", 1, 1).with_priority(1)).unwrap();
        manager.add_rule(RateLimitRule::new("a", 1, 1).with_priority(5)).unwrap();

        let names: Vec<String> = manager.rules().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let (manager, clock) = memory_manager();
        manager.add_rule(login_rule()).unwrap();
        let ctx = RequestContext::new().with_ip("1.2.3.4");

        for expected in [4, 3, 2, 1, 0] {
            let outcome = manager.check_rate_limit(&ctx).await.unwrap();
            assert!(outcome.is_allowed());
            assert_eq!(outcome.primary().unwrap().remaining, expected);
            clock.advance(2.0);
        }

        let outcome = manager.check_rate_limit(&ctx).await.unwrap();
        let rejection = outcome.rejection().unwrap();
        assert_eq!(rejection.rule_name, "login");
        assert_eq!(rejection.retry_after, Some(300));
    }

    #[tokio::test]
    async fn test_backends_are_interchangeable() {
        async fn pattern(backend: SharedBackend, clock: Arc<MockClock>) -> Vec<bool> {
            let manager = RateLimitManager::builder(backend)
                .rule(login_rule())
                .build()
                .unwrap();
            let ctx = RequestContext::new().with_ip("1.2.3.4");

            let mut allowed = Vec::new();
            for _ in 0..7 {
                allowed.push(manager.check_rate_limit(&ctx).await.unwrap().is_allowed());
                clock.advance(1.5);
            }
            // After the window passes the caller is admitted again
            clock.advance(300.0);
            allowed.push(manager.check_rate_limit(&ctx).await.unwrap().is_allowed());
            allowed
        }

        let memory_clock = Arc::new(MockClock::default());
        let memory = pattern(
            Arc::new(MemoryBackend::with_clock(memory_clock.clone())),
            memory_clock,
        )
        .await;

        let sqlite_clock = Arc::new(MockClock::default());
        let sqlite = SqliteBackend::in_memory()
            .await
            .unwrap()
            .with_clock(sqlite_clock.clone());
        let sqlite = pattern(Arc::new(sqlite), sqlite_clock).await;

        assert_eq!(memory, vec![true, true, true, true, true, false, false, true]);
        assert_eq!(memory, sqlite);
    }

    #[tokio::test]
    async fn test_key_isolation_between_users() {
        let (manager, _) = memory_manager();
        manager
            .add_rule(RateLimitRule::new("per_user", 2, 60).with_scope(Scope::User))
            .unwrap();

        let alice = RequestContext::new().with_user("alice");
        let bob = RequestContext::new().with_user("bob");

        assert!(manager.check_rate_limit(&alice).await.unwrap().is_allowed());
        assert!(manager.check_rate_limit(&alice).await.unwrap().is_allowed());
        assert!(!manager.check_rate_limit(&alice).await.unwrap().is_allowed());

        let outcome = manager.check_rate_limit(&bob).await.unwrap();
        assert!(outcome.is_allowed());
        assert_eq!(outcome.primary().unwrap().remaining, 1);
    }

    #[tokio::test]
    async fn test_priority_fail_fast() {
        let clock = Arc::new(MockClock::default());
        let r1_backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        let r2_backend = Arc::new(CountingBackend::new(clock.clone()));

        let manager = RateLimitManager::builder(r1_backend.clone())
            .limiter(
                Algorithm::SlidingWindow,
                Arc::new(SlidingWindowLimiter::new(r1_backend.clone())),
            )
            .limiter(
                Algorithm::TokenBucket,
                Arc::new(TokenBucketLimiter::new(r2_backend.clone())),
            )
            .rule(RateLimitRule::new("r1", 1, 60).with_priority(10))
            .rule(
                RateLimitRule::new("r2", 100, 60)
                    .with_priority(20)
                    .with_algorithm(Algorithm::TokenBucket),
            )
            .build()
            .unwrap();
        let ctx = RequestContext::new().with_ip("1.2.3.4");

        // R1 consumes its single slot; both rules run
        let outcome = manager.check_rate_limit(&ctx).await.unwrap();
        assert_eq!(outcome.len(), 2);
        let calls_after_first = r2_backend.calls();
        assert_eq!(calls_after_first, 1);

        // R1 now rejects; R2 is never consulted
        let outcome = manager.check_rate_limit(&ctx).await.unwrap();
        assert_eq!(outcome.len(), 1);
        assert_eq!(outcome.results()[0].rule_name, "r1");
        assert!(!outcome.is_allowed());
        assert_eq!(r2_backend.calls(), calls_after_first);
    }

    #[tokio::test]
    async fn test_exemption_bypasses_rule() {
        let clock = Arc::new(MockClock::default());
        let backend = Arc::new(CountingBackend::new(clock));
        let manager = RateLimitManager::builder(backend.clone())
            .rule(
                RateLimitRule::new("strict", 1, 60)
                    .with_scope(Scope::User)
                    .with_exemption("vip"),
            )
            .build()
            .unwrap();

        let vip = RequestContext::new().with_user("vip");
        for _ in 0..5 {
            let outcome = manager.check_rate_limit(&vip).await.unwrap();
            assert!(outcome.is_allowed());
            assert!(outcome.is_empty());
        }
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_exemption_by_user_type_and_whitelist() {
        let (manager, _) = memory_manager();
        manager
            .add_rule(RateLimitRule::new("strict", 1, 60).with_exemption("admin"))
            .unwrap();

        let admin = RequestContext::new().with_ip("5.5.5.5").with_user_type("admin");
        assert!(manager.check_rate_limit(&admin).await.unwrap().is_empty());
        assert!(manager.check_rate_limit(&admin).await.unwrap().is_empty());

        manager.add_to_whitelist("6.6.6.6");
        let trusted = RequestContext::new().with_ip("6.6.6.6");
        assert!(manager.check_rate_limit(&trusted).await.unwrap().is_empty());
        assert!(manager.is_whitelisted("6.6.6.6"));
        assert!(manager.remove_from_whitelist("6.6.6.6"));
        assert_eq!(manager.check_rate_limit(&trusted).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_blacklist_short_circuits() {
        let clock = Arc::new(MockClock::default());
        let backend = Arc::new(CountingBackend::new(clock));
        let manager = RateLimitManager::builder(backend.clone())
            .rule(RateLimitRule::new("r", 100, 60))
            .blacklist(["9.9.9.9"])
            .build()
            .unwrap();

        let ctx = RequestContext::new().with_ip("9.9.9.9");
        let outcome = manager.check_rate_limit(&ctx).await.unwrap();
        assert_eq!(outcome.len(), 1);
        let result = &outcome.results()[0];
        assert_eq!(result.rule_name, BLACKLIST_RULE);
        assert_eq!(result.retry_after, Some(86_400));
        assert_eq!(backend.calls(), 0);

        assert!(manager.remove_from_blacklist("9.9.9.9"));
        assert!(manager.check_rate_limit(&ctx).await.unwrap().is_allowed());

        manager.add_to_blacklist("mallory");
        let by_user = RequestContext::new().with_user("mallory");
        assert!(!manager.check_rate_limit(&by_user).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_disabled_and_non_matching_rules_skipped() {
        let (manager, _) = memory_manager();
        manager
            .add_rule(RateLimitRule::new("off", 1, 60).disabled())
            .unwrap();
        manager
            .add_rule(RateLimitRule::new("uploads", 1, 60).with_condition("has_files", true))
            .unwrap();

        let ctx = RequestContext::new().with_ip("1.1.1.1");
        assert!(manager.check_rate_limit(&ctx).await.unwrap().is_empty());

        let upload = ctx.clone().with_files(true);
        let outcome = manager.check_rate_limit(&upload).await.unwrap();
        assert_eq!(outcome.primary().unwrap().rule_name, "uploads");

        assert!(manager.set_rule_enabled("off", true));
        assert!(!manager.set_rule_enabled("missing", true));
        assert_eq!(manager.check_rate_limit(&ctx).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_warn_action_allows() {
        let (manager, _) = memory_manager();
        manager
            .add_rule(RateLimitRule::new("soft", 1, 60).with_action(Action::Warn))
            .unwrap();
        let ctx = RequestContext::new().with_ip("1.1.1.1");

        assert!(manager.check_rate_limit(&ctx).await.unwrap().is_allowed());
        let outcome = manager.check_rate_limit(&ctx).await.unwrap();
        assert!(outcome.is_allowed());
        assert_eq!(outcome.primary().unwrap().current_usage, 1);
    }

    #[tokio::test]
    async fn test_failure_policy_from_builder() {
        let rule = RateLimitRule::new("r", 10, 60);
        let ctx = RequestContext::new().with_ip("1.1.1.1");

        let open = RateLimitManager::builder(Arc::new(FailingBackend))
            .rule(rule.clone())
            .build()
            .unwrap();
        assert!(open.check_rate_limit(&ctx).await.unwrap().is_allowed());

        let closed = RateLimitManager::builder(Arc::new(FailingBackend))
            .failure_policy(FailurePolicy::Closed)
            .rule(rule.clone())
            .build()
            .unwrap();
        assert!(!closed.check_rate_limit(&ctx).await.unwrap().is_allowed());

        let propagate = RateLimitManager::builder(Arc::new(FailingBackend))
            .failure_policy(FailurePolicy::Propagate)
            .rule(rule)
            .build()
            .unwrap();
        assert!(propagate.check_rate_limit(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_reset_clears_caller_state() {
        let (manager, _) = memory_manager();
        manager.add_rule(login_rule()).unwrap();
        manager
            .add_rule(
                RateLimitRule::new("adaptive", 1, 60)
                    .with_algorithm(Algorithm::Adaptive)
                    .with_priority(200),
            )
            .unwrap();
        let ctx = RequestContext::new().with_ip("1.2.3.4");

        for _ in 0..5 {
            manager.check_rate_limit(&ctx).await.unwrap();
        }
        assert!(!manager.check_rate_limit(&ctx).await.unwrap().is_allowed());

        assert!(manager.reset(&ctx, "login").await.unwrap());
        assert!(manager.reset(&ctx, "adaptive").await.unwrap());
        assert!(!manager.reset(&ctx, "missing").await.unwrap());
        assert!(manager.check_rate_limit(&ctx).await.unwrap().is_allowed());
    }

    #[tokio::test]
    async fn test_usage_snapshot() {
        let (manager, _) = memory_manager();
        manager.add_rule(login_rule()).unwrap();
        manager
            .add_rule(
                RateLimitRule::new("bucket", 4, 40)
                    .with_algorithm(Algorithm::TokenBucket)
                    .with_priority(200),
            )
            .unwrap();
        let ctx = RequestContext::new().with_ip("1.2.3.4");

        manager.check_rate_limit(&ctx).await.unwrap();
        manager.check_rate_limit(&ctx).await.unwrap();

        let login = manager.usage(&ctx, "login").await.unwrap().unwrap();
        assert_eq!(login.key, "ip:1.2.3.4:login");
        assert_eq!(login.current_usage, 2);
        assert_eq!(login.remaining, 3);

        let bucket = manager.usage(&ctx, "bucket").await.unwrap().unwrap();
        assert_eq!(bucket.current_usage, 2);

        // Reading does not consume
        let again = manager.usage(&ctx, "login").await.unwrap().unwrap();
        assert_eq!(again.current_usage, 2);
        assert!(manager.usage(&ctx, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cleanup_expired_delegates_to_backend() {
        let (manager, clock) = memory_manager();
        manager.add_rule(RateLimitRule::new("r", 5, 10)).unwrap();
        manager
            .check_rate_limit(&RequestContext::new().with_ip("1.1.1.1"))
            .await
            .unwrap();

        clock.advance(11.0);
        assert_eq!(manager.cleanup_expired().await.unwrap(), 1);
    }
}
