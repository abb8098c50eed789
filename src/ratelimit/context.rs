//! Request context consumed by rule matching and key derivation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// What the rate limiter knows about an inbound request.
///
/// Named fields cover the values the built-in scopes and common conditions
/// need. Anything else a rule wants to match on goes in `extra`, which is
/// consulted after the named fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Client IP address
    #[serde(default)]
    pub ip: Option<String>,
    /// Authenticated user id
    #[serde(default)]
    pub user_id: Option<String>,
    /// User type / role (e.g. "entrepreneur", "ally", "admin")
    #[serde(default)]
    pub user_type: Option<String>,
    /// Endpoint name or path
    #[serde(default)]
    pub endpoint: Option<String>,
    /// HTTP method
    #[serde(default)]
    pub method: Option<String>,
    /// API key presented by the caller
    #[serde(default)]
    pub api_key: Option<String>,
    /// Whether the request carries valid credentials
    #[serde(default)]
    pub authenticated: bool,
    /// Whether the request uploads files
    #[serde(default)]
    pub has_files: bool,
    /// Custom condition keys
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Set the user id; marks the context as authenticated.
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self.authenticated = true;
        self
    }

    pub fn with_user_type(mut self, user_type: impl Into<String>) -> Self {
        self.user_type = Some(user_type.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = Some(method.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_files(mut self, has_files: bool) -> Self {
        self.has_files = has_files;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    /// Look up a field by name for condition matching.
    ///
    /// Returns `None` when the field is unset, which makes any rule
    /// conditioned on it non-matching.
    pub fn field(&self, name: &str) -> Option<Value> {
        let text = |v: &Option<String>| v.as_ref().map(|s| Value::String(s.clone()));
        match name {
            "ip" => text(&self.ip),
            "user_id" => text(&self.user_id),
            "user_type" => text(&self.user_type),
            "endpoint" => text(&self.endpoint),
            "method" => text(&self.method),
            "api_key" => text(&self.api_key),
            "authenticated" => Some(Value::Bool(self.authenticated)),
            "has_files" => Some(Value::Bool(self.has_files)),
            other => self.extra.get(other).cloned(),
        }
    }

    /// Identifiers checked against exemptions and allow/deny lists.
    pub fn identities(&self) -> impl Iterator<Item = &str> {
        [&self.user_id, &self.ip, &self.user_type]
            .into_iter()
            .filter_map(|v| v.as_deref())
    }
}
