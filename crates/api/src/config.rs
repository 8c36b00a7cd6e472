//! Engine configuration, with `CENSUS_*` environment overrides.

use std::time::Duration;

use census_kubehub::context::DEFAULT_IDLE_WINDOW;
use census_kubehub::lister::DEFAULT_PAGE_SIZE;
use census_kubehub::{ListOptions, RetryPolicy, RunContext};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// List only this type (kind or resource name); `None` discovers everything.
    pub resource_type: Option<String>,
    /// Page size; `<= 0` lists each type in one unbounded request.
    pub limit: i64,
    /// Client-side request rate; `<= 0` disables throttling.
    pub qps: f32,
    pub burst: u32,
    pub stream: bool,
    pub include_status: bool,
    pub include_metadata: bool,
    /// Wall-clock bound for the whole run; `None` is unbounded.
    pub hard_deadline_secs: Option<u64>,
    pub idle_timeout_secs: u64,
    pub call_timeout_secs: u64,
    pub namespace: Option<String>,
    /// Kubeconfig context; `None` uses the current context or in-cluster config.
    pub context: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            resource_type: None,
            limit: DEFAULT_PAGE_SIZE,
            qps: 50.0,
            burst: 100,
            stream: false,
            include_status: false,
            include_metadata: false,
            hard_deadline_secs: Some(3600),
            idle_timeout_secs: DEFAULT_IDLE_WINDOW.as_secs(),
            call_timeout_secs: 30,
            namespace: None,
            context: None,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_str(key).and_then(|s| s.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

impl EngineConfig {
    /// Defaults overridden by any `CENSUS_*` variables that are set and parse.
    pub fn from_env() -> Self {
        let mut c = Self::default();
        if let Some(v) = env_str("CENSUS_RESOURCE_TYPE") { c.resource_type = Some(v); }
        if let Some(v) = env_parse("CENSUS_LIMIT") { c.limit = v; }
        if let Some(v) = env_parse("CENSUS_QPS") { c.qps = v; }
        if let Some(v) = env_parse("CENSUS_BURST") { c.burst = v; }
        if let Some(v) = env_bool("CENSUS_STREAM") { c.stream = v; }
        if let Some(v) = env_bool("CENSUS_INCLUDE_STATUS") { c.include_status = v; }
        if let Some(v) = env_bool("CENSUS_INCLUDE_METADATA") { c.include_metadata = v; }
        // 0 disables the hard deadline
        if let Some(v) = env_parse::<u64>("CENSUS_HARD_DEADLINE_SECS") { c.hard_deadline_secs = (v > 0).then_some(v); }
        if let Some(v) = env_parse("CENSUS_IDLE_TIMEOUT_SECS") { c.idle_timeout_secs = v; }
        if let Some(v) = env_parse("CENSUS_CALL_TIMEOUT_SECS") { c.call_timeout_secs = v; }
        if let Some(v) = env_str("CENSUS_NAMESPACE") { c.namespace = Some(v); }
        if let Some(v) = env_str("CENSUS_CONTEXT") { c.context = Some(v); }
        c
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }

    pub fn idle_window(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs.max(1))
    }

    /// A fresh context carrying this config's hard deadline and idle window.
    pub fn run_context(&self) -> RunContext {
        RunContext::new(self.hard_deadline_secs.map(Duration::from_secs), self.idle_window())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy { call_timeout: self.call_timeout(), ..RetryPolicy::default() }
    }

    pub fn list_options(&self) -> ListOptions {
        ListOptions {
            page_size: self.limit,
            include_metadata: self.include_metadata,
            include_status: self.include_status,
            namespace: self.namespace.clone(),
            sink: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = EngineConfig::default();
        assert_eq!(c.limit, 5000);
        assert_eq!(c.idle_window(), Duration::from_secs(180));
        assert_eq!(c.call_timeout(), Duration::from_secs(30));
        assert_eq!(c.retry_policy().steps, 5);
        assert!(c.resource_type.is_none());
    }

    #[test]
    fn partial_json_fills_defaults() {
        let c: EngineConfig = serde_json::from_str(r#"{"resource_type":"pods","limit":0,"stream":true}"#).expect("parse");
        assert_eq!(c.resource_type.as_deref(), Some("pods"));
        assert_eq!(c.list_options().page_size, 0);
        assert!(c.stream);
        assert_eq!(c.burst, EngineConfig::default().burst);
    }

    #[test]
    fn env_overrides() {
        std::env::set_var("CENSUS_LIMIT", "250");
        std::env::set_var("CENSUS_INCLUDE_STATUS", "true");
        std::env::set_var("CENSUS_HARD_DEADLINE_SECS", "0");
        std::env::set_var("CENSUS_NAMESPACE", "  ");
        let c = EngineConfig::from_env();
        std::env::remove_var("CENSUS_LIMIT");
        std::env::remove_var("CENSUS_INCLUDE_STATUS");
        std::env::remove_var("CENSUS_HARD_DEADLINE_SECS");
        std::env::remove_var("CENSUS_NAMESPACE");
        assert_eq!(c.limit, 250);
        assert!(c.include_status);
        assert_eq!(c.hard_deadline_secs, None);
        assert_eq!(c.namespace, None);
    }
}
