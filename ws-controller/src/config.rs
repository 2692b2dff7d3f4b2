use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use ws_orchestrator::{Naming, ReconcilerSettings, RetryPolicy};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,

    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_workspaces: usize,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,

    #[serde(default = "default_backoff_max")]
    pub backoff_max_secs: u64,

    #[serde(default = "default_stuck_threshold")]
    pub stuck_threshold: u32,

    #[serde(default = "default_namespace_prefix")]
    pub namespace_prefix: String,

    #[serde(default = "default_ingress_domain")]
    pub ingress_domain: String,

    #[serde(default = "default_release_chart")]
    pub release_chart: String,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("WS_DB_PATH") {
        return PathBuf::from(path);
    }

    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".ws-controller")
        .join("controller.db")
}

fn default_reconcile_interval() -> u64 {
    env_or("WS_RECONCILE_INTERVAL", 30)
}

fn default_call_timeout() -> u64 {
    env_or("WS_CALL_TIMEOUT", 60)
}

fn default_max_concurrent() -> usize {
    env_or("WS_MAX_CONCURRENT", 1)
}

fn default_backoff_base() -> u64 {
    env_or("WS_BACKOFF_BASE", 30)
}

fn default_backoff_max() -> u64 {
    env_or("WS_BACKOFF_MAX", 900) // 15 minutes
}

fn default_stuck_threshold() -> u32 {
    env_or("WS_STUCK_THRESHOLD", 10)
}

fn default_namespace_prefix() -> String {
    std::env::var("WS_NAMESPACE_PREFIX").unwrap_or_else(|_| "ws-".to_string())
}

fn default_ingress_domain() -> String {
    std::env::var("WS_INGRESS_DOMAIN").unwrap_or_else(|_| "workspaces.local".to_string())
}

fn default_release_chart() -> String {
    std::env::var("WS_RELEASE_CHART").unwrap_or_else(|_| "oci://charts/workspace".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            reconcile_interval_secs: default_reconcile_interval(),
            call_timeout_secs: default_call_timeout(),
            max_concurrent_workspaces: default_max_concurrent(),
            backoff_base_secs: default_backoff_base(),
            backoff_max_secs: default_backoff_max(),
            stuck_threshold: default_stuck_threshold(),
            namespace_prefix: default_namespace_prefix(),
            ingress_domain: default_ingress_domain(),
            release_chart: default_release_chart(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            interval: Duration::from_secs(self.reconcile_interval_secs.max(1)),
            call_timeout: Duration::from_secs(self.call_timeout_secs.max(1)),
            max_concurrent_workspaces: self.max_concurrent_workspaces.max(1),
            retry: RetryPolicy {
                base: Duration::from_secs(self.backoff_base_secs),
                max: Duration::from_secs(self.backoff_max_secs),
                stuck_threshold: self.stuck_threshold,
            },
            naming: Naming {
                namespace_prefix: self.namespace_prefix.clone(),
                ingress_domain: self.ingress_domain.clone(),
                release_chart: self.release_chart.clone(),
                ..Naming::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_missing_or_invalid() {
        assert_eq!(env_or("WS_TEST_UNSET_VARIABLE", 42u64), 42);
    }

    #[test]
    fn test_reconciler_settings_mapping_clamps_zero_values() {
        let config = Config {
            db_path: PathBuf::from("/tmp/controller.db"),
            reconcile_interval_secs: 0,
            call_timeout_secs: 0,
            max_concurrent_workspaces: 0,
            backoff_base_secs: 2,
            backoff_max_secs: 60,
            stuck_threshold: 3,
            namespace_prefix: "tenant-".to_string(),
            ingress_domain: "example.test".to_string(),
            release_chart: "oci://example/chart".to_string(),
        };

        let settings = config.reconciler_settings();
        assert_eq!(settings.interval, Duration::from_secs(1));
        assert_eq!(settings.call_timeout, Duration::from_secs(1));
        assert_eq!(settings.max_concurrent_workspaces, 1);
        assert_eq!(settings.retry.base, Duration::from_secs(2));
        assert_eq!(settings.retry.max, Duration::from_secs(60));
        assert_eq!(settings.retry.stuck_threshold, 3);
        assert_eq!(settings.naming.namespace_prefix, "tenant-");
        assert_eq!(settings.naming.ingress_domain, "example.test");
        assert_eq!(settings.naming.release_chart, "oci://example/chart");
    }
}
