use std::env;

use crate::types::GvrSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderElectionMode {
    /// Lease-based election; only the leader runs pipelines, GC, and HA.
    Builtin,
    /// Every replica acts as leader. For single-replica installs and tests.
    Disabled,
}

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Namespace(s) watched for Ingesters and written with Observations.
    pub watch_namespaces: Vec<String>,
    /// Extra {group,version,resource} triples writes are permitted to.
    pub allowed_gvrs: Vec<GvrSpec>,
    /// Extra namespaces writes are permitted to.
    pub allowed_namespaces: Vec<String>,
    /// Default TTL stamped on Observations that carry none.
    pub observation_ttl_seconds: u64,
    pub replica_count: u32,
    pub log_level: String,
    pub auto_detect_enabled: bool,

    pub leader_election: LeaderElectionMode,
    pub leader_election_id: String,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    // Background sweeps
    pub gc_interval_seconds: u64,
    pub ha_enabled: bool,
}

impl Config {
    /// Load configuration from environment variables.
    /// Panics with a clear message if a value fails to parse.
    pub fn from_env() -> Self {
        let watch_namespaces = csv_env("WATCH_NAMESPACE", "default");
        let allowed_gvrs = env::var("ALLOWED_GVRS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                GvrSpec::parse(s).unwrap_or_else(|e| panic!("ALLOWED_GVRS entry '{s}': {e}"))
            })
            .collect();
        let allowed_namespaces = env::var("ALLOWED_NAMESPACES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let leader_election = match env::var("LEADER_ELECTION_MODE")
            .unwrap_or_else(|_| "builtin".to_string())
            .as_str()
        {
            "builtin" => LeaderElectionMode::Builtin,
            "disabled" => LeaderElectionMode::Disabled,
            other => panic!("LEADER_ELECTION_MODE must be builtin or disabled, got '{other}'"),
        };

        Self {
            watch_namespaces,
            allowed_gvrs,
            allowed_namespaces,
            observation_ttl_seconds: parsed_env("OBSERVATION_TTL_SECONDS", 86_400),
            replica_count: parsed_env("REPLICA_COUNT", 1),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            auto_detect_enabled: env::var("AUTO_DETECT_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
            leader_election,
            leader_election_id: env::var("LEADER_ELECTION_ID")
                .unwrap_or_else(|_| "zen-watcher-leader".to_string()),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: parsed_env("WEB_PORT", 8080),
            gc_interval_seconds: parsed_env("GC_INTERVAL_SECONDS", 3600),
            ha_enabled: env::var("HA_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// Log effective settings at startup, without leaking anything secret.
    pub fn log_effective(&self) {
        tracing::info!(
            watch_namespaces = ?self.watch_namespaces,
            allowed_gvrs = self.allowed_gvrs.len(),
            allowed_namespaces = self.allowed_namespaces.len(),
            observation_ttl_seconds = self.observation_ttl_seconds,
            replica_count = self.replica_count,
            leader_election = ?self.leader_election,
            gc_interval_seconds = self.gc_interval_seconds,
            ha_enabled = self.ha_enabled,
            "Effective configuration"
        );
    }
}

fn csv_env(key: &str, default: &str) -> Vec<String> {
    env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parsed_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(v) => v
            .parse()
            .unwrap_or_else(|_| panic!("{key} must be a valid number, got '{v}'")),
        Err(_) => default,
    }
}
