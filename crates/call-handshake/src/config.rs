use std::env;
use std::time::Duration;

use crate::gatherer::CandidateGatherer;

pub const DEFAULT_GATHER_TIMEOUT: Duration = Duration::from_millis(2000);

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

pub const GATHER_TIMEOUT_ENV: &str = "BEACH_CALL_GATHER_TIMEOUT_MS";
pub const ICE_SERVERS_ENV: &str = "BEACH_CALL_ICE_SERVERS";
pub const DISABLE_STUN_ENV: &str = "BEACH_CALL_DISABLE_STUN";

/// Handshake tuning shared by the orchestrator and the engine factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeConfig {
    /// Upper bound on the candidate wait before a blob is exported.
    pub gather_timeout: Duration,
    /// ICE server URLs handed to every new engine.
    pub ice_servers: Vec<String>,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            gather_timeout: DEFAULT_GATHER_TIMEOUT,
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl HandshakeConfig {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let gather_timeout = env::var(GATHER_TIMEOUT_ENV)
            .ok()
            .and_then(|raw| raw.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.gather_timeout);

        let ice_servers = if env_flag(DISABLE_STUN_ENV) {
            Vec::new()
        } else {
            match env::var(ICE_SERVERS_ENV) {
                Ok(raw) if !raw.trim().is_empty() => parse_server_list(&raw),
                _ => defaults.ice_servers,
            }
        };

        Self {
            gather_timeout,
            ice_servers,
        }
    }

    pub fn with_gather_timeout(mut self, timeout: Duration) -> Self {
        self.gather_timeout = timeout;
        self
    }

    pub fn with_ice_servers(mut self, servers: Vec<String>) -> Self {
        self.ice_servers = servers;
        self
    }

    pub fn gatherer(&self) -> CandidateGatherer {
        CandidateGatherer::new(self.gather_timeout)
    }
}

pub fn parse_server_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

fn env_flag(var: &str) -> bool {
    env::var(var)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}
