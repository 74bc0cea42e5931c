use std::{fmt, path::Path, time::Duration};

use anyhow::Context;
use serde::Deserialize;

/// Credential for the upstream engine. Never printed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub bind: String,
    pub upstream_base_url: String,
    pub api_key: Option<Secret>,
    pub api_key_header: String,
    pub connect_timeout_ms: u64,
    /// Upper bound on waiting for the upstream's response headers. The body
    /// itself is unbounded.
    pub response_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            upstream_base_url: "http://127.0.0.1:8000".into(),
            api_key: None,
            api_key_header: "X-API-Key".into(),
            connect_timeout_ms: 5_000,
            response_timeout_ms: 30_000,
        }
    }
}

impl RelayConfig {
    /// YAML file (if any) first, then `RUNSTREAM_*` environment overrides.
    pub async fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut cfg = match path {
            Some(path) => {
                let txt = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                serde_yaml::from_str::<RelayConfig>(&txt).context("Failed to parse config YAML")?
            }
            None => RelayConfig::default(),
        };
        cfg.apply_env(|key| std::env::var(key).ok())?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("RUNSTREAM_BIND") {
            self.bind = v;
        }
        if let Some(v) = lookup("RUNSTREAM_UPSTREAM_URL") {
            self.upstream_base_url = v;
        }
        if let Some(v) = lookup("RUNSTREAM_API_KEY") {
            // blank counts as unset
            let v = v.trim();
            self.api_key = (!v.is_empty()).then(|| Secret::new(v));
        }
        if let Some(v) = lookup("RUNSTREAM_API_KEY_HEADER") {
            self.api_key_header = v;
        }
        if let Some(v) = lookup("RUNSTREAM_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = v.parse().context("RUNSTREAM_CONNECT_TIMEOUT_MS must be an integer")?;
        }
        if let Some(v) = lookup("RUNSTREAM_RESPONSE_TIMEOUT_MS") {
            self.response_timeout_ms = v.parse().context("RUNSTREAM_RESPONSE_TIMEOUT_MS must be an integer")?;
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Origin serving `/workflow/status/{run_id}/stream`.
    pub relay_base_url: String,
    /// Reconnection delay until the server sends a `retry:` field.
    pub retry_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self { relay_base_url: "http://127.0.0.1:8080".into(), retry_ms: 3_000 }
    }
}

impl TrackerConfig {
    pub fn new(relay_base_url: impl Into<String>) -> Self {
        Self { relay_base_url: relay_base_url.into(), ..Self::default() }
    }
}
