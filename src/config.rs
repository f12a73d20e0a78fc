use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Gateway settings.
///
/// Defaults, then an optional JSON file (`--config=gateway.json`), then
/// environment variables; later sources win.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_addr: String,
    /// Base URL of the backend bridge.
    pub backend_url: String,
    /// Whole-request timeout for backend calls. Unset means the backend
    /// stream decides when a call ends.
    pub backend_timeout_secs: Option<u64>,
    pub connect_timeout_secs: u64,
    /// Lifetime given to session tokens the backend issues without an expiry.
    pub credential_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8088".into(),
            backend_url: "https://orc.daisinet.com".into(),
            backend_timeout_secs: None,
            connect_timeout_secs: 10,
            credential_ttl_secs: 3600,
            sweep_interval_secs: 300,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a JSON file. Missing keys keep their defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).with_context(|| {
            format!(
                "Failed to read gateway config file: {}",
                path.as_ref().display()
            )
        })?;
        serde_json::from_str(&content).with_context(|| "Failed to parse gateway config JSON")
    }

    /// Resolve the effective configuration for this process.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let base = match file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::default(),
        };
        base.apply_env(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup` (normally the process environment).
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let number = |key: &str| -> Result<Option<u64>> {
            get(key)
                .map(|v| {
                    v.parse::<u64>()
                        .with_context(|| format!("{key} must be a whole number of seconds, got {v:?}"))
                })
                .transpose()
        };

        if let Some(v) = get("BIND_ADDR") {
            self.bind_addr = v;
        }
        if let Some(v) = get("DAISI_BACKEND_URL") {
            self.backend_url = v;
        }
        if let Some(v) = number("DAISI_BACKEND_TIMEOUT_SECONDS")? {
            self.backend_timeout_secs = Some(v);
        }
        if let Some(v) = number("DAISI_CONNECT_TIMEOUT_SECONDS")? {
            self.connect_timeout_secs = v;
        }
        if let Some(v) = number("DAISI_CREDENTIAL_TTL_SECONDS")? {
            self.credential_ttl_secs = v;
        }
        if let Some(v) = number("DAISI_SWEEP_INTERVAL_SECONDS")? {
            self.sweep_interval_secs = v;
        }
        if self.sweep_interval_secs == 0 {
            anyhow::bail!("DAISI_SWEEP_INTERVAL_SECONDS must be greater than zero");
        }
        Ok(self)
    }
}
