use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::fs;
use std::time::Duration;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub bind: BindConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// ldap://host:port or ldaps://host:port
    pub url: String,
    /// Upgrade a plain ldap:// connection with the StartTLS extended operation.
    #[serde(default)]
    pub starttls: bool,
    /// Deadline for each response, in seconds (default 10).
    pub timeout_sec: Option<u64>,
    /// TCP connect deadline in seconds (default 5).
    pub connect_timeout_sec: Option<u64>,
    pub tls: Option<TlsConfig>,
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_sec.unwrap_or(10))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec.unwrap_or(5))
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "ldap://127.0.0.1:389".to_string(),
            starttls: false,
            timeout_sec: Some(10),
            connect_timeout_sec: Some(5),
            tls: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM CA certificate or bundle, trusted in addition to the system roots.
    pub ca_file: Option<String>,
    /// Do not verify the server certificate (tests / internal networks only).
    #[serde(default)]
    pub skip_verify: bool,
    /// Name to verify and send as SNI instead of the URL host.
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BindConfig {
    /// SASL mechanism. Unset: pick from the server's advertised list, with downgrade detection.
    pub mechanism: Option<String>,
    /// Mechanism options: username, password, authzid, trace.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// Preferred mechanisms for automatic selection, strongest first.
    #[serde(default)]
    pub preference: Vec<String>,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content).context("Parse YAML config")?;
        Ok(config)
    }
}
