//! TOML configuration for the hazardwatch server.
//!
//! Layered lookup: the file named by `HAZARDWATCH_CONFIG`, then the system
//! location, then compiled-in defaults. A few deployment knobs can also be
//! supplied through the environment, which wins over the file.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::detect::Strategy;
use crate::telemetry::FeatureOverride;

pub const CONFIG_ENV: &str = "HAZARDWATCH_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/hazardwatch/hazardwatch.toml";

/// `node=secret,...` or a JSON object of node to secret.
pub const SECRETS_ENV: &str = "TELEMETRY_HMAC_SECRETS";

/// Comma-separated nodes whose pm25 sensor is known bad.
pub const DISABLE_PM25_ENV: &str = "DISABLE_PM25_NODES";

/// Value substituted for a disabled pm25 sensor.
pub const PM25_FALLBACK: f64 = 1.2;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub security: SecurityConfig,
    pub behavior: BehaviorConfig,
    pub status: StatusConfig,
    pub model: ModelConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded hazardwatch configuration");
        Ok(config)
    }

    /// Try, in order: `$HAZARDWATCH_CONFIG`, [`SYSTEM_CONFIG_PATH`], defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "HAZARDWATCH_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides using `lookup` in place of the process environment.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(SECRETS_ENV).filter(|s| !s.trim().is_empty()) {
            let secrets = parse_secret_map(&raw)
                .with_context(|| format!("failed to parse {SECRETS_ENV}"))?;
            info!(nodes = secrets.len(), "hmac secrets taken from environment");
            self.security.hmac_secrets = secrets;
        }

        if let Some(raw) = lookup(DISABLE_PM25_ENV) {
            for node in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                let exists = self
                    .behavior
                    .disabled
                    .iter()
                    .any(|o| o.node == node && o.feature == "pm25");
                if !exists {
                    self.behavior.disabled.push(FeatureOverride {
                        node: node.to_string(),
                        feature: "pm25".to_string(),
                        fallback: PM25_FALLBACK,
                    });
                }
            }
        }
        Ok(())
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid server.bind: {}", self.server.bind))?;
        if self.server.history_limit == 0 {
            bail!("server.history_limit must be at least 1");
        }
        if self.security.sig_window_sec == 0 {
            bail!("security.sig_window_sec must be at least 1");
        }
        // a future-dated timestamp stays inside the window for 2 * sig_window_sec
        if self.security.nonce_ttl_sec < self.security.sig_window_sec.saturating_mul(2) {
            bail!(
                "security.nonce_ttl_sec ({}) must be at least twice security.sig_window_sec ({})",
                self.security.nonce_ttl_sec,
                self.security.sig_window_sec
            );
        }
        for (node, secret) in &self.security.hmac_secrets {
            if secret.is_empty() {
                bail!("empty hmac secret for node {node}");
            }
            if node.contains('.') {
                bail!("node id {node} must not contain '.'");
            }
        }
        for o in &self.behavior.disabled {
            if !o.fallback.is_finite() {
                bail!("fallback for {}/{} is not finite", o.node, o.feature);
            }
        }
        Ok(())
    }
}

/// Parse `node=secret,node=secret` or a JSON object.
pub fn parse_secret_map(raw: &str) -> Result<BTreeMap<String, String>> {
    let raw = raw.trim();
    if raw.starts_with('{') {
        return serde_json::from_str(raw).context("secrets JSON must be an object of strings");
    }
    let mut secrets = BTreeMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((node, secret)) = pair.split_once('=') else {
            bail!("expected node=secret, got {pair:?}");
        };
        secrets.insert(node.trim().to_string(), secret.trim().to_string());
    }
    Ok(secrets)
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub db_path: PathBuf,
    /// Rows per node loaded for each recompute pass.
    pub history_limit: usize,
    /// Rows kept per node; older rows are pruned on ingest.
    pub max_rows: usize,
    /// Nodes expected to report. Silent ones are shown as offline.
    pub known_nodes: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            db_path: PathBuf::from("/var/lib/hazardwatch/telemetry.db"),
            history_limit: 200,
            max_rows: 50_000,
            known_nodes: ["ground_1", "ground_2", "ground_3", "water_1"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Security
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Shared secret per node. Never serialized back out.
    #[serde(skip_serializing)]
    pub hmac_secrets: BTreeMap<String, String>,
    /// Accepted clock skew either side of server time.
    pub sig_window_sec: u64,
    /// How long a seen nonce is remembered. At least twice `sig_window_sec`.
    pub nonce_ttl_sec: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            hmac_secrets: BTreeMap::new(),
            sig_window_sec: 300,
            nonce_ttl_sec: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// Behavior
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Sensors known to be faulty, replaced by a fixed value on ingest.
    pub disabled: Vec<FeatureOverride>,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub recompute_interval_sec: u64,
    pub hysteresis_sec: u64,
    pub offline_after_sec: u64,
    pub correlation_window_sec: u64,
    pub strategy: Strategy,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            recompute_interval_sec: 30,
            hysteresis_sec: 60,
            offline_after_sec: 120,
            correlation_window_sec: 300,
            strategy: Strategy::Probabilistic,
        }
    }
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Optional outlier model artifacts. A missing file disables that model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub ground_path: Option<PathBuf>,
    pub water_path: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
