//! Runtime configuration.
//!
//! Environment-first with sane defaults; the per-network provider tables and
//! start blocks come from a TOML file so operators can edit endpoints without
//! touching code. Everything is read once at startup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;

use crate::models::NetworkId;

/// Top-level application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub active_networks: Vec<NetworkId>,
    /// Smoothing factor for the sync tracker's moving averages.
    pub ema_alpha: f64,
    /// Sleep between windows when a chain is caught up.
    pub chain_idle_ms: u64,
    /// Scheduler cadences (seconds).
    pub relation_refresh_secs: u64,
    pub node_refresh_secs: u64,
    pub snapshot_refresh_secs: u64,
    pub health_check_secs: u64,
    /// Rolling error window: error counts are zeroed on this cadence.
    pub error_reset_secs: u64,
    /// Snapshots retained per window tier.
    pub snapshot_keep_count: usize,
    /// Relation aggregation look-back, days.
    pub relation_lookback_days: i64,
    /// Addresses refreshed per network per node-analytics pass.
    pub node_analytics_address_cap: usize,
    pub bootstrap_poll_secs: u64,
    pub bootstrap_max_attempts: u32,
    /// Optional HTTP price endpoint; absent means unpriced tokens stay $0.
    pub price_endpoint: Option<String>,
    pub providers: ProvidersFile,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            env::var("DATABASE_PATH").unwrap_or_else(|_| "./chainlens.db".to_string());

        let active_networks = match env::var("ACTIVE_NETWORKS") {
            Ok(raw) => {
                let mut nets = Vec::new();
                for tag in raw.split(',') {
                    let tag = tag.trim();
                    if tag.is_empty() {
                        continue;
                    }
                    let net = NetworkId::from_tag(tag)
                        .with_context(|| format!("unknown network tag in ACTIVE_NETWORKS: {tag}"))?;
                    nets.push(net);
                }
                nets
            }
            Err(_) => NetworkId::ALL.to_vec(),
        };

        let providers = match env::var("PROVIDERS_FILE") {
            Ok(path) => ProvidersFile::load(&path)?,
            Err(_) => ProvidersFile::default_dev(),
        };

        Ok(Self {
            database_path,
            active_networks,
            ema_alpha: env_f64("SYNC_EMA_ALPHA", 0.2),
            chain_idle_ms: env_u64("CHAIN_IDLE_MS", 3_000),
            relation_refresh_secs: env_u64("RELATION_REFRESH_SECS", 300),
            node_refresh_secs: env_u64("NODE_REFRESH_SECS", 600),
            snapshot_refresh_secs: env_u64("SNAPSHOT_REFRESH_SECS", 3_600),
            health_check_secs: env_u64("HEALTH_CHECK_SECS", 60),
            error_reset_secs: env_u64("ERROR_RESET_SECS", 300),
            snapshot_keep_count: env_u64("SNAPSHOT_KEEP_COUNT", 24) as usize,
            relation_lookback_days: env_u64("RELATION_LOOKBACK_DAYS", 90) as i64,
            node_analytics_address_cap: env_u64("NODE_ANALYTICS_ADDRESS_CAP", 5_000) as usize,
            bootstrap_poll_secs: env_u64("BOOTSTRAP_POLL_SECS", 2),
            bootstrap_max_attempts: env_u64("BOOTSTRAP_MAX_ATTEMPTS", 3) as u32,
            price_endpoint: env::var("PRICE_ENDPOINT").ok().filter(|s| !s.is_empty()),
            providers,
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|v| v.is_finite() && *v > 0.0 && *v <= 1.0)
        .unwrap_or(default)
}

/// One remote JSON-RPC endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_id: String,
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Selection bias within the pool; higher wins more often.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Requests per minute.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    10
}
fn default_rate_limit() -> u32 {
    300
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    /// Endpoint URL with the optional API key appended as a path segment,
    /// the convention used by the major hosted providers.
    pub fn endpoint(&self) -> String {
        match &self.api_key {
            Some(key) if !key.is_empty() => {
                format!("{}/{}", self.url.trim_end_matches('/'), key)
            }
            _ => self.url.clone(),
        }
    }
}

/// Per-network settings block from the providers TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default)]
    pub start_block: u64,
    /// Overrides the per-chain default window size when set.
    #[serde(default)]
    pub window_override: Option<u64>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// The operator-edited provider tables, keyed by network tag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersFile {
    #[serde(default)]
    pub networks: HashMap<String, NetworkSettings>,
}

impl ProvidersFile {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read providers file {path}"))?;
        let parsed: ProvidersFile =
            toml::from_str(&raw).with_context(|| format!("invalid providers file {path}"))?;
        for tag in parsed.networks.keys() {
            if NetworkId::from_tag(tag).is_none() {
                anyhow::bail!("unknown network tag in providers file: {tag}");
            }
        }
        Ok(parsed)
    }

    pub fn settings(&self, network: NetworkId) -> NetworkSettings {
        self.networks
            .get(network.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Public endpoints only. Enough to boot a dev environment; production
    /// deployments point PROVIDERS_FILE at a real table.
    pub fn default_dev() -> Self {
        let mut networks = HashMap::new();
        let public = [
            (NetworkId::Eth, "https://eth.llamarpc.com"),
            (NetworkId::Arb, "https://arb1.arbitrum.io/rpc"),
            (NetworkId::Op, "https://mainnet.optimism.io"),
            (NetworkId::Base, "https://mainnet.base.org"),
            (NetworkId::Poly, "https://polygon-rpc.com"),
            (NetworkId::Bnb, "https://bsc-dataseed.binance.org"),
            (NetworkId::Avax, "https://api.avax.network/ext/bc/C/rpc"),
            (NetworkId::Zksync, "https://mainnet.era.zksync.io"),
            (NetworkId::Scroll, "https://rpc.scroll.io"),
            (NetworkId::Linea, "https://rpc.linea.build"),
        ];
        for (net, url) in public {
            networks.insert(
                net.as_str().to_string(),
                NetworkSettings {
                    start_block: 0,
                    window_override: None,
                    providers: vec![ProviderConfig {
                        provider_id: "public".into(),
                        url: url.into(),
                        api_key: None,
                        weight: default_weight(),
                        rate_limit: 60,
                        cooldown_ms: default_cooldown_ms(),
                        enabled: true,
                    }],
                },
            );
        }
        Self { networks }
    }
}
