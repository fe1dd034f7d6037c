use serde::{Deserialize, Serialize};

/// The closed set of supported networks. Adding a network is a configuration
/// change (provider tables, start blocks), not a code change elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkId {
    Eth,
    Arb,
    Op,
    Base,
    Poly,
    Bnb,
    Avax,
    Zksync,
    Scroll,
    Linea,
}

impl NetworkId {
    pub const ALL: [NetworkId; 10] = [
        NetworkId::Eth,
        NetworkId::Arb,
        NetworkId::Op,
        NetworkId::Base,
        NetworkId::Poly,
        NetworkId::Bnb,
        NetworkId::Avax,
        NetworkId::Zksync,
        NetworkId::Scroll,
        NetworkId::Linea,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NetworkId::Eth => "ETH",
            NetworkId::Arb => "ARB",
            NetworkId::Op => "OP",
            NetworkId::Base => "BASE",
            NetworkId::Poly => "POLY",
            NetworkId::Bnb => "BNB",
            NetworkId::Avax => "AVAX",
            NetworkId::Zksync => "ZKSYNC",
            NetworkId::Scroll => "SCROLL",
            NetworkId::Linea => "LINEA",
        }
    }

    pub fn chain_id(&self) -> u64 {
        match self {
            NetworkId::Eth => 1,
            NetworkId::Arb => 42161,
            NetworkId::Op => 10,
            NetworkId::Base => 8453,
            NetworkId::Poly => 137,
            NetworkId::Bnb => 56,
            NetworkId::Avax => 43114,
            NetworkId::Zksync => 324,
            NetworkId::Scroll => 534352,
            NetworkId::Linea => 59144,
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "ETH" => Some(NetworkId::Eth),
            "ARB" => Some(NetworkId::Arb),
            "OP" => Some(NetworkId::Op),
            "BASE" => Some(NetworkId::Base),
            "POLY" => Some(NetworkId::Poly),
            "BNB" => Some(NetworkId::Bnb),
            "AVAX" => Some(NetworkId::Avax),
            "ZKSYNC" => Some(NetworkId::Zksync),
            "SCROLL" => Some(NetworkId::Scroll),
            "LINEA" => Some(NetworkId::Linea),
            _ => None,
        }
    }

    /// Default fetch window, sized by expected transfer logs per block.
    pub fn default_window_size(&self) -> u64 {
        match self {
            NetworkId::Eth => 500,
            NetworkId::Arb | NetworkId::Op | NetworkId::Base => 2000,
            NetworkId::Zksync | NetworkId::Scroll | NetworkId::Linea => 500,
            NetworkId::Poly | NetworkId::Bnb | NetworkId::Avax => 1000,
        }
    }

    pub fn is_l1(&self) -> bool {
        matches!(self, NetworkId::Eth | NetworkId::Bnb | NetworkId::Avax)
    }
}

impl std::fmt::Display for NetworkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Transfer,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Transfer => "TRANSFER",
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRANSFER" => Some(EventType::Transfer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestionSource {
    Rpc,
    Backfill,
    Bootstrap,
}

impl IngestionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionSource::Rpc => "rpc",
            IngestionSource::Backfill => "backfill",
            IngestionSource::Bootstrap => "bootstrap",
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s {
            "rpc" => Some(IngestionSource::Rpc),
            "backfill" => Some(IngestionSource::Backfill),
            "bootstrap" => Some(IngestionSource::Bootstrap),
            _ => None,
        }
    }
}

/// Normalized ledger row. `(network, tx_hash, log_index)` identifies an event;
/// `event_id` is the content-addressed primary key derived from that triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedEvent {
    pub event_id: String,
    pub network: NetworkId,
    pub chain_id: u64,
    pub tx_hash: String,
    pub log_index: u64,
    pub block_number: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub from: String,
    pub to: String,
    /// None for native transfers.
    pub token_address: Option<String>,
    /// Big integer as decimal string; raw token units.
    pub amount: String,
    pub amount_usd: Option<f64>,
    pub event_type: EventType,
    pub ingestion_source: IngestionSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainStatus {
    Ok,
    Degraded,
    Paused,
    Error,
}

impl ChainStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainStatus::Ok => "OK",
            ChainStatus::Degraded => "DEGRADED",
            ChainStatus::Paused => "PAUSED",
            ChainStatus::Error => "ERROR",
        }
    }

    pub fn from_tag(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "OK" => Some(ChainStatus::Ok),
            "DEGRADED" => Some(ChainStatus::Degraded),
            "PAUSED" => Some(ChainStatus::Paused),
            "ERROR" => Some(ChainStatus::Error),
            _ => None,
        }
    }
}

/// Per-chain sync progress. One record per network, mutated only by the
/// sync tracker; everything else reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainSyncState {
    pub chain: NetworkId,
    pub last_synced_block: u64,
    pub last_head_block: u64,
    pub status: ChainStatus,
    pub pause_reason: Option<String>,
    pub error_count: u32,
    pub consecutive_errors: u32,
    pub last_error: Option<String>,
    pub last_error_at: Option<i64>,
    pub last_success_at: Option<i64>,
    pub total_events_ingested: u64,
    pub avg_events_per_block: f64,
    pub avg_latency_ms: f64,
}

impl ChainSyncState {
    pub fn new(chain: NetworkId, start_block: u64) -> Self {
        Self {
            chain,
            last_synced_block: start_block,
            last_head_block: start_block,
            status: ChainStatus::Ok,
            pause_reason: None,
            error_count: 0,
            consecutive_errors: 0,
            last_error: None,
            last_error_at: None,
            last_success_at: None,
            total_events_ingested: 0,
            avg_events_per_block: 0.0,
            avg_latency_ms: 0.0,
        }
    }

    pub fn lag(&self) -> u64 {
        self.last_head_block.saturating_sub(self.last_synced_block)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WindowReason {
    Normal,
    Catchup,
    Backfill,
    Recovery,
}

impl WindowReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowReason::Normal => "NORMAL",
            WindowReason::Catchup => "CATCHUP",
            WindowReason::Backfill => "BACKFILL",
            WindowReason::Recovery => "RECOVERY",
        }
    }
}

/// Ephemeral fetch plan. `from_block = last_synced_block + 1` always; the
/// planner's validator rejects anything else before it reaches an adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockWindow {
    pub chain: NetworkId,
    pub from_block: u64,
    pub to_block: u64,
    pub window_size: u64,
    pub reason: WindowReason,
    pub target_head: u64,
    pub lag_after_window: u64,
}

/// Outcome of a replay-guarded batch insert. Duplicates are never failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertReport {
    pub inserted: usize,
    pub duplicates: usize,
    pub errors: usize,
    pub error_messages: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_tags_round_trip() {
        for n in NetworkId::ALL {
            assert_eq!(NetworkId::from_tag(n.as_str()), Some(n));
        }
        assert_eq!(NetworkId::from_tag("base"), Some(NetworkId::Base));
        assert_eq!(NetworkId::from_tag("DOGE"), None);
    }

    #[test]
    fn chain_ids_match_configured_networks() {
        assert_eq!(NetworkId::Eth.chain_id(), 1);
        assert_eq!(NetworkId::Arb.chain_id(), 42161);
        assert_eq!(NetworkId::Zksync.chain_id(), 324);
        assert_eq!(NetworkId::Linea.chain_id(), 59144);
    }

    #[test]
    fn window_sizes_reflect_log_density() {
        assert_eq!(NetworkId::Eth.default_window_size(), 500);
        assert_eq!(NetworkId::Arb.default_window_size(), 2000);
        assert_eq!(NetworkId::Scroll.default_window_size(), 500);
        assert_eq!(NetworkId::Bnb.default_window_size(), 1000);
    }

    #[test]
    fn unknown_tags_rejected_at_boundary() {
        assert_eq!(EventType::from_tag("SWAP"), None);
        assert_eq!(IngestionSource::from_tag("manual"), None);
        assert_eq!(ChainStatus::from_tag("HALTED"), None);
    }
}
