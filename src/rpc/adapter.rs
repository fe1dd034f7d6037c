//! Chain adapter: raw transfer-log fetches over JSON-RPC, normalized to
//! unified events.
//!
//! One `eth_getLogs` call per window, then block timestamps for every
//! distinct block number fetched in a bounded parallel fan-out. No retries
//! here; every remote failure surfaces unmodified for the orchestrator to
//! classify.

use async_trait::async_trait;
use chrono::Utc;
use futures_util::stream::{FuturesUnordered, StreamExt};
use num_bigint::BigUint;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::IngestError;
use crate::models::{EventType, IngestionSource, NetworkId, UnifiedEvent};
use crate::rpc::pool::{ProviderSlot, RpcPool, SlotOutcome};
use crate::store::events::event_id;

/// keccak256("Transfer(address,address,uint256)")
pub const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// Concurrent block-timestamp lookups per window.
const TIMESTAMP_FANOUT: usize = 8;

#[derive(Debug, Clone)]
pub enum TransportError {
    RateLimited,
    Timeout,
    Other(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::RateLimited => f.write_str("rate limited"),
            TransportError::Timeout => f.write_str("deadline exceeded"),
            TransportError::Other(m) => f.write_str(m),
        }
    }
}

/// The seam between the adapter and the wire. Tests script this; production
/// uses [`HttpTransport`].
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, url: &str, method: &str, params: Value) -> Result<Value, TransportError>;
}

#[derive(Debug, Deserialize)]
struct JsonRpcEnvelope {
    result: Option<Value>,
    error: Option<Value>,
}

/// JSON-RPC 2.0 over HTTPS with a per-call deadline.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(deadline: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(deadline)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, url: &str, method: &str, params: Value) -> Result<Value, TransportError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1,
        });

        let resp = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Other(e.to_string())
                }
            })?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited);
        }
        if !resp.status().is_success() {
            return Err(TransportError::Other(format!("http {}", resp.status())));
        }

        let envelope: JsonRpcEnvelope = resp
            .json()
            .await
            .map_err(|e| TransportError::Other(format!("bad rpc envelope: {e}")))?;

        if let Some(err) = envelope.error {
            // Some providers signal rate limits inside the JSON-RPC error.
            let code = err.get("code").and_then(|c| c.as_i64()).unwrap_or(0);
            if code == 429 || code == -32005 {
                return Err(TransportError::RateLimited);
            }
            return Err(TransportError::Other(format!("rpc error: {err}")));
        }

        envelope
            .result
            .ok_or_else(|| TransportError::Other("no result in rpc response".into()))
    }
}

/// Raw `eth_getLogs` entry, exactly as the node returns it.
#[derive(Debug, Clone, Deserialize)]
pub struct RawLog {
    pub address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "blockNumber")]
    pub block_number: String,
    #[serde(rename = "transactionHash")]
    pub tx_hash: String,
    #[serde(rename = "logIndex")]
    pub log_index: String,
}

/// Result of one window fetch. `degraded` flags block timestamps that fell
/// back to "now"; the orchestrator logs the degradation.
#[derive(Debug)]
pub struct FetchResult {
    pub events: Vec<UnifiedEvent>,
    pub degraded: bool,
}

pub struct ChainAdapter {
    transport: Arc<dyn RpcTransport>,
    pool: Arc<RpcPool>,
}

impl ChainAdapter {
    pub fn new(transport: Arc<dyn RpcTransport>, pool: Arc<RpcPool>) -> Self {
        Self { transport, pool }
    }

    /// Current head block. One slot, one call.
    pub async fn latest_block(&self, network: NetworkId) -> Result<u64, IngestError> {
        let slot = self.pool.acquire(network)?;
        let result = self
            .transport
            .call(&slot.endpoint, "eth_blockNumber", json!([]))
            .await;
        match result {
            Ok(v) => {
                self.pool.release(&slot, SlotOutcome::Success);
                let hex = v.as_str().unwrap_or_default();
                parse_hex_u64(hex).ok_or_else(|| IngestError::Rpc {
                    network,
                    message: format!("unparseable block number: {hex}"),
                })
            }
            Err(e) => {
                let err = self.classify(network, &slot, &e);
                self.release_failed(&slot, &e);
                Err(err)
            }
        }
    }

    /// All ERC-20 transfer logs in `[from_block, to_block]`, normalized.
    /// Single getLogs call plus a bounded timestamp fan-out on the same
    /// provider. No retry; partial timestamp coverage is returned degraded.
    pub async fn fetch(
        &self,
        network: NetworkId,
        from_block: u64,
        to_block: u64,
        source: IngestionSource,
    ) -> Result<FetchResult, IngestError> {
        let slot = self.pool.acquire(network)?;

        let params = json!([{
            "fromBlock": to_hex(from_block),
            "toBlock": to_hex(to_block),
            "topics": [TRANSFER_TOPIC],
        }]);

        let raw = match self
            .transport
            .call(&slot.endpoint, "eth_getLogs", params)
            .await
        {
            Ok(v) => v,
            Err(e) => {
                let err = self.classify(network, &slot, &e);
                self.release_failed(&slot, &e);
                return Err(err);
            }
        };

        let logs: Vec<RawLog> = match serde_json::from_value(raw) {
            Ok(l) => l,
            Err(e) => {
                let msg = format!("unparseable getLogs result: {e}");
                self.pool.release(
                    &slot,
                    SlotOutcome::Failure {
                        rate_limited: false,
                        message: msg.clone(),
                    },
                );
                return Err(IngestError::Rpc {
                    network,
                    message: msg,
                });
            }
        };

        let timestamps = self.fetch_timestamps(&slot, &logs).await;
        self.pool.release(&slot, SlotOutcome::Success);

        let now = Utc::now().timestamp();
        let (events, degraded) = normalize(network, &logs, &timestamps, now, source);
        debug!(
            network = %network,
            from_block,
            to_block,
            logs = logs.len(),
            events = events.len(),
            degraded,
            "window fetched"
        );
        Ok(FetchResult { events, degraded })
    }

    /// Transfer logs where `address` is sender or receiver. Two getLogs
    /// calls on one slot (topic1 match, then topic2 match), merged and
    /// deduplicated. Bootstrap indexing path.
    pub async fn fetch_address_transfers(
        &self,
        network: NetworkId,
        from_block: u64,
        to_block: u64,
        address: &str,
        source: IngestionSource,
    ) -> Result<FetchResult, IngestError> {
        let slot = self.pool.acquire(network)?;
        let padded = pad_topic_address(address);

        let topic_sets = [
            json!([TRANSFER_TOPIC, padded.clone()]),
            json!([TRANSFER_TOPIC, Value::Null, padded]),
        ];

        let mut logs: Vec<RawLog> = Vec::new();
        let mut seen: HashSet<(String, u64)> = HashSet::new();
        for (i, topics) in topic_sets.into_iter().enumerate() {
            if i > 0 {
                self.pool.note_extra_requests(&slot, 1);
            }
            let params = json!([{
                "fromBlock": to_hex(from_block),
                "toBlock": to_hex(to_block),
                "topics": topics,
            }]);
            let raw = match self
                .transport
                .call(&slot.endpoint, "eth_getLogs", params)
                .await
            {
                Ok(v) => v,
                Err(e) => {
                    let err = self.classify(network, &slot, &e);
                    self.release_failed(&slot, &e);
                    return Err(err);
                }
            };
            let batch: Vec<RawLog> = match serde_json::from_value(raw) {
                Ok(l) => l,
                Err(e) => {
                    let msg = format!("unparseable getLogs result: {e}");
                    self.pool.release(
                        &slot,
                        SlotOutcome::Failure {
                            rate_limited: false,
                            message: msg.clone(),
                        },
                    );
                    return Err(IngestError::Rpc {
                        network,
                        message: msg,
                    });
                }
            };
            for log in batch {
                let key = (
                    log.tx_hash.to_lowercase(),
                    parse_hex_u64(&log.log_index).unwrap_or(u64::MAX),
                );
                if seen.insert(key) {
                    logs.push(log);
                }
            }
        }

        let timestamps = self.fetch_timestamps(&slot, &logs).await;
        self.pool.release(&slot, SlotOutcome::Success);

        let now = Utc::now().timestamp();
        let (events, degraded) = normalize(network, &logs, &timestamps, now, source);
        Ok(FetchResult { events, degraded })
    }

    /// Timestamps for every distinct block in the log set, fetched in
    /// parallel against the held slot's endpoint. Misses are simply absent
    /// from the map.
    async fn fetch_timestamps(&self, slot: &ProviderSlot, logs: &[RawLog]) -> HashMap<u64, i64> {
        let blocks: HashSet<u64> = logs
            .iter()
            .filter_map(|l| parse_hex_u64(&l.block_number))
            .collect();
        if blocks.is_empty() {
            return HashMap::new();
        }
        self.pool.note_extra_requests(slot, blocks.len() as u32);

        let sem = Arc::new(Semaphore::new(TIMESTAMP_FANOUT));
        let mut futs: FuturesUnordered<_> = blocks
            .into_iter()
            .map(|block| {
                let sem = sem.clone();
                let transport = self.transport.clone();
                let endpoint = slot.endpoint.clone();
                async move {
                    let _permit = sem.acquire().await.ok()?;
                    let result = transport
                        .call(
                            &endpoint,
                            "eth_getBlockByNumber",
                            json!([to_hex(block), false]),
                        )
                        .await
                        .ok()?;
                    let ts = result.get("timestamp").and_then(|t| t.as_str())?;
                    Some((block, parse_hex_u64(ts)? as i64))
                }
            })
            .collect();

        let mut out = HashMap::new();
        while let Some(res) = futs.next().await {
            if let Some((block, ts)) = res {
                out.insert(block, ts);
            }
        }
        out
    }

    fn classify(
        &self,
        network: NetworkId,
        slot: &ProviderSlot,
        err: &TransportError,
    ) -> IngestError {
        match err {
            TransportError::RateLimited => IngestError::RateLimited {
                network,
                provider: slot.provider_id.clone(),
            },
            TransportError::Timeout => IngestError::Timeout {
                network,
                provider: slot.provider_id.clone(),
            },
            TransportError::Other(m) => IngestError::Rpc {
                network,
                message: m.clone(),
            },
        }
    }

    fn release_failed(&self, slot: &ProviderSlot, err: &TransportError) {
        self.pool.release(
            slot,
            SlotOutcome::Failure {
                rate_limited: matches!(err, TransportError::RateLimited),
                message: err.to_string(),
            },
        );
    }
}

/// Deterministic, pure normalization of raw logs into unified events.
/// Non-standard logs (fewer than three topics) are skipped silently; a block
/// with no retrieved timestamp falls back to `now` and flags the batch.
pub fn normalize(
    network: NetworkId,
    logs: &[RawLog],
    timestamps: &HashMap<u64, i64>,
    now: i64,
    source: IngestionSource,
) -> (Vec<UnifiedEvent>, bool) {
    let mut events = Vec::with_capacity(logs.len());
    let mut degraded = false;

    for log in logs {
        if log.topics.len() < 3 {
            continue;
        }
        let Some(block_number) = parse_hex_u64(&log.block_number) else {
            continue;
        };
        let Some(log_index) = parse_hex_u64(&log.log_index) else {
            continue;
        };
        let Some(amount) = parse_hex_amount(&log.data) else {
            continue;
        };

        let timestamp = match timestamps.get(&block_number) {
            Some(ts) => *ts,
            None => {
                degraded = true;
                now
            }
        };

        let tx_hash = log.tx_hash.to_lowercase();
        events.push(UnifiedEvent {
            event_id: event_id(network, &tx_hash, log_index),
            network,
            chain_id: network.chain_id(),
            tx_hash,
            log_index,
            block_number,
            timestamp,
            from: unpad_address(&log.topics[1]),
            to: unpad_address(&log.topics[2]),
            token_address: Some(log.address.to_lowercase()),
            amount,
            amount_usd: None,
            event_type: EventType::Transfer,
            ingestion_source: source,
        });
    }

    // Aggregators rely on per-chain block order.
    events.sort_by(|a, b| {
        a.block_number
            .cmp(&b.block_number)
            .then(a.log_index.cmp(&b.log_index))
    });
    (events, degraded)
}

pub fn to_hex(n: u64) -> String {
    format!("{n:#x}")
}

pub fn parse_hex_u64(s: &str) -> Option<u64> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).ok()
}

/// Hex payload to a decimal big-integer string.
pub fn parse_hex_amount(data: &str) -> Option<String> {
    let stripped = data.trim_start_matches("0x");
    if stripped.is_empty() {
        return Some("0".to_string());
    }
    let bytes = hex::decode(pad_even(stripped)).ok()?;
    Some(BigUint::from_bytes_be(&bytes).to_string())
}

fn pad_even(s: &str) -> String {
    if s.len() % 2 == 1 {
        format!("0{s}")
    } else {
        s.to_string()
    }
}

/// Address widened to a 32-byte topic for getLogs filters.
pub fn pad_topic_address(address: &str) -> String {
    format!(
        "0x{:0>64}",
        address.trim_start_matches("0x").to_lowercase()
    )
}

/// Last 20 bytes of a 32-byte topic, lowercased.
pub fn unpad_address(topic: &str) -> String {
    let stripped = topic.trim_start_matches("0x");
    let tail = if stripped.len() >= 40 {
        &stripped[stripped.len() - 40..]
    } else {
        stripped
    };
    format!("0x{}", tail.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer_log(block: u64, index: u64, from: &str, to: &str, amount_hex: &str) -> RawLog {
        RawLog {
            address: "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".into(),
            topics: vec![
                TRANSFER_TOPIC.into(),
                format!("0x{:0>64}", from.trim_start_matches("0x")),
                format!("0x{:0>64}", to.trim_start_matches("0x")),
            ],
            data: amount_hex.into(),
            block_number: to_hex(block),
            tx_hash: format!("0xAB{block:062x}"),
            log_index: to_hex(index),
        }
    }

    #[test]
    fn normalize_lowercases_and_converts_amounts() {
        let logs = vec![transfer_log(
            100,
            0,
            "0xDEAD00000000000000000000000000000000BEEF",
            "0xFEED00000000000000000000000000000000CAFE",
            "0x0de0b6b3a7640000", // 1e18
        )];
        let timestamps = HashMap::from([(100u64, 1_700_000_000i64)]);
        let (events, degraded) =
            normalize(NetworkId::Eth, &logs, &timestamps, 99, IngestionSource::Rpc);
        assert!(!degraded);
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.from, "0xdead00000000000000000000000000000000beef");
        assert_eq!(e.to, "0xfeed00000000000000000000000000000000cafe");
        assert_eq!(e.amount, "1000000000000000000");
        assert_eq!(e.timestamp, 1_700_000_000);
        assert_eq!(
            e.token_address.as_deref(),
            Some("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48")
        );
        assert_eq!(e.chain_id, 1);
    }

    #[test]
    fn normalize_skips_non_standard_logs() {
        let mut short = transfer_log(100, 0, "0x01", "0x02", "0x01");
        short.topics.truncate(2);
        let full = transfer_log(100, 1, "0x01", "0x02", "0x01");
        let (events, _) = normalize(
            NetworkId::Eth,
            &[short, full],
            &HashMap::from([(100u64, 1i64)]),
            0,
            IngestionSource::Rpc,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].log_index, 1);
    }

    #[test]
    fn missing_timestamp_falls_back_to_now_and_degrades() {
        let logs = vec![transfer_log(42, 0, "0x01", "0x02", "0x05")];
        let (events, degraded) = normalize(
            NetworkId::Base,
            &logs,
            &HashMap::new(),
            1_234,
            IngestionSource::Rpc,
        );
        assert!(degraded);
        assert_eq!(events[0].timestamp, 1_234);
    }

    #[test]
    fn normalize_orders_by_block_then_log_index() {
        let logs = vec![
            transfer_log(200, 3, "0x01", "0x02", "0x01"),
            transfer_log(100, 7, "0x01", "0x02", "0x01"),
            transfer_log(200, 1, "0x01", "0x02", "0x01"),
        ];
        let (events, _) = normalize(
            NetworkId::Arb,
            &logs,
            &HashMap::new(),
            0,
            IngestionSource::Backfill,
        );
        let order: Vec<(u64, u64)> = events.iter().map(|e| (e.block_number, e.log_index)).collect();
        assert_eq!(order, vec![(100, 7), (200, 1), (200, 3)]);
    }

    #[test]
    fn hex_helpers() {
        assert_eq!(parse_hex_u64("0x64"), Some(100));
        assert_eq!(parse_hex_u64("bogus"), None);
        assert_eq!(parse_hex_amount("0x"), Some("0".into()));
        assert_eq!(parse_hex_amount("0xff"), Some("255".into()));
        assert_eq!(
            unpad_address("0x000000000000000000000000dead00000000000000000000000000000000beef"),
            "0xdead00000000000000000000000000000000beef"
        );
        assert_eq!(
            pad_topic_address("0xDEAD00000000000000000000000000000000BEEF"),
            "0x000000000000000000000000dead00000000000000000000000000000000beef"
        );
    }
}
