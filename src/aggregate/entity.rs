//! Entity-level aggregation: holdings, flow series, and bridge activity for
//! a named set of addresses.
//!
//! Everything here is a pure function of the unified ledger, the static
//! label maps, and an injected price table. No other state is consulted.

use anyhow::Result;
use num_bigint::BigInt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::labels::LabelMaps;
use crate::models::{NetworkId, UnifiedEvent};
use crate::price::{default_decimals, scale_amount};
use crate::store::events::EventStore;

const ENTITY_EVENT_LIMIT: usize = 50_000;
/// |net| below this share of gross flow counts as neutral.
const NEUTRAL_FLOW_RATIO: f64 = 0.10;

/// A named set of addresses treated as one actor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDef {
    pub name: String,
    pub addresses: Vec<String>,
}

impl EntityDef {
    fn normalized_addresses(&self) -> HashSet<String> {
        self.addresses.iter().map(|a| a.to_lowercase()).collect()
    }
}

/// Injected valuation entry for one token.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenInfo {
    pub decimals: u32,
    pub price_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Holding {
    pub token_address: String,
    /// Net balance in whole-token units (inflow minus outflow).
    pub balance: f64,
    pub value_usd: f64,
    /// Share of the entity's total positive holdings; sums to 100.
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlowPoint {
    /// Day bucket, unix seconds.
    pub day: i64,
    pub inflow_usd: f64,
    pub outflow_usd: f64,
    pub net_usd: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DominantFlow {
    Inflow,
    Outflow,
    Neutral,
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenFlow {
    pub token_address: String,
    pub inflow_usd: f64,
    pub outflow_usd: f64,
    pub net_usd: f64,
    pub dominant_flow: DominantFlow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BridgeDirection {
    L1ToL2,
    L2ToL1,
    CrossChain,
}

impl BridgeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeDirection::L1ToL2 => "L1→L2",
            BridgeDirection::L2ToL1 => "L2→L1",
            BridgeDirection::CrossChain => "Cross-chain",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BridgeActivity {
    pub bridge_name: String,
    pub to_chain: String,
    pub direction: BridgeDirection,
    pub tx_count: u64,
    pub volume_usd: f64,
}

pub struct EntityAggregator {
    events: EventStore,
    labels: Arc<LabelMaps>,
}

impl EntityAggregator {
    pub fn new(events: EventStore, labels: Arc<LabelMaps>) -> Self {
        Self { events, labels }
    }

    fn entity_events(&self, entity: &EntityDef, since_ts: i64) -> Result<Vec<UnifiedEvent>> {
        let addresses: Vec<String> = entity.normalized_addresses().into_iter().collect();
        self.events
            .events_for_address_set(&addresses, since_ts, ENTITY_EVENT_LIMIT)
    }

    /// Per-token net holdings across all the entity's addresses, valued with
    /// the injected price table. Internal transfers between entity addresses
    /// cancel out.
    pub fn holdings(
        &self,
        entity: &EntityDef,
        prices: &HashMap<String, TokenInfo>,
        since_ts: i64,
    ) -> Result<Vec<Holding>> {
        let members = entity.normalized_addresses();
        let events = self.entity_events(entity, since_ts)?;

        let mut raw_by_token: HashMap<String, BigInt> = HashMap::new();
        for event in &events {
            let Some(token) = &event.token_address else {
                continue;
            };
            let Ok(amount) = event.amount.parse::<BigInt>() else {
                continue;
            };
            let from_member = members.contains(&event.from);
            let to_member = members.contains(&event.to);
            if from_member == to_member {
                // Internal movement or unrelated row.
                continue;
            }
            let entry = raw_by_token.entry(token.clone()).or_default();
            if to_member {
                *entry += amount;
            } else {
                *entry -= amount;
            }
        }

        let mut holdings: Vec<Holding> = raw_by_token
            .into_iter()
            .map(|(token, raw)| {
                let info = prices.get(&token);
                let decimals = info.map(|i| i.decimals).unwrap_or_else(|| default_decimals(&token));
                let price = info.map(|i| i.price_usd).unwrap_or(0.0);
                let negative = raw.sign() == num_bigint::Sign::Minus;
                let magnitude = scale_amount(&raw.magnitude().to_string(), decimals);
                let balance = if negative { -magnitude } else { magnitude };
                Holding {
                    token_address: token,
                    balance,
                    value_usd: balance * price,
                    percent: 0.0,
                }
            })
            .collect();

        let total_positive: f64 = holdings.iter().map(|h| h.value_usd.max(0.0)).sum();
        if total_positive > 0.0 {
            for h in holdings.iter_mut() {
                h.percent = (h.value_usd.max(0.0) / total_positive) * 100.0;
            }
        }
        holdings.sort_by(|a, b| {
            b.value_usd
                .partial_cmp(&a.value_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(holdings)
    }

    /// Daily USD net-flow series plus per-token breakdown over a window.
    pub fn flows(
        &self,
        entity: &EntityDef,
        window_days: i64,
        now: i64,
    ) -> Result<(Vec<FlowPoint>, Vec<TokenFlow>)> {
        let since = now - window_days * 86_400;
        let members = entity.normalized_addresses();
        let events = self.entity_events(entity, since)?;

        let mut daily: BTreeMap<i64, (f64, f64)> = BTreeMap::new();
        let mut by_token: BTreeMap<String, (f64, f64)> = BTreeMap::new();

        for event in &events {
            let usd = event.amount_usd.unwrap_or(0.0);
            if usd == 0.0 {
                continue;
            }
            let from_member = members.contains(&event.from);
            let to_member = members.contains(&event.to);
            if from_member == to_member {
                continue;
            }
            let day = day_bucket(event.timestamp);
            let token = event.token_address.clone().unwrap_or_default();
            let (inflow, outflow) = daily.entry(day).or_insert((0.0, 0.0));
            let (t_in, t_out) = by_token.entry(token).or_insert((0.0, 0.0));
            if to_member {
                *inflow += usd;
                *t_in += usd;
            } else {
                *outflow += usd;
                *t_out += usd;
            }
        }

        let series = daily
            .into_iter()
            .map(|(day, (inflow, outflow))| FlowPoint {
                day,
                inflow_usd: inflow,
                outflow_usd: outflow,
                net_usd: inflow - outflow,
            })
            .collect();

        let token_flows = by_token
            .into_iter()
            .map(|(token, (inflow, outflow))| TokenFlow {
                token_address: token,
                inflow_usd: inflow,
                outflow_usd: outflow,
                net_usd: inflow - outflow,
                dominant_flow: dominant_flow(inflow, outflow),
            })
            .collect();

        Ok((series, token_flows))
    }

    /// Transfers whose counterparty is a known bridge contract, grouped by
    /// destination chain and direction.
    pub fn bridges(&self, entity: &EntityDef, since_ts: i64) -> Result<Vec<BridgeActivity>> {
        let members = entity.normalized_addresses();
        let events = self.entity_events(entity, since_ts)?;

        let mut grouped: BTreeMap<(String, String, BridgeDirection), (u64, f64)> = BTreeMap::new();
        for event in &events {
            let from_member = members.contains(&event.from);
            let counterparty = if from_member { &event.to } else { &event.from };
            let Some(bridge) = self.labels.bridge(counterparty) else {
                continue;
            };

            let destination = NetworkId::from_tag(&bridge.to_chain);
            let direction = if from_member {
                // Value leaving this network toward the bridge's destination.
                classify_direction(Some(event.network), destination)
            } else {
                // Value arriving from the bridge's destination.
                classify_direction(destination, Some(event.network))
            };

            let key = (bridge.name.clone(), bridge.to_chain.clone(), direction);
            let (count, volume) = grouped.entry(key).or_insert((0, 0.0));
            *count += 1;
            *volume += event.amount_usd.unwrap_or(0.0);
        }

        Ok(grouped
            .into_iter()
            .map(|((bridge_name, to_chain, direction), (tx_count, volume_usd))| BridgeActivity {
                bridge_name,
                to_chain,
                direction,
                tx_count,
                volume_usd,
            })
            .collect())
    }
}

fn classify_direction(src: Option<NetworkId>, dst: Option<NetworkId>) -> BridgeDirection {
    match (src, dst) {
        (Some(s), Some(d)) if s.is_l1() && !d.is_l1() => BridgeDirection::L1ToL2,
        (Some(s), Some(d)) if !s.is_l1() && d.is_l1() => BridgeDirection::L2ToL1,
        _ => BridgeDirection::CrossChain,
    }
}

fn dominant_flow(inflow: f64, outflow: f64) -> DominantFlow {
    let gross = inflow + outflow;
    let net = inflow - outflow;
    if gross <= 0.0 || net.abs() < gross * NEUTRAL_FLOW_RATIO {
        DominantFlow::Neutral
    } else if net > 0.0 {
        DominantFlow::Inflow
    } else {
        DominantFlow::Outflow
    }
}

#[inline]
fn day_bucket(ts: i64) -> i64 {
    (ts / 86_400) * 86_400
}

impl PartialOrd for BridgeDirection {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BridgeDirection {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (*self as u8).cmp(&(*other as u8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventType, IngestionSource};
    use crate::store::db::Db;
    use crate::store::events::event_id;

    fn event(
        network: NetworkId,
        n: u64,
        from: &str,
        to: &str,
        token: &str,
        amount: &str,
        usd: f64,
        ts: i64,
    ) -> UnifiedEvent {
        let tx_hash = format!("0x{n:064x}");
        UnifiedEvent {
            event_id: event_id(network, &tx_hash, n),
            network,
            chain_id: network.chain_id(),
            tx_hash,
            log_index: n,
            block_number: n,
            timestamp: ts,
            from: from.into(),
            to: to.into(),
            token_address: Some(token.into()),
            amount: amount.into(),
            amount_usd: Some(usd),
            event_type: EventType::Transfer,
            ingestion_source: IngestionSource::Rpc,
        }
    }

    fn entity() -> EntityDef {
        EntityDef {
            name: "treasury".into(),
            addresses: vec!["0xE1".into(), "0xE2".into()],
        }
    }

    fn setup() -> (EntityAggregator, EventStore) {
        let db = Db::open_in_memory().unwrap();
        let store = EventStore::new(db.clone());
        let agg = EntityAggregator::new(EventStore::new(db), Arc::new(LabelMaps::builtin()));
        (agg, store)
    }

    #[test]
    fn holdings_net_in_minus_out_with_decimals() {
        let (agg, store) = setup();
        let now = 1_700_000_000;
        store
            .insert_events(&[
                // 5 USDC in (6 decimals), 2 USDC out.
                event(NetworkId::Eth, 1, "0xx", "0xe1", "0xusdc", "5000000", 5.0, now - 100),
                event(NetworkId::Eth, 2, "0xe2", "0xy", "0xusdc", "2000000", 2.0, now - 50),
                // 1 WETH in (18 decimals).
                event(
                    NetworkId::Eth,
                    3,
                    "0xx",
                    "0xe1",
                    "0xweth",
                    "1000000000000000000",
                    3_000.0,
                    now - 10,
                ),
                // Internal move must cancel out.
                event(NetworkId::Eth, 4, "0xe1", "0xe2", "0xusdc", "9000000", 9.0, now - 5),
            ])
            .unwrap();

        let prices = HashMap::from([
            (
                "0xusdc".to_string(),
                TokenInfo {
                    decimals: 6,
                    price_usd: 1.0,
                },
            ),
            (
                "0xweth".to_string(),
                TokenInfo {
                    decimals: 18,
                    price_usd: 3_000.0,
                },
            ),
        ]);

        let holdings = agg.holdings(&entity(), &prices, 0).unwrap();
        assert_eq!(holdings.len(), 2);

        let weth = holdings
            .iter()
            .find(|h| h.token_address == "0xweth")
            .unwrap();
        assert_eq!(weth.balance, 1.0);
        assert_eq!(weth.value_usd, 3_000.0);

        let usdc = holdings
            .iter()
            .find(|h| h.token_address == "0xusdc")
            .unwrap();
        assert_eq!(usdc.balance, 3.0);
        assert_eq!(usdc.value_usd, 3.0);

        let percent_sum: f64 = holdings.iter().map(|h| h.percent).sum();
        assert!((percent_sum - 100.0).abs() < 1e-9);
    }

    #[test]
    fn flows_bucket_by_day_and_classify_dominance() {
        let (agg, store) = setup();
        let now = 1_700_000_000;
        let day = day_bucket(now);
        store
            .insert_events(&[
                event(NetworkId::Eth, 1, "0xx", "0xe1", "0xusdc", "1", 1_000.0, now - 86_400),
                event(NetworkId::Eth, 2, "0xe1", "0xy", "0xusdc", "1", 100.0, now - 3_600),
                event(NetworkId::Eth, 3, "0xx", "0xe2", "0xweth", "1", 500.0, now - 3_000),
                event(NetworkId::Eth, 4, "0xe2", "0xy", "0xweth", "1", 520.0, now - 2_000),
            ])
            .unwrap();

        let (series, tokens) = agg.flows(&entity(), 7, now).unwrap();
        assert_eq!(series.len(), 2);
        let today = series.iter().find(|p| p.day == day).unwrap();
        assert_eq!(today.inflow_usd, 500.0);
        assert_eq!(today.outflow_usd, 620.0);
        assert_eq!(today.net_usd, -120.0);

        let usdc = tokens.iter().find(|t| t.token_address == "0xusdc").unwrap();
        assert_eq!(usdc.dominant_flow, DominantFlow::Inflow);
        let weth = tokens.iter().find(|t| t.token_address == "0xweth").unwrap();
        // |net| = 20 against gross 1020: neutral.
        assert_eq!(weth.dominant_flow, DominantFlow::Neutral);
    }

    #[test]
    fn bridge_transfers_group_by_destination_and_direction() {
        let (agg, store) = setup();
        let now = 1_700_000_000;
        let op_gateway = "0x99c9fc46f92e8a1c0dec1b1747d010903e884be1";
        store
            .insert_events(&[
                // Deposit: entity on ETH sends to the Optimism gateway.
                event(NetworkId::Eth, 1, "0xe1", op_gateway, "0xusdc", "1", 100.0, now - 10),
                event(NetworkId::Eth, 2, "0xe1", op_gateway, "0xusdc", "1", 50.0, now - 9),
                // Withdrawal leg: gateway pays the entity back.
                event(NetworkId::Eth, 3, op_gateway, "0xe2", "0xusdc", "1", 30.0, now - 8),
            ])
            .unwrap();

        let activity = agg.bridges(&entity(), 0).unwrap();
        assert_eq!(activity.len(), 2);

        let deposit = activity
            .iter()
            .find(|a| a.direction == BridgeDirection::L1ToL2)
            .unwrap();
        assert_eq!(deposit.bridge_name, "Optimism Gateway");
        assert_eq!(deposit.to_chain, "OP");
        assert_eq!(deposit.tx_count, 2);
        assert_eq!(deposit.volume_usd, 150.0);

        let withdrawal = activity
            .iter()
            .find(|a| a.direction == BridgeDirection::L2ToL1)
            .unwrap();
        assert_eq!(withdrawal.tx_count, 1);
        assert_eq!(withdrawal.volume_usd, 30.0);
    }

    #[test]
    fn dominant_flow_thresholds() {
        assert_eq!(dominant_flow(100.0, 0.0), DominantFlow::Inflow);
        assert_eq!(dominant_flow(0.0, 100.0), DominantFlow::Outflow);
        assert_eq!(dominant_flow(52.0, 48.0), DominantFlow::Neutral);
        assert_eq!(dominant_flow(0.0, 0.0), DominantFlow::Neutral);
    }
}
