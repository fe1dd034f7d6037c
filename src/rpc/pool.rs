//! Multi-provider endpoint pool per network.
//!
//! Selection is weighted-random over the selectable providers, biased toward
//! idle, well-behaved endpoints. The pool is the only mutator of provider
//! runtime counters; callers acquire a slot, perform their call, and release
//! it with the outcome.

use chrono::Utc;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::ProvidersFile;
use crate::error::IngestError;
use crate::models::NetworkId;
use crate::rpc::provider::{ProviderState, ProviderStatusRow};

/// A granted request slot. Carries everything the adapter needs to place the
/// call; must be handed back via `release`.
#[derive(Debug, Clone)]
pub struct ProviderSlot {
    pub network: NetworkId,
    pub provider_id: String,
    pub endpoint: String,
}

/// Outcome reported when a slot is released.
#[derive(Debug, Clone)]
pub enum SlotOutcome {
    Success,
    Failure { rate_limited: bool, message: String },
}

pub struct RpcPool {
    pools: HashMap<NetworkId, Mutex<Vec<ProviderState>>>,
}

impl RpcPool {
    pub fn new(providers: &ProvidersFile, active: &[NetworkId]) -> Self {
        let mut pools = HashMap::new();
        for network in active {
            let settings = providers.settings(*network);
            if settings.providers.is_empty() {
                warn!(network = %network, "no providers configured");
            }
            let states = settings
                .providers
                .into_iter()
                .map(ProviderState::new)
                .collect();
            pools.insert(*network, Mutex::new(states));
        }
        Self { pools }
    }

    fn pool(&self, network: NetworkId) -> Result<&Mutex<Vec<ProviderState>>, IngestError> {
        self.pools
            .get(&network)
            .ok_or_else(|| IngestError::UnknownChain(network.as_str().to_string()))
    }

    /// Grant a request slot, or a typed refusal the orchestrator yields on.
    pub fn acquire(&self, network: NetworkId) -> Result<ProviderSlot, IngestError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut pool = self.pool(network)?.lock();

        let selectable: Vec<usize> = pool
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_selectable(now_ms))
            .map(|(i, _)| i)
            .collect();
        if selectable.is_empty() {
            return Err(IngestError::NoProviders { network });
        }

        let budgeted: Vec<usize> = selectable
            .iter()
            .copied()
            .filter(|&i| pool[i].has_budget(now_ms))
            .collect();
        if budgeted.is_empty() {
            // Every healthy endpoint spent its minute budget.
            let provider = pool[selectable[0]].provider_id().to_string();
            return Err(IngestError::RateLimited { network, provider });
        }

        let idx = weighted_pick(&pool, &budgeted);
        let p = &mut pool[idx];
        if !p.consume_budget(now_ms) {
            let provider = p.provider_id().to_string();
            return Err(IngestError::RateLimited { network, provider });
        }
        p.begin_request();
        debug!(network = %network, provider = p.provider_id(), "slot granted");

        Ok(ProviderSlot {
            network,
            provider_id: p.provider_id().to_string(),
            endpoint: p.config.endpoint(),
        })
    }

    pub fn release(&self, slot: &ProviderSlot, outcome: SlotOutcome) {
        let now_ms = Utc::now().timestamp_millis();
        let Ok(pool) = self.pool(slot.network) else {
            return;
        };
        let mut pool = pool.lock();
        let Some(p) = pool
            .iter_mut()
            .find(|p| p.provider_id() == slot.provider_id)
        else {
            return;
        };
        match outcome {
            SlotOutcome::Success => p.on_success(),
            SlotOutcome::Failure {
                rate_limited,
                message,
            } => {
                p.on_failure(now_ms, rate_limited, &message);
                if rate_limited {
                    warn!(
                        network = %slot.network,
                        provider = %slot.provider_id,
                        "provider rate limited, entering cooldown"
                    );
                }
            }
        }
    }

    /// Record follow-up calls made on an already-held slot so the minute
    /// budget stays truthful (block timestamp fan-out).
    pub fn note_extra_requests(&self, slot: &ProviderSlot, count: u32) {
        let now_ms = Utc::now().timestamp_millis();
        if let Ok(pool) = self.pool(slot.network) {
            let mut pool = pool.lock();
            if let Some(p) = pool
                .iter_mut()
                .find(|p| p.provider_id() == slot.provider_id)
            {
                p.consume_extra(now_ms, count);
            }
        }
    }

    pub fn set_provider_enabled(
        &self,
        network: NetworkId,
        provider_id: &str,
        enabled: bool,
    ) -> Result<(), IngestError> {
        let mut pool = self.pool(network)?.lock();
        let p = pool
            .iter_mut()
            .find(|p| p.provider_id() == provider_id)
            .ok_or_else(|| {
                IngestError::Store(format!("unknown provider {provider_id} on {network}"))
            })?;
        p.set_enabled(enabled);
        Ok(())
    }

    pub fn status_rows(&self, network: NetworkId) -> Vec<ProviderStatusRow> {
        let now_ms = Utc::now().timestamp_millis();
        match self.pool(network) {
            Ok(pool) => pool.lock().iter().map(|p| p.status_row(now_ms)).collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn all_status_rows(&self) -> HashMap<NetworkId, Vec<ProviderStatusRow>> {
        self.pools
            .keys()
            .map(|n| (*n, self.status_rows(*n)))
            .collect()
    }

    pub fn networks(&self) -> Vec<NetworkId> {
        self.pools.keys().copied().collect()
    }
}

fn weighted_pick(pool: &[ProviderState], candidates: &[usize]) -> usize {
    let total: f64 = candidates.iter().map(|&i| pool[i].selection_score()).sum();
    if total <= 0.0 {
        return candidates[0];
    }
    let mut roll = rand::thread_rng().gen_range(0.0..total);
    for &i in candidates {
        let score = pool[i].selection_score();
        if roll < score {
            return i;
        }
        roll -= score;
    }
    candidates[candidates.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NetworkSettings, ProviderConfig};

    fn pool_with(providers: Vec<ProviderConfig>) -> RpcPool {
        let mut file = ProvidersFile::default();
        file.networks.insert(
            "ETH".into(),
            NetworkSettings {
                start_block: 0,
                window_override: None,
                providers,
            },
        );
        RpcPool::new(&file, &[NetworkId::Eth])
    }

    fn cfg(id: &str, rate_limit: u32) -> ProviderConfig {
        ProviderConfig {
            provider_id: id.into(),
            url: format!("https://{id}.invalid"),
            api_key: None,
            weight: 10,
            rate_limit,
            cooldown_ms: 30_000,
            enabled: true,
        }
    }

    #[test]
    fn exhausted_budget_returns_rate_limited() {
        let pool = pool_with(vec![cfg("only", 1)]);
        let slot = pool.acquire(NetworkId::Eth).unwrap();
        pool.release(&slot, SlotOutcome::Success);
        match pool.acquire(NetworkId::Eth) {
            Err(IngestError::RateLimited { network, .. }) => assert_eq!(network, NetworkId::Eth),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn all_cooling_down_returns_no_providers() {
        let pool = pool_with(vec![cfg("a", 100), cfg("b", 100)]);
        for _ in 0..2 {
            let slot = pool.acquire(NetworkId::Eth).unwrap();
            pool.release(
                &slot,
                SlotOutcome::Failure {
                    rate_limited: true,
                    message: "429".into(),
                },
            );
        }
        match pool.acquire(NetworkId::Eth) {
            Err(IngestError::NoProviders { network }) => assert_eq!(network, NetworkId::Eth),
            other => panic!("expected NoProviders, got {other:?}"),
        }
    }

    #[test]
    fn disabled_provider_is_skipped() {
        let pool = pool_with(vec![cfg("a", 100), cfg("b", 100)]);
        pool.set_provider_enabled(NetworkId::Eth, "a", false)
            .unwrap();
        for _ in 0..5 {
            let slot = pool.acquire(NetworkId::Eth).unwrap();
            assert_eq!(slot.provider_id, "b");
            pool.release(&slot, SlotOutcome::Success);
        }
        let rows = pool.status_rows(NetworkId::Eth);
        let a = rows.iter().find(|r| r.provider_id == "a").unwrap();
        assert!(!a.enabled);
        assert_eq!(a.request_count, 0);
    }

    #[test]
    fn unknown_network_is_typed() {
        let pool = pool_with(vec![cfg("a", 100)]);
        assert!(matches!(
            pool.acquire(NetworkId::Base),
            Err(IngestError::UnknownChain(_))
        ));
    }
}
