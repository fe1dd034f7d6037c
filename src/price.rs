//! Injected USD price provider.
//!
//! The core never fails on an unpriced token: `price_usd` returning `None`
//! means the event's `amount_usd` stays empty and aggregation treats it as
//! zero. The HTTP implementation keeps a bounded-staleness cache so repeated
//! lookups within a window don't hammer the endpoint.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Quotes are considered fresh for this long.
const PRICE_CACHE_TTL_SECONDS: i64 = 300;

#[async_trait]
pub trait PriceProvider: Send + Sync {
    /// USD price for one token unit at `timestamp` (or spot when None).
    async fn price_usd(&self, token_address: &str, timestamp: Option<i64>) -> Option<f64>;
}

/// Fixed table. Used by tests and for entity valuation injection.
#[derive(Debug, Default, Clone)]
pub struct StaticPrices {
    prices: HashMap<String, f64>,
}

impl StaticPrices {
    pub fn new(entries: &[(&str, f64)]) -> Self {
        Self {
            prices: entries
                .iter()
                .map(|(k, v)| (k.to_lowercase(), *v))
                .collect(),
        }
    }
}

#[async_trait]
impl PriceProvider for StaticPrices {
    async fn price_usd(&self, token_address: &str, _timestamp: Option<i64>) -> Option<f64> {
        self.prices.get(&token_address.to_lowercase()).copied()
    }
}

#[derive(Debug, Deserialize)]
struct PriceResponse {
    price: Option<f64>,
}

struct CachedQuote {
    price: f64,
    fetched_at: i64,
}

/// HTTP price endpoint: `GET {base}/price?token=0x...` returning `{"price": f64}`.
pub struct HttpPriceProvider {
    client: reqwest::Client,
    base_url: String,
    cache: RwLock<HashMap<String, CachedQuote>>,
}

impl HttpPriceProvider {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url,
            cache: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl PriceProvider for HttpPriceProvider {
    async fn price_usd(&self, token_address: &str, _timestamp: Option<i64>) -> Option<f64> {
        let token = token_address.to_lowercase();
        let now = Utc::now().timestamp();

        if let Some(hit) = self.cache.read().get(&token) {
            if now - hit.fetched_at <= PRICE_CACHE_TTL_SECONDS {
                return Some(hit.price);
            }
        }

        let url = format!("{}/price?token={}", self.base_url.trim_end_matches('/'), token);
        let resp = match self.client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(token = %token, error = %e, "price fetch failed");
                // Stale quote beats no quote.
                return self.cache.read().get(&token).map(|q| q.price);
            }
        };

        let resp = match resp.error_for_status() {
            Ok(r) => r,
            Err(e) => {
                debug!(token = %token, error = %e, "price endpoint rejected request");
                return self.cache.read().get(&token).map(|q| q.price);
            }
        };
        let parsed: PriceResponse = match resp.json().await {
            Ok(v) => v,
            Err(e) => {
                debug!(token = %token, error = %e, "unparseable price response");
                return self.cache.read().get(&token).map(|q| q.price);
            }
        };

        let price = parsed.price.filter(|p| p.is_finite() && *p >= 0.0)?;
        self.cache.write().insert(
            token,
            CachedQuote {
                price,
                fetched_at: now,
            },
        );
        Some(price)
    }
}

/// Token decimals for valuation. The major stables run 6; everything else is
/// assumed 18 unless the operator's label artifact says otherwise.
pub fn default_decimals(token_address: &str) -> u32 {
    match token_address.to_lowercase().as_str() {
        // USDC / USDT across the supported networks.
        "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48"
        | "0xdac17f958d2ee523a2206206994597c13d831ec7"
        | "0xaf88d065e77c8cc2239327c5edb3a432268e5831"
        | "0x833589fcd6edb6e08f4c7c32d4f71b54bda02913"
        | "0x2791bca1f2de4661ed88a30c99a7a9449aa84174" => 6,
        // WBTC.
        "0x2260fac5e5542a773aa44fbcfedf7c193bc2c599" => 8,
        _ => 18,
    }
}

/// Raw integer amount string scaled by token decimals. Lossy (f64) on
/// purpose; USD valuation doesn't need wei precision.
pub fn scale_amount(amount: &str, decimals: u32) -> f64 {
    let raw: f64 = amount.parse().unwrap_or(0.0);
    if !raw.is_finite() {
        return 0.0;
    }
    raw / 10f64.powi(decimals as i32)
}

/// Attach USD valuations to a batch of events. Unpriced tokens stay `None`.
pub async fn enrich_events_usd(
    events: &mut [crate::models::UnifiedEvent],
    provider: &dyn PriceProvider,
) {
    for event in events.iter_mut() {
        let Some(token) = event.token_address.clone() else {
            continue;
        };
        let Some(price) = provider.price_usd(&token, Some(event.timestamp)).await else {
            continue;
        };
        let units = scale_amount(&event.amount, default_decimals(&token));
        let usd = units * price;
        if usd.is_finite() {
            event.amount_usd = Some(usd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_prices_are_case_insensitive_and_optional() {
        let prices = StaticPrices::new(&[("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", 1.0)]);
        assert_eq!(
            prices
                .price_usd("0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", None)
                .await,
            Some(1.0)
        );
        assert_eq!(prices.price_usd("0xdeadbeef", None).await, None);
    }

    #[test]
    fn amount_scaling_honors_decimals() {
        assert_eq!(scale_amount("1000000", 6), 1.0);
        assert_eq!(scale_amount("1000000000000000000", 18), 1.0);
        assert_eq!(scale_amount("garbage", 18), 0.0);
        assert_eq!(
            default_decimals("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48"),
            6
        );
        assert_eq!(default_decimals("0xsomething"), 18);
    }

    #[tokio::test]
    async fn enrichment_prices_known_tokens_only() {
        let provider = StaticPrices::new(&[("0xusdc", 1.0)]);
        let mut events = vec![
            crate::models::UnifiedEvent {
                event_id: "e1".into(),
                network: crate::models::NetworkId::Eth,
                chain_id: 1,
                tx_hash: "0x1".into(),
                log_index: 0,
                block_number: 1,
                timestamp: 0,
                from: "0xa".into(),
                to: "0xb".into(),
                token_address: Some("0xusdc".into()),
                amount: "5000000000000000000".into(),
                amount_usd: None,
                event_type: crate::models::EventType::Transfer,
                ingestion_source: crate::models::IngestionSource::Rpc,
            },
        ];
        events.push(crate::models::UnifiedEvent {
            token_address: Some("0xunknown".into()),
            ..events[0].clone()
        });

        enrich_events_usd(&mut events, &provider).await;
        assert_eq!(events[0].amount_usd, Some(5.0));
        assert_eq!(events[1].amount_usd, None);
    }
}
