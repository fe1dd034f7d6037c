//! Static label maps: well-known entities and bridge contracts.
//!
//! These are versioned deployment artifacts, loaded once and passed by `Arc`
//! into the aggregators. Updating them is a deployment event, never a runtime
//! mutation.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::models::NetworkId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnownEntity {
    pub entity_type: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BridgeContract {
    pub name: String,
    /// Destination network tag of the canonical direction.
    pub to_chain: String,
}

/// Immutable label artifact handed to C8/C9/C10 at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelMaps {
    #[serde(default)]
    pub known_entities: HashMap<String, KnownEntity>,
    #[serde(default)]
    pub bridge_contracts: HashMap<String, BridgeContract>,
}

impl LabelMaps {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read label map {path}"))?;
        let mut parsed: LabelMaps =
            toml::from_str(&raw).with_context(|| format!("invalid label map {path}"))?;
        parsed.normalize();
        Ok(parsed)
    }

    /// Lowercase every address key so lookups never depend on caller casing.
    fn normalize(&mut self) {
        let entities = std::mem::take(&mut self.known_entities);
        self.known_entities = entities
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        let bridges = std::mem::take(&mut self.bridge_contracts);
        self.bridge_contracts = bridges
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
    }

    pub fn entity(&self, address: &str) -> Option<&KnownEntity> {
        self.known_entities.get(&address.to_lowercase())
    }

    pub fn bridge(&self, address: &str) -> Option<&BridgeContract> {
        self.bridge_contracts.get(&address.to_lowercase())
    }

    /// Built-in table of the highest-traffic hot wallets, routers, and
    /// canonical bridges. Deployments ship a fuller artifact via LABELS_FILE.
    pub fn builtin() -> Self {
        let mut known_entities = HashMap::new();
        let mut bridge_contracts = HashMap::new();

        let exchanges = [
            ("0x28c6c06298d514db089934071355e5743bf21d60", "Binance 14"),
            ("0x21a31ee1afc51d94c2efccaa2092ad1028285549", "Binance 15"),
            ("0xdfd5293d8e347dfe59e90efd55b2956a1343963d", "Binance 16"),
            ("0x46340b20830761efd32832a74d7169b29feb9758", "Crypto.com 2"),
            ("0xa9d1e08c7793af67e9d92fe308d5697fb81d3e43", "Coinbase 10"),
            ("0x71660c4005ba85c37ccec55d0c4493e66fe775d3", "Coinbase 1"),
            ("0x2faf487a4414fe77e2327f0bf4ae2a264a776ad2", "FTX Exchange"),
            ("0x5041ed759dd4afc3a72b8192c143f72f4724081a", "OKX Hot Wallet"),
        ];
        for (addr, name) in exchanges {
            known_entities.insert(
                addr.to_string(),
                KnownEntity {
                    entity_type: "EXCHANGE".into(),
                    name: name.into(),
                },
            );
        }

        let routers = [
            (
                "0x7a250d5630b4cf539739df2c5dacb4c659f2488d",
                "Uniswap V2 Router",
            ),
            (
                "0xe592427a0aece92de3edee1f18e0157c05861564",
                "Uniswap V3 Router",
            ),
            (
                "0x1111111254eeb25477b68fb85ed929f73a960582",
                "1inch V5 Router",
            ),
            (
                "0xdef1c0ded9bec7f1a1670819833240f027b25eff",
                "0x Exchange Proxy",
            ),
        ];
        for (addr, name) in routers {
            known_entities.insert(
                addr.to_string(),
                KnownEntity {
                    entity_type: "PROTOCOL".into(),
                    name: name.into(),
                },
            );
        }

        let bridges = [
            (
                "0x99c9fc46f92e8a1c0dec1b1747d010903e884be1",
                "Optimism Gateway",
                NetworkId::Op,
            ),
            (
                "0x4dbd4fc535ac27206064b68ffcf827b0a60bab3f",
                "Arbitrum Delayed Inbox",
                NetworkId::Arb,
            ),
            (
                "0x3154cf16ccdb4c6d922629664174b904d80f2c35",
                "Base Bridge",
                NetworkId::Base,
            ),
            (
                "0x40ec5b33f54e0e8a33a975908c5ba1c14e5bbbdf",
                "Polygon ERC20 Bridge",
                NetworkId::Poly,
            ),
            (
                "0x32400084c286cf3e17e7b677ea9583e60a000324",
                "zkSync Era Diamond",
                NetworkId::Zksync,
            ),
            (
                "0x6774bcbd5cecef1336b5300fb5186a12ddd8b367",
                "Scroll Messenger",
                NetworkId::Scroll,
            ),
            (
                "0xd19d4b5d358258f05d7b411e21a1460d11b0876f",
                "Linea Message Service",
                NetworkId::Linea,
            ),
        ];
        for (addr, name, to_chain) in bridges {
            bridge_contracts.insert(
                addr.to_string(),
                BridgeContract {
                    name: name.into(),
                    to_chain: to_chain.as_str().into(),
                },
            );
            known_entities.insert(
                addr.to_string(),
                KnownEntity {
                    entity_type: "BRIDGE".into(),
                    name: name.into(),
                },
            );
        }

        Self {
            known_entities,
            bridge_contracts,
        }
    }
}
