// =============================================================================
// Token precision cache — mint decimals, fetched once, single-flight
// =============================================================================
//
// Raw amounts are meaningless without the decimals that interpret them, so
// every mint's precision is resolved exactly once from its SPL mint account
// and cached process-wide. Concurrent misses for the same mint collapse to
// one fetch via a per-mint OnceCell.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::chain::ChainGateway;
use crate::error::EngineError;

/// Byte offset of `decimals` in the SPL mint account layout
/// (mint_authority 36 + supply 8).
const MINT_DECIMALS_OFFSET: usize = 44;
/// Cache is bounded; populated entries past this are evicted arbitrarily.
const MAX_CACHED_MINTS: usize = 512;

/// Well-known mints pre-warmed so the common pairs never hit RPC.
const KNOWN_MINTS: &[(&str, u8)] = &[
    ("So11111111111111111111111111111111111111112", 9), // wSOL
    ("EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v", 6), // USDC
    ("Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB", 6), // USDT
];

#[derive(Clone)]
pub struct TokenPrecisionCache {
    gateway: Arc<ChainGateway>,
    cache: Arc<Mutex<HashMap<Pubkey, Arc<OnceCell<u8>>>>>,
}

impl TokenPrecisionCache {
    pub fn new(gateway: Arc<ChainGateway>) -> Self {
        let mut map = HashMap::new();
        for (mint, decimals) in KNOWN_MINTS {
            if let Ok(pk) = mint.parse::<Pubkey>() {
                let cell = OnceCell::new();
                let _ = cell.set(*decimals);
                map.insert(pk, Arc::new(cell));
            }
        }
        Self {
            gateway,
            cache: Arc::new(Mutex::new(map)),
        }
    }

    /// Decimals for `mint`, from cache or a single on-chain fetch.
    pub async fn decimals(&self, mint: &Pubkey) -> Result<u8, EngineError> {
        let cell = {
            let mut cache = self.cache.lock();
            if cache.len() >= MAX_CACHED_MINTS && !cache.contains_key(mint) {
                // Bounded cache: drop one populated entry to make room.
                if let Some(evict) = cache
                    .iter()
                    .find(|(_, c)| c.initialized())
                    .map(|(k, _)| *k)
                {
                    cache.remove(&evict);
                    debug!(mint = %evict, "evicted mint from precision cache");
                }
            }
            cache.entry(*mint).or_default().clone()
        };

        let gateway = self.gateway.clone();
        let mint = *mint;
        cell.get_or_try_init(|| async move {
            let account = gateway.get_account(&mint).await?;
            if account.data.len() <= MINT_DECIMALS_OFFSET {
                return Err(EngineError::Internal(format!(
                    "mint account {mint} too short: {} bytes",
                    account.data.len()
                )));
            }
            let decimals = account.data[MINT_DECIMALS_OFFSET];
            if decimals > 18 {
                warn!(%mint, decimals, "unusual mint decimals");
            }
            debug!(%mint, decimals, "mint decimals cached");
            Ok(decimals)
        })
        .await
        .copied()
    }

    pub fn cached_count(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Scale a raw integer amount to a human value using its mint decimals.
pub fn raw_to_ui(raw: u64, decimals: u8) -> f64 {
    raw as f64 / 10_f64.powi(decimals as i32)
}

/// Scale a human value back to raw units. Display/analytics only — chain
/// calls always carry the original raw integers.
pub fn ui_to_raw(ui: f64, decimals: u8) -> u64 {
    (ui * 10_f64.powi(decimals as i32)).round().max(0.0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache() -> TokenPrecisionCache {
        let gateway = Arc::new(ChainGateway::new(
            &["http://127.0.0.1:1".to_string()],
            "confirmed",
            Duration::from_secs(1),
        ));
        TokenPrecisionCache::new(gateway)
    }

    #[tokio::test]
    async fn known_mints_resolve_without_rpc() {
        let cache = cache();
        let usdc: Pubkey = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v"
            .parse()
            .unwrap();
        let sol: Pubkey = "So11111111111111111111111111111111111111112"
            .parse()
            .unwrap();
        // The gateway URL is unroutable, so a hit proves no fetch happened.
        assert_eq!(cache.decimals(&usdc).await.unwrap(), 6);
        assert_eq!(cache.decimals(&sol).await.unwrap(), 9);
    }

    #[test]
    fn prewarm_counts_known_tokens() {
        assert_eq!(cache().cached_count(), KNOWN_MINTS.len());
    }

    #[test]
    fn raw_ui_roundtrip() {
        assert!((raw_to_ui(25_000_000_000, 9) - 25.0).abs() < 1e-12);
        assert_eq!(ui_to_raw(25.0, 9), 25_000_000_000);
        assert_eq!(ui_to_raw(raw_to_ui(123_456_789, 6), 6), 123_456_789);
    }

    #[test]
    fn ui_to_raw_clamps_negative() {
        assert_eq!(ui_to_raw(-1.0, 6), 0);
    }
}
