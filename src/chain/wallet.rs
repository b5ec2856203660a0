// =============================================================================
// Operator wallet — single keypair, loaded once at boot
// =============================================================================
//
// Key management and encryption-at-rest live outside this process; we accept
// either a CLI-style keypair file (MERIDIAN_WALLET_KEYPAIR) or a base58
// secret (MERIDIAN_WALLET_SECRET). The secret never appears in logs or
// Debug output.
// =============================================================================

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{read_keypair_file, Keypair};
use solana_sdk::signer::Signer;
use tracing::info;

/// Env var pointing at a JSON keypair file (solana-cli `id.json` format).
pub const ENV_WALLET_KEYPAIR: &str = "MERIDIAN_WALLET_KEYPAIR";
/// Env var carrying the base58-encoded 64-byte secret directly.
pub const ENV_WALLET_SECRET: &str = "MERIDIAN_WALLET_SECRET";

/// The single operator wallet used for every transaction this process signs.
#[derive(Clone)]
pub struct Wallet {
    keypair: Arc<Keypair>,
}

impl Wallet {
    /// Load the wallet from the environment, preferring the file path.
    pub fn from_env() -> Result<Self> {
        if let Ok(path) = std::env::var(ENV_WALLET_KEYPAIR) {
            let keypair = read_keypair_file(&path)
                .map_err(|e| anyhow::anyhow!("failed to read keypair file {path}: {e}"))?;
            let wallet = Self {
                keypair: Arc::new(keypair),
            };
            info!(pubkey = %wallet.pubkey(), "wallet loaded from keypair file");
            return Ok(wallet);
        }

        if let Ok(secret) = std::env::var(ENV_WALLET_SECRET) {
            return Self::from_base58(secret.trim());
        }

        bail!("no wallet configured: set {ENV_WALLET_KEYPAIR} or {ENV_WALLET_SECRET}")
    }

    /// Build from a base58-encoded 64-byte secret key.
    pub fn from_base58(secret: &str) -> Result<Self> {
        let bytes = bs58::decode(secret)
            .into_vec()
            .context("wallet secret is not valid base58")?;
        let keypair =
            Keypair::from_bytes(&bytes).context("wallet secret is not a 64-byte keypair")?;
        let wallet = Self {
            keypair: Arc::new(keypair),
        };
        info!(pubkey = %wallet.pubkey(), "wallet loaded from secret");
        Ok(wallet)
    }

    #[cfg(test)]
    pub fn ephemeral() -> Self {
        Self {
            keypair: Arc::new(Keypair::new()),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("pubkey", &self.pubkey().to_string())
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58_roundtrip() {
        let original = Keypair::new();
        let encoded = bs58::encode(original.to_bytes()).into_string();

        let wallet = Wallet::from_base58(&encoded).unwrap();
        assert_eq!(wallet.pubkey(), original.pubkey());
    }

    #[test]
    fn rejects_garbage_secret() {
        assert!(Wallet::from_base58("not-base58-???").is_err());
        assert!(Wallet::from_base58("abc").is_err());
    }

    #[test]
    fn debug_redacts_secret() {
        let wallet = Wallet::ephemeral();
        let debug = format!("{wallet:?}");
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(&bs58::encode(wallet.keypair().to_bytes()).into_string()));
    }
}
