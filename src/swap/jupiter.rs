// =============================================================================
// Swap Adapter — token swaps through the Jupiter aggregator
// =============================================================================
//
// Two-step flow: `quote` fetches a route with a minimum-out bound; `execute`
// posts the route back, receives a serialized transaction, signs it with
// the operator wallet, and submits + confirms through the Chain Gateway.
// Execution is synchronous from the caller's view.
//
// Error split: slippage-beyond-tolerance and insufficient-balance are
// terminal; an expired route is retryable with a fresh quote; transport
// noise is transient.
// =============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine as _;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signer::Signer;
use solana_sdk::transaction::VersionedTransaction;
use tracing::{debug, info, instrument, warn};

use crate::chain::wallet::Wallet;
use crate::chain::{ChainGateway, ConfirmStatus};
use crate::error::{classify_remote_error, EngineError};

/// A priced route returned by `quote`, consumed once by `execute`.
#[derive(Debug, Clone)]
pub struct SwapQuote {
    /// Opaque aggregator route, posted back verbatim on execution.
    pub route: serde_json::Value,
    pub input_mint: Pubkey,
    pub output_mint: Pubkey,
    pub amount_in_raw: u64,
    /// Floor enforced on chain; the observed out amount must meet it.
    pub min_out_raw: u64,
    /// Estimated raw out/in ratio.
    pub est_price: f64,
}

/// On-chain effect of an executed swap.
#[derive(Debug, Clone)]
pub struct SwapOutcome {
    pub signature: String,
    pub out_raw: u64,
    /// Achieved raw out/in ratio.
    pub effective_price: f64,
}

#[async_trait]
pub trait SwapAdapter: Send + Sync {
    async fn quote(
        &self,
        input_mint: &Pubkey,
        output_mint: &Pubkey,
        amount_raw: u64,
        slippage_bps: u16,
        protection_flags: &serde_json::Value,
    ) -> Result<SwapQuote, EngineError>;

    async fn execute(&self, quote: &SwapQuote) -> Result<SwapOutcome, EngineError>;
}

// ---------------------------------------------------------------------------
// Jupiter implementation
// ---------------------------------------------------------------------------

pub struct JupiterSwapAdapter {
    http: reqwest::Client,
    base_url: String,
    gateway: Arc<ChainGateway>,
    wallet: Wallet,
}

impl JupiterSwapAdapter {
    pub fn new(base_url: impl Into<String>, gateway: Arc<ChainGateway>, wallet: Wallet) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            http,
            base_url: base_url.into(),
            gateway,
            wallet,
        }
    }

    fn parse_raw_amount(value: Option<&serde_json::Value>) -> Option<u64> {
        match value? {
            serde_json::Value::String(s) => s.parse().ok(),
            serde_json::Value::Number(n) => n.as_u64(),
            _ => None,
        }
    }
}

#[async_trait]
impl SwapAdapter for JupiterSwapAdapter {
    #[instrument(skip(self, protection_flags), name = "swap::quote")]
    async fn quote(
        &self,
        input_mint: &Pubkey,
        output_mint: &Pubkey,
        amount_raw: u64,
        slippage_bps: u16,
        protection_flags: &serde_json::Value,
    ) -> Result<SwapQuote, EngineError> {
        let mut url = format!(
            "{}/quote?inputMint={}&outputMint={}&amount={}&slippageBps={}",
            self.base_url, input_mint, output_mint, amount_raw, slippage_bps
        );
        // Protection flags are opaque: forwarded as query parameters without
        // interpretation.
        if let Some(flags) = protection_flags.as_object() {
            for (key, value) in flags {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                url.push_str(&format!("&{key}={rendered}"));
            }
        }

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| EngineError::TransientRpc(format!("quote request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::TransientRpc(format!("quote response unreadable: {e}")))?;

        if !status.is_success() {
            let message = body["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            return Err(classify_remote_error(&message));
        }

        let out_amount = Self::parse_raw_amount(body.get("outAmount")).ok_or_else(|| {
            EngineError::Internal("quote response missing outAmount".into())
        })?;
        let min_out_raw = Self::parse_raw_amount(body.get("otherAmountThreshold"))
            .unwrap_or(out_amount);

        let est_price = if amount_raw > 0 {
            out_amount as f64 / amount_raw as f64
        } else {
            0.0
        };

        debug!(
            %input_mint,
            %output_mint,
            amount_raw,
            out_amount,
            min_out_raw,
            "swap quoted"
        );

        Ok(SwapQuote {
            route: body,
            input_mint: *input_mint,
            output_mint: *output_mint,
            amount_in_raw: amount_raw,
            min_out_raw,
            est_price,
        })
    }

    #[instrument(skip(self, quote), fields(input = %quote.input_mint, output = %quote.output_mint), name = "swap::execute")]
    async fn execute(&self, quote: &SwapQuote) -> Result<SwapOutcome, EngineError> {
        let payload = serde_json::json!({
            "quoteResponse": quote.route,
            "userPublicKey": self.wallet.pubkey().to_string(),
            "wrapAndUnwrapSol": true,
            "prioritizationFeeLamports": "auto",
        });

        let resp = self
            .http
            .post(format!("{}/swap", self.base_url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::TransientRpc(format!("swap request failed: {e}")))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::TransientRpc(format!("swap response unreadable: {e}")))?;

        if !status.is_success() {
            let message = body["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| body.to_string());
            return Err(classify_remote_error(&message));
        }

        let tx_b64 = body["swapTransaction"].as_str().ok_or_else(|| {
            EngineError::Internal("swap response missing swapTransaction".into())
        })?;

        let tx_bytes = base64::engine::general_purpose::STANDARD
            .decode(tx_b64)
            .map_err(|e| EngineError::Internal(format!("swap transaction not base64: {e}")))?;
        let mut tx: VersionedTransaction = bincode::deserialize(&tx_bytes)
            .map_err(|e| EngineError::Internal(format!("swap transaction undecodable: {e}")))?;

        // The aggregator leaves the fee-payer signature slot empty; sign it.
        let message_bytes = tx.message.serialize();
        let signature = self.wallet.keypair().sign_message(&message_bytes);
        if tx.signatures.is_empty() {
            tx.signatures.push(signature);
        } else {
            tx.signatures[0] = signature;
        }

        // Observed out amount is the balance delta on the destination ATA.
        let out_ata = crate::amm::RpcAmmAdapter::associated_token_address(
            &self.wallet.pubkey(),
            &quote.output_mint,
        );
        let before = self.gateway.get_token_balance(&out_ata).await.unwrap_or(0);

        let sig = self.gateway.submit_versioned_transaction(&tx).await?;
        match self.gateway.confirm_signature(&sig, None).await? {
            ConfirmStatus::Confirmed => {}
            ConfirmStatus::FailedOnChain(reason) => return Err(classify_remote_error(&reason)),
            ConfirmStatus::Timeout => {
                return Err(EngineError::TransientRpc(format!(
                    "swap confirmation timeout for {sig}"
                )))
            }
        }

        let after = self.gateway.get_token_balance(&out_ata).await.unwrap_or(before);
        let out_raw = after.saturating_sub(before);
        if out_raw < quote.min_out_raw {
            // The program enforces min-out; a smaller observed delta means
            // an unrelated balance movement interleaved with the read.
            warn!(
                %sig,
                out_raw,
                min_out = quote.min_out_raw,
                "observed out amount below quoted floor"
            );
        }

        let effective_price = if quote.amount_in_raw > 0 {
            out_raw as f64 / quote.amount_in_raw as f64
        } else {
            0.0
        };

        info!(%sig, out_raw, effective_price, "swap executed");
        Ok(SwapOutcome {
            signature: sig.to_string(),
            out_raw,
            effective_price,
        })
    }
}
