// =============================================================================
// Chain Gateway — health-tracked RPC pool with failover and confirmation
// =============================================================================
//
// One endpoint per configured RPC URL (primary first). A request goes to the
// first endpoint that is healthy or whose cooldown has elapsed; a transport
// failure marks the endpoint unhealthy with an exponentially-growing
// cooldown (base 2 s, cap 60 s) and moves on to the next.
//
// Classification happens here: transport noise is `TransientRpc` and
// triggers failover; an on-chain failure (program error, insufficient
// funds) is terminal, surfaced unchanged, and does not punish the endpoint.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use solana_client::client_error::{ClientError, ClientErrorKind};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcProgramAccountsConfig;
use solana_sdk::account::Account;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::transaction::{Transaction, VersionedTransaction};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{classify_remote_error, EngineError};

/// Base unhealthy cooldown; doubles per consecutive failure.
const COOLDOWN_BASE: Duration = Duration::from_secs(2);
/// Cooldown ceiling.
const COOLDOWN_CAP: Duration = Duration::from_secs(60);
/// Confirmation poll cadence.
const CONFIRM_POLL: Duration = Duration::from_secs(1);

/// Result of waiting for a signature.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmStatus {
    Confirmed,
    /// The transaction landed but the program rejected it.
    FailedOnChain(String),
    /// The deadline elapsed without a definitive status.
    Timeout,
}

#[derive(Debug, Default)]
struct EndpointHealth {
    healthy: bool,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    last_latency_ms: Option<u64>,
    last_error: Option<String>,
}

struct GatewayEndpoint {
    url: String,
    client: Arc<RpcClient>,
    health: Mutex<EndpointHealth>,
}

impl GatewayEndpoint {
    fn available(&self) -> bool {
        let health = self.health.lock();
        if health.healthy {
            return true;
        }
        match health.cooldown_until {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    fn mark_success(&self, latency: Duration) {
        let mut health = self.health.lock();
        health.healthy = true;
        health.consecutive_failures = 0;
        health.cooldown_until = None;
        health.last_latency_ms = Some(latency.as_millis() as u64);
        health.last_error = None;
    }

    fn mark_failure(&self, error: &str) {
        let mut health = self.health.lock();
        health.healthy = false;
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        let cooldown = COOLDOWN_BASE
            .saturating_mul(1u32 << (health.consecutive_failures - 1).min(5))
            .min(COOLDOWN_CAP);
        health.cooldown_until = Some(Instant::now() + cooldown);
        health.last_error = Some(error.to_string());
        warn!(
            url = %self.url,
            failures = health.consecutive_failures,
            cooldown_secs = cooldown.as_secs(),
            error,
            "rpc endpoint marked unhealthy"
        );
    }
}

/// Endpoint health as reported by `GET /api/health`.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointReport {
    pub url: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Pooled, health-tracked access to the chain.
pub struct ChainGateway {
    endpoints: Vec<GatewayEndpoint>,
    commitment: CommitmentConfig,
    confirm_timeout: Duration,
}

impl ChainGateway {
    /// Build a gateway over `urls` (priority order, primary first).
    pub fn new(urls: &[String], commitment: &str, confirm_timeout: Duration) -> Self {
        let commitment = match commitment {
            "processed" => CommitmentConfig::processed(),
            "finalized" => CommitmentConfig::finalized(),
            _ => CommitmentConfig::confirmed(),
        };

        let endpoints = urls
            .iter()
            .map(|url| GatewayEndpoint {
                url: url.clone(),
                client: Arc::new(RpcClient::new_with_commitment(url.clone(), commitment)),
                health: Mutex::new(EndpointHealth {
                    healthy: true,
                    ..Default::default()
                }),
            })
            .collect::<Vec<_>>();

        info!(endpoints = endpoints.len(), "chain gateway initialised");
        Self {
            endpoints,
            commitment,
            confirm_timeout,
        }
    }

    pub fn commitment(&self) -> CommitmentConfig {
        self.commitment
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    /// Dispatch `f` to the first available endpoint, failing over on
    /// transport errors. On-chain errors short-circuit unchanged.
    async fn with_endpoint<T, F, Fut>(&self, op: &str, f: F) -> Result<T, EngineError>
    where
        F: Fn(Arc<RpcClient>) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let mut last_error: Option<EngineError> = None;

        for endpoint in &self.endpoints {
            if !endpoint.available() {
                continue;
            }

            let started = Instant::now();
            match f(endpoint.client.clone()).await {
                Ok(value) => {
                    endpoint.mark_success(started.elapsed());
                    return Ok(value);
                }
                Err(e) => {
                    let classified = classify_client_error(&e);
                    match classified {
                        EngineError::TransientRpc(ref msg) => {
                            endpoint.mark_failure(msg);
                            debug!(op, url = %endpoint.url, "failing over to next endpoint");
                            last_error = Some(classified);
                        }
                        // On-chain outcomes are not the endpoint's fault.
                        other => return Err(other),
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            EngineError::TransientRpc(format!("no rpc endpoint available for {op}"))
        }))
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub async fn get_account(&self, pubkey: &Pubkey) -> Result<Account, EngineError> {
        let pk = *pubkey;
        self.with_endpoint("get_account", move |client| async move {
            client.get_account(&pk).await
        })
        .await
    }

    pub async fn get_balance(&self, pubkey: &Pubkey) -> Result<u64, EngineError> {
        let pk = *pubkey;
        self.with_endpoint("get_balance", move |client| async move {
            client.get_balance(&pk).await
        })
        .await
    }

    /// Raw amount held by an SPL token account; 0 when the account does not
    /// exist yet (no ATA created).
    pub async fn get_token_balance(&self, token_account: &Pubkey) -> Result<u64, EngineError> {
        let pk = *token_account;
        let result = self
            .with_endpoint("get_token_balance", move |client| async move {
                client.get_token_account_balance(&pk).await
            })
            .await;

        match result {
            Ok(amount) => amount
                .amount
                .parse::<u64>()
                .map_err(|e| EngineError::Internal(format!("bad token amount: {e}"))),
            // No ATA yet means a zero balance, not an error.
            Err(EngineError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    pub async fn get_program_accounts(
        &self,
        program: &Pubkey,
        config: RpcProgramAccountsConfig,
    ) -> Result<Vec<(Pubkey, Account)>, EngineError> {
        let program = *program;
        self.with_endpoint("get_program_accounts", move |client| {
            let config = config.clone();
            async move {
                client
                    .get_program_accounts_with_config(&program, config)
                    .await
            }
        })
        .await
    }

    pub async fn latest_blockhash(&self) -> Result<Hash, EngineError> {
        self.with_endpoint("latest_blockhash", move |client| async move {
            client.get_latest_blockhash().await
        })
        .await
    }

    // ── Writes ──────────────────────────────────────────────────────────

    /// Submit a signed transaction. Preflight failures classify as
    /// on-chain terminal and are surfaced unchanged.
    pub async fn submit_transaction(&self, tx: &Transaction) -> Result<Signature, EngineError> {
        self.with_endpoint("submit_transaction", move |client| async move {
            client.send_transaction(tx).await
        })
        .await
    }

    /// Submit a pre-built versioned transaction (swap-aggregator flow).
    pub async fn submit_versioned_transaction(
        &self,
        tx: &VersionedTransaction,
    ) -> Result<Signature, EngineError> {
        self.with_endpoint("submit_versioned_transaction", move |client| async move {
            client.send_transaction(tx).await
        })
        .await
    }

    /// Poll for a signature's status every second until `deadline` (falls
    /// back to the gateway default).
    pub async fn confirm_signature(
        &self,
        signature: &Signature,
        deadline: Option<Duration>,
    ) -> Result<ConfirmStatus, EngineError> {
        let deadline = deadline.unwrap_or(self.confirm_timeout);
        let started = Instant::now();
        let commitment = self.commitment;

        loop {
            let sig = *signature;
            let status = self
                .with_endpoint("confirm_signature", move |client| async move {
                    client
                        .get_signature_status_with_commitment(&sig, commitment)
                        .await
                })
                .await?;

            match status {
                Some(Ok(())) => return Ok(ConfirmStatus::Confirmed),
                Some(Err(tx_err)) => {
                    return Ok(ConfirmStatus::FailedOnChain(tx_err.to_string()));
                }
                None => {
                    if started.elapsed() >= deadline {
                        warn!(%signature, waited_secs = started.elapsed().as_secs(), "confirmation deadline elapsed");
                        return Ok(ConfirmStatus::Timeout);
                    }
                    sleep(CONFIRM_POLL).await;
                }
            }
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    pub fn endpoint_reports(&self) -> Vec<EndpointReport> {
        self.endpoints
            .iter()
            .map(|e| {
                let health = e.health.lock();
                EndpointReport {
                    url: e.url.clone(),
                    healthy: health.healthy,
                    consecutive_failures: health.consecutive_failures,
                    last_latency_ms: health.last_latency_ms,
                    last_error: health.last_error.clone(),
                }
            })
            .collect()
    }
}

/// Map a solana-client error to the runtime taxonomy.
pub fn classify_client_error(error: &ClientError) -> EngineError {
    match error.kind() {
        ClientErrorKind::Io(_) | ClientErrorKind::Reqwest(_) | ClientErrorKind::Middleware(_) => {
            EngineError::TransientRpc(error.to_string())
        }
        ClientErrorKind::TransactionError(tx_err) => {
            EngineError::OnChainTerminal(tx_err.to_string())
        }
        ClientErrorKind::SigningError(e) => EngineError::Unauthorized(e.to_string()),
        // RPC responses carry both transport noise (node behind, rate
        // limits) and simulated program failures; split on the message.
        _ => classify_remote_error(&error.to_string()),
    }
}
