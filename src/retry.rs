// =============================================================================
// Retry Coordinator — bounded, classified, per-instance serialized retries
// =============================================================================
//
// Every partially-failure-prone chain action funnels through here. The
// coordinator:
//
//   - looks up the operation type's retryable error-kind set and delay
//     profile (transient class: 2 s with x2 backoff; cleanup class: fixed
//     30 s),
//   - short-circuits non-retryable errors immediately,
//   - runs an optional validator after each attempt — a validator failure
//     counts as a failed attempt,
//   - serializes concurrent invocations of the same (instance, operation)
//     pair so no two attempts of one logical operation ever overlap,
//   - observes cancellation between attempts and inside delay waits.
// =============================================================================

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::{EngineError, ErrorKind};

// ---------------------------------------------------------------------------
// Operation types
// ---------------------------------------------------------------------------

/// The retry-relevant operation types of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    PositionCreate,
    PositionClose,
    PositionCleanup,
    StopLoss,
    StopLossTokenSwap,
    OutOfRangeHandler,
    FeeHarvest,
}

impl OpKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PositionCreate => "position.create",
            Self::PositionClose => "position.close",
            Self::PositionCleanup => "position.cleanup",
            Self::StopLoss => "stop.loss",
            Self::StopLossTokenSwap => "stop.loss.token.swap",
            Self::OutOfRangeHandler => "outOfRange.handler",
            Self::FeeHarvest => "fees.harvest",
        }
    }

    /// Retryable error-kind set per operation. Note the `position.close`
    /// entry: a "position does not exist" race after a confirmation timeout
    /// classifies as NotFound and is retried so the cleanup path can settle
    /// it.
    fn is_retryable(&self, kind: ErrorKind) -> bool {
        match self {
            Self::PositionCreate => matches!(
                kind,
                ErrorKind::TransientRpc | ErrorKind::SlippageTransient
            ),
            Self::PositionClose => {
                matches!(kind, ErrorKind::TransientRpc | ErrorKind::NotFound)
            }
            Self::PositionCleanup => matches!(
                kind,
                ErrorKind::TransientRpc | ErrorKind::SlippageTransient | ErrorKind::NotFound
            ),
            Self::StopLoss => matches!(
                kind,
                ErrorKind::TransientRpc | ErrorKind::SlippageTransient
            ),
            Self::StopLossTokenSwap => matches!(
                kind,
                ErrorKind::TransientRpc | ErrorKind::SlippageTransient
            ),
            Self::OutOfRangeHandler => matches!(
                kind,
                ErrorKind::TransientRpc | ErrorKind::SlippageTransient
            ),
            Self::FeeHarvest => matches!(kind, ErrorKind::TransientRpc),
        }
    }

    fn default_profile(&self) -> RetryProfile {
        match self {
            // Cleanup-class: slow fixed cadence, the position is already
            // being torn down and urgency lost to correctness.
            Self::PositionCleanup | Self::StopLoss => RetryProfile {
                max_attempts: 3,
                base_delay: Duration::from_secs(30),
                backoff_factor: 1.0,
            },
            // Transient-class: fast with exponential backoff.
            _ => RetryProfile {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                backoff_factor: 2.0,
            },
        }
    }
}

/// Delay/attempt profile; callers may override per invocation.
#[derive(Debug, Clone, Copy)]
pub struct RetryProfile {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff_factor: f64,
}

impl RetryProfile {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.powi(attempt.saturating_sub(1) as i32);
        self.base_delay.mul_f64(factor)
    }
}

// ---------------------------------------------------------------------------
// Cancellation-aware delay
// ---------------------------------------------------------------------------

/// Sleep for `duration`, aborting early with `Cancelled` when the cancel
/// signal flips to true. A dropped sender means nobody can cancel any more;
/// the delay then completes normally.
pub async fn wait_or_cancel(
    duration: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<(), EngineError> {
    if *cancel.borrow() {
        return Err(EngineError::Cancelled);
    }

    let sleep = tokio::time::sleep(duration);
    tokio::pin!(sleep);

    loop {
        tokio::select! {
            _ = &mut sleep => return Ok(()),
            changed = cancel.changed() => match changed {
                Ok(()) if *cancel.borrow() => return Err(EngineError::Cancelled),
                Ok(()) => continue,
                Err(_) => {
                    sleep.as_mut().await;
                    return Ok(());
                }
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

type OpLocks = HashMap<(String, OpKind), Arc<tokio::sync::Mutex<()>>>;

/// Process-wide retry coordinator. Cheap to clone.
#[derive(Clone, Default)]
pub struct RetryCoordinator {
    locks: Arc<Mutex<OpLocks>>,
}

impl RetryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, instance_id: &str, op: OpKind) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry((instance_id.to_string(), op))
            .or_default()
            .clone()
    }

    /// Drop the serialization locks of a deleted instance.
    pub fn forget_instance(&self, instance_id: &str) {
        self.locks.lock().retain(|(id, _), _| id != instance_id);
    }

    /// Run `operation` under the operation type's retry policy.
    ///
    /// The closure receives the 1-based attempt number (a fresh quote per
    /// attempt hangs off this).
    pub async fn execute<T, F, Fut>(
        &self,
        instance_id: &str,
        op: OpKind,
        cancel: &watch::Receiver<bool>,
        operation: F,
    ) -> Result<T, EngineError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        self.execute_validated(instance_id, op, None, cancel, operation, |_: &T| Ok(()))
            .await
    }

    /// As [`execute`], with a per-call profile override and a validator that
    /// must also pass for an attempt to count as success.
    pub async fn execute_validated<T, F, Fut, V>(
        &self,
        instance_id: &str,
        op: OpKind,
        profile_override: Option<RetryProfile>,
        cancel: &watch::Receiver<bool>,
        operation: F,
        validator: V,
    ) -> Result<T, EngineError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
        V: Fn(&T) -> Result<(), EngineError>,
    {
        let profile = profile_override.unwrap_or_else(|| op.default_profile());
        let mut cancel = cancel.clone();

        // No two attempts of the same logical operation run in parallel for
        // one instance.
        let guard = self.lock_for(instance_id, op);
        let _serialized = guard.lock().await;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if *cancel.borrow() {
                return Err(EngineError::Cancelled);
            }

            let result = match operation(attempt).await {
                Ok(value) => match validator(&value) {
                    Ok(()) => Ok(value),
                    Err(e) => Err(e),
                },
                Err(e) => Err(e),
            };

            match result {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            instance = instance_id,
                            op = op.label(),
                            attempt,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) if !op.is_retryable(e.kind()) => {
                    error!(
                        instance = instance_id,
                        op = op.label(),
                        kind = %e.kind(),
                        error = %e,
                        "non-retryable failure"
                    );
                    return Err(e);
                }
                Err(e) => {
                    if attempt >= profile.max_attempts {
                        error!(
                            instance = instance_id,
                            op = op.label(),
                            attempts = attempt,
                            error = %e,
                            "retries exhausted"
                        );
                        return Err(e);
                    }

                    let delay = profile.delay_for_attempt(attempt);
                    warn!(
                        instance = instance_id,
                        op = op.label(),
                        attempt,
                        max_attempts = profile.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "attempt failed — retrying"
                    );
                    wait_or_cancel(delay, &mut cancel).await?;
                }
            }
        }
    }
}
