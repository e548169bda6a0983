//! Payment gateway contract.
//!
//! Every call is keyed by the escrow transaction id, which the gateway uses
//! as its idempotency key.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{info, warn};

use freetun_common::{
    FreetunError, GatewayOperation, Money, PaymentMethod, Result, TransactionId,
};

use crate::escrow_engine::GatewayInstruction;

/// Confirmation of a successful capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReceipt {
    /// Provider reference for the captured funds.
    pub external_ref: String,
}

/// Gateway call failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The provider refused the operation; nothing moved.
    #[error("declined: {0}")]
    Declined(String),

    /// The provider could not be reached or answered ambiguously.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

/// Money-moving capability of a payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Capture funds from the client.
    async fn capture(
        &self,
        transaction_id: TransactionId,
        amount: &Money,
        method: PaymentMethod,
    ) -> std::result::Result<CaptureReceipt, GatewayError>;

    /// Pay escrowed funds out to the freelancer.
    async fn payout(
        &self,
        transaction_id: TransactionId,
        amount: &Money,
    ) -> std::result::Result<(), GatewayError>;

    /// Return escrowed funds to the client.
    async fn refund_funds(
        &self,
        transaction_id: TransactionId,
        amount: &Money,
    ) -> std::result::Result<(), GatewayError>;
}

/// What the coordinator learned from a gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    /// The operation happened.
    Confirmed { external_ref: Option<String> },
    /// The operation definitively did not happen.
    Declined { reason: String },
    /// No answer within the call timeout.
    TimedOut,
    /// Transport failure; the operation may or may not have happened.
    Unavailable { reason: String },
}

impl GatewayOutcome {
    /// Outcome unknown until reconciled.
    pub fn is_unconfirmed(&self) -> bool {
        matches!(
            self,
            GatewayOutcome::TimedOut | GatewayOutcome::Unavailable { .. }
        )
    }

    /// Error reported to the caller, if the operation did not succeed.
    pub fn into_result(
        self,
        transaction_id: TransactionId,
        operation: GatewayOperation,
    ) -> Result<()> {
        match self {
            GatewayOutcome::Confirmed { .. } => Ok(()),
            GatewayOutcome::Declined { reason } => Err(match operation {
                GatewayOperation::Capture => FreetunError::GatewayCaptureFailed {
                    transaction_id,
                    reason,
                },
                GatewayOperation::Payout => FreetunError::GatewayPayoutFailed {
                    transaction_id,
                    reason,
                },
                GatewayOperation::Refund => FreetunError::GatewayRefundFailed {
                    transaction_id,
                    reason,
                },
            }),
            GatewayOutcome::TimedOut => Err(FreetunError::GatewayTimeout {
                transaction_id,
                operation,
            }),
            GatewayOutcome::Unavailable { reason } => Err(FreetunError::GatewayUnavailable {
                transaction_id,
                operation,
                reason,
            }),
        }
    }
}

/// Final answer of the reconciliation sweep for an unconfirmed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconciliationOutcome {
    /// The gateway did perform the operation.
    Confirmed { external_ref: Option<String> },
    /// The gateway did not perform it.
    Declined { reason: String },
}

impl From<ReconciliationOutcome> for GatewayOutcome {
    fn from(outcome: ReconciliationOutcome) -> Self {
        match outcome {
            ReconciliationOutcome::Confirmed { external_ref } => {
                GatewayOutcome::Confirmed { external_ref }
            }
            ReconciliationOutcome::Declined { reason } => GatewayOutcome::Declined { reason },
        }
    }
}

/// Execute an instruction, bounded by `timeout`.
pub async fn execute(
    gateway: &dyn PaymentGateway,
    instruction: &GatewayInstruction,
    timeout: Duration,
) -> GatewayOutcome {
    let transaction_id = instruction.transaction_id();
    let operation = instruction.operation();

    let call = async {
        match instruction {
            GatewayInstruction::Capture {
                transaction_id,
                amount,
                method,
            } => gateway
                .capture(*transaction_id, amount, *method)
                .await
                .map(|receipt| Some(receipt.external_ref)),
            GatewayInstruction::Payout {
                transaction_id,
                amount,
            } => gateway.payout(*transaction_id, amount).await.map(|_| None),
            GatewayInstruction::Refund {
                transaction_id,
                amount,
            } => gateway
                .refund_funds(*transaction_id, amount)
                .await
                .map(|_| None),
        }
    };

    let outcome = match tokio::time::timeout(timeout, call).await {
        Ok(Ok(external_ref)) => GatewayOutcome::Confirmed { external_ref },
        Ok(Err(GatewayError::Declined(reason))) => GatewayOutcome::Declined { reason },
        Ok(Err(GatewayError::Unavailable(reason))) => GatewayOutcome::Unavailable { reason },
        Err(_) => GatewayOutcome::TimedOut,
    };

    match &outcome {
        GatewayOutcome::Confirmed { .. } => {
            info!(transaction_id = %transaction_id, operation = %operation, "Gateway confirmed");
        }
        GatewayOutcome::Declined { reason } => {
            warn!(transaction_id = %transaction_id, operation = %operation, reason = %reason, "Gateway declined");
        }
        GatewayOutcome::TimedOut => {
            warn!(
                transaction_id = %transaction_id,
                operation = %operation,
                timeout_ms = timeout.as_millis() as u64,
                "Gateway call timed out"
            );
        }
        GatewayOutcome::Unavailable { reason } => {
            warn!(transaction_id = %transaction_id, operation = %operation, reason = %reason, "Gateway unavailable");
        }
    }

    outcome
}
