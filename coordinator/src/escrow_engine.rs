//! Escrow state machine.
//!
//! Every function here is pure: it takes the stored records and returns the
//! records to write, plus the gateway instruction the coordinator must carry
//! out before anything money-related is committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use freetun_common::{
    ConsentKind, EscrowParty, EscrowStatus, EscrowTransaction, FreetunError, GatewayOperation,
    InvalidTransition, Money, PaymentMethod, Project, ProjectStatus, Result, TransactionId,
};
use freetun_ledger::{JournalBatch, ProjectChanges, ProjectSnapshot};

use crate::gateway::GatewayOutcome;

/// A gateway call the coordinator must execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayInstruction {
    Capture {
        transaction_id: TransactionId,
        amount: Money,
        method: PaymentMethod,
    },
    Payout {
        transaction_id: TransactionId,
        amount: Money,
    },
    Refund {
        transaction_id: TransactionId,
        amount: Money,
    },
}

impl GatewayInstruction {
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            GatewayInstruction::Capture { transaction_id, .. }
            | GatewayInstruction::Payout { transaction_id, .. }
            | GatewayInstruction::Refund { transaction_id, .. } => *transaction_id,
        }
    }

    pub fn operation(&self) -> GatewayOperation {
        match self {
            GatewayInstruction::Capture { .. } => GatewayOperation::Capture,
            GatewayInstruction::Payout { .. } => GatewayOperation::Payout,
            GatewayInstruction::Refund { .. } => GatewayOperation::Refund,
        }
    }

    pub fn amount(&self) -> &Money {
        match self {
            GatewayInstruction::Capture { amount, .. }
            | GatewayInstruction::Payout { amount, .. }
            | GatewayInstruction::Refund { amount, .. } => amount,
        }
    }
}

/// Admin decision closing a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeResolution {
    /// Pay the freelancer in full.
    Release,
    /// Return the funds to the client in full.
    Refund,
}

/// Who is moving the escrowed funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authority {
    /// One of the escrow parties, subject to delivery, consent and disputes.
    Party,
    /// Admin dispute resolution.
    AdminOverride,
}

/// Next step of a release or refund.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowStep {
    /// Already settled this way; nothing to do.
    Settled(EscrowTransaction),
    /// Call the gateway.
    Call(GatewayInstruction),
}

/// The live escrow of a project, or its most recent one once settled.
pub fn current_transaction(snapshot: &ProjectSnapshot) -> Result<&EscrowTransaction> {
    snapshot
        .active_transaction()
        .or_else(|| snapshot.latest_transaction())
        .ok_or(FreetunError::NoActiveEscrow(snapshot.project_id()))
}

/// Plan funding of the accepted proposal: a pending transaction and its capture.
pub fn plan_fund(
    snapshot: &ProjectSnapshot,
    method: PaymentMethod,
    at: DateTime<Utc>,
) -> Result<(EscrowTransaction, GatewayInstruction)> {
    let project = &snapshot.project;
    if project.status != ProjectStatus::InProgress {
        return Err(InvalidTransition::new("project", project.status, "funded").into());
    }
    if let Some(active) = snapshot.active_transaction() {
        return Err(FreetunError::EscrowAlreadyActive {
            project_id: project.id,
            transaction_id: active.id,
        });
    }
    let accepted = snapshot
        .accepted_proposal()
        .ok_or(FreetunError::NoActiveEscrow(project.id))?;

    let tx = EscrowTransaction::new_pending(accepted, project.client_id, method, at);
    let instruction = GatewayInstruction::Capture {
        transaction_id: tx.id,
        amount: tx.amount.clone(),
        method,
    };
    Ok((tx, instruction))
}

fn require_escrowed(tx: &EscrowTransaction) -> Result<()> {
    if tx.is_escrowed() {
        Ok(())
    } else {
        Err(FreetunError::EscrowNotEscrowed {
            transaction_id: tx.id,
            status: tx.status,
        })
    }
}

/// Record delivery. `None` if it was already recorded.
pub fn mark_delivered(
    tx: &EscrowTransaction,
    at: DateTime<Utc>,
) -> Result<Option<EscrowTransaction>> {
    require_escrowed(tx)?;
    if tx.delivered_at.is_some() {
        return Ok(None);
    }
    let mut next = tx.clone();
    next.delivered_at = Some(at);
    next.updated_at = at;
    Ok(Some(next))
}

/// Record one party's consent. `None` if it was already recorded.
pub fn record_consent(
    tx: &EscrowTransaction,
    party: EscrowParty,
    kind: ConsentKind,
    at: DateTime<Utc>,
) -> Result<Option<EscrowTransaction>> {
    require_escrowed(tx)?;
    let mut consents = tx.consents;
    consents.record(kind, party);
    if consents == tx.consents {
        return Ok(None);
    }
    let mut next = tx.clone();
    next.consents = consents;
    next.updated_at = at;
    Ok(Some(next))
}

/// Flag a dispute. `None` if one is already open.
pub fn raise_dispute(
    tx: &EscrowTransaction,
    at: DateTime<Utc>,
) -> Result<Option<EscrowTransaction>> {
    require_escrowed(tx)?;
    if tx.disputed {
        return Ok(None);
    }
    let mut next = tx.clone();
    next.disputed = true;
    next.updated_at = at;
    Ok(Some(next))
}

fn settled_or_ready(tx: &EscrowTransaction, settled: EscrowStatus) -> Result<Option<EscrowStep>> {
    if tx.status == settled {
        return Ok(Some(EscrowStep::Settled(tx.clone())));
    }
    if let Some(operation) = tx.awaiting_reconciliation {
        return Err(FreetunError::ReconciliationPending {
            transaction_id: tx.id,
            operation,
        });
    }
    require_escrowed(tx)?;
    Ok(None)
}

/// Plan a payout to the freelancer.
pub fn plan_release(
    tx: &EscrowTransaction,
    authority: Authority,
    allow_early_release: bool,
) -> Result<EscrowStep> {
    if let Some(step) = settled_or_ready(tx, EscrowStatus::Released)? {
        return Ok(step);
    }

    if authority == Authority::Party {
        if tx.disputed {
            return Err(FreetunError::DisputeOpen(tx.project_id));
        }
        let early = allow_early_release && tx.consents.is_mutual(ConsentKind::EarlyRelease);
        if tx.delivered_at.is_none() && !early {
            return Err(FreetunError::DeliveryNotMarked(tx.project_id));
        }
    }

    Ok(EscrowStep::Call(GatewayInstruction::Payout {
        transaction_id: tx.id,
        amount: tx.amount.clone(),
    }))
}

/// Plan a refund to the client.
pub fn plan_refund(tx: &EscrowTransaction, authority: Authority) -> Result<EscrowStep> {
    if let Some(step) = settled_or_ready(tx, EscrowStatus::Refunded)? {
        return Ok(step);
    }

    if authority == Authority::Party {
        if tx.disputed {
            return Err(FreetunError::DisputeOpen(tx.project_id));
        }
        if !tx.consents.is_mutual(ConsentKind::Refund) {
            return Err(FreetunError::RefundConsentMissing(tx.project_id));
        }
    }

    Ok(EscrowStep::Call(GatewayInstruction::Refund {
        transaction_id: tx.id,
        amount: tx.amount.clone(),
    }))
}

/// Plan the admin resolution of a dispute.
pub fn plan_resolution(tx: &EscrowTransaction, resolution: DisputeResolution) -> Result<EscrowStep> {
    let settled = match resolution {
        DisputeResolution::Release => EscrowStatus::Released,
        DisputeResolution::Refund => EscrowStatus::Refunded,
    };
    if tx.status == settled {
        return Ok(EscrowStep::Settled(tx.clone()));
    }
    if !tx.disputed {
        return Err(FreetunError::NoDisputeOpen(tx.project_id));
    }

    match resolution {
        DisputeResolution::Release => plan_release(tx, Authority::AdminOverride, true),
        DisputeResolution::Refund => plan_refund(tx, Authority::AdminOverride),
    }
}

/// Records to write once the outcome of a gateway call is known.
#[derive(Debug, Clone)]
pub struct Settlement {
    pub transaction: EscrowTransaction,
    /// Project status change caused by the settlement.
    pub project: Option<Project>,
    /// Money movement to journal, for confirmed calls.
    pub journal: Option<JournalBatch>,
}

impl Settlement {
    /// Change set writing this settlement against `snapshot`.
    pub fn into_changes(self, snapshot: &ProjectSnapshot) -> ProjectChanges {
        let mut changes = ProjectChanges::against(snapshot);
        if snapshot.transaction(self.transaction.id) != Some(&self.transaction) {
            changes = changes.with_transaction(self.transaction);
        }
        if let Some(project) = self.project {
            changes = changes.with_project(project);
        }
        if let Some(journal) = self.journal {
            changes = changes.with_journal(journal);
        }
        changes
    }
}

/// Apply a gateway outcome to the stored transaction.
///
/// Confirmed calls advance the state machine and are journaled; declined
/// captures fail the transaction; declined payouts and refunds leave the
/// funds escrowed; unconfirmed calls only set the reconciliation marker.
pub fn apply_outcome(
    snapshot: &ProjectSnapshot,
    transaction_id: TransactionId,
    operation: GatewayOperation,
    outcome: &GatewayOutcome,
    at: DateTime<Utc>,
) -> Result<Settlement> {
    let mut tx = snapshot
        .transaction(transaction_id)
        .cloned()
        .ok_or(FreetunError::TransactionNotFound(transaction_id))?;
    let mut project = None;
    let mut journal = None;

    match outcome {
        GatewayOutcome::Confirmed { external_ref } => {
            let next_project = match operation {
                GatewayOperation::Capture => {
                    let external_ref = external_ref.clone().unwrap_or_else(|| tx.id.to_string());
                    tx.mark_escrowed(external_ref, at)?;
                    None
                }
                GatewayOperation::Payout => {
                    tx.mark_released(at)?;
                    Some(ProjectStatus::Completed)
                }
                GatewayOperation::Refund => {
                    tx.mark_refunded(at)?;
                    Some(ProjectStatus::Cancelled)
                }
            };
            if let Some(status) = next_project {
                let mut updated = snapshot.project.clone();
                updated.transition_to(status, at)?;
                project = Some(updated);
            }
            journal = Some(JournalBatch::for_operation(&tx, operation, at));
        }
        GatewayOutcome::Declined { reason } => match operation {
            GatewayOperation::Capture => tx.mark_failed(reason.clone(), at)?,
            GatewayOperation::Payout | GatewayOperation::Refund => {
                if tx.awaiting_reconciliation.is_some() {
                    tx.clear_reconciliation(at);
                }
            }
        },
        GatewayOutcome::TimedOut | GatewayOutcome::Unavailable { .. } => {
            tx.await_reconciliation(operation, at);
        }
    }

    Ok(Settlement {
        transaction: tx,
        project,
        journal,
    })
}
