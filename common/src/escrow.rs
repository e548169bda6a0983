//! Escrow transactions and their state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ActorId, InvalidTransition, Money, ProjectId, Proposal, ProposalId, TransactionId};

/// Escrow transaction status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    /// Record exists, funds not captured.
    Pending,
    /// Funds captured and held.
    Escrowed,
    /// Paid out to the freelancer.
    Released,
    /// Returned to the client.
    Refunded,
    /// Capture declined by the gateway; no funds were ever held.
    Failed,
}

impl EscrowStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EscrowStatus::Released | EscrowStatus::Refunded | EscrowStatus::Failed
        )
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[EscrowStatus] {
        match self {
            EscrowStatus::Pending => &[EscrowStatus::Escrowed, EscrowStatus::Failed],
            EscrowStatus::Escrowed => &[EscrowStatus::Released, EscrowStatus::Refunded],
            EscrowStatus::Released => &[],
            EscrowStatus::Refunded => &[],
            EscrowStatus::Failed => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: EscrowStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Escrowed => "escrowed",
            EscrowStatus::Released => "released",
            EscrowStatus::Refunded => "refunded",
            EscrowStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Payment rails supported by the marketplace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    D17,
    Flouci,
    BankTransfer,
    Edinar,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PaymentMethod::D17 => "d17",
            PaymentMethod::Flouci => "flouci",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Edinar => "edinar",
        };
        f.write_str(name)
    }
}

/// A money-moving call made to the payment gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOperation {
    Capture,
    Payout,
    Refund,
}

impl fmt::Display for GatewayOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GatewayOperation::Capture => "capture",
            GatewayOperation::Payout => "payout",
            GatewayOperation::Refund => "refund",
        };
        f.write_str(name)
    }
}

/// Side of the escrow an actor stands on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowParty {
    Payer,
    Payee,
}

/// What both parties may agree to ahead of the normal flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentKind {
    /// Release before delivery is marked.
    EarlyRelease,
    /// Return the funds to the client.
    Refund,
}

/// Consent flags recorded per party.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Consents {
    pub release_by_payer: bool,
    pub release_by_payee: bool,
    pub refund_by_payer: bool,
    pub refund_by_payee: bool,
}

impl Consents {
    pub fn record(&mut self, kind: ConsentKind, party: EscrowParty) {
        let flag = match (kind, party) {
            (ConsentKind::EarlyRelease, EscrowParty::Payer) => &mut self.release_by_payer,
            (ConsentKind::EarlyRelease, EscrowParty::Payee) => &mut self.release_by_payee,
            (ConsentKind::Refund, EscrowParty::Payer) => &mut self.refund_by_payer,
            (ConsentKind::Refund, EscrowParty::Payee) => &mut self.refund_by_payee,
        };
        *flag = true;
    }

    /// Both payer and payee agreed.
    pub fn is_mutual(&self, kind: ConsentKind) -> bool {
        match kind {
            ConsentKind::EarlyRelease => self.release_by_payer && self.release_by_payee,
            ConsentKind::Refund => self.refund_by_payer && self.refund_by_payee,
        }
    }
}

/// Funds held for a project between its client and the accepted freelancer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowTransaction {
    pub id: TransactionId,
    pub project_id: ProjectId,
    /// Accepted proposal this escrow funds.
    pub proposal_id: ProposalId,
    pub payer_id: ActorId,
    pub payee_id: ActorId,
    pub amount: Money,
    pub method: PaymentMethod,
    pub status: EscrowStatus,
    pub disputed: bool,
    /// When the freelancer signalled delivery.
    pub delivered_at: Option<DateTime<Utc>>,
    pub consents: Consents,
    /// Gateway reference returned by a confirmed capture.
    pub external_ref: Option<String>,
    /// Gateway call whose outcome is not yet known.
    pub awaiting_reconciliation: Option<GatewayOperation>,
    /// Why the capture failed, for `Failed` transactions.
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowTransaction {
    /// Create a pending transaction funding the given accepted proposal.
    pub fn new_pending(
        proposal: &Proposal,
        payer_id: ActorId,
        method: PaymentMethod,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            project_id: proposal.project_id,
            proposal_id: proposal.id,
            payer_id,
            payee_id: proposal.freelancer_id,
            amount: proposal.amount.clone(),
            method,
            status: EscrowStatus::Pending,
            disputed: false,
            delivered_at: None,
            consents: Consents::default(),
            external_ref: None,
            awaiting_reconciliation: None,
            failure_reason: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn is_escrowed(&self) -> bool {
        self.status == EscrowStatus::Escrowed
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Which side of the escrow an actor is on, if any.
    pub fn party_of(&self, actor: &ActorId) -> Option<EscrowParty> {
        if *actor == self.payer_id {
            Some(EscrowParty::Payer)
        } else if *actor == self.payee_id {
            Some(EscrowParty::Payee)
        } else {
            None
        }
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        next: EscrowStatus,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition::new("escrow", self.status, next));
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    /// Record a confirmed capture.
    pub fn mark_escrowed(
        &mut self,
        external_ref: String,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition_to(EscrowStatus::Escrowed, at)?;
        self.external_ref = Some(external_ref);
        self.awaiting_reconciliation = None;
        Ok(())
    }

    /// Record a declined capture.
    pub fn mark_failed(
        &mut self,
        reason: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Result<(), InvalidTransition> {
        self.transition_to(EscrowStatus::Failed, at)?;
        self.failure_reason = Some(reason.into());
        self.awaiting_reconciliation = None;
        Ok(())
    }

    /// Record a confirmed payout.
    pub fn mark_released(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition_to(EscrowStatus::Released, at)?;
        self.settle_flags();
        Ok(())
    }

    /// Record a confirmed refund.
    pub fn mark_refunded(&mut self, at: DateTime<Utc>) -> Result<(), InvalidTransition> {
        self.transition_to(EscrowStatus::Refunded, at)?;
        self.settle_flags();
        Ok(())
    }

    /// Flag a gateway call whose outcome could not be confirmed.
    pub fn await_reconciliation(&mut self, operation: GatewayOperation, at: DateTime<Utc>) {
        self.awaiting_reconciliation = Some(operation);
        self.updated_at = at;
    }

    /// Drop the reconciliation marker after the gateway confirmed that the
    /// call had no effect.
    pub fn clear_reconciliation(&mut self, at: DateTime<Utc>) {
        self.awaiting_reconciliation = None;
        self.updated_at = at;
    }

    fn settle_flags(&mut self) {
        self.awaiting_reconciliation = None;
        self.disputed = false;
    }
}
