//! Repository contract for the ledger store.
//!
//! Everything the escrow core persists belongs to a project aggregate: the
//! project, its proposals, its escrow transactions and their journal. An
//! aggregate is read as one versioned snapshot and written as one change set
//! that only applies if the version is unchanged.

use async_trait::async_trait;
use freetun_common::{
    Currency, EscrowTransaction, FreetunError, Project, ProjectId, Proposal, ProposalId,
    ProposalStatus, Result, TransactionId,
};
use serde::{Deserialize, Serialize};

use crate::account::LedgerAccount;
use crate::balance::AccountBalance;
use crate::journal::{JournalBatch, JournalEntry};

/// Consistent view of one project aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectSnapshot {
    /// Incremented by every committed change set.
    pub version: u64,
    pub project: Project,
    /// Proposals in submission order.
    pub proposals: Vec<Proposal>,
    /// Escrow transactions in creation order.
    pub transactions: Vec<EscrowTransaction>,
}

impl ProjectSnapshot {
    pub fn project_id(&self) -> ProjectId {
        self.project.id
    }

    pub fn proposal(&self, id: ProposalId) -> Option<&Proposal> {
        self.proposals.iter().find(|p| p.id == id)
    }

    pub fn pending_proposals(&self) -> impl Iterator<Item = &Proposal> {
        self.proposals.iter().filter(|p| p.is_pending())
    }

    pub fn accepted_proposal(&self) -> Option<&Proposal> {
        self.proposals
            .iter()
            .find(|p| p.status == ProposalStatus::Accepted)
    }

    pub fn transaction(&self, id: TransactionId) -> Option<&EscrowTransaction> {
        self.transactions.iter().find(|t| t.id == id)
    }

    /// The non-terminal escrow transaction, if any.
    pub fn active_transaction(&self) -> Option<&EscrowTransaction> {
        self.transactions.iter().find(|t| !t.is_terminal())
    }

    /// The most recently created escrow transaction.
    pub fn latest_transaction(&self) -> Option<&EscrowTransaction> {
        self.transactions.last()
    }

    /// Check the aggregate invariants every committed state must hold.
    pub fn check_invariants(&self) -> Result<()> {
        let project_id = self.project_id();
        let violation = |reason: String| FreetunError::InvariantViolation { project_id, reason };

        let accepted: Vec<&Proposal> = self
            .proposals
            .iter()
            .filter(|p| p.status == ProposalStatus::Accepted)
            .collect();
        if accepted.len() > 1 {
            return Err(violation(format!(
                "{} accepted proposals",
                accepted.len()
            )));
        }
        if !accepted.is_empty() && self.project.is_open() {
            return Err(violation("accepted proposal on an open project".into()));
        }

        let active = self.transactions.iter().filter(|t| !t.is_terminal()).count();
        if active > 1 {
            return Err(violation(format!("{} non-terminal escrow transactions", active)));
        }

        for proposal in &self.proposals {
            if proposal.project_id != project_id {
                return Err(violation(format!(
                    "proposal {} belongs to another project",
                    proposal.id
                )));
            }
            if &proposal.amount.currency != self.project.currency() {
                return Err(violation(format!(
                    "proposal {} is not in {}",
                    proposal.id,
                    self.project.currency()
                )));
            }
        }

        for tx in &self.transactions {
            if tx.project_id != project_id {
                return Err(violation(format!(
                    "transaction {} belongs to another project",
                    tx.id
                )));
            }
            let funded = self.proposal(tx.proposal_id).ok_or_else(|| {
                violation(format!("transaction {} funds an unknown proposal", tx.id))
            })?;
            if funded.status != ProposalStatus::Accepted || funded.amount != tx.amount {
                return Err(violation(format!(
                    "transaction {} does not match the accepted proposal",
                    tx.id
                )));
            }
        }

        Ok(())
    }
}

/// Writes to one project aggregate, applied atomically.
///
/// Proposals and transactions are upserts keyed by id.
#[derive(Debug, Clone)]
pub struct ProjectChanges {
    pub project_id: ProjectId,
    /// Version the changes were computed from.
    pub expected_version: u64,
    pub project: Option<Project>,
    pub proposals: Vec<Proposal>,
    pub transactions: Vec<EscrowTransaction>,
    /// Money movement confirmed by the gateway.
    pub journal: Option<JournalBatch>,
}

impl ProjectChanges {
    /// Start a change set against the given snapshot.
    pub fn against(snapshot: &ProjectSnapshot) -> Self {
        Self {
            project_id: snapshot.project_id(),
            expected_version: snapshot.version,
            project: None,
            proposals: Vec::new(),
            transactions: Vec::new(),
            journal: None,
        }
    }

    pub fn with_project(mut self, project: Project) -> Self {
        self.project = Some(project);
        self
    }

    pub fn with_proposal(mut self, proposal: Proposal) -> Self {
        self.proposals.push(proposal);
        self
    }

    pub fn with_proposals(mut self, proposals: impl IntoIterator<Item = Proposal>) -> Self {
        self.proposals.extend(proposals);
        self
    }

    pub fn with_transaction(mut self, transaction: EscrowTransaction) -> Self {
        self.transactions.push(transaction);
        self
    }

    pub fn with_journal(mut self, journal: JournalBatch) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.project.is_none()
            && self.proposals.is_empty()
            && self.transactions.is_empty()
            && self.journal.is_none()
    }
}

/// Transactional store the escrow core persists through.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Persist a newly posted project at version 1.
    async fn create_project(&self, project: Project) -> Result<ProjectSnapshot>;

    /// Read a consistent snapshot of a project aggregate.
    async fn load_project(&self, project_id: ProjectId) -> Result<ProjectSnapshot>;

    /// Apply a change set if the aggregate is still at `expected_version`.
    ///
    /// Fails with `PersistenceConflict` on a version mismatch and with
    /// `InvariantViolation` if the result would break an aggregate invariant
    /// or the journal batch is unbalanced. Nothing is written on failure.
    async fn commit(&self, changes: ProjectChanges) -> Result<ProjectSnapshot>;

    async fn proposal(&self, proposal_id: ProposalId) -> Result<Proposal>;

    async fn transaction(&self, transaction_id: TransactionId) -> Result<EscrowTransaction>;

    /// Transactions with a gateway call of unknown outcome.
    async fn transactions_awaiting_reconciliation(&self) -> Result<Vec<EscrowTransaction>>;

    /// Current balance of an account in one currency, `None` if nothing was
    /// ever journaled there.
    async fn account_balance(
        &self,
        account: &LedgerAccount,
        currency: &Currency,
    ) -> Result<Option<AccountBalance>>;

    async fn journal_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<JournalEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use freetun_common::{ActorId, Currency, Money, PaymentMethod, ProjectStatus};

    fn snapshot() -> ProjectSnapshot {
        let project =
            Project::new(ActorId::new(), "Mobile app", Money::new(1_000_000, Currency::tnd()))
                .unwrap();
        ProjectSnapshot {
            version: 1,
            project,
            proposals: Vec::new(),
            transactions: Vec::new(),
        }
    }

    fn bid(snapshot: &ProjectSnapshot, minor: i64) -> Proposal {
        Proposal::new(
            snapshot.project_id(),
            ActorId::new(),
            Money::new(minor, Currency::tnd()),
        )
        .unwrap()
    }

    #[test]
    fn test_two_accepted_proposals_violate_invariants() {
        let mut snap = snapshot();
        let now = Utc::now();
        snap.project.transition_to(ProjectStatus::InProgress, now).unwrap();
        let mut a = bid(&snap, 700_000);
        let mut b = bid(&snap, 650_000);
        a.accept(now).unwrap();
        b.accept(now).unwrap();
        snap.proposals = vec![a, b];

        let err = snap.check_invariants().unwrap_err();
        assert_eq!(err.error_code(), "INVARIANT_VIOLATION");
    }

    #[test]
    fn test_accepted_proposal_requires_project_in_progress() {
        let mut snap = snapshot();
        let mut a = bid(&snap, 700_000);
        a.accept(Utc::now()).unwrap();
        snap.proposals = vec![a];

        assert!(snap.check_invariants().is_err());
    }

    #[test]
    fn test_escrow_amount_must_match_accepted_proposal() {
        let mut snap = snapshot();
        let now = Utc::now();
        snap.project.transition_to(ProjectStatus::InProgress, now).unwrap();
        let mut accepted = bid(&snap, 700_000);
        accepted.accept(now).unwrap();
        let mut tx = EscrowTransaction::new_pending(
            &accepted,
            snap.project.client_id,
            PaymentMethod::Flouci,
            now,
        );
        snap.proposals = vec![accepted];
        tx.amount = Money::new(699_999, Currency::tnd());
        snap.transactions = vec![tx];

        assert!(snap.check_invariants().is_err());
    }

    #[test]
    fn test_empty_changes() {
        let snap = snapshot();
        let changes = ProjectChanges::against(&snap);
        assert!(changes.is_empty());
        assert_eq!(changes.expected_version, 1);
        assert!(!changes.with_project(snap.project.clone()).is_empty());
    }
}
