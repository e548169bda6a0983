//! In-memory ledger engine.
//!
//! Each project aggregate sits behind its own `RwLock`; readers clone a
//! snapshot under the read lock and a commit validates and applies a whole
//! change set under the write lock, so a half-applied change set is never
//! observable.
//!
//! Client and freelancer balances are shared between projects. They are
//! staged and written under one ledger-wide balance lock, always taken after
//! the project lock.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use freetun_common::{
    Currency, EscrowTransaction, FreetunError, Project, ProjectId, Proposal, ProposalId, Result,
    TransactionId,
};

use crate::account::LedgerAccount;
use crate::balance::AccountBalance;
use crate::journal::{JournalBatch, JournalEntry};
use crate::store::{LedgerStore, ProjectChanges, ProjectSnapshot};

struct ProjectRecord {
    snapshot: ProjectSnapshot,
    journal: Vec<JournalEntry>,
}

/// The in-memory implementation of [`LedgerStore`].
pub struct LedgerEngine {
    projects: DashMap<ProjectId, Arc<RwLock<ProjectRecord>>>,
    proposal_index: DashMap<ProposalId, ProjectId>,
    transaction_index: DashMap<TransactionId, ProjectId>,
    /// Balances per account and currency.
    balances: DashMap<(LedgerAccount, Currency), AccountBalance>,
    /// Serializes read-modify-write of balances across projects.
    balance_lock: Mutex<()>,
}

impl LedgerEngine {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            projects: DashMap::new(),
            proposal_index: DashMap::new(),
            transaction_index: DashMap::new(),
            balances: DashMap::new(),
            balance_lock: Mutex::new(()),
        }
    }

    /// Number of stored projects.
    pub fn project_count(&self) -> usize {
        self.projects.len()
    }

    fn record(&self, project_id: ProjectId) -> Result<Arc<RwLock<ProjectRecord>>> {
        // Clone the Arc so no map shard stays locked while the record is used.
        self.projects
            .get(&project_id)
            .map(|r| r.value().clone())
            .ok_or(FreetunError::ProjectNotFound(project_id))
    }

    /// Merge a change set into a copy of the current snapshot.
    fn merge(current: &ProjectSnapshot, changes: &ProjectChanges) -> Result<ProjectSnapshot> {
        let project_id = current.project_id();
        let violation = |reason: String| FreetunError::InvariantViolation { project_id, reason };
        let mut next = current.clone();

        if let Some(project) = &changes.project {
            if project.id != project_id {
                return Err(violation(format!("project {} written to wrong aggregate", project.id)));
            }
            let old = &current.project;
            if project.status != old.status && !old.status.can_transition_to(project.status) {
                return Err(violation(format!(
                    "project status {} cannot become {}",
                    old.status, project.status
                )));
            }
            if old.status.is_terminal() && project != old {
                return Err(violation("terminal project is immutable".into()));
            }
            next.project = project.clone();
        }

        for proposal in &changes.proposals {
            match next.proposals.iter_mut().find(|p| p.id == proposal.id) {
                Some(existing) => {
                    if existing.status.is_terminal() && existing != proposal {
                        return Err(violation(format!(
                            "proposal {} is terminal",
                            proposal.id
                        )));
                    }
                    if existing.status != proposal.status
                        && !existing.status.can_transition_to(proposal.status)
                    {
                        return Err(violation(format!(
                            "proposal {} cannot go from {} to {}",
                            proposal.id, existing.status, proposal.status
                        )));
                    }
                    *existing = proposal.clone();
                }
                None => next.proposals.push(proposal.clone()),
            }
        }

        for tx in &changes.transactions {
            match next.transactions.iter_mut().find(|t| t.id == tx.id) {
                Some(existing) => {
                    if existing.is_terminal() && existing != tx {
                        return Err(violation(format!("transaction {} is terminal", tx.id)));
                    }
                    if existing.status != tx.status && !existing.status.can_transition_to(tx.status)
                    {
                        return Err(violation(format!(
                            "transaction {} cannot go from {} to {}",
                            tx.id, existing.status, tx.status
                        )));
                    }
                    *existing = tx.clone();
                }
                None => next.transactions.push(tx.clone()),
            }
        }

        next.check_invariants()?;
        next.version = current.version + 1;
        Ok(next)
    }

    fn check_journal(snapshot: &ProjectSnapshot, batch: &JournalBatch) -> Result<()> {
        let project_id = snapshot.project_id();
        let violation = |reason: String| FreetunError::InvariantViolation { project_id, reason };

        if batch.is_empty() || !batch.is_balanced() {
            return Err(violation(format!(
                "unbalanced journal for transaction {}",
                batch.transaction_id
            )));
        }
        if snapshot.transaction(batch.transaction_id).is_none() {
            return Err(violation(format!(
                "journal for unknown transaction {}",
                batch.transaction_id
            )));
        }
        let foreign_escrow = batch
            .entries
            .iter()
            .filter_map(|e| e.account.project())
            .any(|id| id != project_id);
        if foreign_escrow {
            return Err(violation("journal touches another project's escrow".into()));
        }
        Ok(())
    }

    /// Compute the balances a batch produces, before anything is written.
    ///
    /// Must be called with `balance_lock` held until the result is written.
    fn staged_balances(
        &self,
        batch: &JournalBatch,
    ) -> Result<HashMap<(LedgerAccount, Currency), AccountBalance>> {
        let mut staged: HashMap<(LedgerAccount, Currency), AccountBalance> = HashMap::new();
        for entry in &batch.entries {
            let key = (entry.account, entry.amount.currency.clone());
            let current = match staged.get(&key) {
                Some(balance) => balance.clone(),
                None => self
                    .balances
                    .get(&key)
                    .map(|b| b.value().clone())
                    .unwrap_or_else(|| {
                        AccountBalance::zero(entry.account, entry.amount.currency.clone())
                    }),
            };
            staged.insert(key, current.applied(entry)?);
        }
        Ok(staged)
    }
}

impl Default for LedgerEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerStore for LedgerEngine {
    #[instrument(skip(self, project), fields(project_id = %project.id))]
    async fn create_project(&self, project: Project) -> Result<ProjectSnapshot> {
        let project_id = project.id;
        let snapshot = ProjectSnapshot {
            version: 1,
            project,
            proposals: Vec::new(),
            transactions: Vec::new(),
        };

        match self.projects.entry(project_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(FreetunError::InvariantViolation {
                    project_id,
                    reason: "project already exists".into(),
                });
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::new(RwLock::new(ProjectRecord {
                    snapshot: snapshot.clone(),
                    journal: Vec::new(),
                })));
            }
        }

        info!(project_id = %project_id, "Project stored");
        Ok(snapshot)
    }

    async fn load_project(&self, project_id: ProjectId) -> Result<ProjectSnapshot> {
        let record = self.record(project_id)?;
        let snapshot = record.read().snapshot.clone();
        Ok(snapshot)
    }

    #[instrument(skip(self, changes), fields(project_id = %changes.project_id, expected_version = changes.expected_version))]
    async fn commit(&self, changes: ProjectChanges) -> Result<ProjectSnapshot> {
        let record = self.record(changes.project_id)?;
        let mut record = record.write();

        let actual = record.snapshot.version;
        if actual != changes.expected_version {
            warn!(
                project_id = %changes.project_id,
                expected = changes.expected_version,
                actual,
                "Version conflict"
            );
            return Err(FreetunError::PersistenceConflict {
                project_id: changes.project_id,
                expected: changes.expected_version,
                actual,
            });
        }

        let next = Self::merge(&record.snapshot, &changes)?;

        let balance_guard = changes.journal.as_ref().map(|_| self.balance_lock.lock());
        let staged = match &changes.journal {
            Some(batch) => {
                Self::check_journal(&next, batch)?;
                Some((batch, self.staged_balances(batch)?))
            }
            None => None,
        };

        // Validation done; nothing below can fail.
        for proposal in &changes.proposals {
            self.proposal_index.insert(proposal.id, changes.project_id);
        }
        for tx in &changes.transactions {
            self.transaction_index.insert(tx.id, changes.project_id);
        }
        if let Some((batch, balances)) = staged {
            record.journal.extend(batch.entries.iter().cloned());
            for (key, balance) in balances {
                self.balances.insert(key, balance);
            }
            debug!(
                transaction_id = %batch.transaction_id,
                operation = %batch.operation,
                entries = batch.entries.len(),
                "Journal batch recorded"
            );
        }
        drop(balance_guard);
        record.snapshot = next.clone();

        debug!(project_id = %changes.project_id, version = next.version, "Changes committed");
        Ok(next)
    }

    async fn proposal(&self, proposal_id: ProposalId) -> Result<Proposal> {
        let project_id = self
            .proposal_index
            .get(&proposal_id)
            .map(|p| *p.value())
            .ok_or(FreetunError::ProposalNotFound(proposal_id))?;
        let record = self.record(project_id)?;
        let record = record.read();
        record
            .snapshot
            .proposal(proposal_id)
            .cloned()
            .ok_or(FreetunError::ProposalNotFound(proposal_id))
    }

    async fn transaction(&self, transaction_id: TransactionId) -> Result<EscrowTransaction> {
        let project_id = self
            .transaction_index
            .get(&transaction_id)
            .map(|p| *p.value())
            .ok_or(FreetunError::TransactionNotFound(transaction_id))?;
        let record = self.record(project_id)?;
        let record = record.read();
        record
            .snapshot
            .transaction(transaction_id)
            .cloned()
            .ok_or(FreetunError::TransactionNotFound(transaction_id))
    }

    async fn transactions_awaiting_reconciliation(&self) -> Result<Vec<EscrowTransaction>> {
        let records: Vec<Arc<RwLock<ProjectRecord>>> =
            self.projects.iter().map(|r| r.value().clone()).collect();

        let mut pending: Vec<EscrowTransaction> = records
            .iter()
            .flat_map(|record| {
                record
                    .read()
                    .snapshot
                    .transactions
                    .iter()
                    .filter(|t| t.awaiting_reconciliation.is_some())
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        pending.sort_by_key(|t| t.updated_at);
        Ok(pending)
    }

    async fn account_balance(
        &self,
        account: &LedgerAccount,
        currency: &Currency,
    ) -> Result<Option<AccountBalance>> {
        Ok(self
            .balances
            .get(&(*account, currency.clone()))
            .map(|b| b.value().clone()))
    }

    async fn journal_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<JournalEntry>> {
        let project_id = match self.transaction_index.get(&transaction_id) {
            Some(entry) => *entry.value(),
            None => return Ok(Vec::new()),
        };
        let record = self.record(project_id)?;
        let record = record.read();
        Ok(record
            .journal
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use freetun_common::{
        ActorId, Currency, GatewayOperation, Money, PaymentMethod, ProjectStatus, ProposalStatus,
    };

    fn tnd(minor: i64) -> Money {
        Money::new(minor, Currency::tnd())
    }

    fn new_project() -> Project {
        Project::new(ActorId::new(), "E-commerce site", tnd(1_000_000)).unwrap()
    }

    fn seeded() -> (LedgerEngine, ProjectSnapshot) {
        let ledger = LedgerEngine::new();
        // Run on a separate thread so this helper also works inside `#[tokio::test]`.
        let snapshot = std::thread::scope(|s| {
            s.spawn(|| tokio_test::block_on(ledger.create_project(new_project())))
                .join()
                .unwrap()
        })
        .unwrap();
        (ledger, snapshot)
    }

    #[test]
    fn test_create_and_load() {
        let (ledger, snapshot) = seeded();
        let loaded = tokio_test::block_on(ledger.load_project(snapshot.project_id())).unwrap();
        assert_eq!(loaded, snapshot);
        assert_eq!(loaded.version, 1);
        assert_eq!(ledger.project_count(), 1);
    }

    #[test]
    fn test_duplicate_project_is_refused() {
        let (ledger, snapshot) = seeded();
        let result = tokio_test::block_on(ledger.create_project(snapshot.project.clone()));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_commit_bumps_version_and_indexes() {
        let (ledger, snapshot) = seeded();
        let proposal =
            Proposal::new(snapshot.project_id(), ActorId::new(), tnd(700_000)).unwrap();

        let next = ledger
            .commit(ProjectChanges::against(&snapshot).with_proposal(proposal.clone()))
            .await
            .unwrap();

        assert_eq!(next.version, 2);
        assert_eq!(ledger.proposal(proposal.id).await.unwrap(), proposal);
    }

    #[tokio::test]
    async fn test_stale_version_conflicts() {
        let (ledger, snapshot) = seeded();
        let first = Proposal::new(snapshot.project_id(), ActorId::new(), tnd(700_000)).unwrap();
        let second = Proposal::new(snapshot.project_id(), ActorId::new(), tnd(650_000)).unwrap();

        ledger
            .commit(ProjectChanges::against(&snapshot).with_proposal(first))
            .await
            .unwrap();
        let err = ledger
            .commit(ProjectChanges::against(&snapshot).with_proposal(second.clone()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            FreetunError::PersistenceConflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));
        assert!(ledger.proposal(second.id).await.is_err());
    }

    #[tokio::test]
    async fn test_invariant_violation_writes_nothing() {
        let (ledger, snapshot) = seeded();
        let now = Utc::now();
        let mut a = Proposal::new(snapshot.project_id(), ActorId::new(), tnd(700_000)).unwrap();
        let mut b = Proposal::new(snapshot.project_id(), ActorId::new(), tnd(650_000)).unwrap();
        a.accept(now).unwrap();
        b.accept(now).unwrap();
        let mut project = snapshot.project.clone();
        project.transition_to(ProjectStatus::InProgress, now).unwrap();

        let err = ledger
            .commit(
                ProjectChanges::against(&snapshot)
                    .with_project(project)
                    .with_proposals([a, b]),
            )
            .await
            .unwrap_err();

        assert_eq!(err.error_code(), "INVARIANT_VIOLATION");
        let reloaded = ledger.load_project(snapshot.project_id()).await.unwrap();
        assert_eq!(reloaded, snapshot);
    }

    #[tokio::test]
    async fn test_terminal_proposal_cannot_be_reopened() {
        let (ledger, snapshot) = seeded();
        let mut proposal =
            Proposal::new(snapshot.project_id(), ActorId::new(), tnd(700_000)).unwrap();
        proposal.reject(Utc::now()).unwrap();
        let snapshot = ledger
            .commit(ProjectChanges::against(&snapshot).with_proposal(proposal.clone()))
            .await
            .unwrap();

        proposal.status = ProposalStatus::Pending;
        let result = ledger
            .commit(ProjectChanges::against(&snapshot).with_proposal(proposal))
            .await;
        assert!(result.is_err());
    }

    /// Walk a project to a funded escrow and return the latest snapshot.
    async fn funded(ledger: &LedgerEngine, snapshot: ProjectSnapshot) -> ProjectSnapshot {
        let amount = snapshot.project.budget.clone();
        funded_with(ledger, snapshot, Money::new(700_000, amount.currency)).await
    }

    async fn funded_with(
        ledger: &LedgerEngine,
        snapshot: ProjectSnapshot,
        amount: Money,
    ) -> ProjectSnapshot {
        let now = Utc::now();
        let mut proposal = Proposal::new(snapshot.project_id(), ActorId::new(), amount).unwrap();
        proposal.accept(now).unwrap();
        let mut project = snapshot.project.clone();
        project.transition_to(ProjectStatus::InProgress, now).unwrap();
        let mut tx =
            EscrowTransaction::new_pending(&proposal, project.client_id, PaymentMethod::D17, now);
        tx.mark_escrowed("ext-42".into(), now).unwrap();
        let journal = JournalBatch::for_operation(&tx, GatewayOperation::Capture, now);

        ledger
            .commit(
                ProjectChanges::against(&snapshot)
                    .with_project(project)
                    .with_proposal(proposal)
                    .with_transaction(tx)
                    .with_journal(journal),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_journal_updates_balances() {
        let (ledger, snapshot) = seeded();
        let snapshot = funded(&ledger, snapshot).await;
        let tx = snapshot.transactions[0].clone();

        let escrow = ledger
            .account_balance(&LedgerAccount::Escrow(tx.project_id), &Currency::tnd())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(escrow.balance, tx.amount);

        let client = ledger
            .account_balance(&LedgerAccount::Client(tx.payer_id), &Currency::tnd())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(client.balance.minor, -700_000);

        assert_eq!(ledger.journal_for_transaction(tx.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unbalanced_journal_is_refused() {
        let (ledger, snapshot) = seeded();
        let snapshot = funded(&ledger, snapshot).await;
        let tx = snapshot.transactions[0].clone();

        let mut batch = JournalBatch::new(tx.id, GatewayOperation::Payout);
        batch.transfer(
            LedgerAccount::Escrow(tx.project_id),
            LedgerAccount::Freelancer(tx.payee_id),
            tnd(700_000),
            Utc::now(),
        );
        batch.entries.pop();

        let result = ledger
            .commit(ProjectChanges::against(&snapshot).with_journal(batch))
            .await;
        assert!(result.is_err());
        assert_eq!(ledger.journal_for_transaction(tx.id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reconciliation_listing() {
        let (ledger, snapshot) = seeded();
        let snapshot = funded(&ledger, snapshot).await;
        let mut tx = snapshot.transactions[0].clone();
        tx.await_reconciliation(GatewayOperation::Payout, Utc::now());

        ledger
            .commit(ProjectChanges::against(&snapshot).with_transaction(tx.clone()))
            .await
            .unwrap();

        let pending = ledger.transactions_awaiting_reconciliation().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, tx.id);
        assert_eq!(ledger.transaction(tx.id).await.unwrap(), tx);
    }

    #[tokio::test]
    async fn test_missing_entities() {
        let ledger = LedgerEngine::new();
        assert!(matches!(
            ledger.load_project(ProjectId::new()).await,
            Err(FreetunError::ProjectNotFound(_))
        ));
        assert!(matches!(
            ledger.transaction(TransactionId::new()).await,
            Err(FreetunError::TransactionNotFound(_))
        ));
        assert!(ledger
            .account_balance(&LedgerAccount::Client(ActorId::new()), &Currency::tnd())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_balances_are_kept_per_currency() {
        let ledger = LedgerEngine::new();
        let client = ActorId::new();
        let budgets = [tnd(1_000_000), Money::new(50_000, Currency::eur())];

        for budget in budgets {
            let amount = Money::new(budget.minor / 2, budget.currency.clone());
            let project = Project::new(client, "Translation", budget).unwrap();
            let snapshot = ledger.create_project(project).await.unwrap();
            funded_with(&ledger, snapshot, amount).await;
        }

        let account = LedgerAccount::Client(client);
        let in_tnd = ledger
            .account_balance(&account, &Currency::tnd())
            .await
            .unwrap()
            .unwrap();
        let in_eur = ledger
            .account_balance(&account, &Currency::eur())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_tnd.balance, tnd(-500_000));
        assert_eq!(in_eur.balance, Money::new(-25_000, Currency::eur()));
        assert_eq!(in_tnd.entry_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_shared_client_balance_under_concurrent_commits() {
        let ledger = Arc::new(LedgerEngine::new());
        let client = ActorId::new();
        let projects = 200;

        let mut snapshots = Vec::with_capacity(projects);
        for _ in 0..projects {
            let project = Project::new(client, "Icon set", tnd(2_000)).unwrap();
            snapshots.push(ledger.create_project(project).await.unwrap());
        }

        let tasks: Vec<_> = snapshots
            .into_iter()
            .map(|snapshot| {
                let ledger = ledger.clone();
                tokio::spawn(async move { funded_with(&ledger, snapshot, tnd(1_000)).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let balance = ledger
            .account_balance(&LedgerAccount::Client(client), &Currency::tnd())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(balance.balance, tnd(-1_000 * projects as i64));
        assert_eq!(balance.entry_count, projects as u64);
    }
}
