//! Test doubles and fixtures for coordinator tests.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use freetun_common::{
    ActorId, ActorRef, Currency, EscrowTransaction, FreetunError, Money, PaymentMethod, Project,
    ProjectId, Proposal, ProposalId, Result, Role, TransactionId, VerificationStatus,
};
use freetun_ledger::{
    AccountBalance, JournalEntry, LedgerAccount, LedgerEngine, LedgerStore, ProjectChanges,
    ProjectSnapshot,
};

use crate::config::CoordinatorConfig;
use crate::coordinator::TransactionCoordinator;
use crate::gateway::{CaptureReceipt, GatewayError, PaymentGateway};
use crate::identity::StaticIdentityDirectory;

/// Scripted answer of a gateway operation.
#[derive(Debug, Clone, Default)]
pub enum Behavior {
    #[default]
    Succeed,
    Decline(String),
    Fail(String),
    /// Succeed after sleeping.
    Delay(Duration),
}

impl Behavior {
    async fn perform(self) -> std::result::Result<(), GatewayError> {
        match self {
            Behavior::Succeed => Ok(()),
            Behavior::Decline(reason) => Err(GatewayError::Declined(reason)),
            Behavior::Fail(reason) => Err(GatewayError::Unavailable(reason)),
            Behavior::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        }
    }
}

/// Gateway answering from a script and counting calls.
#[derive(Default)]
pub struct ScriptedGateway {
    capture: Mutex<Behavior>,
    payout: Mutex<Behavior>,
    refund: Mutex<Behavior>,
    capture_calls: AtomicUsize,
    payout_calls: AtomicUsize,
    refund_calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_capture(&self, behavior: Behavior) {
        *self.capture.lock() = behavior;
    }

    pub fn set_payout(&self, behavior: Behavior) {
        *self.payout.lock() = behavior;
    }

    pub fn set_refund(&self, behavior: Behavior) {
        *self.refund.lock() = behavior;
    }

    pub fn capture_calls(&self) -> usize {
        self.capture_calls.load(Ordering::SeqCst)
    }

    pub fn payout_calls(&self) -> usize {
        self.payout_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn capture(
        &self,
        transaction_id: TransactionId,
        _amount: &Money,
        _method: PaymentMethod,
    ) -> std::result::Result<CaptureReceipt, GatewayError> {
        self.capture_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.capture.lock().clone();
        behavior.perform().await?;
        Ok(CaptureReceipt {
            external_ref: format!("cap-{}", transaction_id),
        })
    }

    async fn payout(
        &self,
        _transaction_id: TransactionId,
        _amount: &Money,
    ) -> std::result::Result<(), GatewayError> {
        self.payout_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.payout.lock().clone();
        behavior.perform().await
    }

    async fn refund_funds(
        &self,
        _transaction_id: TransactionId,
        _amount: &Money,
    ) -> std::result::Result<(), GatewayError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.refund.lock().clone();
        behavior.perform().await
    }
}

/// Ledger that refuses the next N commits with a version conflict, or the
/// next N journaled commits with a storage error.
#[derive(Default)]
pub struct FlakyStore {
    inner: LedgerEngine,
    conflicts: AtomicU32,
    journal_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject_conflicts(&self, count: u32) {
        self.conflicts.store(count, Ordering::SeqCst);
    }

    pub fn fail_journal_commits(&self, count: u32) {
        self.journal_failures.store(count, Ordering::SeqCst);
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl LedgerStore for FlakyStore {
    async fn create_project(&self, project: Project) -> Result<ProjectSnapshot> {
        self.inner.create_project(project).await
    }

    async fn load_project(&self, project_id: ProjectId) -> Result<ProjectSnapshot> {
        self.inner.load_project(project_id).await
    }

    async fn commit(&self, changes: ProjectChanges) -> Result<ProjectSnapshot> {
        if changes.journal.is_some() && take_one(&self.journal_failures) {
            return Err(FreetunError::Storage("journal write failed".into()));
        }
        if take_one(&self.conflicts) {
            return Err(FreetunError::PersistenceConflict {
                project_id: changes.project_id,
                expected: changes.expected_version,
                actual: changes.expected_version + 1,
            });
        }
        self.inner.commit(changes).await
    }

    async fn proposal(&self, proposal_id: ProposalId) -> Result<Proposal> {
        self.inner.proposal(proposal_id).await
    }

    async fn transaction(&self, transaction_id: TransactionId) -> Result<EscrowTransaction> {
        self.inner.transaction(transaction_id).await
    }

    async fn transactions_awaiting_reconciliation(&self) -> Result<Vec<EscrowTransaction>> {
        self.inner.transactions_awaiting_reconciliation().await
    }

    async fn account_balance(
        &self,
        account: &LedgerAccount,
        currency: &Currency,
    ) -> Result<Option<AccountBalance>> {
        self.inner.account_balance(account, currency).await
    }

    async fn journal_for_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<Vec<JournalEntry>> {
        self.inner.journal_for_transaction(transaction_id).await
    }
}

pub fn tnd(value: &str) -> Money {
    Money::from_decimal_str(value, Currency::tnd()).unwrap()
}

/// Default configuration with short timeouts.
pub fn test_config() -> CoordinatorConfig {
    let mut config = CoordinatorConfig::default();
    config.lock_config.acquisition_timeout = Duration::from_secs(2);
    config.gateway_config.call_timeout = Duration::from_millis(200);
    config
}

/// Parties and proposal of an accepted project.
#[derive(Debug, Clone)]
pub struct Deal {
    pub client: ActorRef,
    pub freelancer: ActorRef,
    pub project_id: ProjectId,
    pub proposal: Proposal,
}

/// Coordinator wired to in-memory collaborators.
pub struct Harness {
    pub coordinator: Arc<TransactionCoordinator>,
    pub identity: Arc<StaticIdentityDirectory>,
    pub gateway: Arc<ScriptedGateway>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: CoordinatorConfig) -> Self {
        Self::with_store(config, Arc::new(LedgerEngine::new()))
    }

    pub fn with_store(config: CoordinatorConfig, store: Arc<dyn LedgerStore>) -> Self {
        let identity = Arc::new(StaticIdentityDirectory::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let coordinator = Arc::new(
            TransactionCoordinator::new(config, store, identity.clone(), gateway.clone()).unwrap(),
        );
        Self {
            coordinator,
            identity,
            gateway,
        }
    }

    /// Register a new actor.
    pub fn actor(&self, role: Role, status: VerificationStatus) -> ActorRef {
        let caller = ActorRef::new(ActorId::new(), role);
        self.identity.set_status(caller.id, status);
        caller
    }

    pub fn client(&self) -> ActorRef {
        self.actor(Role::Client, VerificationStatus::Verified)
    }

    pub fn freelancer(&self) -> ActorRef {
        self.actor(Role::Freelancer, VerificationStatus::Verified)
    }

    pub fn admin(&self) -> ActorRef {
        self.actor(Role::Admin, VerificationStatus::Verified)
    }

    pub async fn post(&self, client: ActorRef, budget: &str) -> Project {
        self.coordinator
            .submit_project(client, "Mobile app", tnd(budget))
            .await
            .unwrap()
    }

    /// Project with a single accepted proposal of 700 TND.
    pub async fn accepted(&self) -> Deal {
        let client = self.client();
        let freelancer = self.freelancer();
        let project = self.post(client, "1000.000").await;
        let proposal = self
            .coordinator
            .submit_proposal(freelancer, project.id, tnd("700.000"))
            .await
            .unwrap();
        let acceptance = self
            .coordinator
            .accept_proposal(client, project.id, proposal.id)
            .await
            .unwrap();

        Deal {
            client,
            freelancer,
            project_id: project.id,
            proposal: acceptance.accepted,
        }
    }

    /// Accepted project with its escrow funded.
    pub async fn funded(&self) -> (Deal, EscrowTransaction) {
        let deal = self.accepted().await;
        let tx = self
            .coordinator
            .fund_escrow(deal.client, deal.project_id, PaymentMethod::D17)
            .await
            .unwrap();
        (deal, tx)
    }
}
