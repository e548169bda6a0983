//! Core coordinator implementation.

use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use freetun_common::{
    now, Actor, ActorRef, ConsentKind, Currency, EscrowParty, EscrowTransaction, FreetunError,
    GatewayOperation, InvalidTransition, Money, PaymentMethod, Project, ProjectId, Proposal,
    ProposalId, Result, Timestamp, TransactionId,
};
use freetun_ledger::{
    AccountBalance, JournalEntry, LedgerAccount, LedgerStore, ProjectChanges, ProjectSnapshot,
};

use crate::config::CoordinatorConfig;
use crate::escrow_engine::{self, Authority, DisputeResolution, EscrowStep, GatewayInstruction};
use crate::gateway::{self, GatewayOutcome, PaymentGateway, ReconciliationOutcome};
use crate::identity::IdentityDirectory;
use crate::lock_manager::{ProjectLease, ProjectLockManager};
use crate::metrics::{Metrics, SharedMetrics};
use crate::proposal_matcher::{self, Acceptance};
use crate::verification_gate::{self, Action, Decision};

/// Orchestrates the verification gate, proposal matcher and escrow engine as
/// one serialized unit of work per project.
///
/// Every state-changing operation runs: project lock, verification lookup,
/// gate, snapshot load, ownership check, pure transition, gateway call,
/// versioned commit. Gateway effects are committed only once confirmed;
/// unconfirmed outcomes are committed as reconciliation markers.
pub struct TransactionCoordinator {
    /// Configuration.
    config: CoordinatorConfig,
    /// Source of truth for every aggregate.
    store: Arc<dyn LedgerStore>,
    /// Verification status lookups.
    identity: Arc<dyn IdentityDirectory>,
    /// Payment provider.
    gateway: Arc<dyn PaymentGateway>,
    /// Per-project serialization.
    locks: ProjectLockManager,
    metrics: SharedMetrics,
}

impl TransactionCoordinator {
    /// Create a new coordinator instance. Fails on an invalid configuration.
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn LedgerStore>,
        identity: Arc<dyn IdentityDirectory>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Result<Self> {
        if let Err(reason) = config.validate() {
            error!(error = %reason, "Invalid configuration");
            return Err(FreetunError::validation(reason, "config"));
        }

        let locks = ProjectLockManager::new(config.lock_config.clone());
        Ok(Self {
            config,
            store,
            identity,
            gateway,
            locks,
            metrics: Arc::new(Metrics::new()),
        })
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    pub fn lock_manager(&self) -> &ProjectLockManager {
        &self.locks
    }

    // --- Actions ---

    /// Post a new project.
    #[instrument(skip_all, fields(actor_id = %caller.id))]
    pub async fn submit_project(&self, caller: ActorRef, title: &str, budget: Money) -> Result<Project> {
        self.authorize(caller, Action::PostProject).await?;

        let project = Project::new(caller.id, title, budget)?;
        let snapshot = self.store.create_project(project).await?;
        self.metrics.project_posted();

        info!(
            project_id = %snapshot.project_id(),
            client_id = %caller.id,
            budget = %snapshot.project.budget,
            "Project posted"
        );
        Ok(snapshot.project)
    }

    /// Submit a proposal on an open project.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %caller.id))]
    pub async fn submit_proposal(
        &self,
        caller: ActorRef,
        project_id: ProjectId,
        amount: Money,
    ) -> Result<Proposal> {
        let _lease = self.lock(project_id).await?;
        let actor = self.authorize(caller, Action::SubmitProposal).await?;
        let snapshot = self.store.load_project(project_id).await?;

        let (_, proposal) = self
            .commit_with(snapshot, |s| {
                let proposal = proposal_matcher::submit(s, actor.id, amount.clone())?;
                Ok((
                    ProjectChanges::against(s).with_proposal(proposal.clone()),
                    proposal,
                ))
            })
            .await?;
        self.metrics.proposal_submitted();

        info!(
            project_id = %project_id,
            proposal_id = %proposal.id,
            amount = %proposal.amount,
            "Proposal submitted"
        );
        Ok(proposal)
    }

    /// Accept a proposal, rejecting its pending siblings in the same write.
    #[instrument(skip_all, fields(project_id = %project_id, proposal_id = %proposal_id, actor_id = %caller.id))]
    pub async fn accept_proposal(
        &self,
        caller: ActorRef,
        project_id: ProjectId,
        proposal_id: ProposalId,
    ) -> Result<Acceptance> {
        let _lease = self.lock(project_id).await?;
        let actor = self.authorize(caller, Action::AcceptProposal).await?;
        let snapshot = self.store.load_project(project_id).await?;
        require_project_owner(&actor, &snapshot.project)?;

        let (_, acceptance) = self
            .commit_with(snapshot, |s| {
                let acceptance = proposal_matcher::accept(s, proposal_id, now())?;
                Ok((acceptance.to_changes(s), acceptance))
            })
            .await?;
        self.metrics.proposal_accepted();

        info!(
            project_id = %project_id,
            proposal_id = %proposal_id,
            rejected = acceptance.rejected.len(),
            "Proposal accepted"
        );
        Ok(acceptance)
    }

    /// Fund escrow for the accepted proposal.
    ///
    /// The pending transaction is committed before the capture; the capture
    /// result is committed after. A declined capture fails the transaction;
    /// an unconfirmed one leaves it pending reconciliation.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %caller.id, method = %method))]
    pub async fn fund_escrow(
        &self,
        caller: ActorRef,
        project_id: ProjectId,
        method: PaymentMethod,
    ) -> Result<EscrowTransaction> {
        let _lease = self.lock(project_id).await?;
        let actor = self.authorize(caller, Action::FundEscrow).await?;
        if !self.config.escrow_policy.accepts(method) {
            return Err(FreetunError::validation(
                format!("Payment method {} is not accepted", method),
                "method",
            ));
        }
        let snapshot = self.store.load_project(project_id).await?;
        require_project_owner(&actor, &snapshot.project)?;

        let (snapshot, (tx, instruction)) = self
            .commit_with(snapshot, |s| {
                let (tx, instruction) = escrow_engine::plan_fund(s, method, now())?;
                Ok((
                    ProjectChanges::against(s).with_transaction(tx.clone()),
                    (tx, instruction),
                ))
            })
            .await?;

        info!(
            project_id = %project_id,
            transaction_id = %tx.id,
            amount = %tx.amount,
            "Escrow pending capture"
        );
        self.settle(snapshot, instruction).await
    }

    /// Record that the freelancer delivered the work.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %caller.id))]
    pub async fn mark_delivered(
        &self,
        caller: ActorRef,
        project_id: ProjectId,
    ) -> Result<EscrowTransaction> {
        let _lease = self.lock(project_id).await?;
        let actor = self.authorize(caller, Action::MarkDelivered).await?;
        let snapshot = self.store.load_project(project_id).await?;
        let tx = escrow_engine::current_transaction(&snapshot)?;
        if tx.party_of(&actor.id) != Some(EscrowParty::Payee) {
            return Err(not_owner(&actor, format!("escrow {}", tx.id)));
        }

        let tx = self
            .update_escrow(snapshot, escrow_engine::mark_delivered)
            .await?;
        info!(project_id = %project_id, transaction_id = %tx.id, "Delivery marked");
        Ok(tx)
    }

    /// Record one party's consent to early release or refund.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %caller.id))]
    pub async fn record_consent(
        &self,
        caller: ActorRef,
        project_id: ProjectId,
        kind: ConsentKind,
    ) -> Result<EscrowTransaction> {
        let _lease = self.lock(project_id).await?;
        let actor = self.authorize(caller, Action::RecordConsent).await?;
        let snapshot = self.store.load_project(project_id).await?;
        let party = require_party(&actor, escrow_engine::current_transaction(&snapshot)?)?;

        let tx = self
            .update_escrow(snapshot, |tx, at| {
                escrow_engine::record_consent(tx, party, kind, at)
            })
            .await?;
        info!(
            project_id = %project_id,
            transaction_id = %tx.id,
            party = ?party,
            kind = ?kind,
            "Consent recorded"
        );
        Ok(tx)
    }

    /// Pay the escrowed funds out to the freelancer.
    ///
    /// Calling it again on a released escrow returns the stored record
    /// without another payout.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %caller.id))]
    pub async fn release_funds(
        &self,
        caller: ActorRef,
        project_id: ProjectId,
    ) -> Result<EscrowTransaction> {
        let _lease = self.lock(project_id).await?;
        let actor = self.authorize(caller, Action::Release).await?;
        let snapshot = self.store.load_project(project_id).await?;
        require_project_owner(&actor, &snapshot.project)?;

        let tx = escrow_engine::current_transaction(&snapshot)?;
        let step = escrow_engine::plan_release(
            tx,
            Authority::Party,
            self.config.escrow_policy.allow_early_release,
        )?;
        self.run_step(snapshot, step).await
    }

    /// Return the escrowed funds to the client, with both parties' consent.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %caller.id))]
    pub async fn refund_funds(
        &self,
        caller: ActorRef,
        project_id: ProjectId,
    ) -> Result<EscrowTransaction> {
        let _lease = self.lock(project_id).await?;
        let actor = self.authorize(caller, Action::Refund).await?;
        let snapshot = self.store.load_project(project_id).await?;

        let tx = escrow_engine::current_transaction(&snapshot)?;
        require_party(&actor, tx)?;
        let step = escrow_engine::plan_refund(tx, Authority::Party)?;
        self.run_step(snapshot, step).await
    }

    /// Flag a dispute on the escrow, blocking release and refund.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %caller.id))]
    pub async fn raise_dispute(
        &self,
        caller: ActorRef,
        project_id: ProjectId,
    ) -> Result<EscrowTransaction> {
        let _lease = self.lock(project_id).await?;
        let actor = self.authorize(caller, Action::RaiseDispute).await?;
        let snapshot = self.store.load_project(project_id).await?;
        let current = escrow_engine::current_transaction(&snapshot)?;
        require_party(&actor, current)?;
        let already_disputed = current.disputed;

        let tx = self
            .update_escrow(snapshot, escrow_engine::raise_dispute)
            .await?;
        if !already_disputed {
            self.metrics.dispute_raised();
            warn!(project_id = %project_id, transaction_id = %tx.id, "Dispute raised");
        }
        Ok(tx)
    }

    /// Close a dispute with a full release or a full refund.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %caller.id, resolution = ?resolution))]
    pub async fn resolve_dispute(
        &self,
        caller: ActorRef,
        project_id: ProjectId,
        resolution: DisputeResolution,
    ) -> Result<EscrowTransaction> {
        let _lease = self.lock(project_id).await?;
        self.authorize(caller, Action::ResolveDispute).await?;
        let snapshot = self.store.load_project(project_id).await?;

        let step = escrow_engine::plan_resolution(
            escrow_engine::current_transaction(&snapshot)?,
            resolution,
        )?;
        let resolves = matches!(step, EscrowStep::Call(_));
        let tx = self.run_step(snapshot, step).await?;
        if resolves {
            self.metrics.dispute_resolved();
            info!(project_id = %project_id, transaction_id = %tx.id, status = %tx.status, "Dispute resolved");
        }
        Ok(tx)
    }

    /// Cancel a project that holds no live escrow.
    #[instrument(skip_all, fields(project_id = %project_id, actor_id = %caller.id))]
    pub async fn cancel_project(&self, caller: ActorRef, project_id: ProjectId) -> Result<Project> {
        let _lease = self.lock(project_id).await?;
        let actor = self.authorize(caller, Action::CancelProject).await?;
        let snapshot = self.store.load_project(project_id).await?;
        require_project_owner(&actor, &snapshot.project)?;

        let (_, cancellation) = self
            .commit_with(snapshot, |s| {
                let cancellation = proposal_matcher::cancel(s, now())?;
                let changes = ProjectChanges::against(s)
                    .with_project(cancellation.project.clone())
                    .with_proposals(cancellation.rejected.iter().cloned());
                Ok((changes, cancellation))
            })
            .await?;
        self.metrics.project_cancelled();

        info!(
            project_id = %project_id,
            rejected = cancellation.rejected.len(),
            "Project cancelled"
        );
        Ok(cancellation.project)
    }

    /// Finalize a gateway call whose outcome was unknown.
    ///
    /// Used by the reconciliation sweep once it learned the true outcome from
    /// the gateway. Succeeds once per marker; afterwards the transaction no
    /// longer awaits reconciliation and the call fails.
    #[instrument(skip_all, fields(transaction_id = %transaction_id))]
    pub async fn complete_reconciliation(
        &self,
        transaction_id: TransactionId,
        outcome: ReconciliationOutcome,
    ) -> Result<EscrowTransaction> {
        let project_id = self.store.transaction(transaction_id).await?.project_id;
        let _lease = self.lock(project_id).await?;
        let snapshot = self.store.load_project(project_id).await?;
        let outcome = GatewayOutcome::from(outcome);

        let (_, (tx, operation)) = self
            .commit_with(snapshot, |s| {
                let current = s
                    .transaction(transaction_id)
                    .ok_or(FreetunError::TransactionNotFound(transaction_id))?;
                let operation = current.awaiting_reconciliation.ok_or_else(|| {
                    InvalidTransition::new("reconciliation", current.status, "reconciled")
                })?;
                let settlement =
                    escrow_engine::apply_outcome(s, transaction_id, operation, &outcome, now())?;
                let tx = settlement.transaction.clone();
                Ok((settlement.into_changes(s), (tx, operation)))
            })
            .await?;

        self.record_outcome(operation, &outcome);
        self.metrics.reconciliation_completed();
        info!(
            project_id = %project_id,
            transaction_id = %transaction_id,
            operation = %operation,
            status = %tx.status,
            "Reconciliation completed"
        );
        Ok(tx)
    }

    // --- Reads ---

    /// Consistent view of a project with its proposals and escrows.
    pub async fn project_view(&self, project_id: ProjectId) -> Result<ProjectSnapshot> {
        self.store.load_project(project_id).await
    }

    pub async fn proposal(&self, proposal_id: ProposalId) -> Result<Proposal> {
        self.store.proposal(proposal_id).await
    }

    pub async fn transaction(&self, transaction_id: TransactionId) -> Result<EscrowTransaction> {
        self.store.transaction(transaction_id).await
    }

    /// Transactions the reconciliation sweep must resolve.
    pub async fn pending_reconciliations(&self) -> Result<Vec<EscrowTransaction>> {
        self.store.transactions_awaiting_reconciliation().await
    }

    pub async fn account_balance(
        &self,
        account: &LedgerAccount,
        currency: &Currency,
    ) -> Result<Option<AccountBalance>> {
        self.store.account_balance(account, currency).await
    }

    pub async fn journal(&self, transaction_id: TransactionId) -> Result<Vec<JournalEntry>> {
        self.store.journal_for_transaction(transaction_id).await
    }

    // --- Private methods ---

    async fn lock(&self, project_id: ProjectId) -> Result<ProjectLease> {
        self.locks.acquire(project_id).await.map_err(|err| {
            self.metrics.lock_timeout();
            err
        })
    }

    /// Pull the caller's verification status and run the gate.
    async fn authorize(&self, caller: ActorRef, action: Action) -> Result<Actor> {
        let status = self.identity.verification_status(caller.id).await?;
        let actor = caller.with_status(status);

        if let Decision::Denied(err) = verification_gate::authorize(&actor, action) {
            self.metrics.authorization_denied();
            warn!(
                actor_id = %actor.id,
                role = %actor.role,
                verification = %actor.verification,
                action = %action,
                code = err.error_code(),
                "Action denied"
            );
            return Err(err);
        }
        Ok(actor)
    }

    /// Commit the changes `apply` derives from the snapshot.
    ///
    /// On a version conflict the snapshot is reloaded and `apply` re-run, up
    /// to the configured retry limit. Empty change sets are not committed.
    async fn commit_with<T, F>(
        &self,
        mut snapshot: ProjectSnapshot,
        mut apply: F,
    ) -> Result<(ProjectSnapshot, T)>
    where
        F: FnMut(&ProjectSnapshot) -> Result<(ProjectChanges, T)> + Send,
        T: Send,
    {
        let max_retries = self.config.persistence_config.max_conflict_retries;
        let mut attempt = 0;

        loop {
            let (changes, output) = apply(&snapshot)?;
            if changes.is_empty() {
                return Ok((snapshot, output));
            }

            match self.store.commit(changes).await {
                Ok(next) => return Ok((next, output)),
                Err(FreetunError::PersistenceConflict {
                    project_id,
                    expected,
                    actual,
                }) if attempt < max_retries => {
                    attempt += 1;
                    self.metrics.persistence_conflict();
                    warn!(
                        project_id = %project_id,
                        expected,
                        actual,
                        attempt,
                        "Version conflict, reloading project"
                    );
                    snapshot = self.store.load_project(project_id).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Apply an idempotent, money-free escrow update.
    async fn update_escrow<F>(&self, snapshot: ProjectSnapshot, update: F) -> Result<EscrowTransaction>
    where
        F: Fn(&EscrowTransaction, Timestamp) -> Result<Option<EscrowTransaction>> + Send + Sync,
    {
        let (_, tx) = self
            .commit_with(snapshot, |s| {
                let current = escrow_engine::current_transaction(s)?;
                match update(current, now())? {
                    Some(next) => Ok((
                        ProjectChanges::against(s).with_transaction(next.clone()),
                        next,
                    )),
                    None => Ok((ProjectChanges::against(s), current.clone())),
                }
            })
            .await?;
        Ok(tx)
    }

    async fn run_step(&self, snapshot: ProjectSnapshot, step: EscrowStep) -> Result<EscrowTransaction> {
        match step {
            EscrowStep::Settled(tx) => {
                self.metrics.idempotent_replay();
                info!(
                    project_id = %tx.project_id,
                    transaction_id = %tx.id,
                    status = %tx.status,
                    "Escrow already settled, returning stored record"
                );
                Ok(tx)
            }
            EscrowStep::Call(instruction) => self.settle(snapshot, instruction).await,
        }
    }

    /// Execute a gateway instruction and commit what it did.
    async fn settle(
        &self,
        snapshot: ProjectSnapshot,
        instruction: GatewayInstruction,
    ) -> Result<EscrowTransaction> {
        let project_id = snapshot.project_id();
        let transaction_id = instruction.transaction_id();
        let operation = instruction.operation();

        self.metrics.gateway_called();
        let outcome = gateway::execute(
            self.gateway.as_ref(),
            &instruction,
            self.config.gateway_config.call_timeout,
        )
        .await;

        let recorded = self
            .commit_with(snapshot, |s| {
                let settlement =
                    escrow_engine::apply_outcome(s, transaction_id, operation, &outcome, now())?;
                let tx = settlement.transaction.clone();
                Ok((settlement.into_changes(s), tx))
            })
            .await;

        let tx = match recorded {
            Ok((_, tx)) => tx,
            Err(err) => {
                error!(
                    transaction_id = %transaction_id,
                    operation = %operation,
                    outcome = ?outcome,
                    error = %err,
                    "Gateway outcome could not be recorded"
                );
                // The gateway may have moved money; leave the call to the sweep.
                match self
                    .hold_for_reconciliation(project_id, transaction_id, operation)
                    .await
                {
                    Ok(_) => self.metrics.gateway_unconfirmed(),
                    Err(marker_err) => error!(
                        transaction_id = %transaction_id,
                        operation = %operation,
                        error = %marker_err,
                        "Reconciliation marker could not be recorded"
                    ),
                }
                return Err(err);
            }
        };

        self.record_outcome(operation, &outcome);
        outcome.into_result(transaction_id, operation)?;

        info!(
            project_id = %tx.project_id,
            transaction_id = %transaction_id,
            operation = %operation,
            status = %tx.status,
            "Escrow updated"
        );
        Ok(tx)
    }

    /// Commit only the reconciliation marker for a gateway call.
    async fn hold_for_reconciliation(
        &self,
        project_id: ProjectId,
        transaction_id: TransactionId,
        operation: GatewayOperation,
    ) -> Result<EscrowTransaction> {
        let snapshot = self.store.load_project(project_id).await?;
        let (_, tx) = self
            .commit_with(snapshot, |s| {
                let mut tx = s
                    .transaction(transaction_id)
                    .cloned()
                    .ok_or(FreetunError::TransactionNotFound(transaction_id))?;
                if tx.awaiting_reconciliation == Some(operation) {
                    return Ok((ProjectChanges::against(s), tx));
                }
                tx.await_reconciliation(operation, now());
                Ok((ProjectChanges::against(s).with_transaction(tx.clone()), tx))
            })
            .await?;
        warn!(
            project_id = %project_id,
            transaction_id = %transaction_id,
            operation = %operation,
            "Escrow held for reconciliation"
        );
        Ok(tx)
    }

    fn record_outcome(&self, operation: GatewayOperation, outcome: &GatewayOutcome) {
        match outcome {
            GatewayOutcome::Confirmed { .. } => self.metrics.gateway_confirmed(operation),
            GatewayOutcome::Declined { .. } => self.metrics.gateway_declined(operation),
            GatewayOutcome::TimedOut | GatewayOutcome::Unavailable { .. } => {
                self.metrics.gateway_unconfirmed()
            }
        }
    }
}

fn not_owner(actor: &Actor, resource: String) -> FreetunError {
    FreetunError::NotOwner {
        actor: actor.id,
        resource,
    }
}

fn require_project_owner(actor: &Actor, project: &Project) -> Result<()> {
    if project.client_id == actor.id {
        Ok(())
    } else {
        Err(not_owner(actor, format!("project {}", project.id)))
    }
}

fn require_party(actor: &Actor, tx: &EscrowTransaction) -> Result<EscrowParty> {
    tx.party_of(&actor.id)
        .ok_or_else(|| not_owner(actor, format!("escrow {}", tx.id)))
}
