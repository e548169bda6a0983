//! Proposal submission and single-winner acceptance.

use chrono::{DateTime, Utc};

use freetun_common::{
    ActorId, FreetunError, Money, Project, ProjectStatus, Proposal, ProposalId, Result,
};
use freetun_ledger::{ProjectChanges, ProjectSnapshot};

fn require_open(project: &Project) -> Result<()> {
    if project.is_open() {
        Ok(())
    } else {
        Err(FreetunError::ProjectNotOpen {
            project_id: project.id,
            status: project.status,
        })
    }
}

/// Create a pending proposal on an open project.
pub fn submit(snapshot: &ProjectSnapshot, freelancer_id: ActorId, amount: Money) -> Result<Proposal> {
    let project = &snapshot.project;
    require_open(project)?;

    if &amount.currency != project.currency() {
        return Err(FreetunError::validation(
            format!(
                "Proposal must be in {}, got {}",
                project.currency(),
                amount.currency
            ),
            "amount",
        ));
    }

    if snapshot
        .pending_proposals()
        .any(|p| p.freelancer_id == freelancer_id)
    {
        return Err(FreetunError::DuplicateProposal {
            project_id: project.id,
            freelancer_id,
        });
    }

    Proposal::new(project.id, freelancer_id, amount)
}

/// Result of accepting a proposal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acceptance {
    pub project: Project,
    pub accepted: Proposal,
    /// Former siblings, rejected in the same write.
    pub rejected: Vec<Proposal>,
}

impl Acceptance {
    /// Change set writing the whole fan-out in one commit.
    pub fn to_changes(&self, snapshot: &ProjectSnapshot) -> ProjectChanges {
        ProjectChanges::against(snapshot)
            .with_project(self.project.clone())
            .with_proposal(self.accepted.clone())
            .with_proposals(self.rejected.iter().cloned())
    }
}

/// Accept one pending proposal, reject its pending siblings and start the
/// project.
pub fn accept(
    snapshot: &ProjectSnapshot,
    proposal_id: ProposalId,
    at: DateTime<Utc>,
) -> Result<Acceptance> {
    require_open(&snapshot.project)?;

    let mut accepted = snapshot
        .proposal(proposal_id)
        .filter(|p| p.is_pending())
        .cloned()
        .ok_or(FreetunError::ProposalNotPending(proposal_id))?;
    accepted.accept(at)?;

    let rejected = snapshot
        .pending_proposals()
        .filter(|p| p.id != proposal_id)
        .map(|p| {
            let mut p = p.clone();
            p.reject(at).map(|_| p)
        })
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut project = snapshot.project.clone();
    project.transition_to(ProjectStatus::InProgress, at)?;

    Ok(Acceptance {
        project,
        accepted,
        rejected,
    })
}

/// Reject every pending proposal of the project.
pub fn reject_pending(snapshot: &ProjectSnapshot, at: DateTime<Utc>) -> Result<Vec<Proposal>> {
    snapshot
        .pending_proposals()
        .map(|p| -> Result<Proposal> {
            let mut p = p.clone();
            p.reject(at)?;
            Ok(p)
        })
        .collect()
}

/// Result of cancelling a project.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cancellation {
    pub project: Project,
    pub rejected: Vec<Proposal>,
}

/// Cancel a project that holds no live escrow.
///
/// Escrowed funds only leave through refund, which cancels the project
/// itself.
pub fn cancel(snapshot: &ProjectSnapshot, at: DateTime<Utc>) -> Result<Cancellation> {
    if let Some(active) = snapshot.active_transaction() {
        return Err(FreetunError::EscrowAlreadyActive {
            project_id: snapshot.project_id(),
            transaction_id: active.id,
        });
    }

    let mut project = snapshot.project.clone();
    project.transition_to(ProjectStatus::Cancelled, at)?;
    let rejected = reject_pending(snapshot, at)?;

    Ok(Cancellation { project, rejected })
}
