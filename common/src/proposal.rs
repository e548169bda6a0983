//! Freelancer proposals (bids) on projects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ActorId, FreetunError, InvalidTransition, Money, ProjectId, ProposalId, Result};

/// Proposal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }

    pub fn can_transition_to(&self, next: ProposalStatus) -> bool {
        matches!(
            (self, next),
            (ProposalStatus::Pending, ProposalStatus::Accepted)
                | (ProposalStatus::Pending, ProposalStatus::Rejected)
        )
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// A freelancer's bid on an open project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub project_id: ProjectId,
    pub freelancer_id: ActorId,
    /// Price the freelancer asks; becomes the escrow amount if accepted.
    pub amount: Money,
    pub status: ProposalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Proposal {
    /// Create a new pending proposal.
    pub fn new(project_id: ProjectId, freelancer_id: ActorId, amount: Money) -> Result<Self> {
        if !amount.is_positive() {
            return Err(FreetunError::validation(
                "Proposal amount must be positive",
                "amount",
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id: ProposalId::new(),
            project_id,
            freelancer_id,
            amount,
            status: ProposalStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_pending(&self) -> bool {
        self.status == ProposalStatus::Pending
    }

    fn transition_to(
        &mut self,
        next: ProposalStatus,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition::new("proposal", self.status, next));
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }

    pub fn accept(&mut self, at: DateTime<Utc>) -> std::result::Result<(), InvalidTransition> {
        self.transition_to(ProposalStatus::Accepted, at)
    }

    pub fn reject(&mut self, at: DateTime<Utc>) -> std::result::Result<(), InvalidTransition> {
        self.transition_to(ProposalStatus::Rejected, at)
    }
}
