//! Authorization of marketplace actions.
//!
//! A pure decision over the actor's role and the verification status pulled
//! for this action. Money-moving actions need a verified identity; the
//! onboarding actions only refuse rejected identities.

use serde::{Deserialize, Serialize};
use std::fmt;

use freetun_common::{Actor, FreetunError, Result, Role, VerificationStatus};

/// Actions an actor may attempt on the escrow core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    PostProject,
    SubmitProposal,
    AcceptProposal,
    FundEscrow,
    MarkDelivered,
    RecordConsent,
    Release,
    Refund,
    RaiseDispute,
    ResolveDispute,
    CancelProject,
}

impl Action {
    /// Check if the action needs a verified identity.
    pub fn requires_verified(&self) -> bool {
        match self {
            Action::AcceptProposal
            | Action::FundEscrow
            | Action::Release
            | Action::Refund
            | Action::ResolveDispute
            | Action::RecordConsent => true,
            Action::PostProject
            | Action::SubmitProposal
            | Action::MarkDelivered
            | Action::RaiseDispute
            | Action::CancelProject => false,
        }
    }

    /// Roles allowed to attempt the action.
    pub fn permitted_roles(&self) -> &[Role] {
        match self {
            Action::PostProject
            | Action::AcceptProposal
            | Action::FundEscrow
            | Action::Release
            | Action::CancelProject => &[Role::Client],
            Action::SubmitProposal | Action::MarkDelivered => &[Role::Freelancer],
            Action::ResolveDispute => &[Role::Admin],
            Action::Refund | Action::RecordConsent | Action::RaiseDispute => {
                &[Role::Client, Role::Freelancer]
            }
        }
    }

    pub fn permits(&self, role: Role) -> bool {
        self.permitted_roles().contains(&role)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::PostProject => "post project",
            Action::SubmitProposal => "submit proposal",
            Action::AcceptProposal => "accept proposal",
            Action::FundEscrow => "fund escrow",
            Action::MarkDelivered => "mark delivered",
            Action::RecordConsent => "record consent",
            Action::Release => "release funds",
            Action::Refund => "refund funds",
            Action::RaiseDispute => "raise dispute",
            Action::ResolveDispute => "resolve dispute",
            Action::CancelProject => "cancel project",
        };
        f.write_str(name)
    }
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Denied, with the authorization error to report.
    Denied(FreetunError),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Decision::Allowed => Ok(()),
            Decision::Denied(err) => Err(err),
        }
    }
}

/// Decide whether `actor` may attempt `action`.
pub fn authorize(actor: &Actor, action: Action) -> Decision {
    match actor.verification {
        VerificationStatus::Rejected => {
            return Decision::Denied(FreetunError::VerificationRejected(actor.id));
        }
        VerificationStatus::Pending if action.requires_verified() => {
            return Decision::Denied(FreetunError::NotVerified(actor.id));
        }
        VerificationStatus::Pending | VerificationStatus::Verified => {}
    }

    if !action.permits(actor.role) {
        return Decision::Denied(FreetunError::RoleNotPermitted {
            role: actor.role,
            action: action.to_string(),
        });
    }

    Decision::Allowed
}
