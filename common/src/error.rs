//! Error types for the FreeTun escrow core.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::{
    ActorId, EscrowStatus, GatewayOperation, MoneyError, ProjectId, ProjectStatus, ProposalId,
    Role, TransactionId,
};

/// Broad category of an error, deciding how callers react to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed input; rejected immediately.
    Validation,
    /// Caller may not perform the action; rejected immediately.
    Authorization,
    /// Domain state forbids the action; caller may re-fetch and retry.
    StateConflict,
    /// Referenced entity does not exist.
    NotFound,
    /// Gateway, storage or scheduling failure.
    External,
}

/// Main error type for escrow core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FreetunError {
    /// Malformed input.
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Amounts in different currencies, or arithmetic overflow.
    #[error("Invalid amount: {0}")]
    Money(#[from] MoneyError),

    /// Action requires a verified identity.
    #[error("Actor {0} is not verified")]
    NotVerified(ActorId),

    /// Actor failed identity verification.
    #[error("Actor {0} failed identity verification")]
    VerificationRejected(ActorId),

    /// Actor does not own the resource.
    #[error("Actor {actor} does not own {resource}")]
    NotOwner { actor: ActorId, resource: String },

    /// Actor's role may not perform the action.
    #[error("Role {role} may not {action}")]
    RoleNotPermitted { role: Role, action: String },

    /// Identity service does not know the actor.
    #[error("Unknown actor: {0}")]
    UnknownActor(ActorId),

    /// Project is not accepting proposals.
    #[error("Project {project_id} is not open (status {status})")]
    ProjectNotOpen {
        project_id: ProjectId,
        status: ProjectStatus,
    },

    /// Proposal is not pending or not part of the project.
    #[error("Proposal {0} is not pending on this project")]
    ProposalNotPending(ProposalId),

    /// Freelancer already has a pending proposal on the project.
    #[error("Freelancer {freelancer_id} already has a pending proposal on project {project_id}")]
    DuplicateProposal {
        project_id: ProjectId,
        freelancer_id: ActorId,
    },

    /// Escrow is not holding funds.
    #[error("Escrow {transaction_id} is {status}, not escrowed")]
    EscrowNotEscrowed {
        transaction_id: TransactionId,
        status: EscrowStatus,
    },

    /// A non-terminal escrow already exists for the project.
    #[error("Project {project_id} already has active escrow {transaction_id}")]
    EscrowAlreadyActive {
        project_id: ProjectId,
        transaction_id: TransactionId,
    },

    /// Release requested before delivery without mutual consent.
    #[error("Delivery not marked for project {0}")]
    DeliveryNotMarked(ProjectId),

    /// Refund requested without mutual consent or admin override.
    #[error("Refund of project {0} needs consent of both parties")]
    RefundConsentMissing(ProjectId),

    /// A dispute blocks the action.
    #[error("Project {0} has an open dispute")]
    DisputeOpen(ProjectId),

    /// Dispute resolution requested with no dispute raised.
    #[error("Project {0} has no open dispute")]
    NoDisputeOpen(ProjectId),

    /// A gateway call on the transaction awaits reconciliation.
    #[error("Transaction {transaction_id} awaits reconciliation of {operation}")]
    ReconciliationPending {
        transaction_id: TransactionId,
        operation: GatewayOperation,
    },

    /// Invalid state transition.
    #[error("{0}")]
    InvalidTransition(#[from] InvalidTransition),

    /// Write would break an aggregate invariant.
    #[error("Invariant violated on project {project_id}: {reason}")]
    InvariantViolation {
        project_id: ProjectId,
        reason: String,
    },

    /// Project not found.
    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),

    /// Proposal not found.
    #[error("Proposal not found: {0}")]
    ProposalNotFound(ProposalId),

    /// Transaction not found.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Project has no accepted proposal or no live escrow for the action.
    #[error("Project {0} has no active escrow")]
    NoActiveEscrow(ProjectId),

    /// Gateway declined the capture.
    #[error("Capture for {transaction_id} failed: {reason}")]
    GatewayCaptureFailed {
        transaction_id: TransactionId,
        reason: String,
    },

    /// Gateway declined the payout.
    #[error("Payout for {transaction_id} failed: {reason}")]
    GatewayPayoutFailed {
        transaction_id: TransactionId,
        reason: String,
    },

    /// Gateway declined the refund.
    #[error("Refund for {transaction_id} failed: {reason}")]
    GatewayRefundFailed {
        transaction_id: TransactionId,
        reason: String,
    },

    /// Gateway did not answer in time; outcome unknown.
    #[error("Gateway {operation} for {transaction_id} timed out")]
    GatewayTimeout {
        transaction_id: TransactionId,
        operation: GatewayOperation,
    },

    /// Gateway could not be reached; outcome unknown.
    #[error("Gateway {operation} for {transaction_id} unavailable: {reason}")]
    GatewayUnavailable {
        transaction_id: TransactionId,
        operation: GatewayOperation,
        reason: String,
    },

    /// Optimistic version check failed.
    #[error("Version conflict on project {project_id}: expected {expected}, found {actual}")]
    PersistenceConflict {
        project_id: ProjectId,
        expected: u64,
        actual: u64,
    },

    /// Another operation holds the project for too long.
    #[error("Project {project_id} busy, retry after {retry_after_ms}ms")]
    ProjectBusy {
        project_id: ProjectId,
        retry_after_ms: u64,
    },

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl FreetunError {
    /// Create a validation error for a field.
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        FreetunError::Validation {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FreetunError::Validation { .. } | FreetunError::Money(_) => ErrorKind::Validation,

            FreetunError::NotVerified(_)
            | FreetunError::VerificationRejected(_)
            | FreetunError::NotOwner { .. }
            | FreetunError::RoleNotPermitted { .. }
            | FreetunError::UnknownActor(_) => ErrorKind::Authorization,

            FreetunError::ProjectNotOpen { .. }
            | FreetunError::ProposalNotPending(_)
            | FreetunError::DuplicateProposal { .. }
            | FreetunError::EscrowNotEscrowed { .. }
            | FreetunError::EscrowAlreadyActive { .. }
            | FreetunError::DeliveryNotMarked(_)
            | FreetunError::RefundConsentMissing(_)
            | FreetunError::DisputeOpen(_)
            | FreetunError::NoDisputeOpen(_)
            | FreetunError::ReconciliationPending { .. }
            | FreetunError::InvalidTransition(_)
            | FreetunError::InvariantViolation { .. } => ErrorKind::StateConflict,

            FreetunError::ProjectNotFound(_)
            | FreetunError::ProposalNotFound(_)
            | FreetunError::TransactionNotFound(_)
            | FreetunError::NoActiveEscrow(_) => ErrorKind::NotFound,

            FreetunError::GatewayCaptureFailed { .. }
            | FreetunError::GatewayPayoutFailed { .. }
            | FreetunError::GatewayRefundFailed { .. }
            | FreetunError::GatewayTimeout { .. }
            | FreetunError::GatewayUnavailable { .. }
            | FreetunError::PersistenceConflict { .. }
            | FreetunError::ProjectBusy { .. }
            | FreetunError::Storage(_) => ErrorKind::External,
        }
    }

    /// Check if the caller may retry the same action unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FreetunError::PersistenceConflict { .. } | FreetunError::ProjectBusy { .. }
        )
    }

    /// Get suggested retry delay in milliseconds.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            FreetunError::ProjectBusy { retry_after_ms, .. } => Some(*retry_after_ms),
            FreetunError::PersistenceConflict { .. } => Some(50),
            _ => None,
        }
    }

    /// Stable error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            FreetunError::Validation { .. } => "VALIDATION_ERROR",
            FreetunError::Money(_) => "INVALID_AMOUNT",
            FreetunError::NotVerified(_) => "NOT_VERIFIED",
            FreetunError::VerificationRejected(_) => "VERIFICATION_REJECTED",
            FreetunError::NotOwner { .. } => "NOT_OWNER",
            FreetunError::RoleNotPermitted { .. } => "ROLE_NOT_PERMITTED",
            FreetunError::UnknownActor(_) => "UNKNOWN_ACTOR",
            FreetunError::ProjectNotOpen { .. } => "PROJECT_NOT_OPEN",
            FreetunError::ProposalNotPending(_) => "PROPOSAL_NOT_PENDING",
            FreetunError::DuplicateProposal { .. } => "DUPLICATE_PROPOSAL",
            FreetunError::EscrowNotEscrowed { .. } => "ESCROW_NOT_ESCROWED",
            FreetunError::EscrowAlreadyActive { .. } => "ESCROW_ALREADY_ACTIVE",
            FreetunError::DeliveryNotMarked(_) => "DELIVERY_NOT_MARKED",
            FreetunError::RefundConsentMissing(_) => "REFUND_CONSENT_MISSING",
            FreetunError::DisputeOpen(_) => "DISPUTE_OPEN",
            FreetunError::NoDisputeOpen(_) => "NO_DISPUTE_OPEN",
            FreetunError::ReconciliationPending { .. } => "RECONCILIATION_PENDING",
            FreetunError::InvalidTransition(_) => "INVALID_TRANSITION",
            FreetunError::InvariantViolation { .. } => "INVARIANT_VIOLATION",
            FreetunError::ProjectNotFound(_) => "PROJECT_NOT_FOUND",
            FreetunError::ProposalNotFound(_) => "PROPOSAL_NOT_FOUND",
            FreetunError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            FreetunError::NoActiveEscrow(_) => "NO_ACTIVE_ESCROW",
            FreetunError::GatewayCaptureFailed { .. } => "GATEWAY_CAPTURE_FAILED",
            FreetunError::GatewayPayoutFailed { .. } => "GATEWAY_PAYOUT_FAILED",
            FreetunError::GatewayRefundFailed { .. } => "GATEWAY_REFUND_FAILED",
            FreetunError::GatewayTimeout { .. } => "GATEWAY_TIMEOUT",
            FreetunError::GatewayUnavailable { .. } => "GATEWAY_UNAVAILABLE",
            FreetunError::PersistenceConflict { .. } => "PERSISTENCE_CONFLICT",
            FreetunError::ProjectBusy { .. } => "PROJECT_BUSY",
            FreetunError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// User-facing rejection for this error.
    pub fn rejection(&self) -> RejectionReason {
        let reason = RejectionReason::new(self.kind(), self.error_code(), self.to_string());
        match self {
            FreetunError::Validation {
                field: Some(field), ..
            } => reason.with_field(field.clone()),
            _ => reason,
        }
    }
}

/// Result type alias for escrow core operations.
pub type Result<T> = std::result::Result<T, FreetunError>;

/// Stable, serializable description of a rejected operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionReason {
    pub kind: ErrorKind,
    /// Error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Field that caused rejection (if applicable).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl RejectionReason {
    /// Create a new rejection reason.
    pub fn new(kind: ErrorKind, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: code.into(),
            message: message.into(),
            field: None,
        }
    }

    /// Attach the offending field.
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// JSON body for API layers.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "status": "error",
            "code": self.code,
            "message": self.message,
            "kind": self.kind,
            "field": self.field,
        })
    }
}

/// Error when attempting an invalid state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    /// Kind of entity ("project", "proposal", "escrow").
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

impl InvalidTransition {
    pub fn new(entity: &'static str, from: impl fmt::Display, to: impl fmt::Display) -> Self {
        Self {
            entity,
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid {} transition from {} to {}",
            self.entity, self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let project_id = ProjectId::new();
        assert_eq!(
            FreetunError::NotVerified(ActorId::new()).kind(),
            ErrorKind::Authorization
        );
        assert_eq!(
            FreetunError::DisputeOpen(project_id).kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(
            FreetunError::GatewayTimeout {
                transaction_id: TransactionId::new(),
                operation: GatewayOperation::Payout,
            }
            .kind(),
            ErrorKind::External
        );
    }

    #[test]
    fn test_only_contention_is_retryable() {
        let conflict = FreetunError::PersistenceConflict {
            project_id: ProjectId::new(),
            expected: 3,
            actual: 4,
        };
        assert!(conflict.is_retryable());
        assert!(!FreetunError::ProposalNotPending(ProposalId::new()).is_retryable());
        assert!(!FreetunError::GatewayCaptureFailed {
            transaction_id: TransactionId::new(),
            reason: "declined".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_rejection_carries_field() {
        let err = FreetunError::validation("Budget must be positive", "budget");
        let rejection = err.rejection();
        assert_eq!(rejection.code, "VALIDATION_ERROR");
        assert_eq!(rejection.field.as_deref(), Some("budget"));

        let body = rejection.to_json();
        assert_eq!(body["status"], "error");
        assert_eq!(body["kind"], "validation");
    }

    #[test]
    fn test_money_errors_are_validation() {
        let err: FreetunError = MoneyError::Overflow.into();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.error_code(), "INVALID_AMOUNT");
    }
}
