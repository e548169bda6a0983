//! Projects and their status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{ActorId, Currency, FreetunError, InvalidTransition, Money, ProjectId, Result};

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Accepting proposals.
    Open,
    /// A proposal was accepted; work and escrow are under way.
    InProgress,
    /// Funds released to the freelancer.
    Completed,
    /// Withdrawn by the client or refunded.
    Cancelled,
}

impl ProjectStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProjectStatus::Completed | ProjectStatus::Cancelled)
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[ProjectStatus] {
        match self {
            ProjectStatus::Open => &[ProjectStatus::InProgress, ProjectStatus::Cancelled],
            ProjectStatus::InProgress => &[ProjectStatus::Completed, ProjectStatus::Cancelled],
            ProjectStatus::Completed => &[],
            ProjectStatus::Cancelled => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: ProjectStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProjectStatus::Open => "open",
            ProjectStatus::InProgress => "in_progress",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// A project posted by a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    /// Owning client.
    pub client_id: ActorId,
    pub title: String,
    pub status: ProjectStatus,
    pub budget: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Project {
    /// Create a new open project.
    pub fn new(client_id: ActorId, title: impl Into<String>, budget: Money) -> Result<Self> {
        let title = title.into();
        if title.trim().is_empty() {
            return Err(FreetunError::validation("Title must not be empty", "title"));
        }
        if !budget.currency.is_valid() {
            return Err(FreetunError::validation(
                format!("Unknown currency code {}", budget.currency),
                "currency",
            ));
        }
        if !budget.is_positive() {
            return Err(FreetunError::validation("Budget must be positive", "budget"));
        }

        let now = Utc::now();
        Ok(Self {
            id: ProjectId::new(),
            client_id,
            title,
            status: ProjectStatus::Open,
            budget,
            created_at: now,
            updated_at: now,
        })
    }

    /// Currency all proposals and escrow for this project are held in.
    pub fn currency(&self) -> &Currency {
        &self.budget.currency
    }

    pub fn is_open(&self) -> bool {
        self.status == ProjectStatus::Open
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        next: ProjectStatus,
        at: DateTime<Utc>,
    ) -> std::result::Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition::new("project", self.status, next));
        }
        self.status = next;
        self.updated_at = at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget(minor: i64) -> Money {
        Money::new(minor, Currency::tnd())
    }

    #[test]
    fn test_project_creation() {
        let project = Project::new(ActorId::new(), "Logo design", budget(1_000_000)).unwrap();
        assert_eq!(project.status, ProjectStatus::Open);
        assert_eq!(project.currency(), &Currency::tnd());
    }

    #[test]
    fn test_project_rejects_bad_input() {
        let err = Project::new(ActorId::new(), "Logo", budget(0)).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = Project::new(ActorId::new(), "   ", budget(10)).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_valid_transitions() {
        let mut project = Project::new(ActorId::new(), "Site", budget(500)).unwrap();
        let now = Utc::now();
        assert!(project.transition_to(ProjectStatus::InProgress, now).is_ok());
        assert!(project.transition_to(ProjectStatus::Completed, now).is_ok());
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut project = Project::new(ActorId::new(), "Site", budget(500)).unwrap();
        let now = Utc::now();
        project.transition_to(ProjectStatus::Cancelled, now).unwrap();
        assert!(project.status.is_terminal());
        assert!(project.transition_to(ProjectStatus::Open, now).is_err());
        assert!(project.transition_to(ProjectStatus::InProgress, now).is_err());
    }

    #[test]
    fn test_cannot_skip_in_progress() {
        let mut project = Project::new(ActorId::new(), "Site", budget(500)).unwrap();
        assert!(project
            .transition_to(ProjectStatus::Completed, Utc::now())
            .is_err());
    }
}
