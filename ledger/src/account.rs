//! Ledger accounts money moves between.

use freetun_common::{ActorId, ProjectId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// An account in the money journal.
///
/// Client and freelancer accounts mirror funds outside the platform; the
/// escrow account of a project holds what was captured and not yet paid out
/// or refunded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum LedgerAccount {
    /// Funds paid in by, or returned to, a client.
    Client(ActorId),
    /// Funds held for a project.
    Escrow(ProjectId),
    /// Funds paid out to a freelancer.
    Freelancer(ActorId),
}

impl LedgerAccount {
    /// Canonical string form, e.g. `escrow:<project id>`.
    pub fn canonical(&self) -> String {
        match self {
            LedgerAccount::Client(id) => format!("client:{}", id),
            LedgerAccount::Escrow(id) => format!("escrow:{}", id),
            LedgerAccount::Freelancer(id) => format!("freelancer:{}", id),
        }
    }

    /// The project this account is scoped to, for escrow accounts.
    pub fn project(&self) -> Option<ProjectId> {
        match self {
            LedgerAccount::Escrow(id) => Some(*id),
            _ => None,
        }
    }
}

impl fmt::Display for LedgerAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_form() {
        let project_id = ProjectId::new();
        let account = LedgerAccount::Escrow(project_id);
        assert_eq!(account.canonical(), format!("escrow:{}", project_id));
        assert_eq!(account.project(), Some(project_id));
        assert_eq!(LedgerAccount::Client(ActorId::new()).project(), None);
    }
}
