//! Marketplace actors as seen by the escrow core.
//!
//! Identity and profile data live with the identity service. The core only
//! ever holds an id, the role asserted by the authenticated caller, and the
//! verification status pulled at decision time.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ActorId;

/// Marketplace role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Freelancer,
    Client,
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Freelancer => "freelancer",
            Role::Client => "client",
            Role::Admin => "admin",
        };
        f.write_str(name)
    }
}

/// Identity verification status, decided by the identity service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Submitted documents not yet reviewed.
    Pending,
    /// Identity confirmed.
    Verified,
    /// Identity check failed.
    Rejected,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VerificationStatus::Pending => "pending",
            VerificationStatus::Verified => "verified",
            VerificationStatus::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// The caller of an action, as authenticated by the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActorRef {
    pub id: ActorId,
    pub role: Role,
}

impl ActorRef {
    pub fn new(id: ActorId, role: Role) -> Self {
        Self { id, role }
    }

    pub fn client(id: ActorId) -> Self {
        Self::new(id, Role::Client)
    }

    pub fn freelancer(id: ActorId) -> Self {
        Self::new(id, Role::Freelancer)
    }

    pub fn admin(id: ActorId) -> Self {
        Self::new(id, Role::Admin)
    }

    /// Attach the verification status pulled for this decision.
    pub fn with_status(self, verification: VerificationStatus) -> Actor {
        Actor {
            id: self.id,
            role: self.role,
            verification,
        }
    }
}

/// Actor snapshot used for a single authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: ActorId,
    pub role: Role,
    pub verification: VerificationStatus,
}

impl Actor {
    pub fn caller(&self) -> ActorRef {
        ActorRef::new(self.id, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_values() {
        assert_eq!(
            serde_json::to_string(&VerificationStatus::Verified).unwrap(),
            "\"verified\""
        );
        assert_eq!(serde_json::to_string(&Role::Freelancer).unwrap(), "\"freelancer\"");
    }

    #[test]
    fn test_snapshot_keeps_identity() {
        let caller = ActorRef::client(ActorId::new());
        let actor = caller.with_status(VerificationStatus::Pending);
        assert_eq!(actor.caller(), caller);
        assert_eq!(actor.verification, VerificationStatus::Pending);
    }
}
