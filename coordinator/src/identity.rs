//! Identity verification lookups.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use freetun_common::{ActorId, FreetunError, Result, VerificationStatus};

/// Source of actors' verification status.
///
/// Queried at the start of every authorized action; answers are never cached
/// by the core.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Current verification status. Unknown actors are `UnknownActor`.
    async fn verification_status(&self, actor_id: ActorId) -> Result<VerificationStatus>;
}

/// In-memory identity directory.
#[derive(Default)]
pub struct StaticIdentityDirectory {
    statuses: DashMap<ActorId, VerificationStatus>,
}

impl StaticIdentityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or update an actor.
    pub fn set_status(&self, actor_id: ActorId, status: VerificationStatus) {
        let previous = self.statuses.insert(actor_id, status);
        if previous != Some(status) {
            info!(actor_id = %actor_id, status = %status, "Verification status set");
        }
    }

    /// Register an actor, builder style.
    pub fn with_actor(self, actor_id: ActorId, status: VerificationStatus) -> Self {
        self.set_status(actor_id, status);
        self
    }

    pub fn remove(&self, actor_id: &ActorId) -> Option<VerificationStatus> {
        self.statuses.remove(actor_id).map(|(_, status)| status)
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}

#[async_trait]
impl IdentityDirectory for StaticIdentityDirectory {
    async fn verification_status(&self, actor_id: ActorId) -> Result<VerificationStatus> {
        self.statuses
            .get(&actor_id)
            .map(|s| *s.value())
            .ok_or(FreetunError::UnknownActor(actor_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_is_read_fresh() {
        let actor = ActorId::new();
        let directory = StaticIdentityDirectory::new().with_actor(actor, VerificationStatus::Pending);
        assert_eq!(
            directory.verification_status(actor).await.unwrap(),
            VerificationStatus::Pending
        );

        directory.set_status(actor, VerificationStatus::Verified);
        assert_eq!(
            directory.verification_status(actor).await.unwrap(),
            VerificationStatus::Verified
        );
    }

    #[test]
    fn test_unknown_actor() {
        let directory = StaticIdentityDirectory::new();
        let actor = ActorId::new();
        let err = tokio_test::block_on(directory.verification_status(actor)).unwrap_err();
        assert_eq!(err, FreetunError::UnknownActor(actor));
        assert!(directory.is_empty());
    }
}
