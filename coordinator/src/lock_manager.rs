//! Per-project mutual exclusion for state-changing actions.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use freetun_common::{elapsed_ms, now, FreetunError, ProjectId, Result, Timestamp};

use crate::config::LockConfig;

type LockTable = Arc<DashMap<ProjectId, Arc<Mutex<()>>>>;

/// Drop the project's mutex if the table holds the last reference.
fn forget_if_idle(locks: &LockTable, project_id: &ProjectId) {
    locks.remove_if(project_id, |_, mutex| Arc::strong_count(mutex) == 1);
}

/// Exclusive right to change one project, held for the duration of an action.
///
/// Dropping the lease releases the project and forgets its mutex once no
/// other action is waiting on it.
pub struct ProjectLease {
    project_id: ProjectId,
    acquired_at: Timestamp,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl ProjectLease {
    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }
}

impl Drop for ProjectLease {
    fn drop(&mut self) {
        // Release first so the guard's reference no longer counts.
        drop(self.guard.take());
        forget_if_idle(&self.locks, &self.project_id);
        debug!(
            project_id = %self.project_id,
            held_ms = elapsed_ms(self.acquired_at),
            "Project lock released"
        );
    }
}

/// Hands out one async mutex per project id.
pub struct ProjectLockManager {
    locks: LockTable,
    config: LockConfig,
}

impl ProjectLockManager {
    /// Create a new lock manager.
    pub fn new(config: LockConfig) -> Self {
        Self {
            locks: Arc::new(DashMap::new()),
            config,
        }
    }

    fn mutex_for(&self, project_id: ProjectId) -> Arc<Mutex<()>> {
        self.locks
            .entry(project_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for the project lock, up to the configured timeout.
    pub async fn acquire(&self, project_id: ProjectId) -> Result<ProjectLease> {
        let mutex = self.mutex_for(project_id);

        let acquired =
            tokio::time::timeout(self.config.acquisition_timeout, mutex.lock_owned()).await;
        match acquired {
            Ok(guard) => {
                debug!(project_id = %project_id, "Project lock acquired");
                Ok(ProjectLease {
                    project_id,
                    acquired_at: now(),
                    guard: Some(guard),
                    locks: self.locks.clone(),
                })
            }
            Err(_) => {
                // The holder may have finished while we gave up.
                forget_if_idle(&self.locks, &project_id);
                warn!(
                    project_id = %project_id,
                    timeout_ms = self.config.acquisition_timeout.as_millis() as u64,
                    "Project lock timed out"
                );
                Err(FreetunError::ProjectBusy {
                    project_id,
                    retry_after_ms: self.config.retry_after.as_millis() as u64,
                })
            }
        }
    }

    /// Check if an action currently holds the project.
    pub fn is_locked(&self, project_id: &ProjectId) -> bool {
        self.locks
            .get(project_id)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Get count of held project locks.
    pub fn active_lock_count(&self) -> usize {
        self.locks.iter().filter(|m| m.try_lock().is_err()).count()
    }

    /// Number of projects with a tracked mutex.
    pub fn tracked_projects(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(timeout_ms: u64) -> ProjectLockManager {
        ProjectLockManager::new(LockConfig {
            acquisition_timeout: Duration::from_millis(timeout_ms),
            retry_after: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn test_lease_blocks_same_project() {
        let locks = manager(20);
        let project_id = ProjectId::new();

        let lease = locks.acquire(project_id).await.unwrap();
        assert!(locks.is_locked(&project_id));
        assert_eq!(locks.active_lock_count(), 1);

        let err = locks.acquire(project_id).await.err().unwrap();
        assert!(matches!(err, FreetunError::ProjectBusy { retry_after_ms: 10, .. }));
        assert!(err.is_retryable());

        drop(lease);
        assert!(!locks.is_locked(&project_id));
        assert!(locks.acquire(project_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_different_projects_do_not_contend() {
        let locks = manager(20);
        let _a = locks.acquire(ProjectId::new()).await.unwrap();
        let _b = locks.acquire(ProjectId::new()).await.unwrap();
        assert_eq!(locks.active_lock_count(), 2);
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let locks = Arc::new(manager(1_000));
        let project_id = ProjectId::new();
        let lease = locks.acquire(project_id).await.unwrap();

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire(project_id).await.map(|l| l.project_id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);

        assert_eq!(waiter.await.unwrap().unwrap(), project_id);
        assert_eq!(locks.tracked_projects(), 0);
    }

    #[tokio::test]
    async fn test_released_projects_are_forgotten() {
        let locks = manager(20);
        let held = ProjectId::new();
        let lease = locks.acquire(held).await.unwrap();
        drop(locks.acquire(ProjectId::new()).await.unwrap());

        assert_eq!(locks.tracked_projects(), 1);
        assert!(locks.is_locked(&held));

        // A timed-out waiter does not keep the entry alive.
        assert!(locks.acquire(held).await.is_err());
        assert_eq!(locks.tracked_projects(), 1);

        drop(lease);
        assert_eq!(locks.tracked_projects(), 0);
    }

    #[tokio::test]
    async fn test_mutex_kept_while_waiter_queued() {
        let locks = Arc::new(manager(1_000));
        let project_id = ProjectId::new();
        let lease = locks.acquire(project_id).await.unwrap();

        let (acquired_tx, acquired_rx) = tokio::sync::oneshot::channel();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let lease = locks.acquire(project_id).await.unwrap();
                acquired_tx.send(()).unwrap();
                release_rx.await.unwrap();
                drop(lease);
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(lease);

        acquired_rx.await.unwrap();
        assert_eq!(locks.tracked_projects(), 1);
        assert!(locks.is_locked(&project_id));

        release_tx.send(()).unwrap();
        waiter.await.unwrap();
        assert_eq!(locks.tracked_projects(), 0);
    }
}
