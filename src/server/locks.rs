//! Write Lock Manager
//!
//! Maps file names to the client currently allowed to modify them.
//! Locks live in memory only and have no expiry: a client that never
//! releases keeps the file locked until the server restarts.

use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

/// Per-file write locks shared by all connections
#[derive(Debug, Default)]
pub struct LockManager {
    /// filename -> owning client id
    table: Mutex<HashMap<String, String>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant `client_id` the write lock for `filename`
    ///
    /// Re-acquiring a lock the client already holds succeeds.
    pub async fn acquire(&self, filename: &str, client_id: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        match table.get(filename) {
            Some(owner) if owner != client_id => Err(Error::LockConflict {
                filename: filename.to_string(),
                owner: owner.clone(),
            }),
            _ => {
                table.insert(filename.to_string(), client_id.to_string());
                Ok(())
            }
        }
    }

    /// Give up the write lock `client_id` holds on `filename`
    pub async fn release(&self, filename: &str, client_id: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        match table.get(filename) {
            Some(owner) if owner == client_id => {
                table.remove(filename);
                Ok(())
            }
            _ => Err(Error::NotLockOwner {
                filename: filename.to_string(),
                client_id: client_id.to_string(),
            }),
        }
    }

    /// Current owner of `filename`, if locked
    pub async fn owner(&self, filename: &str) -> Option<String> {
        self.table.lock().await.get(filename).cloned()
    }

    /// Number of locks currently held
    pub async fn held_count(&self) -> usize {
        self.table.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StatusCode;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let locks = LockManager::new();
        locks.acquire("report.txt", "A").await.unwrap();
        assert_eq!(locks.owner("report.txt").await.as_deref(), Some("A"));

        locks.release("report.txt", "A").await.unwrap();
        assert_eq!(locks.owner("report.txt").await, None);
        assert_eq!(locks.held_count().await, 0);
    }

    #[tokio::test]
    async fn test_reacquire_by_owner_is_idempotent() {
        let locks = LockManager::new();
        locks.acquire("report.txt", "A").await.unwrap();
        locks.acquire("report.txt", "A").await.unwrap();
        assert_eq!(locks.held_count().await, 1);

        // No reentrancy counter: one release frees it
        locks.release("report.txt", "A").await.unwrap();
        assert_eq!(locks.owner("report.txt").await, None);
    }

    #[tokio::test]
    async fn test_conflict_until_released() {
        let locks = LockManager::new();
        locks.acquire("shared.bin", "A").await.unwrap();

        let err = locks.acquire("shared.bin", "B").await.unwrap_err();
        assert!(matches!(err, Error::LockConflict { ref owner, .. } if owner == "A"));
        assert_eq!(err.status_code(), StatusCode::FailedPrecondition);

        locks.release("shared.bin", "A").await.unwrap();
        locks.acquire("shared.bin", "B").await.unwrap();
        assert_eq!(locks.owner("shared.bin").await.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn test_release_without_lock_leaves_table_unchanged() {
        let locks = LockManager::new();
        locks.acquire("other.txt", "A").await.unwrap();

        let err = locks.release("report.txt", "A").await.unwrap_err();
        assert_eq!(err.status_code(), StatusCode::FailedPrecondition);
        assert_eq!(locks.held_count().await, 1);
        assert_eq!(locks.owner("other.txt").await.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn test_release_by_non_owner_rejected() {
        let locks = LockManager::new();
        locks.acquire("report.txt", "A").await.unwrap();

        let err = locks.release("report.txt", "B").await.unwrap_err();
        assert!(matches!(err, Error::NotLockOwner { .. }));
        assert_eq!(locks.owner("report.txt").await.as_deref(), Some("A"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_race_has_one_winner() {
        for _ in 0..50 {
            let locks = Arc::new(LockManager::new());
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let race = |client: &'static str| {
                let locks = locks.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    (client, locks.acquire("shared.bin", client).await)
                })
            };
            let (a, b) = tokio::join!(race("A"), race("B"));
            let results = [a.unwrap(), b.unwrap()];

            let winners: Vec<_> = results.iter().filter(|(_, r)| r.is_ok()).collect();
            assert_eq!(winners.len(), 1);
            let winner = winners[0].0;
            let loser = if winner == "A" { "B" } else { "A" };

            locks.release("shared.bin", winner).await.unwrap();
            locks.acquire("shared.bin", loser).await.unwrap();
        }
    }
}
