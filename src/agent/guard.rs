//! Per-user round admission
//!
//! A user may have at most one round in flight. [`ActiveRounds`] is the
//! process-wide registry; [`RoundPermit`] marks the slot taken and frees it
//! on drop, so every exit path of a round (completion, failure,
//! cancellation, panic unwind) releases the user.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::{RelayError, Result};

/// Registry of users with a round in flight.
#[derive(Debug, Default)]
pub struct ActiveRounds {
    users: DashMap<String, ()>,
}

impl ActiveRounds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the user's slot.
    ///
    /// # Errors
    ///
    /// [`RelayError::ChatBusy`] when the user already holds a round. The
    /// check and the claim are one atomic step.
    pub fn acquire(self: &Arc<Self>, user_id: &str) -> Result<RoundPermit> {
        match self.users.entry(user_id.to_string()) {
            Entry::Occupied(_) => Err(RelayError::ChatBusy(user_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(RoundPermit {
                    rounds: Arc::clone(self),
                    user_id: user_id.to_string(),
                })
            }
        }
    }

    /// Whether the user currently holds a round.
    pub fn is_active(&self, user_id: &str) -> bool {
        self.users.contains_key(user_id)
    }

    /// Number of rounds in flight across all users.
    pub fn active_count(&self) -> usize {
        self.users.len()
    }
}

/// Holds a user's round slot; releases it when dropped.
#[derive(Debug)]
pub struct RoundPermit {
    rounds: Arc<ActiveRounds>,
    user_id: String,
}

impl RoundPermit {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Drop for RoundPermit {
    fn drop(&mut self) {
        self.rounds.users.remove(&self.user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_marks_user_active() {
        let rounds = Arc::new(ActiveRounds::new());
        let permit = rounds.acquire("u1").unwrap();

        assert!(rounds.is_active("u1"));
        assert_eq!(permit.user_id(), "u1");
        assert_eq!(rounds.active_count(), 1);
    }

    #[test]
    fn test_second_acquire_rejected() {
        let rounds = Arc::new(ActiveRounds::new());
        let _permit = rounds.acquire("u1").unwrap();

        let err = rounds.acquire("u1").unwrap_err();
        assert!(matches!(err, RelayError::ChatBusy(_)));
        assert!(err.to_string().contains("u1"));
    }

    #[test]
    fn test_drop_releases_slot() {
        let rounds = Arc::new(ActiveRounds::new());
        let permit = rounds.acquire("u1").unwrap();
        drop(permit);

        assert!(!rounds.is_active("u1"));
        assert!(rounds.acquire("u1").is_ok());
    }

    #[test]
    fn test_users_independent() {
        let rounds = Arc::new(ActiveRounds::new());
        let _a = rounds.acquire("u1").unwrap();
        let _b = rounds.acquire("u2").unwrap();

        assert_eq!(rounds.active_count(), 2);
        assert!(rounds.acquire("u1").is_err());
        assert!(rounds.acquire("u2").is_err());
    }

    #[tokio::test]
    async fn test_permit_released_across_task_boundary() {
        let rounds = Arc::new(ActiveRounds::new());
        let permit = rounds.acquire("u1").unwrap();

        let handle = tokio::spawn(async move {
            // the round runs here; the permit travels with it
            drop(permit);
        });
        handle.await.unwrap();

        assert!(!rounds.is_active("u1"));
    }
}
