//! Per-game exclusive leases with a cancel flag.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::PipelineError;

#[derive(Debug, Default)]
pub struct GameLeases {
    active: Mutex<HashMap<i64, Arc<AtomicBool>>>,
}

impl GameLeases {
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> MutexGuard<'_, HashMap<i64, Arc<AtomicBool>>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Fails with `AnalysisInProgress` while another lease for the game is held.
    pub fn acquire(self: &Arc<Self>, game_id: i64) -> Result<GameLease, PipelineError> {
        let mut active = self.active();
        if active.contains_key(&game_id) {
            return Err(PipelineError::AnalysisInProgress(game_id));
        }
        let cancel = Arc::new(AtomicBool::new(false));
        active.insert(game_id, cancel.clone());
        Ok(GameLease {
            leases: self.clone(),
            game_id,
            cancel,
        })
    }

    /// Raise the cancel flag of a held lease; false when none is held.
    pub fn cancel(&self, game_id: i64) -> bool {
        match self.active().get(&game_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    pub fn is_held(&self, game_id: i64) -> bool {
        self.active().contains_key(&game_id)
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct GameLease {
    leases: Arc<GameLeases>,
    game_id: i64,
    cancel: Arc<AtomicBool>,
}

impl GameLease {
    pub fn game_id(&self) -> i64 {
        self.game_id
    }

    pub fn cancel_flag(&self) -> &AtomicBool {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }
}

impl Drop for GameLease {
    fn drop(&mut self) {
        self.leases.active().remove(&self.game_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_lease_for_same_game_is_refused() {
        let leases = Arc::new(GameLeases::new());
        let held = leases.acquire(7).unwrap();
        assert!(matches!(
            leases.acquire(7),
            Err(PipelineError::AnalysisInProgress(7))
        ));
        assert!(leases.acquire(8).is_ok());

        drop(held);
        assert!(!leases.is_held(7));
        assert!(leases.acquire(7).is_ok());
    }

    #[test]
    fn test_cancel_sets_flag_of_held_lease() {
        let leases = Arc::new(GameLeases::new());
        assert!(!leases.cancel(3));
        let lease = leases.acquire(3).unwrap();
        assert!(!lease.is_cancelled());
        assert!(leases.cancel(3));
        assert!(lease.is_cancelled());
    }
}
