use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-user async locks serializing read-decide-write on the attendance log.
///
/// Scans for different users proceed in parallel; two scans resolving the
/// same user queue on that user's lock.
#[derive(Clone, Default)]
pub struct UserLocks {
    table: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the user's lock. Released when the guard drops.
    pub async fn lock(&self, user: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut table = self.table.lock().await;
            // Drop slots nobody holds or waits on.
            table.retain(|_, m| Arc::strong_count(m) > 1);
            table
                .entry(user.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    /// Users with a live lock slot.
    pub async fn active(&self) -> usize {
        self.table.lock().await.len()
    }
}
