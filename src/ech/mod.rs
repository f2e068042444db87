//! ECH configuration acquisition and shared state
//!
//! The config list is fetched once at startup and refreshed when a dial fails
//! with an ECH-tagged error. Readers take an `Arc` snapshot that stays valid
//! for the duration of one dial while a refresh swaps the shared copy.

pub mod doh;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::error::{Error, Result};

/// Shared ECH config list. Either empty-and-unusable or holding a complete
/// list; there is no partial state.
#[derive(Default)]
pub struct EchState {
    list: RwLock<Arc<Vec<u8>>>,
}

impl EchState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the config list and replace the shared copy.
    pub async fn prepare(&self, domain: &str, doh_server: &str) -> Result<()> {
        let raw = doh::query_ech_config(domain, doh_server).await?;
        info!("[ech] config loaded, {} bytes", raw.len());
        *self.list.write() = Arc::new(raw);
        Ok(())
    }

    /// Re-fetch after an ECH-tagged dial failure.
    pub async fn refresh(&self, domain: &str, doh_server: &str) -> Result<()> {
        info!("[ech] refreshing config");
        self.prepare(domain, doh_server).await
    }

    /// Snapshot for one dial. Fails when no config has been loaded.
    pub fn snapshot(&self) -> Result<Arc<Vec<u8>>> {
        let list = self.list.read().clone();
        if list.is_empty() {
            return Err(Error::Ech("ECH config not loaded".into()));
        }
        Ok(list)
    }

    pub fn is_loaded(&self) -> bool {
        !self.list.read().is_empty()
    }

    #[cfg(test)]
    pub fn set_for_test(&self, raw: Vec<u8>) {
        *self.list.write() = Arc::new(raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_requires_loaded_config() {
        let state = EchState::new();
        assert!(!state.is_loaded());
        assert!(state.snapshot().is_err());

        state.set_for_test(vec![1, 2, 3]);
        assert!(state.is_loaded());
        assert_eq!(*state.snapshot().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let state = EchState::new();
        state.set_for_test(vec![1]);
        let snap = state.snapshot().unwrap();
        state.set_for_test(vec![2]);
        // Old snapshot stays intact for the dial that took it
        assert_eq!(*snap, vec![1]);
        assert_eq!(*state.snapshot().unwrap(), vec![2]);
    }
}
