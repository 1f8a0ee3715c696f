//! Persisted heartbeat sequence.
//!
//! The daemon drops heartbeats whose sequence number does not increase within
//! a boot, so an agent restarted on the same boot continues from its last
//! checkpoint. A new boot starts again at zero.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::Result;

const STATE_FILE: &str = "heartbeat.json";

/// Boot identity and next sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceState {
    /// Boot the sequence belongs to.
    pub boot_id: u64,
    /// Next sequence number to send.
    pub next_seq: u64,
}

/// File-backed [`SequenceState`].
#[derive(Debug)]
pub struct SequenceStore {
    path: PathBuf,
}

impl SequenceStore {
    /// Store the checkpoint under `state_dir`.
    #[must_use]
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(STATE_FILE),
        }
    }

    /// Resume the sequence for `boot_id`.
    ///
    /// Returns the state and whether this is a fresh boot.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the state directory cannot be created. An
    /// unreadable checkpoint is treated as a fresh boot.
    pub async fn resume(&self, boot_id: u64) -> Result<(SequenceState, bool)> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let stored = match fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice::<SequenceState>(&bytes).ok(),
            Err(_) => None,
        };
        match stored {
            Some(state) if state.boot_id == boot_id => Ok((state, false)),
            _ => Ok((
                SequenceState {
                    boot_id,
                    next_seq: 0,
                },
                true,
            )),
        }
    }

    /// Write the checkpoint atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub async fn save(&self, state: &SequenceState) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(state)?).await?;
        fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn same_boot_continues_the_sequence() {
        let dir = TempDir::new().unwrap();
        let store = SequenceStore::new(dir.path());

        let (state, fresh) = store.resume(7).await.unwrap();
        assert!(fresh);
        assert_eq!(state.next_seq, 0);

        store
            .save(&SequenceState {
                boot_id: 7,
                next_seq: 42,
            })
            .await
            .unwrap();

        let (state, fresh) = store.resume(7).await.unwrap();
        assert!(!fresh);
        assert_eq!(state.next_seq, 42);
    }

    #[tokio::test]
    async fn new_boot_starts_over() {
        let dir = TempDir::new().unwrap();
        let store = SequenceStore::new(dir.path());
        store
            .save(&SequenceState {
                boot_id: 7,
                next_seq: 42,
            })
            .await
            .unwrap();

        let (state, fresh) = store.resume(8).await.unwrap();
        assert!(fresh);
        assert_eq!(state, SequenceState { boot_id: 8, next_seq: 0 });
    }

    #[tokio::test]
    async fn corrupt_checkpoint_is_a_fresh_boot() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STATE_FILE), b"not json").await.unwrap();
        let (_, fresh) = SequenceStore::new(dir.path()).resume(1).await.unwrap();
        assert!(fresh);
    }
}
