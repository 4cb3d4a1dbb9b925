//! The durable checkpoint record and the pluggable storage trait behind it.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::action::ActionTypeName;
use crate::error::{ExecResult, ExecutorError};

/// The durable representation of one action: its type, its serialized
/// payload, and whether it has finished executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointedAction {
    #[serde(rename = "ActionType")]
    pub action_type: ActionTypeName,
    #[serde(rename = "JsonAction")]
    pub json_action: String,
    #[serde(rename = "Completed")]
    pub completed: bool,
}

/// An ordered sequence of [`CheckpointedAction`] records — the entire
/// persisted state of an execution. Insertion order mirrors the order
/// actions were added.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(rename = "Actions")]
    pub actions: Vec<CheckpointedAction>,
}

impl Checkpoint {
    pub fn to_bytes(&self) -> ExecResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> ExecResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Caller-supplied durable storage for a single checkpoint blob.
///
/// `read` returns `None` for "no checkpoint present" (an empty byte
/// sequence is equivalent). `write(None)` deletes the checkpoint.
/// Implementations should durably persist (fsync-equivalent) before
/// returning success — see [`FileCheckpointer`] for the reference
/// implementation of that contract.
#[async_trait]
pub trait Checkpointer: Send + Sync + std::fmt::Debug {
    async fn read(&self) -> ExecResult<Option<Vec<u8>>>;
    async fn write(&self, blob: Option<&[u8]>) -> ExecResult<()>;
}

/// An in-memory [`Checkpointer`], useful for tests and for callers that
/// only need crash-free (not crash-resumable) durability within a process.
///
/// Retains every write it has seen, so tests can assert on the sequence of
/// checkpoints taken over the course of a run.
#[derive(Debug, Default)]
pub struct MemoryCheckpointer {
    current: Mutex<Option<Vec<u8>>>,
    history: Mutex<Vec<Option<Vec<u8>>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the checkpointer with an existing blob, as if a prior run had
    /// left it behind.
    pub fn seeded(blob: Vec<u8>) -> Self {
        Self {
            current: Mutex::new(Some(blob)),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Every blob (or `None` for a clear) written over the checkpointer's
    /// lifetime, oldest first.
    pub fn history(&self) -> Vec<Option<Vec<u8>>> {
        self.history.lock().expect("checkpointer lock poisoned").clone()
    }
}

#[async_trait]
impl Checkpointer for MemoryCheckpointer {
    async fn read(&self) -> ExecResult<Option<Vec<u8>>> {
        Ok(self.current.lock().expect("checkpointer lock poisoned").clone())
    }

    async fn write(&self, blob: Option<&[u8]>) -> ExecResult<()> {
        let value = blob.filter(|b| !b.is_empty()).map(|b| b.to_vec());
        let mut current = self.current.lock().expect("checkpointer lock poisoned");
        *current = value.clone();
        drop(current);
        self.history.lock().expect("checkpointer lock poisoned").push(value);
        Ok(())
    }
}

/// A [`Checkpointer`] that persists the blob to a single file on disk.
///
/// Writes go through a temp file in the same directory and an `fsync`
/// before the atomic rename, so a crash never observes a half-written
/// checkpoint — this is the fsync guarantee the original source left as a
/// `TODO`.
#[derive(Debug)]
pub struct FileCheckpointer {
    path: PathBuf,
}

impl FileCheckpointer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Checkpointer for FileCheckpointer {
    async fn read(&self) -> ExecResult<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ExecutorError::checkpointer(e)),
        }
    }

    async fn write(&self, blob: Option<&[u8]>) -> ExecResult<()> {
        match blob.filter(|b| !b.is_empty()) {
            None => match tokio::fs::remove_file(&self.path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(ExecutorError::checkpointer(e)),
            },
            Some(bytes) => {
                let tmp_path = self.path.with_extension("tmp");
                let mut file = tokio::fs::File::create(&tmp_path)
                    .await
                    .map_err(ExecutorError::checkpointer)?;
                file.write_all(bytes).await.map_err(ExecutorError::checkpointer)?;
                file.sync_all().await.map_err(ExecutorError::checkpointer)?;
                tokio::fs::rename(&tmp_path, &self.path)
                    .await
                    .map_err(ExecutorError::checkpointer)?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_checkpointer_tracks_history() {
        let cp = MemoryCheckpointer::new();
        assert_eq!(cp.read().await.unwrap(), None);
        cp.write(Some(b"one")).await.unwrap();
        cp.write(Some(b"two")).await.unwrap();
        cp.write(None).await.unwrap();
        assert_eq!(cp.read().await.unwrap(), None);
        assert_eq!(
            cp.history(),
            vec![Some(b"one".to_vec()), Some(b"two".to_vec()), None]
        );
    }

    #[tokio::test]
    async fn file_checkpointer_round_trips_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let cp = FileCheckpointer::new(&path);
        assert_eq!(cp.read().await.unwrap(), None);

        let checkpoint = Checkpoint {
            actions: vec![CheckpointedAction {
                action_type: ActionTypeName::new("Example"),
                json_action: "{}".to_string(),
                completed: false,
            }],
        };
        cp.write(Some(&checkpoint.to_bytes().unwrap())).await.unwrap();
        let restored = Checkpoint::from_bytes(&cp.read().await.unwrap().unwrap()).unwrap();
        assert_eq!(restored.actions.len(), 1);

        cp.write(None).await.unwrap();
        assert_eq!(cp.read().await.unwrap(), None);
    }
}
