//! The two lifecycle stages and the repository mapping `(stage, block id)` to storage.
//!
//! Layout: `{data_dir}/received_blocks/{id}/...` and `{data_dir}/processed_blocks/{id}/...`.
//! A directory under a stage root is the only proof that the block is in that stage.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::blocks::store::{sanitize_segment, BlobStore};
use crate::error::{BlockError, BlockResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Received,
    Processed,
}

impl Stage {
    pub const ALL: [Stage; 2] = [Stage::Received, Stage::Processed];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Received => "received",
            Stage::Processed => "processed",
        }
    }

    /// Directory name of the stage root under the data directory.
    pub fn dir_name(self) -> &'static str {
        match self {
            Stage::Received => "received_blocks",
            Stage::Processed => "processed_blocks",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attach the stage to a `NotFound` so callers can tell which stage was searched.
fn scoped(stage: Stage, err: BlockError) -> BlockError {
    match err {
        BlockError::NotFound(what) => BlockError::NotFound(format!("{} in {} stage", what, stage)),
        other => other,
    }
}

#[derive(Debug, Clone)]
pub struct StageRepository {
    received: BlobStore,
    processed: BlobStore,
}

impl StageRepository {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref();
        Self {
            received: BlobStore::new(data_dir.join(Stage::Received.dir_name())),
            processed: BlobStore::new(data_dir.join(Stage::Processed.dir_name())),
        }
    }

    fn store(&self, stage: Stage) -> &BlobStore {
        match stage {
            Stage::Received => &self.received,
            Stage::Processed => &self.processed,
        }
    }

    pub fn ensure_stages(&self) -> BlockResult<()> {
        self.received.ensure_collection()?;
        self.processed.ensure_collection()
    }

    /// Create the block directory if needed and write (or overwrite) `files`.
    ///
    /// Every file name is checked before anything is written.
    pub fn put(&self, stage: Stage, block_id: &str, files: &[(String, Vec<u8>)]) -> BlockResult<()> {
        sanitize_segment("block id", block_id)?;
        for (name, _) in files {
            sanitize_segment("file name", name)?;
        }
        let store = self.store(stage);
        for (name, bytes) in files {
            store.write_file(block_id, name, bytes)?;
        }
        Ok(())
    }

    /// Replace the block directory with exactly `files` in one visible step.
    pub fn publish(&self, stage: Stage, block_id: &str, files: &[(String, Vec<u8>)]) -> BlockResult<()> {
        self.store(stage).publish_entry(block_id, files)
    }

    /// Block ids present in `stage`; empty if the stage root does not exist yet.
    pub fn list(&self, stage: Stage) -> BlockResult<Vec<String>> {
        self.store(stage).list_entries()
    }

    pub fn contains(&self, stage: Stage, block_id: &str) -> BlockResult<bool> {
        self.store(stage).contains(block_id)
    }

    pub fn list_files(&self, stage: Stage, block_id: &str) -> BlockResult<Vec<String>> {
        self.store(stage)
            .list_files(block_id)
            .map_err(|e| scoped(stage, e))
    }

    pub fn read_file(&self, stage: Stage, block_id: &str, name: &str) -> BlockResult<Vec<u8>> {
        self.store(stage)
            .read_file(block_id, name)
            .map_err(|e| scoped(stage, e))
    }

    /// Delete the whole block directory. `NotFound` if the block was absent.
    pub fn remove(&self, stage: Stage, block_id: &str) -> BlockResult<()> {
        self.store(stage)
            .remove_entry(block_id)
            .map_err(|e| scoped(stage, e))
    }

    /// Write `new_files` into `to`, then drop the block from `from`.
    ///
    /// The write must fully succeed before the source is touched: a crash in
    /// between leaves the block in both stages, never in neither. Returns whether
    /// a source copy existed and was removed.
    pub fn move_block(
        &self,
        block_id: &str,
        from: Stage,
        to: Stage,
        new_files: &[(String, Vec<u8>)],
    ) -> BlockResult<bool> {
        self.publish(to, block_id, new_files)?;
        match self.remove(from, block_id) {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Absolute directory of a block, for handing to out-of-process tools.
    pub fn block_path(&self, stage: Stage, block_id: &str) -> BlockResult<PathBuf> {
        let path = self.store(stage).entry_path(block_id)?;
        std::path::absolute(&path).map_err(|e| BlockError::io("resolve", &path, e))
    }

    /// Delete scratch directories in both stage roots.
    pub fn sweep_scratch(&self) -> BlockResult<usize> {
        Ok(self.received.sweep_scratch()? + self.processed.sweep_scratch()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(pairs: &[(&str, &[u8])]) -> Vec<(String, Vec<u8>)> {
        pairs
            .iter()
            .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
            .collect()
    }

    #[test]
    fn test_list_before_any_write_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = StageRepository::new(tmp.path());
        for stage in Stage::ALL {
            assert!(repo.list(stage).unwrap().is_empty());
        }
    }

    #[test]
    fn test_put_is_idempotent_per_file() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = StageRepository::new(tmp.path());

        repo.put(Stage::Received, "b1", &files(&[("p.jpg", b"one")])).unwrap();
        repo.put(Stage::Received, "b1", &files(&[("p.jpg", b"two")])).unwrap();

        assert_eq!(repo.list_files(Stage::Received, "b1").unwrap(), vec!["p.jpg"]);
        assert_eq!(repo.read_file(Stage::Received, "b1", "p.jpg").unwrap(), b"two");
        assert!(repo.list(Stage::Processed).unwrap().is_empty());
    }

    #[test]
    fn test_put_rejects_traversal_without_writing() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = StageRepository::new(tmp.path());

        let err = repo
            .put(Stage::Received, "b1", &files(&[("ok.jpg", b"x"), ("../secret", b"y")]))
            .unwrap_err();
        assert!(matches!(err, BlockError::InvalidKey { .. }));
        assert!(repo.list(Stage::Received).unwrap().is_empty());
        assert!(!tmp.path().join("secret").exists());
    }

    #[test]
    fn test_not_found_names_the_stage() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = StageRepository::new(tmp.path());
        let err = repo.list_files(Stage::Processed, "ghost").unwrap_err();
        assert_eq!(err.to_string(), "block ghost in processed stage not found");
    }

    #[test]
    fn test_move_writes_then_removes_source() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = StageRepository::new(tmp.path());
        repo.put(Stage::Received, "b1", &files(&[("p.jpg", b"photo")])).unwrap();

        let removed = repo
            .move_block("b1", Stage::Received, Stage::Processed, &files(&[("block.glb", b"mesh")]))
            .unwrap();

        assert!(removed);
        assert!(!repo.contains(Stage::Received, "b1").unwrap());
        assert_eq!(repo.read_file(Stage::Processed, "b1", "block.glb").unwrap(), b"mesh");
    }

    #[test]
    fn test_move_without_source_still_succeeds() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = StageRepository::new(tmp.path());

        let removed = repo
            .move_block("b1", Stage::Received, Stage::Processed, &files(&[("block.glb", b"mesh")]))
            .unwrap();

        assert!(!removed);
        assert_eq!(repo.list(Stage::Processed).unwrap(), vec!["b1"]);
    }

    #[test]
    fn test_move_leaves_source_when_write_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let repo = StageRepository::new(tmp.path());
        repo.put(Stage::Received, "b1", &files(&[("p.jpg", b"photo")])).unwrap();

        let err = repo
            .move_block("b1", Stage::Received, Stage::Processed, &files(&[("..", b"bad")]))
            .unwrap_err();

        assert!(matches!(err, BlockError::InvalidKey { .. }));
        assert!(repo.contains(Stage::Received, "b1").unwrap());
        assert!(!repo.contains(Stage::Processed, "b1").unwrap());
    }
}
