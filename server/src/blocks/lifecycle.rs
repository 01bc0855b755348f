//! Request-facing orchestration of the block state machine.
//!
//! ```text
//!   intake            promote                expel / reap
//!  ───────▶ Received ─────────▶ Processed ─────────────────▶ (deleted)
//!                      ▲
//!          promote ────┘ (direct artifact upload, no received copy)
//! ```
//!
//! All methods do blocking filesystem I/O; async callers go through
//! `tokio::task::spawn_blocking`. Every transition on a block id runs under that
//! id's lock, so promotion and reaping of the same block never interleave.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::blocks::locks::BlockLocks;
use crate::blocks::model::{BlockPayload, ValidatedBlock, ARTIFACT_FILE, CREATED_AT_FILE};
use crate::blocks::stage::{Stage, StageRepository};
use crate::blocks::store::sanitize_segment;
use crate::error::{BlockError, BlockResult};

#[derive(Debug, Clone, Serialize)]
pub struct PromotionReceipt {
    pub block_id: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the stored artifact
    pub sha256: String,
    pub created_at: i64,
    /// Whether a received copy existed and was removed
    pub replaced_received: bool,
}

/// Outcome of checking one processed block against the retention lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapDecision {
    Reaped { age_secs: i64 },
    Kept { age_secs: i64 },
    Skipped(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub swept_scratch: usize,
    pub duplicates_resolved: usize,
}

pub struct LifecycleController {
    repo: StageRepository,
    locks: BlockLocks,
}

impl LifecycleController {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            repo: StageRepository::new(data_dir),
            locks: BlockLocks::new(),
        }
    }

    pub fn repository(&self) -> &StageRepository {
        &self.repo
    }

    /// Create both stage roots.
    pub fn init(&self) -> BlockResult<()> {
        self.repo.ensure_stages()
    }

    // --- Intake ---

    /// Validate one payload and write it into the received stage.
    pub fn intake(&self, payload: BlockPayload) -> BlockResult<String> {
        let block = payload.validate()?;
        self.store_received(block)
    }

    /// Validate every payload first, then write them in order.
    ///
    /// A malformed block rejects the whole batch before anything is written. A
    /// storage failure midway leaves the earlier blocks in place.
    pub fn intake_batch(&self, payloads: Vec<BlockPayload>) -> BlockResult<Vec<String>> {
        let validated = payloads
            .into_iter()
            .map(BlockPayload::validate)
            .collect::<BlockResult<Vec<_>>>()?;

        validated
            .into_iter()
            .map(|block| self.store_received(block))
            .collect()
    }

    fn store_received(&self, block: ValidatedBlock) -> BlockResult<String> {
        let block_id = block.id().to_string();
        let files = block.into_files()?;
        self.locks.with_lock(&block_id, || {
            self.repo.put(Stage::Received, &block_id, &files)
        })?;
        tracing::info!("Received block {} ({} files)", block_id, files.len());
        Ok(block_id)
    }

    /// Add or overwrite files of a block that is still in the received stage.
    pub fn attach_received_files(
        &self,
        block_id: &str,
        files: &[(String, Vec<u8>)],
    ) -> BlockResult<()> {
        self.locks.with_lock(block_id, || {
            if !self.repo.contains(Stage::Received, block_id)? {
                return Err(BlockError::NotFound(format!("block {} in received stage", block_id)));
            }
            self.repo.put(Stage::Received, block_id, files)
        })
    }

    /// Absolute directory of a received block.
    pub fn received_path(&self, block_id: &str) -> BlockResult<PathBuf> {
        self.repo.block_path(Stage::Received, block_id)
    }

    // --- Promotion ---

    /// Store `artifact` as the processed copy of `block_id`, stamped with the current time.
    pub fn promote(&self, block_id: &str, artifact: &[u8]) -> BlockResult<PromotionReceipt> {
        self.promote_at(block_id, artifact, Utc::now().timestamp())
    }

    /// Promote with an explicit creation timestamp (seconds since epoch).
    ///
    /// Artifact and timestamp become visible together; the received copy is removed
    /// only after that, and its absence is not an error.
    pub fn promote_at(
        &self,
        block_id: &str,
        artifact: &[u8],
        created_at: i64,
    ) -> BlockResult<PromotionReceipt> {
        sanitize_segment("block id", block_id)?;
        if artifact.is_empty() {
            return Err(BlockError::Validation(format!(
                "artifact for block {} is empty",
                block_id
            )));
        }

        let files = vec![
            (ARTIFACT_FILE.to_string(), artifact.to_vec()),
            (CREATED_AT_FILE.to_string(), created_at.to_string().into_bytes()),
        ];
        let replaced_received = self.locks.with_lock(block_id, || {
            self.repo
                .move_block(block_id, Stage::Received, Stage::Processed, &files)
        })?;

        let receipt = PromotionReceipt {
            block_id: block_id.to_string(),
            size: artifact.len() as u64,
            sha256: hex::encode(Sha256::digest(artifact)),
            created_at,
            replaced_received,
        };
        tracing::info!(
            "Promoted block {} ({} bytes, sha256 {})",
            block_id,
            receipt.size,
            receipt.sha256
        );
        Ok(receipt)
    }

    // --- Retrieval ---

    pub fn list(&self, stage: Stage) -> BlockResult<Vec<String>> {
        self.repo.list(stage)
    }

    /// Stage holding `block_id`: the requested one, else processed before received.
    fn locate(&self, stage: Option<Stage>, block_id: &str) -> BlockResult<Stage> {
        sanitize_segment("block id", block_id)?;
        if let Some(stage) = stage {
            return Ok(stage);
        }
        for stage in [Stage::Processed, Stage::Received] {
            if self.repo.contains(stage, block_id)? {
                return Ok(stage);
            }
        }
        Err(BlockError::NotFound(format!("block {}", block_id)))
    }

    pub fn list_files(
        &self,
        stage: Option<Stage>,
        block_id: &str,
    ) -> BlockResult<(Stage, Vec<String>)> {
        let stage = self.locate(stage, block_id)?;
        Ok((stage, self.repo.list_files(stage, block_id)?))
    }

    pub fn read_file(
        &self,
        stage: Option<Stage>,
        block_id: &str,
        name: &str,
    ) -> BlockResult<(Stage, Vec<u8>)> {
        sanitize_segment("file name", name)?;
        let stage = self.locate(stage, block_id)?;
        Ok((stage, self.repo.read_file(stage, block_id, name)?))
    }

    // --- Deletion ---

    /// Caller-initiated deletion of a processed block.
    pub fn expel(&self, block_id: &str) -> BlockResult<()> {
        sanitize_segment("block id", block_id)?;
        self.locks
            .with_lock(block_id, || self.repo.remove(Stage::Processed, block_id))?;
        tracing::info!("Deleted processed block {}", block_id);
        Ok(())
    }

    /// Delete a processed block if it is older than `lifetime_secs` at `now`.
    ///
    /// The timestamp read and the delete happen under the block's lock, so a
    /// concurrent re-promotion is never deleted on the strength of a stale
    /// timestamp. Missing or unparsable timestamps are skipped, not deleted.
    pub fn reap(&self, block_id: &str, lifetime_secs: u64, now: i64) -> BlockResult<ReapDecision> {
        sanitize_segment("block id", block_id)?;
        self.locks.with_lock(block_id, || {
            let raw = match self.repo.read_file(Stage::Processed, block_id, CREATED_AT_FILE) {
                Ok(raw) => raw,
                Err(e) if e.is_not_found() => {
                    return Ok(ReapDecision::Skipped(format!("no timestamp: {}", e)));
                }
                Err(e) => return Err(e),
            };

            let text = String::from_utf8_lossy(&raw);
            let Ok(created_at) = text.trim().parse::<i64>() else {
                return Ok(ReapDecision::Skipped(format!(
                    "unparsable timestamp {:?}",
                    text.trim()
                )));
            };

            let age_secs = now.saturating_sub(created_at);
            if age_secs <= i64::try_from(lifetime_secs).unwrap_or(i64::MAX) {
                return Ok(ReapDecision::Kept { age_secs });
            }

            self.repo.remove(Stage::Processed, block_id)?;
            Ok(ReapDecision::Reaped { age_secs })
        })
    }

    // --- Recovery ---

    /// Clean up after an unclean shutdown.
    ///
    /// Sweeps scratch directories and drops received copies of blocks whose
    /// processed copy is complete, i.e. promotions interrupted between the write
    /// and the delete.
    pub fn reconcile(&self) -> BlockResult<ReconcileReport> {
        let mut report = ReconcileReport {
            swept_scratch: self.repo.sweep_scratch()?,
            ..ReconcileReport::default()
        };

        let processed: HashSet<String> = self.repo.list(Stage::Processed)?.into_iter().collect();
        for block_id in self.repo.list(Stage::Received)? {
            if !processed.contains(&block_id) {
                continue;
            }
            let resolved = self.locks.with_lock(&block_id, || {
                let files = match self.repo.list_files(Stage::Processed, &block_id) {
                    Ok(files) => files,
                    Err(e) if e.is_not_found() => return Ok(false),
                    Err(e) => return Err(e),
                };
                let complete = [ARTIFACT_FILE, CREATED_AT_FILE]
                    .iter()
                    .all(|name| files.iter().any(|f| f == name));
                if !complete {
                    return Ok(false);
                }
                match self.repo.remove(Stage::Received, &block_id) {
                    Ok(()) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            })?;
            if resolved {
                tracing::info!("Removed stale received copy of processed block {}", block_id);
                report.duplicates_resolved += 1;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::model::{BlockDimensions, BlockPhoto, METADATA_FILE};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn payload(id: &str) -> BlockPayload {
        BlockPayload {
            id: id.to_string(),
            custom_id: format!("custom-{}", id),
            dimensions: BlockDimensions {
                width: 1.0,
                height: 2.0,
                length: 3.0,
            },
            photos: vec![BlockPhoto {
                filename: "front.jpg".to_string(),
                base64: STANDARD.encode(format!("photo of {}", id)),
            }],
        }
    }

    fn controller() -> (tempfile::TempDir, LifecycleController) {
        let tmp = tempfile::tempdir().unwrap();
        let controller = LifecycleController::new(tmp.path());
        controller.init().unwrap();
        (tmp, controller)
    }

    #[test]
    fn test_intake_then_retrieve_bytes() {
        let (_tmp, controller) = controller();
        controller.intake(payload("B1")).unwrap();

        assert_eq!(controller.list(Stage::Received).unwrap(), vec!["B1"]);
        let (stage, files) = controller.list_files(None, "B1").unwrap();
        assert_eq!(stage, Stage::Received);
        assert_eq!(files, vec![METADATA_FILE, "front.jpg"]);
        let (_, bytes) = controller.read_file(None, "B1", "front.jpg").unwrap();
        assert_eq!(bytes, b"photo of B1");
    }

    #[test]
    fn test_batch_with_bad_block_writes_nothing() {
        let (_tmp, controller) = controller();
        let err = controller
            .intake_batch(vec![payload("B1"), payload("../../etc")])
            .unwrap_err();
        assert!(matches!(err, BlockError::InvalidKey { .. }));
        assert!(controller.list(Stage::Received).unwrap().is_empty());
    }

    #[test]
    fn test_promote_moves_block() {
        let (_tmp, controller) = controller();
        controller.intake(payload("B1")).unwrap();

        let receipt = controller.promote("B1", b"glb bytes").unwrap();

        assert!(receipt.replaced_received);
        assert_eq!(receipt.size, 9);
        assert_eq!(receipt.sha256, hex::encode(Sha256::digest(b"glb bytes")));
        assert!(controller.list(Stage::Received).unwrap().is_empty());
        assert_eq!(controller.list(Stage::Processed).unwrap(), vec!["B1"]);
        let (stage, bytes) = controller.read_file(None, "B1", ARTIFACT_FILE).unwrap();
        assert_eq!(stage, Stage::Processed);
        assert_eq!(bytes, b"glb bytes");
    }

    #[test]
    fn test_promote_without_received_copy() {
        let (_tmp, controller) = controller();
        let receipt = controller.promote("direct", b"glb").unwrap();
        assert!(!receipt.replaced_received);
        assert_eq!(controller.list(Stage::Processed).unwrap(), vec!["direct"]);
    }

    #[test]
    fn test_promote_rejects_empty_artifact() {
        let (_tmp, controller) = controller();
        let err = controller.promote("B1", b"").unwrap_err();
        assert!(matches!(err, BlockError::Validation(_)));
    }

    #[test]
    fn test_expel_twice() {
        let (_tmp, controller) = controller();
        controller.promote("B1", b"glb").unwrap();

        controller.expel("B1").unwrap();
        assert!(controller.expel("B1").unwrap_err().is_not_found());
    }

    #[test]
    fn test_expel_ignores_received_blocks() {
        let (_tmp, controller) = controller();
        controller.intake(payload("B1")).unwrap();
        assert!(controller.expel("B1").unwrap_err().is_not_found());
        assert_eq!(controller.list(Stage::Received).unwrap(), vec!["B1"]);
    }

    #[test]
    fn test_reap_honours_lifetime_boundary() {
        let (_tmp, controller) = controller();
        let now = 1_700_000_000;
        controller.promote_at("old", b"glb", now - 300 - 1).unwrap();
        controller.promote_at("young", b"glb", now - 300 + 1).unwrap();

        assert_eq!(
            controller.reap("old", 300, now).unwrap(),
            ReapDecision::Reaped { age_secs: 301 }
        );
        assert_eq!(
            controller.reap("young", 300, now).unwrap(),
            ReapDecision::Kept { age_secs: 299 }
        );
        assert_eq!(controller.list(Stage::Processed).unwrap(), vec!["young"]);
    }

    #[test]
    fn test_reap_skips_bad_timestamp() {
        let (_tmp, controller) = controller();
        controller.promote_at("B1", b"glb", 0).unwrap();
        controller
            .repository()
            .put(
                Stage::Processed,
                "B1",
                &[(CREATED_AT_FILE.to_string(), b"yesterday".to_vec())],
            )
            .unwrap();

        let decision = controller.reap("B1", 1, i64::MAX).unwrap();
        assert!(matches!(decision, ReapDecision::Skipped(_)));
        assert_eq!(controller.list(Stage::Processed).unwrap(), vec!["B1"]);
    }

    #[test]
    fn test_reconcile_drops_stale_received_copy() {
        let (_tmp, controller) = controller();
        controller.promote("B1", b"glb").unwrap();
        // Simulate a crash between the processed write and the received delete.
        controller.intake(payload("B1")).unwrap();
        controller.intake(payload("B2")).unwrap();

        let report = controller.reconcile().unwrap();

        assert_eq!(report.duplicates_resolved, 1);
        assert_eq!(controller.list(Stage::Received).unwrap(), vec!["B2"]);
        assert_eq!(controller.list(Stage::Processed).unwrap(), vec!["B1"]);
    }

    #[test]
    fn test_long_id_survives_whole_lifecycle() {
        let (_tmp, controller) = controller();
        let id = "b".repeat(240);
        controller.intake(payload(&id)).unwrap();

        controller.promote_at(&id, b"glb", 0).unwrap();
        assert!(controller.list(Stage::Received).unwrap().is_empty());
        assert_eq!(
            controller.reap(&id, 300, 1_000).unwrap(),
            ReapDecision::Reaped { age_secs: 1_000 }
        );

        controller.promote(&id, b"glb").unwrap();
        controller.expel(&id).unwrap();
        assert!(controller.list(Stage::Processed).unwrap().is_empty());
    }

    #[test]
    fn test_promote_and_reap_serialize_on_same_block() {
        let (_tmp, controller) = controller();
        let controller = Arc::new(controller);
        let now = 1_700_000_000;
        let done = Arc::new(AtomicBool::new(false));
        let reaped = Arc::new(AtomicUsize::new(0));

        let promoter = {
            let controller = controller.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    controller.promote_at("B1", b"glb", now - 1_000).unwrap();
                }
            })
        };
        let reaper = {
            let controller = controller.clone();
            let done = done.clone();
            let reaped = reaped.clone();
            thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    match controller.reap("B1", 300, now).unwrap() {
                        ReapDecision::Reaped { .. } => {
                            reaped.fetch_add(1, Ordering::SeqCst);
                        }
                        ReapDecision::Skipped(reason) => {
                            assert!(reason.starts_with("no timestamp"), "{}", reason);
                        }
                        ReapDecision::Kept { .. } => panic!("expired block kept"),
                    }
                }
            })
        };
        let observer = {
            let controller = controller.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut seen = 0;
                while !done.load(Ordering::SeqCst) {
                    let listing = controller.locks.with_lock("B1", || {
                        controller.repo.list_files(Stage::Processed, "B1")
                    });
                    match listing {
                        Ok(files) => {
                            assert_eq!(files, vec![ARTIFACT_FILE, CREATED_AT_FILE]);
                            seen += 1;
                        }
                        Err(e) => assert!(e.is_not_found(), "{}", e),
                    }
                }
                seen
            })
        };

        promoter.join().unwrap();
        // The last promotion is expired too, so the reaper gets at least one hit.
        for _ in 0..500 {
            if reaped.load(Ordering::SeqCst) > 0 {
                break;
            }
            thread::sleep(std::time::Duration::from_millis(10));
        }
        done.store(true, Ordering::SeqCst);
        reaper.join().unwrap();
        observer.join().unwrap();

        assert!(reaped.load(Ordering::SeqCst) > 0);
        assert_eq!(controller.repository().sweep_scratch().unwrap(), 0);
        if let Ok((_, files)) = controller.list_files(Some(Stage::Processed), "B1") {
            assert_eq!(files, vec![ARTIFACT_FILE, CREATED_AT_FILE]);
        }
    }
}
