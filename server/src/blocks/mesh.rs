//! Out-of-process mesh generation for received blocks.
//!
//! Invocation: `<command> --background --python <script> -- --block_dir=<dir>`.
//! The tool is expected to write `block.glb` into the block directory. Its
//! stdout/stderr are kept next to the inputs for diagnosis, and a successful
//! artifact is promoted exactly like an uploaded one.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::blocks::lifecycle::{LifecycleController, PromotionReceipt};
use crate::blocks::model::ARTIFACT_FILE;
use crate::blocks::stage::Stage;
use crate::config::MeshConfig;
use crate::error::{BlockError, BlockResult};

pub const STDOUT_LOG_FILE: &str = "backend_blender_stdout.txt";
pub const STDERR_LOG_FILE: &str = "backend_blender_stderr.txt";
/// Log the generator script itself may leave behind.
pub const SCRIPT_LOG_FILE: &str = "blender_script_log.txt";

#[derive(Debug, Clone)]
pub struct MeshGenerator {
    command: String,
    script_path: PathBuf,
}

impl MeshGenerator {
    pub fn new(config: &MeshConfig) -> Self {
        let script_path =
            std::path::absolute(&config.script_path).unwrap_or_else(|_| config.script_path.clone());
        Self {
            command: config.command.clone(),
            script_path,
        }
    }

    fn command_for(&self, block_dir: &Path) -> Command {
        let mut command = Command::new(&self.command);
        command
            .arg("--background")
            .arg("--python")
            .arg(&self.script_path)
            .arg("--")
            .arg(format!("--block_dir={}", block_dir.display()));
        command
    }

    /// Run the generator for a received block and promote its artifact.
    ///
    /// Blocks until the tool exits. Fails with `ExternalTool` when the tool cannot
    /// be started or leaves no artifact; the message carries the captured output.
    pub fn generate(
        &self,
        controller: &LifecycleController,
        block_id: &str,
    ) -> BlockResult<PromotionReceipt> {
        let block_dir = controller.received_path(block_id)?;
        tracing::info!("Running mesh generator for block {}", block_id);

        let output = self.command_for(&block_dir).output().map_err(|e| {
            BlockError::ExternalTool(format!("could not start {}: {}", self.command, e))
        })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        controller.attach_received_files(
            block_id,
            &[
                (STDOUT_LOG_FILE.to_string(), stdout.clone().into_bytes()),
                (STDERR_LOG_FILE.to_string(), stderr.clone().into_bytes()),
            ],
        )?;

        let artifact = match controller.read_file(Some(Stage::Received), block_id, ARTIFACT_FILE) {
            Ok((_, artifact)) => artifact,
            Err(e) if e.is_not_found() => {
                let mut message = format!(
                    "no {} produced for block {} (exit status {})\nSTDOUT: {}\nSTDERR: {}",
                    ARTIFACT_FILE, block_id, output.status, stdout, stderr
                );
                if let Ok((_, log)) =
                    controller.read_file(Some(Stage::Received), block_id, SCRIPT_LOG_FILE)
                {
                    message.push_str("\nScript log:\n");
                    message.push_str(&String::from_utf8_lossy(&log));
                }
                tracing::error!("Mesh generation failed for block {}", block_id);
                return Err(BlockError::ExternalTool(message));
            }
            Err(e) => return Err(e),
        };

        controller.promote(block_id, &artifact)
    }
}
