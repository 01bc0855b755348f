use std::sync::Arc;

use crate::blocks::lifecycle::LifecycleController;
use crate::blocks::mesh::MeshGenerator;
use crate::config::Config;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Block state machine over the stage directories
    pub lifecycle: Arc<LifecycleController>,
    /// External mesh generator, present only when enabled in config
    pub mesh: Option<Arc<MeshGenerator>>,
    /// Largest accepted request body in bytes
    pub max_upload_bytes: u64,
}

impl AppState {
    pub fn from_config(config: &Config, lifecycle: Arc<LifecycleController>) -> Self {
        Self {
            lifecycle,
            mesh: config
                .mesh_generator()
                .map(|mesh| Arc::new(MeshGenerator::new(&mesh))),
            max_upload_bytes: config.lifecycle().max_upload_bytes(),
        }
    }
}
