//! Block lifecycle: intake into the received stage, promotion to the processed
//! stage, retrieval, and deletion by callers or by the retention reaper.
//!
//! Storage layout: `{data_dir}/received_blocks/{id}/` and
//! `{data_dir}/processed_blocks/{id}/`. The directory a block sits under is its
//! state; there is no separate index.

pub mod lifecycle;
pub mod locks;
pub mod mesh;
pub mod model;
pub mod retention;
pub mod routes;
pub mod stage;
pub mod store;
