use clap::{parser::ValueSource, ArgMatches, CommandFactory, FromArgMatches, Parser};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Block intake and retention server
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "blockforge-server", version, about = "Block intake and retention server")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "BLOCKFORGE_PORT", default_value = "10000")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "BLOCKFORGE_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./blockforge.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "BLOCKFORGE_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Store root holding the received_blocks/ and processed_blocks/ stages
    #[arg(long, env = "BLOCKFORGE_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Lifecycle and retention configuration (loaded from [blocks] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub blocks: Option<LifecycleConfig>,

    /// External mesh generator configuration (loaded from [mesh] section in TOML)
    #[arg(skip)]
    #[serde(default)]
    pub mesh: Option<MeshConfig>,
}

/// Configuration for block lifecycle and the retention reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Seconds a processed block lives before the reaper deletes it (default: 300)
    #[serde(default = "default_artifact_lifetime")]
    pub artifact_lifetime_secs: u64,

    /// Seconds between reaper cycles (default: 60)
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Resolve blocks left in both stages by an interrupted promotion at startup
    #[serde(default = "default_reconcile_on_startup")]
    pub reconcile_on_startup: bool,

    /// Maximum artifact upload size in megabytes (default: 100)
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size_mb: u32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            artifact_lifetime_secs: 300,
            reap_interval_secs: 60,
            reconcile_on_startup: true,
            max_upload_size_mb: 100,
        }
    }
}

impl LifecycleConfig {
    /// Reaper wake-up interval, never shorter than one second.
    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }

    pub fn max_upload_bytes(&self) -> u64 {
        u64::from(self.max_upload_size_mb) * 1024 * 1024
    }
}

fn default_artifact_lifetime() -> u64 {
    300
}

fn default_reap_interval() -> u64 {
    60
}

fn default_reconcile_on_startup() -> bool {
    true
}

fn default_max_upload_size() -> u32 {
    100
}

/// Configuration for the out-of-process mesh generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Run the generator on every intaken block (default: false)
    #[serde(default)]
    pub enabled: bool,

    /// Executable to invoke (default: "blender")
    #[serde(default = "default_mesh_command")]
    pub command: String,

    /// Generator script passed via --python
    #[serde(default = "default_mesh_script")]
    pub script_path: PathBuf,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: default_mesh_command(),
            script_path: default_mesh_script(),
        }
    }
}

fn default_mesh_command() -> String {
    "blender".to_string()
}

fn default_mesh_script() -> PathBuf {
    PathBuf::from("./blender_create_block.py")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 10000,
            bind_address: "0.0.0.0".to_string(),
            config: "./blockforge.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            blocks: Some(LifecycleConfig::default()),
            mesh: None,
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (BLOCKFORGE_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(std::env::args_os())
    }

    /// Same as [`Config::load`] with an explicit argument list. Only flags given on
    /// the command line are layered on top; clap defaults never mask the TOML file.
    pub fn load_from<I, T>(args: I) -> Result<Self, figment::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Config::command().get_matches_from(args);
        let cli = Config::from_arg_matches(&matches).unwrap_or_else(|e| e.exit());
        let passed = command_line_values(&cli, &matches);
        Self::figment(&cli.config)
            .merge(Serialized::defaults(passed))
            .extract()
    }

    fn figment(config_path: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("BLOCKFORGE_").split("__"))
    }

    pub fn lifecycle(&self) -> LifecycleConfig {
        self.blocks.clone().unwrap_or_default()
    }

    /// The mesh generator settings, only when enabled.
    pub fn mesh_generator(&self) -> Option<MeshConfig> {
        self.mesh.clone().filter(|mesh| mesh.enabled)
    }
}

fn command_line_values(
    cli: &Config,
    matches: &ArgMatches,
) -> serde_json::Map<String, serde_json::Value> {
    let mut values = match serde_json::to_value(cli) {
        Ok(serde_json::Value::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    values.retain(|key, _| {
        matches.ids().any(|id| id.as_str() == key)
            && matches.value_source(key) == Some(ValueSource::CommandLine)
    });
    values
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Blockforge Server Configuration
# Place this file at ./blockforge.toml or specify with --config <path>
# All settings can be overridden via environment variables (BLOCKFORGE_PORT,
# BLOCKFORGE_BLOCKS__ARTIFACT_LIFETIME_SECS, etc.) or CLI flags (--port, etc.)

# Server port (default: 10000)
# port = 10000

# Bind address (default: 0.0.0.0 — all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Store root; blocks live under received_blocks/ and processed_blocks/
# data_dir = "./data"

# ---- Block Lifecycle ----
# [blocks]

# Seconds a processed block is kept before the reaper deletes it (default: 300)
# artifact_lifetime_secs = 300

# Seconds between reaper cycles (default: 60)
# reap_interval_secs = 60

# Remove received copies of already-processed blocks at startup (default: true)
# reconcile_on_startup = true

# Maximum artifact upload size in megabytes (default: 100)
# max_upload_size_mb = 100

# ---- Mesh Generator ----
# [mesh]
# enabled = false
# command = "blender"
# script_path = "./blender_create_block.py"
"#
    .to_string()
}
