use serde::Deserialize;
use std::path::PathBuf;

/// Environment variable through which the fuzzer hands over the shared
/// coverage segment id. Must stay in sync with the driving fuzzer.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";
/// Control-channel descriptor mandated by the fork-server wire protocol.
/// The status channel is the next descriptor up.
pub const FORKSRV_FD: i32 = 198;
/// log2 of the conventional bitmap size.
pub const MAP_SIZE_POW2: usize = 16;
/// Protocol-mandated coverage bitmap size.
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

/// Environment override for persistent mode.
const PERSISTENT_ENV_VAR: &str = "WARREN_PERSISTENT";

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Coverage bitmap length in bytes. Fixed for the whole session.
    #[serde(default = "default_map_size")]
    pub map_size: usize,
    /// Descriptor the controller reads continue tokens from.
    #[serde(default = "default_control_fd")]
    pub control_fd: i32,
    /// Descriptor the controller writes pid and status words to.
    #[serde(default = "default_status_fd")]
    pub status_fd: i32,
    /// Environment variable carrying the shared-memory segment id.
    #[serde(default = "default_shm_env_var")]
    pub shm_env_var: String,
    /// Seed folded into every edge hash.
    #[serde(default)]
    pub edge_seed: u32,
    /// Keep workers alive across iterations (stop/resume instead of
    /// fork-per-token) when the worker cooperates.
    #[serde(default)]
    pub persistent: bool,
}

fn default_map_size() -> usize {
    MAP_SIZE
}
fn default_control_fd() -> i32 {
    FORKSRV_FD
}
fn default_status_fd() -> i32 {
    FORKSRV_FD + 1
}
fn default_shm_env_var() -> String {
    SHM_ENV_VAR.to_string()
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            map_size: default_map_size(),
            control_fd: default_control_fd(),
            status_fd: default_status_fd(),
            shm_env_var: default_shm_env_var(),
            edge_seed: 0,
            persistent: false,
        }
    }
}

impl HarnessConfig {
    pub fn load_from_file(path: &PathBuf) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let config: HarnessConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        Ok(config)
    }

    /// Applies process-environment overrides on top of the loaded values.
    pub fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(PERSISTENT_ENV_VAR) {
            self.persistent = !value.is_empty() && value != "0";
        }
    }
}
