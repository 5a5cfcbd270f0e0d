//! Process-system configuration

use psys_resources::ResourceDefs;
use serde::{Deserialize, Serialize};

/// Firmware library version this software was built against
pub const DEFAULT_FW_LIB_VERSION: u32 = 20181222;

/// Per-kcmd watchdog
pub const DEFAULT_WATCHDOG_TIMEOUT_MS: u64 = 2000;

/// Which command backend drives the firmware
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Shared-memory queues driven by this crate
    #[default]
    Builtin,
    /// Operation set supplied by a companion library
    External,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsysConfig {
    pub watchdog_timeout_ms: u64,
    /// Allow a new kcmd to start while another is in flight
    pub enable_concurrency: bool,
    pub backend: BackendKind,
    /// Module-data firmware version required at load
    pub fw_lib_version: u32,
    pub resources: ResourceDefs,
}

impl Default for PsysConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout_ms: DEFAULT_WATCHDOG_TIMEOUT_MS,
            enable_concurrency: true,
            backend: BackendKind::Builtin,
            fw_lib_version: DEFAULT_FW_LIB_VERSION,
            resources: ResourceDefs::default(),
        }
    }
}
