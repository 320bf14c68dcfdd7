//! Worker configuration.
//!
//! Everything the binary collects from flags and environment before the
//! supervisor starts. Intervals are stored in seconds, the way they
//! arrive on the command line.

use std::time::Duration;

use crate::engine::{EngineProperties, Platform, Precision};
use crate::transport::ProxyConfig;

/// Default command center address.
pub const DEFAULT_CC_ADDRESS: &str = "127.0.0.1:8980";

/// Default checkpoint cadence in seconds.
pub const DEFAULT_CHECKPOINT_SECS: u64 = 7200;

/// Default heartbeat cadence in seconds.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 60;

/// Engine name advertised to the command center.
pub const DEFAULT_ENGINE_NAME: &str = "gridcore-md";

/// Static configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Command center `host[:port]`.
    pub cc_address: String,
    /// Authorization key presented at assignment time.
    pub core_key: String,
    /// Engine name sent in the assignment request.
    pub engine_name: String,
    /// Optional donor credential.
    pub donor_token: Option<String>,
    /// Optional target constraint.
    pub target_id: Option<String>,
    /// Optional proxy for both sessions.
    pub proxy: Option<ProxyConfig>,
    /// Checkpoint cadence in seconds.
    pub checkpoint_interval_secs: u64,
    /// Heartbeat cadence in seconds.
    pub heartbeat_interval_secs: u64,
    /// Production compute platform.
    pub platform: Platform,
    /// Device index within the platform.
    pub device_index: Option<u32>,
    /// Platform index (OpenCL).
    pub platform_index: Option<u32>,
    /// Work-unit directory for the managed-host progress file.
    #[cfg(feature = "managed-host")]
    pub wu_dir: Option<std::path::PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            cc_address: DEFAULT_CC_ADDRESS.to_string(),
            core_key: String::new(),
            engine_name: DEFAULT_ENGINE_NAME.to_string(),
            donor_token: None,
            target_id: None,
            proxy: None,
            checkpoint_interval_secs: DEFAULT_CHECKPOINT_SECS,
            heartbeat_interval_secs: DEFAULT_HEARTBEAT_SECS,
            platform: Platform::Cpu,
            device_index: None,
            platform_index: None,
            #[cfg(feature = "managed-host")]
            wu_dir: None,
        }
    }
}

impl WorkerConfig {
    /// Checkpoint cadence as a duration.
    #[must_use]
    pub const fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Heartbeat cadence as a duration.
    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Device-binding properties for the production engine.
    #[must_use]
    pub fn engine_properties(&self) -> EngineProperties {
        EngineProperties {
            device_index: self.device_index,
            platform_index: self.platform_index,
            precision: Precision::Single,
        }
    }
}
