//! Controller runtime settings
//!
//! These tune the control loop itself (timeouts, retry budget, state root)
//! and are separate from the fleet configuration the watcher reloads.

use crate::error::{AscError, Result};
use crate::state::StateLayout;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file name, looked up in the working directory
pub const SETTINGS_FILE: &str = "asc-settings.toml";

/// Runtime settings for the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// Root of the on-disk state tree (defaults to `~/.asc`)
    pub state_root: Option<PathBuf>,

    /// Silence after which an agent counts as offline
    #[serde(with = "humantime_serde")]
    pub offline_threshold: Duration,

    /// Overall timeout for each coordination request
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Retries after the first failed request
    pub max_retries: usize,

    /// Base delay between retries; multiplied by the attempt number
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Delay before the first reconnect attempt
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,

    /// Upper bound for a single reconnect delay
    #[serde(with = "humantime_serde")]
    pub max_reconnect_delay: Duration,

    /// Interval between liveness probes on the event stream
    #[serde(with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Quiet period before a config change is reloaded
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,

    /// Event stream URL; derived from the coordinator URL when unset
    pub stream_url: Option<String>,

    /// Default tracing filter when `RUST_LOG` is not set
    pub log_filter: String,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            state_root: None,
            offline_threshold: Duration::from_secs(120),
            request_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(10),
            debounce: Duration::from_millis(500),
            stream_url: None,
            log_filter: "info".to_string(),
        }
    }
}

impl ControllerSettings {
    /// Load settings from defaults, `asc-settings.toml` and `ASC_*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer is present but malformed.
    pub fn load() -> Result<Self> {
        Self::load_from(SETTINGS_FILE)
    }

    /// Load settings using a specific settings file.
    ///
    /// A missing file is not an error; its layer is simply empty.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let settings: ControllerSettings = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("ASC_"))
            .extract()
            .map_err(|e| AscError::Configuration(format!("Failed to load settings: {}", e)))?;

        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.max_reconnect_delay < self.reconnect_delay {
            return Err(AscError::Configuration(
                "max_reconnect_delay must not be shorter than reconnect_delay".into(),
            ));
        }
        if self.offline_threshold.is_zero() {
            return Err(AscError::Configuration("offline_threshold must be positive".into()));
        }
        Ok(())
    }

    /// State layout rooted at the configured state root.
    pub fn layout(&self) -> Result<StateLayout> {
        match &self.state_root {
            Some(root) => Ok(StateLayout::new(root.clone())),
            None => StateLayout::default_root(),
        }
    }
}
