// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Configuration layout.
//!
//! Specify the layout of the engine configuration file that devsync reads at
//! startup. The configuration is parsed once, and then threaded explicitly into
//! the push pipeline, the watch loop, and platform adapter construction. Nothing
//! in devsync reads behavior flags from process-wide state.

use crate::platform::{ClusterContext, LocalEngineContext, PlatformContext};

use serde::{Deserialize, Serialize};
use std::{
    fmt::{Display, Error as FmtError, Formatter, Result as FmtResult},
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tracing::{debug, instrument};

/// Engine configuration layout.
///
/// # General Layout
///
/// The engine configuration is composed of three sections: settings, watch,
/// and push. The settings section selects the target platform and the tools
/// used to talk to it. The watch section tunes the watch loop. The push section
/// tunes how long the push pipeline waits on the platform.
#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// General engine settings.
    #[serde(default)]
    pub settings: EngineSettings,

    /// Watch loop settings.
    #[serde(default)]
    pub watch: WatchSettings,

    /// Push pipeline settings.
    #[serde(default)]
    pub push: PushSettings,
}

impl EngineConfig {
    /// Load configuration file at `path`.
    ///
    /// A missing configuration file yields the default configuration.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ReadConfigFile`] if file exists but cannot be
    ///   read.
    /// - Return [`ConfigError::Deserialize`] if file content is invalid.
    #[instrument(skip(path), level = "debug")]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!("no configuration at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        read_to_string(path)
            .map_err(|err| ConfigError::ReadConfigFile {
                source: err,
                config_path: path.to_path_buf(),
            })?
            .parse()
    }

    /// Resolve platform context for configured push target.
    ///
    /// # Errors
    ///
    /// - Return [`ConfigError::ExperimentalRequired`] if the local engine
    ///   target is selected without enabling experimental mode.
    pub fn platform_context(&self) -> Result<PlatformContext> {
        match self.settings.push_target {
            PushTarget::Cluster => Ok(PlatformContext::Cluster(ClusterContext {
                namespace: self.settings.namespace.clone(),
            })),
            PushTarget::Local if self.settings.experimental => {
                Ok(PlatformContext::LocalEngine(LocalEngineContext))
            }
            PushTarget::Local => Err(ConfigError::ExperimentalRequired),
        }
    }
}

impl FromStr for EngineConfig {
    type Err = ConfigError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        let mut config: EngineConfig = toml::de::from_str(data).map_err(ConfigError::Deserialize)?;

        // INVARIANT: Perform shell expansion on path-valued settings.
        if let Some(root) = config.settings.sync_root.take() {
            config.settings.sync_root = Some(PathBuf::from(
                shellexpand::full(root.to_string_lossy().as_ref())
                    .map_err(ConfigError::ShellExpansion)?
                    .into_owned(),
            ));
        }

        Ok(config)
    }
}

impl Display for EngineConfig {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.write_str(
            toml::ser::to_string_pretty(self)
                .map_err(ConfigError::Serialize)?
                .as_str(),
        )
    }
}

/// General engine settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Enable experimental features, e.g., the local engine platform.
    pub experimental: bool,

    /// Platform to synchronize components to.
    pub push_target: PushTarget,

    /// Namespace used by the cluster platform.
    pub namespace: String,

    /// Binary used to talk to the cluster orchestrator.
    pub cluster_binary: String,

    /// Binary used to talk to the local container engine.
    pub engine_binary: String,

    /// Synchronization root to use when none is given on the command line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_root: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            experimental: false,
            push_target: PushTarget::default(),
            namespace: "default".into(),
            cluster_binary: "kubectl".into(),
            engine_binary: "podman".into(),
            sync_root: None,
        }
    }
}

/// Platform that components get synchronized to.
#[derive(Default, Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PushTarget {
    /// Cluster orchestrated containers.
    #[default]
    Cluster,

    /// Local container engine.
    Local,
}

/// Watch loop settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchSettings {
    /// Quiet period in milliseconds before a burst of changes triggers a push.
    pub delay_ms: u64,

    /// Additional ignore globs applied while watching.
    pub ignore: Vec<String>,
}

impl WatchSettings {
    /// Debounce delay as a [`Duration`].
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl Default for WatchSettings {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            ignore: Vec::new(),
        }
    }
}

/// Push pipeline settings.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PushSettings {
    /// Seconds to wait on the platform before giving up.
    pub timeout_secs: u64,
}

impl PushSettings {
    /// Platform timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for PushSettings {
    fn default() -> Self {
        Self { timeout_secs: 240 }
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file cannot be read.
    #[error("failed to read configuration file at {:?}", config_path.display())]
    ReadConfigFile {
        #[source]
        source: std::io::Error,
        config_path: PathBuf,
    },

    /// Failed to deserialize configuration.
    #[error(transparent)]
    Deserialize(#[from] toml::de::Error),

    /// Failed to serialize configuration.
    #[error(transparent)]
    Serialize(#[from] toml::ser::Error),

    /// Failed to perform shell expansion on configuration.
    #[error(transparent)]
    ShellExpansion(#[from] shellexpand::LookupError<std::env::VarError>),

    /// Local engine platform selected without experimental mode.
    #[error("local engine push target requires experimental mode")]
    ExperimentalRequired,
}

impl From<ConfigError> for FmtError {
    fn from(_: ConfigError) -> Self {
        FmtError
    }
}

/// Friendly result alias :3
type Result<T, E = ConfigError> = std::result::Result<T, E>;
