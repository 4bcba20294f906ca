// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Component descriptor layout.
//!
//! A __component descriptor__ declares the containers, commands, and starter
//! projects of one application component. Parsing and validating descriptors
//! is somebody else's job. Devsync only keeps a read-only view of the parts it
//! consumes, and never mutates or re-serializes it.

use serde::Deserialize;
use std::{
    collections::BTreeMap,
    fs::read_to_string,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Default path inside a container that project sources are synchronized to.
pub const DEFAULT_SOURCE_MAPPING: &str = "/projects";

/// Attribute key listing additional globs to exclude from synchronization.
pub const EXCLUDE_ATTRIBUTE: &str = "devsync.exclude";

/// Read-only view of a parsed component descriptor.
#[derive(Default, Debug, PartialEq, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub metadata: Metadata,

    #[serde(default)]
    pub components: Vec<Component>,

    #[serde(default)]
    pub commands: Vec<CommandDefinition>,

    #[serde(default)]
    pub starter_projects: Vec<StarterProject>,

    #[serde(default)]
    pub attributes: BTreeMap<String, serde_yaml::Value>,
}

impl Descriptor {
    /// Load descriptor from file at `path`.
    ///
    /// # Errors
    ///
    /// - Return [`DescriptorError::ReadDescriptor`] if file cannot be read.
    /// - Return [`DescriptorError::Deserialize`] if content is malformed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        read_to_string(path.as_ref())
            .map_err(|err| DescriptorError::ReadDescriptor {
                source: err,
                descriptor_path: path.as_ref().to_path_buf(),
            })?
            .parse()
    }

    /// Name of the component, falling back to "component" when unnamed.
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or("component")
    }

    /// Find component by name.
    pub fn component(&self, name: &str) -> Option<&Component> {
        self.components.iter().find(|component| component.name == name)
    }

    /// Iterate over components that run a container.
    pub fn containers(&self) -> impl Iterator<Item = (&str, &Container)> {
        self.components.iter().filter_map(|component| {
            component
                .container
                .as_ref()
                .map(|container| (component.name.as_str(), container))
        })
    }

    /// Exclusion globs declared through the [`EXCLUDE_ATTRIBUTE`] attribute.
    ///
    /// Non-string list items are skipped.
    pub fn declared_exclusions(&self) -> Vec<String> {
        match self.attributes.get(EXCLUDE_ATTRIBUTE) {
            Some(serde_yaml::Value::Sequence(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(ToString::to_string))
                .collect(),
            Some(serde_yaml::Value::String(item)) => vec![item.clone()],
            _ => Vec::new(),
        }
    }
}

impl FromStr for Descriptor {
    type Err = DescriptorError;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(data).map_err(DescriptorError::Deserialize)
    }
}

#[derive(Default, Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct Metadata {
    pub name: Option<String>,
}

/// Declared component.
#[derive(Debug, PartialEq, Clone, Deserialize)]
pub struct Component {
    pub name: String,

    /// Runtime container, if the component declares one.
    pub container: Option<Container>,
}

/// Runtime container of a component.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    pub image: String,

    /// Path inside the container where project sources live.
    #[serde(default)]
    pub source_mapping: Option<String>,

    /// Whether project sources are mounted into this container.
    #[serde(default)]
    pub mount_sources: Option<bool>,

    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub endpoints: Vec<Endpoint>,
}

impl Container {
    pub fn source_mapping(&self) -> &str {
        self.source_mapping
            .as_deref()
            .unwrap_or(DEFAULT_SOURCE_MAPPING)
    }

    pub fn mounts_sources(&self) -> bool {
        self.mount_sources.unwrap_or(true)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub name: String,
    pub target_port: u16,
}

/// Declared command.
///
/// Only exec commands are understood. Other command kinds are kept as a bare
/// identifier so they can be named in error messages.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct CommandDefinition {
    pub id: String,

    #[serde(default)]
    pub exec: Option<ExecCommand>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecCommand {
    /// Name of component this command runs in.
    pub component: String,

    pub command_line: String,

    #[serde(default)]
    pub working_dir: Option<String>,

    #[serde(default)]
    pub env: Vec<EnvVar>,

    #[serde(default)]
    pub hot_reload_capable: bool,

    #[serde(default)]
    pub group: Option<CommandGroup>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandGroup {
    pub kind: GroupKind,

    #[serde(default)]
    pub is_default: bool,
}

/// Lifecycle group a command belongs to.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupKind {
    Build,
    Run,
    Debug,
    Test,
}

impl GroupKind {
    /// Missing commands of this group abort a push.
    pub fn is_required(&self) -> bool {
        matches!(self, Self::Build | Self::Run)
    }
}

impl std::fmt::Display for GroupKind {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Build => "build",
            Self::Run => "run",
            Self::Debug => "debug",
            Self::Test => "test",
        };
        fmt.write_str(name)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct StarterProject {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,
}

/// Descriptor loading error types.
#[derive(Debug, thiserror::Error)]
pub enum DescriptorError {
    #[error("failed to read component descriptor at {:?}", descriptor_path.display())]
    ReadDescriptor {
        #[source]
        source: std::io::Error,
        descriptor_path: PathBuf,
    },

    #[error(transparent)]
    Deserialize(#[from] serde_yaml::Error),
}

/// Friendly result alias :3
type Result<T, E = DescriptorError> = std::result::Result<T, E>;
