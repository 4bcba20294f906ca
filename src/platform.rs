// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Platform adapters.
//!
//! A __platform adapter__ is the only part of devsync that talks to the runtime
//! hosting a component. Every target platform implements the same
//! [`PlatformAdapter`] capability set, and the adapter is picked exactly once
//! from a [`PlatformContext`] when a pipeline is constructed. Nothing
//! downstream of [`adapter_for`] branches on platform identity again.
//!
//! # Platforms
//!
//! - __Cluster__: components run as a deployment in a namespace of a cluster
//!   orchestrator, driven through its command line client.
//! - __Local engine__: components run as labelled containers sharing a named
//!   volume on a local container engine.
//!
//! Both platforms share the same [`Adapter`] logic for file transfer, command
//! execution, and log streaming. They only differ in their [`Runtime`], i.e.,
//! how a component is provisioned, entered, observed, and torn down.
//!
//! # Concurrency
//!
//! Adapters provide no locking of their own. Callers must not run more than one
//! push session against the same component at a time.

pub mod adapter;
pub mod cluster;
pub mod local;
pub mod shell;
pub mod stream;

pub use adapter::{Adapter, LifecycleAction, TransferSummary};
pub use cluster::ClusterRuntime;
pub use local::LocalEngineRuntime;
pub use shell::{HostShell, LineSource, Shell, ShellOutput};
pub use stream::{LogCanceller, LogStream, StatusEvent, StatusStream};

use crate::{command::ResolvedCommand, config::EngineConfig, descriptor::Descriptor, push::PushSession};

use std::{collections::BTreeMap, io::Write, sync::Arc, time::Duration};

/// Label naming the component a remote resource belongs to.
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Label marking remote resources as managed by devsync.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Opaque selector of the platform a component runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformContext {
    Cluster(ClusterContext),
    LocalEngine(LocalEngineContext),
}

/// Cluster platform context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterContext {
    pub namespace: String,
}

/// Local container engine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalEngineContext;

/// Labels identifying remote resources of one component.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(BTreeMap<String, String>);

impl Labels {
    /// Standard labels of a component.
    pub fn for_component(name: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert(INSTANCE_LABEL.to_string(), name.to_string());
        labels.insert(MANAGED_BY_LABEL.to_string(), "devsync".to_string());
        Self(labels)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Label selector, e.g., "a=b,c=d".
    pub fn selector(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

/// Component an adapter operates on.
#[derive(Debug, Clone)]
pub struct ComponentTarget {
    pub name: String,
    pub descriptor: Arc<Descriptor>,
    pub labels: Labels,
}

impl ComponentTarget {
    pub fn new(descriptor: Arc<Descriptor>) -> Self {
        let name = descriptor.name().to_string();
        Self {
            labels: Labels::for_component(&name),
            name,
            descriptor,
        }
    }
}

/// Capabilities every target platform provides.
pub trait PlatformAdapter: Send + Sync {
    /// Name of the platform, for logs.
    fn name(&self) -> &'static str;

    /// Make sure the component runs, then copy added and modified files of the
    /// session delta into it, and remove deleted ones.
    ///
    /// An empty delta transfers nothing.
    fn sync_files(&self, session: &PushSession) -> Result<TransferSummary>;

    /// Build, and (re)start the run or debug command of the session.
    ///
    /// `changed` tells whether the preceding transfer changed anything.
    fn run_lifecycle(&self, session: &PushSession, changed: bool) -> Result<Vec<LifecycleAction>>;

    /// Transfer session delta, and trigger its lifecycle commands.
    ///
    /// Safe to call repeatedly with an empty delta.
    fn push(&self, session: &PushSession) -> Result<()> {
        let summary = self.sync_files(session)?;
        self.run_lifecycle(session, !summary.is_empty())?;
        Ok(())
    }

    /// Run arbitrary command inside the component.
    ///
    /// Combined output is streamed into `output` line by line. A non-zero exit
    /// is reported as [`PlatformError::Exec`].
    fn exec(&self, command_line: &str, output: &mut dyn Write) -> Result<()>;

    /// Stream log lines of a run or debug command.
    ///
    /// Without `follow` the stream ends with the current log. With `follow`
    /// it only ends once cancelled.
    fn log(&self, follow: bool, command: &ResolvedCommand) -> Result<LogStream>;

    /// Tear down every remote resource matching `labels`.
    ///
    /// With `wait`, block until the platform confirms removal, or fail with
    /// [`PlatformError::DeleteTimeout`].
    fn delete(&self, labels: &Labels, show_progress: bool, wait: bool) -> Result<()>;

    /// Resolve and run a test command.
    fn test(&self, command_name: Option<&str>, show_progress: bool) -> Result<()>;

    /// Observe remote status changes.
    ///
    /// Platforms that cannot observe remote state return a closed stream.
    fn watch_remote_status(&self) -> Result<StatusStream>;
}

/// Construct platform adapter selected by `context`.
pub fn adapter_for(
    context: &PlatformContext,
    config: &EngineConfig,
    target: ComponentTarget,
) -> Box<dyn PlatformAdapter> {
    let timeout = config.push.timeout();
    match context {
        PlatformContext::Cluster(cluster) => Box::new(Adapter::new(
            ClusterRuntime::new(&config.settings.cluster_binary, &cluster.namespace, timeout),
            HostShell,
            target,
            timeout,
        )),
        PlatformContext::LocalEngine(_) => Box::new(Adapter::new(
            LocalEngineRuntime::new(&config.settings.engine_binary),
            HostShell,
            target,
            timeout,
        )),
    }
}

/// Component lifecycle on one concrete platform.
///
/// Provides everything [`Adapter`] cannot express generically.
pub trait Runtime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Provision component if missing, and wait until it runs.
    ///
    /// Returns `true` if the component was created or replaced, i.e., it
    /// holds no previously synchronized files.
    fn ensure_running(&self, shell: &dyn Shell, target: &ComponentTarget) -> Result<bool>;

    /// Program and arguments that run `script` with `sh -c` in a container.
    ///
    /// With `interactive`, standard input is attached.
    fn exec_argv(
        &self,
        shell: &dyn Shell,
        target: &ComponentTarget,
        container: &str,
        interactive: bool,
        script: &str,
    ) -> Result<(String, Vec<String>)>;

    /// Request removal of every resource matching `labels`.
    fn delete(&self, shell: &dyn Shell, target: &ComponentTarget, labels: &Labels) -> Result<()>;

    /// Count resources matching `labels` that still exist.
    fn remaining(&self, shell: &dyn Shell, labels: &Labels) -> Result<usize>;

    /// Stream remote status changes.
    fn status_stream(&self, shell: &dyn Shell, labels: &Labels) -> Result<StatusStream>;
}

/// Run program through shell, and fail unless it exits successfully.
pub(crate) fn checked_output(
    shell: &dyn Shell,
    program: &str,
    args: &[String],
    stdin: Option<&[u8]>,
) -> Result<ShellOutput> {
    let output = shell
        .output(program, args, stdin)
        .map_err(|err| PlatformError::Syscall {
            source: err,
            program: program.to_string(),
        })?;

    if !output.success() {
        return Err(PlatformError::Exec {
            command: format!("{program} {}", args.join(" ")),
            exit_code: output.code,
            output: output.combined(),
        });
    }

    Ok(output)
}

/// Convert arguments into owned strings.
pub(crate) fn argv<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(ToString::to_string).collect()
}

/// Platform error types.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    /// Command exited unsuccessfully.
    #[error("command {command:?} failed with exit code {}:\n{output}", exit_code.map_or("none".to_string(), |code| code.to_string()))]
    Exec {
        command: String,
        exit_code: Option<i32>,
        output: String,
    },

    /// Files could not be packed for transfer.
    #[error("failed to pack {path:?} for transfer")]
    Transfer {
        #[source]
        source: std::io::Error,
        path: String,
    },

    /// Remote resources were still present after waiting for removal.
    #[error("resources matching {selector:?} still present after {waited:?}")]
    DeleteTimeout { selector: String, waited: Duration },

    /// Component is not running on the platform.
    #[error("component {component:?} is not running: {reason}")]
    ComponentNotRunning { component: String, reason: String },

    /// Descriptor declares no container to operate in.
    #[error("component {component:?} declares no container")]
    NoContainer { component: String },

    /// Command to run could not be resolved.
    #[error(transparent)]
    Resolve(#[from] crate::command::ResolveError),

    /// Shell word cannot be quoted.
    #[error(transparent)]
    Quote(#[from] shlex::QuoteError),

    /// External program could not be spawned.
    #[error("failed to run {program:?}")]
    Syscall {
        #[source]
        source: std::io::Error,
        program: String,
    },

    /// Generated manifest cannot be serialized.
    #[error(transparent)]
    Manifest(#[from] serde_json::Error),

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),
}

impl PlatformError {
    /// Stable machine-readable name of this error.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Exec { .. } => "exec",
            Self::Transfer { .. } => "transfer",
            Self::DeleteTimeout { .. } => "delete_timeout",
            Self::Resolve(err) => err.error_kind(),
            _ => "platform",
        }
    }

    /// Exit code of a failed command, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exec { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = PlatformError> = std::result::Result<T, E>;
