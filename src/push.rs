// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Push pipeline.
//!
//! A __push__ brings the running component up to date with the local
//! synchronization root. Each push is one [`PushSession`] that moves through
//! the following steps, in order:
//!
//! 1. __Init__: check that the synchronization root can be read.
//! 2. __Resolve commands__: select build command, and run or debug command.
//! 3. __Compute delta__: compare the root against the change index.
//! 4. __Transfer__: send the delta into the component.
//! 5. __Execute__: build, and (re)start the run or debug command.
//! 6. __Persist index__: record what was synchronized.
//! 7. __Report__: emit exactly one terminal event.
//!
//! Any failing step ends the session. The change index is only persisted once
//! the platform confirmed every preceding step, so a failed push leaves the
//! index untouched, and the next push resubmits the same changes.

use crate::{
    command::{self, ResolveError, ResolvedCommand},
    config::{ConfigError, EngineConfig},
    descriptor::{Descriptor, GroupKind},
    event::{EventKind, EventStatus, Reporter, SessionReporter},
    ignore_rules::{IgnoreError, IgnoreSet, IgnoreSource},
    index::{ChangeDelta, FileIndex, IndexError, IndexStore},
    platform::{
        self, ComponentTarget, LifecycleAction, PlatformAdapter, PlatformContext, PlatformError,
        TransferSummary,
    },
};

use serde_json::json;
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, TryLockError},
};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Debug port handed to debug commands unless told otherwise.
pub const DEFAULT_DEBUG_PORT: u16 = 5858;

/// Caller-provided knobs of one push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOptions {
    /// Synchronize every file, rebuild, and restart, no matter what changed.
    pub force_build: bool,

    /// Start debug command instead of run command.
    pub debug: bool,
    pub debug_port: u16,

    pub build_command: Option<String>,
    pub run_command: Option<String>,
    pub debug_command: Option<String>,

    /// Draw progress while waiting on the platform.
    pub show_progress: bool,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            force_build: false,
            debug: false,
            debug_port: DEFAULT_DEBUG_PORT,
            build_command: None,
            run_command: None,
            debug_command: None,
            show_progress: false,
        }
    }
}

/// State of one push, owned by the pipeline until the push ends.
#[derive(Debug, Clone)]
pub struct PushSession {
    pub id: Uuid,
    pub root: PathBuf,
    pub build: Option<ResolvedCommand>,

    /// Run command, or debug command in debug mode.
    pub lifecycle: Option<ResolvedCommand>,
    pub delta: ChangeDelta,

    /// Delta covers every file of the root, not only changes since the last
    /// push.
    pub full_sync: bool,
    pub force_build: bool,
    pub debug: bool,
    pub debug_port: u16,
    pub show_progress: bool,
    pub context: PlatformContext,
}

/// Result of a successful push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushOutcome {
    pub session_id: Uuid,
    pub delta: ChangeDelta,
    pub transfer: TransferSummary,
    pub actions: Vec<LifecycleAction>,
}

/// Orchestrate pushes of one component.
///
/// Sessions of one pipeline never overlap. A push attempted while another one
/// is in flight fails with [`PushError::SessionInProgress`].
pub struct PushPipeline {
    root: PathBuf,
    descriptor: Arc<Descriptor>,
    adapter: Box<dyn PlatformAdapter>,
    context: PlatformContext,
    reporter: Arc<Reporter>,
    store: IndexStore,
    ignore: Vec<String>,
    session: Mutex<()>,
}

impl PushPipeline {
    /// Construct pipeline, selecting the platform adapter from `config`.
    ///
    /// # Errors
    ///
    /// - Return [`PushError::Config`] if the configured platform cannot be
    ///   used.
    pub fn new(
        config: &EngineConfig,
        root: impl Into<PathBuf>,
        descriptor: Arc<Descriptor>,
        reporter: Arc<Reporter>,
    ) -> Result<Self> {
        let context = config.platform_context()?;
        let adapter = platform::adapter_for(
            &context,
            config,
            ComponentTarget::new(Arc::clone(&descriptor)),
        );
        info!("push {} through {} platform", descriptor.name(), adapter.name());

        Ok(Self::with_adapter(root, descriptor, adapter, context, reporter)
            .with_ignore(config.watch.ignore.clone()))
    }

    /// Construct pipeline over an already selected platform adapter.
    pub fn with_adapter(
        root: impl Into<PathBuf>,
        descriptor: Arc<Descriptor>,
        adapter: Box<dyn PlatformAdapter>,
        context: PlatformContext,
        reporter: Arc<Reporter>,
    ) -> Self {
        let root = root.into();
        Self {
            store: IndexStore::new(&root),
            root,
            descriptor,
            adapter,
            context,
            reporter,
            ignore: Vec::new(),
            session: Mutex::new(()),
        }
    }

    /// Use explicit ignore patterns instead of discovered ignore files.
    pub fn with_ignore(mut self, patterns: Vec<String>) -> Self {
        self.ignore = patterns;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn adapter(&self) -> &dyn PlatformAdapter {
        self.adapter.as_ref()
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Ignore set every push of this pipeline uses.
    ///
    /// # Errors
    ///
    /// - Return [`PushError::Ignore`] if a pattern is invalid.
    pub fn ignore_set(&self) -> Result<IgnoreSet> {
        Ok(IgnoreSet::build(
            &self.ignore,
            &self.descriptor.declared_exclusions(),
            &self.root,
        )?)
    }

    /// Push local changes into the component.
    ///
    /// # Errors
    ///
    /// - Return [`PushError::SessionInProgress`] if another push of this
    ///   pipeline is in flight.
    /// - Return any error that ended the session. Its terminal event has been
    ///   reported already.
    #[instrument(skip(self, options), level = "debug")]
    pub fn push(&self, options: &PushOptions) -> Result<PushOutcome> {
        let _guard = match self.session.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(PushError::SessionInProgress),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        let reporter = self
            .reporter
            .start_session(format!("pushing {} from {}", self.descriptor.name(), self.root.display()));

        match self.run(&reporter, options) {
            Ok(outcome) => {
                let message = format!(
                    "pushed {} ({} change(s))",
                    self.descriptor.name(),
                    outcome.delta.len()
                );
                reporter.succeed(
                    message,
                    Some(json!({
                        "transfer": outcome.transfer,
                        "actions": outcome.actions,
                    })),
                );
                Ok(outcome)
            }
            Err(err) => {
                warn!("push failed: {err}");
                reporter.fail(err.error_kind(), format!("{err} ({})", err.hint()));
                Err(err)
            }
        }
    }

    /// Delete the component, and forget what was synchronized into it.
    ///
    /// # Errors
    ///
    /// - Return [`PushError::Platform`] if deletion fails or times out.
    /// - Return [`PushError::Index`] if the index cannot be reset.
    #[instrument(skip(self), level = "debug")]
    pub fn delete(&self, show_progress: bool, wait: bool) -> Result<()> {
        let labels = ComponentTarget::new(Arc::clone(&self.descriptor)).labels;
        self.adapter.delete(&labels, show_progress, wait)?;
        self.store.reset()?;
        Ok(())
    }

    fn run(&self, reporter: &SessionReporter, options: &PushOptions) -> Result<PushOutcome> {
        // INVARIANT: The root must be readable before anything else happens.
        self.root
            .read_dir()
            .map_err(|err| PushError::RootNotAccessible {
                source: err,
                root: self.root.clone(),
            })?;

        reporter.step(EventKind::ResolveCommands, EventStatus::Started, "resolving commands");
        let (build, lifecycle) = self.resolve_commands(reporter, options)?;
        reporter.step_with(
            EventKind::ResolveCommands,
            EventStatus::Succeeded,
            "resolved commands",
            json!({ "build": build, "lifecycle": lifecycle }),
        );

        reporter.step(EventKind::ComputeDelta, EventStatus::Started, "computing changes");
        let ignore = self.ignore_set()?;
        if let IgnoreSource::Fallback { reason } = ignore.source() {
            reporter.step(
                EventKind::ComputeDelta,
                EventStatus::Warning,
                format!("{reason}, only mandatory ignore rules apply"),
            );
        }

        let (delta, snapshot) = if options.force_build {
            self.store.full(&ignore)?
        } else {
            let previous = self.load_index(reporter)?;
            self.store.diff(&previous, &ignore)?
        };
        reporter.step_with(
            EventKind::ComputeDelta,
            EventStatus::Succeeded,
            format!("{} change(s)", delta.len()),
            json!({ "added": delta.added, "modified": delta.modified, "deleted": delta.deleted }),
        );

        let mut session = PushSession {
            id: reporter.session_id(),
            root: self.root.clone(),
            build,
            lifecycle,
            delta,
            full_sync: options.force_build,
            force_build: options.force_build,
            debug: options.debug,
            debug_port: options.debug_port,
            show_progress: options.show_progress,
            context: self.context.clone(),
        };

        reporter.step(EventKind::Transfer, EventStatus::Started, "synchronizing files");
        let mut transfer = self.adapter.sync_files(&session)?;
        if transfer.provisioned && !session.full_sync {
            // INVARIANT: Fresh component holds nothing, so previous index is
            // meaningless for it.
            info!("{} was provisioned, synchronizing every file", self.descriptor.name());
            let (delta, _) = self.store.full(&ignore)?;
            session.delta = delta;
            session.full_sync = true;
            transfer = self.adapter.sync_files(&session)?;
            transfer.provisioned = true;
        }
        reporter.step_with(
            EventKind::Transfer,
            if transfer.is_empty() { EventStatus::Skipped } else { EventStatus::Succeeded },
            format!("copied {} file(s), removed {} file(s)", transfer.copied, transfer.deleted),
            json!(transfer),
        );

        let actions = if session.lifecycle.is_some() {
            reporter.step(EventKind::ExecuteCommand, EventStatus::Started, "running commands");
            let actions = self.adapter.run_lifecycle(&session, !transfer.is_empty())?;
            reporter.step_with(
                EventKind::ExecuteCommand,
                EventStatus::Succeeded,
                "commands executed",
                json!(actions),
            );
            actions
        } else {
            reporter.step(EventKind::ExecuteCommand, EventStatus::Skipped, "no command to run");
            Vec::new()
        };

        self.store.save(&snapshot)?;
        reporter.step(EventKind::PersistIndex, EventStatus::Succeeded, "saved change index");

        Ok(PushOutcome {
            session_id: session.id,
            delta: session.delta,
            transfer,
            actions,
        })
    }

    fn resolve_commands(
        &self,
        reporter: &SessionReporter,
        options: &PushOptions,
    ) -> Result<(Option<ResolvedCommand>, Option<ResolvedCommand>)> {
        let build = command::resolve(&self.descriptor, GroupKind::Build, options.build_command.as_deref())?;
        let lifecycle = if options.debug {
            match command::resolve(&self.descriptor, GroupKind::Debug, options.debug_command.as_deref()) {
                Ok(debug) => Some(debug),
                Err(err) if !err.is_fatal() => {
                    warn!("skip debug: {err}");
                    reporter.step(
                        EventKind::ResolveCommands,
                        EventStatus::Warning,
                        format!("{err}, not starting anything"),
                    );
                    None
                }
                Err(err) => return Err(err.into()),
            }
        } else {
            Some(command::resolve(&self.descriptor, GroupKind::Run, options.run_command.as_deref())?)
        };

        debug!("build {:?}, lifecycle {:?}", build.id, lifecycle.as_ref().map(|cmd| &cmd.id));
        Ok((Some(build), lifecycle))
    }

    /// Load previous index, treating a corrupt one like a missing one.
    fn load_index(&self, reporter: &SessionReporter) -> Result<FileIndex> {
        match self.store.load() {
            Ok(index) => Ok(index),
            Err(err @ IndexError::Corrupt { .. }) => {
                warn!("{err}, synchronizing every file");
                reporter.step(
                    EventKind::ComputeDelta,
                    EventStatus::Warning,
                    format!("{err}, synchronizing every file"),
                );
                Ok(FileIndex::default())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl std::fmt::Debug for PushPipeline {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("PushPipeline")
            .field("root", &self.root)
            .field("component", &self.descriptor.name())
            .field("platform", &self.adapter.name())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

/// Push error types.
#[derive(Debug, thiserror::Error)]
pub enum PushError {
    /// Synchronization root is missing or unreadable.
    #[error("synchronization root {:?} is not accessible", root.display())]
    RootNotAccessible {
        #[source]
        source: std::io::Error,
        root: PathBuf,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Ignore(#[from] IgnoreError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Another push of the same pipeline is in flight.
    #[error("another push session is in progress")]
    SessionInProgress,
}

impl PushError {
    /// Stable machine-readable name of this error.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::RootNotAccessible { .. } => "root_not_accessible",
            Self::Resolve(err) => err.error_kind(),
            Self::Index(err) if err.is_root_lost() => "root_not_accessible",
            Self::Index(_) => "index",
            Self::Ignore(_) => "ignore",
            Self::Platform(err) => err.error_kind(),
            Self::Config(_) => "config",
            Self::SessionInProgress => "session_in_progress",
        }
    }

    /// One-line remediation for humans.
    pub fn hint(&self) -> &'static str {
        match self.error_kind() {
            "root_not_accessible" => "check that the source directory exists and is readable",
            "command_not_found" => "check the command id against the component descriptor",
            "no_command" => "declare a command of this group in the component descriptor",
            "ambiguous_command" => "mark exactly one command of the group with isDefault: true",
            "index" => "remove the .devsync directory to force a full resync",
            "ignore" => "fix the ignore pattern",
            "exec" => "inspect the command output above, then push again",
            "transfer" => "push again, unsynchronized changes are retried",
            "delete_timeout" => "check the platform, then delete again",
            "config" => "fix the configuration file",
            "session_in_progress" => "wait for the running push to finish",
            _ => "check that the platform is reachable, then push again",
        }
    }

    /// Whether retrying without changing anything is pointless.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::RootNotAccessible { .. } | Self::Ignore(_) | Self::Config(_) => true,
            Self::Resolve(err) => err.is_fatal(),
            Self::Index(err) => err.is_root_lost(),
            Self::Platform(err) => matches!(
                err,
                PlatformError::NoContainer { .. }
                    | PlatformError::Resolve(_)
                    | PlatformError::Syscall { .. }
            ),
            Self::SessionInProgress => false,
        }
    }

    /// Whether a watch loop must stop after this error.
    pub fn stops_watch(&self) -> bool {
        match self {
            Self::RootNotAccessible { .. } | Self::Config(_) => true,
            Self::Index(err) => err.is_root_lost(),
            _ => false,
        }
    }
}

/// Friendly result alias :3
pub type Result<T, E = PushError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::{Event, MemorySink},
        platform::{LocalEngineContext, LogStream, Labels, StatusStream},
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::{env::current_dir, fs, io::Write};

    const DESCRIPTOR: &str = indoc! {r#"
        metadata:
          name: nodejs
        components:
          - name: runtime
            container:
              image: node:18
        commands:
          - id: install
            exec:
              component: runtime
              commandLine: npm install
              group:
                kind: build
          - id: run
            exec:
              component: runtime
              commandLine: npm start
              group:
                kind: run
    "#};

    /// Adapter recording sessions, failing transfers on demand.
    #[derive(Default, Clone)]
    struct Recorder {
        sessions: Arc<Mutex<Vec<PushSession>>>,
        fail_transfer: Arc<Mutex<bool>>,

        /// Component lost its files, and only accepts a full transfer.
        fresh: Arc<Mutex<bool>>,
    }

    impl PlatformAdapter for Recorder {
        fn name(&self) -> &'static str {
            "recorder"
        }

        fn sync_files(&self, session: &PushSession) -> platform::Result<TransferSummary> {
            if *self.fail_transfer.lock().expect("lock") {
                return Err(PlatformError::Exec {
                    command: "tar".into(),
                    exit_code: Some(1),
                    output: String::new(),
                });
            }
            let mut fresh = self.fresh.lock().expect("lock");
            if *fresh && !session.full_sync {
                return Ok(TransferSummary {
                    provisioned: true,
                    ..Default::default()
                });
            }
            *fresh = false;

            self.sessions.lock().expect("lock").push(session.clone());
            Ok(TransferSummary {
                copied: session.delta.added.len() + session.delta.modified.len(),
                deleted: session.delta.deleted.len(),
                ..Default::default()
            })
        }

        fn run_lifecycle(&self, session: &PushSession, _: bool) -> platform::Result<Vec<LifecycleAction>> {
            Ok(session
                .lifecycle
                .iter()
                .map(|cmd| LifecycleAction::Started(cmd.id.clone()))
                .collect())
        }

        fn exec(&self, _: &str, _: &mut dyn Write) -> platform::Result<()> {
            Ok(())
        }

        fn log(&self, follow: bool, _: &ResolvedCommand) -> platform::Result<LogStream> {
            Ok(LogStream::new(follow, Box::new(|_| Err(std::io::Error::other("no log")))))
        }

        fn delete(&self, _: &Labels, _: bool, _: bool) -> platform::Result<()> {
            Ok(())
        }

        fn test(&self, _: Option<&str>, _: bool) -> platform::Result<()> {
            Ok(())
        }

        fn watch_remote_status(&self) -> platform::Result<StatusStream> {
            Ok(StatusStream::closed())
        }
    }

    fn pipeline(root: &Path, descriptor: &str, recorder: Recorder, sink: MemorySink) -> PushPipeline {
        PushPipeline::with_adapter(
            root,
            Arc::new(descriptor.parse().expect("descriptor")),
            Box::new(recorder),
            PlatformContext::LocalEngine(LocalEngineContext),
            Arc::new(Reporter::new(sink)),
        )
    }

    fn kinds(events: &[Event]) -> Vec<EventKind> {
        events.iter().map(|event| event.kind).collect()
    }

    #[sealed_test]
    fn successful_push_persists_index() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(root.join("app.js"), "console.log(1)")?;
        let sink = MemorySink::new();
        let pipeline = pipeline(&root, DESCRIPTOR, Recorder::default(), sink.clone());

        let outcome = pipeline.push(&PushOptions::default())?;
        assert_eq!(outcome.delta.added.iter().collect::<Vec<_>>(), ["app.js"]);
        assert_eq!(outcome.actions, [LifecycleAction::Started("run".into())]);
        assert_eq!(pipeline.store().load()?.len(), 1);

        let events = sink.events();
        assert_eq!(events.first().map(|event| event.kind), Some(EventKind::Init));
        assert_eq!(events.last().map(|event| event.kind), Some(EventKind::Success));
        assert_eq!(kinds(&events).iter().filter(|kind| kind.is_terminal()).count(), 1);

        let second = pipeline.push(&PushOptions::default())?;
        assert!(second.delta.is_empty());

        Ok(())
    }

    #[sealed_test]
    fn failed_transfer_keeps_index() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(root.join("app.js"), "console.log(1)")?;
        let recorder = Recorder::default();
        *recorder.fail_transfer.lock().expect("lock") = true;
        let sink = MemorySink::new();
        let pipeline = pipeline(&root, DESCRIPTOR, recorder.clone(), sink.clone());

        let err = pipeline.push(&PushOptions::default()).expect_err("transfer fails");
        assert_eq!(err.error_kind(), "exec");
        assert!(!err.is_fatal());
        assert!(!pipeline.store().index_path().exists());
        assert_eq!(sink.events().last().and_then(|event| event.error_kind.clone()), Some("exec".into()));

        *recorder.fail_transfer.lock().expect("lock") = false;
        let outcome = pipeline.push(&PushOptions::default())?;
        assert_eq!(outcome.delta.added.iter().collect::<Vec<_>>(), ["app.js"]);

        Ok(())
    }

    #[sealed_test]
    fn provisioned_component_receives_every_file() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(root.join("app.js"), "console.log(1)")?;
        let recorder = Recorder::default();
        let pipeline = pipeline(&root, DESCRIPTOR, recorder.clone(), MemorySink::new());
        pipeline.push(&PushOptions::default())?;

        fs::write(root.join("lib.js"), "module.exports = {}")?;
        *recorder.fresh.lock().expect("lock") = true;
        let outcome = pipeline.push(&PushOptions::default())?;

        assert!(outcome.transfer.provisioned);
        assert_eq!(outcome.delta.added.iter().collect::<Vec<_>>(), ["app.js", "lib.js"]);
        let sessions = recorder.sessions.lock().expect("lock");
        let last = sessions.last().expect("full transfer");
        assert!(last.full_sync);
        assert_eq!(last.delta.added.len(), 2);
        assert_eq!(pipeline.store().load()?.len(), 2);

        Ok(())
    }

    #[sealed_test]
    fn progress_setting_reaches_session() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(root.join("app.js"), "console.log(1)")?;
        let recorder = Recorder::default();
        let pipeline = pipeline(&root, DESCRIPTOR, recorder.clone(), MemorySink::new());

        pipeline.push(&PushOptions::default())?;
        pipeline.push(&PushOptions {
            force_build: true,
            show_progress: true,
            ..Default::default()
        })?;

        let progress = recorder
            .sessions
            .lock()
            .expect("lock")
            .iter()
            .map(|session| session.show_progress)
            .collect::<Vec<_>>();
        assert_eq!(progress, [false, true]);

        Ok(())
    }

    #[sealed_test]
    fn missing_run_command_is_fatal() -> anyhow::Result<()> {
        let root = current_dir()?;
        let descriptor = indoc! {r#"
            components:
              - name: runtime
                container:
                  image: node:18
            commands:
              - id: install
                exec:
                  component: runtime
                  commandLine: npm install
                  group:
                    kind: build
        "#};
        let sink = MemorySink::new();
        let pipeline = pipeline(&root, descriptor, Recorder::default(), sink.clone());

        let err = pipeline.push(&PushOptions::default()).expect_err("no run command");
        assert_eq!(err.error_kind(), "no_command");
        assert!(err.is_fatal());
        assert!(!err.stops_watch());
        assert_eq!(kinds(&sink.events()), [EventKind::Init, EventKind::ResolveCommands, EventKind::Failure]);

        Ok(())
    }

    #[sealed_test]
    fn debug_without_debug_command_skips_lifecycle() -> anyhow::Result<()> {
        let root = current_dir()?;
        let recorder = Recorder::default();
        let sink = MemorySink::new();
        let pipeline = pipeline(&root, DESCRIPTOR, recorder.clone(), sink.clone());

        let outcome = pipeline.push(&PushOptions {
            debug: true,
            ..Default::default()
        })?;
        assert!(outcome.actions.is_empty());
        assert!(sink
            .events()
            .iter()
            .any(|event| event.status == EventStatus::Warning && event.kind == EventKind::ResolveCommands));

        Ok(())
    }

    #[sealed_test]
    fn corrupt_index_falls_back_to_full_sync() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(root.join("app.js"), "console.log(1)")?;
        fs::create_dir_all(root.join(".devsync"))?;
        fs::write(root.join(".devsync/file-index.json"), "{ not json")?;
        let pipeline = pipeline(&root, DESCRIPTOR, Recorder::default(), MemorySink::new());

        let outcome = pipeline.push(&PushOptions::default())?;
        assert_eq!(outcome.delta.added.iter().collect::<Vec<_>>(), ["app.js"]);
        assert_eq!(pipeline.store().load()?.len(), 1);

        Ok(())
    }

    #[test]
    fn missing_root_is_not_accessible() {
        let pipeline = pipeline(
            Path::new("/nonexistent/devsync/root"),
            DESCRIPTOR,
            Recorder::default(),
            MemorySink::new(),
        );
        let err = pipeline.push(&PushOptions::default()).expect_err("no root");
        assert_eq!(err.error_kind(), "root_not_accessible");
        assert!(err.stops_watch());
    }

    #[sealed_test]
    fn concurrent_push_is_rejected() -> anyhow::Result<()> {
        let root = current_dir()?;
        let pipeline = pipeline(&root, DESCRIPTOR, Recorder::default(), MemorySink::new());
        let _held = pipeline.session.lock().expect("session lock");

        let err = pipeline.push(&PushOptions::default()).expect_err("in progress");
        assert_eq!(err.error_kind(), "session_in_progress");

        Ok(())
    }
}
