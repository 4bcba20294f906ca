// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Platform-independent adapter logic.
//!
//! [`Adapter`] implements [`PlatformAdapter`] on top of any [`Runtime`]. It
//! owns everything that works the same on every platform once a shell inside
//! a container is available: packing and unpacking synchronized files,
//! running build commands in the foreground, keeping run and debug commands
//! alive in the background, and tailing their logs.
//!
//! # Background Processes
//!
//! Run and debug commands are started detached inside their container. Output
//! goes to `/tmp/devsync/<command-id>.log`, and the process id is recorded in
//! `/tmp/devsync/<command-id>.pid`, so later sessions can tell whether the
//! command still runs, restart it, or tail its log. Only one run or debug
//! command runs at a time. Starting one stops all others.
//!
//! # Synchronized State
//!
//! After a successful transfer, the source container gets a marker at
//! `/tmp/devsync/synced`. A container that lost the marker was replaced or
//! reset, so it must be assumed to hold none of the synchronized files, no
//! matter what the runtime reported while provisioning it.

use crate::{
    command::{self, ResolvedCommand},
    descriptor::GroupKind,
    index::ChangeDelta,
    platform::{
        checked_output,
        shell::{quote, Shell},
        ComponentTarget, HostShell, Labels, LogStream, PlatformAdapter, PlatformError, Result,
        Runtime, StatusStream,
    },
    push::PushSession,
};

use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::{
    collections::BTreeSet,
    io::{self, Write},
    path::Path,
    sync::Arc,
    thread::sleep,
    time::{Duration, Instant},
};
use tracing::{debug, info, instrument, warn};

/// Directory inside containers holding logs and pid files of commands.
pub const PROCESS_DIR: &str = "/tmp/devsync";

/// Marker left in the source container once files were synchronized into it.
pub const SYNC_MARKER: &str = "/tmp/devsync/synced";

/// Name of the environment variable carrying the debug port.
pub const DEBUG_PORT_VAR: &str = "DEBUG_PORT";

/// What a transfer did.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TransferSummary {
    pub copied: usize,
    pub deleted: usize,

    /// Component was provisioned from scratch before the transfer.
    pub provisioned: bool,

    /// Path inside the container files were synchronized to.
    pub destination: String,
}

impl TransferSummary {
    pub fn is_empty(&self) -> bool {
        self.copied == 0 && self.deleted == 0
    }
}

/// What happened to a lifecycle command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "command", rename_all = "snake_case")]
pub enum LifecycleAction {
    /// Build command ran to completion.
    Built(String),

    /// Command was not running, and got started.
    Started(String),

    /// Running command was killed, and started again.
    Restarted(String),

    /// Running command was left alone.
    LeftRunning(String),
}

/// Platform adapter over a concrete runtime.
pub struct Adapter<R, S = HostShell>
where
    R: Runtime + 'static,
    S: Shell + 'static,
{
    runtime: Arc<R>,
    shell: Arc<S>,
    target: ComponentTarget,
    timeout: Duration,
    poll: Duration,
}

impl<R, S> Adapter<R, S>
where
    R: Runtime + 'static,
    S: Shell + 'static,
{
    pub fn new(runtime: R, shell: S, target: ComponentTarget, timeout: Duration) -> Self {
        Self {
            runtime: Arc::new(runtime),
            shell: Arc::new(shell),
            target,
            timeout,
            poll: Duration::from_secs(1),
        }
    }

    /// Set interval between checks while waiting for deletion.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub fn shell(&self) -> &S {
        self.shell.as_ref()
    }

    pub fn target(&self) -> &ComponentTarget {
        &self.target
    }

    /// Container that project sources are synchronized into, and its mapping.
    fn source_container(&self) -> Result<(String, String)> {
        let descriptor = &self.target.descriptor;
        descriptor
            .containers()
            .find(|(_, container)| container.mounts_sources())
            .map(|(name, container)| (name.to_string(), container.source_mapping().to_string()))
            .ok_or_else(|| PlatformError::NoContainer {
                component: self.target.name.clone(),
            })
    }

    /// Container a resolved command runs in.
    fn command_container(&self, command: &ResolvedCommand) -> Result<String> {
        match self.target.descriptor.component(&command.component) {
            Some(component) if component.container.is_some() => Ok(component.name.clone()),
            _ => Err(PlatformError::NoContainer {
                component: command.component.clone(),
            }),
        }
    }

    /// Run script in container, and fail unless it exits successfully.
    fn run_script(&self, container: &str, stdin: Option<&[u8]>, script: &str) -> Result<()> {
        let (program, args) = self.runtime.exec_argv(
            self.shell.as_ref(),
            &self.target,
            container,
            stdin.is_some(),
            script,
        )?;
        checked_output(self.shell.as_ref(), &program, &args, stdin)?;
        Ok(())
    }

    /// Run script in container, feeding each output line to `sink`.
    ///
    /// Returns the exit code of the script.
    fn stream_script(
        &self,
        container: &str,
        script: &str,
        mut sink: impl FnMut(&str) -> io::Result<()>,
    ) -> Result<Option<i32>> {
        let (program, args) =
            self.runtime
                .exec_argv(self.shell.as_ref(), &self.target, container, false, script)?;
        let syscall = |err| PlatformError::Syscall {
            source: err,
            program: program.clone(),
        };

        let mut source = self.shell.lines(&program, &args).map_err(syscall)?;
        while let Some(line) = source.next_line().map_err(syscall)? {
            sink(&line).map_err(syscall)?;
        }

        source.wait().map_err(syscall)
    }

    /// Run command to completion, logging its output.
    fn run_foreground(&self, command: &ResolvedCommand) -> Result<()> {
        let container = self.command_container(command)?;
        let script = foreground_script(command)?;
        info!("run {} command {:?}", command.kind, command.id);

        let exit_code = self.stream_script(&container, &script, |line| {
            info!("{line}");
            Ok(())
        })?;

        if exit_code != Some(0) {
            return Err(PlatformError::Exec {
                command: command.command_line.clone(),
                exit_code,
                output: String::new(),
            });
        }

        Ok(())
    }

    /// Whether script exits successfully in container.
    fn check(&self, container: &str, script: &str) -> Result<bool> {
        let (program, args) =
            self.runtime
                .exec_argv(self.shell.as_ref(), &self.target, container, false, script)?;
        let output = self
            .shell
            .output(&program, &args, None)
            .map_err(|err| PlatformError::Syscall {
                source: err,
                program: program.clone(),
            })?;

        Ok(output.success())
    }

    fn is_running(&self, command: &ResolvedCommand) -> Result<bool> {
        let container = self.command_container(command)?;
        let pid = quote(&pid_path(&command.id))?;
        self.check(&container, &format!("[ -f {pid} ] && kill -0 \"$(cat {pid})\" 2>/dev/null"))
    }

    fn holds_marker(&self, container: &str) -> Result<bool> {
        self.check(container, &format!("[ -f {} ]", quote(SYNC_MARKER)?))
    }

    /// Stop every run and debug command other than `keep`.
    fn stop_others(&self, keep: &ResolvedCommand) -> Result<()> {
        for other in command::lifecycle_commands(&self.target.descriptor) {
            if other.id == keep.id {
                continue;
            }

            let Ok(container) = self.command_container(&other) else {
                continue;
            };
            debug!("stop {} command {:?}", other.kind, other.id);
            self.run_script(&container, None, &stop_script(&other.id)?)?;
        }

        Ok(())
    }

    /// Start command detached, killing a previous instance of it.
    ///
    /// With `debug_port`, the command learns its debug port through
    /// [`DEBUG_PORT_VAR`].
    fn start_detached(&self, command: &ResolvedCommand, debug_port: Option<u16>) -> Result<()> {
        let container = self.command_container(command)?;
        let mut command = command.clone();
        if let Some(port) = debug_port {
            command.env.push((DEBUG_PORT_VAR.to_string(), port.to_string()));
        }

        let script = detached_script(&command)?;
        info!("start {} command {:?}", command.kind, command.id);
        self.run_script(&container, None, &script)
    }
}

impl<R, S> PlatformAdapter for Adapter<R, S>
where
    R: Runtime + 'static,
    S: Shell + 'static,
{
    fn name(&self) -> &'static str {
        self.runtime.name()
    }

    #[instrument(skip(self, session), level = "debug")]
    fn sync_files(&self, session: &PushSession) -> Result<TransferSummary> {
        let bar = spinner(
            session.show_progress,
            format!("waiting for {} to run", self.target.name),
        )?;
        let created = self.runtime.ensure_running(self.shell.as_ref(), &self.target);
        bar.finish_and_clear();
        let created = created?;

        let (container, destination) = self.source_container()?;
        let marked = !created && self.holds_marker(&container)?;
        let mut summary = TransferSummary {
            provisioned: !marked,
            destination: destination.clone(),
            ..Default::default()
        };

        if summary.provisioned && !session.full_sync {
            // INVARIANT: A partial delta never goes into an empty component.
            debug!("{container} holds no synchronized files, full transfer required");
            return Ok(summary);
        }

        if session.delta.is_empty() && marked {
            debug!("nothing to transfer into {container}");
            return Ok(summary);
        }

        // INVARIANT: Clear paths before unpacking, so a file replaced by a
        // directory (or the reverse) does not block the archive.
        let clear = paths_to_clear(&session.delta);
        if !clear.is_empty() {
            let paths = clear
                .iter()
                .map(|path| quote(path))
                .collect::<Result<Vec<_>, _>>()?;
            let script = format!("cd {} && rm -rf -- {}", quote(&destination)?, paths.join(" "));
            self.run_script(&container, None, &script)?;
            summary.deleted = session.delta.deleted.len();
        }

        let (archive, copied) = pack(&session.root, &session.delta)?;
        if copied > 0 {
            let destination = quote(&destination)?;
            let script = format!("mkdir -p {destination} && tar xf - -C {destination}");
            self.run_script(&container, Some(&archive), &script)?;
            summary.copied = copied;
        }

        if !marked {
            let script = format!("mkdir -p {PROCESS_DIR} && touch {}", quote(SYNC_MARKER)?);
            self.run_script(&container, None, &script)?;
        }

        info!(
            "synchronized {} file(s), removed {} file(s) in {container}:{destination}",
            summary.copied, summary.deleted
        );
        Ok(summary)
    }

    #[instrument(skip(self, session), level = "debug")]
    fn run_lifecycle(&self, session: &PushSession, changed: bool) -> Result<Vec<LifecycleAction>> {
        let mut actions = Vec::new();
        let Some(lifecycle) = &session.lifecycle else {
            debug!("no lifecycle command to run");
            return Ok(actions);
        };

        let running = self.is_running(lifecycle)?;
        let refresh = changed || session.force_build;
        if running && (!refresh || (lifecycle.hot_reload_capable && !session.force_build)) {
            debug!("leave {:?} running", lifecycle.id);
            actions.push(LifecycleAction::LeftRunning(lifecycle.id.clone()));
            return Ok(actions);
        }

        if refresh {
            if let Some(build) = &session.build {
                self.run_foreground(build)?;
                actions.push(LifecycleAction::Built(build.id.clone()));
            }
        }

        self.stop_others(lifecycle)?;
        self.start_detached(lifecycle, session.debug.then_some(session.debug_port))?;
        actions.push(if running {
            LifecycleAction::Restarted(lifecycle.id.clone())
        } else {
            LifecycleAction::Started(lifecycle.id.clone())
        });

        Ok(actions)
    }

    #[instrument(skip(self, output), level = "debug")]
    fn exec(&self, command_line: &str, output: &mut dyn Write) -> Result<()> {
        let (container, mapping) = self.source_container()?;
        let script = format!("cd {} && sh -c {} 2>&1", quote(&mapping)?, quote(command_line)?);
        let exit_code = self.stream_script(&container, &script, |line| writeln!(output, "{line}"))?;

        if exit_code != Some(0) {
            return Err(PlatformError::Exec {
                command: command_line.to_string(),
                exit_code,
                output: String::new(),
            });
        }

        Ok(())
    }

    #[instrument(skip(self, command), level = "debug")]
    fn log(&self, follow: bool, command: &ResolvedCommand) -> Result<LogStream> {
        let container = self.command_container(command)?;
        let log = quote(&log_path(&command.id))?;
        let runtime = Arc::clone(&self.runtime);
        let shell = Arc::clone(&self.shell);
        let target = self.target.clone();

        Ok(LogStream::new(
            follow,
            Box::new(move |seen| {
                let argv = |script: &str| {
                    runtime
                        .exec_argv(shell.as_ref(), &target, &container, false, script)
                        .map_err(io::Error::other)
                };

                // INVARIANT: A restarted command truncates its log, so resume
                // from the start once the log is shorter than what was seen.
                let mut start = seen;
                if seen > 0 {
                    let (program, args) = argv(&format!("wc -l < {log} 2>/dev/null || echo 0"))?;
                    let length = shell
                        .output(&program, &args, None)?
                        .stdout
                        .trim()
                        .parse::<usize>()
                        .unwrap_or(0);
                    if length < seen {
                        debug!("log shrank to {length} line(s), reading it from the start");
                        start = 0;
                    }
                }

                let flags = if follow { " -F" } else { "" };
                let (program, args) = argv(&format!("tail -n +{}{flags} {log} 2>/dev/null", start + 1))?;
                Ok((start, shell.lines(&program, &args)?))
            }),
        ))
    }

    #[instrument(skip(self, labels), level = "debug")]
    fn delete(&self, labels: &Labels, show_progress: bool, wait: bool) -> Result<()> {
        let bar = spinner(show_progress, format!("deleting {}", self.target.name))?;
        let result = self.delete_and_wait(labels, wait);
        bar.finish_and_clear();
        result
    }

    #[instrument(skip(self), level = "debug")]
    fn test(&self, command_name: Option<&str>, show_progress: bool) -> Result<()> {
        let command = command::resolve(&self.target.descriptor, GroupKind::Test, command_name)?;
        let bar = spinner(show_progress, format!("running test command {:?}", command.id))?;
        let result = self
            .runtime
            .ensure_running(self.shell.as_ref(), &self.target)
            .and_then(|_| self.run_foreground(&command));
        bar.finish_and_clear();
        result
    }

    fn watch_remote_status(&self) -> Result<StatusStream> {
        self.runtime
            .status_stream(self.shell.as_ref(), &self.target.labels)
    }
}

impl<R, S> Adapter<R, S>
where
    R: Runtime + 'static,
    S: Shell + 'static,
{
    fn delete_and_wait(&self, labels: &Labels, wait: bool) -> Result<()> {
        self.runtime.delete(self.shell.as_ref(), &self.target, labels)?;
        if !wait {
            return Ok(());
        }

        let start = Instant::now();
        loop {
            let remaining = self.runtime.remaining(self.shell.as_ref(), labels)?;
            if remaining == 0 {
                info!("deleted {}", self.target.name);
                return Ok(());
            }

            if start.elapsed() >= self.timeout {
                warn!("{remaining} resource(s) of {} still present", self.target.name);
                return Err(PlatformError::DeleteTimeout {
                    selector: labels.selector(),
                    waited: start.elapsed(),
                });
            }

            debug!("{remaining} resource(s) left, waiting");
            sleep(self.poll);
        }
    }
}

impl<R, S> std::fmt::Debug for Adapter<R, S>
where
    R: Runtime + 'static,
    S: Shell + 'static,
{
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("Adapter")
            .field("runtime", &self.runtime.name())
            .field("target", &self.target.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Spinner shown while waiting on the platform, hidden unless `show`.
fn spinner(show: bool, message: impl Into<String>) -> Result<ProgressBar> {
    if !show {
        return Ok(ProgressBar::hidden());
    }

    let bar = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{elapsed_precise:.green}  {spinner:.yellow}  {msg}")?
        .tick_chars("-Cco. ");
    bar.set_style(style);
    bar.set_message(message.into());
    bar.enable_steady_tick(Duration::from_millis(100));
    Ok(bar)
}

/// Paths to remove in the component before unpacking `delta`.
///
/// Besides deleted paths, this covers added files that replace a directory
/// whose content got deleted.
fn paths_to_clear(delta: &ChangeDelta) -> BTreeSet<&String> {
    let mut clear = delta.deleted.iter().collect::<BTreeSet<_>>();
    for added in &delta.added {
        let prefix = format!("{added}/");
        if delta.deleted.iter().any(|deleted| deleted.starts_with(&prefix)) {
            clear.insert(added);
        }
    }
    clear
}

/// Pack added and modified files of `delta` into a tar archive.
fn pack(root: &Path, delta: &ChangeDelta) -> Result<(Vec<u8>, usize)> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut count = 0;
    for key in delta.to_transfer() {
        builder
            .append_path_with_name(root.join(key), key)
            .map_err(|err| PlatformError::Transfer {
                source: err,
                path: key.clone(),
            })?;
        count += 1;
    }

    let archive = builder.into_inner().map_err(|err| PlatformError::Transfer {
        source: err,
        path: root.display().to_string(),
    })?;
    Ok((archive, count))
}

pub(crate) fn log_path(command_id: &str) -> String {
    format!("{PROCESS_DIR}/{command_id}.log")
}

pub(crate) fn pid_path(command_id: &str) -> String {
    format!("{PROCESS_DIR}/{command_id}.pid")
}

fn exports(env: &[(String, String)]) -> Result<String> {
    let mut exports = String::new();
    for (name, value) in env {
        exports.push_str(format!("export {name}={}; ", quote(value)?).as_str());
    }
    Ok(exports)
}

/// Script running command in its working directory with combined output.
fn foreground_script(command: &ResolvedCommand) -> Result<String> {
    Ok(format!(
        "cd {} && {}sh -c {} 2>&1",
        quote(&command.working_dir)?,
        exports(&command.env)?,
        quote(&command.command_line)?,
    ))
}

/// Script stopping background command, if it runs.
fn stop_script(command_id: &str) -> Result<String> {
    let pid = quote(&pid_path(command_id))?;
    Ok(format!(
        "if [ -f {pid} ]; then kill -TERM -- -\"$(cat {pid})\" 2>/dev/null || kill -TERM \"$(cat {pid})\" 2>/dev/null; rm -f {pid}; fi"
    ))
}

/// Script (re)starting command in the background.
fn detached_script(command: &ResolvedCommand) -> Result<String> {
    let pid = quote(&pid_path(&command.id))?;
    let log = quote(&log_path(&command.id))?;
    let lines = [
        format!("mkdir -p {PROCESS_DIR}"),
        stop_script(&command.id)?,
        format!("cd {} || exit 1", quote(&command.working_dir)?),
        format!(
            "{}nohup sh -c {} > {log} 2>&1 < /dev/null &",
            exports(&command.env)?,
            quote(&command.command_line)?
        ),
        format!("echo $! > {pid}"),
    ];
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::Descriptor,
        platform::{
            shell::scripted::ScriptedShell, ClusterRuntime, LocalEngineContext, LocalEngineRuntime,
            PlatformContext, ShellOutput,
        },
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::{
        env::current_dir,
        fs,
        sync::atomic::{AtomicUsize, Ordering},
    };
    use uuid::Uuid;

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
              hotReloadCapable: true
              group:
                kind: run
          - id: inspect
            exec:
              component: runtime
              commandLine: npm run debug
              group:
                kind: debug
          - id: unit
            exec:
              component: runtime
              commandLine: npm test
              group:
                kind: test
    "#};

    fn adapter(shell: ScriptedShell) -> Adapter<LocalEngineRuntime, ScriptedShell> {
        let descriptor: Descriptor = DESCRIPTOR.parse().expect("descriptor");
        Adapter::new(
            LocalEngineRuntime::new("podman"),
            shell,
            ComponentTarget::new(Arc::new(descriptor)),
            Duration::from_millis(50),
        )
        .with_poll_interval(Duration::from_millis(1))
    }

    fn session(root: &Path, delta: ChangeDelta) -> PushSession {
        let descriptor: Descriptor = DESCRIPTOR.parse().expect("descriptor");
        PushSession {
            id: Uuid::new_v4(),
            root: root.to_path_buf(),
            build: command::resolve(&descriptor, GroupKind::Build, None).ok(),
            lifecycle: command::resolve(&descriptor, GroupKind::Run, None).ok(),
            delta,
            full_sync: false,
            force_build: false,
            debug: false,
            debug_port: 5858,
            show_progress: false,
            context: PlatformContext::LocalEngine(LocalEngineContext),
        }
    }

    fn debug_session(lifecycle: &str) -> PushSession {
        let descriptor: Descriptor = DESCRIPTOR.parse().expect("descriptor");
        PushSession {
            lifecycle: command::resolve(&descriptor, GroupKind::Debug, Some(lifecycle)).ok(),
            debug: true,
            ..session(Path::new("/src"), ChangeDelta::default())
        }
    }

    fn is_pid_check(args: &[String]) -> bool {
        args.last().is_some_and(|script| script.contains("kill -0"))
    }

    fn script(call: &crate::platform::shell::scripted::Call) -> String {
        call.args.last().cloned().unwrap_or_default()
    }

    /// Position of the first call whose script contains `needle`.
    fn position(calls: &[crate::platform::shell::scripted::Call], needle: &str) -> Option<usize> {
        calls.iter().position(|call| script(call).contains(needle))
    }

    #[sealed_test]
    fn transfer_packs_changes_and_removes_deletions() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(root.join("app.js"), "console.log(1)")?;
        let mut delta = ChangeDelta::default();
        delta.added.insert("app.js".into());
        delta.deleted.insert("old file.js".into());

        let adapter = adapter(ScriptedShell::succeeding());
        let summary = adapter.sync_files(&session(&root, delta))?;
        assert_eq!(summary.copied, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.destination, "/projects");

        let calls = adapter.shell().calls();
        let unpack = calls
            .iter()
            .find(|call| call.line().contains("tar xf - -C /projects"))
            .expect("unpack call");
        assert_eq!(unpack.args[..3], ["exec", "-i", "nodejs-runtime"]);
        let mut archive = tar::Archive::new(unpack.stdin.as_deref().expect("archive"));
        let names = archive
            .entries()?
            .map(|entry| Ok(entry?.path()?.display().to_string()))
            .collect::<io::Result<Vec<_>>>()?;
        assert_eq!(names, ["app.js"]);

        let remove = position(&calls, "rm -rf").expect("remove call");
        assert_eq!(script(&calls[remove]), "cd /projects && rm -rf -- 'old file.js'");
        assert!(remove < position(&calls, "tar xf").expect("unpack call"));

        Ok(())
    }

    #[sealed_test]
    fn file_replaced_by_directory_is_removed_first() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::create_dir(root.join("foo"))?;
        fs::write(root.join("foo/x"), "x")?;
        let mut delta = ChangeDelta::default();
        delta.added.insert("foo/x".into());
        delta.deleted.insert("foo".into());

        let adapter = adapter(ScriptedShell::succeeding());
        adapter.sync_files(&session(&root, delta))?;

        let calls = adapter.shell().calls();
        let remove = position(&calls, "rm -rf -- foo").expect("remove call");
        let unpack = position(&calls, "tar xf").expect("unpack call");
        assert!(remove < unpack);

        Ok(())
    }

    #[sealed_test]
    fn directory_replaced_by_file_is_cleared_first() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(root.join("foo"), "now a file")?;
        let mut delta = ChangeDelta::default();
        delta.added.insert("foo".into());
        delta.deleted.insert("foo/x".into());

        let adapter = adapter(ScriptedShell::succeeding());
        let summary = adapter.sync_files(&session(&root, delta))?;
        assert_eq!(summary.deleted, 1);

        let calls = adapter.shell().calls();
        let remove = position(&calls, "rm -rf").expect("remove call");
        assert_eq!(script(&calls[remove]), "cd /projects && rm -rf -- foo foo/x");
        assert!(remove < position(&calls, "tar xf").expect("unpack call"));

        Ok(())
    }

    #[sealed_test]
    fn container_without_marker_needs_full_transfer() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(root.join("app.js"), "console.log(1)")?;
        let mut delta = ChangeDelta::default();
        delta.added.insert("app.js".into());
        let adapter = adapter(ScriptedShell::new(|args| match args.last() {
            Some(script) if script.contains(SYNC_MARKER) && script.starts_with("[ -f") => {
                ShellOutput::failed(1, "")
            }
            _ => ShellOutput::ok(""),
        }));

        let partial = adapter.sync_files(&session(&root, delta.clone()))?;
        assert!(partial.provisioned);
        assert!(partial.is_empty());
        assert_eq!(position(&adapter.shell().calls(), "tar xf"), None);

        let full = adapter.sync_files(&PushSession {
            full_sync: true,
            ..session(&root, delta)
        })?;
        assert!(full.provisioned);
        assert_eq!(full.copied, 1);
        let calls = adapter.shell().calls();
        let touch = position(&calls, "touch /tmp/devsync/synced").expect("marker call");
        assert!(position(&calls, "tar xf").expect("unpack call") < touch);

        Ok(())
    }

    #[sealed_test]
    fn reconfigured_cluster_component_needs_full_transfer() -> anyhow::Result<()> {
        let root = current_dir()?;
        fs::write(root.join("app.js"), "console.log(1)")?;
        let mut delta = ChangeDelta::default();
        delta.modified.insert("app.js".into());

        let descriptor: Descriptor = DESCRIPTOR.parse()?;
        let adapter = Adapter::new(
            ClusterRuntime::new("kubectl", "dev", Duration::from_secs(1)),
            ScriptedShell::new(|args| match args.first().map(String::as_str) {
                Some("apply") => ShellOutput::ok("deployment.apps/nodejs configured\n"),
                Some("get") => ShellOutput::ok("pod/nodejs-7f9c\n"),
                _ if args.last().is_some_and(|script| script.starts_with("[ -f")) => {
                    ShellOutput::failed(1, "")
                }
                _ => ShellOutput::ok(""),
            }),
            ComponentTarget::new(Arc::new(descriptor)),
            Duration::from_secs(1),
        );

        let summary = adapter.sync_files(&session(&root, delta))?;
        assert!(summary.provisioned);
        assert_eq!(position(&adapter.shell().calls(), "tar xf"), None);

        Ok(())
    }

    #[test]
    fn disabled_progress_draws_no_spinner() -> anyhow::Result<()> {
        assert!(spinner(false, "waiting for nodejs to run")?.is_hidden());

        Ok(())
    }

    #[sealed_test]
    fn empty_delta_transfers_nothing() -> anyhow::Result<()> {
        let adapter = adapter(ScriptedShell::succeeding());
        let summary = adapter.sync_files(&session(&current_dir()?, ChangeDelta::default()))?;
        assert!(summary.is_empty());
        assert!(adapter
            .shell()
            .calls()
            .iter()
            .all(|call| !call.line().contains("tar xf")));

        Ok(())
    }

    #[test]
    fn changes_build_and_start_stopped_command() -> anyhow::Result<()> {
        let adapter = adapter(ScriptedShell::new(|args| {
            if is_pid_check(args) {
                ShellOutput::failed(1, "")
            } else {
                ShellOutput::ok("")
            }
        }));
        let actions = adapter.run_lifecycle(&session(Path::new("/src"), ChangeDelta::default()), true)?;
        assert_eq!(
            actions,
            [
                LifecycleAction::Built("install".into()),
                LifecycleAction::Started("run".into())
            ]
        );

        let calls = adapter.shell().calls();
        let start = script(calls.last().expect("start call"));
        assert!(start.contains("nohup sh -c 'npm start' > /tmp/devsync/run.log 2>&1"));
        assert!(start.contains("echo $! > /tmp/devsync/run.pid"));
        assert!(!start.contains(DEBUG_PORT_VAR));

        let stop = position(&calls, "rm -f /tmp/devsync/inspect.pid").expect("stop debug call");
        assert!(stop < calls.len() - 1);

        Ok(())
    }

    #[test]
    fn debug_session_stops_run_command() -> anyhow::Result<()> {
        let adapter = adapter(ScriptedShell::new(|args| {
            if is_pid_check(args) {
                ShellOutput::failed(1, "")
            } else {
                ShellOutput::ok("")
            }
        }));
        let actions = adapter.run_lifecycle(&debug_session("inspect"), false)?;
        assert_eq!(actions, [LifecycleAction::Started("inspect".into())]);

        let calls = adapter.shell().calls();
        let stop = position(&calls, "kill -TERM -- -\"$(cat /tmp/devsync/run.pid)\"").expect("stop run call");
        let start = position(&calls, "nohup sh -c 'npm run debug'").expect("start call");
        assert!(stop < start);
        assert!(script(&calls[start]).contains("export DEBUG_PORT=5858; "));

        Ok(())
    }

    #[test]
    fn explicit_debug_command_gets_debug_port() -> anyhow::Result<()> {
        let adapter = adapter(ScriptedShell::new(|args| {
            if is_pid_check(args) {
                ShellOutput::failed(1, "")
            } else {
                ShellOutput::ok("")
            }
        }));
        let session = debug_session("run");
        assert_eq!(session.lifecycle.as_ref().map(|cmd| cmd.kind), Some(GroupKind::Run));
        adapter.run_lifecycle(&session, false)?;

        let calls = adapter.shell().calls();
        assert!(script(calls.last().expect("start call")).contains("export DEBUG_PORT=5858; nohup sh -c 'npm start'"));

        Ok(())
    }

    #[test]
    fn running_hot_reload_command_is_left_alone() -> anyhow::Result<()> {
        let adapter = adapter(ScriptedShell::succeeding());
        let actions = adapter.run_lifecycle(&session(Path::new("/src"), ChangeDelta::default()), true)?;
        assert_eq!(actions, [LifecycleAction::LeftRunning("run".into())]);

        Ok(())
    }

    #[test]
    fn force_build_restarts_running_command() -> anyhow::Result<()> {
        let adapter = adapter(ScriptedShell::succeeding());
        let mut session = session(Path::new("/src"), ChangeDelta::default());
        session.force_build = true;
        let actions = adapter.run_lifecycle(&session, false)?;
        assert_eq!(
            actions,
            [
                LifecycleAction::Built("install".into()),
                LifecycleAction::Restarted("run".into())
            ]
        );

        Ok(())
    }

    #[test]
    fn failed_build_carries_exit_code() {
        let adapter = adapter(ScriptedShell::new(|args| {
            match args.last() {
                Some(script) if script.contains("kill -0") => ShellOutput::failed(1, ""),
                Some(script) if script.contains("npm install") => ShellOutput::failed(2, ""),
                _ => ShellOutput::ok(""),
            }
        }));
        let result = adapter.run_lifecycle(&session(Path::new("/src"), ChangeDelta::default()), true);
        assert!(matches!(result, Err(PlatformError::Exec { exit_code: Some(2), .. })));
    }

    #[test]
    fn exec_streams_output_and_surfaces_exit_code() {
        let adapter = adapter(ScriptedShell::new(|_| ShellOutput {
            code: Some(3),
            stdout: "line 1\nline 2\n".into(),
            stderr: String::new(),
        }));
        let mut output = Vec::new();
        let result = adapter.exec("ls -la", &mut output);

        assert_eq!(String::from_utf8_lossy(&output), "line 1\nline 2\n");
        assert_eq!(result.err().and_then(|err| err.exit_code()), Some(3));
        let call = adapter.shell().calls().remove(0);
        assert_eq!(call.args.last().map(String::as_str), Some("cd /projects && sh -c 'ls -la' 2>&1"));
    }

    #[test]
    fn log_without_follow_is_finite() -> anyhow::Result<()> {
        let adapter = adapter(ScriptedShell::new(|_| ShellOutput::ok("started\nlistening\n")));
        let descriptor: Descriptor = DESCRIPTOR.parse()?;
        let run = command::resolve(&descriptor, GroupKind::Run, None)?;
        let lines = adapter.log(false, &run)?.collect::<io::Result<Vec<_>>>()?;
        assert_eq!(lines, ["started", "listening"]);

        let call = adapter.shell().calls().remove(0);
        assert_eq!(
            call.args.last().map(String::as_str),
            Some("tail -n +1 /tmp/devsync/run.log 2>/dev/null")
        );

        Ok(())
    }

    #[test]
    fn followed_log_restarts_when_truncated() -> anyhow::Result<()> {
        let tails = AtomicUsize::new(0);
        let adapter = adapter(ScriptedShell::new(move |args| {
            let script = args.last().cloned().unwrap_or_default();
            if script.starts_with("wc -l") {
                ShellOutput::ok("       1\n")
            } else if tails.fetch_add(1, Ordering::SeqCst) == 0 {
                ShellOutput::ok("a\nb\nc\n")
            } else {
                ShellOutput::ok("restarted\n")
            }
        }));
        let descriptor: Descriptor = DESCRIPTOR.parse()?;
        let run = command::resolve(&descriptor, GroupKind::Run, None)?;
        let lines = adapter
            .log(true, &run)?
            .with_backoff(Duration::ZERO)
            .take(4)
            .collect::<io::Result<Vec<_>>>()?;
        assert_eq!(lines, ["a", "b", "c", "restarted"]);

        let scripts = adapter.shell().calls().iter().map(script).collect::<Vec<_>>();
        assert_eq!(
            scripts[..3],
            [
                "tail -n +1 -F /tmp/devsync/run.log 2>/dev/null",
                "wc -l < /tmp/devsync/run.log 2>/dev/null || echo 0",
                "tail -n +1 -F /tmp/devsync/run.log 2>/dev/null",
            ]
        );

        Ok(())
    }

    #[test]
    fn delete_times_out_while_resources_remain() {
        let adapter = adapter(ScriptedShell::new(|args| {
            if args.first().map(String::as_str) == Some("ps") {
                ShellOutput::ok("abc123\n")
            } else {
                ShellOutput::ok("")
            }
        }));
        let labels = adapter.target().labels.clone();
        let result = adapter.delete(&labels, false, true);
        assert!(matches!(result, Err(PlatformError::DeleteTimeout { .. })));
    }

    #[test]
    fn unknown_test_command_fails_resolution() {
        let adapter = adapter(ScriptedShell::succeeding());
        match adapter.test(Some("integration"), false) {
            Err(PlatformError::Resolve(err)) => assert_eq!(err.error_kind(), "command_not_found"),
            other => panic!("unexpected result {other:?}"),
        }
        assert!(adapter.test(None, false).is_ok());
    }
}
