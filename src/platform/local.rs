// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Local container engine runtime.
//!
//! Every container of the descriptor runs as its own labelled container named
//! `<component>-<container>`. Containers that mount sources share the named
//! volume `<component>-projects`. The engine cannot report status changes, so
//! [`Runtime::status_stream`] yields a closed stream.

use crate::platform::{
    argv, checked_output, ComponentTarget, Labels, PlatformError, Result, Runtime, Shell,
    StatusStream,
};

use tracing::{debug, info, instrument, warn};

/// Runtime driving a local container engine.
#[derive(Debug, Clone)]
pub struct LocalEngineRuntime {
    binary: String,
}

impl LocalEngineRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Engine name of container declared as `container` in `target`.
    pub fn container_name(target: &ComponentTarget, container: &str) -> String {
        format!("{}-{container}", target.name)
    }

    /// Name of the volume project sources are synchronized into.
    pub fn volume_name(target: &ComponentTarget) -> String {
        format!("{}-projects", target.name)
    }

    fn run(&self, shell: &dyn Shell, args: &[String]) -> Result<String> {
        Ok(checked_output(shell, &self.binary, args, None)?.stdout)
    }

    fn succeeds(&self, shell: &dyn Shell, args: &[String]) -> Result<Option<String>> {
        let output = shell
            .output(&self.binary, args, None)
            .map_err(|err| PlatformError::Syscall {
                source: err,
                program: self.binary.clone(),
            })?;
        Ok(output.success().then_some(output.stdout))
    }

    fn ids(&self, shell: &dyn Shell, labels: &Labels) -> Result<Vec<String>> {
        let mut args = argv(["ps", "-aq"]);
        for (key, value) in labels.iter() {
            args.push("--filter".to_string());
            args.push(format!("label={key}={value}"));
        }

        Ok(self
            .run(shell, &args)?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect())
    }

    fn label_args(labels: &Labels) -> Vec<String> {
        labels
            .iter()
            .flat_map(|(key, value)| ["--label".to_string(), format!("{key}={value}")])
            .collect()
    }
}

impl Runtime for LocalEngineRuntime {
    fn name(&self) -> &'static str {
        "local-engine"
    }

    #[instrument(skip(self, shell, target), level = "debug")]
    fn ensure_running(&self, shell: &dyn Shell, target: &ComponentTarget) -> Result<bool> {
        if target.descriptor.containers().next().is_none() {
            return Err(PlatformError::NoContainer {
                component: target.name.clone(),
            });
        }

        let mut created = false;
        let volume = Self::volume_name(target);
        if self.succeeds(shell, &argv(["volume", "inspect", &volume]))?.is_none() {
            let mut args = argv(["volume", "create"]);
            args.extend(Self::label_args(&target.labels));
            args.push(volume.clone());
            self.run(shell, &args)?;
            created = true;
            debug!("created volume {volume}");
        }

        for (name, container) in target.descriptor.containers() {
            let engine_name = Self::container_name(target, name);
            let state = self.succeeds(
                shell,
                &argv(["container", "inspect", "-f", "{{.State.Running}}", &engine_name]),
            )?;

            match state {
                Some(running) if running.trim() == "true" => {
                    debug!("{engine_name} already running");
                }
                Some(_) => {
                    self.run(shell, &argv(["start", &engine_name]))?;
                    info!("started {engine_name}");
                }
                None => {
                    let mut args = argv(["run", "-d", "--name", &engine_name]);
                    args.extend(Self::label_args(&target.labels));
                    if container.mounts_sources() {
                        args.push("-v".to_string());
                        args.push(format!("{volume}:{}", container.source_mapping()));
                    }
                    for var in &container.env {
                        args.push("-e".to_string());
                        args.push(format!("{}={}", var.name, var.value));
                    }
                    for endpoint in &container.endpoints {
                        args.push("-p".to_string());
                        args.push(format!("{0}:{0}", endpoint.target_port));
                    }
                    args.extend(argv([&container.image, "tail", "-f", "/dev/null"]));
                    self.run(shell, &args)?;
                    created = true;
                    info!("created {engine_name} from {}", container.image);
                }
            }
        }

        Ok(created)
    }

    fn exec_argv(
        &self,
        _shell: &dyn Shell,
        target: &ComponentTarget,
        container: &str,
        interactive: bool,
        script: &str,
    ) -> Result<(String, Vec<String>)> {
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        args.extend([
            Self::container_name(target, container),
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]);

        Ok((self.binary.clone(), args))
    }

    #[instrument(skip(self, shell, target, labels), level = "debug")]
    fn delete(&self, shell: &dyn Shell, target: &ComponentTarget, labels: &Labels) -> Result<()> {
        let ids = self.ids(shell, labels)?;
        if !ids.is_empty() {
            let mut args = argv(["rm", "-f"]);
            args.extend(ids);
            self.run(shell, &args)?;
        }

        let volume = Self::volume_name(target);
        if self
            .succeeds(shell, &argv(["volume", "rm", "-f", &volume]))?
            .is_none()
        {
            warn!("volume {volume} could not be removed");
        }

        info!("requested removal of {}", target.name);
        Ok(())
    }

    fn remaining(&self, shell: &dyn Shell, labels: &Labels) -> Result<usize> {
        Ok(self.ids(shell, labels)?.len())
    }

    fn status_stream(&self, _shell: &dyn Shell, _labels: &Labels) -> Result<StatusStream> {
        Ok(StatusStream::closed())
    }
}
