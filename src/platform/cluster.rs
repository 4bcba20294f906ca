// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Cluster orchestrator runtime.
//!
//! Components run as a single-replica deployment in one namespace. Every
//! container of the descriptor becomes a container of the deployment's pod,
//! kept alive by an idle entrypoint, with one shared scratch volume mounted at
//! each container's source mapping. Commands are run through the cluster's
//! command line client, `kubectl` by default.

use crate::platform::{
    argv, checked_output, ComponentTarget, Labels, PlatformError, Result, Runtime, Shell,
    StatusStream,
};

use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Name of the volume project sources are synchronized into.
pub const PROJECTS_VOLUME: &str = "devsync-projects";

/// Runtime driving a cluster orchestrator.
#[derive(Debug, Clone)]
pub struct ClusterRuntime {
    binary: String,
    namespace: String,
    timeout: Duration,
}

impl ClusterRuntime {
    pub fn new(binary: impl Into<String>, namespace: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            namespace: namespace.into(),
            timeout,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Generate deployment manifest of component.
    pub fn manifest(&self, target: &ComponentTarget) -> Value {
        let labels = target.labels.as_map();
        let containers = target
            .descriptor
            .containers()
            .map(|(name, container)| {
                let env = container
                    .env
                    .iter()
                    .map(|var| json!({ "name": var.name, "value": var.value }))
                    .collect::<Vec<_>>();
                let ports = container
                    .endpoints
                    .iter()
                    .map(|endpoint| json!({ "name": endpoint.name, "containerPort": endpoint.target_port }))
                    .collect::<Vec<_>>();
                let mounts = if container.mounts_sources() {
                    vec![json!({ "name": PROJECTS_VOLUME, "mountPath": container.source_mapping() })]
                } else {
                    Vec::new()
                };

                json!({
                    "name": name,
                    "image": container.image,
                    "command": ["tail"],
                    "args": ["-f", "/dev/null"],
                    "env": env,
                    "ports": ports,
                    "volumeMounts": mounts,
                })
            })
            .collect::<Vec<_>>();

        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": target.name,
                "namespace": self.namespace,
                "labels": labels,
            },
            "spec": {
                "replicas": 1,
                "selector": { "matchLabels": labels },
                "template": {
                    "metadata": { "labels": labels },
                    "spec": {
                        "volumes": [{ "name": PROJECTS_VOLUME, "emptyDir": {} }],
                        "containers": containers,
                    },
                },
            },
        })
    }

    /// Name of the running pod matching `labels`.
    fn pod(&self, shell: &dyn Shell, target: &ComponentTarget, labels: &Labels) -> Result<String> {
        self.running_pod(shell, labels)?
            .ok_or_else(|| PlatformError::ComponentNotRunning {
                component: target.name.clone(),
                reason: format!("no running pod in namespace {:?}", self.namespace),
            })
    }

    fn running_pod(&self, shell: &dyn Shell, labels: &Labels) -> Result<Option<String>> {
        let args = vec![
            "get".to_string(),
            "pods".to_string(),
            "-n".to_string(),
            self.namespace.clone(),
            "-l".to_string(),
            labels.selector(),
            "--field-selector=status.phase=Running".to_string(),
            "-o".to_string(),
            "name".to_string(),
        ];
        let output = checked_output(shell, &self.binary, &args, None)?;

        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(|line| line.trim_start_matches("pod/").to_string()))
    }
}

impl Runtime for ClusterRuntime {
    fn name(&self) -> &'static str {
        "cluster"
    }

    #[instrument(skip(self, shell, target), level = "debug")]
    fn ensure_running(&self, shell: &dyn Shell, target: &ComponentTarget) -> Result<bool> {
        if target.descriptor.containers().next().is_none() {
            return Err(PlatformError::NoContainer {
                component: target.name.clone(),
            });
        }

        let before = self.running_pod(shell, &target.labels)?;
        let manifest = serde_json::to_vec(&self.manifest(target))?;
        let apply = argv(["apply", "-n", &self.namespace, "-f", "-"]);
        let output = checked_output(shell, &self.binary, &apply, Some(&manifest))?;
        debug!("{}", output.stdout.trim());

        let rollout = vec![
            "rollout".to_string(),
            "status".to_string(),
            format!("deployment/{}", target.name),
            "-n".to_string(),
            self.namespace.clone(),
            format!("--timeout={}s", self.timeout.as_secs()),
        ];
        checked_output(shell, &self.binary, &rollout, None).map_err(|err| {
            PlatformError::ComponentNotRunning {
                component: target.name.clone(),
                reason: err.to_string(),
            }
        })?;

        // INVARIANT: Every pod starts with an empty scratch volume, so a pod
        // other than the one seen before applying holds no synchronized files.
        let after = self.running_pod(shell, &target.labels)?;
        let replaced = before.is_none() || before != after;
        if replaced {
            debug!("pod changed from {before:?} to {after:?}");
        }

        info!("{} is running in namespace {:?}", target.name, self.namespace);
        Ok(replaced)
    }

    fn exec_argv(
        &self,
        shell: &dyn Shell,
        target: &ComponentTarget,
        container: &str,
        interactive: bool,
        script: &str,
    ) -> Result<(String, Vec<String>)> {
        let pod = self.pod(shell, target, &target.labels)?;
        let mut args = vec!["exec".to_string()];
        if interactive {
            args.push("-i".to_string());
        }
        args.extend([
            "-n".to_string(),
            self.namespace.clone(),
            pod,
            "-c".to_string(),
            container.to_string(),
            "--".to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]);

        Ok((self.binary.clone(), args))
    }

    #[instrument(skip(self, shell, target, labels), level = "debug")]
    fn delete(&self, shell: &dyn Shell, target: &ComponentTarget, labels: &Labels) -> Result<()> {
        let args = argv([
            "delete",
            "deployment,pod",
            "-n",
            &self.namespace,
            "-l",
            &labels.selector(),
            "--ignore-not-found",
            "--wait=false",
        ]);
        checked_output(shell, &self.binary, &args, None)?;
        info!("requested removal of {}", target.name);
        Ok(())
    }

    fn remaining(&self, shell: &dyn Shell, labels: &Labels) -> Result<usize> {
        let args = argv([
            "get",
            "deployment,pod",
            "-n",
            &self.namespace,
            "-l",
            &labels.selector(),
            "-o",
            "name",
        ]);
        let output = checked_output(shell, &self.binary, &args, None)?;
        Ok(output.stdout.lines().filter(|line| !line.trim().is_empty()).count())
    }

    fn status_stream(&self, shell: &dyn Shell, labels: &Labels) -> Result<StatusStream> {
        let args = argv([
            "get",
            "pods",
            "-n",
            &self.namespace,
            "-l",
            &labels.selector(),
            "--watch",
            "--no-headers",
            "-o",
            "custom-columns=NAME:.metadata.name,PHASE:.status.phase",
        ]);
        let source = shell
            .lines(&self.binary, &args)
            .map_err(|err| PlatformError::Syscall {
                source: err,
                program: self.binary.clone(),
            })?;

        Ok(StatusStream::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        descriptor::Descriptor,
        platform::{shell::scripted::ScriptedShell, ShellOutput, StatusEvent},
    };
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use std::{
        io,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    fn target() -> ComponentTarget {
        let descriptor: Descriptor = indoc! {r#"
            metadata:
              name: api
            components:
              - name: runtime
                container:
                  image: golang:1.22
                  sourceMapping: /src
                  env:
                    - name: MODE
                      value: dev
                  endpoints:
                    - name: http
                      targetPort: 8080
              - name: db
                container:
                  image: postgres:16
                  mountSources: false
        "#}
        .parse()
        .expect("descriptor");
        ComponentTarget::new(Arc::new(descriptor))
    }

    fn runtime() -> ClusterRuntime {
        ClusterRuntime::new("kubectl", "dev", Duration::from_secs(240))
    }

    #[test]
    fn manifest_mounts_sources_where_requested() {
        let manifest = runtime().manifest(&target());
        let containers = &manifest["spec"]["template"]["spec"]["containers"];

        assert_eq!(manifest["metadata"]["name"], "api");
        assert_eq!(manifest["spec"]["selector"]["matchLabels"]["app.kubernetes.io/instance"], "api");
        assert_eq!(containers[0]["volumeMounts"][0]["mountPath"], "/src");
        assert_eq!(containers[0]["env"][0]["name"], "MODE");
        assert_eq!(containers[0]["ports"][0]["containerPort"], 8080);
        assert_eq!(containers[1]["volumeMounts"], json!([]));
    }

    /// Shell answering pod lookups with `pods` in turn, repeating the last.
    fn shell_with_pods(apply: &'static str, pods: &'static [&'static str]) -> ScriptedShell {
        let lookups = AtomicUsize::new(0);
        ScriptedShell::new(move |args| match args.first().map(String::as_str) {
            Some("apply") => ShellOutput::ok(apply),
            Some("get") => {
                let turn = lookups.fetch_add(1, Ordering::SeqCst).min(pods.len() - 1);
                ShellOutput::ok(pods[turn])
            }
            _ => ShellOutput::ok(""),
        })
    }

    #[test]
    fn ensure_running_applies_manifest_and_waits() -> anyhow::Result<()> {
        let shell = shell_with_pods("deployment.apps/api created\n", &["", "pod/api-5d8c7\n"]);
        assert!(runtime().ensure_running(&shell, &target())?);

        let calls = shell.calls();
        assert!(calls[0].line().starts_with("get pods -n dev -l "));
        assert_eq!(calls[1].line(), "apply -n dev -f -");
        let applied: Value = serde_json::from_slice(calls[1].stdin.as_deref().unwrap_or_default())?;
        assert_eq!(applied["kind"], "Deployment");
        assert_eq!(calls[2].line(), "rollout status deployment/api -n dev --timeout=240s");

        Ok(())
    }

    #[test]
    fn configured_rollout_with_new_pod_is_fresh() -> anyhow::Result<()> {
        let shell = shell_with_pods(
            "deployment.apps/api configured\n",
            &["pod/api-5d8c7\n", "pod/api-6f2b1\n"],
        );
        assert!(runtime().ensure_running(&shell, &target())?);

        Ok(())
    }

    #[test]
    fn unchanged_deployment_with_same_pod_keeps_files() -> anyhow::Result<()> {
        let shell = shell_with_pods("deployment.apps/api unchanged\n", &["pod/api-5d8c7\n"]);
        assert!(!runtime().ensure_running(&shell, &target())?);

        Ok(())
    }

    #[test]
    fn failed_rollout_means_not_running() {
        let shell = ScriptedShell::new(|args| match args.first().map(String::as_str) {
            Some("rollout") => ShellOutput::failed(1, "timed out"),
            _ => ShellOutput::ok(""),
        });
        let result = runtime().ensure_running(&shell, &target());
        assert!(matches!(result, Err(PlatformError::ComponentNotRunning { .. })));
    }

    #[test]
    fn exec_targets_running_pod() -> anyhow::Result<()> {
        let shell = ScriptedShell::new(|args| match args.first().map(String::as_str) {
            Some("get") => ShellOutput::ok("pod/api-5d8c7\n"),
            _ => ShellOutput::ok(""),
        });
        let (program, args) = runtime().exec_argv(&shell, &target(), "runtime", true, "ls")?;
        assert_eq!(program, "kubectl");
        assert_eq!(
            args,
            ["exec", "-i", "-n", "dev", "api-5d8c7", "-c", "runtime", "--", "sh", "-c", "ls"]
        );

        Ok(())
    }

    #[test]
    fn exec_without_pod_fails() {
        let shell = ScriptedShell::succeeding();
        let result = runtime().exec_argv(&shell, &target(), "runtime", false, "ls");
        assert!(matches!(result, Err(PlatformError::ComponentNotRunning { .. })));
    }

    #[test]
    fn status_stream_follows_pod_phases() -> anyhow::Result<()> {
        let shell = ScriptedShell::new(|_| ShellOutput::ok("api-5d8c7   Pending\napi-5d8c7   Running\n"));
        let events = runtime()
            .status_stream(&shell, &target().labels)?
            .collect::<io::Result<Vec<_>>>()?;
        assert_eq!(
            events.last(),
            Some(&StatusEvent {
                name: "api-5d8c7".into(),
                phase: "Running".into()
            })
        );
        assert!(shell.calls()[0].line().contains("--watch"));

        Ok(())
    }
}
