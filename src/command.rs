// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Lifecycle command resolution.
//!
//! Select which build, run, debug, or test command to execute from a component
//! descriptor. Resolution is a pure function over the descriptor.
//!
//! # Resolution Rules
//!
//! An explicitly named command must match exactly one exec command bound to an
//! existing component, no matter what group it belongs to. Without a name, all
//! commands of the requested group are collected:
//!
//! - No candidates means there is nothing to run.
//! - One candidate is selected as is.
//! - Multiple candidates select the one flagged as default. Zero or several
//!   defaults make the descriptor ambiguous.

use crate::descriptor::{CommandDefinition, Container, Descriptor, ExecCommand, GroupKind};

use serde::Serialize;

/// Command selected for one push session.
#[derive(Debug, PartialEq, Eq, Clone, Serialize)]
pub struct ResolvedCommand {
    pub id: String,
    pub kind: GroupKind,

    /// Component the command runs in.
    pub component: String,
    pub command_line: String,
    pub working_dir: String,
    pub env: Vec<(String, String)>,

    /// Run command picks up synchronized changes on its own.
    pub hot_reload_capable: bool,
}

/// Resolve command of `kind`, or the command named `explicit`.
///
/// # Errors
///
/// - Return [`ResolveError::CommandNotFound`] if `explicit` names no exec
///   command bound to an existing component, or if the selected command is
///   bound to a missing component.
/// - Return [`ResolveError::NoCommand`] if the group has no commands.
/// - Return [`ResolveError::AmbiguousCommand`] if the group has several
///   commands without exactly one default.
pub fn resolve(
    descriptor: &Descriptor,
    kind: GroupKind,
    explicit: Option<&str>,
) -> Result<ResolvedCommand> {
    if let Some(name) = explicit {
        return resolve_named(descriptor, kind, name);
    }

    let candidates = descriptor
        .commands
        .iter()
        .filter_map(|command| exec_in_group(command, kind))
        .collect::<Vec<_>>();

    let (id, exec) = match candidates.as_slice() {
        [] => return Err(ResolveError::NoCommand { kind }),
        [only] => *only,
        many => {
            let defaults = many
                .iter()
                .filter(|(_, exec)| exec.group.as_ref().is_some_and(|group| group.is_default))
                .collect::<Vec<_>>();
            match defaults.as_slice() {
                [default] => **default,
                _ => {
                    return Err(ResolveError::AmbiguousCommand {
                        kind,
                        candidates: many.iter().map(|(id, _)| id.to_string()).collect(),
                        defaults: defaults.len(),
                    })
                }
            }
        }
    };

    let container = match descriptor.component(&exec.component) {
        Some(component) => component.container.as_ref(),
        None => {
            return Err(ResolveError::CommandNotFound {
                name: id.to_string(),
                reason: format!("bound to missing component {:?}", exec.component),
            })
        }
    };

    Ok(to_resolved(id, kind, exec, container))
}

/// Every run and debug command bound to an existing component.
///
/// These are the commands that may be running in the background of a
/// component.
pub fn lifecycle_commands(descriptor: &Descriptor) -> Vec<ResolvedCommand> {
    descriptor
        .commands
        .iter()
        .filter_map(|command| {
            [GroupKind::Run, GroupKind::Debug]
                .into_iter()
                .find_map(|kind| exec_in_group(command, kind).map(|(id, exec)| (id, kind, exec)))
        })
        .filter_map(|(id, kind, exec)| {
            descriptor
                .component(&exec.component)
                .map(|component| to_resolved(id, kind, exec, component.container.as_ref()))
        })
        .collect()
}

fn resolve_named(descriptor: &Descriptor, kind: GroupKind, name: &str) -> Result<ResolvedCommand> {
    let matches = descriptor
        .commands
        .iter()
        .filter(|command| command.id == name)
        .filter_map(|command| command.exec.as_ref().map(|exec| (command.id.as_str(), exec)))
        .filter_map(|(id, exec)| {
            descriptor
                .component(&exec.component)
                .map(|component| (id, exec, component.container.as_ref()))
        })
        .collect::<Vec<_>>();

    match matches.as_slice() {
        [(id, exec, container)] => {
            let kind = exec.group.as_ref().map_or(kind, |group| group.kind);
            Ok(to_resolved(id, kind, exec, *container))
        }
        [] => Err(ResolveError::CommandNotFound {
            name: name.to_string(),
            reason: "no exec command with that id bound to an existing component".into(),
        }),
        _ => Err(ResolveError::CommandNotFound {
            name: name.to_string(),
            reason: "id is declared more than once".into(),
        }),
    }
}

fn exec_in_group(command: &CommandDefinition, kind: GroupKind) -> Option<(&str, &ExecCommand)> {
    let exec = command.exec.as_ref()?;
    let group = exec.group.as_ref()?;
    (group.kind == kind).then_some((command.id.as_str(), exec))
}

fn to_resolved(
    id: &str,
    kind: GroupKind,
    exec: &ExecCommand,
    container: Option<&Container>,
) -> ResolvedCommand {
    let source_mapping = container
        .map(Container::source_mapping)
        .unwrap_or(crate::descriptor::DEFAULT_SOURCE_MAPPING);
    let working_dir = match &exec.working_dir {
        Some(dir) => expand_project_vars(dir, source_mapping),
        None => source_mapping.to_string(),
    };

    ResolvedCommand {
        id: id.to_string(),
        kind,
        component: exec.component.clone(),
        command_line: expand_project_vars(&exec.command_line, source_mapping),
        working_dir,
        env: exec
            .env
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect(),
        hot_reload_capable: exec.hot_reload_capable,
    }
}

fn expand_project_vars(value: &str, source_mapping: &str) -> String {
    value
        .replace("${PROJECTS_ROOT}", source_mapping)
        .replace("${PROJECT_SOURCE}", source_mapping)
}

/// Command resolution error types.
#[derive(Debug, PartialEq, Eq, Clone, thiserror::Error)]
pub enum ResolveError {
    /// Named command does not exist, or is bound to a missing component.
    #[error("command {name:?} not found: {reason}")]
    CommandNotFound { name: String, reason: String },

    /// Group has no commands.
    #[error("no {kind} command declared in component descriptor")]
    NoCommand { kind: GroupKind },

    /// Group has several commands, but not exactly one default.
    #[error("{kind} commands {candidates:?} are ambiguous: {defaults} marked as default, expected one")]
    AmbiguousCommand {
        kind: GroupKind,
        candidates: Vec<String>,
        defaults: usize,
    },
}

impl ResolveError {
    /// Whether failing to resolve a command should abort a push.
    ///
    /// Missing or ambiguous build and run commands abort. Test and debug
    /// commands only cause their operation to be skipped.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::CommandNotFound { .. } => true,
            Self::NoCommand { kind } | Self::AmbiguousCommand { kind, .. } => kind.is_required(),
        }
    }

    /// Stable machine-readable name of this error.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::CommandNotFound { .. } => "command_not_found",
            Self::NoCommand { .. } => "no_command",
            Self::AmbiguousCommand { .. } => "ambiguous_command",
        }
    }
}

/// Friendly result alias :3
type Result<T, E = ResolveError> = std::result::Result<T, E>;
