// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Component synchronization and command execution engine.
//!
//! devsync keeps a running development __component__ in step with a local
//! source directory, called the __synchronization root__. Each __push__
//! computes which files changed since the last successful push, copies them
//! into the component, and then builds and (re)starts the component's run or
//! debug command. The __watch loop__ repeats pushes whenever the root changes.
//!
//! # Layout
//!
//! - [`command`] selects the commands a push runs from the component
//!   [`descriptor`].
//! - [`ignore_rules`] decides which paths never get synchronized.
//! - [`index`] remembers what was synchronized, and computes change deltas.
//! - [`platform`] talks to the runtime hosting a component.
//! - [`push`] orchestrates one push session from start to terminal event.
//! - [`watch`] debounces filesystem changes into pushes.
//! - [`event`] reports session progress for humans or machines.
//! - [`config`] and [`path`] locate and describe engine configuration.

pub mod command;
pub mod config;
pub mod descriptor;
pub mod event;
pub mod ignore_rules;
pub mod index;
pub mod path;
pub mod platform;
pub mod push;
pub mod watch;
