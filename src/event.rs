// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Event reporting.
//!
//! Emit structured progress events for each push session, separate from
//! human-oriented logging. In human mode each event becomes one short
//! progress line. In JSON mode each event becomes one self-contained JSON
//! record per line, so tooling can follow progress without parsing prose.
//!
//! # Ordering
//!
//! Events of one session are emitted in order: one init event, any number of
//! progress events, and exactly one terminal event. [`SessionReporter`]
//! enforces this. Its terminal methods consume it, and dropping it without a
//! terminal event emits an aborted failure.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    io::{self, Write},
    str::FromStr,
    sync::{Arc, Mutex},
};
use tracing::warn;
use uuid::Uuid;

/// One structured event record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub session_id: Uuid,
    pub status: EventStatus,
    pub message: String,

    /// Stable error name for failure events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Step of a push session an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Init,
    ResolveCommands,
    ComputeDelta,
    Transfer,
    ExecuteCommand,
    PersistIndex,
    Success,
    Failure,
}

impl EventKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Progress,
    Skipped,
    Warning,
    Succeeded,
    Failed,
}

impl EventStatus {
    fn symbol(&self) -> &'static str {
        match self {
            Self::Started => "◦",
            Self::Progress => "•",
            Self::Skipped => "-",
            Self::Warning => "!",
            Self::Succeeded => "✓",
            Self::Failed => "✗",
        }
    }
}

/// Rendering mode of the event stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    #[default]
    Human,
    Json,
}

impl FromStr for OutputMode {
    type Err = UnknownOutputMode;

    fn from_str(data: &str) -> Result<Self, Self::Err> {
        match data {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(UnknownOutputMode(other.to_string())),
        }
    }
}

impl Display for OutputMode {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        match self {
            Self::Human => fmt.write_str("human"),
            Self::Json => fmt.write_str("json"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown output mode {0:?}, expected \"human\" or \"json\"")]
pub struct UnknownOutputMode(String);

/// Destination of rendered events.
pub trait EventSink: Send {
    fn emit(&mut self, event: &Event) -> io::Result<()>;
}

/// Render events as JSON lines.
#[derive(Debug)]
pub struct JsonLines<W: Write + Send>(pub W);

impl<W: Write + Send> EventSink for JsonLines<W> {
    fn emit(&mut self, event: &Event) -> io::Result<()> {
        let line = serde_json::to_string(event)?;
        writeln!(self.0, "{line}")?;
        self.0.flush()
    }
}

/// Render events as short human-readable progress lines.
#[derive(Debug)]
pub struct HumanLines<W: Write + Send>(pub W);

impl<W: Write + Send> EventSink for HumanLines<W> {
    fn emit(&mut self, event: &Event) -> io::Result<()> {
        writeln!(self.0, " {}  {}", event.status.symbol(), event.message)?;
        self.0.flush()
    }
}

/// Shared event reporter.
///
/// Serializes emission from every session onto one sink.
pub struct Reporter {
    sink: Mutex<Box<dyn EventSink>>,
}

impl Reporter {
    pub fn new(sink: impl EventSink + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
        }
    }

    /// Reporter writing to standard output in the given mode.
    pub fn stdout(mode: OutputMode) -> Self {
        match mode {
            OutputMode::Human => Self::new(HumanLines(io::stdout())),
            OutputMode::Json => Self::new(JsonLines(io::stdout())),
        }
    }

    /// Begin new session, emitting its init event.
    pub fn start_session(self: &Arc<Self>, message: impl Into<String>) -> SessionReporter {
        let session = SessionReporter {
            reporter: Arc::clone(self),
            session_id: Uuid::new_v4(),
            finished: false,
        };
        session.emit(EventKind::Init, EventStatus::Started, message.into(), None, None);
        session
    }

    fn emit(&self, event: Event) {
        let mut sink = match self.sink.lock() {
            Ok(sink) => sink,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = sink.emit(&event) {
            warn!("failed to emit {:?} event: {err}", event.kind);
        }
    }
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        fmt.debug_struct("Reporter").finish_non_exhaustive()
    }
}

/// Event emitter bound to one push session.
#[derive(Debug)]
pub struct SessionReporter {
    reporter: Arc<Reporter>,
    session_id: Uuid,
    finished: bool,
}

impl SessionReporter {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Emit progress of a session step.
    pub fn step(&self, kind: EventKind, status: EventStatus, message: impl Into<String>) {
        debug_assert!(!kind.is_terminal());
        self.emit(kind, status, message.into(), None, None);
    }

    /// Emit progress of a session step with structured payload.
    pub fn step_with(
        &self,
        kind: EventKind,
        status: EventStatus,
        message: impl Into<String>,
        data: serde_json::Value,
    ) {
        debug_assert!(!kind.is_terminal());
        self.emit(kind, status, message.into(), None, Some(data));
    }

    /// Emit terminal success event, ending the session.
    pub fn succeed(mut self, message: impl Into<String>, data: Option<serde_json::Value>) {
        self.finished = true;
        self.emit(EventKind::Success, EventStatus::Succeeded, message.into(), None, data);
    }

    /// Emit terminal failure event, ending the session.
    pub fn fail(mut self, error_kind: &str, message: impl Into<String>) {
        self.finished = true;
        self.emit(
            EventKind::Failure,
            EventStatus::Failed,
            message.into(),
            Some(error_kind.to_string()),
            None,
        );
    }

    fn emit(
        &self,
        kind: EventKind,
        status: EventStatus,
        message: String,
        error_kind: Option<String>,
        data: Option<serde_json::Value>,
    ) {
        self.reporter.emit(Event {
            kind,
            timestamp: Utc::now(),
            session_id: self.session_id,
            status,
            message,
            error_kind,
            data,
        });
    }
}

impl Drop for SessionReporter {
    fn drop(&mut self) {
        if !self.finished {
            self.finished = true;
            self.emit(
                EventKind::Failure,
                EventStatus::Failed,
                "session ended without reporting an outcome".into(),
                Some("aborted".into()),
                None,
            );
        }
    }
}

/// Sink collecting events in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every event emitted so far.
    pub fn events(&self) -> Vec<Event> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl EventSink for MemorySink {
    fn emit(&mut self, event: &Event) -> io::Result<()> {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
        Ok(())
    }
}
