// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Log and status streams.
//!
//! A [`LogStream`] yields log lines of a command running in a component. In
//! follow mode it reconnects when its underlying source closes, skipping lines
//! already seen, until cancelled through its [`LogCanceller`] or until the
//! source fails too often in a row.

use crate::platform::shell::LineSource;

use std::{
    io,
    process::Child,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    thread::sleep,
    time::Duration,
};
use tracing::{debug, warn};

/// Consecutive source failures tolerated before a followed stream gives up.
pub const MAX_RECONNECTS: u32 = 5;

/// Opens log source, resuming after given number of already seen lines.
///
/// Returns how many lines the opened source actually skipped, which is less
/// than requested once the log was truncated.
pub type LogOpener = Box<dyn FnMut(usize) -> io::Result<(usize, LineSource)> + Send>;

/// Cancel a log stream from another thread.
#[derive(Debug, Clone, Default)]
pub struct LogCanceller {
    cancelled: Arc<AtomicBool>,
    current: Arc<Mutex<Option<Arc<Mutex<Child>>>>>,
}

impl LogCanceller {
    /// Stop the stream, killing its running source.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let current = match self.current.lock() {
            Ok(mut current) => current.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        if let Some(child) = current {
            if let Ok(mut child) = child.lock() {
                // INVARIANT: The child may already have exited.
                let _ = child.kill();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn attach(&self, child: Option<Arc<Mutex<Child>>>) {
        match self.current.lock() {
            Ok(mut current) => *current = child,
            Err(poisoned) => *poisoned.into_inner() = child,
        }
    }
}

/// Lines of a component log.
pub struct LogStream {
    opener: LogOpener,
    follow: bool,
    source: Option<LineSource>,
    seen: usize,
    failures: u32,
    backoff: Duration,
    done: bool,
    canceller: LogCanceller,
}

impl LogStream {
    pub fn new(follow: bool, opener: LogOpener) -> Self {
        Self {
            opener,
            follow,
            source: None,
            seen: 0,
            failures: 0,
            backoff: Duration::from_secs(1),
            done: false,
            canceller: LogCanceller::default(),
        }
    }

    /// Set delay between reconnect attempts.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn canceller(&self) -> LogCanceller {
        self.canceller.clone()
    }

    /// Register source failure. Returns `false` once the stream must end.
    fn retry(&mut self) -> bool {
        self.failures += 1;
        if !self.follow || self.failures >= MAX_RECONNECTS || self.canceller.is_cancelled() {
            return false;
        }

        debug!("reconnect log source, attempt {}", self.failures);
        sleep(self.backoff);
        true
    }
}

impl Iterator for LogStream {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.done || self.canceller.is_cancelled() {
                return None;
            }

            if self.source.is_none() {
                match (self.opener)(self.seen) {
                    Ok((skipped, source)) => {
                        if skipped < self.seen {
                            debug!("log restarted, {} line(s) seen before", self.seen);
                        }
                        self.seen = skipped;
                        self.canceller.attach(source.child());
                        self.source = Some(source);
                    }
                    Err(err) => {
                        if self.retry() {
                            continue;
                        }
                        self.done = true;
                        return Some(Err(err));
                    }
                }
            }

            let source = self.source.as_mut()?;
            match source.next_line() {
                Ok(Some(line)) => {
                    self.seen += 1;
                    self.failures = 0;
                    return Some(Ok(line));
                }
                Ok(None) => {
                    if let Some(source) = self.source.take() {
                        if let Err(err) = source.wait() {
                            warn!("log source did not exit cleanly: {err}");
                        }
                    }

                    if !self.retry() {
                        self.done = true;
                        return None;
                    }
                }
                Err(err) => {
                    self.source = None;
                    if self.retry() {
                        continue;
                    }
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("LogStream")
            .field("follow", &self.follow)
            .field("seen", &self.seen)
            .field("failures", &self.failures)
            .finish_non_exhaustive()
    }
}

/// Status change of a remote resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    pub name: String,
    pub phase: String,
}

/// Remote status changes.
#[derive(Debug)]
pub struct StatusStream {
    source: Option<LineSource>,
}

impl StatusStream {
    pub fn new(source: LineSource) -> Self {
        Self {
            source: Some(source),
        }
    }

    /// Stream that yields nothing.
    pub fn closed() -> Self {
        Self { source: None }
    }

    /// Handle to kill the underlying source from another thread.
    pub fn child(&self) -> Option<Arc<Mutex<Child>>> {
        self.source.as_ref().and_then(LineSource::child)
    }
}

impl Iterator for StatusStream {
    type Item = io::Result<StatusEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let source = self.source.as_mut()?;
            match source.next_line() {
                Ok(Some(line)) => {
                    // INVARIANT: Status lines hold exactly name and phase, anything
                    // else is diagnostic output of the client.
                    let mut fields = line.split_whitespace();
                    let (Some(name), Some(phase), None) = (fields.next(), fields.next(), fields.next())
                    else {
                        continue;
                    };
                    return Some(Ok(StatusEvent {
                        name: name.to_string(),
                        phase: phase.to_string(),
                    }));
                }
                Ok(None) => {
                    self.source = None;
                    return None;
                }
                Err(err) => {
                    self.source = None;
                    return Some(Err(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn lines(text: &str) -> LineSource {
        LineSource::from_reader(Cursor::new(text.to_string().into_bytes()))
    }

    #[test]
    fn without_follow_stream_ends_with_log() {
        let stream = LogStream::new(false, Box::new(|_| Ok((0, lines("a\nb\n")))));
        let result = stream.collect::<io::Result<Vec<_>>>().expect("lines");
        assert_eq!(result, ["a", "b"]);
    }

    #[test]
    fn follow_reconnects_and_skips_seen_lines() {
        let mut log = vec!["a\n", "a\nb\n", "a\nb\nc\n"].into_iter();
        let stream = LogStream::new(
            true,
            Box::new(move |seen| {
                let text = log.next().unwrap_or("a\nb\nc\n");
                let remaining = text.lines().skip(seen).map(|line| format!("{line}\n")).collect::<String>();
                Ok((seen, lines(&remaining)))
            }),
        )
        .with_backoff(Duration::ZERO);

        let result = stream.collect::<io::Result<Vec<_>>>().expect("lines");
        assert_eq!(result, ["a", "b", "c"]);
    }

    #[test]
    fn follow_resumes_from_truncated_log() {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&opened);
        let mut stream = LogStream::new(
            true,
            Box::new(move |seen| {
                let mut record = record.lock().expect("record lock");
                record.push(seen);
                match record.len() {
                    1 => Ok((0, lines("a\nb\nc\n"))),
                    2 => Ok((0, lines("x\n"))),
                    _ => Ok((seen, lines(""))),
                }
            }),
        )
        .with_backoff(Duration::ZERO);

        let result = stream.by_ref().take(4).collect::<io::Result<Vec<_>>>().expect("lines");
        assert_eq!(result, ["a", "b", "c", "x"]);
        assert_eq!(stream.seen, 1);
        assert_eq!(*opened.lock().expect("record lock"), [0, 3]);
    }

    #[test]
    fn follow_gives_up_after_repeated_failures() {
        let mut attempts = 0;
        let mut stream = LogStream::new(
            true,
            Box::new(move |_| {
                attempts += 1;
                Err(io::Error::other(format!("attempt {attempts}")))
            }),
        )
        .with_backoff(Duration::ZERO);

        let err = stream.next().expect("error item").expect_err("failure");
        assert_eq!(err.to_string(), format!("attempt {MAX_RECONNECTS}"));
        assert!(stream.next().is_none());
    }

    #[test]
    fn cancelled_stream_ends() {
        let mut stream = LogStream::new(true, Box::new(|_| Ok((0, lines("a\n")))));
        stream.canceller().cancel();
        assert!(stream.next().is_none());
    }

    #[test]
    fn status_lines_become_events() {
        let stream = StatusStream::new(lines(
            "pod-1 Pending\n\nW1018 unable to decode an event from the watch stream\npod-1 Running\n",
        ));
        let events = stream.collect::<io::Result<Vec<_>>>().expect("events");
        assert_eq!(
            events,
            [
                StatusEvent {
                    name: "pod-1".into(),
                    phase: "Pending".into()
                },
                StatusEvent {
                    name: "pod-1".into(),
                    phase: "Running".into()
                },
            ]
        );
        assert!(StatusStream::closed().next().is_none());
    }
}
