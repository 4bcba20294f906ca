// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! External program invocation.
//!
//! Platform runtimes drive their platform through its command line tools. All
//! such calls go through [`Shell`], so runtimes can be exercised without the
//! tools being installed.

use std::{
    io::{self, BufRead, BufReader, Read, Write},
    process::{Child, Command, Stdio},
    sync::{
        mpsc::{channel, Receiver, Sender},
        Arc, Mutex,
    },
    thread,
};
use tracing::{debug, instrument};

/// Captured result of a finished program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    /// Exit code, `None` if terminated by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ShellOutput {
    /// Successful output with given standard output.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with given exit code and standard error.
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Standard output and standard error together, trailing newline chomped.
    pub fn combined(&self) -> String {
        let mut message = String::new();
        if !self.stdout.is_empty() {
            message.push_str(format!("stdout: {}", self.stdout).as_str());
        }

        if !self.stderr.is_empty() {
            message.push_str(format!("stderr: {}", self.stderr).as_str());
        }

        // INVARIANT: Chomp trailing newlines.
        message
            .strip_suffix("\r\n")
            .or(message.strip_suffix('\n'))
            .map(ToString::to_string)
            .unwrap_or(message)
    }
}

enum Lines {
    Reader(Box<dyn BufRead + Send>),

    /// Lines pumped from several pipes, in arrival order.
    Merged(Receiver<io::Result<String>>),
}

/// Line-oriented output of a running program.
pub struct LineSource {
    lines: Lines,
    child: Option<Arc<Mutex<Child>>>,
    exit_code: Option<i32>,
}

impl LineSource {
    /// Line source over an in-memory or otherwise finite reader.
    pub fn from_reader(reader: impl BufRead + Send + 'static) -> Self {
        Self {
            lines: Lines::Reader(Box::new(reader)),
            child: None,
            exit_code: Some(0),
        }
    }

    /// Set exit code reported by [`LineSource::wait`] when no program runs.
    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    /// Read next line, without its line terminator.
    ///
    /// Returns `None` once the program closed its output.
    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        let reader = match &mut self.lines {
            Lines::Reader(reader) => reader,
            Lines::Merged(receiver) => {
                // INVARIANT: Channel closes once every pipe reached its end.
                return match receiver.recv() {
                    Ok(line) => line.map(Some),
                    Err(_) => Ok(None),
                };
            }
        };

        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(Some(line))
    }

    /// Handle to the running program, used to kill it from elsewhere.
    pub fn child(&self) -> Option<Arc<Mutex<Child>>> {
        self.child.clone()
    }

    /// Wait for the program to exit, and return its exit code.
    pub fn wait(self) -> io::Result<Option<i32>> {
        match self.child {
            Some(child) => {
                let mut child = child.lock().map_err(|_| io::Error::other("child lock poisoned"))?;
                Ok(child.wait()?.code())
            }
            None => Ok(self.exit_code),
        }
    }
}

impl std::fmt::Debug for LineSource {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        fmt.debug_struct("LineSource")
            .field("child", &self.child.is_some())
            .finish_non_exhaustive()
    }
}

/// Invoke external programs.
pub trait Shell: Send + Sync {
    /// Run program to completion, feeding `stdin` if given.
    fn output(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> io::Result<ShellOutput>;

    /// Spawn program, and read its standard output and standard error line
    /// by line.
    fn lines(&self, program: &str, args: &[String]) -> io::Result<LineSource>;
}

/// Shell running programs on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostShell;

impl Shell for HostShell {
    #[instrument(skip(self, args, stdin), level = "debug")]
    fn output(&self, program: &str, args: &[String], stdin: Option<&[u8]>) -> io::Result<ShellOutput> {
        debug!("run {program} {}", args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // INVARIANT: Feed stdin from another thread so a chatty child cannot
        // block on a full stdout pipe while we are still writing.
        let feeder = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => {
                let data = data.to_vec();
                Some(thread::spawn(move || pipe.write_all(&data)))
            }
            _ => None,
        };

        let output = child.wait_with_output()?;
        if let Some(feeder) = feeder {
            feeder
                .join()
                .map_err(|_| io::Error::other("stdin feeder panicked"))??;
        }

        Ok(ShellOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(output.stdout.as_slice()).into_owned(),
            stderr: String::from_utf8_lossy(output.stderr.as_slice()).into_owned(),
        })
    }

    #[instrument(skip(self, args), level = "debug")]
    fn lines(&self, program: &str, args: &[String]) -> io::Result<LineSource> {
        debug!("stream {program} {}", args.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("child has no stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("child has no stderr"))?;

        let (sender, receiver) = channel();
        pump(stdout, sender.clone());
        pump(stderr, sender);

        Ok(LineSource {
            lines: Lines::Merged(receiver),
            child: Some(Arc::new(Mutex::new(child))),
            exit_code: None,
        })
    }
}

/// Forward lines of `pipe` into `sender` from a background thread.
fn pump(pipe: impl Read + Send + 'static, sender: Sender<io::Result<String>>) {
    thread::spawn(move || {
        for line in BufReader::new(pipe).lines() {
            let failed = line.is_err();
            if sender.send(line).is_err() || failed {
                break;
            }
        }
    });
}

/// Quote one word for `sh`.
pub fn quote(word: &str) -> Result<String, shlex::QuoteError> {
    shlex::try_quote(word).map(|quoted| quoted.into_owned())
}
