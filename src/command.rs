//! Mode-gated disposal of gate decisions.
//!
//! OBSERVE only logs. ADVISE appends the command tagged `[ADVISE] `. ACT
//! appends the command verbatim for the downstream executor. Sink failures
//! in ADVISE/ACT are returned to the caller; a lost command can leave an
//! engine running that should have been stopped.

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};

use crate::gate::Decision;
use crate::logging::{log, log_decision, obj, v_str, Domain, Level};
use crate::state::Mode;

pub const ADVISE_PREFIX: &str = "[ADVISE] ";

/// Append-only, line-oriented command destination.
pub trait CommandSink: Send {
    fn append(&mut self, line: &str) -> io::Result<()>;
}

/// Appends to a text file. The file is reopened for every line so an
/// executor that truncates or replaces it never leaves us writing to a
/// stale handle.
#[derive(Debug, Clone)]
pub struct FileCommandSink {
    path: PathBuf,
}

impl FileCommandSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommandSink for FileCommandSink {
    fn append(&mut self, line: &str) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()
    }
}

/// In-memory sink; clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct MemoryCommandSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemoryCommandSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

impl CommandSink for MemoryCommandSink {
    fn append(&mut self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "command buffer poisoned"))?
            .push(line.to_string());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Observed,
    Advised,
    Acted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Emitted {
    pub mode: Mode,
    pub disposition: Disposition,
    /// The line as written (or as it would have been written in OBSERVE).
    pub line: String,
}

pub fn render(decision: &Decision, mode: Mode) -> String {
    match mode {
        Mode::Advise => format!("{}{}", ADVISE_PREFIX, decision.command()),
        Mode::Observe | Mode::Act => decision.command(),
    }
}

pub struct CommandEmitter {
    sink: Box<dyn CommandSink>,
}

impl CommandEmitter {
    pub fn new(sink: Box<dyn CommandSink>) -> Self {
        Self { sink }
    }

    pub fn to_file(path: impl AsRef<Path>) -> Self {
        Self::new(Box::new(FileCommandSink::new(path)))
    }

    pub fn emit(&mut self, decision: &Decision, mode: Mode) -> Result<Emitted> {
        let line = render(decision, mode);
        log_decision(decision.symbol(), mode.as_str(), &decision.command());

        let disposition = match mode {
            Mode::Observe => {
                log(
                    Level::Info,
                    Domain::Command,
                    "would_execute",
                    obj(&[("symbol", v_str(decision.symbol())), ("command", v_str(&line))]),
                );
                Disposition::Observed
            }
            Mode::Advise | Mode::Act => {
                self.sink
                    .append(&line)
                    .with_context(|| format!("command log append failed in {} mode: {}", mode, line))?;
                log(
                    Level::Info,
                    Domain::Command,
                    if mode == Mode::Advise { "recommended" } else { "executed" },
                    obj(&[("symbol", v_str(decision.symbol())), ("command", v_str(&line))]),
                );
                if mode == Mode::Advise {
                    Disposition::Advised
                } else {
                    Disposition::Acted
                }
            }
        };
        Ok(Emitted { mode, disposition, line })
    }
}
