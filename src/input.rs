//! Host input: stdin commands read line by line on a background thread.
//!
//! `StdinReader` spawns a reader thread that sends chunks via `mpsc::channel`,
//! avoiding platform-specific non-blocking I/O. The host loop drains with
//! `try_recv()` at each poll cycle and splits complete lines into
//! [`HostCommand`]s.

use std::io::{self, Read};
use std::str::FromStr;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

/// One navigation request typed by the user or listed in a `--script`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    Next,
    Previous,
    Goto(usize),
    Logo,
    Quit,
}

impl FromStr for HostCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "n" | "next" => Ok(HostCommand::Next),
            "p" | "prev" | "previous" => Ok(HostCommand::Previous),
            "l" | "logo" => Ok(HostCommand::Logo),
            "q" | "quit" => Ok(HostCommand::Quit),
            other => other
                .parse::<usize>()
                .map(HostCommand::Goto)
                .map_err(|_| format!("unknown command: {other:?}")),
        }
    }
}

/// Parse a comma-separated script such as `"0,n,n,p"`. Empty items are skipped.
pub fn parse_script(script: &str) -> Result<Vec<HostCommand>, String> {
    script
        .split(',')
        .filter(|item| !item.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// A chunk of data from the stdin reader thread.
enum StdinChunk {
    Data(String),
    Eof,
}

/// Result of draining the stdin channel.
#[derive(Debug, Default)]
pub struct DrainResult {
    /// Complete lines parsed into commands, in input order.
    pub commands: Vec<HostCommand>,
    /// Lines that did not parse.
    pub rejected: Vec<String>,
    /// Whether EOF has been reached.
    pub eof: bool,
}

/// Reads stdin in a background thread, sending chunks over a channel.
pub struct StdinReader {
    rx: mpsc::Receiver<StdinChunk>,
    partial: String,
    _handle: JoinHandle<()>,
}

impl Default for StdinReader {
    fn default() -> Self {
        Self::new()
    }
}

impl StdinReader {
    /// Spawn the reader thread and return a new `StdinReader`.
    pub fn new() -> Self {
        Self::from_reader(io::stdin())
    }

    /// Spawn a reader thread from an arbitrary `Read` source.
    pub fn from_reader<R: Read + Send + 'static>(mut reader: R) -> Self {
        let (tx, rx) = mpsc::channel();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1024];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => {
                        let _ = tx.send(StdinChunk::Eof);
                        break;
                    }
                    Ok(n) => {
                        let s = String::from_utf8_lossy(&buf[..n]).into_owned();
                        if tx.send(StdinChunk::Data(s)).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => {
                        let _ = tx.send(StdinChunk::Eof);
                        break;
                    }
                }
            }
        });

        Self {
            rx,
            partial: String::new(),
            _handle: handle,
        }
    }

    /// Drain all available chunks and parse every complete line. Non-blocking.
    ///
    /// A trailing line without a newline is held back until more data or EOF
    /// arrives.
    pub fn drain(&mut self) -> DrainResult {
        let mut result = DrainResult::default();
        loop {
            match self.rx.try_recv() {
                Ok(StdinChunk::Data(s)) => self.partial.push_str(&s),
                Ok(StdinChunk::Eof) | Err(mpsc::TryRecvError::Disconnected) => {
                    result.eof = true;
                    break;
                }
                Err(mpsc::TryRecvError::Empty) => break,
            }
        }

        let mut rest = std::mem::take(&mut self.partial);
        if result.eof && !rest.is_empty() && !rest.ends_with('\n') {
            rest.push('\n');
        }
        let complete = rest.rfind('\n').map_or(0, |i| i + 1);
        self.partial = rest.split_off(complete);
        for line in rest.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.parse() {
                Ok(cmd) => result.commands.push(cmd),
                Err(_) => result.rejected.push(line.to_string()),
            }
        }
        result
    }
}
