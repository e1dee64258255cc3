//! The command-line host: a forked worker, a manager, and a poll loop.
//!
//! Each poll cycle drains worker results into the display, checks that the
//! worker process is still alive (restarting it up to `max_restarts` times),
//! then applies input. Input comes either from stdin lines or from a
//! `--script`; in script mode one command is sent per answered request, and
//! the host quits once the last request has been answered.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Write};
use std::thread;

use anyhow::Context;
use log::{debug, info, warn};

use crate::config::Config;
use crate::error::ChannelError;
use crate::input::{HostCommand, StdinReader};
use crate::manager::{CacheManager, DisplayImage, DisplaySink};
use crate::process::{self, WorkerProcess};
use crate::protocol::{FrameWriter, Slot};
use crate::tables::{AssetPaths, DirectoryTables, TableList};

/// Prints one line per displayed image: slot, table name, dimensions.
pub struct PrintSink {
    names: Vec<String>,
}

impl DisplaySink for PrintSink {
    fn set_image(&mut self, image: DisplayImage) {
        let name = match image.slot {
            Slot::Table(i) => self.names.get(i).map_or("?", String::as_str),
            Slot::Logo => "-",
        };
        let mut out = io::stdout().lock();
        // A closed stdout is not worth stopping the carousel for.
        let _ = writeln!(
            out,
            "{}\t{}\t{}x{}",
            image.slot,
            name,
            image.image.width(),
            image.image.height()
        );
    }
}

type HostManager = CacheManager<FrameWriter<File>, PrintSink>;

struct Connection {
    process: WorkerProcess,
    manager: HostManager,
}

enum Input {
    Script(VecDeque<HostCommand>),
    Stdin(StdinReader),
}

/// Run the host until `q`, stdin EOF, or the end of `script`.
pub fn run(
    tables: DirectoryTables,
    config: Config,
    script: Option<Vec<HostCommand>>,
) -> anyhow::Result<()> {
    let assets = config.assets.resolve(tables.root());
    let names: Vec<String> = (0..tables.count())
        .map(|i| tables.name(i).unwrap_or("?").to_string())
        .collect();

    // Fork before any host thread exists.
    let mut conn = connect(&tables, &assets, &config, &names)?;
    let mut outstanding = request(conn.manager.load_logo());

    let mut input = match script {
        Some(cmds) => Input::Script(cmds.into()),
        None => Input::Stdin(StdinReader::new()),
    };
    let mut restarts = 0;

    loop {
        let stats = conn.manager.drain_results();
        outstanding = outstanding.saturating_sub(stats.displayed + stats.failed + stats.skipped);
        if stats.failed > 0 {
            debug!("host: {} request(s) failed this cycle", stats.failed);
        }

        let exited = conn
            .process
            .try_wait()
            .context("failed to poll worker process")?;
        if stats.disconnected || exited.is_some() {
            let exit = conn
                .process
                .wait_or_kill(config.host.shutdown_timeout)
                .context("failed to reap worker process")?;
            if restarts >= config.host.max_restarts {
                anyhow::bail!(
                    "worker {} ended ({exit:?}) and the restart limit ({}) is reached",
                    conn.process.pid(),
                    config.host.max_restarts
                );
            }
            restarts += 1;
            warn!(
                "host: worker {} ended ({exit:?}), restarting ({restarts}/{})",
                conn.process.pid(),
                config.host.max_restarts
            );
            let current = conn.manager.current_index();
            conn = connect(&tables, &assets, &config, &names)?;
            outstanding = request(conn.manager.load_logo());
            if tables.count() > 0 {
                outstanding += request(conn.manager.set_by_index(current));
            }
            continue;
        }

        let quit = match &mut input {
            Input::Script(cmds) => {
                if outstanding == 0 {
                    match cmds.pop_front() {
                        Some(cmd) => {
                            let (sent, quit) = apply(&mut conn.manager, cmd);
                            outstanding += sent;
                            quit
                        }
                        None => {
                            info!("host: script finished");
                            true
                        }
                    }
                } else {
                    false
                }
            }
            Input::Stdin(reader) => {
                let drained = reader.drain();
                for line in &drained.rejected {
                    warn!("host: ignoring input {line:?}");
                    eprintln!("unknown command: {line} (use n, p, <index>, l, q)");
                }
                let mut quit = drained.eof;
                for cmd in drained.commands {
                    let (sent, stop) = apply(&mut conn.manager, cmd);
                    outstanding += sent;
                    if stop {
                        quit = true;
                        break;
                    }
                }
                quit
            }
        };
        if quit {
            break;
        }

        thread::sleep(config.host.poll_interval);
    }

    shutdown(conn, &config)
}

fn connect(
    tables: &DirectoryTables,
    assets: &AssetPaths,
    config: &Config,
    names: &[String],
) -> anyhow::Result<Connection> {
    let link = process::spawn(tables.clone(), assets.clone(), config.worker.clone())
        .context("failed to start cache worker")?;
    let manager = CacheManager::new(
        link.commands,
        link.results,
        tables.count(),
        PrintSink {
            names: names.to_vec(),
        },
    );
    Ok(Connection {
        process: link.process,
        manager,
    })
}

/// Apply one host command. Returns how many worker answers it will produce
/// and whether the host should quit.
fn apply(manager: &mut HostManager, cmd: HostCommand) -> (usize, bool) {
    let has_tables = manager.count() > 0;
    let sent = match cmd {
        HostCommand::Next if has_tables => request(manager.next()),
        HostCommand::Previous if has_tables => request(manager.previous()),
        HostCommand::Next | HostCommand::Previous => 0,
        HostCommand::Goto(i) => request(manager.set_by_index(i)),
        HostCommand::Logo => request(manager.load_logo()),
        HostCommand::Quit => return (0, true),
    };
    (sent, false)
}

/// Count a sent request. A send failure means the worker is gone, which the
/// next liveness check picks up.
fn request(sent: Result<(), ChannelError>) -> usize {
    match sent {
        Ok(()) => 1,
        Err(e) => {
            warn!("host: command not delivered: {e}");
            0
        }
    }
}

fn shutdown(mut conn: Connection, config: &Config) -> anyhow::Result<()> {
    if let Err(e) = conn.manager.shutdown() {
        debug!("host: quit not delivered: {e}");
    }
    let exit = conn
        .process
        .wait_or_kill(config.host.shutdown_timeout)
        .context("failed to reap worker process")?;
    info!("host: worker {} finished: {exit:?}", conn.process.pid());
    Ok(())
}
