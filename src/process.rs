//! Running the cache worker in its own OS process.
//!
//! `spawn` forks. The child builds the worker, serves commands read from one
//! pipe, writes results to another, and `_exit`s. The parent keeps the pid for
//! exit detection and gets the pipe ends wrapped as a command [`Sink`] and a
//! result `Receiver` (fed by a reader thread), ready for a
//! [`CacheManager`](crate::manager::CacheManager).
//!
//! Fork before the host starts other threads: only the forking thread exists
//! in the child, and locks held by others at fork time stay locked there.

use std::fs::File;
use std::io;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pipe};

use crate::error::CacheError;
use crate::protocol::{Command, FrameWriter, Sink, WorkerResult, spawn_frame_pump};
use crate::segment;
use crate::tables::{FallbackAssets, TableList};
use crate::worker::{self, CacheWorker, WorkerConfig};

const WAIT_POLL: Duration = Duration::from_millis(10);

/// How a worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Exited(i32),
    Signaled(i32),
}

impl WorkerExit {
    pub fn is_clean(self) -> bool {
        self == WorkerExit::Exited(0)
    }
}

/// Parent-side handles of a forked worker.
pub struct WorkerLink {
    pub process: WorkerProcess,
    pub commands: FrameWriter<File>,
    pub results: mpsc::Receiver<WorkerResult>,
}

/// The worker's pid and exit bookkeeping. Dropping an unreaped handle kills
/// and reaps the child.
pub struct WorkerProcess {
    pid: Pid,
    segment_prefix: String,
    exit: Option<WorkerExit>,
    pump: Option<JoinHandle<()>>,
}

/// Fork a worker process serving `tables` with `config`.
pub fn spawn<T, A>(tables: T, assets: A, config: WorkerConfig) -> Result<WorkerLink, CacheError>
where
    T: TableList,
    A: FallbackAssets,
{
    let spawn_err = |e: io::Error| CacheError::Fatal(format!("failed to spawn worker: {e}"));
    let (cmd_read, cmd_write) = pipe().map_err(|e| spawn_err(e.into()))?;
    let (res_read, res_write) = pipe().map_err(|e| spawn_err(e.into()))?;
    let segment_prefix = config.segment_prefix.clone();

    // SAFETY: the child only runs the worker loop on fresh state and leaves
    // through `_exit`, never returning into the caller's stack.
    match unsafe { fork() }.map_err(|e| spawn_err(e.into()))? {
        ForkResult::Child => {
            drop(cmd_write);
            drop(res_read);
            let code = run_child(
                tables,
                assets,
                config,
                File::from(cmd_read),
                File::from(res_write),
            );
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            drop(cmd_read);
            drop(res_write);
            info!("process: forked worker pid {child}");
            let (results, pump) =
                spawn_frame_pump::<WorkerResult, _>("worker-results", File::from(res_read))
                    .map_err(spawn_err)?;
            Ok(WorkerLink {
                process: WorkerProcess {
                    pid: child,
                    segment_prefix,
                    exit: None,
                    pump: Some(pump),
                },
                commands: FrameWriter::new(File::from(cmd_write)),
                results,
            })
        }
    }
}

fn run_child<T, A>(tables: T, assets: A, config: WorkerConfig, commands: File, results: File) -> i32
where
    T: TableList,
    A: FallbackAssets,
{
    let mut sink = FrameWriter::new(results);
    let (rx, _pump) = match spawn_frame_pump::<Command, _>("worker-commands", commands) {
        Ok(v) => v,
        Err(e) => {
            error!("worker: cannot start command reader: {e}");
            let _ = sink.send(WorkerResult::Failed {
                message: CacheError::Fatal(e.to_string()).to_string(),
            });
            return 1;
        }
    };

    let mut cache = CacheWorker::new(tables, assets, config);
    match worker::run_guarded(&mut cache, &rx, &mut sink) {
        Ok(()) => 0,
        // Already reported as `Failed` and segments released.
        Err(_) => 1,
    }
}

impl WorkerProcess {
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> io::Result<Option<WorkerExit>> {
        if let Some(exit) = self.exit {
            return Ok(Some(exit));
        }
        let status = waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).map_err(io::Error::from)?;
        let exit = match status {
            WaitStatus::Exited(_, code) => WorkerExit::Exited(code),
            WaitStatus::Signaled(_, sig, _) => WorkerExit::Signaled(sig as i32),
            _ => return Ok(None),
        };
        info!("process: worker {} ended: {exit:?}", self.pid);
        self.exit = Some(exit);
        self.join_pump();
        Ok(Some(exit))
    }

    /// Wait up to `timeout` for the worker to exit, then kill it. Segments
    /// left behind by a killed or crashed worker are purged.
    pub fn wait_or_kill(&mut self, timeout: Duration) -> io::Result<WorkerExit> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(exit) = self.try_wait()? {
                if !exit.is_clean() {
                    self.purge_segments();
                }
                return Ok(exit);
            }
            if Instant::now() >= deadline {
                break;
            }
            thread::sleep(WAIT_POLL);
        }
        warn!("process: worker {} did not exit within {timeout:?}, killing", self.pid);
        let exit = self.kill_and_reap()?;
        self.purge_segments();
        Ok(exit)
    }

    /// Remove segments the worker created but never released.
    pub fn purge_segments(&self) -> usize {
        match segment::purge_stale(&self.segment_prefix, self.pid()) {
            Ok(n) => n,
            Err(e) => {
                warn!("process: purge for worker {} failed: {e}", self.pid);
                0
            }
        }
    }

    fn kill_and_reap(&mut self) -> io::Result<WorkerExit> {
        if let Err(e) = kill(self.pid, Signal::SIGKILL) {
            debug!("process: kill {} failed: {e}", self.pid);
        }
        let exit = match waitpid(self.pid, None).map_err(io::Error::from)? {
            WaitStatus::Exited(_, code) => WorkerExit::Exited(code),
            WaitStatus::Signaled(_, sig, _) => WorkerExit::Signaled(sig as i32),
            other => {
                return Err(io::Error::other(format!("unexpected wait status {other:?}")));
            }
        };
        self.exit = Some(exit);
        self.join_pump();
        Ok(exit)
    }

    fn join_pump(&mut self) {
        if let Some(pump) = self.pump.take()
            && pump.join().is_err()
        {
            warn!("process: result reader thread panicked");
        }
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.exit.is_some() {
            return;
        }
        if let Ok(Some(_)) = self.try_wait() {
            return;
        }
        match self.kill_and_reap() {
            Ok(exit) => {
                debug!("process: reaped worker {} on drop: {exit:?}", self.pid);
                self.purge_segments();
            }
            Err(e) => warn!("process: failed to reap worker {}: {e}", self.pid),
        }
    }
}
