//! Cache manager: the UI-side proxy for the worker.
//!
//! Owns the navigation state and the sending half of the command queue, and
//! drains results without blocking. Each `Ready` result transfers ownership of
//! its segment: the manager claims it, copies the bytes out, unlinks it, and
//! hands the decoded image to the display sink.

use std::io;
use std::sync::mpsc::{self, TryRecvError};

use image::RgbaImage;
use log::{debug, error, info};

use crate::error::{CacheError, ChannelError};
use crate::protocol::{Command, Sink, Slot, WorkerResult, wrap_next, wrap_previous};
use crate::segment;

/// A decoded image ready for display, tagged with the slot it belongs to.
pub struct DisplayImage {
    pub slot: Slot,
    pub image: RgbaImage,
}

/// Receives images on the UI side. Called only from the thread that drains.
pub trait DisplaySink {
    fn set_image(&mut self, image: DisplayImage);
}

/// Counters for one [`CacheManager::drain_results`] call.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub displayed: usize,
    /// `Failed` results reported by the worker.
    pub failed: usize,
    /// `Ready` results whose segment could not be consumed.
    pub skipped: usize,
    /// The result channel closed: the worker is gone.
    pub disconnected: bool,
}

pub struct CacheManager<C: Sink<Command>, D: DisplaySink> {
    commands: C,
    results: mpsc::Receiver<WorkerResult>,
    display: D,
    count: usize,
    current_index: usize,
    running: bool,
}

impl<C: Sink<Command>, D: DisplaySink> CacheManager<C, D> {
    /// `count` is the number of entries in the table list.
    pub fn new(commands: C, results: mpsc::Receiver<WorkerResult>, count: usize, display: D) -> Self {
        Self {
            commands,
            results,
            display,
            count,
            current_index: 0,
            running: true,
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn display(&self) -> &D {
        &self.display
    }

    /// Jump to `index`.
    pub fn set_by_index(&mut self, index: usize) -> Result<(), ChannelError> {
        self.current_index = index;
        self.send(Command::LoadIndex(index))
    }

    /// Advance with wraparound. No-op on an empty list.
    pub fn next(&mut self) -> Result<(), ChannelError> {
        let Some(target) = wrap_next(self.current_index, self.count) else {
            return Ok(());
        };
        let from = self.current_index;
        self.current_index = target;
        self.send(Command::LoadNext(from))
    }

    /// Step back with wraparound. No-op on an empty list.
    pub fn previous(&mut self) -> Result<(), ChannelError> {
        let Some(target) = wrap_previous(self.current_index, self.count) else {
            return Ok(());
        };
        let from = self.current_index;
        self.current_index = target;
        self.send(Command::LoadPrevious(from))
    }

    /// Request the logo. Sent once at startup, before navigation.
    pub fn load_logo(&mut self) -> Result<(), ChannelError> {
        self.send(Command::LoadLogo)
    }

    /// Ask the worker to quit and stop draining.
    pub fn shutdown(&mut self) -> Result<(), ChannelError> {
        if !self.running {
            return Ok(());
        }
        info!("manager: shutting down worker");
        let sent = self.commands.send(Command::Quit);
        self.running = false;
        sent
    }

    fn send(&mut self, cmd: Command) -> Result<(), ChannelError> {
        if !self.running {
            debug!("manager: dropping {cmd:?} after shutdown");
            return Ok(());
        }
        debug!("manager: send {cmd:?}");
        self.commands.send(cmd)
    }

    /// Consume every result available right now. Never blocks, never fails:
    /// bad results are logged and skipped.
    pub fn drain_results(&mut self) -> DrainStats {
        let mut stats = DrainStats::default();
        if !self.running {
            return stats;
        }
        loop {
            match self.results.try_recv() {
                Ok(WorkerResult::Failed { message }) => {
                    error!("manager: worker reported: {message}");
                    stats.failed += 1;
                }
                Ok(WorkerResult::Ready {
                    slot,
                    segment,
                    length,
                }) => match self.consume(slot, &segment, length) {
                    Ok(()) => stats.displayed += 1,
                    Err(e) => {
                        error!("manager: skipping result for {slot}: {e}");
                        stats.skipped += 1;
                    }
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    stats.disconnected = true;
                    break;
                }
            }
        }
        stats
    }

    fn consume(&mut self, slot: Slot, name: &str, length: usize) -> Result<(), CacheError> {
        let bytes = segment::take(name, length)?;
        let image = image::load_from_memory(&bytes)
            .map_err(|e| {
                CacheError::transport(
                    name,
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("segment payload is not an image: {e}"),
                    ),
                )
            })?
            .to_rgba8();
        debug!(
            "manager: display {slot} ({}x{}, {length} bytes from {name})",
            image.width(),
            image.height()
        );
        self.display.set_image(DisplayImage { slot, image });
        Ok(())
    }
}
