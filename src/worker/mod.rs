//! Cache worker: materializes images into shared-memory segments.
//!
//! Event loop with two ready sources:
//!   - the command queue (explicit requests from the manager)
//!   - the background queue (the preload window)
//!
//! Fairness: each tick takes at most one pending command, then performs at
//! most one unit of background work (materialize one window index, then
//! evict). When there is no background work the command fetch waits up to
//! `idle_sleep`; otherwise it does not wait at all.
//!
//! Explicit requests always answer with exactly one result. Background
//! preloads are recorded but not announced; the first explicit request for a
//! preloaded index announces the existing segment instead of decoding again.
//! A segment name is announced at most once: repeating a request replaces the
//! segment, so a stale `Ready` still queued at the manager can no longer be
//! opened and is skipped.

pub mod decode;
pub mod state;

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::error::CacheError;
use crate::protocol::{Command, Sink, Slot, WorkerResult, wrap_next, wrap_previous};
use crate::segment::{OwnedSegment, SegmentNamer};
use crate::tables::{FallbackAssets, ScreenRole, TableList};

use decode::Decoder;
use state::CacheState;

/// Worker settings, fixed for the worker's lifetime.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound on live indexed segments once background work converges.
    pub max_cache: usize,
    /// Indices preloaded on each side of the pivot.
    pub preload_radius: usize,
    /// Longest wait for a command when there is no background work.
    pub idle_sleep: Duration,
    pub role: ScreenRole,
    /// Downscale images to fit within `(width, height)`.
    pub max_size: Option<(u32, u32)>,
    pub segment_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_cache: 10,
            preload_radius: 4,
            idle_sleep: Duration::from_millis(5),
            role: ScreenRole::Table,
            max_size: None,
            segment_prefix: "ccache".into(),
        }
    }
}

/// Whether the loop keeps going after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

enum Fetch {
    Command(Command),
    Idle,
    Closed,
}

pub struct CacheWorker<T: TableList, A: FallbackAssets> {
    tables: T,
    assets: A,
    config: WorkerConfig,
    decoder: Decoder,
    // Created on first use so the pid in segment names is the pid of the
    // process that actually runs the worker.
    namer: Option<SegmentNamer>,
    state: CacheState,
}

impl<T: TableList, A: FallbackAssets> CacheWorker<T, A> {
    pub fn new(tables: T, assets: A, mut config: WorkerConfig) -> Self {
        if config.max_cache == 0 {
            warn!("worker: max_cache=0 would evict the pivot, using 1");
            config.max_cache = 1;
        }
        Self {
            decoder: Decoder::new(config.max_size),
            tables,
            assets,
            config,
            namer: None,
            state: CacheState::default(),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Indices with a segment in bookkeeping, ascending.
    pub fn cached_indices(&self) -> Vec<usize> {
        self.state.cached_indices()
    }

    /// Number of live (unclaimed) indexed segments.
    pub fn live_count(&self) -> usize {
        self.state.live_count()
    }

    pub fn pivot(&self) -> Option<usize> {
        self.state.pivot()
    }

    pub fn has_background_work(&self) -> bool {
        self.state.has_pending() || self.state.cached_count() > self.config.max_cache
    }

    // -----------------------------------------------------------------------
    // Event loop
    // -----------------------------------------------------------------------

    /// Serve commands until `Quit` or channel closure, then release every
    /// segment. A fatal error is reported once as a `Failed` result (best
    /// effort) before returning it.
    pub fn run<S: Sink<WorkerResult>>(
        &mut self,
        commands: &mpsc::Receiver<Command>,
        results: &mut S,
    ) -> Result<(), CacheError> {
        info!(
            "worker: started (pid={}, count={}, max_cache={}, radius={}, role={})",
            std::process::id(),
            self.tables.count(),
            self.config.max_cache,
            self.config.preload_radius,
            self.config.role
        );
        let outcome = self.event_loop(commands, results);
        if let Err(e) = &outcome {
            error!("worker: {e}");
            let message = match e {
                CacheError::Fatal(_) => e.to_string(),
                other => CacheError::Fatal(other.to_string()).to_string(),
            };
            if results.send(WorkerResult::Failed { message }).is_err() {
                debug!("worker: could not report fatal error, result channel gone");
            }
        }
        self.release_all();
        outcome
    }

    fn event_loop<S: Sink<WorkerResult>>(
        &mut self,
        commands: &mpsc::Receiver<Command>,
        results: &mut S,
    ) -> Result<(), CacheError> {
        loop {
            match self.fetch(commands) {
                Fetch::Command(cmd) => {
                    if self.handle(cmd, results)? == Flow::Quit {
                        info!("worker: quit requested");
                        return Ok(());
                    }
                }
                Fetch::Idle => {}
                Fetch::Closed => {
                    info!("worker: command channel closed, shutting down");
                    return Ok(());
                }
            }
            self.step();
        }
    }

    fn fetch(&self, commands: &mpsc::Receiver<Command>) -> Fetch {
        if self.has_background_work() {
            match commands.try_recv() {
                Ok(cmd) => Fetch::Command(cmd),
                Err(TryRecvError::Empty) => Fetch::Idle,
                Err(TryRecvError::Disconnected) => Fetch::Closed,
            }
        } else {
            match commands.recv_timeout(self.config.idle_sleep) {
                Ok(cmd) => Fetch::Command(cmd),
                Err(RecvTimeoutError::Timeout) => Fetch::Idle,
                Err(RecvTimeoutError::Disconnected) => Fetch::Closed,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Handle one command. Only a failure to deliver a result is an error;
    /// everything else resolves to a `Ready` or `Failed` result.
    pub fn handle<S: Sink<WorkerResult>>(
        &mut self,
        cmd: Command,
        results: &mut S,
    ) -> Result<Flow, CacheError> {
        debug!("worker: command {cmd:?}");
        let count = self.tables.count();
        match cmd {
            Command::LoadIndex(i) => self.load(i, results)?,
            Command::LoadNext(current) => match wrap_next(current, count) {
                Some(i) => self.load(i, results)?,
                None => debug!("worker: load_next on empty list ignored"),
            },
            Command::LoadPrevious(current) => match wrap_previous(current, count) {
                Some(i) => self.load(i, results)?,
                None => debug!("worker: load_previous on empty list ignored"),
            },
            Command::LoadLogo => self.load_logo(results)?,
            Command::Quit => return Ok(Flow::Quit),
        }
        Ok(Flow::Continue)
    }

    /// Make `index` available and announce it.
    pub fn load<S: Sink<WorkerResult>>(&mut self, index: usize, results: &mut S) -> Result<(), CacheError> {
        let count = self.tables.count();
        if index >= count {
            let e = CacheError::OutOfRange { index, count };
            warn!("worker: {e}");
            results.send(WorkerResult::Failed {
                message: e.to_string(),
            })?;
            return Ok(());
        }
        self.state.set_pivot(index);

        let result = match self.state.announce(index) {
            Some(seg) => {
                debug!("worker: index {index} already cached as {}", seg.name());
                ready(Slot::Table(index), seg)
            }
            None => match self.materialize(index) {
                Ok(seg) => ready(Slot::Table(index), self.state.insert(index, seg, true)),
                Err(e) => failed(Slot::Table(index), e),
            },
        };
        results.send(result)?;

        self.state
            .maybe_recenter(index, self.config.preload_radius, count);
        Ok(())
    }

    /// Load the fixed logo asset. Before any table has been requested this
    /// also starts the initial preload around 0; later it leaves the pivot and
    /// window alone.
    pub fn load_logo<S: Sink<WorkerResult>>(&mut self, results: &mut S) -> Result<(), CacheError> {
        let logo = self.assets.logo().to_path_buf();
        let result = match self.state.announce_logo() {
            Some(seg) => ready(Slot::Logo, seg),
            None => match self.materialize_path(&logo) {
                Ok(seg) => ready(Slot::Logo, self.state.set_logo(seg)),
                Err(e) => failed(Slot::Logo, e),
            },
        };
        results.send(result)?;

        let count = self.tables.count();
        if self.state.pivot().is_none() && count > 0 {
            self.state.set_pivot(0);
            self.state
                .recenter(0, self.config.preload_radius, count, true);
        }
        Ok(())
    }

    /// One unit of background work: materialize the next window index, then
    /// evict down to the bound. Returns whether anything happened.
    pub fn step(&mut self) -> bool {
        self.state.reap_claimed();

        let count = self.tables.count();
        let mut worked = false;
        if let Some(index) = self.state.next_pending(count, self.config.max_cache) {
            worked = true;
            match self.materialize(index) {
                Ok(seg) => {
                    debug!("worker: preloaded index {index} as {}", seg.name());
                    self.state.insert(index, seg, false);
                }
                Err(e) => error!("worker: preload of index {index} failed: {e}"),
            }
        }

        let evicted = self.state.evict(self.config.max_cache);
        worked || !evicted.is_empty()
    }

    /// Run background steps until there is nothing left to do.
    pub fn settle(&mut self) {
        while self.step() {}
    }

    /// Release every segment the worker still owns.
    pub fn release_all(&mut self) {
        let unlinked = self.state.release_all();
        info!("worker: released {unlinked} segment(s)");
    }

    fn materialize(&mut self, index: usize) -> Result<OwnedSegment, CacheError> {
        let count = self.tables.count();
        let path = self
            .tables
            .image_path_for(index, self.config.role)
            .ok_or(CacheError::OutOfRange { index, count })?;
        self.materialize_path(&path)
    }

    fn materialize_path(&mut self, path: &Path) -> Result<OwnedSegment, CacheError> {
        let bytes = self.decoder.encode_or_fallback(path, &self.assets)?;
        let name = self
            .namer
            .get_or_insert_with(|| SegmentNamer::new(&self.config.segment_prefix))
            .next_name();
        OwnedSegment::create(&name, &bytes)
    }
}

/// Run `worker` and turn a panic into a fatal error.
///
/// Both hosts go through here: on panic every segment is released and a
/// `Failed` result is sent (best effort) before the error is returned.
pub fn run_guarded<T, A, S>(
    worker: &mut CacheWorker<T, A>,
    commands: &mpsc::Receiver<Command>,
    results: &mut S,
) -> Result<(), CacheError>
where
    T: TableList,
    A: FallbackAssets,
    S: Sink<WorkerResult>,
{
    match panic::catch_unwind(AssertUnwindSafe(|| worker.run(commands, results))) {
        Ok(outcome) => outcome,
        Err(payload) => {
            let what = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            let e = CacheError::Fatal(format!("panic: {what}"));
            error!("worker: {e}");
            worker.release_all();
            let message = e.to_string();
            if results.send(WorkerResult::Failed { message }).is_err() {
                debug!("worker: could not report panic, result channel gone");
            }
            Err(e)
        }
    }
}

fn ready(slot: Slot, seg: &OwnedSegment) -> WorkerResult {
    WorkerResult::Ready {
        slot,
        segment: seg.name().to_string(),
        length: seg.len(),
    }
}

fn failed(slot: Slot, e: CacheError) -> WorkerResult {
    match &e {
        CacheError::Transport { .. } => error!("worker: {slot}: {e}"),
        _ => warn!("worker: {slot}: {e}"),
    }
    WorkerResult::Failed {
        message: format!("{slot}: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Thread hosting
// ---------------------------------------------------------------------------

/// A worker running on a thread of the current process.
pub struct WorkerThread {
    pub commands: mpsc::Sender<Command>,
    pub results: mpsc::Receiver<WorkerResult>,
    pub handle: JoinHandle<Result<(), CacheError>>,
}

/// Run `worker` on its own thread with in-process channels.
pub fn spawn_thread<T, A>(mut worker: CacheWorker<T, A>) -> io::Result<WorkerThread>
where
    T: TableList + 'static,
    A: FallbackAssets + 'static,
{
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let (res_tx, res_rx) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("cache-worker".into())
        .spawn(move || {
            let mut results = res_tx;
            run_guarded(&mut worker, &cmd_rx, &mut results)
        })?;
    Ok(WorkerThread {
        commands: cmd_tx,
        results: res_rx,
        handle,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment;
    use crate::tables::AssetPaths;
    use image::{Rgba, RgbaImage};
    use std::path::PathBuf;

    struct Fixture {
        _dir: tempfile::TempDir,
        tables: Vec<PathBuf>,
        assets: AssetPaths,
    }

    fn write_png(path: &Path, shade: u8) {
        RgbaImage::from_pixel(3, 2, Rgba([shade, shade, 0, 255]))
            .save(path)
            .unwrap();
    }

    fn fixture(count: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let tables = (0..count)
            .map(|i| {
                let p = dir.path().join(format!("t{i}.png"));
                write_png(&p, i as u8 * 10);
                p
            })
            .collect();
        let assets = AssetPaths {
            missing_image: dir.path().join("missing.png"),
            logo: dir.path().join("logo.png"),
        };
        write_png(&assets.missing_image, 255);
        write_png(&assets.logo, 128);
        Fixture {
            _dir: dir,
            tables,
            assets,
        }
    }

    fn worker(fx: &Fixture, max_cache: usize, radius: usize) -> CacheWorker<Vec<PathBuf>, AssetPaths> {
        CacheWorker::new(
            fx.tables.clone(),
            fx.assets.clone(),
            WorkerConfig {
                max_cache,
                preload_radius: radius,
                ..WorkerConfig::default()
            },
        )
    }

    fn ready_slots(results: &mpsc::Receiver<WorkerResult>) -> Vec<Slot> {
        results
            .try_iter()
            .map(|r| match r {
                WorkerResult::Ready { slot, .. } => slot,
                WorkerResult::Failed { message } => panic!("unexpected failure: {message}"),
            })
            .collect()
    }

    #[test]
    fn next_and_previous_wrap() {
        let fx = fixture(3);
        let mut w = worker(&fx, 10, 0);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadNext(2), &mut tx).unwrap();
        w.handle(Command::LoadPrevious(0), &mut tx).unwrap();
        assert_eq!(ready_slots(&rx), vec![Slot::Table(0), Slot::Table(2)]);
        assert_eq!(w.pivot(), Some(2));
    }

    #[test]
    fn empty_list_navigation_is_noop() {
        let fx = fixture(0);
        let mut w = worker(&fx, 10, 2);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadNext(0), &mut tx).unwrap();
        w.handle(Command::LoadPrevious(0), &mut tx).unwrap();
        assert!(rx.try_recv().is_err());
        assert_eq!(w.pivot(), None);
    }

    #[test]
    fn out_of_range_is_failed_result() {
        let fx = fixture(2);
        let mut w = worker(&fx, 10, 0);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        assert_eq!(w.handle(Command::LoadIndex(5), &mut tx).unwrap(), Flow::Continue);
        match rx.try_recv().unwrap() {
            WorkerResult::Failed { message } => assert!(message.contains("out of range")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(w.live_count(), 0);
    }

    fn ready_names(results: &mpsc::Receiver<WorkerResult>) -> Vec<String> {
        results
            .try_iter()
            .map(|r| match r {
                WorkerResult::Ready { segment, .. } => segment,
                other => panic!("{other:?}"),
            })
            .collect()
    }

    #[test]
    fn repeated_load_replaces_announced_segment() {
        let fx = fixture(4);
        let mut w = worker(&fx, 10, 0);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadIndex(1), &mut tx).unwrap();
        w.handle(Command::LoadIndex(1), &mut tx).unwrap();
        let names = ready_names(&rx);
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
        // The first announcement can no longer be opened, so a manager that
        // drains both shows the image once.
        assert!(!segment::exists(&names[0]));
        assert!(segment::exists(&names[1]));
        assert_eq!(w.live_count(), 1);
        w.release_all();
        assert!(!segment::exists(&names[1]));
    }

    #[test]
    fn preloaded_segment_is_announced_once() {
        let fx = fixture(4);
        let mut w = worker(&fx, 10, 1);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadIndex(0), &mut tx).unwrap();
        w.settle();
        assert_eq!(w.cached_indices(), vec![0, 1, 3]);
        let _ = ready_names(&rx);

        // Index 1 was preloaded: the first request hands out that segment.
        w.handle(Command::LoadIndex(1), &mut tx).unwrap();
        w.handle(Command::LoadIndex(1), &mut tx).unwrap();
        let names = ready_names(&rx);
        assert_eq!(names.len(), 2);
        assert_ne!(names[0], names[1]);
        assert!(!segment::exists(&names[0]));
        w.release_all();
    }

    #[test]
    fn back_and_forth_ends_on_a_live_segment() {
        let fx = fixture(6);
        let mut w = worker(&fx, 10, 0);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        for i in [3, 4, 3] {
            w.handle(Command::LoadIndex(i), &mut tx).unwrap();
        }
        let results: Vec<(Slot, String)> = rx
            .try_iter()
            .map(|r| match r {
                WorkerResult::Ready { slot, segment, .. } => (slot, segment),
                other => panic!("{other:?}"),
            })
            .collect();
        assert_eq!(results.len(), 3);
        // Only the latest announcement for index 3 is still openable.
        assert!(!segment::exists(&results[0].1));
        assert_eq!(results[2].0, Slot::Table(3));
        assert!(segment::exists(&results[2].1));
        w.release_all();
    }

    #[test]
    fn consumed_entry_is_rematerialized() {
        let fx = fixture(4);
        let mut w = worker(&fx, 10, 0);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadIndex(2), &mut tx).unwrap();
        let Ok(WorkerResult::Ready { segment: first, length, .. }) = rx.try_recv() else {
            panic!("expected ready");
        };
        segment::take(&first, length).unwrap();
        w.step();
        assert_eq!(w.live_count(), 0);

        w.handle(Command::LoadIndex(2), &mut tx).unwrap();
        let Ok(WorkerResult::Ready { segment: second, .. }) = rx.try_recv() else {
            panic!("expected ready");
        };
        assert_ne!(first, second);
        assert!(segment::exists(&second));
        w.release_all();
    }

    #[test]
    fn logo_preloads_around_zero() {
        let fx = fixture(6);
        let mut w = worker(&fx, 10, 1);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadLogo, &mut tx).unwrap();
        assert_eq!(ready_slots(&rx), vec![Slot::Logo]);
        w.settle();
        assert_eq!(w.cached_indices(), vec![0, 1, 5]);
        // Preloads are not announced.
        assert!(rx.try_recv().is_err());
        w.release_all();
    }

    #[test]
    fn logo_after_navigation_keeps_pivot_and_window() {
        let fx = fixture(20);
        let mut w = worker(&fx, 10, 2);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadIndex(10), &mut tx).unwrap();
        w.handle(Command::LoadLogo, &mut tx).unwrap();
        assert_eq!(ready_slots(&rx), vec![Slot::Table(10), Slot::Logo]);
        w.settle();
        assert_eq!(w.pivot(), Some(10));
        assert_eq!(w.cached_indices(), vec![8, 9, 10, 11, 12]);
        w.release_all();
    }

    #[test]
    fn wrapped_preloads_beyond_bound_are_skipped() {
        let fx = fixture(20);
        let mut w = worker(&fx, 3, 2);
        let (mut tx, _rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadIndex(0), &mut tx).unwrap();
        // Window is [1, 19, 2, 18]; 19 and 18 would be evicted first, so they
        // are never decoded.
        while w.step() {
            let cached = w.cached_indices();
            assert!(
                !cached.contains(&19) && !cached.contains(&18),
                "decoded a wrapped index that eviction drops: {cached:?}"
            );
        }
        assert_eq!(w.cached_indices(), vec![0, 1, 2]);
        w.release_all();
    }

    #[test]
    fn missing_source_uses_placeholder() {
        let mut fx = fixture(2);
        fx.tables[1] = PathBuf::from("/nonexistent/t1.png");
        let expected = decode::encode_image(&fx.assets.missing_image, None).unwrap();
        let mut w = worker(&fx, 10, 0);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadIndex(1), &mut tx).unwrap();
        match rx.try_recv().unwrap() {
            WorkerResult::Ready { slot, segment, length } => {
                assert_eq!(slot, Slot::Table(1));
                assert_eq!(segment::take(&segment, length).unwrap(), expected);
            }
            other => panic!("expected ready, got {other:?}"),
        }
    }

    #[test]
    fn missing_placeholder_reports_failure() {
        let mut fx = fixture(1);
        fx.tables[0] = PathBuf::from("/nonexistent/t0.png");
        fx.assets.missing_image = PathBuf::from("/nonexistent/missing.png");
        let mut w = worker(&fx, 10, 0);
        let (mut tx, rx) = mpsc::channel::<WorkerResult>();
        w.handle(Command::LoadIndex(0), &mut tx).unwrap();
        assert!(matches!(rx.try_recv().unwrap(), WorkerResult::Failed { .. }));
        assert_eq!(w.live_count(), 0);
    }

    #[test]
    fn eviction_keeps_nearest_to_pivot() {
        let fx = fixture(5);
        let mut w = worker(&fx, 3, 0);
        let (mut tx, _rx) = mpsc::channel::<WorkerResult>();
        for i in [0, 1, 2, 3, 4] {
            w.handle(Command::LoadIndex(i), &mut tx).unwrap();
        }
        w.handle(Command::LoadIndex(2), &mut tx).unwrap();
        w.settle();
        // 0 and 4 tie at distance 2; the lower index goes first.
        assert_eq!(w.cached_indices(), vec![1, 2, 3]);
        w.release_all();
    }

    #[test]
    fn closed_result_channel_is_fatal() {
        let fx = fixture(2);
        let mut w = worker(&fx, 10, 0);
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (mut res_tx, res_rx) = mpsc::channel::<WorkerResult>();
        drop(res_rx);
        cmd_tx.send(Command::LoadIndex(0)).unwrap();
        let err = w.run(&cmd_rx, &mut res_tx).unwrap_err();
        assert!(matches!(err, CacheError::Channel(_)));
        assert_eq!(w.live_count(), 0, "segments released after fatal error");
    }

    struct PanickingTables(Vec<PathBuf>);

    impl TableList for PanickingTables {
        fn count(&self) -> usize {
            self.0.len()
        }

        fn image_path_for(&self, index: usize, role: ScreenRole) -> Option<PathBuf> {
            if index == 1 {
                panic!("table list corrupted at {index}");
            }
            self.0.image_path_for(index, role)
        }
    }

    #[test]
    fn guarded_run_reports_panic_and_releases() {
        let fx = fixture(3);
        let config = WorkerConfig {
            preload_radius: 0,
            ..WorkerConfig::default()
        };
        let mut w = CacheWorker::new(PanickingTables(fx.tables.clone()), fx.assets.clone(), config);
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (mut res_tx, res_rx) = mpsc::channel::<WorkerResult>();
        cmd_tx.send(Command::LoadIndex(0)).unwrap();
        cmd_tx.send(Command::LoadIndex(1)).unwrap();

        let err = run_guarded(&mut w, &cmd_rx, &mut res_tx).unwrap_err();
        assert!(matches!(&err, CacheError::Fatal(m) if m.contains("table list corrupted")));

        let results: Vec<WorkerResult> = res_rx.try_iter().collect();
        let WorkerResult::Ready { segment: first, .. } = &results[0] else {
            panic!("expected ready, got {:?}", results[0]);
        };
        match &results[1] {
            WorkerResult::Failed { message } => {
                assert!(message.starts_with("worker fatal: panic:"), "{message}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(w.live_count(), 0);
        assert!(!segment::exists(first));
    }

    #[test]
    fn max_cache_zero_clamped() {
        let fx = fixture(1);
        let w = worker(&fx, 0, 0);
        assert_eq!(w.config().max_cache, 1);
    }
}
