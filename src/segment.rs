//! POSIX shared-memory segments carrying one encoded image each.
//!
//! Layout of every segment:
//!
//! ```text
//!   [state: AtomicU32][reserved: 4 bytes][payload: len bytes]
//! ```
//!
//! The state word decides unlink authority across processes. The worker
//! creates a segment as `PUBLISHED`. The manager CASes it to `CLAIMED` before
//! copying; the worker CASes it to `REVOKED` before evicting. Whoever wins the
//! CAS unlinks the name, the loser leaves it alone, so each name is unlinked
//! exactly once even when eviction races consumption.

use std::ffi::CString;
use std::io::{self, Error, ErrorKind};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, trace, warn};

use crate::error::CacheError;

const HEADER_LEN: usize = 8;

const PUBLISHED: u32 = 1;
const CLAIMED: u32 = 2;
const REVOKED: u32 = 3;

/// Ownership state stored in a segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentState {
    /// Created by the worker, not yet taken by anyone.
    Published,
    /// Taken by the manager; the manager unlinks it.
    Claimed,
    /// Taken back by the worker; the worker unlinks it.
    Revoked,
    Unknown(u32),
}

impl From<u32> for SegmentState {
    fn from(v: u32) -> Self {
        match v {
            PUBLISHED => Self::Published,
            CLAIMED => Self::Claimed,
            REVOKED => Self::Revoked,
            other => Self::Unknown(other),
        }
    }
}

/// A mapped view of a named segment. Dropping unmaps; it never unlinks.
pub struct Segment {
    name: String,
    ptr: NonNull<u8>,
    map_len: usize,
}

// SAFETY: the mapping is exclusively owned by this handle; the only shared
// mutable word is the header atomic.
unsafe impl Send for Segment {}

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| Error::new(ErrorKind::InvalidInput, "name contains null byte"))
}

fn map_fd(fd: libc::c_int, len: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| Error::other("mmap returned null"))
}

impl Segment {
    /// Create a new segment holding `payload`. Fails if the name exists.
    pub fn create(name: &str, payload: &[u8]) -> io::Result<Self> {
        let c_path = c_name(name)?;
        let map_len = HEADER_LEN + payload.len();

        let fd = unsafe {
            libc::shm_open(
                c_path.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                (libc::S_IRUSR | libc::S_IWUSR) as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        let mapped = if unsafe { libc::ftruncate(fd, map_len as libc::off_t) } < 0 {
            Err(Error::last_os_error())
        } else {
            map_fd(fd, map_len)
        };
        // The mapping outlives the descriptor.
        unsafe {
            libc::close(fd);
        }
        let ptr = match mapped {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    libc::shm_unlink(c_path.as_ptr());
                }
                return Err(e);
            }
        };

        let seg = Self {
            name: name.to_string(),
            ptr,
            map_len,
        };
        unsafe {
            ptr::copy_nonoverlapping(
                payload.as_ptr(),
                seg.ptr.as_ptr().add(HEADER_LEN),
                payload.len(),
            );
        }
        seg.header().store(PUBLISHED, Ordering::Release);
        trace!("segment {name}: created ({} bytes)", payload.len());
        Ok(seg)
    }

    /// Map an existing segment.
    pub fn open(name: &str) -> io::Result<Self> {
        let c_path = c_name(name)?;
        let fd = unsafe { libc::shm_open(c_path.as_ptr(), libc::O_RDWR, 0) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        let mapped = if unsafe { libc::fstat(fd, &mut st) } < 0 {
            Err(Error::last_os_error())
        } else if (st.st_size as usize) < HEADER_LEN {
            Err(Error::new(
                ErrorKind::InvalidData,
                format!("segment too small: {} bytes", st.st_size),
            ))
        } else {
            map_fd(fd, st.st_size as usize).map(|p| (p, st.st_size as usize))
        };
        unsafe {
            libc::close(fd);
        }
        let (ptr, map_len) = mapped?;
        Ok(Self {
            name: name.to_string(),
            ptr,
            map_len,
        })
    }

    fn header(&self) -> &AtomicU32 {
        // SAFETY: mmap returns page-aligned memory of at least HEADER_LEN bytes.
        unsafe { &*(self.ptr.as_ptr() as *const AtomicU32) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn payload_len(&self) -> usize {
        self.map_len - HEADER_LEN
    }

    pub fn payload(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(HEADER_LEN), self.payload_len()) }
    }

    pub fn state(&self) -> SegmentState {
        self.header().load(Ordering::Acquire).into()
    }

    /// Take unlink authority as the consumer.
    pub fn claim(&self) -> bool {
        self.transition(CLAIMED)
    }

    /// Take unlink authority back as the producer.
    pub fn revoke(&self) -> bool {
        self.transition(REVOKED)
    }

    fn transition(&self, to: u32) -> bool {
        self.header()
            .compare_exchange(PUBLISHED, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}

/// Remove a segment name from the system.
pub fn unlink(name: &str) -> io::Result<()> {
    let c_path = c_name(name)?;
    if unsafe { libc::shm_unlink(c_path.as_ptr()) } < 0 {
        return Err(Error::last_os_error());
    }
    Ok(())
}

/// Whether a segment with this name can currently be opened.
pub fn exists(name: &str) -> bool {
    let Ok(c_path) = c_name(name) else {
        return false;
    };
    let fd = unsafe { libc::shm_open(c_path.as_ptr(), libc::O_RDONLY, 0) };
    if fd < 0 {
        return false;
    }
    unsafe {
        libc::close(fd);
    }
    true
}

// ---------------------------------------------------------------------------
// OwnedSegment: worker-side scoped ownership
// ---------------------------------------------------------------------------

/// A segment created by the worker. Released (revoked + unlinked) exactly
/// once: explicitly via [`OwnedSegment::release`] or implicitly on drop. If the
/// manager claimed it first, release does nothing.
pub struct OwnedSegment {
    inner: Segment,
    released: bool,
}

/// Outcome of releasing an [`OwnedSegment`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Unlinked,
    /// The manager claimed it and owns the unlink.
    ClaimedElsewhere,
}

impl OwnedSegment {
    pub fn create(name: &str, payload: &[u8]) -> Result<Self, CacheError> {
        let inner = Segment::create(name, payload).map_err(|e| CacheError::transport(name, e))?;
        Ok(Self {
            inner,
            released: false,
        })
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn len(&self) -> usize {
        self.inner.payload_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True once the manager has taken this segment.
    pub fn is_claimed(&self) -> bool {
        self.inner.state() == SegmentState::Claimed
    }

    pub fn release(mut self) -> Release {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Release {
        if self.released {
            return Release::ClaimedElsewhere;
        }
        self.released = true;
        if !self.inner.revoke() {
            trace!("segment {}: claimed by consumer, not unlinking", self.name());
            return Release::ClaimedElsewhere;
        }
        if let Err(e) = unlink(self.name()) {
            warn!("segment {}: unlink failed: {e}", self.name());
        }
        trace!("segment {}: unlinked", self.name());
        Release::Unlinked
    }
}

impl Drop for OwnedSegment {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Consume a published segment: claim it, copy out `length` payload bytes,
/// and unlink it. Once claimed the name is unlinked on every path.
pub fn take(name: &str, length: usize) -> Result<Vec<u8>, CacheError> {
    let seg = Segment::open(name).map_err(|e| CacheError::transport(name, e))?;
    if !seg.claim() {
        return Err(CacheError::transport(
            name,
            Error::new(
                ErrorKind::NotFound,
                format!("segment no longer available ({:?})", seg.state()),
            ),
        ));
    }

    let bytes = seg.payload().get(..length).map(<[u8]>::to_vec);
    if let Err(e) = unlink(name) {
        warn!("segment {name}: unlink after claim failed: {e}");
    }
    drop(seg);

    bytes.ok_or_else(|| {
        CacheError::transport(
            name,
            Error::new(
                ErrorKind::UnexpectedEof,
                format!("announced {length} bytes but segment is shorter"),
            ),
        )
    })
}

// ---------------------------------------------------------------------------
// Naming and stale cleanup
// ---------------------------------------------------------------------------

static NAMER_INSTANCES: AtomicU32 = AtomicU32::new(0);

/// Generates process-unique segment names: `/<prefix>_<pid>_<instance>_<seq>`.
///
/// The instance number keeps two workers in one process (threads, tests)
/// from colliding.
pub struct SegmentNamer {
    prefix: String,
    pid: u32,
    instance: u32,
    seq: u64,
}

impl SegmentNamer {
    pub fn new(prefix: &str) -> Self {
        Self::with_pid(prefix, std::process::id())
    }

    pub fn with_pid(prefix: &str, pid: u32) -> Self {
        Self {
            prefix: prefix.to_string(),
            pid,
            instance: NAMER_INSTANCES.fetch_add(1, Ordering::Relaxed),
            seq: 0,
        }
    }

    pub fn next_name(&mut self) -> String {
        let name = format!(
            "/{}_{}_{:x}_{:x}",
            self.prefix, self.pid, self.instance, self.seq
        );
        self.seq += 1;
        name
    }
}

/// Unlink every leftover segment that `pid` created under `prefix`.
///
/// Used by the host after a worker died without releasing its segments.
/// Returns the number of names removed.
#[cfg(target_os = "linux")]
pub fn purge_stale(prefix: &str, pid: u32) -> io::Result<usize> {
    let stem = format!("{prefix}_{pid}_");
    let mut removed = 0;
    for entry in std::fs::read_dir("/dev/shm")? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        if !file_name.starts_with(&stem) {
            continue;
        }
        match unlink(&format!("/{file_name}")) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("purge: failed to unlink {file_name}: {e}"),
        }
    }
    debug!("purge: removed {removed} stale segment(s) for pid {pid}");
    Ok(removed)
}

#[cfg(not(target_os = "linux"))]
pub fn purge_stale(_prefix: &str, pid: u32) -> io::Result<usize> {
    debug!("purge: shm listing unsupported on this platform (pid {pid})");
    Ok(0)
}
