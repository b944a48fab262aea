use std::ptr;

use libc::c_void;
use log::debug;
use thiserror::Error;

/// Errors raised while obtaining the shared coverage region.
///
/// All of these are protocol/I-O failures: the session cannot continue
/// without its bitmap, so callers are expected to surface them and stop.
#[derive(Error, Debug)]
pub enum ShmemError {
    /// The environment variable the fuzzer uses to hand over the segment id
    /// was not present in the process environment.
    #[error("shared-memory environment variable `{0}` is not set")]
    MissingEnv(String),

    /// The environment variable was present but did not parse as a segment id.
    #[error("shared-memory id `{0}` is not a valid integer")]
    BadId(String),

    /// `shmat` refused the segment id supplied by the fuzzer.
    #[error("failed to attach System V shared-memory segment {id}: {source}")]
    AttachFailed { id: i32, source: std::io::Error },

    /// Anonymous `mmap` for a standalone region failed.
    #[error("failed to map {len} bytes of anonymous shared memory: {source}")]
    MapFailed { len: usize, source: std::io::Error },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backing {
    SysV,
    Anonymous,
}

/// A fixed-length byte region shared between the controller process and
/// every worker forked from it.
///
/// The region is created (or attached) exactly once, before the first fork,
/// and its mapping survives process duplication unchanged; the whole
/// session depends on that property. Length is fixed at creation and the
/// region is never resized.
///
/// Two backings exist: a System V segment attached from a fuzzer-supplied
/// id, and an anonymous `MAP_SHARED` mapping for standalone and self-test
/// runs. Both are released on `Drop` (`shmdt` / `munmap`).
#[derive(Debug)]
pub struct SharedRegion {
    ptr: *mut u8,
    len: usize,
    backing: Backing,
}

// The region is written only by the single live worker and read by the
// controller between iterations, so handing the raw pointer across the
// fork boundary upholds the single-writer discipline without a lock.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Attaches the System V segment with the given id.
    ///
    /// The segment's real size is owned by its creator (the fuzzer); `len`
    /// is the protocol-mandated bitmap size and callers must not index past
    /// it.
    pub fn attach_sysv(id: i32, len: usize) -> Result<Self, ShmemError> {
        let ptr = unsafe { libc::shmat(id, ptr::null(), 0) };
        if ptr as isize == -1 {
            return Err(ShmemError::AttachFailed {
                id,
                source: std::io::Error::last_os_error(),
            });
        }
        debug!("attached SysV shared-memory segment {id} ({len} bytes)");
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
            backing: Backing::SysV,
        })
    }

    /// Reads the segment id from `var` and attaches it.
    pub fn attach_from_env(var: &str, len: usize) -> Result<Self, ShmemError> {
        let raw = std::env::var(var).map_err(|_| ShmemError::MissingEnv(var.to_string()))?;
        let id: i32 = raw.trim().parse().map_err(|_| ShmemError::BadId(raw))?;
        Self::attach_sysv(id, len)
    }

    /// Maps `len` zeroed bytes of anonymous shared memory.
    ///
    /// `MAP_SHARED` rather than a heap allocation: a forked worker must
    /// write into the same physical pages the controller reads, not into a
    /// copy-on-write duplicate.
    pub fn anonymous(len: usize) -> Result<Self, ShmemError> {
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmemError::MapFailed {
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            len,
            backing: Backing::Anonymous,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        let rc = match self.backing {
            Backing::SysV => unsafe { libc::shmdt(self.ptr as *const c_void) },
            Backing::Anonymous => unsafe { libc::munmap(self.ptr as *mut c_void, self.len) },
        };
        if rc != 0 {
            debug!(
                "failed to release {:?} shared region: {}",
                self.backing,
                std::io::Error::last_os_error()
            );
        }
    }
}
