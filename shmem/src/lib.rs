//! POSIX shared memory with an explicit create-then-attach-then-unlink
//! lifecycle.
//!
//! The controller creates every region it owns with [`SharedMemory::create`];
//! the application (or a second process generally) attaches with
//! [`SharedMemory::attach`], which polls for both existence and full size up
//! to a timeout. The creating side unlinks the key on drop; attached sides
//! only unmap.
//!
//! Region keys follow the pattern `/<prefix>-<purpose>[-<suffix>]`, e.g.
//! `/geopm-shm-1000-sample-7`.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::time::{Duration, Instant};

pub mod cell;

pub use cell::{ExchangeCell, CELL_SIZE, CELL_NUM_VALUE};

/// Errors raised by shared-memory operations.
#[derive(Debug, thiserror::Error)]
pub enum ShmemError {
    /// A key or size argument was malformed.
    #[error("shmem: invalid argument: {0}")]
    Invalid(String),
    /// An operating system call failed.
    #[error("shmem: {op} failed for key {key}: {source}")]
    Os {
        /// The failing call.
        op: &'static str,
        /// The region key.
        key: String,
        /// The OS error.
        #[source]
        source: io::Error,
    },
    /// The region did not appear (or reach full size) within the timeout.
    #[error("shmem: timed out attaching to key {0}")]
    Timeout(String),
}

impl ShmemError {
    fn os(op: &'static str, key: &str) -> Self {
        ShmemError::Os { op, key: key.to_owned(), source: io::Error::last_os_error() }
    }
}

/// A mapped POSIX shared-memory region.
///
/// The region is unmapped on drop; if this handle created the region, the
/// key is also unlinked.
pub struct SharedMemory {
    key: String,
    size: usize,
    ptr: *mut u8,
    is_owner: bool,
}

// The mapping is plain memory; all synchronization on its contents is the
// caller's responsibility (the exchange cell carries its own mutex).
unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Creates a shared-memory region of `size` bytes under `key`.
    ///
    /// If the key already exists the call recovers by attaching to the
    /// existing region instead, without claiming ownership of the key.
    pub fn create(key: &str, size: usize) -> Result<Self, ShmemError> {
        if size == 0 {
            return Err(ShmemError::Invalid("cannot create region of zero size".into()));
        }
        let c_key = Self::c_key(key)?;
        let fd = unsafe {
            libc::shm_open(c_key.as_ptr(), libc::O_RDWR | libc::O_CREAT | libc::O_EXCL, 0o660)
        };
        if fd < 0 {
            if io::Error::last_os_error().raw_os_error() == Some(libc::EEXIST) {
                return Self::attach(key, size, Duration::from_secs(0));
            }
            return Err(ShmemError::os("shm_open", key));
        }
        if unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let err = ShmemError::os("ftruncate", key);
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_key.as_ptr());
            }
            return Err(err);
        }
        let ptr = Self::map(fd, size, key).inspect_err(|_| unsafe {
            libc::close(fd);
            libc::shm_unlink(c_key.as_ptr());
        })?;
        unsafe { libc::close(fd) };
        Ok(SharedMemory { key: key.to_owned(), size, ptr, is_owner: true })
    }

    /// Attaches to an existing region, polling until it exists and has grown
    /// to at least `size` bytes, or until `timeout` elapses.
    ///
    /// A zero timeout attempts the attach exactly once.
    pub fn attach(key: &str, size: usize, timeout: Duration) -> Result<Self, ShmemError> {
        if size == 0 {
            return Err(ShmemError::Invalid("cannot attach region of zero size".into()));
        }
        let c_key = Self::c_key(key)?;
        let begin = Instant::now();
        let fd = loop {
            let fd = unsafe { libc::shm_open(c_key.as_ptr(), libc::O_RDWR, 0o660) };
            if fd >= 0 || begin.elapsed() >= timeout {
                break fd;
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        if fd < 0 {
            return if timeout.is_zero() {
                Err(ShmemError::os("shm_open", key))
            }
            else {
                Err(ShmemError::Timeout(key.to_owned()))
            };
        }
        // The creator may not have run ftruncate yet; wait for full size.
        loop {
            let mut stat: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut stat) } != 0 {
                let err = ShmemError::os("fstat", key);
                unsafe { libc::close(fd) };
                return Err(err);
            }
            if stat.st_size as usize >= size {
                break;
            }
            if begin.elapsed() >= timeout {
                unsafe { libc::close(fd) };
                return Err(ShmemError::Timeout(key.to_owned()));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        let ptr = Self::map(fd, size, key).inspect_err(|_| unsafe {
            libc::close(fd);
        })?;
        unsafe { libc::close(fd) };
        Ok(SharedMemory { key: key.to_owned(), size, ptr, is_owner: false })
    }

    /// The base pointer of the mapping.
    pub fn pointer(&self) -> *mut u8 {
        self.ptr
    }

    /// The key the region was created or attached under.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// The mapped size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether this handle created (and will unlink) the region.
    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Removes the key from the namespace ahead of drop.
    ///
    /// Existing mappings (here and in other processes) stay valid until
    /// unmapped. Safe to call from either side; only owners unlink
    /// implicitly on drop.
    pub fn unlink(&mut self) -> Result<(), ShmemError> {
        let c_key = Self::c_key(&self.key)?;
        self.is_owner = false;
        if unsafe { libc::shm_unlink(c_key.as_ptr()) } != 0 {
            return Err(ShmemError::os("shm_unlink", &self.key));
        }
        Ok(())
    }

    fn map(fd: libc::c_int, size: usize, key: &str) -> Result<*mut u8, ShmemError> {
        let ptr = unsafe {
            libc::mmap(ptr::null_mut(), size,
                       libc::PROT_READ | libc::PROT_WRITE,
                       libc::MAP_SHARED, fd, 0)
        };
        if ptr == libc::MAP_FAILED {
            return Err(ShmemError::os("mmap", key));
        }
        Ok(ptr.cast())
    }

    fn c_key(key: &str) -> Result<CString, ShmemError> {
        if !key.starts_with('/') || key.len() < 2 {
            return Err(ShmemError::Invalid(format!("key must begin with '/': {:?}", key)));
        }
        CString::new(key).map_err(|_| ShmemError::Invalid(format!("key contains NUL: {:?}", key)))
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.cast(), self.size);
            if self.is_owner {
                if let Ok(c_key) = Self::c_key(&self.key) {
                    libc::shm_unlink(c_key.as_ptr());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key(tag: &str) -> String {
        format!("/steer-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn create_attach_roundtrip() {
        let key = test_key("rt");
        let owner = SharedMemory::create(&key, 4096).unwrap();
        assert!(owner.is_owner());
        unsafe { owner.pointer().cast::<u64>().write(0xDEADBEEF) };

        let user = SharedMemory::attach(&key, 4096, Duration::from_secs(1)).unwrap();
        assert!(!user.is_owner());
        assert_eq!(unsafe { user.pointer().cast::<u64>().read() }, 0xDEADBEEF);
    }

    #[test]
    fn create_existing_attaches() {
        let key = test_key("ex");
        let owner = SharedMemory::create(&key, 4096).unwrap();
        let second = SharedMemory::create(&key, 4096).unwrap();
        assert!(owner.is_owner());
        assert!(!second.is_owner());
    }

    #[test]
    fn attach_missing_times_out() {
        let key = test_key("missing");
        let begin = Instant::now();
        let result = SharedMemory::attach(&key, 4096, Duration::from_millis(20));
        assert!(matches!(result, Err(ShmemError::Timeout(_))));
        assert!(begin.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn zero_size_rejected() {
        assert!(matches!(SharedMemory::create("/steer-zero", 0),
                         Err(ShmemError::Invalid(_))));
    }

    #[test]
    fn bad_key_rejected() {
        assert!(matches!(SharedMemory::create("no-slash", 4096),
                         Err(ShmemError::Invalid(_))));
    }

    #[test]
    fn unlink_releases_key() {
        let key = test_key("unlink");
        let mut owner = SharedMemory::create(&key, 4096).unwrap();
        owner.unlink().unwrap();
        assert!(SharedMemory::attach(&key, 4096, Duration::from_secs(0)).is_err());
        // A fresh create must succeed now that the key is free.
        let again = SharedMemory::create(&key, 4096).unwrap();
        assert!(again.is_owner());
    }
}
