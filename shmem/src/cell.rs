//! The fixed-layout policy/sample exchange cell.
//!
//! One 4 KiB page holding a process-shared mutex, an update flag, a value
//! count, and a vector of doubles. The layout is load-bearing for the other
//! side of the shared-memory boundary, which may not be written in Rust:
//! field order, padding, and total size are pinned by `repr(C)` and a
//! compile-time assertion.

use std::io;
use std::mem;

use static_assertions::const_assert_eq;

use crate::ShmemError;

/// Total size of one exchange cell.
pub const CELL_SIZE: usize = 4096;

#[repr(C)]
struct CellHeader {
    lock: libc::pthread_mutex_t,
    is_updated: u8,
    count: u64,
    values: f64,
}

/// Number of doubles one cell can carry after the header.
pub const CELL_NUM_VALUE: usize =
    (CELL_SIZE - mem::offset_of!(CellHeader, values)) / mem::size_of::<f64>();

/// A policy or sample cell shared between the controller and a resource
/// manager or application-side peer.
///
/// The embedded mutex is PTHREAD_MUTEX_ERRORCHECK and
/// PTHREAD_PROCESS_SHARED; relocking from the same thread is reported as an
/// error rather than deadlocking.
#[repr(C)]
pub struct ExchangeCell {
    lock: libc::pthread_mutex_t,
    is_updated: u8,
    count: u64,
    values: [f64; CELL_NUM_VALUE],
}

const_assert_eq!(mem::size_of::<ExchangeCell>(), CELL_SIZE);

impl ExchangeCell {
    /// Reinterprets `ptr` as a cell.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least [`CELL_SIZE`] bytes of live, writable,
    /// suitably aligned memory (a page-aligned shared-memory mapping
    /// qualifies), and the returned reference must not outlive the mapping.
    pub unsafe fn from_ptr<'a>(ptr: *mut u8) -> &'a mut ExchangeCell {
        &mut *ptr.cast::<ExchangeCell>()
    }

    /// Zeroes the cell and initializes the embedded mutex.
    ///
    /// Must be called exactly once, by the side that created the region,
    /// before any peer attaches.
    pub fn initialize(&mut self) -> Result<(), ShmemError> {
        self.is_updated = 0;
        self.count = 0;
        self.values = [0.0; CELL_NUM_VALUE];
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = mem::zeroed();
            check("pthread_mutexattr_init", libc::pthread_mutexattr_init(&mut attr))?;
            check("pthread_mutexattr_settype",
                  libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK))?;
            check("pthread_mutexattr_setpshared",
                  libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED))?;
            check("pthread_mutex_init", libc::pthread_mutex_init(&mut self.lock, &attr))?;
            libc::pthread_mutexattr_destroy(&mut attr);
        }
        Ok(())
    }

    /// Publishes `values` into the cell and raises the update flag.
    pub fn write(&mut self, values: &[f64]) -> Result<(), ShmemError> {
        if values.len() > CELL_NUM_VALUE {
            return Err(ShmemError::Invalid(
                format!("cell holds at most {} values, got {}", CELL_NUM_VALUE, values.len())));
        }
        self.lock()?;
        self.count = values.len() as u64;
        self.values[..values.len()].copy_from_slice(values);
        self.is_updated = 1;
        self.unlock()
    }

    /// Reads the published values into `out` if the update flag is raised,
    /// clearing the flag. Returns whether an update was consumed.
    pub fn read(&mut self, out: &mut Vec<f64>) -> Result<bool, ShmemError> {
        self.lock()?;
        let updated = self.is_updated != 0;
        if updated {
            let count = (self.count as usize).min(CELL_NUM_VALUE);
            out.clear();
            out.extend_from_slice(&self.values[..count]);
            self.is_updated = 0;
        }
        self.unlock()?;
        Ok(updated)
    }

    /// The value count most recently published.
    pub fn count(&self) -> usize {
        self.count as usize
    }

    fn lock(&mut self) -> Result<(), ShmemError> {
        check("pthread_mutex_lock", unsafe { libc::pthread_mutex_lock(&mut self.lock) })
    }

    fn unlock(&mut self) -> Result<(), ShmemError> {
        check("pthread_mutex_unlock", unsafe { libc::pthread_mutex_unlock(&mut self.lock) })
    }
}

fn check(op: &'static str, code: libc::c_int) -> Result<(), ShmemError> {
    if code != 0 {
        return Err(ShmemError::Os {
            op,
            key: String::new(),
            source: io::Error::from_raw_os_error(code),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SharedMemory;

    #[test]
    fn write_read_roundtrip() {
        let key = format!("/steer-cell-{}", std::process::id());
        let shmem = SharedMemory::create(&key, CELL_SIZE).unwrap();
        let cell = unsafe { ExchangeCell::from_ptr(shmem.pointer()) };
        cell.initialize().unwrap();

        let mut out = Vec::new();
        assert!(!cell.read(&mut out).unwrap());

        cell.write(&[160.0, f64::NAN, 3.5]).unwrap();
        assert!(cell.read(&mut out).unwrap());
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], 160.0);
        assert!(out[1].is_nan());
        assert_eq!(out[2], 3.5);

        // The flag is consumed by the read.
        assert!(!cell.read(&mut out).unwrap());
    }

    #[test]
    fn oversized_write_rejected() {
        let key = format!("/steer-cell-big-{}", std::process::id());
        let shmem = SharedMemory::create(&key, CELL_SIZE).unwrap();
        let cell = unsafe { ExchangeCell::from_ptr(shmem.pointer()) };
        cell.initialize().unwrap();
        let too_many = vec![0.0; CELL_NUM_VALUE + 1];
        assert!(matches!(cell.write(&too_many), Err(ShmemError::Invalid(_))));
    }
}
