//! The controller/application handshake cell.
//!
//! One shared-memory cell synchronizes the two processes across startup,
//! steady-state sampling, the name exchange, and shutdown. Each side owns
//! one status word and only ever advances it; the other side polls. The
//! cell also carries the CPU-to-rank table the application fills during
//! the mapping phase.

use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Upper bound on CPUs representable in the mapping table.
pub const MAX_NUM_CPU: usize = 1024;

/// Handshake states, advanced monotonically by each side.
pub mod status {
    /// Freshly created cell.
    pub const INIT: i32 = 0;
    /// The application is writing its CPU-to-rank map.
    pub const MAP_BEGIN: i32 = 1;
    /// The map is complete.
    pub const MAP_END: i32 = 2;
    /// Steady-state sampling.
    pub const SAMPLE_BEGIN: i32 = 3;
    /// The application has left its last region.
    pub const SAMPLE_END: i32 = 4;
    /// The application is writing region names.
    pub const NAME_BEGIN: i32 = 5;
    /// Names are complete.
    pub const NAME_END: i32 = 6;
    /// The application has exited.
    pub const SHUTDOWN: i32 = 7;
}

#[repr(C)]
struct ControlCell {
    ctl_status: AtomicI32,
    app_status: AtomicI32,
    cpu_rank: [AtomicI32; MAX_NUM_CPU],
}

/// One side's handle on the handshake cell.
pub struct ControlMessage {
    cell: *mut ControlCell,
    is_ctl: bool,
    timeout: Duration,
}

// The cell is all atomics; the raw pointer only gates mapping lifetime.
unsafe impl Send for ControlMessage {}

impl ControlMessage {
    /// Size of the underlying cell.
    pub fn size() -> usize {
        std::mem::size_of::<ControlCell>()
    }

    /// Wraps a mapped cell.
    ///
    /// # Safety
    ///
    /// `ptr` must point to at least [`ControlMessage::size`] bytes of live
    /// shared memory that outlives the returned handle.
    pub unsafe fn from_ptr(ptr: *mut u8, is_ctl: bool, timeout: Duration) -> ControlMessage {
        ControlMessage { cell: ptr.cast(), is_ctl, timeout }
    }

    /// Zeroes the cell; called once by the creating side before any peer
    /// attaches.
    pub fn initialize(&self) {
        let cell = self.cell();
        cell.ctl_status.store(status::INIT, Ordering::SeqCst);
        cell.app_status.store(status::INIT, Ordering::SeqCst);
        for slot in &cell.cpu_rank {
            slot.store(-1, Ordering::Relaxed);
        }
    }

    /// Advances this side's status; the handshake only moves forward.
    pub fn step_to(&self, new_status: i32) -> Result<()> {
        let own = self.own_status();
        if new_status < own.load(Ordering::SeqCst) {
            return Err(Error::Logic(
                format!("control message status may not move backwards to {}", new_status)));
        }
        own.store(new_status, Ordering::SeqCst);
        Ok(())
    }

    /// The peer's current status.
    pub fn peer_status(&self) -> i32 {
        self.peer().load(Ordering::SeqCst)
    }

    /// Busy-waits until the peer reaches `at_least`, or times out.
    pub fn wait_peer(&self, at_least: i32) -> Result<()> {
        let begin = Instant::now();
        while self.peer_status() < at_least {
            if begin.elapsed() >= self.timeout {
                return Err(Error::AppStalled(
                    format!("peer did not reach handshake state {} within {:?}",
                            at_least, self.timeout)));
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        Ok(())
    }

    /// Whether the peer has requested shutdown.
    pub fn is_shutdown(&self) -> bool {
        self.peer_status() >= status::SHUTDOWN
    }

    /// The rank running on a CPU, or -1 when unused.
    pub fn cpu_rank(&self, cpu: usize) -> i32 {
        self.cell().cpu_rank[cpu].load(Ordering::SeqCst)
    }

    /// Binds a CPU to a rank in the mapping table (application side).
    pub fn set_cpu_rank(&self, cpu: usize, rank: i32) {
        self.cell().cpu_rank[cpu].store(rank, Ordering::SeqCst);
    }

    fn cell(&self) -> &ControlCell {
        unsafe { &*self.cell }
    }

    fn own_status(&self) -> &AtomicI32 {
        let cell = self.cell();
        if self.is_ctl { &cell.ctl_status } else { &cell.app_status }
    }

    fn peer(&self) -> &AtomicI32 {
        let cell = self.cell();
        if self.is_ctl { &cell.app_status } else { &cell.ctl_status }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cell() -> (Vec<u8>, ControlMessage, ControlMessage) {
        let mut backing = vec![0u8; ControlMessage::size()];
        let ptr = backing.as_mut_ptr();
        let ctl = unsafe { ControlMessage::from_ptr(ptr, true, Duration::from_millis(50)) };
        let app = unsafe { ControlMessage::from_ptr(ptr, false, Duration::from_millis(50)) };
        ctl.initialize();
        (backing, ctl, app)
    }

    #[test]
    fn statuses_advance_independently() {
        let (_backing, ctl, app) = make_cell();
        assert_eq!(ctl.peer_status(), status::INIT);
        app.step_to(status::MAP_BEGIN).unwrap();
        app.step_to(status::MAP_END).unwrap();
        assert_eq!(ctl.peer_status(), status::MAP_END);
        assert_eq!(app.peer_status(), status::INIT);
        ctl.wait_peer(status::MAP_END).unwrap();
    }

    #[test]
    fn status_never_regresses() {
        let (_backing, _ctl, app) = make_cell();
        app.step_to(status::SAMPLE_BEGIN).unwrap();
        assert!(app.step_to(status::MAP_BEGIN).is_err());
        // Re-asserting the current state is permitted.
        app.step_to(status::SAMPLE_BEGIN).unwrap();
    }

    #[test]
    fn wait_times_out_as_stalled() {
        let (_backing, ctl, _app) = make_cell();
        let err = ctl.wait_peer(status::SHUTDOWN).unwrap_err();
        assert!(matches!(err, Error::AppStalled(_)));
    }

    #[test]
    fn cpu_rank_table_roundtrip() {
        let (_backing, ctl, app) = make_cell();
        assert_eq!(ctl.cpu_rank(5), -1);
        app.set_cpu_rank(5, 2);
        app.set_cpu_rank(0, 0);
        assert_eq!(ctl.cpu_rank(5), 2);
        assert_eq!(ctl.cpu_rank(0), 0);
        assert!(ctl.is_shutdown() == false);
        app.step_to(status::SHUTDOWN).unwrap();
        assert!(ctl.is_shutdown());
    }
}
