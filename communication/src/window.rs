//! One-sided window cells.
//!
//! Each window is a flat vector of doubles guarded by a reader-writer lock.
//! Slot 0 of each message frame is the ready flag; a frame is
//! `1 + arity` doubles. Writers take the exclusive lock for the duration of
//! one deposit; pollers take the shared lock to inspect ready flags without
//! excluding one another.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// A shared window holding one or more `[is_ready, values…]` frames.
pub struct Window {
    data: RwLock<Vec<f64>>,
}

impl Window {
    /// Allocates a zeroed window of `len` doubles.
    pub fn new(len: usize) -> Arc<Window> {
        Arc::new(Window { data: RwLock::new(vec![0.0; len]) })
    }

    /// Takes the exclusive lock.
    pub fn lock_exclusive(&self) -> RwLockWriteGuard<'_, Vec<f64>> {
        self.data.write().expect("window lock poisoned")
    }

    /// Takes the shared lock.
    pub fn lock_shared(&self) -> RwLockReadGuard<'_, Vec<f64>> {
        self.data.read().expect("window lock poisoned")
    }
}
