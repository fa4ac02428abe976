//! Typed event logging shared by the steer runtime crates.
//!
//! A [`Registry`] maps stream names to typed [`Logger`] handles. Components
//! publish events (controller ticks, tree traffic, profile drains) without
//! knowing their destination; the harness installs an action per stream and
//! may remove it to close the stream.

use std::rc::Rc;
use std::cell::RefCell;
use std::any::Any;
use std::collections::HashMap;
use std::time::{Instant, Duration};

/// A registry binding stream names to typed logging actions.
pub struct Registry {
    /// An instant common to all logging statements.
    time: Instant,
    /// A map from names to typed loggers.
    map: HashMap<String, Box<dyn Any>>,
}

impl Registry {
    /// Binds a log name to an action on log event batches.
    ///
    /// Returns any pre-installed action rather than overwriting it. New
    /// loggers obtained under this name will use the new destination, and
    /// existing loggers will continue to use the old one.
    ///
    /// The action observes batches of events with non-decreasing timestamps,
    /// together with a timestamp lower-bounding the next event it could see.
    /// A stream is closed only by dropping the action, which `remove`
    /// accomplishes.
    pub fn insert<T: 'static, F: Fn(&Duration, &[(Duration, T)]) + 'static>(
        &mut self,
        name: &str,
        action: F) -> Option<Box<dyn Any>>
    {
        let logger = Logger::<T>::new(self.time, Box::new(action));
        self.map.insert(name.to_owned(), Box::new(logger))
    }

    /// Removes a bound logger, closing the stream.
    pub fn remove(&mut self, name: &str) -> Option<Box<dyn Any>> {
        self.map.remove(name)
    }

    /// Retrieves a shared logger, if one has been inserted.
    pub fn get<T: 'static>(&self, name: &str) -> Option<Logger<T>> {
        self.map
            .get(name)
            .and_then(|entry| entry.downcast_ref::<Logger<T>>())
            .cloned()
    }

    /// Creates a new logger registry.
    pub fn new(time: Instant) -> Self {
        Registry {
            time,
            map: HashMap::new(),
        }
    }
}

type LogAction<T> = Box<dyn Fn(&Duration, &[(Duration, T)])>;

/// A buffering logger.
pub struct Logger<T> {
    time:   Instant,            // common instant used for all loggers.
    action: Rc<LogAction<T>>,   // action to take on full log buffers.
    buffer: Rc<RefCell<Vec<(Duration, T)>>>,
}

impl<T> Clone for Logger<T> {
    fn clone(&self) -> Self {
        Logger {
            time: self.time,
            action: Rc::clone(&self.action),
            buffer: Rc::clone(&self.buffer),
        }
    }
}

impl<T> Logger<T> {
    /// Allocates a new shareable logger bound to a write destination.
    pub fn new(time: Instant, action: LogAction<T>) -> Self {
        Logger {
            time,
            action: Rc::new(action),
            buffer: Rc::new(RefCell::new(Vec::with_capacity(1024))),
        }
    }

    /// Logs an event.
    ///
    /// The event has its timestamp recorded at the moment of logging, but it
    /// may be delayed due to buffering. It is written when the buffer reaches
    /// capacity or on a direct call to `flush`.
    pub fn log(&self, event: T) {
        let mut buffer = self.buffer.borrow_mut();
        buffer.push((self.time.elapsed(), event));
        if buffer.len() == buffer.capacity() {
            // Would call `self.flush()`, but for `RefCell` panic.
            (self.action)(&self.time.elapsed(), &buffer[..]);
            buffer.clear();
        }
    }

    /// Flushes logged messages and communicates the new minimal timestamp.
    pub fn flush(&self) {
        let mut buffer = self.buffer.borrow_mut();
        (self.action)(&self.time.elapsed(), &buffer[..]);
        buffer.clear();
    }
}

/// Events published by the tree communicator.
#[derive(Clone, Debug, PartialEq)]
pub enum CommEvent {
    /// A sample was written into the parent's window.
    SentUp { level: usize, bytes: usize },
    /// A policy was written into a child's window.
    SentDown { level: usize, child: usize, bytes: usize },
    /// A policy send was suppressed by the idempotence cache.
    Suppressed { level: usize, child: usize },
}

/// Events published by the controller loop.
#[derive(Clone, Debug, PartialEq)]
pub enum ControllerEvent {
    /// One full tick completed.
    Tick { count: u64 },
    /// The application requested shutdown.
    Shutdown,
}

/// Events published while draining application profile tables.
#[derive(Clone, Debug, PartialEq)]
pub enum ProfileEvent {
    /// A region exit arrived with no matching entry and was discarded.
    UnmatchedExit { region_id: u64, rank: i32 },
    /// Profile messages drained in one controller update.
    Drained { count: usize },
}
