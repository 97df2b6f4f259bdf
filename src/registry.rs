//! The destination registry: an immutable snapshot vector swapped behind an
//! atomic pointer.
//!
//! Readers iterate whatever snapshot they loaded without taking any lock;
//! writers build the next snapshot under a short-lived mutation mutex that
//! is never held during record dispatch. A dispatch loop that took its
//! snapshot before a mutation keeps seeing exactly the destinations of that
//! snapshot - destinations added later never see the record, destinations
//! removed later still receive it.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::handle::Handle;
use crate::interceptor::{EmitError, HandlerId};
use crate::locks::{ForkSafeMutex, LockCategory};

/// An immutable, id-ordered view of the registered destinations, valid at
/// one point in registry history.
pub type Snapshot = Vec<Arc<Handle>>;

/// Raised by `remove_all` when one or more destinations failed to shut
/// down. Every destination was still attempted and removed from the table.
#[derive(Debug)]
pub struct ShutdownErrors {
    removed: usize,
    errors: Vec<(HandlerId, EmitError)>,
}

impl ShutdownErrors {
    /// How many destinations were removed, including the failed ones.
    pub fn removed(&self) -> usize {
        self.removed
    }

    pub fn errors(&self) -> &[(HandlerId, EmitError)] {
        &self.errors
    }
}

impl fmt::Display for ShutdownErrors {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "{} of {} handlers failed to shut down",
            self.errors.len(),
            self.removed
        )?;
        for (id, err) in &self.errors {
            write!(fmt, "; handler #{}: {}", id, err)?;
        }

        Ok(())
    }
}

impl std::error::Error for ShutdownErrors {}

pub struct HandlerTable {
    snapshot: ArcSwap<Snapshot>,
    /// Serializes snapshot replacement only; dispatch never takes it.
    mutation: ForkSafeMutex<()>,
    /// Next destination id; ids are unique for the process lifetime.
    counter: AtomicUsize,
}

impl HandlerTable {
    pub fn new() -> HandlerTable {
        HandlerTable {
            snapshot: ArcSwap::from_pointee(Snapshot::new()),
            mutation: ForkSafeMutex::new(LockCategory::Registry, ()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Registers the destination produced by `build`, which receives the
    /// freshly allocated id.
    pub fn add<F>(&self, build: F) -> io::Result<HandlerId>
    where
        F: FnOnce(HandlerId) -> io::Result<Handle>,
    {
        let _guard = self.mutation.lock();
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(build(id)?);

        let mut next = (**self.snapshot.load()).clone();
        next.push(handle);
        self.snapshot.store(Arc::new(next));

        Ok(id)
    }

    /// Unregisters and shuts down one destination.
    ///
    /// Returns how many destinations were removed (0 or 1); an unknown id
    /// is not an error. The shutdown itself runs outside the mutation lock:
    /// it may block on an in-flight write or a draining queue, and dispatch
    /// must not wait on that.
    pub fn remove(&self, id: HandlerId) -> Result<usize, EmitError> {
        let removed = {
            let _guard = self.mutation.lock();
            let current = self.snapshot.load_full();

            let mut removed = None;
            let mut next = Snapshot::with_capacity(current.len());
            for handle in current.iter() {
                if handle.id() == id {
                    removed = Some(Arc::clone(handle));
                } else {
                    next.push(Arc::clone(handle));
                }
            }
            if removed.is_some() {
                self.snapshot.store(Arc::new(next));
            }
            removed
        };

        match removed {
            Some(handle) => {
                handle.stop()?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    /// Unregisters and shuts down every destination, in id order.
    ///
    /// A failing shutdown does not abandon the rest: every destination is
    /// attempted and the failures are raised together afterwards.
    pub fn remove_all(&self) -> Result<usize, ShutdownErrors> {
        let removed = {
            let _guard = self.mutation.lock();
            let current = self.snapshot.load_full();
            self.snapshot.store(Arc::new(Snapshot::new()));
            current
        };

        let mut errors = Vec::new();
        for handle in removed.iter() {
            if let Err(err) = handle.stop() {
                errors.push((handle.id(), err));
            }
        }

        if errors.is_empty() {
            Ok(removed.len())
        } else {
            Err(ShutdownErrors {
                removed: removed.len(),
                errors,
            })
        }
    }

    /// The current snapshot: a single atomic pointer read.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }
}

impl Default for HandlerTable {
    fn default() -> HandlerTable {
        HandlerTable::new()
    }
}

impl Drop for HandlerTable {
    fn drop(&mut self) {
        // Destinations still registered get a best-effort clean shutdown so
        // queued records are not lost with the table.
        let _ = self.remove_all();
    }
}
