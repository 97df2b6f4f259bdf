//! Process-wide registry of the runtime's mutexes, used to make process
//! duplication safe.
//!
//! Duplicating a process copies every lock in its current state. A lock held
//! by a thread that does not survive the duplication is never released in
//! the child, which then deadlocks on first use. The coordinator neutralizes
//! this: a pre-duplication hook acquires every registered lock (so none is
//! mid-critical-section at the moment of duplication) and post-duplication
//! hooks release them again in both parent and child.
//!
//! Every registered lock belongs to one of four ordered categories matching
//! the nesting order used by the rest of the crate. The sweep acquires
//! categories in that fixed order, which is what keeps it deadlock-free.

use std::mem;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, MutexGuard};

/// The kinds of locks the runtime creates, in their global acquisition
/// order: a thread holding a lock of one category may only take locks of a
/// strictly later category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockCategory {
    /// Serializes handler table mutation.
    Registry,
    /// A destination's write/stop lock.
    Handler,
    /// A delivery queue's buffer lock.
    Queue,
    /// Serializes diagnostic error reports.
    Error,
}

impl LockCategory {
    pub const ORDER: [LockCategory; 4] = [
        LockCategory::Registry,
        LockCategory::Handler,
        LockCategory::Queue,
        LockCategory::Error,
    ];

    fn index(self) -> usize {
        match self {
            LockCategory::Registry => 0,
            LockCategory::Handler => 1,
            LockCategory::Queue => 2,
            LockCategory::Error => 3,
        }
    }
}

/// What the coordinator needs from a registered lock, independent of the
/// protected value's type.
trait Sweepable: Send + Sync {
    /// Lock, keeping the mutex held after the call returns.
    fn acquire(&self);

    /// Unlock a mutex previously held by `acquire`.
    ///
    /// # Safety
    ///
    /// Must only be called on a mutex whose guard was leaked by `acquire`,
    /// exactly once per such call.
    unsafe fn release(&self);
}

impl<T: Send + 'static> Sweepable for Mutex<T> {
    fn acquire(&self) {
        mem::forget(self.lock());
    }

    unsafe fn release(&self) {
        self.force_unlock();
    }
}

struct Coordinator {
    /// Buckets of live locks per category. The mutex doubles as the global
    /// "no new locks" lock: it is taken by the pre-duplication sweep and not
    /// released until the post-duplication hook runs, so no lock can be
    /// created or registered while a duplication is in flight.
    registry: Mutex<[Vec<Weak<dyn Sweepable>>; 4]>,
    /// The exact set acquired by the last sweep, in acquisition order. Kept
    /// as strong references so a lock cannot disappear between the pre and
    /// post hooks.
    held: Mutex<Option<Vec<(LockCategory, Arc<dyn Sweepable>)>>>,
}

fn coordinator() -> &'static Coordinator {
    static COORDINATOR: OnceLock<Coordinator> = OnceLock::new();

    COORDINATOR.get_or_init(|| Coordinator {
        registry: Mutex::new([Vec::new(), Vec::new(), Vec::new(), Vec::new()]),
        held: Mutex::new(None),
    })
}

/// A mutex registered with the coordinator under a fixed category.
///
/// Behaves like an ordinary mutex; cloning shares the underlying lock. The
/// coordinator keeps only a weak reference, so dropping the last clone
/// retires the lock without any explicit deregistration.
pub struct ForkSafeMutex<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Clone for ForkSafeMutex<T> {
    fn clone(&self) -> ForkSafeMutex<T> {
        ForkSafeMutex {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> ForkSafeMutex<T> {
    pub fn new(category: LockCategory, value: T) -> ForkSafeMutex<T> {
        install_fork_hooks();

        let inner = Arc::new(Mutex::new(value));
        let sweepable: Arc<dyn Sweepable> = inner.clone();
        let weak: Weak<dyn Sweepable> = Arc::downgrade(&sweepable);

        let mut buckets = coordinator().registry.lock();
        let bucket = &mut buckets[category.index()];
        bucket.retain(|lock| lock.strong_count() > 0);
        bucket.push(weak);

        ForkSafeMutex { inner }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }
}

/// Pre-duplication hook: takes the global registration lock, then every live
/// registered lock in category order.
///
/// Public so embedders wiring their own duplication mechanism (or tests) can
/// drive the sweep; on unix it is invoked automatically around `fork`.
pub fn acquire_all() {
    let coordinator = coordinator();
    let buckets = coordinator.registry.lock();

    let mut held = Vec::new();
    for (category, bucket) in LockCategory::ORDER.iter().zip(buckets.iter()) {
        for weak in bucket {
            if let Some(lock) = weak.upgrade() {
                lock.acquire();
                held.push((*category, lock));
            }
        }
    }
    *coordinator.held.lock() = Some(held);

    // The registration lock stays held across the duplication.
    mem::forget(buckets);
}

/// Post-duplication hook, run in both the parent and the freshly duplicated
/// child: releases everything `acquire_all` took, in exact reverse order,
/// then the global registration lock.
///
/// A call without a preceding sweep is a no-op.
pub fn release_all() {
    let coordinator = coordinator();
    let Some(held) = coordinator.held.lock().take() else {
        return;
    };

    for (_, lock) in held.iter().rev() {
        unsafe { lock.release() }
    }
    drop(held);

    unsafe { coordinator.registry.force_unlock() }
}

#[cfg(unix)]
extern "C" fn fork_prepare() {
    acquire_all();
}

#[cfg(unix)]
extern "C" fn fork_resume() {
    release_all();
}

#[cfg(unix)]
fn install_fork_hooks() {
    use std::sync::Once;

    static HOOKS: Once = Once::new();

    HOOKS.call_once(|| unsafe {
        libc::pthread_atfork(Some(fork_prepare), Some(fork_resume), Some(fork_resume));
    });
}

/// Without a duplication notification mechanism the locks degrade to
/// ordinary per-object mutexes: duplicating the process while one is held
/// is then unsafe.
#[cfg(not(unix))]
fn install_fork_hooks() {}
