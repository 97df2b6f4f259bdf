//! The transport under a delivery queue: an ordered byte-frame stream with
//! one writer end and one reader end, plus the synchronization state that
//! must be visible to every process sharing the queue.
//!
//! On unix the stream is a pipe and the shared state lives in an anonymous
//! `MAP_SHARED` mapping holding process-shared pthread primitives, so
//! processes created by duplication keep cooperating with the owner. On
//! other platforms an in-memory fallback with the same interface keeps the
//! queue working within a single process.

#[cfg(unix)]
pub(crate) use self::unix::{FrameChannel, SharedGuard, SharedSync};

#[cfg(not(unix))]
pub(crate) use self::local::{FrameChannel, SharedGuard, SharedSync};

#[cfg(unix)]
mod unix {
    use std::io;
    use std::marker::PhantomData;
    use std::mem;
    use std::ptr;
    use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

    /// One-directional pipe carrying length-prefixed frames.
    ///
    /// Frame boundaries are only guaranteed when every sender serializes its
    /// `send` calls through the queue's shared send lock; the channel itself
    /// does not lock.
    pub(crate) struct FrameChannel {
        reader: AtomicI32,
        writer: AtomicI32,
    }

    impl FrameChannel {
        pub(crate) fn new() -> io::Result<FrameChannel> {
            let mut fds = [0 as libc::c_int; 2];
            if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(FrameChannel {
                reader: AtomicI32::new(fds[0]),
                writer: AtomicI32::new(fds[1]),
            })
        }

        pub(crate) fn send(&self, frame: &[u8]) -> io::Result<()> {
            let fd = self.writer.load(Ordering::Acquire);
            if fd < 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
            }

            let len = (frame.len() as u32).to_le_bytes();
            write_all(fd, &len)?;
            write_all(fd, frame)
        }

        pub(crate) fn recv(&self) -> io::Result<Vec<u8>> {
            let fd = self.reader.load(Ordering::Acquire);
            if fd < 0 {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
            }

            let mut len = [0u8; 4];
            read_exact(fd, &mut len)?;
            let mut frame = vec![0u8; u32::from_le_bytes(len) as usize];
            read_exact(fd, &mut frame)?;

            Ok(frame)
        }

        /// Closes this process's ends of the pipe. Must not be called while
        /// a `recv` is still in flight.
        pub(crate) fn close(&self) {
            for fd in [&self.reader, &self.writer] {
                let fd = fd.swap(-1, Ordering::AcqRel);
                if fd >= 0 {
                    unsafe { libc::close(fd) };
                }
            }
        }
    }

    impl Drop for FrameChannel {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn write_all(fd: libc::c_int, buf: &[u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let written = unsafe {
                libc::write(
                    fd,
                    buf[done..].as_ptr() as *const libc::c_void,
                    buf.len() - done,
                )
            };
            if written < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            done += written as usize;
        }

        Ok(())
    }

    fn read_exact(fd: libc::c_int, buf: &mut [u8]) -> io::Result<()> {
        let mut done = 0;
        while done < buf.len() {
            let read = unsafe {
                libc::read(
                    fd,
                    buf[done..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - done,
                )
            };
            if read < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel writer ends are gone",
                ));
            }
            done += read as usize;
        }

        Ok(())
    }

    /// The synchronization state shared by every process using one queue.
    ///
    /// Lives in shared memory rather than ordinary (copy-on-write) memory:
    /// after a duplication the parent's broker and the child's broker must
    /// contend on the *same* send lock, observe the same closed flag and
    /// wake on the same confirmation event.
    #[repr(C)]
    struct SharedRegion {
        send_lock: libc::pthread_mutex_t,
        confirm_lock: libc::pthread_mutex_t,
        event_mutex: libc::pthread_mutex_t,
        event_cond: libc::pthread_cond_t,
        event_flag: AtomicU32,
        closed: AtomicU32,
    }

    pub(crate) struct SharedSync {
        region: *mut SharedRegion,
    }

    unsafe impl Send for SharedSync {}
    unsafe impl Sync for SharedSync {}

    pub(crate) struct SharedGuard<'a> {
        mutex: *mut libc::pthread_mutex_t,
        _owner: PhantomData<&'a SharedSync>,
    }

    impl Drop for SharedGuard<'_> {
        fn drop(&mut self) {
            unsafe { libc::pthread_mutex_unlock(self.mutex) };
        }
    }

    impl SharedSync {
        pub(crate) fn new() -> io::Result<SharedSync> {
            unsafe {
                let region = libc::mmap(
                    ptr::null_mut(),
                    mem::size_of::<SharedRegion>(),
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                );
                if region == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                let region = region as *mut SharedRegion;

                let mut mutex_attr: libc::pthread_mutexattr_t = mem::zeroed();
                libc::pthread_mutexattr_init(&mut mutex_attr);
                libc::pthread_mutexattr_setpshared(&mut mutex_attr, libc::PTHREAD_PROCESS_SHARED);
                libc::pthread_mutex_init(ptr::addr_of_mut!((*region).send_lock), &mutex_attr);
                libc::pthread_mutex_init(ptr::addr_of_mut!((*region).confirm_lock), &mutex_attr);
                libc::pthread_mutex_init(ptr::addr_of_mut!((*region).event_mutex), &mutex_attr);
                libc::pthread_mutexattr_destroy(&mut mutex_attr);

                let mut cond_attr: libc::pthread_condattr_t = mem::zeroed();
                libc::pthread_condattr_init(&mut cond_attr);
                libc::pthread_condattr_setpshared(&mut cond_attr, libc::PTHREAD_PROCESS_SHARED);
                libc::pthread_cond_init(ptr::addr_of_mut!((*region).event_cond), &cond_attr);
                libc::pthread_condattr_destroy(&mut cond_attr);

                (*region).event_flag.store(0, Ordering::Release);
                (*region).closed.store(0, Ordering::Release);

                Ok(SharedSync { region })
            }
        }

        fn guard(&self, mutex: *mut libc::pthread_mutex_t) -> SharedGuard<'_> {
            unsafe { libc::pthread_mutex_lock(mutex) };
            SharedGuard {
                mutex,
                _owner: PhantomData,
            }
        }

        /// Serializes frame sends across every producer process.
        pub(crate) fn send_guard(&self) -> SharedGuard<'_> {
            self.guard(unsafe { ptr::addr_of_mut!((*self.region).send_lock) })
        }

        /// Serializes shutdown and flush handshakes across processes.
        pub(crate) fn confirm_guard(&self) -> SharedGuard<'_> {
            self.guard(unsafe { ptr::addr_of_mut!((*self.region).confirm_lock) })
        }

        pub(crate) fn is_closed(&self) -> bool {
            unsafe { (*self.region).closed.load(Ordering::Acquire) != 0 }
        }

        pub(crate) fn set_closed(&self) {
            unsafe { (*self.region).closed.store(1, Ordering::Release) }
        }

        pub(crate) fn signal_confirmation(&self) {
            unsafe {
                let _guard = self.guard(ptr::addr_of_mut!((*self.region).event_mutex));
                (*self.region).event_flag.store(1, Ordering::Release);
                libc::pthread_cond_broadcast(ptr::addr_of_mut!((*self.region).event_cond));
            }
        }

        /// Blocks until the confirmation event fires, then resets it.
        pub(crate) fn wait_confirmation(&self) {
            unsafe {
                let guard = self.guard(ptr::addr_of_mut!((*self.region).event_mutex));
                while (*self.region).event_flag.load(Ordering::Acquire) == 0 {
                    libc::pthread_cond_wait(
                        ptr::addr_of_mut!((*self.region).event_cond),
                        guard.mutex,
                    );
                }
                (*self.region).event_flag.store(0, Ordering::Release);
            }
        }
    }

    impl Drop for SharedSync {
        fn drop(&mut self) {
            // Unmapping is enough: the region lives on while any process
            // (e.g. a duplicated child) still maps it, and destroying
            // process-shared primitives that another process may hold would
            // be worse than leaking them.
            unsafe {
                libc::munmap(
                    self.region as *mut libc::c_void,
                    mem::size_of::<SharedRegion>(),
                );
            }
        }
    }
}

/// Single-process stand-in: same interface, ordinary process-local
/// synchronization. Queue delivery does not cross process boundaries here.
#[cfg(not(unix))]
mod local {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};

    use parking_lot::{Condvar, Mutex, MutexGuard};

    pub(crate) struct FrameChannel {
        frames: Mutex<Option<VecDeque<Vec<u8>>>>,
        available: Condvar,
    }

    impl FrameChannel {
        pub(crate) fn new() -> io::Result<FrameChannel> {
            Ok(FrameChannel {
                frames: Mutex::new(Some(VecDeque::new())),
                available: Condvar::new(),
            })
        }

        pub(crate) fn send(&self, frame: &[u8]) -> io::Result<()> {
            match self.frames.lock().as_mut() {
                Some(frames) => {
                    frames.push_back(frame.to_vec());
                    self.available.notify_one();
                    Ok(())
                }
                None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")),
            }
        }

        pub(crate) fn recv(&self) -> io::Result<Vec<u8>> {
            let mut frames = self.frames.lock();
            loop {
                match frames.as_mut() {
                    Some(queue) => match queue.pop_front() {
                        Some(frame) => return Ok(frame),
                        None => self.available.wait(&mut frames),
                    },
                    None => {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "channel writer ends are gone",
                        ))
                    }
                }
            }
        }

        pub(crate) fn close(&self) {
            *self.frames.lock() = None;
            self.available.notify_all();
        }
    }

    pub(crate) type SharedGuard<'a> = MutexGuard<'a, ()>;

    pub(crate) struct SharedSync {
        send_lock: Mutex<()>,
        confirm_lock: Mutex<()>,
        event_mutex: Mutex<()>,
        event_cond: Condvar,
        event_flag: AtomicBool,
        closed: AtomicBool,
    }

    impl SharedSync {
        pub(crate) fn new() -> io::Result<SharedSync> {
            Ok(SharedSync {
                send_lock: Mutex::new(()),
                confirm_lock: Mutex::new(()),
                event_mutex: Mutex::new(()),
                event_cond: Condvar::new(),
                event_flag: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            })
        }

        pub(crate) fn send_guard(&self) -> SharedGuard<'_> {
            self.send_lock.lock()
        }

        pub(crate) fn confirm_guard(&self) -> SharedGuard<'_> {
            self.confirm_lock.lock()
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }

        pub(crate) fn set_closed(&self) {
            self.closed.store(true, Ordering::Release)
        }

        pub(crate) fn signal_confirmation(&self) {
            let _guard = self.event_mutex.lock();
            self.event_flag.store(true, Ordering::Release);
            self.event_cond.notify_all();
        }

        pub(crate) fn wait_confirmation(&self) {
            let mut guard = self.event_mutex.lock();
            while !self.event_flag.load(Ordering::Acquire) {
                self.event_cond.wait(&mut guard);
            }
            self.event_flag.store(false, Ordering::Release);
        }
    }
}
