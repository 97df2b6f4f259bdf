//! A destination: one output bound to a layout, a level threshold, an
//! optional filter, a write-serialization lock, an error interceptor and
//! optionally a delivery queue.
//!
//! Handles are the entry point for logging events after the dispatcher has
//! taken its registry snapshot. Everything a handle does is serialized by
//! its write-lock, so an output never observes two concurrent writes and is
//! never torn down while a write is in flight.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;

use crate::filter::{Filter, FilterAction};
use crate::interceptor::{EmitError, ErrorInterceptor, HandlerId, ReentryGuard};
use crate::layout::Layout;
use crate::locks::{ForkSafeMutex, LockCategory};
use crate::output::Output;
use crate::queue::{RecordQueue, WireItem};
use crate::record::{Message, Record};

struct State {
    stopped: bool,
}

struct Queued {
    queue: RecordQueue,
    /// Serializes the writer thread's output writes. A separate registered
    /// lock, not the emit lock: producers must never wait on the output.
    queue_lock: ForkSafeMutex<()>,
    /// Process that owns the output and runs the writer thread.
    owner_pid: u32,
    writer: Mutex<Option<JoinHandle<()>>>,
}

pub struct Handle {
    id: HandlerId,
    levelno: i32,
    filter: Option<Box<dyn Filter>>,
    layout: Box<dyn Layout>,
    output: Arc<dyn Output>,
    /// The destination write-lock; also guards the stopped flag.
    state: ForkSafeMutex<State>,
    interceptor: ErrorInterceptor,
    queued: Option<Queued>,
}

impl Handle {
    pub(crate) fn new(
        id: HandlerId,
        output: Arc<dyn Output>,
        layout: Box<dyn Layout>,
        levelno: i32,
        filter: Option<Box<dyn Filter>>,
        enqueue: bool,
        interceptor: ErrorInterceptor,
    ) -> io::Result<Handle> {
        let queued = if enqueue {
            let queue = RecordQueue::new(id, interceptor.clone())?;
            let queue_lock = ForkSafeMutex::new(LockCategory::Handler, ());

            let writer = thread::Builder::new()
                .name(format!("fanlog-writer-{}", id))
                .spawn({
                    let queue = queue.clone();
                    let queue_lock = queue_lock.clone();
                    let output = Arc::clone(&output);
                    let interceptor = interceptor.clone();
                    move || writer_loop(queue, queue_lock, output, interceptor)
                })?;

            Some(Queued {
                queue,
                queue_lock,
                owner_pid: std::process::id(),
                writer: Mutex::new(Some(writer)),
            })
        } else {
            None
        };

        Ok(Handle {
            id,
            levelno,
            filter,
            layout,
            output,
            state: ForkSafeMutex::new(LockCategory::Handler, State { stopped: false }),
            interceptor,
            queued,
        })
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn levelno(&self) -> i32 {
        self.levelno
    }

    /// Delivers one record to this destination.
    ///
    /// Never returns an error while containment is enabled: failures are
    /// reported to the diagnostic stream instead. With containment disabled
    /// the error reaches the original log call.
    pub fn emit(&self, rec: &Arc<Record>) -> Result<(), EmitError> {
        match self.try_emit(rec) {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.interceptor.should_catch() {
                    self.interceptor.report(Some(rec), &err);
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn try_emit(&self, rec: &Arc<Record>) -> Result<(), EmitError> {
        if rec.level().no() < self.levelno {
            return Ok(());
        }

        if let Some(filter) = &self.filter {
            if let FilterAction::Deny = filter.filter(rec) {
                return Ok(());
            }
        }

        let mut formatted = Vec::new();
        self.layout
            .format(rec, &mut formatted)
            .map_err(EmitError::Format)?;
        let text = String::from_utf8(formatted)
            .map_err(|err| EmitError::Format(io::Error::new(io::ErrorKind::InvalidData, err)))?;
        let message = Message::new(text, Arc::clone(rec));

        let _reentry = ReentryGuard::enter(self.id)?;
        let state = self.state.lock();
        if state.stopped {
            return Ok(());
        }
        match &self.queued {
            Some(queued) => {
                queued.queue.put(WireItem::Message(message));
                Ok(())
            }
            None => self.output.write(&message).map_err(EmitError::Write),
        }
    }

    /// Shuts the destination down: no write is in flight once this returns.
    ///
    /// For a queued destination in the owning process, everything already
    /// enqueued anywhere is delivered first; a duplicated process only stops
    /// its local broker, since the output is not its to tear down. Failures
    /// follow the same containment policy as `emit`.
    pub fn stop(&self) -> Result<(), EmitError> {
        match self.try_stop() {
            Ok(()) => Ok(()),
            Err(err) => {
                if self.interceptor.should_catch() {
                    self.interceptor.report(None, &err);
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    fn try_stop(&self) -> Result<(), EmitError> {
        match &self.queued {
            Some(queued) if queued.owner_pid == std::process::id() => {
                // The confirmation lock keeps two processes from trying to
                // stop and complete the queue at the same time.
                let _confirm = queued.queue.confirm_guard();
                let _reentry = ReentryGuard::enter(self.id)?;
                let mut state = self.state.lock();
                state.stopped = true;

                queued.queue.put_final(WireItem::Shutdown);
                if let Some(writer) = queued.writer.lock().take() {
                    let _ = writer.join();
                }
                queued.queue.stop();
                queued.queue.close();

                self.output.stop().map_err(EmitError::Write)
            }
            Some(queued) => {
                let _reentry = ReentryGuard::enter(self.id)?;
                let mut state = self.state.lock();
                state.stopped = true;
                queued.queue.stop();
                Ok(())
            }
            None => {
                let _reentry = ReentryGuard::enter(self.id)?;
                let mut state = self.state.lock();
                state.stopped = true;
                self.output.stop().map_err(EmitError::Write)
            }
        }
    }

    /// Waits until everything enqueued so far has reached the output.
    ///
    /// Works from any process sharing the queue; a no-op for unqueued
    /// destinations and for queues already closed.
    pub fn complete_queue(&self) -> Result<(), EmitError> {
        let Some(queued) = &self.queued else {
            return Ok(());
        };

        let _confirm = queued.queue.confirm_guard();
        if queued.queue.is_closed() {
            return Ok(());
        }
        {
            let _reentry = ReentryGuard::enter(self.id)?;
            let _state = self.state.lock();
            queued.queue.put(WireItem::Confirm);
        }
        queued.queue.wait_confirmation();

        Ok(())
    }

    /// Lets the output settle its own in-flight work, under the same lock
    /// its writes happen under.
    pub fn complete_output(&self) -> Result<(), EmitError> {
        match &self.queued {
            Some(queued) => {
                if queued.owner_pid != std::process::id() {
                    return Ok(());
                }
                let _guard = queued.queue_lock.lock();
                self.output.complete().map_err(EmitError::Write)
            }
            None => {
                let _reentry = ReentryGuard::enter(self.id)?;
                let _guard = self.state.lock();
                self.output.complete().map_err(EmitError::Write)
            }
        }
    }
}

/// Runs in the owning process only: takes items off the channel and writes
/// them to the real output.
fn writer_loop(
    queue: RecordQueue,
    queue_lock: ForkSafeMutex<()>,
    output: Arc<dyn Output>,
    interceptor: ErrorInterceptor,
) {
    loop {
        let item = match queue.get() {
            Ok(item) => item,
            Err(err) => {
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    // Every sender end is gone; nothing further can arrive.
                    break;
                }
                let _guard = queue_lock.lock();
                interceptor.report(None, &EmitError::Transport(err));
                continue;
            }
        };

        match item {
            WireItem::Shutdown => break,
            WireItem::Confirm => queue.signal_confirmation(),
            WireItem::Message(message) => {
                // A registered lock around the write keeps a duplication
                // from catching the output's own internals mid-write.
                let _guard = queue_lock.lock();
                if let Err(err) = output.write(&message) {
                    interceptor.report(Some(message.record()), &EmitError::Write(err));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::interceptor::DiagnosticStream;
    use crate::level::Level;
    use crate::layout::PlainLayout;
    use crate::output::FnOutput;

    fn interceptor(catch: bool, id: HandlerId) -> ErrorInterceptor {
        ErrorInterceptor::new(catch, id, DiagnosticStream::stderr())
    }

    fn record(level: Level, message: &str) -> Arc<Record> {
        Arc::new(Record::builder(level, message).build())
    }

    fn counting_output(counter: Arc<AtomicUsize>) -> Arc<dyn Output> {
        Arc::new(FnOutput::new(move |_: &Message| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }))
    }

    #[test]
    fn level_threshold_suppresses_records() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = Handle::new(
            0,
            counting_output(Arc::clone(&counter)),
            Box::new(PlainLayout),
            Level::WARNING.no(),
            None,
            false,
            interceptor(true, 0),
        )
        .unwrap();

        handle.emit(&record(Level::INFO, "dropped")).unwrap();
        handle.emit(&record(Level::WARNING, "written")).unwrap();
        handle.emit(&record(Level::ERROR, "written")).unwrap();

        assert_eq!(2, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn filter_denies_records() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = Handle::new(
            0,
            counting_output(Arc::clone(&counter)),
            Box::new(PlainLayout),
            0,
            Some(Box::new(|rec: &Record| {
                if rec.message().contains("noise") {
                    FilterAction::Deny
                } else {
                    FilterAction::Neutral
                }
            })),
            false,
            interceptor(true, 0),
        )
        .unwrap();

        handle.emit(&record(Level::INFO, "noise: heartbeat")).unwrap();
        handle.emit(&record(Level::INFO, "payload")).unwrap();

        assert_eq!(1, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn stopped_handle_drops_silently() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = Handle::new(
            0,
            counting_output(Arc::clone(&counter)),
            Box::new(PlainLayout),
            0,
            None,
            false,
            interceptor(true, 0),
        )
        .unwrap();

        handle.stop().unwrap();
        handle.emit(&record(Level::INFO, "late")).unwrap();

        assert_eq!(0, counter.load(Ordering::SeqCst));
    }

    #[test]
    fn containment_swallows_output_failures() {
        let failing: Arc<dyn Output> = Arc::new(FnOutput::new(|_: &Message| {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }));

        let contained = Handle::new(
            1,
            Arc::clone(&failing),
            Box::new(PlainLayout),
            0,
            None,
            false,
            ErrorInterceptor::new(true, 1, DiagnosticStream::new(Box::new(io::sink()))),
        )
        .unwrap();
        assert!(contained.emit(&record(Level::INFO, "x")).is_ok());

        let propagated = Handle::new(
            2,
            failing,
            Box::new(PlainLayout),
            0,
            None,
            false,
            interceptor(false, 2),
        )
        .unwrap();
        assert!(matches!(
            propagated.emit(&record(Level::INFO, "x")),
            Err(EmitError::Write(..))
        ));
    }

    #[test]
    fn queued_handle_delivers_after_complete() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handle = Handle::new(
            0,
            counting_output(Arc::clone(&counter)),
            Box::new(PlainLayout),
            0,
            None,
            true,
            interceptor(true, 0),
        )
        .unwrap();

        for _ in 0..10 {
            handle.emit(&record(Level::INFO, "queued")).unwrap();
        }
        handle.complete_queue().unwrap();

        assert_eq!(10, counter.load(Ordering::SeqCst));

        handle.stop().unwrap();
    }
}
