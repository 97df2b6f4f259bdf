//! The delivery queue decoupling producers from a slow or remote output.
//!
//! Producers append to a small in-memory buffer and return immediately; one
//! broker thread per process drains the buffer and forwards each item across
//! a one-directional channel to the single process that owns the real
//! output. A process created by duplication inherits the queue but not the
//! broker thread, so the broker is restarted lazily on the first `put` made
//! there.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Condvar;
use serde::{Deserialize, Serialize};

use crate::interceptor::{EmitError, ErrorInterceptor, HandlerId};
use crate::locks::{ForkSafeMutex, LockCategory};
use crate::record::Message;

mod channel;

use self::channel::{FrameChannel, SharedGuard, SharedSync};

/// What actually crosses the channel to the owning process.
#[derive(Debug, Serialize, Deserialize)]
pub enum WireItem {
    /// A formatted record ready for delivery.
    Message(Message),
    /// Asks the owner's writer to acknowledge that everything enqueued
    /// before this token has been delivered.
    Confirm,
    /// Tells the owner's writer to exit.
    Shutdown,
}

/// One element of the local buffer: a payload, or a broker control token.
/// The control tokens never cross the channel.
enum QueueItem {
    Wire(WireItem),
    /// The payload following this token is the last one the queue will ever
    /// forward.
    Close,
    /// The broker should exit its loop.
    Stop,
}

struct Buffer {
    items: VecDeque<QueueItem>,
    /// Wakes the broker on a freshly non-empty buffer. Replaced whenever the
    /// broker is restarted: a duplicated process inherits the waiter
    /// bookkeeping of threads it does not have.
    condvar: Arc<Condvar>,
    broker: Option<JoinHandle<()>>,
    /// Process the current broker belongs to; a mismatch means this process
    /// was duplicated and needs a broker of its own.
    broker_pid: u32,
}

struct Inner {
    buffer: ForkSafeMutex<Buffer>,
    channel: FrameChannel,
    shared: SharedSync,
    interceptor: ErrorInterceptor,
    id: HandlerId,
}

/// A multiprocess-safe queue in charge of transferring records between
/// processes.
///
/// The design is closely coupled to its use by `Handle`: concurrent `put`
/// calls are expected to be serialized by the handler's lock, `get` is
/// called by exactly one thread in the owning process.
#[derive(Clone)]
pub struct RecordQueue {
    inner: Arc<Inner>,
}

impl RecordQueue {
    pub fn new(id: HandlerId, interceptor: ErrorInterceptor) -> io::Result<RecordQueue> {
        Ok(RecordQueue {
            inner: Arc::new(Inner {
                buffer: ForkSafeMutex::new(
                    LockCategory::Queue,
                    Buffer {
                        items: VecDeque::new(),
                        condvar: Arc::new(Condvar::new()),
                        broker: None,
                        broker_pid: std::process::id(),
                    },
                ),
                channel: FrameChannel::new()?,
                shared: SharedSync::new()?,
                interceptor,
                id,
            }),
        })
    }

    /// Appends an item and returns immediately.
    ///
    /// Once the queue is closed this is a silent no-op: the consumer is
    /// guaranteed to never read anything after the designated final item,
    /// so buffering more would only leak.
    pub fn put(&self, item: WireItem) {
        if self.is_closed() {
            return;
        }

        let mut buffer = self.inner.buffer.lock();
        self.ensure_broker(&mut buffer);
        buffer.items.push_back(QueueItem::Wire(item));
        buffer.condvar.notify_one();
    }

    /// Appends one last item and disables the queue for further use.
    ///
    /// The close token and the item are appended under a single lock
    /// acquisition, so they appear consecutively in the stream even when
    /// other producers are racing `put`.
    pub fn put_final(&self, item: WireItem) {
        if self.is_closed() {
            return;
        }

        let mut buffer = self.inner.buffer.lock();
        self.ensure_broker(&mut buffer);
        buffer.items.push_back(QueueItem::Close);
        buffer.items.push_back(QueueItem::Wire(item));
        buffer.condvar.notify_one();
    }

    /// Gets the next pending item (blocks until one is available).
    ///
    /// Called by exactly one consumer thread, in the process owning the
    /// output.
    pub fn get(&self) -> io::Result<WireItem> {
        let frame = self.inner.channel.recv()?;
        serde_json::from_slice(&frame).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Stops this process's broker and waits for it to exit. Idempotent.
    pub fn stop(&self) {
        let broker = {
            let mut buffer = self.inner.buffer.lock();
            if buffer.broker_pid != std::process::id() {
                // The broker belongs to the process we were duplicated
                // from; there is nothing to stop here.
                buffer.broker = None;
                buffer.items.clear();
                return;
            }
            match buffer.broker.take() {
                Some(broker) if !broker.is_finished() => {
                    buffer.items.push_back(QueueItem::Stop);
                    buffer.condvar.notify_one();
                    Some(broker)
                }
                other => other,
            }
        };

        if let Some(broker) = broker {
            let _ = broker.join();
        }
    }

    /// Releases the queue's resources.
    ///
    /// Must only be called once the queue is out of use: after `stop`, with
    /// no `put` or `get` running or arriving later.
    pub fn close(&self) {
        self.inner.buffer.lock().items.clear();
        self.inner.channel.close();
    }

    /// Whether the final item has been forwarded, possibly by another
    /// process.
    pub fn is_closed(&self) -> bool {
        self.inner.shared.is_closed()
    }

    /// Serializes shutdown/flush handshakes across every process sharing
    /// the queue.
    pub(crate) fn confirm_guard(&self) -> SharedGuard<'_> {
        self.inner.shared.confirm_guard()
    }

    pub(crate) fn signal_confirmation(&self) {
        self.inner.shared.signal_confirmation()
    }

    pub(crate) fn wait_confirmation(&self) {
        self.inner.shared.wait_confirmation()
    }

    /// Starts the broker for the current process unless it is already
    /// running. Items and waiter state copied in by a process duplication
    /// belong to the parent and are discarded.
    fn ensure_broker(&self, buffer: &mut Buffer) {
        let pid = std::process::id();
        let alive = buffer.broker_pid == pid
            && buffer
                .broker
                .as_ref()
                .map_or(false, |broker| !broker.is_finished());
        if alive {
            return;
        }

        if buffer.broker_pid != pid {
            buffer.items.clear();
            buffer.condvar = Arc::new(Condvar::new());
            buffer.broker = None;
            buffer.broker_pid = pid;
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("fanlog-broker-{}", self.inner.id))
            .spawn(move || broker_loop(&inner));
        match spawned {
            Ok(broker) => buffer.broker = Some(broker),
            Err(err) => {
                self.inner
                    .interceptor
                    .report(None, &EmitError::Transport(err));
            }
        }
    }
}

fn broker_loop(inner: &Inner) {
    let mut is_final = false;

    loop {
        let item = {
            let mut buffer = inner.buffer.lock();
            loop {
                if let Some(item) = buffer.items.pop_front() {
                    break item;
                }
                let condvar = Arc::clone(&buffer.condvar);
                condvar.wait(&mut buffer);
            }
        };

        match item {
            QueueItem::Close => is_final = true,
            QueueItem::Stop => break,
            QueueItem::Wire(wire) => {
                let _guard = inner.shared.send_guard();
                if inner.shared.is_closed() {
                    continue;
                }

                let sent = serde_json::to_vec(&wire)
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
                    .and_then(|frame| inner.channel.send(&frame));
                match sent {
                    Ok(()) => {
                        // The closed flag must flip atomically with the
                        // final send; both happen under the send lock.
                        if is_final {
                            inner.shared.set_closed();
                        }
                    }
                    Err(err) => {
                        let record = match &wire {
                            WireItem::Message(message) => Some(message.record()),
                            _ => None,
                        };
                        inner.interceptor.report(record, &EmitError::Transport(err));
                    }
                }
            }
        }
    }
}
