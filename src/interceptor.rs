//! Per-destination failure containment.
//!
//! A failing destination must never crash or freeze the code that merely
//! tried to log something. Each destination owns an interceptor deciding
//! whether delivery errors are contained (reported to a shared diagnostic
//! stream) or propagated to the original log call, plus a reentrancy guard
//! turning a sink that logs back into its own destination into an error
//! instead of a self-deadlock.

use std::cell::RefCell;
use std::io::{self, Write};
use std::sync::Arc;

use quick_error::quick_error;

use crate::locks::{ForkSafeMutex, LockCategory};
use crate::record::Record;

/// Destination identifier, unique for the lifetime of the process.
pub type HandlerId = usize;

quick_error! {
    /// Everything that can go wrong while delivering one record to one
    /// destination.
    #[derive(Debug)]
    pub enum EmitError {
        /// The layout failed to format the record.
        Format(err: io::Error) {
            display("failed to format record: {}", err)
            source(err)
        }
        /// The output failed to write or stop.
        Write(err: io::Error) {
            display("output failed: {}", err)
            source(err)
        }
        /// A sink emitted a log record through the destination that was
        /// already busy writing it on the same thread.
        Reentrant(id: HandlerId) {
            display(
                "could not acquire the lock of handler #{} because it was already in use \
                 by the current thread (deadlock avoided): the handler is not re-entrant",
                id
            )
        }
        /// An item could not be forwarded across the delivery queue's
        /// channel.
        Transport(err: io::Error) {
            display("failed to forward record across the delivery channel: {}", err)
            source(err)
        }
    }
}

/// Where contained delivery errors are reported.
///
/// Shared by every destination of a dispatcher; writes are serialized by a
/// dedicated registered lock so concurrent failures never interleave their
/// reports. Defaults to standard error, injectable so embedders and tests
/// can capture diagnostics.
#[derive(Clone)]
pub struct DiagnosticStream {
    stream: Arc<ForkSafeMutex<Box<dyn Write + Send>>>,
}

impl DiagnosticStream {
    pub fn new(stream: Box<dyn Write + Send>) -> DiagnosticStream {
        DiagnosticStream {
            stream: Arc::new(ForkSafeMutex::new(LockCategory::Error, stream)),
        }
    }

    pub fn stderr() -> DiagnosticStream {
        DiagnosticStream::new(Box::new(io::stderr()))
    }
}

impl Default for DiagnosticStream {
    fn default() -> DiagnosticStream {
        DiagnosticStream::stderr()
    }
}

/// Contains or propagates delivery errors for one destination.
#[derive(Clone)]
pub struct ErrorInterceptor {
    catch: bool,
    id: HandlerId,
    diagnostics: DiagnosticStream,
}

impl ErrorInterceptor {
    pub fn new(catch: bool, id: HandlerId, diagnostics: DiagnosticStream) -> ErrorInterceptor {
        ErrorInterceptor {
            catch,
            id,
            diagnostics,
        }
    }

    /// Whether errors should be contained rather than propagated.
    pub fn should_catch(&self) -> bool {
        self.catch
    }

    /// Writes a structured diagnostic for a contained error.
    ///
    /// The diagnostic stream being broken or gone is tolerated without
    /// raising: dropping the report is the accepted last line of defense.
    pub fn report(&self, record: Option<&Record>, err: &EmitError) {
        let mut stream = self.diagnostics.stream.lock();

        let _ = writeln!(stream, "--- Delivery error in handler #{} ---", self.id);
        let repr = match record {
            Some(record) => serde_json::to_string(record)
                .unwrap_or_else(|_| r"/!\ unprintable record /!\".to_owned()),
            None => "<none>".to_owned(),
        };
        let _ = writeln!(stream, "Record was: {}", repr);
        let _ = writeln!(stream, "{}", err);
        let _ = writeln!(stream, "--- End of delivery error ---");
        let _ = stream.flush();
    }
}

thread_local! {
    /// Destinations the current thread is emitting through right now.
    static EMITTING: RefCell<Vec<HandlerId>> = RefCell::new(Vec::new());
}

/// Marks the current thread as emitting for one destination.
///
/// Entering twice for the same destination on one thread means a sink's own
/// write looped back into its destination; waiting on the write-lock would
/// deadlock against ourselves, so entry fails fast instead. The marker is
/// cleared when the guard drops, on every exit path.
pub(crate) struct ReentryGuard {
    id: HandlerId,
}

impl ReentryGuard {
    pub(crate) fn enter(id: HandlerId) -> Result<ReentryGuard, EmitError> {
        EMITTING.with(|emitting| {
            let mut emitting = emitting.borrow_mut();
            if emitting.contains(&id) {
                return Err(EmitError::Reentrant(id));
            }
            emitting.push(id);
            Ok(ReentryGuard { id })
        })
    }
}

impl Drop for ReentryGuard {
    fn drop(&mut self) {
        EMITTING.with(|emitting| {
            let mut emitting = emitting.borrow_mut();
            if let Some(pos) = emitting.iter().rposition(|id| *id == self.id) {
                emitting.remove(pos);
            }
        });
    }
}
