//! The dispatcher: builds records, takes a registry snapshot and fans each
//! record out to every matching destination.

use std::io;
use std::sync::Arc;

use crate::filter::Filter;
use crate::handle::Handle;
use crate::interceptor::{DiagnosticStream, EmitError, ErrorInterceptor, HandlerId};
use crate::layout::{Layout, LineLayout};
use crate::level::Level;
use crate::output::Output;
use crate::record::Record;
use crate::registry::{HandlerTable, ShutdownErrors, Snapshot};

/// The logging facade.
///
/// Cheap to clone; clones share the destination table. Records are
/// dispatched against the snapshot current at the moment of the call:
/// destinations added afterwards never see the record, destinations removed
/// afterwards still receive it.
#[derive(Clone)]
pub struct Logger {
    table: Arc<HandlerTable>,
    diagnostics: DiagnosticStream,
}

impl Logger {
    pub fn new() -> Logger {
        Logger::with_diagnostics(DiagnosticStream::stderr())
    }

    /// A logger whose destinations report contained delivery errors to the
    /// given stream instead of standard error.
    pub fn with_diagnostics(diagnostics: DiagnosticStream) -> Logger {
        Logger {
            table: Arc::new(HandlerTable::new()),
            diagnostics,
        }
    }

    /// Starts configuring a new destination for `output`.
    pub fn handler<O: Output + 'static>(&self, output: O) -> HandlerBuilder<'_> {
        HandlerBuilder {
            logger: self,
            output: Arc::new(output),
            layout: Box::new(LineLayout),
            levelno: Level::DEBUG.no(),
            filter: None,
            enqueue: false,
            catch: true,
        }
    }

    /// Registers `output` with the default configuration.
    pub fn add<O: Output + 'static>(&self, output: O) -> io::Result<HandlerId> {
        self.handler(output).add()
    }

    /// Unregisters a destination, draining its queue and stopping its
    /// output. Returns how many destinations were removed (0 or 1); an
    /// unknown id is not an error. Potentially slow, always terminating.
    pub fn remove(&self, id: HandlerId) -> Result<usize, EmitError> {
        self.table.remove(id)
    }

    /// Unregisters every destination, attempting all of them even when some
    /// fail to shut down.
    pub fn remove_all(&self) -> Result<usize, ShutdownErrors> {
        self.table.remove_all()
    }

    /// Dispatches one record to every destination of the current snapshot.
    ///
    /// Only destinations with containment disabled can make this return an
    /// error; everything else is reported to the diagnostic stream.
    pub fn dispatch(&self, record: Record) -> Result<(), EmitError> {
        let record = Arc::new(record);
        let snapshot = self.snapshot();
        for handle in snapshot.iter() {
            handle.emit(&record)?;
        }

        Ok(())
    }

    /// Waits until every record enqueued so far has reached its output and
    /// every output has settled its own in-flight work, without removing
    /// any destination.
    pub fn complete(&self) -> Result<(), EmitError> {
        let snapshot = self.snapshot();
        for handle in snapshot.iter() {
            handle.complete_queue()?;
        }
        for handle in snapshot.iter() {
            handle.complete_output()?;
        }

        Ok(())
    }

    /// Routes records of the standard logging facade through this logger.
    pub fn install(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(log::LevelFilter::Trace);
        log::set_boxed_logger(Box::new(self))
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.table.snapshot()
    }
}

impl Default for Logger {
    fn default() -> Logger {
        Logger::new()
    }
}

impl log::Log for Logger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        // Level thresholds are per-destination; there is no global cutoff.
        true
    }

    fn log(&self, record: &log::Record) {
        let rec = Record::builder(Level::from(record.level()), record.args().to_string())
            .module(record.module_path().unwrap_or_else(|| record.target()))
            .file(record.file().unwrap_or(""))
            .line(record.line().unwrap_or(0))
            .build();

        // The facade offers no error channel; contained failures were
        // already reported, propagated ones can only be dropped here.
        let _ = self.dispatch(rec);
    }

    fn flush(&self) {
        let _ = self.complete();
    }
}

/// Configures one destination before it is registered.
pub struct HandlerBuilder<'a> {
    logger: &'a Logger,
    output: Arc<dyn Output>,
    layout: Box<dyn Layout>,
    levelno: i32,
    filter: Option<Box<dyn Filter>>,
    enqueue: bool,
    catch: bool,
}

impl<'a> HandlerBuilder<'a> {
    pub fn layout<L: Layout + 'static>(mut self, layout: L) -> HandlerBuilder<'a> {
        self.layout = Box::new(layout);
        self
    }

    /// Minimum level this destination accepts. Defaults to DEBUG.
    pub fn level(mut self, level: Level) -> HandlerBuilder<'a> {
        self.levelno = level.no();
        self
    }

    pub fn filter<F: Filter + 'static>(mut self, filter: F) -> HandlerBuilder<'a> {
        self.filter = Some(Box::new(filter));
        self
    }

    /// Decouples producers from the output through a delivery queue owned
    /// by the current process. Also required for records emitted from
    /// processes duplicated later to reach this output.
    pub fn enqueue(mut self, enqueue: bool) -> HandlerBuilder<'a> {
        self.enqueue = enqueue;
        self
    }

    /// Whether delivery errors are contained (reported to the diagnostic
    /// stream) or propagated to the log call. Defaults to contained.
    pub fn catch(mut self, catch: bool) -> HandlerBuilder<'a> {
        self.catch = catch;
        self
    }

    /// Registers the destination and returns its id.
    pub fn add(self) -> io::Result<HandlerId> {
        let HandlerBuilder {
            logger,
            output,
            layout,
            levelno,
            filter,
            enqueue,
            catch,
        } = self;

        logger.table.add(move |id| {
            Handle::new(
                id,
                output,
                layout,
                levelno,
                filter,
                enqueue,
                ErrorInterceptor::new(catch, id, logger.diagnostics.clone()),
            )
        })
    }
}

/// Logs a message through a `Logger`.
///
/// Captures the module path, file and line of the call site. Formatting
/// arguments may be passed positionally or in brackets; additional context
/// pairs are attached from a trailing brace block. Yields the dispatch
/// result: it is `Err` only when a destination with containment disabled
/// failed to deliver.
///
/// ```
/// use fanlog::{log, Level, Logger};
///
/// let log = Logger::new();
///
/// log!(log, Level::INFO, "file does not exist: {}", "/var/www/favicon.ico").unwrap();
/// log!(log, Level::WARNING, "client stopped connection before send body completed", {
///     host: "::1",
///     port: 10053,
/// }).unwrap();
/// ```
#[macro_export]
macro_rules! log (
    ($log:ident, $lvl:expr, $fmt:expr, [$($args:tt)*], {$($name:ident: $val:expr,)*}) => {{
        $log.dispatch(
            $crate::Record::builder($lvl, format!($fmt, $($args)*))
                .module(module_path!())
                .file(file!())
                .line(line!())
                $(.context(stringify!($name), $crate::__serde_json::Value::from($val)))*
                .build()
        )
    }};
    ($log:ident, $lvl:expr, $fmt:expr, {$($name:ident: $val:expr,)*}) => {{
        $crate::log!($log, $lvl, $fmt, [], {$($name: $val,)*})
    }};
    ($log:ident, $lvl:expr, $fmt:expr, [$($args:tt)*]) => {{
        $crate::log!($log, $lvl, $fmt, [$($args)*], {})
    }};
    ($log:ident, $lvl:expr, $fmt:expr, $($args:tt)*) => {{
        $crate::log!($log, $lvl, $fmt, [$($args)*], {})
    }};
    ($log:ident, $lvl:expr, $fmt:expr) => {{
        $crate::log!($log, $lvl, $fmt, [], {})
    }};
);
