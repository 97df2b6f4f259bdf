use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use fanlog::layout::PlainLayout;
use fanlog::output::{FnOutput, Term};
use fanlog::{log, DiagnosticStream, EmitError, Level, Logger, Message, Output, Record};

/// Captures everything written to it, byte by byte, with an artificial
/// delay in the middle of every message so interleaved writes would be
/// caught red-handed.
struct SlowOutput {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Output for SlowOutput {
    fn write(&self, message: &Message) -> io::Result<()> {
        for byte in message.text().bytes() {
            self.buf.lock().unwrap().push(byte);
            thread::sleep(Duration::from_millis(1));
        }

        Ok(())
    }
}

/// Captures whole messages.
#[derive(Clone, Default)]
struct Captured {
    buf: Arc<Mutex<String>>,
}

impl Captured {
    fn contents(&self) -> String {
        self.buf.lock().unwrap().clone()
    }

    fn output(&self) -> impl Output {
        let buf = Arc::clone(&self.buf);
        FnOutput::new(move |message: &Message| {
            buf.lock().unwrap().push_str(message.text());
            Ok(())
        })
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap()
            .push_str(&String::from_utf8_lossy(buf));
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Blocks every write until the gate is opened.
struct GatedOutput {
    gate: Arc<(Mutex<bool>, Condvar)>,
    buf: Arc<Mutex<String>>,
}

impl GatedOutput {
    fn new() -> (GatedOutput, Arc<(Mutex<bool>, Condvar)>, Arc<Mutex<String>>) {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let buf = Arc::new(Mutex::new(String::new()));
        let output = GatedOutput {
            gate: Arc::clone(&gate),
            buf: Arc::clone(&buf),
        };

        (output, gate, buf)
    }

    fn open(gate: &(Mutex<bool>, Condvar)) {
        *gate.0.lock().unwrap() = true;
        gate.1.notify_all();
    }
}

impl Output for GatedOutput {
    fn write(&self, message: &Message) -> io::Result<()> {
        let (open, opened) = &*self.gate;
        let mut open = open.lock().unwrap();
        while !*open {
            open = opened.wait(open).unwrap();
        }
        drop(open);

        self.buf.lock().unwrap().push_str(message.text());
        Ok(())
    }
}

#[test]
fn concurrent_writes_are_never_interleaved() {
    let buf = Arc::new(Mutex::new(Vec::new()));
    let log = Logger::new();
    log.handler(SlowOutput {
        buf: Arc::clone(&buf),
    })
    .layout(PlainLayout)
    .add()
    .unwrap();

    let first = {
        let log = log.clone();
        thread::spawn(move || log!(log, Level::INFO, "___0___").unwrap())
    };
    let second = {
        let log = log.clone();
        thread::spawn(move || log!(log, Level::INFO, "___1___").unwrap())
    };
    first.join().unwrap();
    second.join().unwrap();

    let content = String::from_utf8(buf.lock().unwrap().clone()).unwrap();
    assert!(
        content == "___0___\n___1___\n" || content == "___1___\n___0___\n",
        "messages were interleaved: {:?}",
        content
    );
}

#[test]
fn dispatch_is_snapshot_consistent_under_removal() {
    let captured = Captured::default();
    let log = Logger::new();
    let id = log
        .handler(captured.output())
        .layout(PlainLayout)
        .add()
        .unwrap();

    log!(log, Level::INFO, "1").unwrap();
    assert_eq!(1, log.remove(id).unwrap());
    log!(log, Level::INFO, "2").unwrap();

    assert_eq!("1\n", captured.contents());
}

#[test]
fn queued_destination_is_fifo_and_flushes_on_complete() {
    let (output, gate, buf) = GatedOutput::new();
    let log = Logger::new();
    log.handler(output)
        .layout(PlainLayout)
        .enqueue(true)
        .add()
        .unwrap();

    for i in 0..10 {
        log!(log, Level::INFO, "{}", i).unwrap();
    }

    // Delivery is decoupled from the producer: with the output still gated,
    // nothing has arrived.
    assert_eq!("", buf.lock().unwrap().clone());

    GatedOutput::open(&gate);
    log.complete().unwrap();

    assert_eq!(
        "0\n1\n2\n3\n4\n5\n6\n7\n8\n9\n",
        buf.lock().unwrap().clone()
    );
}

#[test]
fn removed_queued_destination_drains_before_stop() {
    let captured = Captured::default();
    let log = Logger::new();
    let id = log
        .handler(captured.output())
        .layout(PlainLayout)
        .enqueue(true)
        .add()
        .unwrap();

    for i in 0..5 {
        log!(log, Level::INFO, "{}", i).unwrap();
    }
    assert_eq!(1, log.remove(id).unwrap());

    // Removal blocks until the queue is drained: everything enqueued before
    // it made it through, nothing after it can.
    assert_eq!("0\n1\n2\n3\n4\n", captured.contents());
    log!(log, Level::INFO, "too late").unwrap();
    assert_eq!("0\n1\n2\n3\n4\n", captured.contents());
}

/// An output whose write loops back into the logger that owns it.
struct ReentrantOutput {
    log: Mutex<Option<Logger>>,
    hits: Arc<AtomicUsize>,
}

impl Output for ReentrantOutput {
    fn write(&self, _message: &Message) -> io::Result<()> {
        self.hits.fetch_add(1, Ordering::SeqCst);

        if let Some(log) = self.log.lock().unwrap().as_ref() {
            let nested = log.dispatch(Record::builder(Level::INFO, "nested").build());
            if let Err(err) = nested {
                return Err(io::Error::new(io::ErrorKind::Other, err.to_string()));
            }
        }

        Ok(())
    }
}

#[test]
fn reentrant_sink_terminates_with_a_contained_error() {
    let diagnostics = Captured::default();
    let hits = Arc::new(AtomicUsize::new(0));

    let log = Logger::with_diagnostics(DiagnosticStream::new(Box::new(diagnostics.clone())));
    let slot = Arc::new(ReentrantOutput {
        log: Mutex::new(None),
        hits: Arc::clone(&hits),
    });
    log.handler(ArcOutput(slot.clone() as Arc<dyn Output>))
        .layout(PlainLayout)
        .add()
        .unwrap();
    *slot.log.lock().unwrap() = Some(log.clone());

    // Terminates instead of deadlocking; the inner failure is contained.
    log!(log, Level::INFO, "outer").unwrap();

    assert_eq!(1, hits.load(Ordering::SeqCst));
    assert!(diagnostics.contents().contains("not re-entrant"));
}

#[test]
fn reentrant_sink_propagates_when_containment_is_disabled() {
    let hits = Arc::new(AtomicUsize::new(0));

    let log = Logger::new();
    let slot = Arc::new(ReentrantOutput {
        log: Mutex::new(None),
        hits: Arc::clone(&hits),
    });
    log.handler(ArcOutput(slot.clone() as Arc<dyn Output>))
        .layout(PlainLayout)
        .catch(false)
        .add()
        .unwrap();
    *slot.log.lock().unwrap() = Some(log.clone());

    let err = log
        .dispatch(Record::builder(Level::INFO, "outer").build())
        .unwrap_err();

    assert!(matches!(err, EmitError::Write(..)));
    assert!(err.to_string().contains("not re-entrant"));
}

/// Delegates to a shared output instance.
struct ArcOutput(Arc<dyn Output>);

impl Output for ArcOutput {
    fn write(&self, message: &Message) -> io::Result<()> {
        self.0.write(message)
    }

    fn stop(&self) -> io::Result<()> {
        self.0.stop()
    }

    fn complete(&self) -> io::Result<()> {
        self.0.complete()
    }
}

#[test]
fn removal_is_idempotent() {
    let log = Logger::new();

    let id = log.add(Term::stdout()).unwrap();
    assert_eq!(1, log.remove(id).unwrap());
    assert_eq!(0, log.remove(id).unwrap());

    assert_eq!(0, log.remove_all().unwrap());
}

#[test]
fn one_failing_destination_does_not_starve_the_others() {
    let diagnostics = Captured::default();
    let captured = Captured::default();

    let log = Logger::with_diagnostics(DiagnosticStream::new(Box::new(diagnostics.clone())));
    log.handler(FnOutput::new(|_: &Message| {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "wedged"))
    }))
    .layout(PlainLayout)
    .add()
    .unwrap();
    log.handler(captured.output())
        .layout(PlainLayout)
        .add()
        .unwrap();

    log!(log, Level::INFO, "survives").unwrap();

    assert_eq!("survives\n", captured.contents());
    assert!(diagnostics.contents().contains("wedged"));
}

#[test]
fn level_and_filter_select_destinations_independently() {
    let errors_only = Captured::default();
    let no_heartbeats = Captured::default();

    let log = Logger::new();
    log.handler(errors_only.output())
        .layout(PlainLayout)
        .level(Level::ERROR)
        .add()
        .unwrap();
    log.handler(no_heartbeats.output())
        .layout(PlainLayout)
        .filter(|rec: &Record| {
            if rec.message().contains("heartbeat") {
                fanlog::filter::FilterAction::Deny
            } else {
                fanlog::filter::FilterAction::Neutral
            }
        })
        .add()
        .unwrap();

    log!(log, Level::INFO, "heartbeat").unwrap();
    log!(log, Level::INFO, "request served").unwrap();
    log!(log, Level::ERROR, "heartbeat").unwrap();
    log!(log, Level::ERROR, "request failed").unwrap();

    assert_eq!("heartbeat\nrequest failed\n", errors_only.contents());
    assert_eq!("request served\nrequest failed\n", no_heartbeats.contents());
}
