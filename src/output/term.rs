use std::io::{Error, Write};

use crate::output::Output;
use crate::record::Message;

enum Stream {
    Stdout,
    Stderr,
}

/// Writes messages to the terminal.
///
/// The standard stream handle is locked for the duration of one message so
/// the bytes of a single write stay contiguous even when something else in
/// the process prints concurrently; flushing right away keeps interactive
/// output timely.
pub struct Term {
    stream: Stream,
}

impl Term {
    pub fn stdout() -> Term {
        Term {
            stream: Stream::Stdout,
        }
    }

    pub fn stderr() -> Term {
        Term {
            stream: Stream::Stderr,
        }
    }
}

impl Output for Term {
    fn write(&self, message: &Message) -> Result<(), Error> {
        match self.stream {
            Stream::Stdout => {
                let stdout = std::io::stdout();
                let mut wr = stdout.lock();
                wr.write_all(message.text().as_bytes())?;
                wr.flush()
            }
            Stream::Stderr => {
                let stderr = std::io::stderr();
                let mut wr = stderr.lock();
                wr.write_all(message.text().as_bytes())?;
                wr.flush()
            }
        }
    }
}
