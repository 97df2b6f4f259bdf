use std::io::Error;

use crate::record::Message;

mod file;
mod func;
mod null;
mod term;

pub use self::file::FileOutput;
pub use self::func::FnOutput;
pub use self::null::NullOutput;
pub use self::term::Term;

/// Outputs are responsible for delivering formatted log events to their
/// destination.
///
/// An output never needs to care about concurrency: the owning destination
/// serializes calls to `write` behind its write-lock, so two messages are
/// never written at the same time and `stop` never races a write in flight.
pub trait Output: Send + Sync {
    fn write(&self, message: &Message) -> Result<(), Error>;

    /// Called exactly once when the destination is removed, after the last
    /// write has completed.
    fn stop(&self) -> Result<(), Error> {
        Ok(())
    }

    /// Called by the dispatcher's flush operation so an output with internal
    /// asynchrony can wait for its in-flight work to settle.
    fn complete(&self) -> Result<(), Error> {
        Ok(())
    }
}
