use std::io::Error;

use crate::output::Output;
use crate::record::Message;

/// A null output merely exists, it never outputs a message to any device.
///
/// This struct exists primarily to measure the logging pipeline itself and
/// to disable a destination without removing it. It never fails, because it
/// does nothing.
pub struct NullOutput;

impl Output for NullOutput {
    fn write(&self, _message: &Message) -> Result<(), Error> {
        Ok(())
    }
}
