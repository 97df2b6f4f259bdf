use std::io::Error;

use crate::output::Output;
use crate::record::Message;

/// Adapts a plain function into an output.
///
/// Handy for tests and for sinks too small to deserve a type of their own.
pub struct FnOutput<F> {
    func: F,
}

impl<F> FnOutput<F>
where
    F: Fn(&Message) -> Result<(), Error> + Send + Sync,
{
    pub fn new(func: F) -> FnOutput<F> {
        FnOutput { func }
    }
}

impl<F> Output for FnOutput<F>
where
    F: Fn(&Message) -> Result<(), Error> + Send + Sync,
{
    fn write(&self, message: &Message) -> Result<(), Error> {
        (self.func)(message)
    }
}
