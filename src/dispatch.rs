//! Request processor interface

use crate::error::ProcessError;

/// A user-supplied dispatcher, invoked once per complete frame.
///
/// `input` decodes the request payload, `output` encodes the response and
/// writes it to the connection. The same processor serves every connection
/// and may be invoked from all workers at once; frames from one connection
/// carry no ordering relative to each other.
///
/// Errors (and panics) are caught by the calling worker, logged and
/// discarded.
pub trait Processor<P>: Send + Sync + 'static {
    fn process(&self, input: &mut P, output: &mut P) -> Result<(), ProcessError>;
}

impl<P, F> Processor<P> for F
where
    F: Fn(&mut P, &mut P) -> Result<(), ProcessError> + Send + Sync + 'static,
{
    #[inline]
    fn process(&self, input: &mut P, output: &mut P) -> Result<(), ProcessError> {
        self(input, output)
    }
}
