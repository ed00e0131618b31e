use std::io;

/// An error raised by a request processor.
///
/// The worker that invoked the processor logs it and moves on to the next
/// frame; it never propagates past the worker loop.
#[derive(thiserror::Error, Debug)]
pub enum ProcessError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("{0}")]
    App(String),
}

impl From<&str> for ProcessError {
    #[inline]
    fn from(e: &str) -> Self {
        Self::App(e.to_string())
    }
}

impl From<String> for ProcessError {
    #[inline]
    fn from(e: String) -> Self {
        Self::App(e)
    }
}
