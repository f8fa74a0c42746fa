//! Per-message logs are only useful when chasing a bug in a test run: outside of tests they would
//! fire for every message flowing through the pipeline, so these compile down to nothing.
//! Lifecycle and failure events use [`tracing`] directly.

#[macro_export]
macro_rules! debug {
    ($($arg:tt)+) => {
        #[cfg(test)]
        tracing::debug!($($arg)+)
    };
}
pub(crate) use crate::debug;

#[macro_export]
macro_rules! trace {
    ($($arg:tt)+) => {
        #[cfg(test)]
        tracing::trace!($($arg)+)
    };
}
pub(crate) use crate::trace;
