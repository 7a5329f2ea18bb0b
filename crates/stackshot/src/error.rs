use std::io;

/// Failures that end a profiling session early.
///
/// These never reach the profiled program: the controller turns them into
/// an empty or partial result.
#[derive(Debug, thiserror::Error)]
pub enum ProfilerError {
    #[error("failed to install the sampling signal handler: {0}")]
    SignalHandler(#[source] io::Error),

    #[error("failed to enumerate threads: {0}")]
    ThreadEnumeration(#[source] io::Error),

    #[error("stack sampling is not supported on this platform")]
    UnsupportedPlatform,

    #[error("injected fault at {0}")]
    InjectedFault(String),
}
