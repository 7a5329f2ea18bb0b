use crate::error::ProfilerError;
use crate::profile::Frame;

/// The call stack of one thread at the instant of capture.
#[derive(Clone, Debug, PartialEq)]
pub struct ThreadStack {
    pub thread_id: u64,
    pub thread_name: Option<String>,
    /// Leaf first.
    pub frames: Vec<Frame>,
}

/// Source of "every thread's stack, right now".
///
/// Enumerating the stacks of all threads is runtime specific; the controller
/// and the record processor only depend on this trait. Implementations are
/// driven from a single sampling thread and are never called concurrently.
pub trait StackSnapshotProvider: Send {
    /// Prepares the provider on the sampling thread, before the first capture.
    fn start(&mut self) -> Result<(), ProfilerError> {
        Ok(())
    }

    /// Captures the stacks of all currently schedulable threads.
    ///
    /// A thread that vanishes or cannot be read mid-capture is left out of
    /// the snapshot; only failures affecting the whole capture are errors.
    fn capture(&mut self) -> Result<Vec<ThreadStack>, ProfilerError>;
}
