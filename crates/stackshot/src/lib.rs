//! A continuous stack-sampling profiler.
//!
//! A background thread wakes up at a fixed interval, captures the call stack
//! of every thread in the process and folds the stacks into a deduplicated
//! [`Trace`]. The session ends when the [`StopHandle`] returned by
//! [`start_profiling`] is stopped.
//!
//! ```no_run
//! let handle = stackshot::start_profiling();
//! // ... workload ...
//! if let Some(result) = handle.stop() {
//!     println!("{} samples", result.trace().samples().len());
//! }
//! ```

extern crate serde;
#[macro_use]
extern crate serde_derive;

mod error;
mod fault;
mod profile;
mod profile_builder;
mod profiler;
mod session;
mod snapshot;
#[cfg(target_os = "linux")]
mod symbolizer;
mod timer_thread_scheduler;
pub mod transaction;

#[cfg(target_os = "linux")]
mod signal_capture;
#[cfg(not(target_os = "linux"))]
#[path = "signal_capture_unsupported_platform.rs"]
mod signal_capture;

pub use crate::error::ProfilerError;
pub use crate::fault::{FailAt, FaultInjector, FaultPoint, NoFaults};
pub use crate::profile::{Frame, FrameId, ProfilerResult, Sample, Stack, StackId, ThreadMetadata, Trace};
pub use crate::profiler::Profiler;
pub use crate::session::configuration::{Configuration, DEFAULT_INTERVAL};
pub use crate::session::StopHandle;
pub use crate::signal_capture::SignalStackProvider;
pub use crate::snapshot::{StackSnapshotProvider, ThreadStack};

/// Starts profiling every thread of the process at the default interval.
///
/// Never fails: if sampling cannot be set up, the returned handle yields
/// `None` when stopped.
pub fn start_profiling() -> StopHandle {
    start_profiling_with(
        Configuration::default(),
        Box::new(SignalStackProvider::new()),
        Box::new(NoFaults),
    )
}

/// Starts profiling with an explicit interval, stack source and fault
/// injector.
pub fn start_profiling_with(
    configuration: Configuration,
    provider: Box<dyn StackSnapshotProvider>,
    faults: Box<dyn FaultInjector>,
) -> StopHandle {
    session::Session::start(&configuration, provider, faults)
}

/// Routes the crate's log output to stderr, filtered by `RUST_LOG`.
/// Calling it more than once is harmless.
#[cfg(feature = "debug")]
pub fn init_logger() {
    let _ = env_logger::builder()
        .format_timestamp(None)
        .format_module_path(false)
        .try_init();
}
