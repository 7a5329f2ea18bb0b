pub mod configuration;

use std::thread::JoinHandle;

use crossbeam_channel::Sender;

use self::configuration::Configuration;
use crate::fault::FaultInjector;
use crate::profile::ProfilerResult;
use crate::profiler::Profiler;
use crate::snapshot::StackSnapshotProvider;
use crate::timer_thread_scheduler::TimerThreadScheduler;

/// A running profiling session.
///
/// Stopping consumes the handle. Dropping it without calling `stop` also
/// ends the session and discards the result.
#[must_use = "dropping a StopHandle stops the profiler immediately"]
pub struct StopHandle {
    stop_sender: Option<Sender<()>>,
    thread: Option<JoinHandle<Option<ProfilerResult>>>,
}

impl StopHandle {
    /// Requests the sampling thread to stop, waits for the tick in flight
    /// (if any) to finish, and returns what was collected.
    ///
    /// Returns `None` only when the session never completed a tick.
    pub fn stop(mut self) -> Option<ProfilerResult> {
        self.finish()
    }

    fn finish(&mut self) -> Option<ProfilerResult> {
        // Disconnecting the channel is the stop signal
        drop(self.stop_sender.take());

        let thread = self.thread.take()?;
        match thread.join() {
            Ok(result) => {
                match &result {
                    Some(result) => log::debug!(
                        "Profiler stopped with {} sample(s)",
                        result.trace().samples().len()
                    ),
                    None => log::debug!("Profiler stopped without a result"),
                }
                result
            }
            Err(_) => {
                log::error!("Sampling thread terminated abnormally; discarding profile");
                None
            }
        }
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.finish();
    }
}

pub struct Session;

impl Session {
    /// Spawns the sampling thread and returns immediately.
    pub fn start(
        configuration: &Configuration,
        provider: Box<dyn StackSnapshotProvider>,
        faults: Box<dyn FaultInjector>,
    ) -> StopHandle {
        let profiler = Profiler::new(provider, faults);
        match TimerThreadScheduler::new(configuration).spawn(profiler) {
            Ok((stop_sender, thread)) => StopHandle {
                stop_sender: Some(stop_sender),
                thread: Some(thread),
            },
            Err(err) => {
                log::error!("Failed to spawn the sampling thread: {}", err);
                StopHandle {
                    stop_sender: None,
                    thread: None,
                }
            }
        }
    }
}
