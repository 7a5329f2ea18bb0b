use std::io;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, Receiver, Sender, TryRecvError};

use crate::fault::isolate;
use crate::profile::ProfilerResult;
use crate::profiler::Profiler;
use crate::session::configuration::Configuration;

const THREAD_NAME: &str = "stackshot-sampler";

/// Drives a `Profiler` from a dedicated thread, one tick per interval.
///
/// Ticks never overlap: the next one is only considered after the previous
/// one has returned. A stop request is observed between ticks.
#[derive(Clone, Debug)]
pub struct TimerThreadScheduler {
    configuration: Configuration,
}

impl TimerThreadScheduler {
    pub fn new(configuration: &Configuration) -> Self {
        Self {
            configuration: configuration.clone(),
        }
    }

    /// Spawns the sampling thread. Dropping the returned sender requests
    /// the thread to stop; joining it yields the session result.
    pub fn spawn(
        &self,
        profiler: Profiler,
    ) -> io::Result<(Sender<()>, JoinHandle<Option<ProfilerResult>>)> {
        let (stop_sender, stop_requested) = crossbeam_channel::bounded(1);
        let configuration = self.configuration.clone();
        let handle = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn(move || Self::thread_main_loop(configuration, profiler, stop_requested))?;
        Ok((stop_sender, handle))
    }

    fn thread_main_loop(
        configuration: Configuration,
        mut profiler: Profiler,
        stop_requested: Receiver<()>,
    ) -> Option<ProfilerResult> {
        if let Err(fault) = isolate(|| profiler.start()) {
            log::error!("Profiler failed to start: {}", fault);
            return None;
        }
        log::debug!(
            "Sampling thread started (interval: {:?})",
            configuration.interval
        );

        let ticker = crossbeam_channel::tick(configuration.interval);
        loop {
            if let Err(fault) = isolate(|| profiler.on_tick()) {
                log::error!(
                    "Stopping profiler after fault on tick {}: {}",
                    profiler.ticks(),
                    fault
                );
                break;
            }

            select! {
                recv(stop_requested) -> _ => break,
                recv(ticker) -> _ => {
                    // Both may be ready at once; stopping wins
                    if stop_requested.try_recv() != Err(TryRecvError::Empty) {
                        break;
                    }
                }
            }
        }

        log::debug!(
            "Sampling thread finished after {} tick(s), {} sample(s)",
            profiler.ticks(),
            profiler.trace().samples().len()
        );
        profiler.into_result()
    }
}
