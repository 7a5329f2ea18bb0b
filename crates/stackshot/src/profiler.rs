use std::time::{Instant, SystemTime};

use crate::error::ProfilerError;
use crate::fault::{FaultInjector, FaultPoint};
use crate::profile::{ProfilerResult, Trace};
use crate::profile_builder::ProfileBuilder;
use crate::snapshot::StackSnapshotProvider;

/// The per-session sampling engine: one `on_tick` is one capture-then-process
/// cycle.
///
/// The session clock starts at the first tick whose capture and processing
/// both succeed; samples are stamped relative to it.
pub struct Profiler {
    provider: Box<dyn StackSnapshotProvider>,
    faults: Box<dyn FaultInjector>,
    builder: ProfileBuilder,
    start: Option<(Instant, SystemTime)>,
    ticks: u64,
}

impl Profiler {
    pub fn new(provider: Box<dyn StackSnapshotProvider>, faults: Box<dyn FaultInjector>) -> Self {
        Self {
            provider,
            faults,
            builder: ProfileBuilder::new(),
            start: None,
            ticks: 0,
        }
    }

    pub fn start(&mut self) -> Result<(), ProfilerError> {
        self.faults.check(FaultPoint::Startup)?;
        self.provider.start()
    }

    pub fn on_tick(&mut self) -> Result<(), ProfilerError> {
        self.ticks += 1;
        let tick = self.ticks;

        self.faults.check(FaultPoint::Capture(tick))?;
        let captured_at = (Instant::now(), SystemTime::now());
        let records = self.provider.capture()?;

        self.faults.check(FaultPoint::Process(tick))?;
        let (start_instant, _) = *self.start.get_or_insert(captured_at);
        let elapsed_ns =
            u64::try_from(captured_at.0.duration_since(start_instant).as_nanos()).unwrap_or(u64::MAX);
        log::trace!(
            "Tick {}: {} thread(s) at {}ns",
            tick,
            records.len(),
            elapsed_ns
        );
        self.builder.process_records(elapsed_ns, records);
        Ok(())
    }

    /// Number of ticks attempted so far, including failed ones.
    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn trace(&self) -> &Trace {
        self.builder.trace()
    }

    /// Freezes the trace. `None` when no tick ever succeeded.
    pub fn into_result(self) -> Option<ProfilerResult> {
        let (_, start_time) = self.start?;
        Some(ProfilerResult::new(start_time, self.builder.into_trace()))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::fault::{FailAt, NoFaults};
    use crate::profile::Frame;
    use crate::snapshot::ThreadStack;

    /// Reports two threads with fixed stacks on every capture.
    #[derive(Default)]
    pub(crate) struct ScriptedProvider {
        pub(crate) captures: Arc<AtomicU64>,
    }

    fn frame(function: &str, lineno: u32) -> Frame {
        Frame {
            function: function.to_owned(),
            module: "scripted".to_owned(),
            abs_path: "/src/scripted.rs".to_owned(),
            filename: "scripted.rs".to_owned(),
            lineno,
        }
    }

    impl StackSnapshotProvider for ScriptedProvider {
        fn capture(&mut self) -> Result<Vec<ThreadStack>, ProfilerError> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            Ok(vec![
                ThreadStack {
                    thread_id: 1,
                    thread_name: Some("main".to_owned()),
                    frames: vec![frame("busy", 10), frame("main", 2)],
                },
                ThreadStack {
                    thread_id: 2,
                    thread_name: Some("worker".to_owned()),
                    frames: vec![frame("park", 40), frame("worker_main", 7)],
                },
            ])
        }
    }

    /// Reports frames a symbolizer would never produce.
    struct UnsymbolizedProvider;

    impl StackSnapshotProvider for UnsymbolizedProvider {
        fn capture(&mut self) -> Result<Vec<ThreadStack>, ProfilerError> {
            Ok(vec![
                ThreadStack {
                    thread_id: 1,
                    thread_name: Some("main".to_owned()),
                    frames: vec![
                        Frame {
                            function: String::new(),
                            module: String::new(),
                            abs_path: String::new(),
                            filename: String::new(),
                            lineno: 0,
                        },
                        frame("main", 2),
                    ],
                },
                ThreadStack {
                    thread_id: 2,
                    thread_name: Some("idle".to_owned()),
                    frames: vec![],
                },
                ThreadStack {
                    thread_id: 3,
                    thread_name: None,
                    frames: vec![frame("anonymous", 5)],
                },
            ])
        }
    }

    struct PanickingProvider;

    impl StackSnapshotProvider for PanickingProvider {
        fn capture(&mut self) -> Result<Vec<ThreadStack>, ProfilerError> {
            panic!("expected panic in capture during tests")
        }
    }

    #[test]
    fn test_on_tick_collects_samples() {
        let mut profiler = Profiler::new(Box::<ScriptedProvider>::default(), Box::new(NoFaults));
        profiler.start().unwrap();
        profiler.on_tick().unwrap();
        thread::sleep(Duration::from_millis(1));
        profiler.on_tick().unwrap();

        assert_eq!(profiler.ticks(), 2);
        let trace = profiler.trace();
        assert_eq!(trace.samples().len(), 4);
        assert_eq!(trace.stacks().len(), 2);
        assert_eq!(trace.frames().len(), 4);
        assert_eq!(trace.samples()[0].elapsed_since_start_ns, 0);
        assert!(trace.samples()[2].elapsed_since_start_ns > 0);
    }

    #[test]
    fn test_failed_first_tick_then_recovery() {
        let mut profiler = Profiler::new(
            Box::<ScriptedProvider>::default(),
            Box::new(FailAt(FaultPoint::Capture(1))),
        );
        profiler.start().unwrap();

        assert!(profiler.on_tick().is_err());
        assert!(profiler.trace().samples().is_empty());

        profiler.on_tick().unwrap();
        assert!(!profiler.trace().samples().is_empty());
        assert_eq!(profiler.trace().samples()[0].elapsed_since_start_ns, 0);
    }

    #[test]
    fn test_fault_before_processing_leaves_trace_untouched() {
        let provider = ScriptedProvider::default();
        let captures = Arc::clone(&provider.captures);
        let mut profiler =
            Profiler::new(Box::new(provider), Box::new(FailAt(FaultPoint::Process(2))));
        profiler.start().unwrap();

        profiler.on_tick().unwrap();
        assert!(profiler.on_tick().is_err());
        assert_eq!(captures.load(Ordering::SeqCst), 2);
        assert_eq!(profiler.trace().samples().len(), 2);
    }

    #[test]
    fn test_into_result_without_successful_tick() {
        let mut profiler = Profiler::new(
            Box::<ScriptedProvider>::default(),
            Box::new(FailAt(FaultPoint::Capture(1))),
        );
        assert!(profiler.on_tick().is_err());
        assert!(profiler.into_result().is_none());
    }

    #[test]
    fn test_into_result_keeps_start_time_of_first_tick() {
        let before = SystemTime::now();
        let mut profiler = Profiler::new(Box::<ScriptedProvider>::default(), Box::new(NoFaults));
        profiler.on_tick().unwrap();
        let after = SystemTime::now();
        thread::sleep(Duration::from_millis(1));
        profiler.on_tick().unwrap();

        let result = profiler.into_result().unwrap();
        assert!(result.start_time() >= before);
        assert!(result.start_time() <= after);
        assert_eq!(result.trace().samples().len(), 4);
    }

    #[test]
    fn test_startup_fault() {
        let mut profiler = Profiler::new(
            Box::<ScriptedProvider>::default(),
            Box::new(FailAt(FaultPoint::Startup)),
        );
        assert!(matches!(
            profiler.start(),
            Err(ProfilerError::InjectedFault(_))
        ));
    }

    #[test]
    fn test_panicking_capture_propagates_out_of_on_tick() {
        let mut profiler = Profiler::new(Box::new(PanickingProvider), Box::new(NoFaults));
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| profiler.on_tick()));
        assert!(outcome.is_err());
        assert!(profiler.trace().samples().is_empty());
    }

    #[test]
    fn test_trace_keeps_invariants_for_foreign_provider() {
        let mut profiler = Profiler::new(Box::new(UnsymbolizedProvider), Box::new(NoFaults));
        profiler.on_tick().unwrap();

        let trace = profiler.into_result().unwrap().into_parts().1;
        assert!(trace.frames().iter().all(Frame::is_valid));
        assert!(trace.stacks().iter().all(|stack| !stack.is_empty()));
        assert_eq!(trace.samples().len(), 1);
        assert_eq!(trace.samples()[0].thread_id, 1);
        assert_eq!(trace.thread_metadata().len(), 1);
        assert_eq!(trace.thread_metadata()["1"].name, "main");
    }
}
