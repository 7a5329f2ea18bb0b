use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::error::ProfilerError;

/// A point in the sampling loop where a `FaultInjector` is consulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultPoint {
    /// Before the provider is prepared.
    Startup,
    /// Before capturing the stacks of tick `n` (ticks count from 1).
    Capture(u64),
    /// Before the snapshot of tick `n` is folded into the trace.
    Process(u64),
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultPoint::Startup => write!(f, "startup"),
            FaultPoint::Capture(tick) => write!(f, "capture of tick {}", tick),
            FaultPoint::Process(tick) => write!(f, "processing of tick {}", tick),
        }
    }
}

/// Lets tests and embedders make the sampling loop fail on purpose.
pub trait FaultInjector: Send {
    fn check(&mut self, point: FaultPoint) -> Result<(), ProfilerError>;
}

/// The production injector: never fails.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn check(&mut self, _point: FaultPoint) -> Result<(), ProfilerError> {
        Ok(())
    }
}

/// Fails with `ProfilerError::InjectedFault` when `point` is reached.
#[derive(Clone, Copy, Debug)]
pub struct FailAt(pub FaultPoint);

impl FaultInjector for FailAt {
    fn check(&mut self, point: FaultPoint) -> Result<(), ProfilerError> {
        if point == self.0 {
            return Err(ProfilerError::InjectedFault(point.to_string()));
        }
        Ok(())
    }
}

/// Why a step inside the isolation boundary did not complete.
#[derive(Debug)]
pub enum Fault {
    Error(ProfilerError),
    Panic(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Error(err) => write!(f, "{}", err),
            Fault::Panic(message) => write!(f, "panicked: {}", message),
        }
    }
}

/// Runs `step`, converting both its error and any panic into a `Fault`.
pub fn isolate<F>(step: F) -> Result<(), Fault>
where
    F: FnOnce() -> Result<(), ProfilerError>,
{
    match panic::catch_unwind(AssertUnwindSafe(step)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(Fault::Error(err)),
        Err(payload) => Err(Fault::Panic(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "(non-string panic payload)".to_owned()
    }
}
