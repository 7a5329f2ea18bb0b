use crate::error::ProfilerError;
use crate::snapshot::{StackSnapshotProvider, ThreadStack};

/// Stand-in for platforms without per-thread signal delivery. Fails at
/// startup, so sessions end without a result.
#[derive(Debug, Default)]
pub struct SignalStackProvider {}

impl SignalStackProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StackSnapshotProvider for SignalStackProvider {
    fn start(&mut self) -> Result<(), ProfilerError> {
        Err(ProfilerError::UnsupportedPlatform)
    }

    fn capture(&mut self) -> Result<Vec<ThreadStack>, ProfilerError> {
        Err(ProfilerError::UnsupportedPlatform)
    }
}
