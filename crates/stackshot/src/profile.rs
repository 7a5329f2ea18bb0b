use std::collections::BTreeMap;
use std::time::SystemTime;

pub type FrameId = usize;
pub type StackId = usize;

/// A stack: frame indices into `Trace::frames`, leaf first.
pub type Stack = Vec<FrameId>;

/// Frame represents one location (function + line) observed in a captured stack.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub function: String,
    /// The path of the function, e.g. `std::thread` for `std::thread::park`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub abs_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    pub lineno: u32,
}

impl Frame {
    pub fn is_valid(&self) -> bool {
        !self.function.is_empty()
            && !(self.abs_path.is_empty() && self.filename.is_empty())
            && self.lineno > 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub elapsed_since_start_ns: u64,
    #[serde(with = "thread_id_as_string")]
    pub thread_id: u64,
    pub stack_id: StackId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// The deduplicated result of a profiling session.
///
/// Frames and stacks are interned: `Sample::stack_id` indexes `stacks`, and
/// every entry of a stack indexes `frames`. Indices are never reused.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub(crate) samples: Vec<Sample>,
    pub(crate) stacks: Vec<Stack>,
    pub(crate) frames: Vec<Frame>,
    /// Keyed by the decimal form of the thread ID.
    pub(crate) thread_metadata: BTreeMap<String, ThreadMetadata>,
}

impl Trace {
    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn stacks(&self) -> &[Stack] {
        &self.stacks
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn thread_metadata(&self) -> &BTreeMap<String, ThreadMetadata> {
        &self.thread_metadata
    }

    /// Resolves a sample's stack into frames, leaf first.
    pub fn stack_frames(&self, sample: &Sample) -> impl Iterator<Item = &Frame> + '_ {
        self.stacks
            .get(sample.stack_id)
            .into_iter()
            .flatten()
            .filter_map(|frame_id| self.frames.get(*frame_id))
    }
}

/// What a stopped profiler hands back to its caller.
#[derive(Clone, Debug)]
pub struct ProfilerResult {
    start_time: SystemTime,
    trace: Trace,
}

impl ProfilerResult {
    pub(crate) fn new(start_time: SystemTime, trace: Trace) -> Self {
        Self { start_time, trace }
    }

    /// Wall-clock time of the first successful collection.
    pub fn start_time(&self) -> SystemTime {
        self.start_time
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_parts(self) -> (SystemTime, Trace) {
        (self.start_time, self.trace)
    }
}

mod thread_id_as_string {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(thread_id: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(thread_id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}
