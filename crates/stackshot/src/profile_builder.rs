use std::collections::HashMap;

use crate::profile::{Frame, FrameId, Sample, Stack, StackId, ThreadMetadata, Trace};
use crate::snapshot::ThreadStack;

/// Identity of a frame for interning purposes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct FrameKey {
    function: String,
    abs_path: String,
    filename: String,
    lineno: u32,
}

/// Turns raw snapshots into a `Trace`, interning frames and stacks.
///
/// Both tables only ever grow during a session; an index handed out once
/// keeps pointing at the same frame or stack.
#[derive(Debug, Default)]
pub struct ProfileBuilder {
    trace: Trace,
    frame_indices: HashMap<FrameKey, FrameId>,
    stack_indices: HashMap<Stack, StackId>,
    last_elapsed_ns: HashMap<u64, u64>,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn into_trace(self) -> Trace {
        self.trace
    }

    /// Appends one sample per record, in record order, all stamped with
    /// `elapsed_ns`.
    ///
    /// Frames that are not valid are left out of their stack. A record
    /// without any valid frame, or from a thread that has never reported a
    /// name, produces no sample.
    pub fn process_records(&mut self, elapsed_ns: u64, records: Vec<ThreadStack>) {
        for record in records {
            let thread_id = record.thread_id;
            // Samples of a thread must be strictly increasing in time
            if let Some(&last) = self.last_elapsed_ns.get(&thread_id) {
                if elapsed_ns <= last {
                    log::trace!(
                        "Dropping out-of-order sample for thread {} ({} <= {})",
                        thread_id,
                        elapsed_ns,
                        last
                    );
                    continue;
                }
            }

            let frames: Vec<Frame> = record
                .frames
                .into_iter()
                .filter(Frame::is_valid)
                .collect();
            if frames.is_empty() {
                log::trace!("No valid frames for thread {}; skipping", thread_id);
                continue;
            }
            if !self.observe_thread(thread_id, record.thread_name) {
                log::trace!("Thread {} has no name yet; skipping", thread_id);
                continue;
            }

            let stack: Stack = frames
                .into_iter()
                .map(|frame| self.frame_index_for(frame))
                .collect();
            let stack_id = self.stack_index_for(stack);

            self.trace.samples.push(Sample {
                elapsed_since_start_ns: elapsed_ns,
                thread_id,
                stack_id,
            });
            self.last_elapsed_ns.insert(thread_id, elapsed_ns);
        }
    }

    /// Returns the index of the frame in `frames`, registering it if unseen.
    fn frame_index_for(&mut self, frame: Frame) -> FrameId {
        let Frame {
            function,
            module,
            abs_path,
            filename,
            lineno,
        } = frame;
        let key = FrameKey {
            function,
            abs_path,
            filename,
            lineno,
        };
        if let Some(&index) = self.frame_indices.get(&key) {
            return index;
        }

        let index = self.trace.frames.len();
        self.trace.frames.push(Frame {
            function: key.function.clone(),
            module,
            abs_path: key.abs_path.clone(),
            filename: key.filename.clone(),
            lineno,
        });
        self.frame_indices.insert(key, index);
        index
    }

    /// Returns the index of the stack in `stacks`, registering it if unseen.
    fn stack_index_for(&mut self, stack: Stack) -> StackId {
        if let Some(&index) = self.stack_indices.get(&stack) {
            return index;
        }

        let index = self.trace.stacks.len();
        self.trace.stacks.push(stack.clone());
        self.stack_indices.insert(stack, index);
        index
    }

    /// Records the thread's name the first time one is reported. Returns
    /// whether the thread has a name.
    fn observe_thread(&mut self, thread_id: u64, name: Option<String>) -> bool {
        let key = thread_id.to_string();
        if self.trace.thread_metadata.contains_key(&key) {
            return true;
        }
        match name.filter(|name| !name.is_empty()) {
            Some(name) => {
                self.trace
                    .thread_metadata
                    .insert(key, ThreadMetadata { name });
                true
            }
            None => false,
        }
    }
}
