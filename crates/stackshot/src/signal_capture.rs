#![deny(unsafe_op_in_unsafe_fn)]

use std::cell::UnsafeCell;
use std::ffi::{c_int, c_void};
use std::fs;
use std::io;
use std::mem;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ProfilerError;
use crate::snapshot::{StackSnapshotProvider, ThreadStack};
use crate::symbolizer::Symbolizer;

const SAMPLING_SIGNAL: c_int = libc::SIGPROF;
const MAX_STACK_DEPTH: usize = 128;
const MAX_THREADS: usize = 512;
/// How long a capture round waits for signal handlers to report back.
const REPLY_TIMEOUT: Duration = Duration::from_millis(50);
const REPLY_POLL_INTERVAL: Duration = Duration::from_micros(50);

// Slot states. A slot moves IDLE -> ARMED (collector) -> WRITING (handler)
// -> DONE (handler) -> IDLE (collector). Only the handler whose CAS won
// ARMED -> WRITING ever touches `ips`.
const IDLE: u8 = 0;
const ARMED: u8 = 1;
const WRITING: u8 = 2;
const DONE: u8 = 3;

/// A pre-allocated capture buffer, claimed by one thread per round.
struct Slot {
    tid: AtomicI32,
    state: AtomicU8,
    len: AtomicUsize,
    ips: UnsafeCell<[usize; MAX_STACK_DEPTH]>,
}

// SAFETY: `ips` is only written by the handler holding the slot in WRITING,
// and only read by the collector after observing DONE (Acquire).
unsafe impl Sync for Slot {}

impl Slot {
    const fn new() -> Self {
        Self {
            tid: AtomicI32::new(0),
            state: AtomicU8::new(IDLE),
            len: AtomicUsize::new(0),
            ips: UnsafeCell::new([0; MAX_STACK_DEPTH]),
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const EMPTY_SLOT: Slot = Slot::new();

// Static so that a late signal can never observe freed memory.
static SLOTS: [Slot; MAX_THREADS] = [EMPTY_SLOT; MAX_THREADS];

/// Serializes capture rounds across all sessions in the process.
static CAPTURE_LOCK: Mutex<()> = Mutex::new(());

/// errno of a failed `sigaction`, recorded once per process.
static HANDLER_INSTALLED: OnceLock<Result<(), i32>> = OnceLock::new();

/// Captures the stacks of every thread in the process by interrupting each
/// one with `SIGPROF` and letting it walk its own stack.
///
/// The signal handler neither allocates nor locks: it copies raw
/// instruction pointers into a static slot. Symbolization happens afterwards
/// on the sampling thread.
#[derive(Debug)]
pub struct SignalStackProvider {
    symbolizer: Symbolizer,
}

impl SignalStackProvider {
    pub fn new() -> Self {
        Self {
            symbolizer: Symbolizer::new(),
        }
    }
}

impl Default for SignalStackProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StackSnapshotProvider for SignalStackProvider {
    fn start(&mut self) -> Result<(), ProfilerError> {
        install_signal_handler()
    }

    fn capture(&mut self) -> Result<Vec<ThreadStack>, ProfilerError> {
        let own_tid = current_tid();
        let mut targets = list_threads()?;
        targets.retain(|tid| *tid != own_tid);

        let mut stacks = Vec::with_capacity(targets.len());
        for (tid, ips) in capture_round(&targets) {
            // The thread exited after answering
            let Some(name) = thread_name(tid) else {
                log::trace!("Thread {} is gone; skipping", tid);
                continue;
            };
            let frames = self.symbolizer.symbolize(&ips);
            if frames.is_empty() {
                log::trace!("No symbolizable frames for thread {}; skipping", tid);
                continue;
            }
            stacks.push(ThreadStack {
                thread_id: tid as u64,
                thread_name: Some(name),
                frames,
            });
        }
        Ok(stacks)
    }
}

fn install_signal_handler() -> Result<(), ProfilerError> {
    let installed = HANDLER_INSTALLED.get_or_init(|| {
        let mut sa: libc::sigaction = unsafe { mem::zeroed() };
        let mut previous: libc::sigaction = unsafe { mem::zeroed() };
        sa.sa_sigaction = signal_handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        unsafe { libc::sigemptyset(&mut sa.sa_mask) };
        let err = unsafe { libc::sigaction(SAMPLING_SIGNAL, &sa, &mut previous) };
        if err != 0 {
            return Err(io::Error::last_os_error().raw_os_error().unwrap_or(0));
        }
        if replaces_foreign_handler(&previous) {
            log::warn!("Replaced an existing SIGPROF handler; it will no longer be called");
        }
        log::debug!("Signal handler installed");
        Ok(())
    });
    (*installed).map_err(|errno| ProfilerError::SignalHandler(io::Error::from_raw_os_error(errno)))
}

/// Whether `previous` is a handler installed by someone else, as opposed to
/// the default or ignored disposition (or our own handler).
fn replaces_foreign_handler(previous: &libc::sigaction) -> bool {
    let handler = previous.sa_sigaction;
    handler != libc::SIG_DFL && handler != libc::SIG_IGN && handler != signal_handler as usize
}

// Runs on the interrupted thread. Must stay async-signal-safe: no
// allocation, no locks, no panics.
extern "C" fn signal_handler(_sig: c_int, _info: *mut libc::siginfo_t, _ucontext: *mut c_void) {
    let saved_errno = unsafe { *libc::__errno_location() };
    let tid = current_tid();

    for slot in SLOTS.iter() {
        if slot.tid.load(Ordering::Relaxed) != tid {
            continue;
        }
        if slot
            .state
            .compare_exchange(ARMED, WRITING, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            continue;
        }
        // The tid cannot change while we hold the slot; recheck it now that
        // the Acquire above made the armed value visible.
        if slot.tid.load(Ordering::Relaxed) != tid {
            slot.state.store(ARMED, Ordering::Release);
            continue;
        }

        let buf: &mut [usize; MAX_STACK_DEPTH] = unsafe { &mut *slot.ips.get() };
        let mut len = 0usize;
        // SAFETY: capture rounds are serialized by CAPTURE_LOCK and each
        // round signals one thread per slot.
        unsafe {
            backtrace::trace_unsynchronized(|frame| {
                buf[len] = frame.ip() as usize;
                len += 1;
                len < MAX_STACK_DEPTH
            });
        }
        slot.len.store(len, Ordering::Relaxed);
        slot.state.store(DONE, Ordering::Release);
        break;
    }

    unsafe { *libc::__errno_location() = saved_errno };
}

/// Signals every target and gathers the raw stacks of those that answered
/// within `REPLY_TIMEOUT`, in target order.
fn capture_round(targets: &[libc::pid_t]) -> Vec<(libc::pid_t, Vec<usize>)> {
    let _guard = CAPTURE_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let pid = unsafe { libc::getpid() };

    // Reclaim slots finished by handlers that answered after a previous
    // round gave up on them. Slots still WRITING stay reserved.
    for slot in SLOTS.iter() {
        let _ = slot
            .state
            .compare_exchange(DONE, IDLE, Ordering::AcqRel, Ordering::Relaxed);
        let _ = slot
            .state
            .compare_exchange(ARMED, IDLE, Ordering::AcqRel, Ordering::Relaxed);
    }

    let (claimed, overflow) = claim_slots(targets);
    if !overflow.is_empty() {
        log::warn!(
            "More than {} threads to sample; skipping {} thread(s) this round",
            MAX_THREADS,
            overflow.len()
        );
    }

    let mut armed: Vec<(usize, libc::pid_t)> = Vec::with_capacity(claimed.len());
    for (index, tid) in claimed {
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, pid, tid, SAMPLING_SIGNAL) };
        if rc != 0 {
            // Exited between enumeration and delivery
            log::trace!("Failed to signal thread {}: {}", tid, io::Error::last_os_error());
            SLOTS[index].state.store(IDLE, Ordering::Release);
            continue;
        }
        armed.push((index, tid));
    }

    let deadline = Instant::now() + REPLY_TIMEOUT;
    while armed
        .iter()
        .any(|&(index, _)| SLOTS[index].state.load(Ordering::Acquire) != DONE)
    {
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(REPLY_POLL_INTERVAL);
    }

    let mut stacks = Vec::with_capacity(armed.len());
    for (index, tid) in armed {
        let slot = &SLOTS[index];
        match slot
            .state
            .compare_exchange(ARMED, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => log::trace!("Thread {} did not answer in time; skipping", tid),
            Err(DONE) => {
                let len = slot.len.load(Ordering::Relaxed).min(MAX_STACK_DEPTH);
                let ips = unsafe { &*slot.ips.get() }[..len].to_vec();
                slot.state.store(IDLE, Ordering::Release);
                stacks.push((tid, ips));
            }
            Err(_) => log::warn!("Thread {} is still unwinding; abandoning its sample", tid),
        }
    }
    stacks
}

/// Arms one idle slot per target, in target order. Returns the armed
/// `(slot index, tid)` pairs and the targets left without a slot.
///
/// Must be called with `CAPTURE_LOCK` held.
fn claim_slots(targets: &[libc::pid_t]) -> (Vec<(usize, libc::pid_t)>, &[libc::pid_t]) {
    let mut free_slots = SLOTS
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.state.load(Ordering::Acquire) == IDLE);
    let mut claimed = Vec::with_capacity(targets.len().min(MAX_THREADS));
    for (position, &tid) in targets.iter().enumerate() {
        let Some((index, slot)) = free_slots.next() else {
            return (claimed, &targets[position..]);
        };
        slot.tid.store(tid, Ordering::Relaxed);
        slot.len.store(0, Ordering::Relaxed);
        slot.state.store(ARMED, Ordering::Release);
        claimed.push((index, tid));
    }
    (claimed, &targets[targets.len()..])
}

fn current_tid() -> libc::pid_t {
    unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t }
}

fn list_threads() -> Result<Vec<libc::pid_t>, ProfilerError> {
    let entries = fs::read_dir("/proc/self/task").map_err(ProfilerError::ThreadEnumeration)?;
    let mut tids: Vec<libc::pid_t> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().to_str().and_then(|name| name.parse().ok()))
        .collect();
    tids.sort_unstable();
    Ok(tids)
}

fn thread_name(tid: libc::pid_t) -> Option<String> {
    let comm = fs::read_to_string(format!("/proc/self/task/{}/comm", tid)).ok()?;
    let name = comm.trim_end();
    if name.is_empty() {
        return None;
    }
    Some(name.to_owned())
}
