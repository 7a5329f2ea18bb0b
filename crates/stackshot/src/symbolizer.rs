use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;

use crate::profile::Frame;

/// Symbols that belong to the signal delivery path rather than to the
/// interrupted code. Captured stacks start with these.
const MACHINERY_PREFIXES: &[&str] = &[
    "backtrace::",
    "<backtrace::",
    "stackshot::signal_capture::signal_handler",
    "__restore_rt",
    "__kernel_rt_sigreturn",
    "_sigtramp",
];

#[derive(Debug)]
struct ResolvedIp {
    machinery: bool,
    /// Innermost (inlined) first.
    frames: Vec<Frame>,
}

/// Resolves raw instruction pointers into `Frame`s.
///
/// Resolution is cached per instruction pointer for the lifetime of the
/// symbolizer, which is one profiling session.
#[derive(Debug, Default)]
pub struct Symbolizer {
    cache: HashMap<usize, ResolvedIp>,
}

impl Symbolizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Symbolizes a stack captured from inside the sampling signal handler,
    /// leaf first. The handler's own frames are stripped, as are frames that
    /// lack a function name, a source path or a line number.
    pub fn symbolize(&mut self, ips: &[usize]) -> Vec<Frame> {
        let mut frames = Vec::with_capacity(ips.len());
        let mut reached_interrupted_code = false;
        for &ip in ips {
            let resolved = self.cache.entry(ip).or_insert_with(|| resolve_ip(ip));
            if !reached_interrupted_code {
                if resolved.machinery {
                    continue;
                }
                reached_interrupted_code = true;
            }
            frames.extend(resolved.frames.iter().cloned());
        }
        frames
    }
}

fn resolve_ip(ip: usize) -> ResolvedIp {
    let mut names: Vec<Option<String>> = vec![];
    let mut frames = vec![];
    // Callers' IPs are return addresses; step back into the call instruction
    let lookup = ip.saturating_sub(1);
    backtrace::resolve(lookup as *mut c_void, |symbol| {
        // `{:#}` drops the trailing hash of legacy Rust symbols
        let name = symbol.name().map(|name| format!("{:#}", name));
        if let Some(frame) = frame_from_symbol(name.as_deref(), symbol.filename(), symbol.lineno()) {
            frames.push(frame);
        }
        names.push(name);
    });

    let machinery = names.is_empty() || names.iter().all(|name| is_machinery(name.as_deref()));
    ResolvedIp { machinery, frames }
}

fn is_machinery(name: Option<&str>) -> bool {
    match name {
        None => true,
        Some(name) => MACHINERY_PREFIXES
            .iter()
            .any(|prefix| name.starts_with(prefix)),
    }
}

fn frame_from_symbol(name: Option<&str>, path: Option<&Path>, lineno: Option<u32>) -> Option<Frame> {
    let function = name.filter(|name| !name.is_empty())?;
    let lineno = lineno.filter(|lineno| *lineno > 0)?;
    let path = path?;
    let filename = path.file_name()?.to_str()?;
    let abs_path = if path.is_absolute() {
        path.to_str().unwrap_or_default()
    } else {
        ""
    };

    Some(Frame {
        function: function.to_owned(),
        module: module_of(function).to_owned(),
        abs_path: abs_path.to_owned(),
        filename: filename.to_owned(),
        lineno,
    })
}

/// The path of a demangled function name, without the function itself:
/// `std::thread::park` -> `std::thread`. Separators nested inside generic
/// arguments are ignored.
fn module_of(function: &str) -> &str {
    let mut depth = 0usize;
    let mut split_at = None;
    let bytes = function.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                split_at = Some(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    split_at.map_or("", |index| &function[..index])
}
