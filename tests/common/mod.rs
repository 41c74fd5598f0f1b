#![allow(dead_code)]

use std::hint::black_box;

use stackwalk::{capture, CaptureMethod, CaptureOptions, StackTrace, Target};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Call `f` from `depth` additional frames of `recurse`.
#[inline(never)]
pub fn recurse<R>(depth: usize, f: &mut dyn FnMut() -> R) -> R {
    let result = if depth == 0 {
        f()
    } else {
        recurse(depth - 1, f)
    };
    // Keeps this frame on the stack during the call.
    black_box(result)
}

/// Capture with every local method, all from the same call site.
#[inline(never)]
pub fn capture_all_local(options: &CaptureOptions) -> Vec<StackTrace> {
    // An opaque list keeps the loop from being unrolled into several call sites.
    let methods = black_box(CaptureMethod::LOCAL.to_vec());
    let mut traces = Vec::with_capacity(methods.len());
    for method in methods {
        traces.push(capture(method, Target::SelfProcess, options).unwrap());
    }
    traces
}

/// The number of leading addresses all traces share.
pub fn common_prefix_len(traces: &[StackTrace]) -> usize {
    let addresses: Vec<Vec<u64>> = traces.iter().map(StackTrace::addresses).collect();
    let shortest = addresses.iter().map(Vec::len).min().unwrap_or(0);
    (0..shortest)
        .take_while(|&i| addresses.iter().all(|a| a[i] == addresses[0][i]))
        .count()
}

/// The index of the outermost frame whose symbol contains `name`.
pub fn position_of(trace: &StackTrace, name: &str) -> Option<usize> {
    trace
        .frames()
        .iter()
        .rposition(|f| f.symbol().is_some_and(|s| s.name.contains(name)))
}
