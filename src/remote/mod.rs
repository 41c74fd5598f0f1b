//! Capturing the stack of another process through ptrace.
//!
//! A capture attaches to the target, waits for it to stop, walks its main thread's
//! stack from the current registers and detaches again. The target is stopped only
//! for the duration of the capture.

mod mem_reader;
mod regs;
mod session;

use std::time::Duration;

pub use mem_reader::{CopyFromProcessError, MemReader};
pub use session::{RemoteSession, SessionState};

use crate::error::ModuleError;
use crate::frame::{CaptureMethod, Frame, StackTrace};
use crate::options::CaptureOptions;

#[derive(thiserror::Error, Debug)]
pub enum RemoteError {
    #[error("No process with pid {0}")]
    NoSuchProcess(i32),

    #[error("Not permitted to trace process {0}")]
    PermissionDenied(i32),

    #[error("Process {pid} is already traced by process {tracer}")]
    AlreadyTraced { pid: i32, tracer: i32 },

    #[error("Process {pid} did not stop within {timeout:?}")]
    AttachTimeout { pid: i32, timeout: Duration },

    #[error("Process {pid} exited during the capture, {} frames were captured", .partial.len())]
    TargetExited { pid: i32, partial: Vec<Frame> },

    #[error("Cannot {operation} a session in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("{op} failed for process {pid}: {source}")]
    Ptrace {
        op: &'static str,
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error(transparent)]
    ReadMemory(#[from] CopyFromProcessError),

    #[error("Could not load the modules of the target: {0}")]
    Modules(#[source] ModuleError),
}

/// Capture the stack of `pid` with the unwinder engine.
///
/// The first frame is the target's current instruction pointer.
pub fn capture_unwind_library(pid: i32, options: &CaptureOptions) -> Result<StackTrace, RemoteError> {
    capture_with(pid, CaptureMethod::RemoteUnwindLibrary, options)
}

/// Capture the stack of `pid` by CFI stepping alone.
///
/// The first frame is the target's current instruction pointer.
pub fn capture_debug_info(pid: i32, options: &CaptureOptions) -> Result<StackTrace, RemoteError> {
    capture_with(pid, CaptureMethod::RemoteDebugInfo, options)
}

fn capture_with(
    pid: i32,
    method: CaptureMethod,
    options: &CaptureOptions,
) -> Result<StackTrace, RemoteError> {
    let mut session = RemoteSession::new(pid);
    session.attach(options.attach_timeout)?;
    let trace = match method {
        CaptureMethod::RemoteDebugInfo => session.capture_debug_info(options),
        _ => session.capture_unwind_library(options),
    };
    let detached = match session.state() {
        SessionState::Detached => Ok(()),
        _ => session.detach(),
    };
    let trace = trace?;
    detached?;
    Ok(trace)
}
