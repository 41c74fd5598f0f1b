use std::time::{Duration, Instant};

use memmap2::Mmap;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::mem_reader::MemReader;
use super::regs::read_registers;
use super::RemoteError;
use crate::arch::{ArchNative, UnwindRegsNative};
use crate::cache::Cache;
use crate::frame::{CaptureMethod, StackTrace, StopReason, Target, TraceBuilder};
use crate::maps;
use crate::module::ModuleMap;
use crate::options::CaptureOptions;
use crate::stepper::{self, CfiStepper, StepError};
use crate::symbols::symbolicate;
use crate::unwinder::Unwinder;

/// Where a [`RemoteSession`] is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unattached,
    /// Attached, waiting for the target to stop.
    Attaching,
    Stopped,
    Capturing,
    Detached,
}

/// The outcome of waiting for the attach stop.
enum AttachStop {
    Stopped,
    Exited,
    Pending,
}

/// A ptrace attachment to one target process.
///
/// The target stays stopped from a successful [`attach`](Self::attach) until
/// [`detach`](Self::detach) or drop.
#[derive(Debug)]
pub struct RemoteSession {
    pid: Pid,
    state: SessionState,
    /// Signals the target received while we waited for the attach stop. They are
    /// delivered again on detach.
    pending_signals: Vec<Signal>,
    mem: MemReader,
}

impl RemoteSession {
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            state: SessionState::Unattached,
            pending_signals: Vec::new(),
            mem: MemReader::new(pid),
        }
    }

    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn expect_state(&self, operation: &'static str, expected: SessionState) -> Result<(), RemoteError> {
        if self.state != expected {
            return Err(RemoteError::InvalidState {
                operation,
                state: self.state,
            });
        }
        Ok(())
    }

    /// Attach to the target and wait up to `timeout` for it to stop.
    pub fn attach(&mut self, timeout: Duration) -> Result<(), RemoteError> {
        self.expect_state("attach", SessionState::Unattached)?;
        let pid = self.pid();
        if pid <= 0 {
            return Err(RemoteError::NoSuchProcess(pid));
        }
        if self.pid == nix::unistd::getpid() {
            return Err(RemoteError::PermissionDenied(pid));
        }

        match ptrace::attach(self.pid) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Err(RemoteError::NoSuchProcess(pid)),
            Err(Errno::EPERM) => {
                return Err(match tracer_pid(pid) {
                    Some(tracer) if tracer != 0 => RemoteError::AlreadyTraced { pid, tracer },
                    _ => RemoteError::PermissionDenied(pid),
                })
            }
            Err(source) => {
                return Err(RemoteError::Ptrace {
                    op: "PTRACE_ATTACH",
                    pid,
                    source,
                })
            }
        }
        self.state = SessionState::Attaching;
        log::debug!("Attached to {pid}, waiting for it to stop");

        self.wait_for_stop(timeout)?;
        self.state = SessionState::Stopped;
        Ok(())
    }

    fn wait_for_stop(&mut self, timeout: Duration) -> Result<(), RemoteError> {
        let pid = self.pid();
        let deadline = Instant::now() + timeout;
        let mut delay = Duration::from_micros(100);
        loop {
            match self.poll_attach_stop(WaitPidFlag::WNOHANG)? {
                AttachStop::Stopped => return Ok(()),
                AttachStop::Exited => {
                    self.state = SessionState::Detached;
                    return Err(RemoteError::TargetExited {
                        pid,
                        partial: Vec::new(),
                    });
                }
                AttachStop::Pending => {}
            }
            let now = Instant::now();
            if now >= deadline {
                log::warn!("{pid} did not stop within {timeout:?}");
                return Err(RemoteError::AttachTimeout { pid, timeout });
            }
            std::thread::sleep(delay.min(deadline - now));
            delay = (delay * 2).min(Duration::from_millis(10));
        }
    }

    /// One `waitpid` for the stop requested by `PTRACE_ATTACH`. Other signals that
    /// arrive first are deferred and the target is resumed.
    fn poll_attach_stop(&mut self, flags: WaitPidFlag) -> Result<AttachStop, RemoteError> {
        let pid = self.pid();
        match waitpid(self.pid, Some(flags | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => Ok(AttachStop::Stopped),
            Ok(WaitStatus::Stopped(_, signal)) => {
                log::debug!("{pid} received {signal} before the attach stop, deferring it");
                self.pending_signals.push(signal);
                ptrace::cont(self.pid, None).map_err(|source| RemoteError::Ptrace {
                    op: "PTRACE_CONT",
                    pid,
                    source,
                })?;
                Ok(AttachStop::Pending)
            }
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                Ok(AttachStop::Exited)
            }
            Ok(_) | Err(Errno::EINTR) => Ok(AttachStop::Pending),
            Err(source) => Err(RemoteError::Ptrace {
                op: "waitpid",
                pid,
                source,
            }),
        }
    }

    /// Whether the target still exists. Reaps the exit status if it has exited.
    fn target_alive(&mut self) -> bool {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => {
                self.state = SessionState::Detached;
                false
            }
            Ok(WaitStatus::Stopped(_, signal)) => {
                self.pending_signals.push(signal);
                true
            }
            _ => signal::kill(self.pid, None).is_ok(),
        }
    }

    /// Read one word of the stopped target's memory.
    pub fn read_word(&mut self, address: u64) -> Result<u64, RemoteError> {
        self.expect_state("read memory of", SessionState::Stopped)?;
        Ok(self.mem.read_u64(address)?)
    }

    /// Capture the target's stack with the unwinder engine.
    pub fn capture_unwind_library(
        &mut self,
        options: &CaptureOptions,
    ) -> Result<StackTrace, RemoteError> {
        self.capture(CaptureMethod::RemoteUnwindLibrary, options)
    }

    /// Capture the target's stack by CFI stepping alone.
    pub fn capture_debug_info(&mut self, options: &CaptureOptions) -> Result<StackTrace, RemoteError> {
        self.capture(CaptureMethod::RemoteDebugInfo, options)
    }

    fn capture(
        &mut self,
        method: CaptureMethod,
        options: &CaptureOptions,
    ) -> Result<StackTrace, RemoteError> {
        self.expect_state("capture", SessionState::Stopped)?;
        self.state = SessionState::Capturing;
        let result = self.capture_stopped(method, options);
        if self.state == SessionState::Capturing {
            self.state = SessionState::Stopped;
        }
        result
    }

    fn capture_stopped(
        &mut self,
        method: CaptureMethod,
        options: &CaptureOptions,
    ) -> Result<StackTrace, RemoteError> {
        let pid = self.pid();
        let (pc, regs) = match read_registers(self.pid) {
            Ok(regs) => regs,
            Err(source) => {
                let error = RemoteError::Ptrace {
                    op: "read registers",
                    pid,
                    source,
                };
                return Err(self.exited_or(error));
            }
        };
        let modules = match maps::load_modules(Some(pid)) {
            Ok(modules) => modules,
            Err(e) => return Err(self.exited_or(RemoteError::Modules(e))),
        };
        log::debug!("{method} of {pid} at 0x{pc:x}, {} modules", modules.len());

        let mut trace = TraceBuilder::new(options.max_depth);
        let mem = &mut self.mem;
        let mut read_stack = |address: u64| {
            mem.read_u64(address).map_err(|e| log::trace!("{e}"))
        };

        match method {
            CaptureMethod::RemoteDebugInfo => {
                let stop_reason = walk_debug_info(pc, regs, &modules, &mut trace, &mut read_stack);
                self.finish(method, trace, stop_reason, &modules, options)
            }
            _ => {
                let unwinder: Unwinder<Mmap, ArchNative> = Unwinder::new(modules);
                let mut cache = Cache::new();
                let stop_reason = unwinder
                    .iter_frames(pc, regs, &mut cache, &mut read_stack)
                    .collect_into(&mut trace, false);
                self.finish(method, trace, stop_reason, unwinder.modules(), options)
            }
        }
    }

    fn finish(
        &mut self,
        method: CaptureMethod,
        trace: TraceBuilder,
        stop_reason: StopReason,
        modules: &ModuleMap<Mmap>,
        options: &CaptureOptions,
    ) -> Result<StackTrace, RemoteError> {
        let pid = self.pid();
        let mut frames = trace.into_frames();
        if options.symbolicate {
            symbolicate(&mut frames, modules);
        }
        if stop_reason == StopReason::StackReadFailed && !self.target_alive() {
            return Err(RemoteError::TargetExited {
                pid,
                partial: frames,
            });
        }
        log::debug!("{method} of {pid}: {} frames, {stop_reason:?}", frames.len());
        Ok(StackTrace::new(method, Target::Process(pid), frames, stop_reason))
    }

    /// `error`, unless it was caused by the target going away.
    fn exited_or(&mut self, error: RemoteError) -> RemoteError {
        if self.target_alive() {
            error
        } else {
            RemoteError::TargetExited {
                pid: self.pid(),
                partial: Vec::new(),
            }
        }
    }

    /// Detach and let the target continue.
    pub fn detach(mut self) -> Result<(), RemoteError> {
        self.detach_inner()
    }

    fn detach_inner(&mut self) -> Result<(), RemoteError> {
        let attaching = match self.state {
            SessionState::Attaching => true,
            SessionState::Stopped | SessionState::Capturing => false,
            state => {
                return Err(RemoteError::InvalidState {
                    operation: "detach",
                    state,
                })
            }
        };
        self.state = SessionState::Detached;
        let pid = self.pid();
        let mut result = ptrace::detach(self.pid, self.pending_signals.first().copied());
        if attaching && result == Err(Errno::ESRCH) && signal::kill(self.pid, None).is_ok() {
            // PTRACE_DETACH needs a stopped tracee and the attach stop is still queued.
            log::debug!("Waiting for {pid} to stop before detaching");
            result = loop {
                match self.poll_attach_stop(WaitPidFlag::empty())? {
                    AttachStop::Stopped => {
                        break ptrace::detach(self.pid, self.pending_signals.first().copied())
                    }
                    AttachStop::Exited => break Ok(()),
                    AttachStop::Pending => {}
                }
            };
        }
        let result = match result {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) if signal::kill(self.pid, None).is_err() => Ok(()),
            Err(source) => Err(RemoteError::Ptrace {
                op: "PTRACE_DETACH",
                pid,
                source,
            }),
        };
        let target = self.pid;
        for signal in std::mem::take(&mut self.pending_signals).into_iter().skip(1) {
            if let Err(e) = signal::kill(target, signal) {
                log::warn!("Could not deliver deferred {signal} to {pid}: {e}");
            }
        }
        log::debug!("Detached from {pid}");
        result
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        if matches!(
            self.state,
            SessionState::Attaching | SessionState::Stopped | SessionState::Capturing
        ) {
            if let Err(e) = self.detach_inner() {
                log::warn!("Could not detach from {}: {e}", self.pid);
            }
        }
    }
}

fn walk_debug_info<F>(
    pc: u64,
    mut regs: UnwindRegsNative,
    modules: &ModuleMap<Mmap>,
    trace: &mut TraceBuilder,
    read_stack: &mut F,
) -> StopReason
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    let mut stepper = CfiStepper::<Mmap, ArchNative>::new(modules);
    stepper::walk(pc, false, trace, |address| {
        stepper
            .step(address, &mut regs, read_stack)
            .map_err(|e| {
                log::debug!("CFI stepping stopped at {address:?}: {e}");
                StepError::stop_reason(e)
            })
    })
}

/// The `TracerPid` of `pid`, from `/proc/<pid>/status`.
fn tracer_pid(pid: i32) -> Option<i32> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_tracer_pid(&status)
}

fn parse_tracer_pid(status: &str) -> Option<i32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}
