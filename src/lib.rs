//! Stack unwinding for Linux on x86_64 and aarch64, with several interchangeable
//! strategies.
//!
//! The calling thread's stack can be captured with:
//!
//!  - the `backtrace` crate ([`local::capture_builtin_backtrace`]),
//!  - the [`Unwinder`] engine, which caches compact rules derived from CFI and falls
//!    back to the frame pointer ([`local::capture_unwind_library`]),
//!  - strict CFI stepping ([`local::capture_debug_info`]),
//!  - a plain frame pointer walk ([`local::capture_frame_pointer`]).
//!
//! Another process can be captured through ptrace with the engine
//! ([`remote::capture_unwind_library`]) or by CFI stepping
//! ([`remote::capture_debug_info`]).
//!
//! [`capture`] dispatches over all six. Every trace carries the [`StopReason`] that
//! ended the walk; frames are symbolicated from the ELF symbol tables of the loaded
//! modules.
//!
//! ```no_run
//! use stackwalk::{capture, CaptureMethod, CaptureOptions, Target};
//!
//! let options = CaptureOptions::from_env();
//! let trace = capture(CaptureMethod::DebugInfo, Target::SelfProcess, &options).unwrap();
//! println!("{trace}");
//! ```

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "aarch64")
)))]
compile_error!("stackwalk supports Linux on x86_64 and aarch64 only");

mod arch;
mod cache;
mod display_utils;
mod dwarf;
mod error;
mod frame;
mod frame_address;
mod module;
mod options;
mod rule_cache;
mod stepper;
mod unwind_rule;
mod unwinder;

pub mod aarch64;
pub mod local;
pub mod maps;
pub mod remote;
pub mod symbols;
pub mod x86_64;

pub use arch::{Arch, ArchAarch64, ArchNative, ArchX86_64, UnwindRegsNative};
pub use cache::{Cache, CacheStats};
pub use dwarf::{
    CfaLocation, CfiError, ConversionError, DwarfCfiIndex, DwarfRule, DwarfUnwindRegs,
    DwarfUnwinderError, DwarfUnwinding, RegisterLocation,
};
pub use error::{CaptureError, Error, ModuleError};
pub use frame::{CaptureMethod, Frame, ModuleRef, StackTrace, StopReason, Symbol, Target};
pub use frame_address::FrameAddress;
pub use module::{Module, ModuleMap, ModuleSections, SectionInfo};
pub use options::{CaptureOptions, ATTACH_TIMEOUT_ENV, MAX_DEPTH_ENV};
pub use remote::RemoteError;
pub use stepper::{CfiStepper, StepError};
pub use unwind_rule::UnwindRule;
pub use unwinder::{UnwindIterator, Unwinder};

type LocalEntryPoint = fn(&CaptureOptions) -> StackTrace;
type RemoteEntryPoint = fn(i32, &CaptureOptions) -> Result<StackTrace, RemoteError>;

fn local_entry_point(method: CaptureMethod) -> Option<LocalEntryPoint> {
    Some(match method {
        CaptureMethod::BuiltinBacktrace => local::capture_builtin_backtrace,
        CaptureMethod::UnwindLibrary => local::capture_unwind_library,
        CaptureMethod::DebugInfo => local::capture_debug_info,
        CaptureMethod::FramePointer => local::capture_frame_pointer,
        CaptureMethod::RemoteUnwindLibrary | CaptureMethod::RemoteDebugInfo => return None,
    })
}

fn remote_entry_point(method: CaptureMethod) -> Option<RemoteEntryPoint> {
    match method {
        CaptureMethod::RemoteUnwindLibrary => Some(remote::capture_unwind_library),
        CaptureMethod::RemoteDebugInfo => Some(remote::capture_debug_info),
        _ => None,
    }
}

/// Capture a stack trace of `target` with `method`.
///
/// Local methods only capture [`Target::SelfProcess`] and remote methods only
/// [`Target::Process`]; other combinations fail with
/// [`CaptureError::UnsupportedTarget`].
///
/// For local captures, the first frame is the return address into this function. All
/// local methods are called from the same call site, so their traces of the same stack
/// start with the same address.
#[inline(never)]
pub fn capture(
    method: CaptureMethod,
    target: Target,
    options: &CaptureOptions,
) -> Result<StackTrace, CaptureError> {
    let unsupported = || CaptureError::UnsupportedTarget { method, target };
    match target {
        Target::SelfProcess => {
            let entry_point = local_entry_point(method).ok_or_else(unsupported)?;
            Ok(std::hint::black_box(entry_point)(options))
        }
        Target::Process(pid) => {
            let entry_point = remote_entry_point(method).ok_or_else(unsupported)?;
            Ok(entry_point(pid, options)?)
        }
    }
}
