//! Capturing the stack of the calling thread.
//!
//! Every entry point excludes its own frame: the first frame of a trace is the return
//! address into the function that called the entry point.

use std::ops::Range;

use memmap2::Mmap;

use crate::arch::{Arch, ArchNative, UnwindRegsNative};
use crate::cache::Cache;
use crate::frame::{CaptureMethod, StackTrace, StopReason, Target, TraceBuilder};
use crate::frame_address::FrameAddress;
use crate::maps;
use crate::module::ModuleMap;
use crate::options::CaptureOptions;
use crate::stepper::{self, CfiStepper, StepError};
use crate::symbols::symbolicate;
use crate::unwind_rule::UnwindRule;
use crate::unwinder::Unwinder;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        use crate::x86_64::UnwindRuleX86_64 as UnwindRuleNative;

        /// Read the instruction pointer, stack pointer and frame pointer of the
        /// enclosing function.
        macro_rules! capture_registers {
            () => {{
                let ip: u64;
                let sp: u64;
                let bp: u64;
                unsafe {
                    std::arch::asm!(
                        "lea {ip}, [rip]",
                        "mov {sp}, rsp",
                        "mov {bp}, rbp",
                        ip = out(reg) ip,
                        sp = out(reg) sp,
                        bp = out(reg) bp,
                        options(nomem, nostack, preserves_flags)
                    );
                }
                (ip, UnwindRegsNative::new(ip, sp, bp))
            }};
        }
    } else if #[cfg(target_arch = "aarch64")] {
        use crate::aarch64::UnwindRuleAarch64 as UnwindRuleNative;

        /// Read the program counter, stack pointer, frame pointer and link register of
        /// the enclosing function.
        macro_rules! capture_registers {
            () => {{
                let pc: u64;
                let sp: u64;
                let fp: u64;
                let lr: u64;
                unsafe {
                    std::arch::asm!(
                        "mov {lr}, x30",
                        "mov {fp}, x29",
                        "mov {sp}, sp",
                        "adr {pc}, .",
                        pc = out(reg) pc,
                        sp = out(reg) sp,
                        fp = out(reg) fp,
                        lr = out(reg) lr,
                        options(nomem, nostack, preserves_flags)
                    );
                }
                (pc, UnwindRegsNative::new(lr, sp, fp))
            }};
        }
    }
}

/// The bounds of the calling thread's stack.
fn current_stack_bounds(sp: u64) -> Option<Range<u64>> {
    if let Some(bounds) = pthread_stack_bounds() {
        if bounds.contains(&sp) {
            return Some(bounds);
        }
    }
    // Fall back to the mapping which contains the stack pointer.
    let mappings = maps::read_maps(None).ok()?;
    mappings
        .into_iter()
        .find(|m| m.start <= sp && sp < m.end)
        .map(|m| m.start..m.end)
}

fn pthread_stack_bounds() -> Option<Range<u64>> {
    // SAFETY: attr is initialized by pthread_getattr_np before use and destroyed after.
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut stack_addr: *mut libc::c_void = std::ptr::null_mut();
        let mut stack_size: libc::size_t = 0;
        let ret = libc::pthread_attr_getstack(&attr, &mut stack_addr, &mut stack_size);
        libc::pthread_attr_destroy(&mut attr);
        if ret != 0 {
            return None;
        }
        let start = stack_addr as u64;
        Some(start..start.checked_add(stack_size as u64)?)
    }
}

/// Returns a reader for aligned words of the given stack. Reads outside the stack fail.
fn stack_reader(bounds: Option<Range<u64>>) -> impl FnMut(u64) -> Result<u64, ()> {
    move |address| {
        let bounds = bounds.as_ref().ok_or(())?;
        let end = address.checked_add(8).ok_or(())?;
        if address % 8 != 0 || address < bounds.start || end > bounds.end {
            return Err(());
        }
        // SAFETY: the address is aligned and lies within the current thread's stack,
        // which stays mapped while the thread runs.
        Ok(unsafe { (address as *const u64).read() })
    }
}

fn load_own_modules() -> ModuleMap<Mmap> {
    match maps::load_modules(None) {
        Ok(modules) => modules,
        Err(e) => {
            log::warn!("Could not list own modules: {e}");
            ModuleMap::new()
        }
    }
}

fn finish(
    method: CaptureMethod,
    trace: TraceBuilder,
    stop_reason: StopReason,
    modules: Option<&ModuleMap<Mmap>>,
    options: &CaptureOptions,
) -> StackTrace {
    let mut frames = trace.into_frames();
    if options.symbolicate {
        match modules {
            Some(modules) => symbolicate(&mut frames, modules),
            None => symbolicate(&mut frames, &load_own_modules()),
        }
    }
    log::debug!("{method}: {} frames, {stop_reason:?}", frames.len());
    StackTrace::new(method, Target::SelfProcess, frames, stop_reason)
}

/// Capture with the `backtrace` crate.
#[inline(never)]
pub fn capture_builtin_backtrace(options: &CaptureOptions) -> StackTrace {
    let this_fn = capture_builtin_backtrace as usize;
    let mut addresses = Vec::new();
    let mut found_self = false;
    backtrace::trace(|frame| {
        if !found_self {
            // Frames up to and including this function are skipped.
            found_self = frame.symbol_address() as usize == this_fn;
            return true;
        }
        let ip = frame.ip() as u64;
        if ip == 0 {
            return false;
        }
        addresses.push(ip);
        // One frame beyond the limit tells a full stack from a truncated one.
        addresses.len() <= options.max_depth
    });
    if !found_self {
        log::warn!("The capture function was not found in the backtrace");
    }

    let mut trace = TraceBuilder::new(options.max_depth);
    let mut stop_reason = StopReason::EndOfStack;
    for address in addresses {
        if !trace.push(FrameAddress::ReturnAddress(address)) {
            stop_reason = StopReason::DepthLimit;
            break;
        }
    }
    finish(
        CaptureMethod::BuiltinBacktrace,
        trace,
        stop_reason,
        None,
        options,
    )
}

/// Capture with the unwinder engine.
#[inline(never)]
pub fn capture_unwind_library(options: &CaptureOptions) -> StackTrace {
    let (pc, regs) = capture_registers!();
    let trace = unwind_library_from(pc, regs, options);
    // The captured registers describe this frame, so it must outlive the walk.
    std::hint::black_box(pc);
    trace
}

fn unwind_library_from(pc: u64, regs: UnwindRegsNative, options: &CaptureOptions) -> StackTrace {
    let unwinder: Unwinder<Mmap, ArchNative> = Unwinder::new(load_own_modules());
    let mut cache = Cache::new();
    let mut read_stack = stack_reader(current_stack_bounds(ArchNative::stack_pointer(&regs)));
    let mut trace = TraceBuilder::new(options.max_depth);

    let stop_reason = unwinder
        .iter_frames(pc, regs, &mut cache, &mut read_stack)
        .collect_into(&mut trace, true);
    finish(
        CaptureMethod::UnwindLibrary,
        trace,
        stop_reason,
        Some(unwinder.modules()),
        options,
    )
}

/// Capture by evaluating call frame information for every frame.
#[inline(never)]
pub fn capture_debug_info(options: &CaptureOptions) -> StackTrace {
    let (pc, regs) = capture_registers!();
    let trace = debug_info_from(pc, regs, options);
    // The captured registers describe this frame, so it must outlive the walk.
    std::hint::black_box(pc);
    trace
}

fn debug_info_from(pc: u64, mut regs: UnwindRegsNative, options: &CaptureOptions) -> StackTrace {
    let modules = load_own_modules();
    let mut stepper = CfiStepper::<Mmap, ArchNative>::new(&modules);
    let mut read_stack = stack_reader(current_stack_bounds(ArchNative::stack_pointer(&regs)));
    let mut trace = TraceBuilder::new(options.max_depth);
    let stop_reason = stepper::walk(pc, true, &mut trace, |address| {
        stepper
            .step(address, &mut regs, &mut read_stack)
            .map_err(|e| {
                log::debug!("CFI stepping stopped at {address:?}: {e}");
                StepError::stop_reason(e)
            })
    });
    finish(
        CaptureMethod::DebugInfo,
        trace,
        stop_reason,
        Some(&modules),
        options,
    )
}

/// Capture by following the frame pointer chain.
#[inline(never)]
pub fn capture_frame_pointer(options: &CaptureOptions) -> StackTrace {
    let (pc, regs) = capture_registers!();
    let trace = frame_pointer_from(pc, regs, options);
    // The captured registers describe this frame, so it must outlive the walk.
    std::hint::black_box(pc);
    trace
}

fn frame_pointer_from(pc: u64, mut regs: UnwindRegsNative, options: &CaptureOptions) -> StackTrace {
    let rule = UnwindRuleNative::fallback_rule();
    let mut read_stack = stack_reader(current_stack_bounds(ArchNative::stack_pointer(&regs)));
    let mut trace = TraceBuilder::new(options.max_depth);
    let stop_reason = stepper::walk(pc, true, &mut trace, |address| {
        rule.exec(!address.is_return_address(), &mut regs, &mut read_stack)
            .map_err(|e| {
                log::debug!("Frame pointer chain ended at {address:?}: {e}");
                StopReason::ChainCorrupted
            })
    });
    finish(
        CaptureMethod::FramePointer,
        trace,
        stop_reason,
        None,
        options,
    )
}
