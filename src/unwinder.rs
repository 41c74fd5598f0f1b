use std::marker::PhantomData;
use std::ops::Deref;

use fallible_iterator::FallibleIterator;

use crate::arch::ArchNative;
use crate::cache::Cache;
use crate::dwarf::{self, DwarfUnwinding};
use crate::error::Error;
use crate::frame::{StopReason, TraceBuilder};
use crate::frame_address::FrameAddress;
use crate::module::ModuleMap;
use crate::rule_cache::CacheResult;
use crate::unwind_rule::UnwindRule;

/// The unwinder engine. It owns the module map of one process and unwinds one frame at a
/// time, picking the rule source per frame: a cached compact rule, the module's CFI, or
/// the frame-pointer rule when no CFI covers the address.
pub struct Unwinder<D: Deref<Target = [u8]>, A: DwarfUnwinding = ArchNative> {
    modules: ModuleMap<D>,
    _arch: PhantomData<A>,
}

impl<D: Deref<Target = [u8]>, A: DwarfUnwinding> Unwinder<D, A> {
    pub fn new(modules: ModuleMap<D>) -> Self {
        Self {
            modules,
            _arch: PhantomData,
        }
    }

    pub fn modules(&self) -> &ModuleMap<D> {
        &self.modules
    }

    /// Unwind a single frame. `regs` must hold the register values for the frame at
    /// `address`, and are turned into the caller's values on success.
    ///
    /// Returns the caller's return address, or `None` if there is no caller.
    pub fn unwind_frame<F>(
        &self,
        address: FrameAddress,
        regs: &mut A::UnwindRegs,
        cache: &mut Cache<A::UnwindRule>,
        read_stack: &mut F,
    ) -> Result<Option<u64>, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let is_first_frame = !address.is_return_address();
        let lookup_address = address.address_for_lookup();
        let handle = match cache.rule_cache.try_unwind(
            lookup_address,
            self.modules.generation(),
            is_first_frame,
            regs,
            read_stack,
        ) {
            CacheResult::Hit(result) => return result,
            CacheResult::Miss(handle) => handle,
        };

        let fallback = A::UnwindRule::fallback_rule();
        let Some(module) = self.modules.find(lookup_address) else {
            log::trace!("No module for {address:?}, using the frame pointer");
            cache.rule_cache.insert(handle, fallback);
            return fallback.exec(is_first_frame, regs, read_stack);
        };

        let rule = match dwarf::lookup::<A, D>(module, address, &mut cache.gimli_unwind_context)
        {
            Ok(rule) => rule,
            Err(err) => {
                log::debug!(
                    "No CFI for {address:?} in {}: {err}, using the frame pointer",
                    module.path()
                );
                cache.rule_cache.insert(handle, fallback);
                return fallback.exec(is_first_frame, regs, read_stack);
            }
        };

        match A::translate_rule(&rule) {
            Ok(unwind_rule) => {
                log::trace!("{address:?}: {unwind_rule:?}");
                cache.rule_cache.insert(handle, unwind_rule);
                unwind_rule.exec(is_first_frame, regs, read_stack)
            }
            Err(err) => {
                log::trace!("{address:?}: uncacheable rule ({err:?}), evaluating {rule:?}");
                match A::exec_rule(&rule, regs, address, read_stack) {
                    Ok(return_address) => Ok(return_address),
                    Err(err) => {
                        log::debug!(
                            "CFI evaluation failed for {address:?}: {err}, using the frame pointer"
                        );
                        fallback.exec(is_first_frame, regs, read_stack)
                    }
                }
            }
        }
    }

    /// Iterate the frames of a stack, starting with the frame at `pc`.
    ///
    /// The first item is `FrameAddress::InstructionPointer(pc)`, all later items are
    /// return addresses.
    pub fn iter_frames<'u, 'c, 'r, F>(
        &'u self,
        pc: u64,
        regs: A::UnwindRegs,
        cache: &'c mut Cache<A::UnwindRule>,
        read_stack: &'r mut F,
    ) -> UnwindIterator<'u, 'c, 'r, D, A, F>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        UnwindIterator::new(self, pc, regs, cache, read_stack)
    }
}

enum UnwindIteratorState {
    Initial(u64),
    Unwinding(FrameAddress),
    Done,
}

/// An iterator for unwinding the entire stack, starting from the initial register
/// values.
///
/// The first yielded frame is the instruction pointer. Subsequent addresses are return
/// addresses.
///
/// This iterator attempts to detect if stack unwinding completed successfully, or if
/// the stack was truncated prematurely. If it thinks that it successfully found the
/// root function, it will complete with `Ok(None)`, otherwise it will complete with
/// `Err(...)`.
pub struct UnwindIterator<'u, 'c, 'r, D: Deref<Target = [u8]>, A: DwarfUnwinding, F>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    unwinder: &'u Unwinder<D, A>,
    state: UnwindIteratorState,
    regs: A::UnwindRegs,
    cache: &'c mut Cache<A::UnwindRule>,
    read_stack: &'r mut F,
}

impl<'u, 'c, 'r, D, A, F> UnwindIterator<'u, 'c, 'r, D, A, F>
where
    D: Deref<Target = [u8]>,
    A: DwarfUnwinding,
    F: FnMut(u64) -> Result<u64, ()>,
{
    pub fn new(
        unwinder: &'u Unwinder<D, A>,
        pc: u64,
        regs: A::UnwindRegs,
        cache: &'c mut Cache<A::UnwindRule>,
        read_stack: &'r mut F,
    ) -> Self {
        Self {
            unwinder,
            state: UnwindIteratorState::Initial(pc),
            regs,
            cache,
            read_stack,
        }
    }

    /// Yield the next frame in the stack.
    ///
    /// The first frame is `Ok(Some(FrameAddress::InstructionPointer(...)))`.
    /// Subsequent frames are `Ok(Some(FrameAddress::ReturnAddress(...)))`.
    ///
    /// If a root function has been reached, this iterator completes with `Ok(None)`.
    /// Otherwise it completes with `Err(...)`, usually indicating that a certain stack
    /// address could not be read.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<FrameAddress>, Error> {
        let next = match self.state {
            UnwindIteratorState::Initial(pc) => {
                self.state = UnwindIteratorState::Unwinding(FrameAddress::InstructionPointer(pc));
                return Ok(Some(FrameAddress::InstructionPointer(pc)));
            }
            UnwindIteratorState::Unwinding(address) => {
                self.unwinder
                    .unwind_frame(address, &mut self.regs, self.cache, self.read_stack)
            }
            UnwindIteratorState::Done => return Ok(None),
        };
        match next {
            Ok(Some(return_address)) => {
                let Some(return_address) = FrameAddress::from_return_address(return_address)
                else {
                    self.state = UnwindIteratorState::Done;
                    return Ok(None);
                };
                self.state = UnwindIteratorState::Unwinding(return_address);
                Ok(Some(return_address))
            }
            Ok(None) => {
                self.state = UnwindIteratorState::Done;
                Ok(None)
            }
            Err(e) => {
                self.state = UnwindIteratorState::Done;
                Err(e)
            }
        }
    }

    /// Drain the iterator into `trace`. With `skip_first`, the frame at the initial
    /// instruction pointer is not recorded.
    pub(crate) fn collect_into(&mut self, trace: &mut TraceBuilder, skip_first: bool) -> StopReason {
        if skip_first {
            if let UnwindIteratorState::Initial(pc) = self.state {
                self.state = UnwindIteratorState::Unwinding(FrameAddress::InstructionPointer(pc));
            }
        }
        loop {
            match self.next() {
                Ok(Some(address)) => {
                    if !trace.push(address) {
                        return StopReason::DepthLimit;
                    }
                }
                Ok(None) => return StopReason::EndOfStack,
                Err(e) => {
                    log::debug!("Unwinding stopped: {e}");
                    return e.stop_reason();
                }
            }
        }
    }
}

impl<'u, 'c, 'r, D, A, F> FallibleIterator for UnwindIterator<'u, 'c, 'r, D, A, F>
where
    D: Deref<Target = [u8]>,
    A: DwarfUnwinding,
    F: FnMut(u64) -> Result<u64, ()>,
{
    type Item = FrameAddress;
    type Error = Error;

    fn next(&mut self) -> Result<Option<FrameAddress>, Error> {
        self.next()
    }
}

#[cfg(test)]
mod test {
    use gimli::write::CallFrameInstruction;
    use gimli::X86_64;

    use super::*;
    use crate::arch::ArchX86_64;
    use crate::dwarf::test_utils::{eh_frame, TestFunction};
    use crate::module::{Module, ModuleSections, SectionInfo};
    use crate::x86_64::UnwindRegsX86_64;

    /// A module at 0x10000 whose text starts at SVMA 0x1000, with:
    /// - 0x1000..0x1040 a function with a standard frame pointer prologue
    /// - 0x1100..0x1120 a function that allocates 0x18 bytes without a frame pointer
    /// - 0x1200..0x1210 the entry point
    fn unwinder() -> Unwinder<Vec<u8>, ArchX86_64> {
        let data = eh_frame(
            X86_64::RA,
            vec![
                CallFrameInstruction::Cfa(X86_64::RSP, 8),
                CallFrameInstruction::Offset(X86_64::RA, -8),
            ],
            vec![
                TestFunction {
                    start: 0x1000,
                    len: 0x40,
                    instructions: vec![
                        (1, CallFrameInstruction::CfaOffset(16)),
                        (1, CallFrameInstruction::Offset(X86_64::RBP, -16)),
                        (4, CallFrameInstruction::CfaRegister(X86_64::RBP)),
                    ],
                },
                TestFunction {
                    start: 0x1100,
                    len: 0x20,
                    instructions: vec![(4, CallFrameInstruction::CfaOffset(0x20))],
                },
                TestFunction {
                    start: 0x1200,
                    len: 0x10,
                    instructions: vec![(0, CallFrameInstruction::Undefined(X86_64::RA))],
                },
            ],
        );
        let len = data.len();
        let sections = ModuleSections {
            eh_frame: Some(SectionInfo {
                svma: 0x3000,
                file_range: 0..len,
            }),
            ..Default::default()
        };
        let mut modules = ModuleMap::new();
        modules.add_module(Module::from_sections(
            "test".to_string(),
            0x10000..0x20000,
            0x10000 - 0x1000,
            data,
            sections,
        ));
        Unwinder::new(modules)
    }

    #[test]
    fn walk_mixed_frames() {
        // Stack, from sp = 0x100 upwards:
        //   0x100..0x118: locals of the function at 0x1100 (leaf, innermost)
        //   0x118: return address into 0x1000's function
        //   0x120: saved rbp of 0x1000's function's caller = 0x0 (entry point has no fp)
        //   0x128: return address into the entry point
        let mut stack = vec![0u64; 0x40];
        stack[0x118 / 8] = 0x10010;
        stack[0x120 / 8] = 0;
        stack[0x128 / 8] = 0x10208;
        let mut read_stack = |addr: u64| stack.get((addr / 8) as usize).copied().ok_or(());

        let unwinder = unwinder();
        let mut cache = Cache::new();
        // rbp of the frame-pointer function points at its saved rbp slot.
        let regs = UnwindRegsX86_64::new(0x10108, 0x100, 0x120);
        let frames: Vec<FrameAddress> = unwinder
            .iter_frames(0x10108, regs, &mut cache, &mut read_stack)
            .collect()
            .unwrap();
        assert_eq!(
            frames,
            vec![
                FrameAddress::InstructionPointer(0x10108),
                FrameAddress::ReturnAddress(0x10010),
                FrameAddress::ReturnAddress(0x10208),
            ]
        );
    }

    #[test]
    fn fallback_outside_modules() {
        // A frame pointer chain through code that no module covers.
        let mut stack = vec![0u64; 0x40];
        stack[0x20 / 8] = 0x40;
        stack[0x28 / 8] = 0x90_0100;
        stack[0x40 / 8] = 0;
        stack[0x48 / 8] = 0x90_0200;
        let mut read_stack = |addr: u64| stack.get((addr / 8) as usize).copied().ok_or(());

        let unwinder = unwinder();
        let mut cache = Cache::new();
        let regs = UnwindRegsX86_64::new(0x90_0000, 0x10, 0x20);
        let mut iter = unwinder.iter_frames(0x90_0000, regs, &mut cache, &mut read_stack);
        assert_eq!(iter.next(), Ok(Some(FrameAddress::InstructionPointer(0x90_0000))));
        assert_eq!(iter.next(), Ok(Some(FrameAddress::ReturnAddress(0x90_0100))));
        assert_eq!(iter.next(), Ok(Some(FrameAddress::ReturnAddress(0x90_0200))));
        assert_eq!(iter.next(), Ok(None));
        assert_eq!(iter.next(), Ok(None));
    }

    #[test]
    fn unreadable_stack_ends_with_error() {
        let mut read_stack = |_| Err(());
        let unwinder = unwinder();
        let mut cache = Cache::new();
        let regs = UnwindRegsX86_64::new(0x10108, 0x100, 0x120);
        let mut iter = unwinder.iter_frames(0x10108, regs, &mut cache, &mut read_stack);
        assert!(iter.next().unwrap().is_some());
        assert_eq!(iter.next(), Err(Error::CouldNotReadStack(0x118)));
        assert_eq!(iter.next(), Ok(None));
    }

    #[test]
    fn collect_into_trace() {
        let mut stack = vec![0u64; 0x40];
        stack[0x118 / 8] = 0x10010;
        stack[0x128 / 8] = 0x10208;
        let mut read_stack = |addr: u64| stack.get((addr / 8) as usize).copied().ok_or(());
        let unwinder = unwinder();
        let mut cache = Cache::new();
        let regs = UnwindRegsX86_64::new(0x10108, 0x100, 0x120);

        let mut trace = TraceBuilder::new(10);
        let reason = unwinder
            .iter_frames(0x10108, regs, &mut cache, &mut read_stack)
            .collect_into(&mut trace, true);
        assert_eq!(reason, StopReason::EndOfStack);
        let addresses: Vec<u64> = trace.into_frames().iter().map(|f| f.address()).collect();
        assert_eq!(addresses, vec![0x10010, 0x10208]);

        let mut trace = TraceBuilder::new(2);
        let reason = unwinder
            .iter_frames(0x10108, regs, &mut cache, &mut read_stack)
            .collect_into(&mut trace, false);
        assert_eq!(reason, StopReason::DepthLimit);
        assert_eq!(trace.len(), 2);

        let mut unreadable = |_| Err(());
        let mut trace = TraceBuilder::new(10);
        let reason = unwinder
            .iter_frames(0x10108, regs, &mut cache, &mut unreadable)
            .collect_into(&mut trace, false);
        assert_eq!(reason, StopReason::StackReadFailed);
        assert_eq!(trace.len(), 1);
    }

    #[test]
    fn rules_are_cached() {
        let mut stack = vec![0u64; 0x40];
        stack[0x118 / 8] = 0x10010;
        stack[0x128 / 8] = 0x10208;
        let mut read_stack = |addr: u64| stack.get((addr / 8) as usize).copied().ok_or(());
        let unwinder = unwinder();
        let mut cache = Cache::new();
        for _ in 0..3 {
            let regs = UnwindRegsX86_64::new(0x10108, 0x100, 0x120);
            let count = unwinder
                .iter_frames(0x10108, regs, &mut cache, &mut read_stack)
                .count()
                .unwrap();
            assert_eq!(count, 3);
        }
        // The leaf and frame-pointer rules are cacheable, the entry point's is not.
        assert_eq!(cache.stats().hits(), 4);
    }
}
