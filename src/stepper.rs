use std::marker::PhantomData;
use std::ops::Deref;

use gimli::UnwindContext;

use crate::arch::ArchNative;
use crate::dwarf::{self, CfiError, DwarfUnwinderError, DwarfUnwinding};
use crate::frame::{StopReason, TraceBuilder};
use crate::frame_address::FrameAddress;
use crate::module::ModuleMap;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepError {
    #[error("No module contains the address")]
    NoModule,

    #[error(transparent)]
    Cfi(#[from] CfiError),

    #[error(transparent)]
    Unwind(#[from] DwarfUnwinderError),
}

impl StepError {
    pub fn stop_reason(self) -> StopReason {
        match self {
            StepError::NoModule | StepError::Cfi(CfiError::NotFound) => StopReason::NotFound,
            StepError::Cfi(CfiError::Parse(_)) => StopReason::ParseFailure,
            StepError::Unwind(
                DwarfUnwinderError::CouldNotRecoverReturnAddress
                | DwarfUnwinderError::CouldNotRecoverFramePointer,
            ) => StopReason::StackReadFailed,
            StepError::Unwind(_) => StopReason::ChainCorrupted,
        }
    }
}

/// Unwinds strictly by call frame information. Every step looks up the CFI rule of the
/// current frame and evaluates it in full; there is no cache and no fallback.
pub struct CfiStepper<'m, D: Deref<Target = [u8]>, A: DwarfUnwinding = ArchNative> {
    modules: &'m ModuleMap<D>,
    context: Box<UnwindContext<usize>>,
    _arch: PhantomData<A>,
}

impl<'m, D: Deref<Target = [u8]>, A: DwarfUnwinding> CfiStepper<'m, D, A> {
    pub fn new(modules: &'m ModuleMap<D>) -> Self {
        Self {
            modules,
            context: Box::new(UnwindContext::new()),
            _arch: PhantomData,
        }
    }

    /// Step from the frame at `address` to its caller.
    pub fn step<F>(
        &mut self,
        address: FrameAddress,
        regs: &mut A::UnwindRegs,
        read_stack: &mut F,
    ) -> Result<Option<u64>, StepError>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let module = self
            .modules
            .find(address.address_for_lookup())
            .ok_or(StepError::NoModule)?;
        let rule = dwarf::lookup::<A, D>(module, address, &mut self.context)?;
        log::trace!("{address:?} in {}: {rule:?}", module.path());
        Ok(A::exec_rule(&rule, regs, address, read_stack)?)
    }
}

/// Drive `step` from the frame at `pc` until the stack ends, a step fails, or the trace
/// is full. With `skip_first`, the frame at `pc` itself is not recorded.
pub(crate) fn walk<S>(pc: u64, skip_first: bool, trace: &mut TraceBuilder, mut step: S) -> StopReason
where
    S: FnMut(FrameAddress) -> Result<Option<u64>, StopReason>,
{
    let mut address = FrameAddress::InstructionPointer(pc);
    if !skip_first && !trace.push(address) {
        return StopReason::DepthLimit;
    }
    loop {
        match step(address) {
            Ok(Some(return_address)) => match FrameAddress::from_return_address(return_address) {
                Some(next) => {
                    if !trace.push(next) {
                        return StopReason::DepthLimit;
                    }
                    address = next;
                }
                None => return StopReason::EndOfStack,
            },
            Ok(None) => return StopReason::EndOfStack,
            Err(reason) => return reason,
        }
    }
}
