use super::unwindregs::UnwindRegsX86_64;
use crate::error::Error;
use crate::unwind_rule::UnwindRule;

/// A compact unwind rule for x86_64. `call` pushes the return address, so in every case
/// the caller's return address is the word just below the caller's sp.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindRuleX86_64 {
    /// sp += 8 * sp_offset_by_8, bp unchanged.
    OffsetSp { sp_offset_by_8: u16 },
    /// sp += 8 * sp_offset_by_8, bp restored from the old sp + 8 * bp_storage_offset_from_sp_by_8.
    OffsetSpAndRestoreBp {
        sp_offset_by_8: u16,
        bp_storage_offset_from_sp_by_8: i16,
    },
    /// The frame record at bp holds the caller's bp and, above it, the return address.
    UseFramePointer,
}

fn read<F>(read_stack: &mut F, address: u64) -> Result<u64, Error>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    read_stack(address).map_err(|_| Error::CouldNotReadStack(address))
}

fn offset_sp(sp: u64, sp_offset_by_8: u16) -> Result<u64, Error> {
    sp.checked_add(u64::from(sp_offset_by_8) * 8)
        .ok_or(Error::IntegerOverflow)
}

/// Follow one link of the frame pointer chain. Returns the caller's sp and bp, or
/// `None` at the end of the chain.
fn follow_frame_record<F>(
    sp: u64,
    bp: u64,
    read_stack: &mut F,
) -> Result<Option<(u64, u64)>, Error>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    // Threads start with bp = 0, which terminates the chain.
    if bp == 0 {
        return Ok(None);
    }
    if bp % 8 != 0 {
        return Err(Error::MisalignedFramePointer(bp));
    }
    // [bp] = caller's bp, [bp + 8] = return address.
    let caller_sp = bp.checked_add(16).ok_or(Error::IntegerOverflow)?;
    if caller_sp <= sp {
        return Err(Error::FramepointerUnwindingMovedBackwards);
    }
    // The caller's bp is not validated: code built without frame pointers uses bp as
    // a general purpose register.
    let caller_bp = read(read_stack, bp)?;
    Ok(Some((caller_sp, caller_bp)))
}

impl UnwindRule for UnwindRuleX86_64 {
    type UnwindRegs = UnwindRegsX86_64;

    fn fallback_rule() -> Self {
        UnwindRuleX86_64::UseFramePointer
    }

    fn exec<F>(
        self,
        is_first_frame: bool,
        regs: &mut UnwindRegsX86_64,
        read_stack: &mut F,
    ) -> Result<Option<u64>, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let sp = regs.sp();
        let (caller_sp, caller_bp) = match self {
            UnwindRuleX86_64::OffsetSp { sp_offset_by_8 } => {
                (offset_sp(sp, sp_offset_by_8)?, regs.bp())
            }
            UnwindRuleX86_64::OffsetSpAndRestoreBp {
                sp_offset_by_8,
                bp_storage_offset_from_sp_by_8,
            } => {
                let caller_sp = offset_sp(sp, sp_offset_by_8)?;
                let bp_location =
                    u64::checked_add_signed(sp, i64::from(bp_storage_offset_from_sp_by_8) * 8)
                        .ok_or(Error::IntegerOverflow)?;
                let caller_bp = match read_stack(bp_location) {
                    Ok(bp) => bp,
                    // Inside an epilogue, after `pop rbp`, the saved slot is below sp and
                    // bp already holds the caller's value.
                    Err(()) if is_first_frame && bp_location < sp => regs.bp(),
                    Err(()) => return Err(Error::CouldNotReadStack(bp_location)),
                };
                (caller_sp, caller_bp)
            }
            UnwindRuleX86_64::UseFramePointer => {
                match follow_frame_record(sp, regs.bp(), read_stack)? {
                    Some(caller) => caller,
                    None => return Ok(None),
                }
            }
        };

        let return_address = read(read_stack, caller_sp - 8)?;
        if return_address == 0 {
            return Ok(None);
        }
        if caller_sp == sp && return_address == regs.ip() {
            return Err(Error::DidNotAdvance);
        }
        regs.set_ip(return_address);
        regs.set_sp(caller_sp);
        regs.set_bp(caller_bp);
        Ok(Some(return_address))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// A stack starting at address 0, one word per slot.
    fn reader(stack: &[u64]) -> impl FnMut(u64) -> Result<u64, ()> + '_ {
        move |addr| stack.get((addr / 8) as usize).copied().ok_or(())
    }

    #[test]
    fn leaf_then_frame_pointer_chain() {
        // 0x00: leaf locals, 0x08: return into fp_fn
        // 0x10: fp_fn locals, 0x18: fp_fn's record (caller bp = 0x30), 0x20: return into main
        // 0x28: main locals, 0x30: main's record (bp = 0), 0x38: return into _start
        let stack = [7, 0x5000_1010, 7, 0x30, 0x5000_2020, 7, 0, 0x5000_3030];
        let mut read_stack = reader(&stack);
        let mut regs = UnwindRegsX86_64::new(0x5000_0100, 0x0, 0x18);

        let leaf = UnwindRuleX86_64::OffsetSp { sp_offset_by_8: 2 };
        assert_eq!(leaf.exec(true, &mut regs, &mut read_stack), Ok(Some(0x5000_1010)));
        assert_eq!((regs.sp(), regs.bp()), (0x10, 0x18));

        let fp = UnwindRuleX86_64::UseFramePointer;
        assert_eq!(fp.exec(false, &mut regs, &mut read_stack), Ok(Some(0x5000_2020)));
        assert_eq!((regs.ip(), regs.sp(), regs.bp()), (0x5000_2020, 0x28, 0x30));

        assert_eq!(fp.exec(false, &mut regs, &mut read_stack), Ok(Some(0x5000_3030)));
        assert_eq!((regs.sp(), regs.bp()), (0x40, 0));

        // _start has bp = 0.
        assert_eq!(fp.exec(false, &mut regs, &mut read_stack), Ok(None));
    }

    #[test]
    fn restore_bp_from_the_stack() {
        let stack = [0, 0x38, 0x5000_0500, 0, 0, 0, 0, 0];
        let mut read_stack = reader(&stack);
        let mut regs = UnwindRegsX86_64::new(0x5000_0400, 0x8, 0xdead);
        let rule = UnwindRuleX86_64::OffsetSpAndRestoreBp {
            sp_offset_by_8: 2,
            bp_storage_offset_from_sp_by_8: 0,
        };
        assert_eq!(rule.exec(false, &mut regs, &mut read_stack), Ok(Some(0x5000_0500)));
        assert_eq!((regs.sp(), regs.bp()), (0x18, 0x38));
    }

    #[test]
    fn restore_bp_after_pop_in_first_frame() {
        // The saved bp slot at sp - 8 is not readable; bp is kept.
        let stack = [0x5000_0600];
        let mut read_stack = |addr: u64| if addr == 0x1000 { Ok(stack[0]) } else { Err(()) };
        let rule = UnwindRuleX86_64::OffsetSpAndRestoreBp {
            sp_offset_by_8: 1,
            bp_storage_offset_from_sp_by_8: -1,
        };
        let mut regs = UnwindRegsX86_64::new(0x5000_0400, 0x1000, 0x2000);
        assert_eq!(rule.exec(true, &mut regs, &mut read_stack), Ok(Some(0x5000_0600)));
        assert_eq!(regs.bp(), 0x2000);

        let mut regs = UnwindRegsX86_64::new(0x5000_0400, 0x1000, 0x2000);
        assert_eq!(
            rule.exec(false, &mut regs, &mut read_stack),
            Err(Error::CouldNotReadStack(0xff8))
        );
        // Failed steps leave the registers alone.
        assert_eq!(regs, UnwindRegsX86_64::new(0x5000_0400, 0x1000, 0x2000));
    }

    #[test]
    fn corrupt_chains() {
        let stack = [0, 0, 0x8, 0x5000_0500, 0, 0, 0, 0];
        let mut read_stack = reader(&stack);
        let fp = UnwindRuleX86_64::UseFramePointer;

        let mut regs = UnwindRegsX86_64::new(0x5000_0400, 0x20, 0x8);
        assert_eq!(
            fp.exec(false, &mut regs, &mut read_stack),
            Err(Error::FramepointerUnwindingMovedBackwards)
        );
        let mut regs = UnwindRegsX86_64::new(0x5000_0400, 0x8, 0x13);
        assert_eq!(
            fp.exec(false, &mut regs, &mut read_stack),
            Err(Error::MisalignedFramePointer(0x13))
        );
        let mut regs = UnwindRegsX86_64::new(0x5000_0400, 0x8, 0x1000);
        assert_eq!(
            fp.exec(false, &mut regs, &mut read_stack),
            Err(Error::CouldNotReadStack(0x1000))
        );
    }

    #[test]
    fn no_progress_is_an_error() {
        // A return address equal to ip with an unchanged sp would repeat forever.
        let stack = [0x5000_0400];
        let mut read_stack = |_| Ok(stack[0]);
        let mut regs = UnwindRegsX86_64::new(0x5000_0400, 0x8, 0);
        let rule = UnwindRuleX86_64::OffsetSp { sp_offset_by_8: 0 };
        assert_eq!(rule.exec(true, &mut regs, &mut read_stack), Err(Error::DidNotAdvance));
    }

    #[test]
    fn overflow_is_an_error() {
        let mut read_stack = |_| Ok(0x5000_0000);
        let top = u64::MAX / 8 * 8;
        for rule in [
            UnwindRuleX86_64::OffsetSp { sp_offset_by_8: 1 },
            UnwindRuleX86_64::OffsetSpAndRestoreBp {
                sp_offset_by_8: 1,
                bp_storage_offset_from_sp_by_8: 2,
            },
            UnwindRuleX86_64::UseFramePointer,
        ] {
            let mut regs = UnwindRegsX86_64::new(0x5000_0400, top, top);
            assert_eq!(
                rule.exec(true, &mut regs, &mut read_stack),
                Err(Error::IntegerOverflow),
                "{rule:?}"
            );
        }
    }
}
