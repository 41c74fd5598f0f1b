use super::unwindregs::{strip_ptr_auth, UnwindRegsAarch64};
use crate::error::Error;
use crate::unwind_rule::UnwindRule;

/// A compact unwind rule for aarch64. The caller's return address always ends up in lr.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnwindRuleAarch64 {
    /// sp += 16 * sp_offset_by_16; fp and lr unchanged. Leaf functions only, so this is
    /// valid in the first frame alone.
    OffsetSp { sp_offset_by_16: u16 },
    /// sp += 16 * sp_offset_by_16; lr loaded from the old sp + 8 * lr offset.
    OffsetSpAndRestoreLr {
        sp_offset_by_16: u16,
        lr_storage_offset_from_sp_by_8: i16,
    },
    /// sp += 16 * sp_offset_by_16; fp and lr loaded relative to the old sp.
    OffsetSpAndRestoreFpAndLr {
        sp_offset_by_16: u16,
        fp_storage_offset_from_sp_by_8: i16,
        lr_storage_offset_from_sp_by_8: i16,
    },
    /// The frame record at fp holds the caller's fp and lr.
    UseFramePointer,
    /// Like `UseFramePointer`, for functions whose frame record is not at the top of
    /// their frame.
    UseFramepointerWithOffsets {
        sp_offset_from_fp_by_8: u16,
        fp_storage_offset_from_fp_by_8: i16,
        lr_storage_offset_from_fp_by_8: i16,
    },
}

/// The caller's sp, fp and lr.
struct Caller {
    sp: u64,
    fp: u64,
    lr: u64,
}

fn offset_location(base: u64, offset_by_8: i16) -> Result<u64, Error> {
    u64::checked_add_signed(base, i64::from(offset_by_8) * 8).ok_or(Error::IntegerOverflow)
}

fn grow(base: u64, delta: u64) -> Result<u64, Error> {
    base.checked_add(delta).ok_or(Error::IntegerOverflow)
}

fn read<F>(read_stack: &mut F, address: u64) -> Result<u64, Error>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    read_stack(address).map_err(|_| Error::CouldNotReadStack(address))
}

/// Load the caller's fp and lr relative to `base`, with a precomputed caller sp.
fn load_pair<F>(
    read_stack: &mut F,
    base: u64,
    sp: u64,
    fp_offset_by_8: i16,
    lr_offset_by_8: i16,
) -> Result<Caller, Error>
where
    F: FnMut(u64) -> Result<u64, ()>,
{
    let lr = read(read_stack, offset_location(base, lr_offset_by_8)?)?;
    let fp = read(read_stack, offset_location(base, fp_offset_by_8)?)?;
    Ok(Caller { sp, fp, lr })
}

impl UnwindRuleAarch64 {
    fn caller<F>(
        self,
        is_first_frame: bool,
        regs: &UnwindRegsAarch64,
        read_stack: &mut F,
    ) -> Result<Option<Caller>, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let (sp, fp) = (regs.sp(), regs.fp());
        let caller = match self {
            UnwindRuleAarch64::OffsetSp { sp_offset_by_16 } => {
                if !is_first_frame {
                    // The call made by this frame clobbered lr.
                    return Err(Error::DidNotAdvance);
                }
                Caller {
                    sp: grow(sp, u64::from(sp_offset_by_16) * 16)?,
                    fp,
                    lr: regs.lr(),
                }
            }
            UnwindRuleAarch64::OffsetSpAndRestoreLr {
                sp_offset_by_16,
                lr_storage_offset_from_sp_by_8,
            } => Caller {
                sp: grow(sp, u64::from(sp_offset_by_16) * 16)?,
                fp,
                lr: read(read_stack, offset_location(sp, lr_storage_offset_from_sp_by_8)?)?,
            },
            UnwindRuleAarch64::OffsetSpAndRestoreFpAndLr {
                sp_offset_by_16,
                fp_storage_offset_from_sp_by_8,
                lr_storage_offset_from_sp_by_8,
            } => load_pair(
                read_stack,
                sp,
                grow(sp, u64::from(sp_offset_by_16) * 16)?,
                fp_storage_offset_from_sp_by_8,
                lr_storage_offset_from_sp_by_8,
            )?,
            UnwindRuleAarch64::UseFramePointer => {
                if fp == 0 {
                    return Ok(None);
                }
                if fp % 8 != 0 {
                    return Err(Error::MisalignedFramePointer(fp));
                }
                let caller_sp = grow(fp, 16)?;
                if caller_sp <= sp {
                    return Err(Error::FramepointerUnwindingMovedBackwards);
                }
                load_pair(read_stack, fp, caller_sp, 0, 1)?
            }
            UnwindRuleAarch64::UseFramepointerWithOffsets {
                sp_offset_from_fp_by_8,
                fp_storage_offset_from_fp_by_8,
                lr_storage_offset_from_fp_by_8,
            } => {
                if fp == 0 {
                    return Ok(None);
                }
                let caller_sp = grow(fp, u64::from(sp_offset_from_fp_by_8) * 8)?;
                if caller_sp <= sp {
                    return Err(Error::FramepointerUnwindingMovedBackwards);
                }
                load_pair(
                    read_stack,
                    fp,
                    caller_sp,
                    fp_storage_offset_from_fp_by_8,
                    lr_storage_offset_from_fp_by_8,
                )?
            }
        };
        Ok(Some(caller))
    }
}

impl UnwindRule for UnwindRuleAarch64 {
    type UnwindRegs = UnwindRegsAarch64;

    fn fallback_rule() -> Self {
        UnwindRuleAarch64::UseFramePointer
    }

    fn exec<F>(
        self,
        is_first_frame: bool,
        regs: &mut UnwindRegsAarch64,
        read_stack: &mut F,
    ) -> Result<Option<u64>, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        let Some(caller) = self.caller(is_first_frame, regs, read_stack)? else {
            return Ok(None);
        };
        let return_address = strip_ptr_auth(caller.lr);
        if return_address == 0 {
            return Ok(None);
        }
        if !is_first_frame && caller.sp == regs.sp() && return_address == regs.lr() {
            return Err(Error::DidNotAdvance);
        }
        regs.set_lr(return_address);
        regs.set_sp(caller.sp);
        regs.set_fp(caller.fp);
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
    fn leaf_then_frame_records() {
        // 0x00..0x20: leaf locals, 0x20: record (fp 0x40, lr into fn_b)
        // 0x30: fn_b locals, 0x40: record (fp 0, lr into main)
        let stack = [1, 2, 3, 4, 0x40, 0x7000_2000, 5, 6, 0, 0x7000_1000];
        let mut read_stack = reader(&stack);
        let mut regs = UnwindRegsAarch64::new(0x7000_3000, 0x0, 0x20);

        let leaf = UnwindRuleAarch64::OffsetSp { sp_offset_by_16: 0 };
        assert_eq!(leaf.exec(true, &mut regs, &mut read_stack), Ok(Some(0x7000_3000)));

        let fp = UnwindRuleAarch64::UseFramePointer;
        assert_eq!(fp.exec(false, &mut regs, &mut read_stack), Ok(Some(0x7000_2000)));
        assert_eq!((regs.sp(), regs.fp()), (0x30, 0x40));
        assert_eq!(fp.exec(false, &mut regs, &mut read_stack), Ok(Some(0x7000_1000)));
        assert_eq!((regs.sp(), regs.fp()), (0x50, 0));
        assert_eq!(fp.exec(false, &mut regs, &mut read_stack), Ok(None));
    }

    #[test]
    fn signed_return_addresses_are_stripped() {
        let stack = [0x30, 0x00b4_0000_7000_0400];
        let mut read_stack = reader(&stack);
        let mut regs = UnwindRegsAarch64::new(0x7000_0100, 0x0, 0x0);
        let rule = UnwindRuleAarch64::OffsetSpAndRestoreFpAndLr {
            sp_offset_by_16: 1,
            fp_storage_offset_from_sp_by_8: 0,
            lr_storage_offset_from_sp_by_8: 1,
        };
        assert_eq!(rule.exec(false, &mut regs, &mut read_stack), Ok(Some(0x7000_0400)));
        assert_eq!(regs.lr(), 0x7000_0400);
        assert_eq!((regs.sp(), regs.fp()), (0x10, 0x30));
    }

    #[test]
    fn restore_lr_keeps_fp() {
        let stack = [0, 0, 0, 0x7000_0900];
        let mut read_stack = reader(&stack);
        let mut regs = UnwindRegsAarch64::new(0x7000_0100, 0x10, 0x80);
        let rule = UnwindRuleAarch64::OffsetSpAndRestoreLr {
            sp_offset_by_16: 2,
            lr_storage_offset_from_sp_by_8: 1,
        };
        assert_eq!(rule.exec(false, &mut regs, &mut read_stack), Ok(Some(0x7000_0900)));
        assert_eq!((regs.sp(), regs.fp()), (0x30, 0x80));
    }

    #[test]
    fn frame_record_below_the_frame_top() {
        // fp = 0x10, record at fp - 16, caller sp = fp + 32.
        let stack = [0x60, 0x7000_0700, 0, 0];
        let mut read_stack = reader(&stack);
        let mut regs = UnwindRegsAarch64::new(0x7000_0100, 0x0, 0x10);
        let rule = UnwindRuleAarch64::UseFramepointerWithOffsets {
            sp_offset_from_fp_by_8: 4,
            fp_storage_offset_from_fp_by_8: -2,
            lr_storage_offset_from_fp_by_8: -1,
        };
        assert_eq!(rule.exec(false, &mut regs, &mut read_stack), Ok(Some(0x7000_0700)));
        assert_eq!((regs.sp(), regs.fp()), (0x30, 0x60));
    }

    #[test]
    fn lr_rule_is_only_valid_in_first_frame() {
        let mut read_stack = |_| Err(());
        let mut regs = UnwindRegsAarch64::new(0x7000_0400, 0x10, 0x20);
        let rule = UnwindRuleAarch64::OffsetSp { sp_offset_by_16: 1 };
        assert_eq!(
            rule.exec(false, &mut regs, &mut read_stack),
            Err(Error::DidNotAdvance)
        );
        assert_eq!(regs, UnwindRegsAarch64::new(0x7000_0400, 0x10, 0x20));
    }

    #[test]
    fn corrupt_chains() {
        let stack = [0, 0, 0x8, 0x7000_0500, 0, 0, 0, 0];
        let mut read_stack = reader(&stack);
        let fp = UnwindRuleAarch64::UseFramePointer;

        let mut regs = UnwindRegsAarch64::new(0x7000_0400, 0x20, 0x8);
        assert_eq!(
            fp.exec(false, &mut regs, &mut read_stack),
            Err(Error::FramepointerUnwindingMovedBackwards)
        );
        let mut regs = UnwindRegsAarch64::new(0x7000_0400, 0x8, 0x1c);
        assert_eq!(
            fp.exec(false, &mut regs, &mut read_stack),
            Err(Error::MisalignedFramePointer(0x1c))
        );
        let mut regs = UnwindRegsAarch64::new(0x7000_0400, 0x8, 0x1000);
        assert_eq!(
            fp.exec(false, &mut regs, &mut read_stack),
            Err(Error::CouldNotReadStack(0x1008))
        );
    }
}
