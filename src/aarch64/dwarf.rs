use gimli::{AArch64, Register};

use super::{strip_ptr_auth, UnwindRegsAarch64, UnwindRuleAarch64};
use crate::arch::ArchAarch64;
use crate::dwarf::{
    eval_cfa, eval_register, offset_in_units, register_location_to_cfa_offset, CfaLocation,
    ConversionError, DwarfRule, DwarfUnwindRegs, DwarfUnwinderError, DwarfUnwinding,
    RegisterLocation,
};
use crate::frame_address::FrameAddress;

impl DwarfUnwindRegs for UnwindRegsAarch64 {
    fn get(&self, register: Register) -> Option<u64> {
        match register {
            AArch64::SP => Some(self.sp()),
            AArch64::X29 => Some(self.fp()),
            AArch64::X30 => Some(self.lr()),
            _ => None,
        }
    }
}

/// A save slot as a word offset from the CFA base register.
fn slot_by_8(offset_from_base: i64, too_far: ConversionError) -> Result<i16, ConversionError> {
    i16::try_from(offset_in_units(offset_from_base, 8, too_far)?).map_err(|_| too_far)
}

impl DwarfUnwinding for ArchAarch64 {
    const RETURN_ADDRESS: Register = AArch64::X30;
    const FRAME_POINTER: Register = AArch64::X29;

    fn translate_rule(rule: &DwarfRule) -> Result<UnwindRuleAarch64, ConversionError> {
        if rule.return_address == RegisterLocation::Undefined {
            // Means "unchanged" in a leaf function but "no caller" in the outermost
            // frame. Only the full evaluation can tell the two apart.
            return Err(ConversionError::ReturnAddressRuleWasWeird);
        }
        let CfaLocation::RegisterAndOffset { register, offset } = rule.cfa else {
            return Err(ConversionError::CfaIsExpression);
        };
        let lr_slot = register_location_to_cfa_offset(&rule.return_address)?
            .map(|lr| slot_by_8(offset + lr, ConversionError::LrStorageOffsetDoesNotFit));
        let fp_slot = register_location_to_cfa_offset(&rule.frame_pointer)?
            .map(|fp| slot_by_8(offset + fp, ConversionError::FpStorageOffsetDoesNotFit));

        match register {
            AArch64::SP => {
                let sp_offset_by_16 =
                    offset_in_units(offset, 16, ConversionError::SpOffsetDoesNotFit)?;
                let sp_offset_by_16 = u16::try_from(sp_offset_by_16)
                    .map_err(|_| ConversionError::SpOffsetDoesNotFit)?;
                Ok(match (lr_slot, fp_slot) {
                    (None, None) => UnwindRuleAarch64::OffsetSp { sp_offset_by_16 },
                    (None, Some(_)) => return Err(ConversionError::RestoringFpButNotLr),
                    (Some(lr), None) => UnwindRuleAarch64::OffsetSpAndRestoreLr {
                        sp_offset_by_16,
                        lr_storage_offset_from_sp_by_8: lr?,
                    },
                    (Some(lr), Some(fp)) => UnwindRuleAarch64::OffsetSpAndRestoreFpAndLr {
                        sp_offset_by_16,
                        fp_storage_offset_from_sp_by_8: fp?,
                        lr_storage_offset_from_sp_by_8: lr?,
                    },
                })
            }
            AArch64::X29 => {
                let lr = lr_slot.ok_or(ConversionError::FramePointerRuleDoesNotRestoreLr)??;
                let fp = fp_slot.ok_or(ConversionError::FramePointerRuleDoesNotRestoreFp)??;
                // The slots are relative to fp here, as fp is the CFA base.
                if offset == 16 && (fp, lr) == (0, 1) {
                    return Ok(UnwindRuleAarch64::UseFramePointer);
                }
                Ok(UnwindRuleAarch64::UseFramepointerWithOffsets {
                    sp_offset_from_fp_by_8: u16::try_from(offset_in_units(
                        offset,
                        8,
                        ConversionError::SpOffsetFromFpDoesNotFit,
                    )?)
                    .map_err(|_| ConversionError::SpOffsetFromFpDoesNotFit)?,
                    fp_storage_offset_from_fp_by_8: fp,
                    lr_storage_offset_from_fp_by_8: lr,
                })
            }
            _ => Err(ConversionError::CfaIsOffsetFromUnknownRegister),
        }
    }

    fn exec_rule<F>(
        rule: &DwarfRule,
        regs: &mut UnwindRegsAarch64,
        address: FrameAddress,
        read_stack: &mut F,
    ) -> Result<Option<u64>, DwarfUnwinderError>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        if address.is_return_address() && rule.return_address == RegisterLocation::Undefined {
            return Ok(None);
        }

        let cfa = eval_cfa(&rule.cfa, rule.encoding, regs)
            .ok_or(DwarfUnwinderError::CouldNotRecoverCfa)?;

        let lr = regs.lr();
        let fp = regs.fp();
        let sp = regs.sp();

        let (fp, lr) = if address.is_return_address() {
            if cfa <= sp {
                return Err(DwarfUnwinderError::StackPointerMovedBackwards);
            }
            let fp = match rule.frame_pointer {
                RegisterLocation::Undefined => fp,
                ref location => eval_register(location, cfa, rule.encoding, fp, regs, read_stack)
                    .ok_or(DwarfUnwinderError::CouldNotRecoverFramePointer)?,
            };
            let lr = eval_register(&rule.return_address, cfa, rule.encoding, lr, regs, read_stack)
                .ok_or(DwarfUnwinderError::CouldNotRecoverReturnAddress)?;
            (fp, lr)
        } else {
            // The innermost frame may be in a prologue or epilogue, where the rules for
            // saved registers can point at slots that are not written yet.
            let fp = eval_register(&rule.frame_pointer, cfa, rule.encoding, fp, regs, read_stack)
                .unwrap_or(fp);
            let lr = eval_register(&rule.return_address, cfa, rule.encoding, lr, regs, read_stack)
                .unwrap_or(lr);
            if cfa == sp && strip_ptr_auth(lr) == address.address() {
                return Err(DwarfUnwinderError::DidNotAdvance);
            }
            (fp, lr)
        };

        let lr = strip_ptr_auth(lr);
        if lr == 0 {
            return Ok(None);
        }

        regs.set_fp(fp);
        regs.set_sp(cfa);
        regs.set_lr(lr);

        Ok(Some(lr))
    }
}

#[cfg(test)]
mod test {
    use gimli::{Encoding, Format};

    use super::*;

    fn rule(
        cfa_register: Register,
        cfa_offset: i64,
        fp: RegisterLocation,
        lr: RegisterLocation,
    ) -> DwarfRule {
        DwarfRule {
            cfa: CfaLocation::RegisterAndOffset {
                register: cfa_register,
                offset: cfa_offset,
            },
            return_address: lr,
            frame_pointer: fp,
            encoding: Encoding {
                format: Format::Dwarf32,
                version: 1,
                address_size: 8,
            },
        }
    }

    #[test]
    fn translate_common_rules() {
        // stp x29, x30, [sp, #-32]!
        assert_eq!(
            ArchAarch64::translate_rule(&rule(
                AArch64::SP,
                32,
                RegisterLocation::AtCfaOffset(-32),
                RegisterLocation::AtCfaOffset(-24)
            )),
            Ok(UnwindRuleAarch64::OffsetSpAndRestoreFpAndLr {
                sp_offset_by_16: 2,
                fp_storage_offset_from_sp_by_8: 0,
                lr_storage_offset_from_sp_by_8: 1,
            })
        );
        // mov x29, sp
        assert_eq!(
            ArchAarch64::translate_rule(&rule(
                AArch64::X29,
                16,
                RegisterLocation::AtCfaOffset(-16),
                RegisterLocation::AtCfaOffset(-8)
            )),
            Ok(UnwindRuleAarch64::UseFramePointer)
        );
        assert_eq!(
            ArchAarch64::translate_rule(&rule(
                AArch64::SP,
                0,
                RegisterLocation::Undefined,
                RegisterLocation::Undefined
            )),
            Err(ConversionError::ReturnAddressRuleWasWeird)
        );
    }

    #[test]
    fn translate_frame_record_below_frame_top() {
        // sub sp, sp, #48; stp x29, x30, [sp, #16]; add x29, sp, #16
        assert_eq!(
            ArchAarch64::translate_rule(&rule(
                AArch64::X29,
                32,
                RegisterLocation::AtCfaOffset(-32),
                RegisterLocation::AtCfaOffset(-24)
            )),
            Ok(UnwindRuleAarch64::UseFramepointerWithOffsets {
                sp_offset_from_fp_by_8: 4,
                fp_storage_offset_from_fp_by_8: 0,
                lr_storage_offset_from_fp_by_8: 1,
            })
        );
        assert_eq!(
            ArchAarch64::translate_rule(&rule(
                AArch64::X29,
                16,
                RegisterLocation::Undefined,
                RegisterLocation::AtCfaOffset(-8)
            )),
            Err(ConversionError::FramePointerRuleDoesNotRestoreFp)
        );
        assert_eq!(
            ArchAarch64::translate_rule(&rule(
                AArch64::SP,
                16,
                RegisterLocation::AtCfaOffset(-16),
                RegisterLocation::SameValue
            )),
            Err(ConversionError::RestoringFpButNotLr)
        );
    }

    #[test]
    fn misaligned_offsets_are_not_translated() {
        assert_eq!(
            ArchAarch64::translate_rule(&rule(
                AArch64::SP,
                24,
                RegisterLocation::Undefined,
                RegisterLocation::SameValue
            )),
            Err(ConversionError::SpOffsetDoesNotFit)
        );
        assert_eq!(
            ArchAarch64::translate_rule(&rule(
                AArch64::SP,
                32,
                RegisterLocation::AtCfaOffset(-32),
                RegisterLocation::AtCfaOffset(-20)
            )),
            Err(ConversionError::LrStorageOffsetDoesNotFit)
        );
        assert_eq!(
            ArchAarch64::translate_rule(&rule(
                AArch64::X29,
                20,
                RegisterLocation::AtCfaOffset(-20),
                RegisterLocation::AtCfaOffset(-12)
            )),
            Err(ConversionError::SpOffsetFromFpDoesNotFit)
        );
    }

    #[test]
    fn exec_leaf_function() {
        let mut read_stack = |_| Err(());
        let mut regs = UnwindRegsAarch64::new(0x100500, 0x100, 0x200);
        let res = ArchAarch64::exec_rule(
            &rule(
                AArch64::SP,
                0,
                RegisterLocation::Undefined,
                RegisterLocation::Undefined,
            ),
            &mut regs,
            FrameAddress::InstructionPointer(0x100400),
            &mut read_stack,
        );
        assert_eq!(res, Ok(Some(0x100500)));
        assert_eq!(regs.sp(), 0x100);
        assert_eq!(regs.fp(), 0x200);
    }

    #[test]
    fn exec_outermost_frame() {
        let mut read_stack = |_| Err(());
        let mut regs = UnwindRegsAarch64::new(0x100500, 0x100, 0);
        let res = ArchAarch64::exec_rule(
            &rule(
                AArch64::SP,
                0,
                RegisterLocation::Undefined,
                RegisterLocation::Undefined,
            ),
            &mut regs,
            FrameAddress::ReturnAddress(0x100500),
            &mut read_stack,
        );
        assert_eq!(res, Ok(None));
    }
}
