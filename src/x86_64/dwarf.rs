use gimli::{Register, X86_64};

use super::{UnwindRegsX86_64, UnwindRuleX86_64};
use crate::arch::ArchX86_64;
use crate::dwarf::{
    eval_cfa, eval_register, offset_in_units, register_location_to_cfa_offset, CfaLocation,
    ConversionError, DwarfRule, DwarfUnwindRegs, DwarfUnwinderError, DwarfUnwinding,
    RegisterLocation,
};
use crate::frame_address::FrameAddress;

impl DwarfUnwindRegs for UnwindRegsX86_64 {
    fn get(&self, register: Register) -> Option<u64> {
        match register {
            X86_64::RA => Some(self.ip()),
            X86_64::RSP => Some(self.sp()),
            X86_64::RBP => Some(self.bp()),
            _ => None,
        }
    }
}

impl DwarfUnwinding for ArchX86_64 {
    const RETURN_ADDRESS: Register = X86_64::RA;
    const FRAME_POINTER: Register = X86_64::RBP;

    fn translate_rule(rule: &DwarfRule) -> Result<UnwindRuleX86_64, ConversionError> {
        match rule.return_address {
            RegisterLocation::AtCfaOffset(-8) => {}
            RegisterLocation::AtCfaOffset(_) => {
                return Err(ConversionError::ReturnAddressRuleWithUnexpectedOffset)
            }
            _ => return Err(ConversionError::ReturnAddressRuleWasWeird),
        }

        match rule.cfa {
            CfaLocation::RegisterAndOffset { register, offset } => match register {
                X86_64::RSP => {
                    let sp_offset_by_8 =
                        offset_in_units(offset, 8, ConversionError::SpOffsetDoesNotFit)?;
                    let sp_offset_by_8 = u16::try_from(sp_offset_by_8)
                        .map_err(|_| ConversionError::SpOffsetDoesNotFit)?;
                    let fp_cfa_offset = register_location_to_cfa_offset(&rule.frame_pointer)?;
                    match fp_cfa_offset {
                        None => Ok(UnwindRuleX86_64::OffsetSp { sp_offset_by_8 }),
                        Some(bp_cfa_offset) => {
                            let too_far = ConversionError::FpStorageOffsetDoesNotFit;
                            let bp_storage_offset_from_sp_by_8 = i16::try_from(
                                offset_in_units(offset + bp_cfa_offset, 8, too_far)?,
                            )
                            .map_err(|_| too_far)?;
                            Ok(UnwindRuleX86_64::OffsetSpAndRestoreBp {
                                sp_offset_by_8,
                                bp_storage_offset_from_sp_by_8,
                            })
                        }
                    }
                }
                X86_64::RBP => {
                    let bp_cfa_offset = register_location_to_cfa_offset(&rule.frame_pointer)?
                        .ok_or(ConversionError::FramePointerRuleDoesNotRestoreBp)?;
                    if offset == 16 && bp_cfa_offset == -16 {
                        Ok(UnwindRuleX86_64::UseFramePointer)
                    } else {
                        Err(ConversionError::FramePointerRuleHasStrangeBpOffset)
                    }
                }
                _ => Err(ConversionError::CfaIsOffsetFromUnknownRegister),
            },
            CfaLocation::Expression(_) => Err(ConversionError::CfaIsExpression),
        }
    }

    fn exec_rule<F>(
        rule: &DwarfRule,
        regs: &mut UnwindRegsX86_64,
        address: FrameAddress,
        read_stack: &mut F,
    ) -> Result<Option<u64>, DwarfUnwinderError>
    where
        F: FnMut(u64) -> Result<u64, ()>,
    {
        if rule.return_address == RegisterLocation::Undefined {
            // The entry point of a process or thread.
            return Ok(None);
        }

        let cfa = eval_cfa(&rule.cfa, rule.encoding, regs)
            .ok_or(DwarfUnwinderError::CouldNotRecoverCfa)?;

        let ip = regs.ip();
        let sp = regs.sp();
        let bp = regs.bp();

        if address.is_return_address() && cfa <= sp {
            return Err(DwarfUnwinderError::StackPointerMovedBackwards);
        }

        let new_bp = match rule.frame_pointer {
            RegisterLocation::Undefined => bp,
            ref location => {
                match eval_register(location, cfa, rule.encoding, bp, regs, read_stack) {
                    Some(new_bp) => new_bp,
                    None if !address.is_return_address() => bp,
                    None => return Err(DwarfUnwinderError::CouldNotRecoverFramePointer),
                }
            }
        };

        let return_address = match eval_register(
            &rule.return_address,
            cfa,
            rule.encoding,
            ip,
            regs,
            read_stack,
        ) {
            Some(ra) => ra,
            None => read_stack(cfa.wrapping_sub(8))
                .map_err(|_| DwarfUnwinderError::CouldNotRecoverReturnAddress)?,
        };

        if return_address == 0 {
            return Ok(None);
        }
        if cfa == sp && return_address == ip {
            return Err(DwarfUnwinderError::DidNotAdvance);
        }

        regs.set_ip(return_address);
        regs.set_sp(cfa);
        regs.set_bp(new_bp);
        Ok(Some(return_address))
    }
}
