use std::ops::Deref;

use gimli::{
    BaseAddresses, CfaRule, CieOrFde, CommonInformationEntry, DebugFrame, EhFrame, EhFrameHdr,
    Encoding, EndianSlice, Evaluation, EvaluationResult, LittleEndian, Location, Reader,
    Register, RegisterRule, UnwindContext, UnwindExpression, UnwindOffset, UnwindSection,
    UnwindTableRow, Value,
};

use crate::arch::Arch;
use crate::frame_address::FrameAddress;
use crate::module::{Module, ModuleSections};

pub type SectionReader<'a> = EndianSlice<'a, LittleEndian>;

/// The result of a failed [`lookup`].
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiError {
    #[error("No unwind information covers the address")]
    NotFound,

    #[error("Unwind information could not be parsed: {0}")]
    Parse(#[source] gimli::Error),
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfUnwinderError {
    #[error("Stack pointer moved backwards")]
    StackPointerMovedBackwards,

    #[error("Did not advance")]
    DidNotAdvance,

    #[error("Could not recover the CFA")]
    CouldNotRecoverCfa,

    #[error("Could not recover the return address")]
    CouldNotRecoverReturnAddress,

    #[error("Could not recover the frame pointer")]
    CouldNotRecoverFramePointer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionError {
    CfaIsExpression,
    CfaIsOffsetFromUnknownRegister,
    ReturnAddressRuleWithUnexpectedOffset,
    ReturnAddressRuleWasWeird,
    SpOffsetDoesNotFit,
    RegisterNotStoredRelativeToCfa,
    RestoringFpButNotLr,
    LrStorageOffsetDoesNotFit,
    FpStorageOffsetDoesNotFit,
    SpOffsetFromFpDoesNotFit,
    FramePointerRuleDoesNotRestoreLr,
    FramePointerRuleDoesNotRestoreFp,
    FramePointerRuleDoesNotRestoreBp,
    FramePointerRuleHasStrangeBpOffset,
}

/// How to compute the canonical frame address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CfaLocation {
    /// CFA = register + offset
    RegisterAndOffset { register: Register, offset: i64 },
    /// CFA = result of a DWARF expression
    Expression(Vec<u8>),
}

/// Where the caller's value of a register can be found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegisterLocation {
    /// No rule. For callee-saved registers this means the value is unchanged. For the
    /// return address column it marks the outermost frame.
    Undefined,
    SameValue,
    /// value = *(CFA + offset)
    AtCfaOffset(i64),
    /// value = CFA + offset
    CfaOffset(i64),
    /// value = other register
    InRegister(Register),
    /// value = *(result of expression)
    AtExpression(Vec<u8>),
    /// value = result of expression
    Expression(Vec<u8>),
    /// A rule kind that is not evaluated, like architectural or constant rules.
    Unsupported,
}

/// The CFI rule for one address, detached from the section it was read from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DwarfRule {
    pub cfa: CfaLocation,
    pub return_address: RegisterLocation,
    pub frame_pointer: RegisterLocation,
    pub encoding: Encoding,
}

pub trait DwarfUnwindRegs {
    fn get(&self, register: Register) -> Option<u64>;
}

pub trait DwarfUnwinding: Arch {
    /// The DWARF register number of the return address column.
    const RETURN_ADDRESS: Register;
    /// The DWARF register number of the frame pointer.
    const FRAME_POINTER: Register;

    /// Translate a rule into the compact, cacheable form, if it has a common shape.
    fn translate_rule(rule: &DwarfRule) -> Result<Self::UnwindRule, ConversionError>;

    /// Evaluate a rule in full. Returns the caller's return address, or `None` at the
    /// outermost frame.
    fn exec_rule<F>(
        rule: &DwarfRule,
        regs: &mut Self::UnwindRegs,
        address: FrameAddress,
        read_stack: &mut F,
    ) -> Result<Option<u64>, DwarfUnwinderError>
    where
        F: FnMut(u64) -> Result<u64, ()>;
}

/// Look up the CFI rule of `module` for the address `address` (an AVMA).
///
/// The tables are consulted in this order: `.eh_frame` through `.eh_frame_hdr`,
/// `.eh_frame` through the index built at module load, `.debug_frame`. The first one
/// with an FDE covering the address wins.
pub fn lookup<A, D>(
    module: &Module<D>,
    address: FrameAddress,
    context: &mut UnwindContext<usize>,
) -> Result<DwarfRule, CfiError>
where
    A: DwarfUnwinding,
    D: Deref<Target = [u8]>,
{
    let svma = module.svma_for_avma(address.address_for_lookup());
    let sections = module.sections();
    let bases = base_addresses_for_sections(sections);
    let mut parse_error = None;

    if let Some(eh_frame_data) = module.eh_frame_data() {
        let mut eh_frame = EhFrame::new(eh_frame_data, LittleEndian);
        eh_frame.set_address_size(8);

        let fde = if let Some(hdr_data) = module.eh_frame_hdr_data() {
            let hdr = EhFrameHdr::new(hdr_data, LittleEndian)
                .parse(&bases, 8)
                .map_err(CfiError::Parse)?;
            hdr.table().map(|table| {
                table.fde_for_address(&eh_frame, &bases, svma, EhFrame::cie_from_offset)
            })
        } else {
            match module.eh_frame_index() {
                Some(Ok(index)) => index.fde_offset_for_address(svma).map(|offset| {
                    eh_frame.fde_from_offset(&bases, offset.into(), EhFrame::cie_from_offset)
                }),
                Some(Err(e)) => {
                    parse_error = Some(*e);
                    None
                }
                None => None,
            }
        };
        match fde {
            Some(Ok(fde)) if fde.contains(svma) => {
                return rule_for_fde::<A, _>(&eh_frame, &bases, &fde, svma, context);
            }
            Some(Ok(_)) | Some(Err(gimli::Error::NoUnwindInfoForAddress)) | None => {}
            Some(Err(e)) => return Err(CfiError::Parse(e)),
        }
    }

    if let Some(debug_frame_data) = module.debug_frame_data() {
        let mut debug_frame = DebugFrame::new(debug_frame_data, LittleEndian);
        debug_frame.set_address_size(8);
        match module.debug_frame_index() {
            Some(Ok(index)) => {
                if let Some(offset) = index.fde_offset_for_address(svma) {
                    let fde = debug_frame
                        .fde_from_offset(&bases, offset.into(), DebugFrame::cie_from_offset)
                        .map_err(CfiError::Parse)?;
                    if fde.contains(svma) {
                        return rule_for_fde::<A, _>(&debug_frame, &bases, &fde, svma, context);
                    }
                }
            }
            Some(Err(e)) => {
                parse_error.get_or_insert(*e);
            }
            None => {}
        }
    }

    // A section that could not be indexed may well have covered the address.
    Err(parse_error.map_or(CfiError::NotFound, CfiError::Parse))
}

fn rule_for_fde<'a, A, US>(
    section: &US,
    bases: &BaseAddresses,
    fde: &gimli::FrameDescriptionEntry<SectionReader<'a>>,
    svma: u64,
    context: &mut UnwindContext<usize>,
) -> Result<DwarfRule, CfiError>
where
    A: DwarfUnwinding,
    US: UnwindSection<SectionReader<'a>>,
{
    let encoding = fde.cie().encoding();
    let row: &UnwindTableRow<usize> = fde
        .unwind_info_for_address(section, bases, context, svma)
        .map_err(|e| match e {
            gimli::Error::NoUnwindInfoForAddress => CfiError::NotFound,
            e => CfiError::Parse(e),
        })?;
    Ok(DwarfRule {
        cfa: cfa_location(row.cfa(), section).map_err(CfiError::Parse)?,
        return_address: register_location(row.register(A::RETURN_ADDRESS), section)
            .map_err(CfiError::Parse)?,
        frame_pointer: register_location(row.register(A::FRAME_POINTER), section)
            .map_err(CfiError::Parse)?,
        encoding,
    })
}

fn expression_bytes<'a, US: UnwindSection<SectionReader<'a>>>(
    expression: &UnwindExpression<usize>,
    section: &US,
) -> gimli::Result<Vec<u8>> {
    let expression = expression.get(section)?;
    Ok(expression.0.to_slice()?.into_owned())
}

fn cfa_location<'a, US: UnwindSection<SectionReader<'a>>>(
    rule: &CfaRule<usize>,
    section: &US,
) -> gimli::Result<CfaLocation> {
    Ok(match rule {
        CfaRule::RegisterAndOffset { register, offset } => CfaLocation::RegisterAndOffset {
            register: *register,
            offset: *offset,
        },
        CfaRule::Expression(expression) => {
            CfaLocation::Expression(expression_bytes(expression, section)?)
        }
    })
}

fn register_location<'a, US: UnwindSection<SectionReader<'a>>>(
    rule: RegisterRule<usize>,
    section: &US,
) -> gimli::Result<RegisterLocation> {
    Ok(match rule {
        RegisterRule::Undefined => RegisterLocation::Undefined,
        RegisterRule::SameValue => RegisterLocation::SameValue,
        RegisterRule::Offset(offset) => RegisterLocation::AtCfaOffset(offset),
        RegisterRule::ValOffset(offset) => RegisterLocation::CfaOffset(offset),
        RegisterRule::Register(register) => RegisterLocation::InRegister(register),
        RegisterRule::Expression(expression) => {
            RegisterLocation::AtExpression(expression_bytes(&expression, section)?)
        }
        RegisterRule::ValExpression(expression) => {
            RegisterLocation::Expression(expression_bytes(&expression, section)?)
        }
        _ => RegisterLocation::Unsupported,
    })
}

pub(crate) fn base_addresses_for_sections(sections: &ModuleSections) -> BaseAddresses {
    let start = |section: &Option<crate::module::SectionInfo>| {
        section.as_ref().map(|s| s.svma).unwrap_or_default()
    };
    BaseAddresses::default()
        .set_eh_frame(start(&sections.eh_frame))
        .set_eh_frame_hdr(start(&sections.eh_frame_hdr))
        .set_text(sections.text_svma.unwrap_or_default())
        .set_got(sections.got_svma.unwrap_or_default())
}

/// The FDEs of one CFI section, sorted by start address. Built for `.debug_frame`, and
/// for `.eh_frame` when there is no usable `.eh_frame_hdr`.
#[derive(Debug, Clone, Default)]
pub struct DwarfCfiIndex {
    /// (initial SVMA, section offset) of every FDE.
    fdes: Vec<(u64, usize)>,
}

impl DwarfCfiIndex {
    fn build<'a, S>(section: S, bases: BaseAddresses) -> gimli::Result<Self>
    where
        S: UnwindSection<SectionReader<'a>>,
    {
        // FDEs normally follow their CIE, so the last CIE seen is usually the right one.
        let mut last_cie: Option<CommonInformationEntry<SectionReader<'a>>> = None;
        let mut fdes = Vec::new();
        let mut entries = section.entries(&bases);
        while let Some(entry) = entries.next()? {
            let partial = match entry {
                CieOrFde::Cie(cie) => {
                    last_cie = Some(cie);
                    continue;
                }
                CieOrFde::Fde(partial) => partial,
            };
            let fde = partial.parse(|section, bases, cie_offset| {
                let wanted = <S::Offset as UnwindOffset<usize>>::into(cie_offset);
                match &last_cie {
                    Some(cie) if cie.offset() == wanted => Ok(cie.clone()),
                    _ => section.cie_from_offset(bases, cie_offset),
                }
            })?;
            fdes.push((fde.initial_address(), fde.offset()));
        }
        fdes.sort_unstable_by_key(|&(start, _)| start);
        Ok(Self { fdes })
    }

    pub fn try_new_eh_frame(data: &[u8], sections: &ModuleSections) -> gimli::Result<Self> {
        let mut section = EhFrame::new(data, LittleEndian);
        section.set_address_size(8);
        Self::build(section, base_addresses_for_sections(sections))
    }

    pub fn try_new_debug_frame(data: &[u8], sections: &ModuleSections) -> gimli::Result<Self> {
        let mut section = DebugFrame::new(data, LittleEndian);
        section.set_address_size(8);
        Self::build(section, base_addresses_for_sections(sections))
    }

    /// The offset of the FDE with the largest start address not exceeding `svma`.
    pub fn fde_offset_for_address(&self, svma: u64) -> Option<usize> {
        let after = self.fdes.partition_point(|&(start, _)| start <= svma);
        after.checked_sub(1).map(|i| self.fdes[i].1)
    }

    pub fn len(&self) -> usize {
        self.fdes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fdes.is_empty()
    }
}

pub fn eval_cfa<UR: DwarfUnwindRegs>(
    cfa: &CfaLocation,
    encoding: Encoding,
    regs: &UR,
) -> Option<u64> {
    match cfa {
        CfaLocation::RegisterAndOffset { register, offset } => {
            let val = regs.get(*register)?;
            u64::checked_add_signed(val, *offset)
        }
        CfaLocation::Expression(expr) => eval_expr(expr, encoding, regs),
    }
}

fn eval_expr<UR: DwarfUnwindRegs>(expr: &[u8], encoding: Encoding, regs: &UR) -> Option<u64> {
    let mut eval = Evaluation::new(EndianSlice::new(expr, LittleEndian), encoding);
    let mut result = eval.evaluate().ok()?;
    loop {
        match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = regs.get(register)?;
                result = eval.resume_with_register(Value::Generic(value)).ok()?;
            }
            _ => return None,
        }
    }
    match eval.result().last()?.location {
        Location::Address { address } => Some(address),
        _ => None,
    }
}

/// Recover the caller's value of a register. `val` is the register's current value.
/// Returns `None` if the rule is undefined or evaluation failed.
pub fn eval_register<F, UR>(
    location: &RegisterLocation,
    cfa: u64,
    encoding: Encoding,
    val: u64,
    regs: &UR,
    read_stack: &mut F,
) -> Option<u64>
where
    F: FnMut(u64) -> Result<u64, ()>,
    UR: DwarfUnwindRegs,
{
    match location {
        RegisterLocation::Undefined | RegisterLocation::Unsupported => None,
        RegisterLocation::SameValue => Some(val),
        RegisterLocation::AtCfaOffset(offset) => {
            let cfa_plus_offset = u64::checked_add_signed(cfa, *offset)?;
            read_stack(cfa_plus_offset).ok()
        }
        RegisterLocation::CfaOffset(offset) => u64::checked_add_signed(cfa, *offset),
        RegisterLocation::InRegister(register) => regs.get(*register),
        RegisterLocation::AtExpression(expr) => {
            let address = eval_expr(expr, encoding, regs)?;
            read_stack(address).ok()
        }
        RegisterLocation::Expression(expr) => eval_expr(expr, encoding, regs),
    }
}

/// `offset / unit`, or `error` when `offset` is not a whole number of units.
pub(crate) fn offset_in_units(
    offset: i64,
    unit: i64,
    error: ConversionError,
) -> Result<i64, ConversionError> {
    if offset % unit != 0 {
        return Err(error);
    }
    Ok(offset / unit)
}

pub(crate) fn register_location_to_cfa_offset(
    location: &RegisterLocation,
) -> Result<Option<i64>, ConversionError> {
    match *location {
        RegisterLocation::Undefined | RegisterLocation::SameValue => Ok(None),
        RegisterLocation::AtCfaOffset(offset) => Ok(Some(offset)),
        _ => Err(ConversionError::RegisterNotStoredRelativeToCfa),
    }
}
