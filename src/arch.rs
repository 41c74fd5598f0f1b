use std::fmt::Debug;

use crate::aarch64::{UnwindRegsAarch64, UnwindRuleAarch64};
use crate::unwind_rule::UnwindRule;
use crate::x86_64::{UnwindRegsX86_64, UnwindRuleX86_64};

/// Declare the register set an architecture unwinds with: a `Copy` struct with a
/// constructor taking the registers in declaration order, a getter and setter per
/// register, and a `Debug` impl that prints hex. Every stored value passes through
/// `$normalize`.
macro_rules! unwind_regs {
    ($(#[$meta:meta])* $name:ident, normalize = $normalize:path, { $($reg:ident / $set:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq)]
        pub struct $name {
            $($reg: u64,)+
        }

        impl $name {
            pub fn new($($reg: u64),+) -> Self {
                Self { $($reg: $normalize($reg),)+ }
            }

            $(
                #[inline(always)]
                pub fn $reg(&self) -> u64 {
                    self.$reg
                }

                #[inline(always)]
                pub fn $set(&mut self, $reg: u64) {
                    self.$reg = $normalize($reg);
                }
            )+
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    $(.field(stringify!($reg), &$crate::display_utils::HexNum(self.$reg)))+
                    .finish()
            }
        }
    };
}
pub(crate) use unwind_regs;

pub trait Arch {
    type UnwindRegs: Copy + Debug;
    type UnwindRule: UnwindRule<UnwindRegs = Self::UnwindRegs>;

    /// The stack pointer, used to find the bounds of the stack being walked.
    fn stack_pointer(regs: &Self::UnwindRegs) -> u64;
}

pub struct ArchX86_64;
impl Arch for ArchX86_64 {
    type UnwindRule = UnwindRuleX86_64;
    type UnwindRegs = UnwindRegsX86_64;

    fn stack_pointer(regs: &UnwindRegsX86_64) -> u64 {
        regs.sp()
    }
}

pub struct ArchAarch64;
impl Arch for ArchAarch64 {
    type UnwindRule = UnwindRuleAarch64;
    type UnwindRegs = UnwindRegsAarch64;

    fn stack_pointer(regs: &UnwindRegsAarch64) -> u64 {
        regs.sp()
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub type ArchNative = ArchX86_64;
        pub type UnwindRegsNative = UnwindRegsX86_64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub type ArchNative = ArchAarch64;
        pub type UnwindRegsNative = UnwindRegsAarch64;
    }
}
