//! x86_64 registers, compact rules and their derivation from CFI.

mod dwarf;
mod unwind_rule;
mod unwindregs;

pub use unwind_rule::UnwindRuleX86_64;
pub use unwindregs::UnwindRegsX86_64;
