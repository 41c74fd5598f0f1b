//! aarch64 registers, compact rules and their derivation from CFI. Return addresses
//! are stripped of pointer authentication bits wherever they enter the unwinder.

mod dwarf;
mod unwind_rule;
mod unwindregs;

pub use unwind_rule::UnwindRuleAarch64;
pub use unwindregs::{strip_ptr_auth, UnwindRegsAarch64};
