use crate::error::Error;

pub trait UnwindRule: Copy + std::fmt::Debug {
    type UnwindRegs;

    /// Apply the rule to `regs`, turning them into the caller's registers.
    ///
    /// Returns the caller's return address, or `None` if the end of the stack has been
    /// reached.
    fn exec<F>(
        self,
        is_first_frame: bool,
        regs: &mut Self::UnwindRegs,
        read_stack: &mut F,
    ) -> Result<Option<u64>, Error>
    where
        F: FnMut(u64) -> Result<u64, ()>;

    /// The rule to use when no unwind information covers an address.
    fn fallback_rule() -> Self;
}
