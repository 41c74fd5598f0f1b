crate::arch::unwind_regs! {
    /// The registers used for unwinding on x86_64.
    UnwindRegsX86_64, normalize = std::convert::identity, {
        ip / set_ip,
        sp / set_sp,
        bp / set_bp,
    }
}
