/// With pointer authentication enabled, return addresses saved on the stack carry a
/// signature in the bits above the virtual address. Linux user space uses 48-bit
/// virtual addresses.
const PTR_MASK: u64 = (1 << 48) - 1;

#[inline(always)]
pub fn strip_ptr_auth(ptr: u64) -> u64 {
    ptr & PTR_MASK
}

crate::arch::unwind_regs! {
    /// The registers used for unwinding on aarch64. Pointer authentication bits are
    /// stripped on the way in.
    UnwindRegsAarch64, normalize = strip_ptr_auth, {
        lr / set_lr,
        sp / set_sp,
        fp / set_fp,
    }
}
