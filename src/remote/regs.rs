use nix::unistd::Pid;

use crate::arch::UnwindRegsNative;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// The instruction pointer and unwind registers of a stopped tracee.
        pub(crate) fn read_registers(pid: Pid) -> nix::Result<(u64, UnwindRegsNative)> {
            let regs = nix::sys::ptrace::getregs(pid)?;
            Ok((regs.rip, UnwindRegsNative::new(regs.rip, regs.rsp, regs.rbp)))
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// The program counter and unwind registers of a stopped tracee.
        pub(crate) fn read_registers(pid: Pid) -> nix::Result<(u64, UnwindRegsNative)> {
            // SAFETY: an all-zero user_regs_struct is valid, and the kernel writes at most
            // iov_len bytes into it.
            let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
            let mut iov = libc::iovec {
                iov_base: &mut regs as *mut libc::user_regs_struct as *mut libc::c_void,
                iov_len: std::mem::size_of::<libc::user_regs_struct>(),
            };
            let ret = unsafe {
                libc::ptrace(
                    libc::PTRACE_GETREGSET,
                    pid.as_raw(),
                    libc::NT_PRSTATUS as libc::c_long,
                    &mut iov as *mut libc::iovec,
                )
            };
            nix::errno::Errno::result(ret)?;
            let lr = regs.regs[30];
            let fp = regs.regs[29];
            Ok((regs.pc, UnwindRegsNative::new(lr, regs.sp, fp)))
        }
    }
}
