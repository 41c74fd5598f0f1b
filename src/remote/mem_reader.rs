//! Reading the memory of a stopped target process.

use std::fs::File;
use std::os::unix::fs::FileExt;

use nix::errno::Errno;
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
#[error("Copy from process {pid} failed (address 0x{address:x}, length {length})")]
pub struct CopyFromProcessError {
    pub pid: i32,
    pub address: u64,
    pub length: usize,
    #[source]
    pub source: nix::Error,
}

/// The mechanism that worked for the first successful read. Later reads only use
/// this one.
enum Style {
    /// `process_vm_readv(2)`. Needs the same permissions as ptrace.
    VirtualMem,
    /// Reads of `/proc/<pid>/mem` at the address as file offset.
    File(File),
    /// `PTRACE_PEEKDATA`, one word per syscall. Works on any traced and stopped process.
    Ptrace,
}

pub struct MemReader {
    pid: Pid,
    style: Option<Style>,
}

impl std::fmt::Debug for MemReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let style = match &self.style {
            Some(Style::VirtualMem) => "process_vm_readv",
            Some(Style::File(_)) => "/proc/<pid>/mem",
            Some(Style::Ptrace) => "PTRACE_PEEKDATA",
            None => "unprobed",
        };
        write!(f, "MemReader({}, {style})", self.pid)
    }
}

impl MemReader {
    /// A reader for `pid`. The access method is probed on the first read.
    pub fn new(pid: i32) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            style: None,
        }
    }

    #[cfg(test)]
    fn with_style(pid: i32, style: Style) -> Self {
        Self {
            pid: Pid::from_raw(pid),
            style: Some(style),
        }
    }

    /// Read one aligned 64-bit word.
    pub fn read_u64(&mut self, address: u64) -> Result<u64, CopyFromProcessError> {
        let mut buf = [0u8; 8];
        self.read_exact(address, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Fill `dst` from the target's memory at `address`. Short reads are errors.
    pub fn read_exact(&mut self, address: u64, dst: &mut [u8]) -> Result<(), CopyFromProcessError> {
        let (pid, length) = (self.pid.as_raw(), dst.len());
        let error = |source| CopyFromProcessError {
            pid,
            address,
            length,
            source,
        };
        let src = usize::try_from(address).map_err(|_| error(Errno::EFAULT))?;

        if let Some(style) = &mut self.style {
            let result = match style {
                Style::VirtualMem => Self::vmem(self.pid, src, dst),
                Style::File(file) => Self::file(file, src, dst),
                Style::Ptrace => Self::ptrace(self.pid, src, dst),
            };
            return result.map_err(error);
        }

        let vmem = match Self::vmem(self.pid, src, dst) {
            Ok(()) => {
                self.style = Some(Style::VirtualMem);
                return Ok(());
            }
            Err(e) => e,
        };
        // An unmapped address fails the same way with every method.
        if vmem == Errno::EFAULT || vmem == Errno::ESRCH {
            return Err(error(vmem));
        }

        let file = match File::open(format!("/proc/{}/mem", self.pid)) {
            Ok(mut file) => match Self::file(&mut file, src, dst) {
                Ok(()) => {
                    self.style = Some(Style::File(file));
                    return Ok(());
                }
                Err(e) => e,
            },
            Err(e) => Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)),
        };

        match Self::ptrace(self.pid, src, dst) {
            Ok(()) => {
                self.style = Some(Style::Ptrace);
                Ok(())
            }
            Err(ptrace) => {
                log::debug!(
                    "No way to read memory of {}: process_vm_readv: {vmem}, /proc/<pid>/mem: {file}, PTRACE_PEEKDATA: {ptrace}",
                    self.pid
                );
                Err(error(ptrace))
            }
        }
    }

    fn vmem(pid: Pid, src: usize, dst: &mut [u8]) -> Result<(), nix::Error> {
        let len = dst.len();
        let remote = [nix::sys::uio::RemoteIoVec { base: src, len }];
        let read =
            nix::sys::uio::process_vm_readv(pid, &mut [std::io::IoSliceMut::new(dst)], &remote)?;
        if read != len {
            return Err(Errno::EFAULT);
        }
        Ok(())
    }

    fn file(file: &mut File, src: usize, dst: &mut [u8]) -> Result<(), nix::Error> {
        file.read_exact_at(dst, src as u64).map_err(|e| match e.raw_os_error() {
            Some(os) => Errno::from_raw(os),
            // EOF
            None => Errno::EFAULT,
        })
    }

    fn ptrace(pid: Pid, src: usize, dst: &mut [u8]) -> Result<(), nix::Error> {
        const WORD: usize = std::mem::size_of::<libc::c_long>();
        for (i, chunk) in dst.chunks_mut(WORD).enumerate() {
            let address = src.checked_add(i * WORD).ok_or(Errno::EFAULT)?;
            let word = nix::sys::ptrace::read(pid, address as nix::sys::ptrace::AddressType)?;
            chunk.copy_from_slice(&word.to_ne_bytes()[..chunk.len()]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn read_own_memory() {
        let value = 0x0123_4567_89ab_cdefu64;
        let address = &value as *const u64 as u64;
        let mut reader = MemReader::new(std::process::id() as i32);
        assert_eq!(reader.read_u64(address).unwrap(), value);
        // Probing picked a method and keeps using it.
        assert!(reader.style.is_some());
        assert_eq!(reader.read_u64(address).unwrap(), value);
    }

    #[test]
    fn read_own_memory_through_proc() {
        let pid = std::process::id() as i32;
        let Ok(file) = File::open(format!("/proc/{pid}/mem")) else {
            return;
        };
        let bytes = *b"stackwalk";
        let mut reader = MemReader::with_style(pid, Style::File(file));
        let mut dst = [0u8; 9];
        reader.read_exact(bytes.as_ptr() as u64, &mut dst).unwrap();
        assert_eq!(dst, bytes);
    }

    #[test]
    fn unmapped_address_fails() {
        let pid = std::process::id() as i32;
        let mut reader = MemReader::new(pid);
        let err = reader.read_u64(8).unwrap_err();
        assert_eq!(err.pid, pid);
        assert_eq!(err.address, 8);
        assert_eq!(err.length, 8);
    }
}
