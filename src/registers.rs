//! Reading and writing the target's register file.
//!
//! x86_64 uses the legacy PTRACE_GETREGS/SETREGS requests; aarch64 kernels
//! only implement the regset interface, so there we go through
//! PTRACE_GETREGSET/SETREGSET with NT_PRSTATUS ourselves.

#[cfg(target_arch = "aarch64")]
use nix::errno::Errno;
use nix::unistd::Pid;

/// Native user-visible register file of the target. Observer and target
/// always share an architecture.
pub type RegisterSet = libc::user_regs_struct;

#[cfg(target_arch = "x86_64")]
pub fn read_registers(pid: Pid) -> nix::Result<RegisterSet> {
    nix::sys::ptrace::getregs(pid)
}

#[cfg(target_arch = "x86_64")]
pub fn write_registers(pid: Pid, regs: &RegisterSet) -> nix::Result<()> {
    nix::sys::ptrace::setregs(pid, *regs)
}

// Not provided by the libc crate when building against musl.
#[cfg(target_arch = "aarch64")]
const NT_PRSTATUS: libc::c_int = 1;

#[cfg(target_arch = "aarch64")]
pub fn read_registers(pid: Pid) -> nix::Result<RegisterSet> {
    use std::mem::{size_of, MaybeUninit};

    let mut regs = MaybeUninit::<RegisterSet>::uninit();
    let mut iov = libc::iovec {
        iov_base: regs.as_mut_ptr() as *mut libc::c_void,
        iov_len: size_of::<RegisterSet>(),
    };
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            pid.as_raw(),
            NT_PRSTATUS,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc == -1 {
        return Err(Errno::last());
    }
    Ok(unsafe { regs.assume_init() })
}

#[cfg(target_arch = "aarch64")]
pub fn write_registers(pid: Pid, regs: &RegisterSet) -> nix::Result<()> {
    use std::mem::size_of;

    let iov = libc::iovec {
        iov_base: regs as *const RegisterSet as *mut libc::c_void,
        iov_len: size_of::<RegisterSet>(),
    };
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            pid.as_raw(),
            NT_PRSTATUS,
            &iov as *const libc::iovec,
        )
    };
    if rc == -1 {
        return Err(Errno::last());
    }
    Ok(())
}
