//! The libc operations we perform inside the target.
//!
//! Every operation here resolves a `libc.so` export in the target and calls
//! it through the ptrace engine. Each call is a full attach/run/detach
//! cycle; the walk makes few enough calls that this simplicity wins over
//! holding one attachment open.

use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::kernel_abi::CallArgs;
use crate::log::LogLevel::LogWarn;
use crate::remote_call::{
    call_remote_function, call_remote_function_with_trap_callback, TrapAction,
};
use crate::remote_ptr::{RemotePtr, Void};
use crate::symbols;

/// The C library of the target. Bionic links everything against this one
/// soname, and it exports the `malloc_*` introspection entry points.
pub const TARGET_LIBC: &str = "libc.so";

fn libc_export(pid: Pid, sym: &str) -> Result<RemotePtr<Void>> {
    symbols::resolve(pid, TARGET_LIBC, sym)
}

/// Anonymous `mmap` inside the target.
pub fn mmap(pid: Pid, len: usize, prot: i32, flags: i32) -> Result<RemotePtr<Void>> {
    let func = libc_export(pid, "mmap")?;
    let args: CallArgs = [0, len as u64, prot as u64, flags as u64, 0, 0];
    let ret = call_remote_function(pid, func, &args)?;
    if ret as i64 == -1 {
        log!(LogWarn, "failed mmap in remote process {}", pid);
        return Err(Error::RemoteSyscall { func: "mmap", pid });
    }
    Ok(RemotePtr::from(ret))
}

pub fn munmap(pid: Pid, addr: RemotePtr<Void>, len: usize) -> Result<()> {
    let func = libc_export(pid, "munmap")?;
    let args: CallArgs = [addr.as_u64(), len as u64, 0, 0, 0, 0];
    let ret = call_remote_function(pid, func, &args)?;
    if ret as i64 == -1 {
        log!(LogWarn, "failed munmap in remote process {}", pid);
        return Err(Error::RemoteSyscall { func: "munmap", pid });
    }
    Ok(())
}

/// Stop the target's allocator handing out or reclaiming memory. Walks of
/// a live heap are only consistent while this is in force.
pub fn malloc_disable(pid: Pid) -> Result<()> {
    let func = libc_export(pid, "malloc_disable")?;
    call_remote_function(pid, func, &CallArgs::default())?;
    Ok(())
}

pub fn malloc_enable(pid: Pid) -> Result<()> {
    let func = libc_export(pid, "malloc_enable")?;
    call_remote_function(pid, func, &CallArgs::default())?;
    Ok(())
}

/// Run bionic's allocation walker over `[base, base + len)` in the target,
/// with `callback` (a code address in the target) invoked per chunk and
/// `arg` passed through to it. SIGTRAP stops during the walk go to
/// `trap_cb`.
pub fn malloc_iterate(
    pid: Pid,
    base: usize,
    len: usize,
    callback: RemotePtr<Void>,
    arg: RemotePtr<Void>,
    trap_cb: &mut dyn FnMut() -> TrapAction,
) -> Result<()> {
    let func = libc_export(pid, "malloc_iterate")?;
    let args: CallArgs = [
        base as u64,
        len as u64,
        callback.as_u64(),
        arg.as_u64(),
        0,
        0,
    ];
    call_remote_function_with_trap_callback(pid, func, &args, trap_cb)?;
    Ok(())
}
