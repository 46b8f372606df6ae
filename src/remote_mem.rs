//! Bulk memory transfer in and out of the target.
//!
//! One scatter-gather syscall per transfer, one iovec on each side. A short
//! transfer is a failure: the caller always knows exactly how many bytes it
//! needs, and a partial header or entry array is useless.

use std::io::{IoSlice, IoSliceMut};
use std::mem::{size_of, MaybeUninit};

use nix::sys::uio::{process_vm_readv, process_vm_writev, RemoteIoVec};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::remote_ptr::{RemotePtr, Void};

pub fn read(pid: Pid, addr: RemotePtr<Void>, buf: &mut [u8]) -> Result<()> {
    let len = buf.len();
    if len == 0 {
        return Ok(());
    }
    let remote = [RemoteIoVec {
        base: addr.as_usize(),
        len,
    }];
    let mut local = [IoSliceMut::new(buf)];
    match process_vm_readv(pid, &mut local, &remote) {
        Ok(n) if n == len => Ok(()),
        Ok(n) => Err(Error::ShortTransfer {
            op: "read",
            pid,
            addr: addr.as_usize(),
            requested: len,
            transferred: n,
        }),
        Err(errno) => Err(Error::Transfer {
            op: "read",
            pid,
            addr: addr.as_usize(),
            len,
            errno,
        }),
    }
}

pub fn write(pid: Pid, addr: RemotePtr<Void>, buf: &[u8]) -> Result<()> {
    let len = buf.len();
    if len == 0 {
        return Ok(());
    }
    let remote = [RemoteIoVec {
        base: addr.as_usize(),
        len,
    }];
    let local = [IoSlice::new(buf)];
    match process_vm_writev(pid, &local, &remote) {
        Ok(n) if n == len => Ok(()),
        Ok(n) => Err(Error::ShortTransfer {
            op: "write",
            pid,
            addr: addr.as_usize(),
            requested: len,
            transferred: n,
        }),
        Err(errno) => Err(Error::Transfer {
            op: "write",
            pid,
            addr: addr.as_usize(),
            len,
            errno,
        }),
    }
}

/// Read one `T` from the target. `T` must be a plain `#[repr(C)]` value for
/// which any bit pattern is valid.
pub fn read_val<T: Copy>(pid: Pid, addr: RemotePtr<T>) -> Result<T> {
    let mut val = MaybeUninit::<T>::uninit();
    let buf = unsafe {
        std::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, size_of::<T>())
    };
    read(pid, addr.cast(), buf)?;
    Ok(unsafe { val.assume_init() })
}

/// Write one `T` into the target.
pub fn write_val<T: Copy>(pid: Pid, addr: RemotePtr<T>, val: &T) -> Result<()> {
    let buf = unsafe {
        std::slice::from_raw_parts(val as *const T as *const u8, size_of::<T>())
    };
    write(pid, addr.cast(), buf)
}
