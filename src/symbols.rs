//! Cross-process symbol resolution.
//!
//! A shared library is mapped at one ASLR base per process, so a symbol's
//! offset within its backing region is the same everywhere the same region
//! (file, length, permissions) is mapped. Resolving a symbol in the target
//! therefore needs no remote ELF parsing: resolve it locally with the
//! dynamic linker, find the local region containing it, find the target's
//! equivalent region, and re-apply the offset.

use std::ffi::{CStr, CString};

use nix::unistd::{getpid, Pid};

use crate::error::{Error, Result};
use crate::log::LogLevel::LogDebug;
use crate::maps;
use crate::remote_ptr::{RemotePtr, Void};

fn last_dl_error() -> String {
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown dlerror".to_owned()
    } else {
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

/// Resolve `sym` from `lib` in our own address space via the dynamic
/// linker. The handle is never closed: the resolved address must stay valid
/// for the lifetime of the process, and libc-family libraries never unload
/// anyway.
fn resolve_local(lib: &str, sym: &str) -> Result<usize> {
    let lib_c = CString::new(lib).map_err(|_| Error::DlOpen {
        lib: lib.to_owned(),
        msg: "library name contains a NUL byte".to_owned(),
    })?;
    let sym_c = CString::new(sym).map_err(|_| Error::DlSym {
        sym: sym.to_owned(),
        msg: "symbol name contains a NUL byte".to_owned(),
    })?;

    let handle = unsafe { libc::dlopen(lib_c.as_ptr(), libc::RTLD_LAZY) };
    if handle.is_null() {
        return Err(Error::DlOpen {
            lib: lib.to_owned(),
            msg: last_dl_error(),
        });
    }

    let addr = unsafe { libc::dlsym(handle, sym_c.as_ptr()) };
    if addr.is_null() {
        return Err(Error::DlSym {
            sym: sym.to_owned(),
            msg: last_dl_error(),
        });
    }
    Ok(addr as usize)
}

/// Translate `local_addr` into the equivalent address inside `pid`.
fn translate(pid: Pid, local_addr: usize) -> Result<RemotePtr<Void>> {
    let local_region = maps::find_by_address(getpid(), local_addr)?
        .ok_or(Error::NoLocalRegion { addr: local_addr })?;

    let remote_region = maps::find_equivalent(pid, &local_region)?.ok_or(
        Error::NoEquivalentRegion {
            pid,
            addr: local_addr,
        },
    )?;

    let offset = local_addr - local_region.start;
    Ok(RemotePtr::new(remote_region.start + offset))
}

/// Address of `lib`'s export `sym` inside the target `pid`.
pub fn resolve(pid: Pid, lib: &str, sym: &str) -> Result<RemotePtr<Void>> {
    let local_addr = resolve_local(lib, sym)?;
    let remote_addr = translate(pid, local_addr)?;
    log!(
        LogDebug,
        "{}:{} is {:#x} here, {} in process {}",
        lib,
        sym,
        local_addr,
        remote_addr,
        pid
    );
    Ok(remote_addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    // The test host's C library; bionic targets use plain "libc.so".
    const TEST_LIBC: &str = "libc.so.6";

    #[test]
    fn resolving_into_our_own_process_is_the_identity() {
        let local = match resolve_local(TEST_LIBC, "strlen") {
            Ok(addr) => addr,
            // musl or an odd loader layout; nothing to test against
            Err(err) => {
                eprintln!("skipping: {}", err);
                return;
            }
        };
        let remote = resolve(getpid(), TEST_LIBC, "strlen").unwrap();
        assert_eq!(remote.as_usize(), local);
    }

    #[test]
    fn missing_symbol_is_reported() {
        if resolve_local(TEST_LIBC, "strlen").is_err() {
            return;
        }
        let err = resolve(getpid(), TEST_LIBC, "definitely_not_a_libc_export").unwrap_err();
        assert!(matches!(err, Error::DlSym { .. }), "{}", err);
    }

    #[test]
    fn missing_library_is_reported() {
        let err = resolve(getpid(), "libdoesnotexist-12345.so", "strlen").unwrap_err();
        assert!(matches!(err, Error::DlOpen { .. }), "{}", err);
    }
}
