//! Failure kinds of the remote heap walk.
//!
//! Every error here is terminal for the operation that produced it: the walk
//! mutates target-side state (register file, injected mappings, the
//! allocator freeze), so nothing is retried. Scope guards take care of
//! unwinding the target-side state; the error only reports why we stopped.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// `PTRACE_ATTACH` refused, typically EPERM without CAP_SYS_PTRACE.
    Attach { pid: Pid, errno: Errno },
    /// A ptrace request other than attach failed while the target was ours.
    Ptrace {
        op: &'static str,
        pid: Pid,
        errno: Errno,
    },
    /// `waitpid` failed with something other than EINTR.
    Wait { pid: Pid, errno: Errno },
    /// The target exited or was killed while we were driving a call in it.
    TargetDied { pid: Pid },
    /// `/proc/<pid>/maps` could not be opened or read.
    Maps { pid: Pid, source: io::Error },
    /// `dlopen` of the library we need to mirror into the target failed.
    DlOpen { lib: String, msg: String },
    /// The library is loaded but does not export the symbol.
    DlSym { sym: String, msg: String },
    /// No region of our own address space contains the locally resolved
    /// symbol; `/proc/self/maps` and the dynamic linker disagree.
    NoLocalRegion { addr: usize },
    /// The target has no region equivalent to the one backing the symbol
    /// locally, so the library is not mapped (or mapped differently) there.
    NoEquivalentRegion { pid: Pid, addr: usize },
    /// A function called inside the target reported failure (-1).
    RemoteSyscall { func: &'static str, pid: Pid },
    /// `process_vm_readv`/`process_vm_writev` errored outright.
    Transfer {
        op: &'static str,
        pid: Pid,
        addr: usize,
        len: usize,
        errno: Errno,
    },
    /// The kernel transferred fewer bytes than requested.
    ShortTransfer {
        op: &'static str,
        pid: Pid,
        addr: usize,
        requested: usize,
        transferred: usize,
    },
    /// A remote call ended in something other than the sentinel fault
    /// (SIGSEGV at address 0), so the called function cannot have returned
    /// normally.
    CallFault {
        pid: Pid,
        signal: Signal,
        fault_addr: Option<usize>,
    },
    /// The shared buffer header read back from the target is inconsistent.
    CursorOutOfRange { cursor: u64, max_entries: u64 },
    /// The trampoline's end marker does not sit after its start symbol, or
    /// the code does not fit in one page.
    TrampolineLayout { len: usize },
    /// An OS error where the errno is the whole story.
    Sys(Errno),
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Error {
        Error::Sys(errno)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Attach { pid, errno } => {
                write!(f, "cannot attach to process {}: {}", pid, errno)
            }
            Error::Ptrace { op, pid, errno } => {
                write!(f, "ptrace {} failed on process {}: {}", op, pid, errno)
            }
            Error::Wait { pid, errno } => {
                write!(f, "waitpid on process {} failed: {}", pid, errno)
            }
            Error::TargetDied { pid } => {
                write!(f, "process {} unexpectedly exited", pid)
            }
            Error::Maps { pid, source } => {
                write!(f, "cannot read /proc/{}/maps: {}", pid, source)
            }
            Error::DlOpen { lib, msg } => write!(f, "failed dlopen({}): {}", lib, msg),
            Error::DlSym { sym, msg } => write!(f, "failed dlsym({}): {}", sym, msg),
            Error::NoLocalRegion { addr } => {
                write!(f, "no local mapping contains address {:#018x}", addr)
            }
            Error::NoEquivalentRegion { pid, addr } => write!(
                f,
                "no mapping in process {} is equivalent to the one at local address {:#018x}",
                pid, addr
            ),
            Error::RemoteSyscall { func, pid } => {
                write!(f, "remote {} failed in process {}", func, pid)
            }
            Error::Transfer {
                op,
                pid,
                addr,
                len,
                errno,
            } => write!(
                f,
                "{} of {} bytes at {:#018x} in process {} failed: {}",
                op, len, addr, pid, errno
            ),
            Error::ShortTransfer {
                op,
                pid,
                addr,
                requested,
                transferred,
            } => write!(
                f,
                "only {} {} of {} bytes at {:#018x} in process {}",
                op, transferred, requested, addr, pid
            ),
            Error::CallFault {
                pid,
                signal,
                fault_addr,
            } => match fault_addr {
                Some(addr) => write!(
                    f,
                    "remote call in process {} faulted at {:#018x} instead of the sentinel",
                    pid, addr
                ),
                None => write!(
                    f,
                    "remote call in process {} stopped with {:?} instead of the sentinel fault",
                    pid, signal
                ),
            },
            Error::CursorOutOfRange {
                cursor,
                max_entries,
            } => write!(
                f,
                "shared buffer cursor {} exceeds capacity {}",
                cursor, max_entries
            ),
            Error::TrampolineLayout { len } => {
                write!(f, "trampoline has impossible length {}", len)
            }
            Error::Sys(errno) => write!(f, "system error: {}", errno),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Maps { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_the_pid() {
        let err = Error::Attach {
            pid: Pid::from_raw(1234),
            errno: Errno::EPERM,
        };
        let text = err.to_string();
        assert!(text.contains("1234"), "{}", text);
        assert!(text.contains("attach"), "{}", text);
    }

    #[test]
    fn raw_errnos_convert_into_errors() {
        let err: Error = Errno::EPERM.into();
        assert!(matches!(err, Error::Sys(Errno::EPERM)));
        assert!(err.to_string().contains("EPERM"), "{}", err);
    }

    #[test]
    fn short_transfer_reports_both_sizes() {
        let err = Error::ShortTransfer {
            op: "read",
            pid: Pid::from_raw(1),
            addr: 0x7000,
            requested: 4096,
            transferred: 16,
        };
        let text = err.to_string();
        assert!(text.contains("16"), "{}", text);
        assert!(text.contains("4096"), "{}", text);
    }
}
