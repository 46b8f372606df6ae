//! Enumerate the live heap allocations of a running Linux/Android process.
//!
//! Given the pid of a target using one of bionic's allocators
//! (`libc_malloc`, Scudo, GWP-ASan), [`enumerate`] delivers a
//! `(base, size)` record for every live allocation, without any
//! cooperation from the target. The mechanism:
//!
//! * resolve bionic entry points inside the target by mirroring our own
//!   dynamic-linker view through `/proc/<pid>/maps` equivalence
//!   ([`symbols`], [`maps`]),
//! * call functions inside the target by hijacking a stopped thread with
//!   ptrace, with a sentinel return address of 0 so completion shows up as
//!   an unambiguous fault ([`remote_call`]),
//! * inject a page of position-independent trampoline code plus a shared
//!   buffer page, and run bionic's `malloc_iterate` with the trampoline as
//!   its per-chunk callback ([`heap`]),
//! * drain the buffer with `process_vm_readv` whenever the trampoline
//!   traps on a full buffer ([`remote_mem`]).
//!
//! The observer must be allowed to ptrace the target (`CAP_SYS_PTRACE` or
//! an equivalent Yama relationship). Only 64-bit ARM and x86-64 are
//! supported, and observer and target must share an architecture.
//!
//! ```no_run
//! let pid = heapstalk::Pid::from_raw(4242);
//! let total = heapstalk::enumerate(pid, |base, size| {
//!     println!("{base:#x} {size}");
//! })?;
//! eprintln!("{total} live chunks");
//! # Ok::<(), heapstalk::Error>(())
//! ```

#[macro_use]
mod log;

mod error;
mod trampoline;
mod util;

pub mod kernel_abi;
pub mod maps;
pub mod registers;
pub mod remote;
pub mod remote_call;
pub mod remote_mem;
pub mod remote_ptr;
pub mod symbols;

pub mod heap;

pub use error::{Error, Result};
pub use heap::enumerate;
pub use remote_ptr::{RemotePtr, Void};

pub use nix::unistd::Pid;
