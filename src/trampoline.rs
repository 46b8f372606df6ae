//! The machine code injected into the target.
//!
//! `record_chunk` is the callback the target's `malloc_iterate` invokes per
//! live allocation. It is compiled into this crate like any function, but
//! its bytes are copied into the target and executed there at a different
//! address, which imposes hard constraints: only relative branches, no
//! calls, no checked arithmetic (overflow panics would be calls), volatile
//! accesses only. `record_chunk_end` exists solely to delimit the byte
//! range; it is never called.

use std::ffi::c_void;
use std::ptr::{read_volatile, write_volatile};

use crate::error::{Error, Result};
use crate::util::page_size;

/// Per-chunk callback run inside the target. `arg` points at the shared
/// buffer: word 0 capacity in entries, word 1 cursor, entries of two words
/// each from word 2. While the buffer is full this busy-waits on the trap
/// instruction until the observer drains entries and rewinds the cursor.
#[inline(never)]
extern "C" fn record_chunk(base: u64, size: u64, arg: *mut c_void) {
    let header = arg as *mut u64;
    unsafe {
        while read_volatile(header.add(1)) >= read_volatile(header) {
            #[cfg(target_arch = "aarch64")]
            core::arch::asm!("brk #0x0", "nop", options(nostack));
            #[cfg(target_arch = "x86_64")]
            core::arch::asm!("int3", "nop", options(nostack));
        }
        let cursor = read_volatile(header.add(1));
        let slot = header.add(2usize.wrapping_add((cursor as usize).wrapping_mul(2)));
        write_volatile(slot, base);
        write_volatile(slot.add(1), size);
        write_volatile(header.add(1), cursor.wrapping_add(1));
    }
}

/// End marker for [`record_chunk`]; only its address is meaningful.
#[inline(never)]
extern "C" fn record_chunk_end() {}

/// The trampoline's bytes, taken straight out of our own text section. The
/// length is the distance between the two marker symbols; a length of zero
/// or beyond a page means the toolchain laid the markers out in an order
/// this scheme cannot survive, which we refuse rather than inject garbage.
pub fn code() -> Result<&'static [u8]> {
    let start: extern "C" fn(u64, u64, *mut c_void) = record_chunk;
    let end: extern "C" fn() = record_chunk_end;
    let start = start as usize;
    let len = (end as usize).wrapping_sub(start);
    if len == 0 || len > page_size() {
        return Err(Error::TrampolineLayout { len });
    }
    Ok(unsafe { std::slice::from_raw_parts(start as *const u8, len) })
}
