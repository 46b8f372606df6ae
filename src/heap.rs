//! Enumerating every live allocation in the target's heaps.
//!
//! The walk injects two pages into the target: a data page holding a
//! header-plus-entries buffer, and a code page holding the trampoline. It
//! then freezes the target's allocator, runs bionic's `malloc_iterate`
//! over every heap region with the trampoline as the per-chunk callback,
//! and drains the buffer whenever the trampoline traps on a full buffer
//! and once more after each region. All target-side state is unwound by
//! scope guards whichever way the walk ends.

use std::mem::size_of;
use std::ops::ControlFlow;

use nix::unistd::Pid;
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::maps::{self, MapPerms, MapsEntry};
use crate::remote;
use crate::remote_call::TrapAction;
use crate::remote_mem;
use crate::remote_ptr::RemotePtr;
use crate::trampoline;
use crate::util::{ceil_page_size, page_size};

/// Header of the shared buffer, immediately followed in the data page by a
/// flat array of [`HeapChunk`]. Written in the target's byte order, which
/// is little-endian on both supported architectures. `cursor` counts
/// entries, not words, and the trampoline traps once it reaches
/// `max_entries`.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct BufferHeader {
    max_entries: u64,
    cursor: u64,
}

/// One recorded allocation.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
struct HeapChunk {
    base: u64,
    size: u64,
}

// The trampoline addresses the buffer as raw words; these pin the layout
// it assumes.
const_assert_eq!(size_of::<BufferHeader>(), 2 * size_of::<u64>());
const_assert_eq!(size_of::<HeapChunk>(), 2 * size_of::<u64>());

const ENTRIES_OFFSET: usize = size_of::<BufferHeader>();

fn buffer_capacity(page: usize) -> u64 {
    ((page - ENTRIES_OFFSET) / size_of::<HeapChunk>()) as u64
}

/// A mapping we created in the target, unmapped on drop. Failure to unmap
/// only leaks target memory, so it is logged and swallowed.
struct RemoteMapping {
    pid: Pid,
    addr: RemotePtr,
    len: usize,
}

impl RemoteMapping {
    fn anonymous(pid: Pid, len: usize, prot: i32) -> Result<RemoteMapping> {
        let addr = remote::mmap(pid, len, prot, libc::MAP_ANONYMOUS | libc::MAP_PRIVATE)?;
        log!(LogDebug, "mapped {} bytes at {} in process {}", len, addr, pid);
        Ok(RemoteMapping { pid, addr, len })
    }
}

impl Drop for RemoteMapping {
    fn drop(&mut self) {
        if let Err(err) = remote::munmap(self.pid, self.addr, self.len) {
            log!(
                LogWarn,
                "leaked {} bytes at {} in process {}: {}",
                self.len,
                self.addr,
                self.pid,
                err
            );
        }
    }
}

/// Holds the target's allocator disabled; re-enables on drop. Re-enabling
/// is best-effort: failing to thaw must not stop the rest of teardown.
struct MallocFreeze {
    pid: Pid,
}

impl MallocFreeze {
    fn new(pid: Pid) -> Result<MallocFreeze> {
        remote::malloc_disable(pid)?;
        Ok(MallocFreeze { pid })
    }
}

impl Drop for MallocFreeze {
    fn drop(&mut self) {
        if let Err(err) = remote::malloc_enable(self.pid) {
            log!(
                LogWarn,
                "failed to re-enable allocations in process {}: {}",
                self.pid,
                err
            );
        }
    }
}

/// Bionic puts every allocator arena in a named anonymous mapping; these
/// names are the complete set for the three allocators we understand.
fn is_heap_region(region: &MapsEntry) -> bool {
    region.perms.contains(MapPerms::READ)
        && (region.pathname == "[anon:libc_malloc]"
            || region.pathname.starts_with("[anon:scudo:")
            || region.pathname.starts_with("[anon:GWP-ASan"))
}

/// Read accumulated entries out of the target, hand them to `callback` in
/// recording order, and rewind the cursor so the trampoline can refill the
/// buffer. Returns how many entries were delivered.
fn drain_shared_buffer(
    pid: Pid,
    buffer: RemotePtr<BufferHeader>,
    callback: &mut dyn FnMut(u64, u64),
) -> Result<u64> {
    let mut header: BufferHeader = remote_mem::read_val(pid, buffer)?;
    if header.cursor > header.max_entries {
        return Err(Error::CursorOutOfRange {
            cursor: header.cursor,
            max_entries: header.max_entries,
        });
    }

    let count = header.cursor as usize;
    if count > 0 {
        let mut raw = vec![0u8; count * size_of::<HeapChunk>()];
        remote_mem::read(pid, buffer.cast().byte_add(ENTRIES_OFFSET), &mut raw)?;
        for entry in raw.chunks_exact(size_of::<HeapChunk>()) {
            let base = u64::from_le_bytes(entry[..8].try_into().unwrap());
            let size = u64::from_le_bytes(entry[8..].try_into().unwrap());
            callback(base, size);
        }
    }

    header.cursor = 0;
    remote_mem::write_val(pid, buffer, &header)?;
    Ok(count as u64)
}

fn walk_region(
    pid: Pid,
    region: &MapsEntry,
    code: RemotePtr,
    buffer: RemotePtr<BufferHeader>,
    total: &mut u64,
    callback: &mut dyn FnMut(u64, u64),
) -> Result<()> {
    log!(LogDebug, "walking heap region {}", region);

    let mut drain_failure: Option<Error> = None;
    let call_result = {
        let mut on_trap = || match drain_shared_buffer(pid, buffer, &mut *callback) {
            Ok(delivered) => {
                *total += delivered;
                TrapAction::Resume
            }
            Err(err) => {
                drain_failure = Some(err);
                TrapAction::Stop
            }
        };
        remote::malloc_iterate(
            pid,
            region.start,
            region.len(),
            code,
            buffer.cast(),
            &mut on_trap,
        )
    };
    // A trap-time drain failure aborts the call, which then also reports a
    // fault; the drain failure is the root cause, so it wins.
    if let Some(err) = drain_failure {
        return Err(err);
    }
    call_result?;

    // Entries recorded since the last trap (or a walk that never trapped).
    *total += drain_shared_buffer(pid, buffer, callback)?;
    Ok(())
}

/// Walk every live allocation of `pid`'s bionic heaps, invoking
/// `callback(base, size)` per chunk, and return how many chunks were
/// delivered. On error, entries already delivered may be an incomplete
/// snapshot; on success the stream is complete relative to the window in
/// which the target's allocator was frozen.
pub fn enumerate<F>(pid: Pid, mut callback: F) -> Result<u64>
where
    F: FnMut(u64, u64),
{
    enumerate_with(pid, &mut callback)
}

fn enumerate_with(pid: Pid, callback: &mut dyn FnMut(u64, u64)) -> Result<u64> {
    let page = page_size();

    let data = RemoteMapping::anonymous(pid, page, libc::PROT_READ | libc::PROT_WRITE)?;
    let buffer = data.addr.cast::<BufferHeader>();
    let header = BufferHeader {
        max_entries: buffer_capacity(page),
        cursor: 0,
    };
    remote_mem::write_val(pid, buffer, &header)?;

    let code_bytes = trampoline::code()?;
    let code = RemoteMapping::anonymous(
        pid,
        ceil_page_size(code_bytes.len()),
        libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
    )?;
    remote_mem::write(pid, code.addr, code_bytes)?;

    let freeze = MallocFreeze::new(pid)?;

    let mut total = 0u64;
    let mut failure: Option<Error> = None;
    maps::iterate(pid, |region| {
        if !is_heap_region(region) {
            return ControlFlow::Continue(());
        }
        match walk_region(pid, region, code.addr, buffer, &mut total, &mut *callback) {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => {
                failure = Some(err);
                ControlFlow::Break(())
            }
        }
    })?;

    // Thaw before the mappings disappear under the allocator's feet.
    drop(freeze);

    match failure {
        Some(err) => Err(err),
        None => {
            log!(LogDebug, "delivered {} chunks from process {}", total, pid);
            Ok(total)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memoffset::offset_of;
    use nix::errno::Errno;
    use nix::unistd::getpid;

    fn entry(pathname: &str, perms: &str) -> MapsEntry {
        MapsEntry {
            start: 0x1000,
            end: 0x2000,
            perms: match perms {
                "rw-p" => MapPerms::READ | MapPerms::WRITE | MapPerms::PRIVATE,
                "---p" => MapPerms::PRIVATE,
                other => panic!("unexpected perms {}", other),
            },
            offset: 0,
            device: "00:00".to_owned(),
            inode: 0,
            pathname: pathname.to_owned(),
        }
    }

    #[test]
    fn buffer_layout_matches_what_the_trampoline_assumes() {
        assert_eq!(offset_of!(BufferHeader, max_entries), 0);
        assert_eq!(offset_of!(BufferHeader, cursor), 8);
        assert_eq!(offset_of!(HeapChunk, base), 0);
        assert_eq!(offset_of!(HeapChunk, size), 8);
        assert_eq!(ENTRIES_OFFSET, 16);
    }

    #[test]
    fn capacity_fills_the_page_without_overflowing_it() {
        for page in [4096usize, 16384, 65536] {
            let capacity = buffer_capacity(page) as usize;
            assert!(ENTRIES_OFFSET + capacity * size_of::<HeapChunk>() <= page);
            assert!(ENTRIES_OFFSET + (capacity + 1) * size_of::<HeapChunk>() > page);
        }
    }

    #[test]
    fn selects_exactly_the_three_allocators_heap_regions() {
        assert!(is_heap_region(&entry("[anon:libc_malloc]", "rw-p")));
        assert!(is_heap_region(&entry("[anon:scudo:primary]", "rw-p")));
        assert!(is_heap_region(&entry("[anon:GWP-ASan guard page]", "rw-p")));
        assert!(!is_heap_region(&entry("[anon:libc_malloc]", "---p")));
        assert!(!is_heap_region(&entry("[heap]", "rw-p")));
        assert!(!is_heap_region(&entry("[anon:scudo]", "rw-p")));
        assert!(!is_heap_region(&entry("/usr/lib/libc.so", "rw-p")));
        assert!(!is_heap_region(&entry("", "rw-p")));
    }

    // Drain tests run the real protocol against a buffer in our own
    // address space; process_vm_readv works on the caller's own pid.
    // Sandboxes that deny the syscall make these tests skip.
    fn transfer_unavailable(err: &Error) -> bool {
        matches!(
            err,
            Error::Transfer {
                errno: Errno::EPERM | Errno::ENOSYS,
                ..
            }
        )
    }

    #[repr(C)]
    struct TestBuffer {
        header: BufferHeader,
        entries: [HeapChunk; 4],
    }

    #[test]
    fn drain_delivers_in_order_and_rewinds_the_cursor() {
        let mut buf = TestBuffer {
            header: BufferHeader {
                max_entries: 4,
                cursor: 2,
            },
            entries: [
                HeapChunk {
                    base: 0x1000,
                    size: 32,
                },
                HeapChunk {
                    base: 0x2000,
                    size: 64,
                },
                HeapChunk { base: 0, size: 0 },
                HeapChunk { base: 0, size: 0 },
            ],
        };
        let addr = RemotePtr::<BufferHeader>::new(&mut buf as *mut TestBuffer as usize);

        let mut seen = Vec::new();
        match drain_shared_buffer(getpid(), addr, &mut |base, size| seen.push((base, size))) {
            Ok(delivered) => {
                assert_eq!(delivered, 2);
                assert_eq!(seen, vec![(0x1000, 32), (0x2000, 64)]);
                assert_eq!(buf.header.cursor, 0);
                assert_eq!(buf.header.max_entries, 4);
            }
            Err(err) if transfer_unavailable(&err) => eprintln!("skipping: {}", err),
            Err(err) => panic!("{}", err),
        }
    }

    #[test]
    fn drain_of_an_empty_buffer_delivers_nothing() {
        let mut buf = TestBuffer {
            header: BufferHeader {
                max_entries: 4,
                cursor: 0,
            },
            entries: [HeapChunk { base: 0, size: 0 }; 4],
        };
        let addr = RemotePtr::<BufferHeader>::new(&mut buf as *mut TestBuffer as usize);

        match drain_shared_buffer(getpid(), addr, &mut |_, _| panic!("no entries expected")) {
            Ok(delivered) => assert_eq!(delivered, 0),
            Err(err) if transfer_unavailable(&err) => eprintln!("skipping: {}", err),
            Err(err) => panic!("{}", err),
        }
    }

    #[test]
    fn drain_rejects_a_cursor_beyond_capacity() {
        let mut buf = TestBuffer {
            header: BufferHeader {
                max_entries: 4,
                cursor: 5,
            },
            entries: [HeapChunk { base: 0, size: 0 }; 4],
        };
        let addr = RemotePtr::<BufferHeader>::new(&mut buf as *mut TestBuffer as usize);

        match drain_shared_buffer(getpid(), addr, &mut |_, _| ()) {
            Ok(_) => panic!("cursor violation not detected"),
            Err(Error::CursorOutOfRange {
                cursor,
                max_entries,
            }) => {
                assert_eq!(cursor, 5);
                assert_eq!(max_entries, 4);
            }
            Err(err) if transfer_unavailable(&err) => eprintln!("skipping: {}", err),
            Err(err) => panic!("{}", err),
        }
    }
}
