//! Small shared helpers.

use lazy_static::lazy_static;

lazy_static! {
    static ref PAGE_SIZE: usize =
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
}

/// Page size of the observer. The target is assumed to use the same page
/// size; there is no way to query a foreign process for it.
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Round `size` up to the next page boundary.
pub fn ceil_page_size(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}
