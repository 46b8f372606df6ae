//! `/proc/<pid>/maps` parsing and the two queries the rest of the crate
//! needs: lookup by address, and lookup by equivalence.
//!
//! Entries are parsed on demand and never cached; a mapping snapshot is only
//! valid for the operation that took it.

use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::ControlFlow;

use bitflags::bitflags;
use nix::unistd::Pid;

use crate::error::{Error, Result};

bitflags! {
    /// Permission column of a maps line.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct MapPerms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const PRIVATE = 1 << 3;
        const SHARED = 1 << 4;
    }
}

impl MapPerms {
    /// Parse the kernel's fixed 4-character form, e.g. `r-xp`.
    fn parse(s: &str) -> Option<MapPerms> {
        let b = s.as_bytes();
        if b.len() != 4 {
            return None;
        }
        let mut perms = MapPerms::empty();
        match b[0] {
            b'r' => perms |= MapPerms::READ,
            b'-' => {}
            _ => return None,
        }
        match b[1] {
            b'w' => perms |= MapPerms::WRITE,
            b'-' => {}
            _ => return None,
        }
        match b[2] {
            b'x' => perms |= MapPerms::EXEC,
            b'-' => {}
            _ => return None,
        }
        match b[3] {
            b'p' => perms |= MapPerms::PRIVATE,
            b's' => perms |= MapPerms::SHARED,
            b'-' => {}
            _ => return None,
        }
        Some(perms)
    }
}

impl fmt::Display for MapPerms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}",
            if self.contains(MapPerms::READ) { 'r' } else { '-' },
            if self.contains(MapPerms::WRITE) { 'w' } else { '-' },
            if self.contains(MapPerms::EXEC) { 'x' } else { '-' },
            if self.contains(MapPerms::SHARED) {
                's'
            } else if self.contains(MapPerms::PRIVATE) {
                'p'
            } else {
                '-'
            },
        )
    }
}

/// One line of `/proc/<pid>/maps`: a single contiguous VMA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapsEntry {
    pub start: usize,
    /// Exclusive; always greater than `start`.
    pub end: usize,
    pub perms: MapPerms,
    pub offset: u64,
    pub device: String,
    pub inode: u64,
    /// Backing path. Empty for plain anonymous mappings, or a synthetic
    /// `[...]` tag such as `[heap]` or `[anon:libc_malloc]`.
    pub pathname: String,
}

impl MapsEntry {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Two entries are equivalent when they have the same length,
    /// permissions and backing path. For a shared library mapped in two
    /// processes this identifies the same file region independent of each
    /// process's ASLR base.
    pub fn is_equivalent_to(&self, other: &MapsEntry) -> bool {
        self.len() == other.len()
            && self.perms == other.perms
            && self.pathname == other.pathname
    }
}

impl fmt::Display for MapsEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:x}-{:x} {} {:08x} {} {} {}",
            self.start, self.end, self.perms, self.offset, self.device, self.inode, self.pathname
        )
    }
}

/// Parse one maps line. The pathname column is optional and may contain
/// spaces; everything after the inode belongs to it. Returns None for lines
/// that don't carry the six mandatory fields.
fn parse_line(line: &str) -> Option<MapsEntry> {
    let (range, rest) = line.split_once(' ')?;
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    if start >= end {
        return None;
    }

    let mut fields = rest.splitn(5, ' ');
    let perms = MapPerms::parse(fields.next()?)?;
    let offset = u64::from_str_radix(fields.next()?, 16).ok()?;
    let device = fields.next()?.to_owned();
    let inode = fields.next()?.parse().ok()?;
    let pathname = fields.next().unwrap_or("").trim_start().to_owned();

    Some(MapsEntry {
        start,
        end,
        perms,
        offset,
        device,
        inode,
        pathname,
    })
}

/// Feed every region of `pid` to `visitor` until it breaks or the file
/// ends. Failing to open or read the maps file is an error; unparsable
/// lines are silently skipped. Lines are read as raw bytes: a pathname
/// that is not valid UTF-8 is carried lossily rather than failing the
/// whole walk.
pub fn iterate<F>(pid: Pid, mut visitor: F) -> Result<()>
where
    F: FnMut(&MapsEntry) -> ControlFlow<()>,
{
    let path = format!("/proc/{}/maps", pid);
    let file = File::open(&path).map_err(|source| Error::Maps { pid, source })?;

    let mut reader = BufReader::new(file);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        let n = reader
            .read_until(b'\n', &mut raw)
            .map_err(|source| Error::Maps { pid, source })?;
        if n == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&raw);
        let entry = match parse_line(line.trim_end_matches('\n')) {
            Some(entry) => entry,
            None => continue,
        };
        if let ControlFlow::Break(()) = visitor(&entry) {
            break;
        }
    }
    Ok(())
}

/// The region of `pid` containing `addr`, if any.
pub fn find_by_address(pid: Pid, addr: usize) -> Result<Option<MapsEntry>> {
    let mut found = None;
    iterate(pid, |entry| {
        if entry.contains(addr) {
            found = Some(entry.clone());
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok(found)
}

/// The first region of `pid` equivalent to `reference` (same length,
/// permissions and backing path).
pub fn find_equivalent(pid: Pid, reference: &MapsEntry) -> Result<Option<MapsEntry>> {
    let mut found = None;
    iterate(pid, |entry| {
        if entry.is_equivalent_to(reference) {
            found = Some(entry.clone());
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    })?;
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn parses_a_file_backed_line() {
        let entry =
            parse_line("7f1234560000-7f1234580000 r-xp 00001000 08:02 173521 /usr/lib/libfoo.so")
                .unwrap();
        assert_eq!(entry.start, 0x7f1234560000);
        assert_eq!(entry.end, 0x7f1234580000);
        assert_eq!(entry.len(), 0x20000);
        assert_eq!(entry.perms, MapPerms::READ | MapPerms::EXEC | MapPerms::PRIVATE);
        assert_eq!(entry.offset, 0x1000);
        assert_eq!(entry.device, "08:02");
        assert_eq!(entry.inode, 173521);
        assert_eq!(entry.pathname, "/usr/lib/libfoo.so");
    }

    #[test]
    fn parses_an_anonymous_line_without_pathname() {
        let entry = parse_line("7fff0000-7fff2000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(entry.pathname, "");
        assert_eq!(entry.perms, MapPerms::READ | MapPerms::WRITE | MapPerms::PRIVATE);
    }

    #[test]
    fn keeps_spaces_inside_the_pathname() {
        let entry =
            parse_line("1000-2000 r--s 00000000 fd:01 99 /tmp/with space (deleted)").unwrap();
        assert_eq!(entry.pathname, "/tmp/with space (deleted)");
        assert_eq!(entry.perms, MapPerms::READ | MapPerms::SHARED);
    }

    #[test]
    fn parses_a_named_anonymous_heap_tag() {
        let entry = parse_line("c000-d000 rw-p 00000000 00:00 0 [anon:scudo:primary]").unwrap();
        assert_eq!(entry.pathname, "[anon:scudo:primary]");
    }

    #[test]
    fn tolerates_non_utf8_pathnames() {
        let raw: &[u8] = b"1000-2000 r--p 00000000 00:00 5 /tmp/b\xff\xfed\n";
        let line = String::from_utf8_lossy(raw);
        let entry = parse_line(line.trim_end_matches('\n')).unwrap();
        assert!(entry.pathname.starts_with("/tmp/b"), "{}", entry.pathname);
        assert_eq!(entry.inode, 5);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(parse_line("").is_none());
        assert!(parse_line("not a maps line").is_none());
        assert!(parse_line("2000-1000 rw-p 00000000 00:00 0").is_none());
        assert!(parse_line("1000-2000 bogus 00000000 00:00 0").is_none());
        assert!(parse_line("1000-2000 rw-p").is_none());
    }

    #[test]
    fn permission_string_round_trips() {
        for s in ["rwxp", "r--p", "---p", "rw-s", "r-xp"] {
            assert_eq!(MapPerms::parse(s).unwrap().to_string(), s);
        }
    }

    #[test]
    fn finds_the_region_containing_a_local_static() {
        static MARKER: u64 = 0xfeed_face;
        let addr = &MARKER as *const u64 as usize;
        let entry = find_by_address(getpid(), addr)
            .expect("maps readable")
            .expect("static lives in some mapping");
        assert!(entry.contains(addr));
        assert!(entry.perms.contains(MapPerms::READ));
    }

    #[test]
    fn every_region_is_equivalent_to_itself_in_the_same_process() {
        let me = getpid();
        let entry = find_by_address(me, parse_line as usize)
            .expect("maps readable")
            .expect("our own code is mapped");
        let found = find_equivalent(me, &entry)
            .expect("maps readable")
            .expect("an equivalent region exists");
        assert!(found.is_equivalent_to(&entry));
    }
}
