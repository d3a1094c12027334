//! `/proc/[pid]/maps`

use alloc::{string::String, vec::Vec};
use core::fmt::Write;

use super::vma::Vma;
use super::{MappingState, MemoryManager};
use crate::addr::{AddrRange, Access, VirtualAddress};
use crate::error::{Error, Result};
use crate::sync::CleanLockToken;

/// Column at which the name starts, if the line is shorter.
const NAME_COLUMN: usize = 73;

/// One line of `/proc/[pid]/maps`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapsEntry {
    pub range: AddrRange,
    pub perms: Access,
    pub private: bool,
    pub offset: u64,
    pub dev_major: u32,
    pub dev_minor: u32,
    pub inode: u64,
    /// Path, hint, `[heap]`, `[stack]` or nothing.
    pub name: String,
}

impl MapsEntry {
    fn new(ms: &MappingState, range: AddrRange, vma: &Vma) -> Self {
        let (dev_major, dev_minor) = vma.id.as_ref().map_or((0, 0), |id| id.device());
        let name = if let Some(hint) = &vma.hint {
            hint.clone()
        } else if let Some(id) = &vma.id {
            id.mapped_name()
        } else if !ms.brk.is_empty() && range.overlaps(ms.brk) {
            String::from("[heap]")
        } else if vma.grows_down {
            String::from("[stack]")
        } else {
            String::new()
        };
        Self {
            range,
            perms: vma.real_perms,
            private: vma.private,
            offset: if vma.mappable.is_some() { vma.offset } else { 0 },
            dev_major,
            dev_minor,
            inode: vma.id.as_ref().map_or(0, |id| id.inode()),
            name,
        }
    }

    /// The line as Linux prints it, without the newline.
    pub fn line(&self) -> String {
        let rwx = self.perms.rwx();
        let mut line = String::new();
        // Writing to a String cannot fail.
        let _ = write!(
            line,
            "{:08x}-{:08x} {}{}{}{} {:08x} {:02x}:{:02x} {} ",
            self.range.start().data(),
            self.range.end().data(),
            rwx[0] as char,
            rwx[1] as char,
            rwx[2] as char,
            if self.private { 'p' } else { 's' },
            self.offset,
            self.dev_major,
            self.dev_minor,
            self.inode,
        );
        if !self.name.is_empty() {
            while line.len() < NAME_COLUMN {
                line.push(' ');
            }
            line.push_str(&self.name);
        }
        line
    }
}

impl MemoryManager {
    /// Call `f` for every mapping in ascending order. The memory manager is
    /// not locked while `f` runs.
    pub fn for_each_map(&self, token: &mut CleanLockToken, mut f: impl FnMut(&MapsEntry)) {
        let entries: Vec<MapsEntry> = {
            let ms = self.mapping.read(token.token());
            ms.vmas.iter().map(|(range, vma)| MapsEntry::new(&ms, range, vma)).collect()
        };
        for entry in &entries {
            f(entry);
        }
    }

    /// The mapping covering `addr`.
    pub fn query(&self, addr: VirtualAddress, token: &mut CleanLockToken) -> Result<MapsEntry> {
        let ms = self.mapping.read(token.token());
        let (range, vma) = ms.vmas.contains(addr).ok_or(Error::NotFound)?;
        Ok(MapsEntry::new(&ms, range, vma))
    }

    /// The contents of `/proc/[pid]/maps`.
    pub fn maps_text(&self, token: &mut CleanLockToken) -> String {
        let mut text = String::new();
        self.for_each_map(token, |entry| {
            text.push_str(&entry.line());
            text.push('\n');
        });
        text
    }
}
