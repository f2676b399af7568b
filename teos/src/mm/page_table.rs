//! Per-process page tables.
//!
//! A [`PageTable`] maps page-aligned user virtual addresses to owned frames
//! plus their protection and status bits. The kernel accesses user memory
//! exclusively through [`PageTable::with_page`] and
//! [`PageTable::with_page_mut`], which enforce the writable bit and
//! maintain the accessed/dirty bits the same way an MMU would. The
//! accessed bits are what user-stack placement probes when a new user
//! thread needs a stack slot.
//!
//! Page 0 is reserved and can never be mapped, so user null-pointer
//! dereferences reliably fault.

use super::Page;
use crate::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
};
use alloc::collections::BTreeMap;

bitflags::bitflags! {
    /// Protection and status bits of a page-table entry.
    pub struct PteFlags: u8 {
        /// The page may be written by user code.
        const WRITABLE = 1 << 0;
        /// The page has been read or written since it was mapped.
        const ACCESSED = 1 << 1;
        /// The page has been written since it was mapped.
        const DIRTY = 1 << 2;
    }
}

/// A page-table entry: an owned frame and its bits.
pub struct Pte {
    page: Page,
    flags: PteFlags,
}

impl Pte {
    /// The entry's protection and status bits.
    pub fn flags(&self) -> PteFlags {
        self.flags
    }
}

/// The mapping from user virtual pages to frames for one address space.
pub struct PageTable {
    entries: BTreeMap<usize, Pte>,
}

impl PageTable {
    /// Creates an empty page table.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Maps `page` at the page-aligned address `va`.
    ///
    /// Fails if `va` is not page aligned, lies in the reserved zero page,
    /// or is already mapped.
    pub fn map(&mut self, va: Va, page: Page, writable: bool) -> Result<(), KernelError> {
        let base = va.into_usize();
        if base & (PAGE_SIZE - 1) != 0 || base < PAGE_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        if self.entries.contains_key(&base) {
            return Err(KernelError::Busy);
        }
        let mut flags = PteFlags::empty();
        if writable {
            flags |= PteFlags::WRITABLE;
        }
        self.entries.insert(base, Pte { page, flags });
        Ok(())
    }

    /// Removes the mapping at `va`, returning the frame if one was mapped.
    pub fn unmap(&mut self, va: Va) -> Option<Page> {
        self.entries.remove(&va.page_base().into_usize()).map(|pte| pte.page)
    }

    /// Whether anything is mapped at the page containing `va`.
    pub fn is_mapped(&self, va: Va) -> bool {
        self.entries.contains_key(&va.page_base().into_usize())
    }

    /// Whether the page containing `va` is mapped and has been touched.
    pub fn is_accessed(&self, va: Va) -> bool {
        self.entries
            .get(&va.page_base().into_usize())
            .map(|pte| pte.flags.contains(PteFlags::ACCESSED))
            .unwrap_or(false)
    }

    /// The entry for the page containing `va`, if mapped.
    pub fn lookup(&self, va: Va) -> Option<&Pte> {
        self.entries.get(&va.page_base().into_usize())
    }

    /// Runs `f` over the contents of the page containing `va`, marking it
    /// accessed. Returns `None` if nothing is mapped there.
    pub fn with_page<R>(&mut self, va: Va, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let pte = self.entries.get_mut(&va.page_base().into_usize())?;
        pte.flags |= PteFlags::ACCESSED;
        Some(f(pte.page.inner()))
    }

    /// Runs `f` over the mutable contents of the page containing `va`,
    /// marking it accessed and dirty. Returns `None` if nothing is mapped
    /// there or the page is not writable.
    pub fn with_page_mut<R>(&mut self, va: Va, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let pte = self.entries.get_mut(&va.page_base().into_usize())?;
        if !pte.flags.contains(PteFlags::WRITABLE) {
            return None;
        }
        pte.flags |= PteFlags::ACCESSED | PteFlags::DIRTY;
        Some(f(pte.page.inner_mut()))
    }

    /// The number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.entries.len()
    }

    /// Iterates over the mapped pages, lowest address first.
    pub fn iter(&self) -> impl Iterator<Item = (Va, &Pte)> {
        self.entries
            .iter()
            .map(|(base, pte)| (Va::new(*base).unwrap(), pte))
    }
}
