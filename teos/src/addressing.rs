//! User virtual memory addressing.
//!
//! The user address space is the 32-bit range below [`USER_TOP`]; everything
//! at or above it belongs to the kernel. The [`Va`] newtype wraps a user
//! virtual address and guarantees, by construction, that it lies inside the
//! user range. Address arithmetic that would leave the range fails instead
//! of wrapping.

/// The size of a single page in memory, in bytes.
pub const PAGE_SIZE: usize = 0x1000;

/// The shift amount to get the page number from an address.
pub const PAGE_SHIFT: usize = 12;

/// A mask for extracting the offset within a page from an address.
pub const PAGE_MASK: usize = 0xfff;

/// First address above the user address space.
///
/// User mappings live in `[PAGE_SIZE, USER_TOP)`. Page 0 is never mappable
/// so that null-pointer dereferences in user code fault instead of reading
/// something.
pub const USER_TOP: usize = 0xc000_0000;

/// A user virtual address.
///
/// Always strictly below [`USER_TOP`]. `Va` is a plain value type; it does
/// not imply that anything is mapped at the address.
#[repr(transparent)]
#[derive(Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct Va(usize);

impl Va {
    /// Creates a new user virtual address if `addr` is inside the user
    /// address space.
    #[inline]
    pub const fn new(addr: usize) -> Option<Self> {
        if addr < USER_TOP { Some(Self(addr)) } else { None }
    }

    /// Cast the address into a raw `usize`.
    #[inline]
    pub const fn into_usize(self) -> usize {
        self.0
    }

    /// The base address of the page containing this address.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !PAGE_MASK)
    }

    /// The offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & PAGE_MASK
    }

    /// Address `bytes` above this one, if still a user address.
    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).and_then(Va::new)
    }

    /// Address `bytes` below this one, if it does not wrap below zero.
    #[inline]
    pub fn checked_sub(self, bytes: usize) -> Option<Self> {
        self.0.checked_sub(bytes).map(Self)
    }
}

impl core::fmt::Debug for Va {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Va({:#x})", self.0)
    }
}
