//! Access permissions and residency reports.

use bitfield_struct::bitfield;

/// Requested access rights of a mapping, or the access that caused a fault.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Prot {
    pub read: bool,
    pub write: bool,
    /// Accepted for interface compatibility; the classic entry format has no
    /// execute-disable bit, so every readable mapping is executable.
    pub execute: bool,
    #[bits(5)]
    __: u8,
}

impl Prot {
    pub const NONE: Self = Self::new();
    pub const READ: Self = Self::new().with_read(true);
    pub const READ_WRITE: Self = Self::READ.with_write(true);
    pub const ALL: Self = Self::READ_WRITE.with_execute(true);

    #[inline]
    #[must_use]
    pub const fn is_none(self) -> bool {
        !self.read() && !self.write() && !self.execute()
    }
}

/// Residency of one page as reported by [`Pmap::mincore`](crate::Pmap::mincore).
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct Mincore {
    pub incore: bool,
    pub referenced: bool,
    pub modified: bool,
    pub referenced_other: bool,
    pub modified_other: bool,
    /// Mapped by a superpage.
    pub superpage: bool,
    #[bits(2)]
    __: u8,
}
