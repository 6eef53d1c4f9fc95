//! # Memory attributes
//!
//! Maps the machine-independent cache mode of a physical page onto the
//! three entry bits (`PAT`, `PCD`, `PWT`) that select one of eight entries
//! in the PAT MSR.

/// Cache mode of a physical page or mapping.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum MemAttr {
    /// Strong uncacheable (`UC`).
    Uncacheable = 0,
    /// Write combining (`WC`).
    WriteCombining = 1,
    /// Write through (`WT`).
    WriteThrough = 4,
    /// Write protected (`WP`).
    WriteProtected = 5,
    /// Write back (`WB`), the default for RAM.
    #[default]
    WriteBack = 6,
    /// Weak uncacheable (`UC-`), overridable by MTRRs.
    WeakUncacheable = 7,
}

impl MemAttr {
    #[inline]
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Uncacheable,
            1 => Self::WriteCombining,
            4 => Self::WriteThrough,
            5 => Self::WriteProtected,
            6 => Self::WriteBack,
            7 => Self::WeakUncacheable,
            _ => return None,
        })
    }

    #[inline]
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// The three PAT index bits as they appear in an entry.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct CacheBits {
    /// PAT index bit 2.
    pub pat: bool,
    /// PAT index bit 1.
    pub pcd: bool,
    /// PAT index bit 0.
    pub pwt: bool,
}

impl CacheBits {
    #[inline]
    #[must_use]
    pub const fn from_index(index: u8) -> Self {
        Self {
            pat: index & 4 != 0,
            pcd: index & 2 != 0,
            pwt: index & 1 != 0,
        }
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> u8 {
        ((self.pat as u8) << 2) | ((self.pcd as u8) << 1) | (self.pwt as u8)
    }
}

/// PAT MSR layout and the mode-to-index table that goes with it.
///
/// With a fully working PAT the upper four entries are reprogrammed to add
/// write-protect and write-combining. CPUs whose PAT bit in the entry is
/// unreliable keep the power-on layout except that entry 2 becomes
/// write-combining; write-protect then degrades to uncacheable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PatLayout {
    pat_works: bool,
}

impl PatLayout {
    #[must_use]
    pub const fn new(pat_works: bool) -> Self {
        Self { pat_works }
    }

    #[must_use]
    pub const fn pat_works(self) -> bool {
        self.pat_works
    }

    /// Value to program into the PAT MSR, one byte per entry.
    #[must_use]
    pub const fn msr_value(self) -> u64 {
        const fn entry(i: u32, mode: MemAttr) -> u64 {
            (mode as u64) << (i * 8)
        }
        if self.pat_works {
            entry(0, MemAttr::WriteBack)
                | entry(1, MemAttr::WriteThrough)
                | entry(2, MemAttr::WeakUncacheable)
                | entry(3, MemAttr::Uncacheable)
                | entry(4, MemAttr::WriteProtected)
                | entry(5, MemAttr::WriteCombining)
                | entry(6, MemAttr::WeakUncacheable)
                | entry(7, MemAttr::Uncacheable)
        } else {
            entry(0, MemAttr::WriteBack)
                | entry(1, MemAttr::WriteThrough)
                | entry(2, MemAttr::WriteCombining)
                | entry(3, MemAttr::Uncacheable)
                | entry(4, MemAttr::WriteBack)
                | entry(5, MemAttr::WriteThrough)
                | entry(6, MemAttr::WriteCombining)
                | entry(7, MemAttr::Uncacheable)
        }
    }

    /// PAT index selecting `mode`.
    #[must_use]
    pub const fn index(self, mode: MemAttr) -> u8 {
        if self.pat_works {
            match mode {
                MemAttr::WriteBack => 0,
                MemAttr::WriteThrough => 1,
                MemAttr::WeakUncacheable => 2,
                MemAttr::Uncacheable => 3,
                MemAttr::WriteProtected => 4,
                MemAttr::WriteCombining => 5,
            }
        } else {
            match mode {
                MemAttr::WriteBack => 0,
                MemAttr::WriteThrough => 1,
                MemAttr::WriteCombining => 2,
                MemAttr::Uncacheable | MemAttr::WeakUncacheable | MemAttr::WriteProtected => 3,
            }
        }
    }

    /// Entry bits selecting `mode`.
    #[must_use]
    pub const fn bits(self, mode: MemAttr) -> CacheBits {
        CacheBits::from_index(self.index(mode))
    }
}
