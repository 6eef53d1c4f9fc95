use crate::platform::PhysMemory;
use alloc::boxed::Box;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};
use kernel_info::memory::NPTEPG;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};

type Frame = [AtomicU32; NPTEPG];

/// Physical memory of the emulated machine, starting at address zero.
pub struct EmulatedMemory {
    frames: Vec<Box<Frame>>,
}

impl EmulatedMemory {
    #[must_use]
    pub fn new(frames: usize) -> Self {
        Self {
            frames: (0..frames)
                .map(|_| Box::new([const { AtomicU32::new(0) }; NPTEPG]))
                .collect(),
        }
    }

    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Read the aligned word at `pa`.
    #[must_use]
    pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        self.word(pa).load(Ordering::Acquire)
    }

    pub fn write_u32(&self, pa: PhysicalAddress, value: u32) {
        self.word(pa).store(value, Ordering::Release);
    }

    fn word(&self, pa: PhysicalAddress) -> &AtomicU32 {
        let (page, off) = pa.split::<Size4K>();
        &self.words(page)[(off / 4) as usize]
    }
}

impl PhysMemory for EmulatedMemory {
    fn words(&self, page: PhysicalPage<Size4K>) -> &[AtomicU32; NPTEPG] {
        match self.frames.get(page.index() as usize) {
            Some(frame) => frame,
            None => panic!("physical access to {page} beyond emulated memory"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_are_addressed_physically() {
        let mem = EmulatedMemory::new(4);
        mem.write_u32(PhysicalAddress::new(0x2008), 0xDEAD_BEEF);
        let page = PhysicalPage::from_addr(PhysicalAddress::new(0x2000));
        assert_eq!(mem.words(page)[2].load(Ordering::Relaxed), 0xDEAD_BEEF);
        assert_eq!(mem.read_u32(PhysicalAddress::new(0x1008)), 0);
    }

    #[test]
    #[should_panic(expected = "beyond emulated memory")]
    fn out_of_range_access_panics() {
        let mem = EmulatedMemory::new(1);
        let _ = mem.words(PhysicalPage::from_addr(PhysicalAddress::new(0x1000)));
    }
}
