//! Memory types of kernel ranges and of single pages.

use super::Pmap;
use crate::cache::MemAttr;
use crate::error::PmapError;
use crate::platform::{Machine, Pinned};
use crate::supplier::{PageSupplier, VmPage};
use kernel_info::memory::{PAGE_SIZE, VM_MAX_KERNEL_ADDRESS, VM_MIN_KERNEL_ADDRESS};
use kernel_memory_addresses::{Size4K, VirtualAddress};
use log::debug;

impl<M: Machine, S: PageSupplier> Pmap<M, S> {
    /// Give every page of the kernel range `[va, va + size)` the memory type
    /// `mode`, then flush the range from the caches.
    ///
    /// Superpages in the range are demoted first, also those that would fit
    /// entirely, so that every entry of the range can be rewritten alike.
    /// Demotions already done stay done if the call fails.
    ///
    /// # Errors
    /// - [`PmapError::InvalidAddress`] if the range leaves the kernel range.
    /// - [`PmapError::NotMapped`] at the first page without a translation.
    /// - [`PmapError::DemotionFailed`] if a superpage could not be split.
    pub fn change_attr(&self, va: VirtualAddress, size: u32, mode: MemAttr) -> Result<(), PmapError> {
        let base = va.align_down::<Size4K>();
        let Some(end) = va.checked_add(size).map(VirtualAddress::align_up::<Size4K>) else {
            return Err(PmapError::InvalidAddress(va));
        };
        if base.as_u32() < VM_MIN_KERNEL_ADDRESS || end.as_u32() > VM_MAX_KERNEL_ADDRESS {
            return Err(PmapError::InvalidAddress(va));
        }
        if base == end {
            return Ok(());
        }

        let changed = {
            let mut pv = self.pv.write();
            let _pin = Pinned::new(&self.machine);
            let kernel = &*self.kernel;
            let mut state = kernel.state.lock();

            let mut at = base;
            while at < end {
                let pde = self.pde(kernel, at).load();
                if !pde.present() {
                    return Err(PmapError::NotMapped(at));
                }
                if pde.superpage() && !self.demote_pde(kernel, &mut state, &mut pv, at) {
                    return Err(PmapError::DemotionFailed(at));
                }
                if self.kernel_pte(at).load().is_zero() {
                    return Err(PmapError::NotMapped(at));
                }
                at += PAGE_SIZE;
            }

            let bits = self.pat.bits(mode);
            let mut changed = false;
            let mut at = base;
            while at < end {
                let slot = self.kernel_pte(at);
                let mut old = slot.load();
                while old.cache() != bits {
                    match slot.compare_exchange(old, old.with_cache(bits)) {
                        Ok(_) => {
                            changed = true;
                            break;
                        }
                        Err(current) => old = current,
                    }
                }
                at += PAGE_SIZE;
            }
            if changed {
                self.invalidate_range(kernel, base, end);
            }
            changed
        };

        if changed {
            debug!("memory type of {base}..{end} is now {mode:?}");
            self.invalidate_cache_range(base, end);
        }
        Ok(())
    }

    /// Record `mode` as the memory type of `m`, used by every later mapping
    /// of the page. Lines the page left in the caches under its old type are
    /// written back through a temporary window.
    pub fn page_set_memattr(&self, m: &VmPage, mode: MemAttr) {
        let old = m.memattr();
        m.store_memattr(mode);
        if old == mode || m.is_fictitious() || self.machine.features().self_snoop {
            return;
        }
        self.with_windows([(m.phys(), self.pat.bits(mode))], |[w]| {
            self.invalidate_cache_range(w.va, w.va + PAGE_SIZE);
        });
    }
}
