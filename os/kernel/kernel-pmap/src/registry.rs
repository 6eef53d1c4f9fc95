//! The set of all live address spaces.
//!
//! Kernel page-directory slots are replicated into every directory, so any
//! change to one of them is applied by walking this registry. All walks
//! happen under the registry lock, which is innermost in the lock order: no
//! other lock may be acquired while it is held.

use crate::address_space::{AddressSpace, AsId};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use kernel_sync::SpinMutex;

pub(crate) struct Registry {
    spaces: SpinMutex<BTreeMap<AsId, Arc<AddressSpace>>>,
}

impl Registry {
    pub(crate) const fn new() -> Self {
        Self {
            spaces: SpinMutex::new(BTreeMap::new()),
        }
    }

    /// Register `space`, running `init` under the registry lock so that it
    /// observes no concurrent kernel-slot update half-applied.
    pub(crate) fn insert_with(&self, space: Arc<AddressSpace>, init: impl FnOnce(&AddressSpace)) {
        let mut spaces = self.spaces.lock();
        init(&space);
        let prev = spaces.insert(space.id(), space);
        assert!(prev.is_none(), "address space registered twice");
    }

    pub(crate) fn remove(&self, id: AsId) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().remove(&id)
    }

    pub(crate) fn get(&self, id: AsId) -> Option<Arc<AddressSpace>> {
        self.spaces.lock().get(&id).cloned()
    }

    /// Run `f` on every registered space, the kernel's included.
    pub(crate) fn for_each(&self, mut f: impl FnMut(&AddressSpace)) {
        let spaces = self.spaces.lock();
        for space in spaces.values() {
            f(space);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.spaces.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpuset::CpuSet;
    use kernel_memory_addresses::{PhysicalAddress, PhysicalPage};

    fn space(id: u32) -> Arc<AddressSpace> {
        let directory = PhysicalPage::from_addr(PhysicalAddress::new(id << 12));
        Arc::new(AddressSpace::new(AsId::new(id), directory, CpuSet::EMPTY))
    }

    static REGISTRY: Registry = Registry::new();

    #[test]
    fn registry_tracks_spaces_by_id() {
        let registry = Registry::new();
        let mut seen = 0;
        registry.insert_with(space(2), |s| seen = s.id().as_u32());
        registry.insert_with(space(1), |_| {});
        assert_eq!(seen, 2);
        assert_eq!(registry.len(), 2);

        let mut order = alloc::vec::Vec::new();
        registry.for_each(|s| order.push(s.id().as_u32()));
        assert_eq!(order, [1, 2]);

        assert!(registry.get(AsId::new(2)).is_some());
        assert!(registry.remove(AsId::new(2)).is_some());
        assert!(registry.get(AsId::new(2)).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registry_can_be_a_static() {
        REGISTRY.insert_with(space(7), |_| {});
        assert_eq!(REGISTRY.remove(AsId::new(7)).map(|s| s.id()), Some(AsId::new(7)));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn duplicate_ids_are_refused() {
        let registry = Registry::new();
        registry.insert_with(space(3), |_| {});
        registry.insert_with(space(3), |_| {});
    }
}
