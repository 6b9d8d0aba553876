//! Translation through the host's direct physical-memory window.

use crate::config::HypervisorConfig;
use core::ptr::NonNull;

/// A fixed virtual window that maps physical memory starting at `0`.
///
/// ```text
///  base                      base + size
///  |-------------------------|
///  PA 0                      PA size
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhysicalMemoryMap {
    base: u64,
    size: u64,
}

impl PhysicalMemoryMap {
    pub fn new(config: &HypervisorConfig) -> Self {
        Self {
            base: config.physical_memory_base(),
            size: config.physical_memory_size,
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn contains(&self, physical_address: u64) -> bool {
        physical_address < self.size
    }

    /// Returns the virtual address of `physical_address`, or `None` if it lies
    /// outside the window.
    pub fn try_translate(&self, physical_address: u64) -> Option<NonNull<u8>> {
        if !self.contains(physical_address) {
            return None;
        }

        let address = self.base.checked_add(physical_address)?;

        NonNull::new(address as *mut u8)
    }

    /// Like [`PhysicalMemoryMap::try_translate`] but also requires the
    /// resulting pointer to be aligned for `T`.
    pub fn try_translate_as<T>(&self, physical_address: u64) -> Option<NonNull<T>> {
        let end = physical_address.checked_add(core::mem::size_of::<T>() as u64)?;
        if end > self.size {
            return None;
        }

        let ptr = self.try_translate(physical_address)?.cast::<T>();
        if ptr.as_ptr() as usize % core::mem::align_of::<T>() != 0 {
            return None;
        }

        Some(ptr)
    }

    /// Unchecked translation for hot paths that already validated the address.
    pub fn translate(&self, physical_address: u64) -> *mut u8 {
        debug_assert!(
            self.contains(physical_address),
            "physical address {:#x} is outside the direct map",
            physical_address
        );

        self.base.wrapping_add(physical_address) as *mut u8
    }
}
