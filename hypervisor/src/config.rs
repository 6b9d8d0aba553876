//! Values shared by every virtual processor.
//!
//! A [`HypervisorConfig`] is built once, validated and leaked so that each
//! [`Vcpu`](crate::vmx::vcpu::Vcpu) can hold a `&'static` reference to it.

use crate::error::{InvalidConfigSnafu, Result};
use alloc::boxed::Box;
use snafu::ensure;
use x86::{segmentation::SegmentSelector, Ring};

/// Null, host code, and the two halves of the 64-bit TSS descriptor.
pub const HOST_GDT_DESCRIPTOR_COUNT: usize = 4;
pub const HOST_IDT_DESCRIPTOR_COUNT: usize = 256;
pub const HOST_STACK_SIZE: usize = 0x6000;

/// Amount of virtual memory mapped by a single PML4 entry (512 GiB).
pub const PML4_ENTRY_COVERAGE: u64 = 1 << 39;
const PML4_ENTRY_COUNT: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypervisorConfig {
    /// Selector of the code descriptor in the host GDT.
    pub host_cs_selector: SegmentSelector,
    /// Selector of the 16-byte TSS descriptor in the host GDT.
    pub host_tr_selector: SegmentSelector,
    /// VPID tagging the guest's TLB entries. Zero is reserved for the host.
    pub guest_vpid: u16,
    /// PML4 slot that direct-maps host physical memory.
    pub physical_memory_pml4_index: usize,
    /// Size of the direct physical-memory window in bytes.
    pub physical_memory_size: u64,
    /// Number of round trips used to measure the exit latency.
    pub tsc_latency_samples: usize,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            host_cs_selector: SegmentSelector::new(1, Ring::Ring0),
            host_tr_selector: SegmentSelector::new(2, Ring::Ring0),
            guest_vpid: 1,
            physical_memory_pml4_index: 255,
            physical_memory_size: 128 * 1024 * 1024 * 1024,
            tsc_latency_samples: 10,
        }
    }
}

impl HypervisorConfig {
    /// Virtual base address of the direct physical-memory window.
    ///
    /// Upper-half slots are sign-extended to keep the address canonical.
    pub fn physical_memory_base(&self) -> u64 {
        let base = (self.physical_memory_pml4_index as u64) << 39;
        if base & (1 << 47) != 0 {
            base | 0xFFFF_0000_0000_0000
        } else {
            base
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.guest_vpid != 0,
            InvalidConfigSnafu {
                reason: "guest VPID must not be zero"
            }
        );

        let cs = self.host_cs_selector;
        let tr = self.host_tr_selector;
        ensure!(
            cs.bits() & 0b111 == 0 && tr.bits() & 0b111 == 0,
            InvalidConfigSnafu {
                reason: "host selectors must reference the GDT with RPL 0"
            }
        );

        let cs_index = cs.index() as usize;
        let tr_index = tr.index() as usize;
        ensure!(
            cs_index != 0 && cs_index < HOST_GDT_DESCRIPTOR_COUNT,
            InvalidConfigSnafu {
                reason: "host CS selector is outside the host GDT"
            }
        );
        ensure!(
            tr_index != 0 && tr_index + 1 < HOST_GDT_DESCRIPTOR_COUNT,
            InvalidConfigSnafu {
                reason: "host TR selector leaves no room for a 16-byte TSS descriptor"
            }
        );
        ensure!(
            cs_index != tr_index && cs_index != tr_index + 1,
            InvalidConfigSnafu {
                reason: "host CS selector overlaps the TSS descriptor"
            }
        );

        ensure!(
            self.physical_memory_pml4_index < PML4_ENTRY_COUNT,
            InvalidConfigSnafu {
                reason: "physical memory PML4 index is out of range"
            }
        );
        ensure!(
            self.physical_memory_size != 0 && self.physical_memory_size <= PML4_ENTRY_COVERAGE,
            InvalidConfigSnafu {
                reason: "physical memory window must fit in a single PML4 entry"
            }
        );

        ensure!(
            self.tsc_latency_samples != 0,
            InvalidConfigSnafu {
                reason: "at least one latency sample is required"
            }
        );

        Ok(())
    }

    /// Validates the configuration and moves it to a `'static` location.
    pub fn leak(self) -> Result<&'static Self> {
        self.validate()?;

        Ok(Box::leak(Box::new(self)))
    }
}
