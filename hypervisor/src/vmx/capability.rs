use crate::vmx::hw::{CpuidResult, Hardware};
use x86::msr::{
    IA32_FEATURE_CONTROL, IA32_VMX_BASIC, IA32_VMX_CR0_FIXED0, IA32_VMX_CR0_FIXED1,
    IA32_VMX_CR4_FIXED0, IA32_VMX_CR4_FIXED1,
};

const CPUID_VMX: u32 = 1 << 5;
const VMX_BASIC_TRUE_CONTROLS: u64 = 1 << 55;
const DEFAULT_MAX_PHYS_ADDR: u64 = 36;

/// Capability facts that never change while the processor is powered on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachedVcpuData {
    /// Physical address width in bits.
    pub max_phys_addr: u64,

    pub vmx_basic: u64,

    pub vmx_cr0_fixed0: u64,
    pub vmx_cr0_fixed1: u64,
    pub vmx_cr4_fixed0: u64,
    pub vmx_cr4_fixed1: u64,

    /// Bits that must stay clear in XCR0.
    pub xcr0_unsupported_mask: u64,

    /// `IA32_FEATURE_CONTROL` as it was before any adjustment.
    pub feature_control: u64,

    pub cpuid_01: CpuidResult,
}

impl CachedVcpuData {
    pub fn capture<H: Hardware + ?Sized>(hw: &H) -> Self {
        let max_extended_leaf = hw.cpuid(0x8000_0000, 0).eax;
        let max_phys_addr = if max_extended_leaf >= 0x8000_0008 {
            (hw.cpuid(0x8000_0008, 0).eax & 0xFF) as u64
        } else {
            DEFAULT_MAX_PHYS_ADDR
        };

        let xsave = hw.cpuid(0xD, 0);
        let supported_xcr0 = (xsave.edx as u64) << 32 | xsave.eax as u64;

        Self {
            max_phys_addr,
            vmx_basic: hw.rdmsr(IA32_VMX_BASIC),
            vmx_cr0_fixed0: hw.rdmsr(IA32_VMX_CR0_FIXED0),
            vmx_cr0_fixed1: hw.rdmsr(IA32_VMX_CR0_FIXED1),
            vmx_cr4_fixed0: hw.rdmsr(IA32_VMX_CR4_FIXED0),
            vmx_cr4_fixed1: hw.rdmsr(IA32_VMX_CR4_FIXED1),
            xcr0_unsupported_mask: !supported_xcr0,
            feature_control: hw.rdmsr(IA32_FEATURE_CONTROL),
            cpuid_01: hw.cpuid(1, 0),
        }
    }

    pub fn vmx_supported(&self) -> bool {
        self.cpuid_01.ecx & CPUID_VMX != 0
    }

    /// VMCS revision identifier, `IA32_VMX_BASIC[30:0]`.
    pub fn revision_id(&self) -> u32 {
        self.vmx_basic as u32 & !(1 << 31)
    }

    /// Whether the `IA32_VMX_TRUE_*_CTLS` MSRs must be used for the controls.
    pub fn true_controls(&self) -> bool {
        self.vmx_basic & VMX_BASIC_TRUE_CONTROLS != 0
    }

    /// Mask of physical address bits supported by the processor.
    pub fn physical_address_mask(&self) -> u64 {
        1u64.checked_shl(self.max_phys_addr as u32)
            .map_or(u64::MAX, |limit| limit - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmx::{hw::Hardware, mock::MockHardware};

    #[test]
    fn captures_capabilities() {
        let hw = MockHardware::capable();
        let cached = CachedVcpuData::capture(&hw);

        assert!(cached.vmx_supported());
        assert_eq!(cached.max_phys_addr, 39);
        assert_eq!(cached.physical_address_mask(), (1 << 39) - 1);
        assert_eq!(cached.revision_id(), 0x12);
        assert!(cached.true_controls());
        assert_eq!(cached.xcr0_unsupported_mask, !0x2E7);
    }

    #[test]
    fn capture_is_idempotent() {
        let hw = MockHardware::capable();

        assert_eq!(CachedVcpuData::capture(&hw), CachedVcpuData::capture(&hw));
    }

    #[test]
    fn falls_back_without_extended_leaf() {
        let mut hw = MockHardware::capable();
        hw.set_cpuid(0x8000_0000, CpuidResult::default());

        assert_eq!(CachedVcpuData::capture(&hw).max_phys_addr, 36);
    }

    #[test]
    fn wide_physical_address_masks_do_not_overflow() {
        let mut hw = MockHardware::capable();

        for width in [52, 64, 0xFF] {
            hw.set_cpuid(
                0x8000_0008,
                CpuidResult {
                    eax: width,
                    ..Default::default()
                },
            );
            let expected = if width < 64 { (1 << width) - 1 } else { u64::MAX };

            assert_eq!(CachedVcpuData::capture(&hw).physical_address_mask(), expected);
        }
    }

    #[test]
    fn revision_id_ignores_bit_31() {
        let mut hw = MockHardware::capable();
        hw.wrmsr(IA32_VMX_BASIC, 0x8000_0004);

        assert_eq!(CachedVcpuData::capture(&hw).revision_id(), 4);
    }
}
