//! Events delivered to the guest on the next VM-entry.

use crate::vmx::hw::VmcsAccess;
use bitfield::bitfield;
use x86::vmx::vmcs;

const NMI_VECTOR: u32 = 2;
const GP_VECTOR: u32 = 13;

/// See: 25.8.3 VM-Entry Controls for Event Injection
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptionType {
    ExternalInterrupt = 0,
    Nmi = 2,
    HardwareException = 3,
    SoftwareInterrupt = 4,
    PrivilegedSoftwareException = 5,
    SoftwareException = 6,
    OtherEvent = 7,
}

bitfield! {
    /// Format of the VM-entry interruption-information field. The VM-exit
    /// interruption information uses the same layout.
    ///
    /// See: Table 25-17. Format of the VM-Entry Interruption-Information Field
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct InterruptionInfo(u32);
    impl Debug;
    u32;

    pub vector, set_vector: 7, 0;
    pub interruption_type, set_interruption_type: 10, 8;
    pub deliver_error_code, set_deliver_error_code: 11;
    pub valid, set_valid: 31;
}

impl InterruptionInfo {
    pub fn new(vector: u32, interruption_type: InterruptionType, deliver_error_code: bool) -> Self {
        let mut info = InterruptionInfo(0);

        info.set_vector(vector);
        info.set_interruption_type(interruption_type as u32);
        info.set_deliver_error_code(deliver_error_code);
        info.set_valid(true);

        info
    }

    pub fn general_protection() -> Self {
        Self::new(GP_VECTOR, InterruptionType::HardwareException, true)
    }

    pub fn nmi() -> Self {
        Self::new(NMI_VECTOR, InterruptionType::Nmi, false)
    }

    /// Whether the exit this was read from was caused by an NMI.
    pub fn is_nmi(&self) -> bool {
        self.valid() && self.interruption_type() == InterruptionType::Nmi as u32
    }
}

/// Raises `#GP(0)` in the guest on the next VM-entry.
pub fn inject_gp<A: VmcsAccess + ?Sized>(access: &mut A) {
    let info = InterruptionInfo::general_protection();

    let result = access
        .vmwrite(vmcs::control::VMENTRY_INTERRUPTION_INFO_FIELD, info.0 as u64)
        .and_then(|_| access.vmwrite(vmcs::control::VMENTRY_EXCEPTION_ERR_CODE, 0));
    if let Err(failure) = result {
        log::error!("Failed to inject #GP: {}", failure);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings() {
        assert_eq!(InterruptionInfo::general_protection().0, 0x8000_0B0D);
        assert_eq!(InterruptionInfo::nmi().0, 0x8000_0202);
    }

    #[test]
    fn recognizes_nmi_exits() {
        assert!(InterruptionInfo(0x8000_0202).is_nmi());
        // #PF, and an NMI type without the valid bit.
        assert!(!InterruptionInfo(0x8000_0B0E).is_nmi());
        assert!(!InterruptionInfo(0x0000_0202).is_nmi());
    }
}
