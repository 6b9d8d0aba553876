//! Checks whether the current processor is able to run the hypervisor and
//! brings it into VMX root operation.

use crate::{
    error::{
        FixedBitConflictSnafu, Result, VmxDisabledByFirmwareSnafu, VmxInstructionSnafu,
        VmxUnsupportedSnafu,
    },
    vmx::{
        capability::CachedVcpuData,
        hw::Hardware,
        rollback::{Rollback, RollbackAction},
        vmcs::Vmxon,
    },
};
use bitflags::bitflags;
use snafu::ensure;
use x86::msr::IA32_FEATURE_CONTROL;

pub const CR4_VMXE: u64 = 1 << 13;

bitflags! {
    /// See: 24.7 ENABLING AND ENTERING VMX OPERATION
    pub struct FeatureControl: u64 {
        const LOCKED = 1 << 0;
        const VMX_INSIDE_SMX = 1 << 1;
        const VMX_OUTSIDE_SMX = 1 << 2;
    }
}

/// Checks whether VMX can be used on this processor.
///
/// # Recommended Algorithm
/// ```pseudocode
/// if (CPUID.1:ECX.VMX[bit 5] == 0)
///     return VMX_NOT_AVAIL;
///
/// if (IA32_FEATURE_CONTROL.Lock == 0)
///     return VMX_ALLOWED;    // we lock it ourselves
///
/// if (IA32_FEATURE_CONTROL.EnableVmxOutsideSmx == 1)
///     return VMX_ALLOWED;
///
/// return VMX_DISABLED_AT_BIOS;
/// ```
pub fn is_vmx_supported(cached: &CachedVcpuData) -> bool {
    if !cached.vmx_supported() {
        log::warn!("Processor does not support VMX");
        return false;
    }

    let feature_control = FeatureControl::from_bits_truncate(cached.feature_control);
    if feature_control.contains(FeatureControl::LOCKED)
        && !feature_control.contains(FeatureControl::VMX_OUTSIDE_SMX)
    {
        log::warn!("VMX is locked off by firmware. Enable it in the platform settings.");
        return false;
    }

    true
}

/// Rejects capability masks that no value can satisfy.
fn check_fixed_bits(register: &'static str, fixed0: u64, fixed1: u64) -> Result<()> {
    ensure!(
        fixed0 & !fixed1 == 0,
        FixedBitConflictSnafu {
            register,
            fixed0,
            fixed1
        }
    );

    Ok(())
}

/// Applies the VMX fixed bits to `value`.
///
/// ```text
///        FIXED0  FIXED1  Meaning
/// Bit X  1       1       The bit X is fixed to 1
/// Bit X  0       1       The bit X is flexible
/// Bit X  0       0       The bit X is fixed to 0
/// ```
///
/// See: A.7 VMX-FIXED BITS IN CR0
/// See: A.8 VMX-FIXED BITS IN CR4
pub fn apply_fixed_bits(value: u64, fixed0: u64, fixed1: u64) -> u64 {
    (value | fixed0) & fixed1
}

/// Prepares the processor for `vmxon`: verifies support, locks feature control
/// if firmware left it open and applies the fixed bits to CR0 and CR4.
///
/// Every consistency check runs before the first control register is written.
/// Feature control locking is not undone; the MSR stays locked until reset.
pub fn enable_vmx_operation<H: Hardware + ?Sized>(
    hw: &mut H, cached: &CachedVcpuData, rollback: &mut Rollback,
) -> Result<()> {
    ensure!(cached.vmx_supported(), VmxUnsupportedSnafu);

    let feature_control = FeatureControl::from_bits_truncate(cached.feature_control);
    if feature_control.contains(FeatureControl::LOCKED) {
        ensure!(
            feature_control.contains(FeatureControl::VMX_OUTSIDE_SMX),
            VmxDisabledByFirmwareSnafu {
                feature_control: cached.feature_control
            }
        );
    }

    check_fixed_bits("CR0", cached.vmx_cr0_fixed0, cached.vmx_cr0_fixed1)?;
    check_fixed_bits("CR4", cached.vmx_cr4_fixed0, cached.vmx_cr4_fixed1)?;
    ensure!(
        cached.vmx_cr4_fixed1 & CR4_VMXE != 0,
        FixedBitConflictSnafu {
            register: "CR4.VMXE",
            fixed0: cached.vmx_cr4_fixed0,
            fixed1: cached.vmx_cr4_fixed1,
        }
    );

    if !feature_control.contains(FeatureControl::LOCKED) {
        log::info!("Locking IA32_FEATURE_CONTROL with VMX enabled");
        hw.wrmsr(
            IA32_FEATURE_CONTROL,
            cached.feature_control
                | (FeatureControl::LOCKED | FeatureControl::VMX_OUTSIDE_SMX).bits(),
        );
    }

    let cr0 = hw.cr0();
    rollback.push(RollbackAction::RestoreCr0(cr0));
    hw.set_cr0(apply_fixed_bits(
        cr0,
        cached.vmx_cr0_fixed0,
        cached.vmx_cr0_fixed1,
    ));

    let cr4 = hw.cr4();
    rollback.push(RollbackAction::RestoreCr4(cr4));
    hw.set_cr4(apply_fixed_bits(
        cr4 | CR4_VMXE,
        cached.vmx_cr4_fixed0,
        cached.vmx_cr4_fixed1,
    ));

    Ok(())
}

/// Executes `vmxon` on `vmxon`.
pub fn enter_vmx_operation<H: Hardware + ?Sized>(
    hw: &mut H, vmxon: &mut Vmxon, cached: &CachedVcpuData, rollback: &mut Rollback,
) -> Result<()> {
    vmxon.revision_id = cached.revision_id();

    let pa = hw.physical_address(vmxon as *mut Vmxon as u64);
    log::trace!("vmxon region pa: {:#x}", pa);

    hw.vmxon(pa).map_err(|failure| {
        VmxInstructionSnafu {
            instruction: "vmxon",
            failure,
        }
        .build()
    })?;
    rollback.push(RollbackAction::LeaveVmxOperation);

    Ok(())
}
