use crate::vmx::{
    events::inject_gp,
    guest::GuestContext,
    hw::ExitAccess,
    support::FeatureControl,
    vmexit::{ExitType, VmExitReason},
};
use x86::{msr::IA32_FEATURE_CONTROL, vmx::vmcs};

/// Reads the MSR for the guest. MSRs the processor does not implement raise
/// `#GP` in the guest, as they would without the hypervisor.
pub fn handle_rdmsr(access: &mut dyn ExitAccess, ctx: &mut GuestContext) -> ExitType {
    let msr = ctx.rcx as u32;

    let Some(value) = access.read_msr(msr) else {
        log::trace!("rdmsr {:#x} faulted, injecting #GP", msr);
        inject_gp(access);
        return ExitType::Continue;
    };
    ctx.set_msr_value(value);

    ExitType::IncrementRip
}

pub fn handle_wrmsr(access: &mut dyn ExitAccess, ctx: &mut GuestContext) -> ExitType {
    let msr = ctx.rcx as u32;

    if !access.write_msr(msr, ctx.msr_value()) {
        log::trace!("wrmsr {:#x} faulted, injecting #GP", msr);
        inject_gp(access);
        return ExitType::Continue;
    }

    ExitType::IncrementRip
}

/// Reports `IA32_FEATURE_CONTROL` as locked with VMX disabled. Writes fail like
/// they would on a locked MSR.
pub fn handle_feature_control(access: &mut dyn ExitAccess, ctx: &mut GuestContext) -> ExitType {
    // rdmsr and wrmsr share this handler, the exit reason tells them apart.
    let write_access = matches!(
        access.vmread(vmcs::ro::EXIT_REASON),
        Ok(reason) if reason as u16 == VmExitReason::Wrmsr as u16
    );

    if write_access {
        log::trace!("Guest wrote {:#x} to IA32_FEATURE_CONTROL", ctx.msr_value());
        inject_gp(access);
        return ExitType::Continue;
    }

    let Some(value) = access.read_msr(IA32_FEATURE_CONTROL) else {
        inject_gp(access);
        return ExitType::Continue;
    };
    ctx.set_msr_value(hide_vmx(value));

    ExitType::IncrementRip
}

fn hide_vmx(feature_control: u64) -> u64 {
    let hidden = FeatureControl::VMX_INSIDE_SMX | FeatureControl::VMX_OUTSIDE_SMX;

    (feature_control | FeatureControl::LOCKED.bits()) & !hidden.bits()
}
