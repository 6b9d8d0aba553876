use crate::vmx::{guest::GuestContext, hw::ExitAccess, vmexit::ExitType};
use x86::cpuid::cpuid;

/// Executes `cpuid` on behalf of the guest and hands back the host's result.
pub fn handle_default(_access: &mut dyn ExitAccess, ctx: &mut GuestContext) -> ExitType {
    let leaf = ctx.rax as u32;
    let subleaf = ctx.rcx as u32;

    let cpuid = cpuid!(leaf, subleaf);

    ctx.rax = cpuid.eax as u64;
    ctx.rbx = cpuid.ebx as u64;
    ctx.rcx = cpuid.ecx as u64;
    ctx.rdx = cpuid.edx as u64;

    ExitType::IncrementRip
}
