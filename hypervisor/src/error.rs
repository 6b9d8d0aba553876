use core::fmt;
use snafu::prelude::*;

/// How a VMX instruction reported failure.
///
/// See: 31.2 CONVENTIONS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxFailure {
    /// `VMfailInvalid`: CF set, there is no current VMCS to hold an error number.
    Invalid,
    /// `VMfailValid`: ZF set, carries the VM-instruction error number.
    Valid(u32),
}

impl fmt::Display for VmxFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmxFailure::Invalid => write!(f, "VMfailInvalid"),
            VmxFailure::Valid(error) => write!(f, "VMfailValid with error {}", error),
        }
    }
}

#[derive(Debug, Snafu, Clone, Copy, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum HypervisorError {
    #[snafu(display("VMX is not supported by the processor"))]
    VmxUnsupported,

    #[snafu(display("VMX is disabled by firmware (IA32_FEATURE_CONTROL = {:#x})", feature_control))]
    VmxDisabledByFirmware { feature_control: u64 },

    #[snafu(display(
        "{} fixed bits conflict (fixed0 = {:#x}, fixed1 = {:#x})",
        register,
        fixed0,
        fixed1
    ))]
    FixedBitConflict {
        register: &'static str,
        fixed0: u64,
        fixed1: u64,
    },

    #[snafu(display("Failed to allocate {} bytes aligned to {}", size, align))]
    AllocationFailed { size: usize, align: usize },

    #[snafu(display("Region at {:#x} is not aligned to {}", address, align))]
    MisalignedRegion { address: u64, align: usize },

    #[snafu(display("{} failed: {}", instruction, failure))]
    VmxInstruction {
        instruction: &'static str,
        failure: VmxFailure,
    },

    #[snafu(display("Failed to write VMCS field {:#x}: {}", field, failure))]
    VmcsWrite { field: u32, failure: VmxFailure },

    #[snafu(display("Failed to read VMCS field {:#x}: {}", field, failure))]
    VmcsRead { field: u32, failure: VmxFailure },

    #[snafu(display("VM-entry failed with basic exit reason {}", reason))]
    VmEntryFailure { reason: u16 },

    #[snafu(display("Unknown VM-exit reason {}", reason))]
    UnknownExitReason { reason: u16 },

    #[snafu(display("No handler registered for VM-exit reason {}", reason))]
    UnhandledExit { reason: u16 },

    #[snafu(display("MSR {:#x} is not covered by the MSR bitmap", msr))]
    MsrOutOfRange { msr: u32 },

    #[snafu(display("Invalid configuration: {}", reason))]
    InvalidConfig { reason: &'static str },

    #[snafu(display(
        "Unexpected host exception {} (error code {:#x}) at {:#x}",
        vector,
        error_code,
        rip
    ))]
    UnexpectedHostException {
        vector: u64,
        error_code: u64,
        rip: u64,
    },
}

pub type Result<T, E = HypervisorError> = core::result::Result<T, E>;
