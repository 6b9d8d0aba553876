//! Undo log for the hardware side effects of a virtualization attempt.

use crate::vmx::hw::Hardware;
use tinyvec::ArrayVec;

/// One side effect that has to be reverted if the attempt fails later on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackAction {
    /// Write the original CR0 back.
    RestoreCr0(u64),
    /// Write the original CR4 back.
    RestoreCr4(u64),
    /// Execute `vmxoff`.
    LeaveVmxOperation,
    /// `vmclear` the VMCS at this physical address.
    ClearVmcs(u64),
}

impl Default for RollbackAction {
    fn default() -> Self {
        Self::LeaveVmxOperation
    }
}

/// Records [`RollbackAction`]s in the order the side effects happen and undoes
/// them in reverse.
#[derive(Debug, Default)]
pub struct Rollback {
    actions: ArrayVec<[RollbackAction; 4]>,
}

impl Rollback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: RollbackAction) {
        if self.actions.try_push(action).is_some() {
            log::error!("Rollback log is full, dropping {:?}", action);
        }
    }

    pub fn actions(&self) -> &[RollbackAction] {
        &self.actions
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Keeps every side effect.
    pub fn commit(&mut self) {
        self.actions.clear();
    }

    /// Undoes every recorded side effect, newest first. Keeps going if a single
    /// step fails.
    pub fn revert<H: Hardware + ?Sized>(&mut self, hw: &mut H) {
        while let Some(action) = self.actions.pop() {
            log::trace!("Reverting {:?}", action);

            match action {
                RollbackAction::RestoreCr0(value) => hw.set_cr0(value),
                RollbackAction::RestoreCr4(value) => hw.set_cr4(value),
                RollbackAction::LeaveVmxOperation => {
                    if let Err(failure) = hw.vmxoff() {
                        log::error!("vmxoff failed during rollback: {}", failure);
                    }
                }
                RollbackAction::ClearVmcs(pa) => {
                    if let Err(failure) = hw.vmclear(pa) {
                        log::error!("vmclear of {:#x} failed during rollback: {}", pa, failure);
                    }
                }
            }
        }
    }
}
