use crate::error::{AllocationFailedSnafu, MisalignedRegionSnafu, Result};
use alloc::{
    alloc::{alloc_zeroed, Layout},
    boxed::Box,
};
use snafu::ensure;

/// Allocates a zero-filled `T` on the heap without building it on the stack
/// first. Needed for the page-sized VMX regions which would overflow a kernel
/// stack.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid value of `T`.
pub unsafe fn zeroed_box<T>() -> Result<Box<T>> {
    let layout = Layout::new::<T>();
    debug_assert!(layout.size() != 0);

    let memory = alloc_zeroed(layout) as *mut T;
    ensure!(
        !memory.is_null(),
        AllocationFailedSnafu {
            size: layout.size(),
            align: layout.align(),
        }
    );

    // Take ownership first so the memory is released on the error path.
    //
    let instance = Box::from_raw(memory);
    ensure!(
        memory as usize % layout.align() == 0,
        MisalignedRegionSnafu {
            address: memory as u64,
            align: layout.align(),
        }
    );

    Ok(instance)
}
