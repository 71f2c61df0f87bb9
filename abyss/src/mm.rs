//! Zero-initialized, page-aligned allocations.

use alloc::{
    alloc::{alloc_zeroed, Layout},
    boxed::Box,
};

/// Allocate a zero-filled `T` on the heap.
///
/// Returns `None` when the allocator is exhausted instead of aborting, so
/// callers can report the failure upward.
///
/// # Safety
/// The all-zero bit pattern must be a valid value of `T`.
pub unsafe fn try_zeroed_box<T>() -> Option<Box<T>> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Some(Box::from_raw(core::ptr::NonNull::<T>::dangling().as_ptr()));
    }
    let ptr = alloc_zeroed(layout) as *mut T;
    if ptr.is_null() {
        None
    } else {
        Some(Box::from_raw(ptr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(4096))]
    struct Frame([u64; 512]);

    #[test]
    fn zeroed_and_aligned() {
        let frame = unsafe { try_zeroed_box::<Frame>() }.unwrap();
        assert_eq!(&*frame as *const Frame as usize % 4096, 0);
        assert!(frame.0.iter().all(|v| *v == 0));
    }
}
