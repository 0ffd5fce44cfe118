//! Per-thread accounting of live heap bytes.
//!
//! [`MeteredAllocator`] wraps the system allocator and, on threads that have
//! started a [`Meter`], keeps a running total of bytes allocated and not yet
//! freed. Sandbox workers use it to bound the memory one execution holds.
//! Binaries that run scripts must install it:
//!
//! ```ignore
//! #[global_allocator]
//! static ALLOC: dagbox_core::MeteredAllocator = dagbox_core::MeteredAllocator;
//! ```

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;

thread_local! {
    static METERED: Cell<bool> = const { Cell::new(false) };
    static LIVE_BYTES: Cell<isize> = const { Cell::new(0) };
}

pub struct MeteredAllocator;

fn record(delta: isize) {
    let _ = METERED.try_with(|metered| {
        if metered.get() {
            let _ = LIVE_BYTES.try_with(|live| live.set(live.get().saturating_add(delta)));
        }
    });
}

unsafe impl GlobalAlloc for MeteredAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc(layout);
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = System.alloc_zeroed(layout);
        if !ptr.is_null() {
            record(layout.size() as isize);
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout);
        record(-(layout.size() as isize));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let new_ptr = System.realloc(ptr, layout, new_size);
        if !new_ptr.is_null() {
            record(new_size as isize - layout.size() as isize);
        }
        new_ptr
    }
}

/// Live-byte meter for the current thread, stopped on drop.
///
/// Bytes freed while metering that were allocated before it started count
/// negative, so the total is relative to the start.
pub(crate) struct Meter {
    _not_send: std::marker::PhantomData<*const ()>,
}

impl Meter {
    pub fn start() -> Self {
        LIVE_BYTES.with(|live| live.set(0));
        METERED.with(|metered| metered.set(true));
        Self {
            _not_send: std::marker::PhantomData,
        }
    }

    pub fn live_bytes() -> usize {
        LIVE_BYTES.try_with(|live| live.get().max(0) as usize).unwrap_or(0)
    }

    /// True when [`MeteredAllocator`] is the global allocator
    pub fn is_installed() -> bool {
        let meter = Self::start();
        let probe = std::hint::black_box(Vec::<u8>::with_capacity(64));
        let seen = Self::live_bytes() >= 64;
        drop(probe);
        drop(meter);
        seen
    }
}

impl Drop for Meter {
    fn drop(&mut self) {
        let _ = METERED.try_with(|metered| metered.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_only_while_started() {
        assert!(Meter::is_installed());

        let before = vec![0u8; 4096];
        let meter = Meter::start();
        let held = std::hint::black_box(vec![1u8; 10_000]);
        assert!(Meter::live_bytes() >= 10_000);
        drop(held);
        assert!(Meter::live_bytes() < 10_000);
        drop(before);
        assert_eq!(Meter::live_bytes(), 0);
        drop(meter);

        let _after = std::hint::black_box(vec![2u8; 10_000]);
        assert_eq!(Meter::live_bytes(), 0);
    }

    #[test]
    fn test_threads_are_metered_separately() {
        let _meter = Meter::start();
        std::thread::spawn(|| std::hint::black_box(vec![0u8; 1 << 20]).len())
            .join()
            .unwrap();
        assert!(Meter::live_bytes() < 1 << 20);
    }
}
