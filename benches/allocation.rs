#![feature(test)]
extern crate test;
use test::Bencher;

use std::alloc::{GlobalAlloc as _, Layout};

mod repeated_allocation_deallocation {
    use super::*;

    /// Run a benchmark, which repeatedly allocates and deallocates the same
    /// block. The benchmark will allocate the given amount of blocks
    /// beforehand (before running the actual benchmark) in order to fill up
    /// the heap with unrelated allocations. The free-block index is a
    /// balanced tree, so the pressure should show up logarithmically at
    /// most.
    ///
    /// # Panics
    /// This will panic, if the requested pre-allocations will fill up the
    /// whole heap (so the actual benchmark cannot allocate blocks anymore).
    fn benchmark_with_preallocation(b: &mut Bencher, pre_allocations: usize) {
        let allocator = avalloc::Allocator::<8192>::new();
        // pre-allocate much memory to see the real impact of the index size
        for _ in 0..pre_allocations {
            unsafe { allocator.alloc(Layout::new::<u8>()) };
        }

        let layout = Layout::new::<u8>();

        // make sure, that there is enough room for the next allocation
        let ptr = unsafe { allocator.alloc(layout) };
        assert_ne!(ptr, std::ptr::null_mut::<u8>());
        unsafe { allocator.dealloc(ptr, layout) };

        // run actual benchmark: allocate & deallocate the same block repeatedly
        b.iter(|| {
            let ptr = unsafe { allocator.alloc(layout) };
            let ptr = test::black_box(ptr);
            unsafe { allocator.dealloc(ptr, layout) };
        });
    }

    #[bench]
    fn no_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 0);
    }

    #[bench]
    fn low_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 8);
    }

    #[bench]
    fn medium_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 120);
    }

    #[bench]
    fn high_memory_usage(b: &mut Bencher) {
        benchmark_with_preallocation(b, 240);
    }
}

mod resizing {
    use super::*;

    /// Grow an allocation into free space to its right over and over.
    /// This path never moves the payload and should stay constant-time.
    #[bench]
    fn grow_and_shrink_in_place(b: &mut Bencher) {
        let mut allocator = avalloc::RawAllocator::<8192>::new();
        let payload = allocator.alloc(16).unwrap();
        // leave a free block to the right for the in-place growth
        let room = allocator.alloc(4096).unwrap();
        allocator.free(room).unwrap();

        b.iter(|| {
            let grown = allocator.realloc(payload, 4096).unwrap();
            assert_eq!(grown, payload);
            let shrunk = allocator.realloc(payload, 16).unwrap();
            assert_eq!(test::black_box(shrunk), payload);
        });
    }
}
