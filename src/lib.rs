//! Boundary-tagged heap allocator with a balanced free-block index
//!
//! This crate provides a single main type called [`Allocator`]. This type
//! implements the [`core::alloc::GlobalAlloc`]-trait, which is required to
//! use the [`alloc`-crate][alloc] on `#![no_std]`-targets. In contrast to
//! allocators that scan their heap linearly, this one keeps every free
//! block in a balanced search tree ordered by size, so allocation stays
//! `O(log n)` even on heaps with many live blocks, while freeing and
//! in-place resizing stay cheap through constant-time neighbour lookup.
//!
//! # Usage
//! The usage is simple: just copy and paste the following code snipped
//! into your binary crate and potentially adjust the number of bytes of
//! the heap (here 4K):
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: avalloc::Allocator<4096> = avalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//! Afterwards you don't need to interact with the crate or the variable
//! `ALLOCATOR` anymore. Now you can just `use alloc::vec::Vec` or even
//! `use alloc::collections::BTreeMap`, i.e. every fancy collection which
//! is normally provided by the `std`.
//!
//! The minimal heap size is `32`, which would allow exactly one allocation
//! of up to 16 bytes at a time. Adjust the size as necessary, e.g. by
//! doing a worst case calculation and potentially adding some backup
//! space of 10% (for example).
//!
//! # Implementation
//! The heap is a single contiguous region that only ever grows, mapped in
//! on demand up to the reserve `N`. It is tiled exactly by blocks: every
//! byte belongs to one block, and each block is bracketed by a header
//! word and an identical footer word packing the body size with an
//! allocated-flag in bit 0.
//! ```text
//! | size|a |   payload ...              | size|a |
//! ^ header                              ^ footer
//! ```
//! The duplicated tags are what make deallocation fast: the word directly
//! below a block's header is the footer of its left neighbour and the
//! word directly above its footer is the header of its right neighbour,
//! so a freed block merges with free neighbours on both sides in constant
//! time. The heap therefore never contains two adjacent free blocks.
//!
//! Free blocks pull double duty as the nodes of an AVL tree ordered by
//! `(size, position)`: their otherwise unused bodies store the two child
//! links and the subtree height, so the index needs no memory of its own.
//! An allocation removes the smallest sufficient block from that tree,
//! preferring the lowest one among equal sizes, and splits off the slack
//! as a new free block whenever the slack could hold a block of its own.
//! If no block fits, the heap grows by exactly the missing amount: a free
//! block sitting at the top of the heap is absorbed into the new one
//! instead of being buried under it.
//!
//! Resizing an allocation first tries to grow into a free right
//! neighbour, then gives surplus space back as a free block, and only
//! moves the payload as a last resort.
//!
//! # Thread safety
//! All bookkeeping is protected by a [`spin`]-lock around the raw
//! allocator, which makes [`Allocator`] usable as the global allocator on
//! bare-metal targets. The lock is not re-entrant; the allocator must not
//! be called from within its own critical section (e.g. from a signal
//! handler interrupting an allocation).
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![no_std]

#[cfg(test)]
extern crate std;

mod raw_allocator;

pub use raw_allocator::{FreeError, RawAllocator, ALIGNMENT};

use core::alloc::{GlobalAlloc, Layout};
use core::mem;
use core::ptr;

/// The heap memory allocator.
///
/// This is the main type of this crate: an allocator with a predefined
/// heap reserve. Therefore the heap memory usage is statically limited to
/// an upper value, which also helps to prevent issues with heap/stack-
/// smashes, as the heap is counted to the static memory (e.g.
/// `.data`/`.bss`-sections). Such a smash might still happen though, if
/// the stack pointer grows into the heap, but the heap cannot grow into
/// the stack pointer.
///
/// Its usage is simple: just copy and paste the following in the binary
/// crate you're developing. The memory reserve of the heap is `4096` or
/// 4K in this example. Adjust that value to your needs.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: avalloc::Allocator<4096> = avalloc::Allocator::new();
/// ```
/// Also please refer to the [crate-level](crate)-documentation for
/// recommendations on the heap size and general usage.
pub struct Allocator<const N: usize> {
    raw: spin::Mutex<RawAllocator<N>>,
}

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly
    /// when creating the allocator.
    ///
    /// Please see the [crate-level](crate)-documentation for
    /// recommendations on the heap size and general usage.
    ///
    /// # Panics
    /// This function will panic, if the supplied heap size, i.e. `N` is
    /// less than `32`, not divisible by `8` or too large to be addressed
    /// by the free-block index.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        assert!(N >= 32, "too small heap memory: minimum size is 32");
        assert!(N % 8 == 0, "memory size has to be divisible by 8");

        Self {
            raw: spin::Mutex::new(RawAllocator::new()),
        }
    }
}

unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut raw = self.raw.lock();
        if layout.align() <= ALIGNMENT {
            // raw payloads are already sufficiently aligned
            match raw.alloc(layout.size()) {
                Some(payload) => raw.payload_ptr(payload),
                None => ptr::null_mut(),
            }
        } else {
            // over-allocate, so that a suitably aligned payload exists
            // inside the block with room for one word in front of it
            let slack = layout.align() + mem::size_of::<usize>();
            match raw.alloc(layout.size() + slack) {
                Some(payload) => {
                    let start = raw.payload_ptr(payload) as usize;
                    let aligned = (start + mem::size_of::<usize>() + layout.align() - 1)
                        & !(layout.align() - 1);
                    let target = aligned as *mut u8;
                    // SAFETY: `aligned` is at least one word past `start`
                    // and `aligned + size` stays within the block, so the
                    // word in front of the returned pointer is in bounds
                    // (and 8-aligned, as `align > 8`). It stashes the way
                    // back to the raw payload for `dealloc`.
                    unsafe { target.cast::<usize>().sub(1).write(aligned - start) };
                    target
                }
                None => ptr::null_mut(),
            }
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }

        let mut raw = self.raw.lock();
        let payload = if layout.align() <= ALIGNMENT {
            raw.payload_offset(ptr)
        } else {
            // SAFETY: `alloc` stashed the distance back to the raw
            // payload in the word in front of over-aligned pointers;
            // stepping back by it stays within the same block.
            let delta = unsafe { ptr.cast::<usize>().sub(1).read() };
            raw.payload_offset(unsafe { ptr.sub(delta) })
        };
        // a detected misuse cannot be reported from here: allocators must
        // not unwind
        let _ = raw.free(payload);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= ALIGNMENT {
            let mut raw = self.raw.lock();
            let payload = raw.payload_offset(ptr);
            match raw.realloc(payload, new_size) {
                Some(resized) => raw.payload_ptr(resized),
                None => ptr::null_mut(),
            }
        } else {
            // over-aligned payloads move through a fresh allocation
            // SAFETY: the caller guarantees that `new_size` forms a valid
            // layout with the original alignment.
            let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
            // SAFETY: forwarded allocator calls with valid arguments; the
            // lock is not held across them.
            unsafe {
                let new_ptr = self.alloc(new_layout);
                if !new_ptr.is_null() {
                    ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
                    self.dealloc(ptr, layout);
                }
                new_ptr
            }
        }
    }
}
