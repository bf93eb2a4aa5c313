//! Fiber stack allocation
//!
//! Stacks are private anonymous mmap regions with a PROT_NONE guard page
//! at the low end, so overflow faults instead of corrupting the heap.
//! Allocation failure is fatal: a runtime that cannot map a stack cannot
//! make progress, so we log and abort rather than limp on.

use std::ptr;

use weft_core::{werror, MemoryError};

const PAGE_SIZE: usize = 4096;

#[inline]
fn round_up_to_page(size: usize) -> usize {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// An owned, guard-paged fiber stack.
pub struct Stack {
    base: *mut u8,
    total: usize,
}

// The mapping is plain memory; the Fiber owning it synchronizes access.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Map a stack of at least `size` usable bytes plus one guard page.
    ///
    /// Aborts the process if the kernel refuses the mapping.
    pub fn alloc(size: usize) -> Stack {
        let usable = round_up_to_page(size.max(PAGE_SIZE));
        let total = usable + PAGE_SIZE;

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            werror!(
                "{}: {} bytes (errno {})",
                MemoryError::AllocationFailed,
                total,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
            );
            std::process::abort();
        }

        // Guard page at the low end (stacks grow down).
        if unsafe { libc::mprotect(base, PAGE_SIZE, libc::PROT_NONE) } != 0 {
            werror!(
                "{} (errno {})",
                MemoryError::ProtectionFailed,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
            );
            std::process::abort();
        }

        Stack {
            base: base as *mut u8,
            total,
        }
    }

    /// High end of the mapping; initial stack pointer for a fresh fiber.
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.total) }
    }

    /// Usable bytes, excluding the guard page.
    #[inline]
    pub fn usable_size(&self) -> usize {
        self.total - PAGE_SIZE
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_rounds_up() {
        let s = Stack::alloc(1);
        assert_eq!(s.usable_size(), PAGE_SIZE);
    }

    #[test]
    fn test_stack_is_writable() {
        let s = Stack::alloc(64 * 1024);
        assert_eq!(s.usable_size(), 64 * 1024);
        unsafe {
            // Touch the first usable byte below the top.
            let p = s.top().sub(8);
            p.write(0xAB);
            assert_eq!(p.read(), 0xAB);
        }
    }
}
