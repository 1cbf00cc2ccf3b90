//! Fiber stack allocation: `mmap` + guard page on platforms that
//! support it, with watermarking so an idle stack's physical pages can be
//! returned to the kernel via `madvise(MADV_DONTNEED)` without unmapping.

use std::sync::Mutex;
use weft_error::{weft_error, ErrorKind, WeftError};

/// Stack size classes. The numeric sizes are reasonable defaults; a real
/// deployment tunes these via config (`weft-config`'s `[weft.stacks]`
/// section).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StackSizeClass {
    Small,
    Medium,
    Large,
    Huge,
}

impl StackSizeClass {
    pub fn bytes(self) -> usize {
        match self {
            StackSizeClass::Small => 64 * 1024,
            StackSizeClass::Medium => 256 * 1024,
            StackSizeClass::Large => 1024 * 1024,
            StackSizeClass::Huge => 8 * 1024 * 1024,
        }
    }

    pub fn all() -> [StackSizeClass; 4] {
        [
            StackSizeClass::Small,
            StackSizeClass::Medium,
            StackSizeClass::Large,
            StackSizeClass::Huge,
        ]
    }
}

const WATERMARK: u64 = 0xDEAD_C0DE_F00D_CAFE;

/// An owned fiber stack. `base` points at the lowest address of the
/// *usable* region (above the guard page, if any); `top()` is the initial
/// stack pointer value (highest address, since the stack grows down).
pub struct Stack {
    mapping: *mut u8,
    mapping_len: usize,
    usable_base: *mut u8,
    usable_len: usize,
    has_guard_page: bool,
    page_size: usize,
}

unsafe impl Send for Stack {}

impl Stack {
    /// Allocate a new stack of the given size class. On platforms with
    /// `mmap`, the mapping is `size + page_size` bytes with the lowest page
    /// `mprotect`ed to `PROT_NONE` as a guard; a watermark word is written
    /// just above the guard so [`Stack::reset`] can detect an untouched
    /// stack before its physical pages are known to the kernel.
    pub fn new(class: StackSizeClass, page_size: usize) -> Result<Self, WeftError> {
        let size = class.bytes();
        #[cfg(unix)]
        {
            Self::new_mmap(size, page_size)
        }
        #[cfg(not(unix))]
        {
            Self::new_heap(size)
        }
    }

    #[cfg(unix)]
    fn new_mmap(size: usize, page_size: usize) -> Result<Self, WeftError> {
        let mapping_len = size + page_size;
        // SAFETY: fixed, valid flags for a private anonymous mapping; the
        // result is checked against MAP_FAILED before use.
        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapping_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(weft_error!(
                ErrorKind::OutOfMemory,
                "mmap({mapping_len}) failed for fiber stack"
            ));
        }
        let mapping = mapping as *mut u8;
        // SAFETY: mapping is a fresh, page_size-aligned mapping at least
        // page_size bytes long; mprotect-ing its first page to PROT_NONE
        // turns a stack overflow into a SIGSEGV instead of silent corruption.
        let guard_rc = unsafe { libc::mprotect(mapping as *mut libc::c_void, page_size, libc::PROT_NONE) };
        let has_guard_page = guard_rc == 0;
        if !has_guard_page {
            tracing::debug!("mprotect guard page failed, continuing without one");
        }
        let usable_base = unsafe { mapping.add(page_size) };
        let usable_len = size;
        let mut stack = Stack {
            mapping,
            mapping_len,
            usable_base,
            usable_len,
            has_guard_page,
            page_size,
        };
        stack.write_watermark();
        Ok(stack)
    }

    #[cfg(not(unix))]
    fn new_heap(size: usize) -> Result<Self, WeftError> {
        let layout = std::alloc::Layout::from_size_align(size, 16)
            .map_err(|e| weft_error!(ErrorKind::BadParameter, "bad stack layout: {e}"))?;
        // SAFETY: layout is non-zero-sized and validly aligned.
        let ptr = unsafe { std::alloc::alloc(layout) };
        if ptr.is_null() {
            return Err(weft_error!(ErrorKind::OutOfMemory, "heap stack alloc failed"));
        }
        let mut stack = Stack {
            mapping: ptr,
            mapping_len: size,
            usable_base: ptr,
            usable_len: size,
            has_guard_page: false,
            page_size: 4096,
        };
        stack.write_watermark();
        Ok(stack)
    }

    fn write_watermark(&mut self) {
        // SAFETY: usable_base is valid for usable_len bytes; a u64 fits
        // within that region for every supported size class.
        unsafe {
            (self.usable_base as *mut u64).write(WATERMARK);
        }
    }

    fn watermark_intact(&self) -> bool {
        // SAFETY: see write_watermark.
        unsafe { (self.usable_base as *const u64).read() == WATERMARK }
    }

    /// Highest address of the usable region: the initial stack pointer for
    /// a freshly created or freshly reset stack.
    pub fn top(&self) -> *mut u8 {
        unsafe { self.usable_base.add(self.usable_len) }
    }

    pub fn has_guard_page(&self) -> bool {
        self.has_guard_page
    }

    /// If the watermark is still intact (the stack was never actually used
    /// past its first word), return its physical pages to the kernel via
    /// `madvise(MADV_DONTNEED)` while keeping the virtual mapping — cheaper
    /// to recycle than unmap+remap.
    pub fn reset(&mut self) {
        if !self.watermark_intact() {
            #[cfg(unix)]
            {
                // SAFETY: usable_base/usable_len describe our own mapping;
                // MADV_DONTNEED is always safe to request, worst case it's a
                // no-op.
                unsafe {
                    libc::madvise(
                        self.usable_base as *mut libc::c_void,
                        self.usable_len,
                        libc::MADV_DONTNEED,
                    );
                }
            }
        }
        self.write_watermark();
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        #[cfg(unix)]
        // SAFETY: mapping/mapping_len describe the exact mmap region this
        // Stack owns exclusively.
        unsafe {
            libc::munmap(self.mapping as *mut libc::c_void, self.mapping_len);
        }
        #[cfg(not(unix))]
        {
            let layout = std::alloc::Layout::from_size_align(self.mapping_len, 16).unwrap();
            // SAFETY: mapping was allocated with the same layout in new_heap.
            unsafe {
                std::alloc::dealloc(self.mapping, layout);
            }
        }
    }
}

/// Per-size-class pool of recycled stacks, amortizing allocation cost.
#[derive(Default)]
pub struct StackPool {
    pools: Mutex<std::collections::HashMap<(StackSizeClassKey,), Vec<Stack>>>,
}

// Newtype so StackSizeClass (which isn't Ord) can key a HashMap via its
// discriminant without pulling in a derive for an enum used nowhere else as
// a map key.
#[derive(PartialEq, Eq, Hash, Clone, Copy)]
struct StackSizeClassKey(u8);

impl From<StackSizeClass> for StackSizeClassKey {
    fn from(c: StackSizeClass) -> Self {
        StackSizeClassKey(match c {
            StackSizeClass::Small => 0,
            StackSizeClass::Medium => 1,
            StackSizeClass::Large => 2,
            StackSizeClass::Huge => 3,
        })
    }
}

impl StackPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, class: StackSizeClass, page_size: usize) -> Result<Stack, WeftError> {
        let key = (StackSizeClassKey::from(class),);
        if let Some(mut stack) = self
            .pools
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|v| v.pop())
        {
            stack.reset();
            return Ok(stack);
        }
        Stack::new(class, page_size)
    }

    pub fn release(&self, class: StackSizeClass, stack: Stack) {
        let key = (StackSizeClassKey::from(class),);
        self.pools.lock().unwrap().entry(key).or_default().push(stack);
    }

    pub fn len(&self, class: StackSizeClass) -> usize {
        let key = (StackSizeClassKey::from(class),);
        self.pools
            .lock()
            .unwrap()
            .get(&key)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stack_top_is_above_base() {
        let stack = Stack::new(StackSizeClass::Small, 4096).unwrap();
        assert!((stack.top() as usize) > (stack.usable_base as usize));
    }

    #[test]
    fn pool_recycles_stacks() {
        let pool = StackPool::new();
        assert_eq!(pool.len(StackSizeClass::Small), 0);
        let s = pool.acquire(StackSizeClass::Small, 4096).unwrap();
        pool.release(StackSizeClass::Small, s);
        assert_eq!(pool.len(StackSizeClass::Small), 1);
        let _s2 = pool.acquire(StackSizeClass::Small, 4096).unwrap();
        assert_eq!(pool.len(StackSizeClass::Small), 0);
    }
}
