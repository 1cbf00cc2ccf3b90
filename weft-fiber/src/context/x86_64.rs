//! x86_64 System V context switch.
//!
//! `weft_fiber_swap(save_rsp: *mut u64, load_rsp: *const u64)` pushes the
//! six callee-saved general-purpose registers (System V ABI: rbp, rbx,
//! r12-r15), stashes the resulting `rsp` at `*save_rsp`, loads `rsp` from
//! `*load_rsp`, pops the same six registers back off the new stack, and
//! returns — "returning" into whatever the new stack's saved return address
//! points at. A freshly built [`ArchContext`] arranges for that return
//! address to be the fiber trampoline.

use std::arch::global_asm;

global_asm!(
    ".text",
    ".global weft_fiber_swap",
    "weft_fiber_swap:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

extern "C" {
    fn weft_fiber_swap(save_rsp: *mut u64, load_rsp: *const u64);
}

/// The argument handed to a fiber's first entry can't travel through
/// registers across the initial `ret` (we don't control which registers are
/// "popped" before the very first jump), so it's staged here immediately
/// before the first swap into a brand-new context and picked up by the
/// trampoline on entry.
thread_local! {
    static PENDING_ENTRY: std::cell::Cell<(usize, usize)> = std::cell::Cell::new((0, 0));
}

pub(crate) fn stage_entry(entry: extern "C" fn(usize) -> !, arg: usize) {
    PENDING_ENTRY.with(|p| p.set((entry as usize, arg)));
}

extern "C" fn trampoline_shim() -> ! {
    let (entry, arg) = PENDING_ENTRY.with(|p| p.get());
    let entry: extern "C" fn(usize) -> ! = unsafe { std::mem::transmute(entry) };
    entry(arg)
}

pub struct ArchContext {
    rsp: u64,
    /// Non-null only for contexts that have never been switched into; used
    /// so the very first swap can stage the entry/arg pair before jumping.
    pending_entry: Option<(extern "C" fn(usize) -> !, usize)>,
}

impl ArchContext {
    pub fn empty() -> Self {
        ArchContext {
            rsp: 0,
            pending_entry: None,
        }
    }

    /// # Safety
    /// `stack_top` must point one-past-the-end of a valid, sufficiently
    /// large, 16-byte-aligned stack region that outlives this context.
    pub unsafe fn new(stack_top: *mut u8, entry: extern "C" fn(usize) -> !, arg: usize) -> Self {
        // Reserve space for the trampoline's return address plus the six
        // callee-saved registers `weft_fiber_swap` will pop on first entry.
        let mut sp = (stack_top as usize) & !0xf; // 16-byte align the top
        sp -= 8; // return address slot
        let ret_slot = sp as *mut u64;
        *ret_slot = trampoline_shim as usize as u64;
        sp -= 6 * 8; // rbp, rbx, r12, r13, r14, r15 — initial values don't matter
        std::ptr::write_bytes(sp as *mut u8, 0, 6 * 8);
        ArchContext {
            rsp: sp as u64,
            pending_entry: Some((entry, arg)),
        }
    }
}

/// Swap from `from` into `to`. Both must have `rsp != 0` except that `from`
/// may be a fresh `empty()` context used purely as a save slot.
pub(crate) unsafe fn swap(from: &mut ArchContext, to: &mut ArchContext) {
    if let Some((entry, arg)) = to.pending_entry.take() {
        stage_entry(entry, arg);
    }
    let save_slot = &mut from.rsp as *mut u64;
    let load_slot = &to.rsp as *const u64;
    weft_fiber_swap(save_slot, load_slot);
}
