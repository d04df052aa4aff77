use kernel_memory_addresses::VirtualAddress;

/// Drop the TLB entry covering `va` on this CPU (`invlpg`).
///
/// # Safety
/// Privileged instruction; CPL0 only.
#[inline]
pub unsafe fn invalidate_page(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}
