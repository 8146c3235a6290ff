/// Granularity of OS paging for GPU-visible memory.
pub const PAGE_SIZE: u64 = 4096;

#[must_use]
pub const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

#[must_use]
pub const fn align_down(val: u64, align: u64) -> u64 {
    val & !(align - 1)
}

#[must_use]
pub const fn is_aligned(val: u64, align: u64) -> bool {
    val & (align - 1) == 0
}

#[must_use]
pub const fn page_align_up(val: u64) -> u64 {
    align_up(val, PAGE_SIZE)
}

#[must_use]
pub const fn page_align_down(val: u64) -> u64 {
    align_down(val, PAGE_SIZE)
}
