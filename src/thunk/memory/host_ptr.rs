use super::{Fragment, MAX_FRAGMENTS};
use crate::error::{ResidencyError, ResidencyResult};
use crate::kmd::{KernelDriver, OsHandle};
use crate::utils::{PAGE_SIZE, is_aligned, page_align_down, page_align_up};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentPosition {
    Leading,
    Middle,
    Trailing,
}

/// A page-aligned host range that becomes one fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentRange {
    pub position: FragmentPosition,
    pub cpu_ptr: usize,
    pub size: u64,
}

/// Splits `[ptr, ptr + size)` into page-aligned fragment ranges.
///
/// An unaligned start gets its own leading page, an unaligned end its own
/// trailing page, and whole pages in between form one middle range. A range
/// that begins and ends inside the same page yields only the leading page.
#[must_use]
pub fn split_host_range(ptr: usize, size: u64) -> SmallVec<[FragmentRange; MAX_FRAGMENTS]> {
    let mut ranges = SmallVec::new();
    if size == 0 {
        return ranges;
    }

    let start = ptr as u64;
    let end = start + size;
    let mut middle_start = start;
    let mut middle_end = end;

    if !is_aligned(start, PAGE_SIZE) {
        let leading = page_align_down(start);
        ranges.push(FragmentRange {
            position: FragmentPosition::Leading,
            cpu_ptr: leading as usize,
            size: PAGE_SIZE,
        });
        middle_start = leading + PAGE_SIZE;
    }

    if !is_aligned(end, PAGE_SIZE) {
        let trailing = page_align_down(end);
        if trailing >= middle_start {
            middle_end = trailing;
            ranges.push(FragmentRange {
                position: FragmentPosition::Trailing,
                cpu_ptr: trailing as usize,
                size: PAGE_SIZE,
            });
        } else {
            middle_end = middle_start;
        }
    }

    if middle_end > middle_start {
        let middle = FragmentRange {
            position: FragmentPosition::Middle,
            cpu_ptr: middle_start as usize,
            size: page_align_up(middle_end - middle_start),
        };
        let index = usize::from(!is_aligned(start, PAGE_SIZE));
        ranges.insert(index, middle);
    }

    ranges
}

#[derive(Debug)]
struct FragmentEntry {
    fragment: Arc<Fragment>,
    ref_count: usize,
}

/// Table of host-memory fragments shared between allocations.
///
/// Keyed by the page-aligned start address. Two allocations over the same page
/// range share one fragment (and so one residency record).
#[derive(Debug, Default)]
pub struct HostPtrManager {
    fragments: BTreeMap<usize, FragmentEntry>,
}

impl HostPtrManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fragments covering `[ptr, ptr + size)`, creating the ones
    /// that do not exist yet. On error no reference is taken.
    pub fn acquire_fragments(
        &mut self,
        driver: &dyn KernelDriver,
        ptr: usize,
        size: u64,
    ) -> ResidencyResult<SmallVec<[Arc<Fragment>; MAX_FRAGMENTS]>> {
        let ranges = split_host_range(ptr, size);

        for range in &ranges {
            if self.overlaps_differently(range) {
                return Err(ResidencyError::FragmentOverlap { ptr, size });
            }
        }

        let mut acquired: SmallVec<[Arc<Fragment>; MAX_FRAGMENTS]> = SmallVec::new();
        for range in &ranges {
            match self.take_reference(range.cpu_ptr) {
                Some(fragment) => acquired.push(fragment),
                None => match driver.create_allocation(range.size) {
                    Ok(handle) => {
                        let fragment = Arc::new(Fragment::new(handle, range.cpu_ptr, range.size));
                        debug!(
                            handle = %handle,
                            cpu_ptr = format_args!("0x{:x}", range.cpu_ptr),
                            size = range.size,
                            "created host fragment"
                        );
                        self.fragments.insert(
                            range.cpu_ptr,
                            FragmentEntry {
                                fragment: fragment.clone(),
                                ref_count: 1,
                            },
                        );
                        acquired.push(fragment);
                    }
                    Err(e) => {
                        for fragment in &acquired {
                            self.release_fragment(driver, fragment).ok();
                        }
                        return Err(e);
                    }
                },
            }
        }

        Ok(acquired)
    }

    /// Drops one reference to `fragment`; the last reference destroys its handle.
    pub fn release_fragment(
        &mut self,
        driver: &dyn KernelDriver,
        fragment: &Fragment,
    ) -> ResidencyResult<()> {
        let Some(entry) = self.fragments.get_mut(&fragment.cpu_ptr) else {
            return Ok(());
        };

        entry.ref_count -= 1;
        if entry.ref_count == 0 {
            let handle = entry.fragment.handle;
            self.fragments.remove(&fragment.cpu_ptr);
            destroy_handle(driver, handle)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    #[must_use]
    pub fn ref_count(&self, cpu_ptr: usize) -> usize {
        self.fragments.get(&cpu_ptr).map_or(0, |entry| entry.ref_count)
    }

    fn take_reference(&mut self, cpu_ptr: usize) -> Option<Arc<Fragment>> {
        let entry = self.fragments.get_mut(&cpu_ptr)?;
        entry.ref_count += 1;
        Some(entry.fragment.clone())
    }

    /// True if `range` intersects a stored fragment without matching it exactly.
    fn overlaps_differently(&self, range: &FragmentRange) -> bool {
        let start = range.cpu_ptr as u64;
        let end = start + range.size;

        self.fragments
            .range(..range.cpu_ptr + range.size as usize)
            .next_back()
            .is_some_and(|(&key, entry)| {
                let key_start = key as u64;
                let key_end = key_start + entry.fragment.size;
                let intersects = key_start < end && start < key_end;
                let identical = key_start == start && entry.fragment.size == range.size;
                intersects && !identical
            })
    }
}

fn destroy_handle(driver: &dyn KernelDriver, handle: OsHandle) -> ResidencyResult<()> {
    debug!(handle = %handle, "destroying host fragment");
    driver.destroy_allocations(&[handle])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kmd::device::SimulatedDevice;

    fn positions(ranges: &[FragmentRange]) -> Vec<(FragmentPosition, usize, u64)> {
        ranges.iter().map(|r| (r.position, r.cpu_ptr, r.size)).collect()
    }

    #[test]
    fn unaligned_range_spanning_pages_splits_in_three() {
        let ranges = split_host_range(0x1500, 8196);
        assert_eq!(
            positions(&ranges),
            vec![
                (FragmentPosition::Leading, 0x1000, 0x1000),
                (FragmentPosition::Middle, 0x2000, 0x1000),
                (FragmentPosition::Trailing, 0x3000, 0x1000),
            ]
        );
    }

    #[test]
    fn aligned_range_is_a_single_middle_fragment() {
        let ranges = split_host_range(0x4000, 0x3000);
        assert_eq!(positions(&ranges), vec![(FragmentPosition::Middle, 0x4000, 0x3000)]);
    }

    #[test]
    fn range_inside_one_page_yields_leading_only() {
        let ranges = split_host_range(0x1100, 0x200);
        assert_eq!(positions(&ranges), vec![(FragmentPosition::Leading, 0x1000, 0x1000)]);
    }

    #[test]
    fn unaligned_start_aligned_end_has_no_trailing_page() {
        let ranges = split_host_range(0x1800, 0x1800);
        assert_eq!(
            positions(&ranges),
            vec![
                (FragmentPosition::Leading, 0x1000, 0x1000),
                (FragmentPosition::Middle, 0x2000, 0x1000),
            ]
        );
    }

    #[test]
    fn adjacent_leading_and_trailing_pages_have_no_middle() {
        let ranges = split_host_range(0x1800, 0x1000);
        assert_eq!(
            positions(&ranges),
            vec![
                (FragmentPosition::Leading, 0x1000, 0x1000),
                (FragmentPosition::Trailing, 0x2000, 0x1000),
            ]
        );
    }

    #[test]
    fn identical_ranges_share_fragments() {
        let device = SimulatedDevice::new();
        let mut manager = HostPtrManager::new();

        let first = manager.acquire_fragments(&device, 0x1500, 8196).unwrap();
        let second = manager.acquire_fragments(&device, 0x1500, 8196).unwrap();
        assert_eq!(first.len(), 3);
        for (a, b) in first.iter().zip(second.iter()) {
            assert!(Arc::ptr_eq(a, b));
        }
        assert_eq!(manager.ref_count(0x1000), 2);
        assert_eq!(device.live_allocation_count(), 3);

        for fragment in &first {
            manager.release_fragment(&device, fragment).unwrap();
        }
        assert_eq!(device.live_allocation_count(), 3);
        for fragment in &second {
            manager.release_fragment(&device, fragment).unwrap();
        }
        assert_eq!(manager.fragment_count(), 0);
        assert_eq!(device.live_allocation_count(), 0);
    }

    #[test]
    fn failed_fragment_creation_releases_fragments_already_acquired() {
        let device = SimulatedDevice::new();
        let mut manager = HostPtrManager::new();
        device.limit_allocations(Some(2));

        let err = manager.acquire_fragments(&device, 0x1500, 8196).unwrap_err();
        assert!(matches!(err, ResidencyError::Driver { .. }));
        assert_eq!(manager.fragment_count(), 0);
        assert_eq!(device.live_allocation_count(), 0);
    }

    #[test]
    fn partial_overlap_is_rejected_without_taking_references() {
        let device = SimulatedDevice::new();
        let mut manager = HostPtrManager::new();
        manager.acquire_fragments(&device, 0x4000, 0x3000).unwrap();

        let err = manager.acquire_fragments(&device, 0x5000, 0x1000).unwrap_err();
        assert!(matches!(err, ResidencyError::FragmentOverlap { .. }));
        assert_eq!(manager.ref_count(0x4000), 1);
        assert_eq!(manager.fragment_count(), 1);
    }
}
