use std::collections::HashMap;

use crate::hazard::ThreadRecord;

/// A retired pointer, waiting until no hazard slot publishes it.
#[derive(Debug)]
pub(crate) struct Retired {
    pub(crate) ptr: *mut u8,
    pub(crate) deleter: unsafe fn(ptr: *mut u8),
    /// Slots of the retiring thread's record, with the addresses they publish, that keep the
    /// nodes `ptr` points to alive. They are released together with `ptr`.
    pub(crate) frontier: Vec<(usize, *mut u8)>,
}

// TODO: require <T: Send> in retire
unsafe impl Send for Retired {}

impl Retired {
    pub(crate) fn new<T>(ptr: *mut T) -> Self {
        Self::with_frontier(ptr, Vec::new())
    }

    pub(crate) fn with_frontier<T>(ptr: *mut T, frontier: Vec<(usize, *mut u8)>) -> Self {
        Self {
            ptr: ptr as *mut u8,
            deleter: free::<T>,
            frontier,
        }
    }
}

unsafe fn free<T>(ptr: *mut u8) {
    drop(Box::from_raw(ptr as *mut T))
}

/// Retired pointers left behind by an exited thread, together with the record that still holds
/// their frontier slots.
#[derive(Debug)]
pub(crate) struct Orphan {
    /// Records are never freed before their domain.
    pub(crate) record: *const ThreadRecord,
    pub(crate) retired: Vec<Retired>,
}

unsafe impl Send for Orphan {}

/// Frees every retired pointer that no slot in `guarded` publishes.
///
/// `guarded` counts how many slots publish each address. Freeing a pointer withdraws the counts
/// of its frontier, so a chain of retired nodes that only keep each other alive is freed in one
/// call.
///
/// Returns the pointers that must be kept and the frontier slots of the freed ones. The caller
/// clears those slots once it has announced the release on the domain's frontier epoch.
///
/// # Safety
/// * Every pointer in `retired` is unreachable from shared memory.
/// * `guarded` was collected after all of `retired` became unreachable.
pub(crate) unsafe fn sweep(
    mut retired: Vec<Retired>,
    guarded: &mut HashMap<*mut u8, usize>,
) -> (Vec<Retired>, Vec<usize>) {
    let mut released = Vec::new();
    loop {
        let (kept, freed): (Vec<_>, Vec<_>) = retired
            .into_iter()
            .partition(|element| guarded.get(&element.ptr).map_or(false, |&c| c > 0));
        retired = kept;
        if freed.is_empty() {
            return (retired, released);
        }

        for element in freed {
            (element.deleter)(element.ptr);
            for (idx, ptr) in element.frontier {
                if let Some(count) = guarded.get_mut(&ptr) {
                    *count = count.saturating_sub(1);
                }
                released.push(idx);
            }
        }
    }
}
