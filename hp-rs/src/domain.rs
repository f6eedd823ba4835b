use core::ptr;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashMap;

use crossbeam_utils::CachePadded;

use crate::hazard::{ThreadRecord, ThreadRecords, SCAN_SLOT};
use crate::pile::Pile;
use crate::retire::Orphan;

/// A set of threads whose hazard pointers protect each other's retired pointers.
#[derive(Debug)]
pub struct Domain {
    pub(crate) threads: ThreadRecords,
    pub(crate) orphans: Pile<Orphan>,
    /// Bumped before any frontier slot is cleared. A scan that observes it changing may have
    /// missed a frontier that was handed over to a regular hazard pointer.
    pub(crate) frontier_epoch: CachePadded<AtomicUsize>,
    pub(crate) num_garbages: CachePadded<AtomicUsize>,
}

impl Domain {
    const SCAN_RETRIES: usize = 3;

    pub const fn new() -> Self {
        Self {
            threads: ThreadRecords::new(),
            orphans: Pile::new(),
            frontier_epoch: CachePadded::new(AtomicUsize::new(0)),
            num_garbages: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Counts the slots publishing each address in the threads of this domain, using the scan
    /// slot of `reader`.
    ///
    /// Returns `None` if frontier slots kept being released while scanning.
    pub(crate) fn collect_guarded_ptrs(
        &self,
        reader: &ThreadRecord,
    ) -> Option<HashMap<*mut u8, usize>> {
        let mut result = None;
        for _ in 0..Self::SCAN_RETRIES {
            let epoch = self.frontier_epoch.load(Ordering::SeqCst);
            membarrier::heavy();

            let mut guarded = HashMap::new();
            for ptr in self
                .threads
                .iter()
                .flat_map(|record| record.iter(reader))
                .filter(|ptr| !ptr.is_null())
            {
                *guarded.entry(ptr).or_insert(0) += 1;
            }

            if self.frontier_epoch.load(Ordering::SeqCst) == epoch {
                result = Some(guarded);
                break;
            }
        }
        reader
            .slot(SCAN_SLOT)
            .store(ptr::null_mut(), Ordering::Release);
        result
    }

    pub(crate) fn bump_frontier_epoch(&self) {
        self.frontier_epoch.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of retired pointers that are not freed yet.
    pub fn num_garbages(&self) -> usize {
        self.num_garbages.load(Ordering::Acquire)
    }
}

impl Drop for Domain {
    fn drop(&mut self) {
        // No thread of this domain is alive, so nothing is protected anymore.
        for orphan in self.orphans.pop_all() {
            for element in orphan.retired {
                unsafe { (element.deleter)(element.ptr) };
            }
        }
    }
}

impl Default for Domain {
    fn default() -> Self {
        Self::new()
    }
}
