use core::cell::RefCell;
use core::mem;
use core::sync::atomic::{AtomicPtr, Ordering};
use core::ptr;

use crate::domain::Domain;
use crate::hazard::{HazardArray, ThreadRecord, SCAN_SLOT};
use crate::retire::{sweep, Orphan, Retired};

/// A participant of a [`Domain`]: owns a record of hazard slots and a bag of retired pointers.
pub struct Thread<'domain> {
    pub(crate) domain: &'domain Domain,
    pub(crate) hazards: &'domain ThreadRecord,
    /// available slots of hazard array
    pub(crate) available_indices: RefCell<Vec<usize>>,
    pub(crate) reclaim: RefCell<Reclamation>,
}

pub(crate) struct Reclamation {
    pub(crate) retired: Vec<Retired>,
    pub(crate) count: usize,
}

impl<'domain> Thread<'domain> {
    const COUNTS_BETWEEN_COLLECT: usize = 128;

    pub fn new(domain: &'domain Domain) -> Self {
        let (thread, available_indices) = domain.threads.acquire();
        Self {
            domain,
            hazards: thread,
            available_indices: RefCell::new(available_indices),
            reclaim: RefCell::new(Reclamation {
                retired: Vec::new(),
                count: 0,
            }),
        }
    }

    /// Retires `ptr`: it is freed as a `Box<T>` once no hazard pointer of the domain protects it.
    ///
    /// # Safety
    /// * `ptr` was allocated by `Box<T>` and is no longer reachable from shared memory.
    /// * `ptr` is retired only once.
    pub unsafe fn retire<T>(&self, ptr: *mut T) {
        let mut reclaim = self.reclaim.borrow_mut();
        self.retire_inner(&mut reclaim, Retired::new(ptr));
    }

    // NOTE: T: Send not required because we reclaim only locally, or after handing the whole bag
    // over to the domain on exit.
    #[inline]
    fn retire_inner(&self, reclaim: &mut Reclamation, retired: Retired) {
        reclaim.retired.push(retired);
        self.domain.num_garbages.fetch_add(1, Ordering::Relaxed);

        let count = reclaim.count.wrapping_add(1);
        reclaim.count = count;
        if count % Self::COUNTS_BETWEEN_COLLECT == 0 {
            self.do_reclamation_inner(reclaim);
        }
    }

    /// Publishes every pointer of `frontier`, then runs `do_unlink`. If it reports that it
    /// unlinked `victim`, retires `victim` while keeping `frontier` published until `victim` is
    /// freed.
    ///
    /// The frontier is what `victim` still points to. Keeping it alive lets any thread that
    /// protects `victim` follow its links without validating them.
    ///
    /// # Safety
    /// * `victim` was allocated by `Box<T>`.
    /// * `do_unlink` returns `true` only if it made `victim` unreachable from shared memory, and
    ///   exactly one caller does so for a given `victim`.
    /// * The pointers of `frontier` are alive until `do_unlink` has run.
    pub unsafe fn try_unlink<T, F>(&self, frontier: &[*mut T], victim: *mut T, do_unlink: F) -> bool
    where
        F: FnOnce() -> bool,
    {
        let slots: Vec<(usize, *mut u8)> = frontier
            .iter()
            .map(|&ptr| {
                let idx = self.acquire();
                self.hazards.slot(idx).store(ptr as *mut u8, Ordering::Release);
                (idx, ptr as *mut u8)
            })
            .collect();
        membarrier::light();

        if do_unlink() {
            let mut reclaim = self.reclaim.borrow_mut();
            self.retire_inner(&mut reclaim, Retired::with_frontier(victim, slots));
            true
        } else {
            for (idx, _) in slots {
                self.release(idx);
            }
            false
        }
    }

    /// Frees every retired pointer of this thread, and of exited threads, that no hazard pointer
    /// protects.
    pub fn do_reclamation(&self) {
        let mut reclaim = self.reclaim.borrow_mut();
        self.do_reclamation_inner(&mut reclaim);
    }

    pub(crate) fn do_reclamation_inner(&self, reclaim: &mut Reclamation) {
        let orphans = self.domain.orphans.pop_all();
        if reclaim.retired.is_empty() && orphans.is_empty() {
            return;
        }

        let Some(mut guarded) = self.domain.collect_guarded_ptrs(self.hazards) else {
            log::debug!("hazard scan kept racing with frontier releases, postponing reclamation");
            for orphan in orphans {
                self.domain.orphans.push(orphan);
            }
            return;
        };

        let before = reclaim.retired.len();
        let (kept, released) = unsafe { sweep(mem::take(&mut reclaim.retired), &mut guarded) };
        reclaim.retired = kept;
        let mut freed = before - reclaim.retired.len();

        let mut adopted = Vec::with_capacity(orphans.len());
        for orphan in orphans {
            let before = orphan.retired.len();
            let (kept, orphan_released) = unsafe { sweep(orphan.retired, &mut guarded) };
            freed += before - kept.len();
            adopted.push((unsafe { &*orphan.record }, kept, orphan_released));
        }

        if !released.is_empty() || adopted.iter().any(|(_, _, r)| !r.is_empty()) {
            self.domain.bump_frontier_epoch();
        }
        for idx in released {
            self.release(idx);
        }
        for (record, kept, released) in adopted {
            for idx in released {
                record.slot(idx).store(ptr::null_mut(), Ordering::Release);
            }
            if kept.is_empty() {
                log::debug!("orphaned hazard record drained, recycling it");
                self.domain.threads.release(record);
            } else {
                self.domain.orphans.push(Orphan {
                    record,
                    retired: kept,
                });
            }
        }

        self.domain.num_garbages.fetch_sub(freed, Ordering::Relaxed);
        log::trace!(
            "reclamation pass freed {} pointers, {} still protected",
            freed,
            reclaim.retired.len()
        );
    }
}

// stuff related to hazards
impl<'domain> Thread<'domain> {
    /// acquire hazard slot
    pub(crate) fn acquire(&self) -> usize {
        if let Some(idx) = self.available_indices.borrow_mut().pop() {
            return idx;
        }
        self.grow_array();
        self.acquire()
    }

    fn grow_array(&self) {
        let array_ptr = self.hazards.hazptrs.load(Ordering::Relaxed);
        let array = unsafe { &*array_ptr };
        let size = array.len();
        let new_size = size * 2;
        let mut new_array: Box<HazardArray> = Box::new(Vec::with_capacity(new_size));
        for slot in array.iter() {
            new_array.push(AtomicPtr::new(slot.load(Ordering::Relaxed)));
        }
        for _ in size..new_size {
            new_array.push(AtomicPtr::new(ptr::null_mut()));
        }
        self.hazards
            .hazptrs
            .store(Box::into_raw(new_array), Ordering::Release);
        log::debug!("hazard array grown from {} to {} slots", size, new_size);
        unsafe { self.retire(array_ptr) };
        self.available_indices.borrow_mut().extend(size..new_size);
    }

    /// release hazard slot
    pub(crate) fn release(&self, idx: usize) {
        self.hazards.slot(idx).store(ptr::null_mut(), Ordering::Release);
        self.available_indices.borrow_mut().push(idx);
    }
}

impl<'domain> Drop for Thread<'domain> {
    fn drop(&mut self) {
        let mut reclaim = self.reclaim.borrow_mut();
        self.do_reclamation_inner(&mut reclaim);
        self.hazards
            .slot(SCAN_SLOT)
            .store(ptr::null_mut(), Ordering::Release);

        // WARNING: our record must stay unavailable while any leftover still owns frontier slots
        // in it. It is recycled by whoever drains the orphan.
        if reclaim.retired.is_empty() {
            self.domain.threads.release(self.hazards);
        } else {
            log::debug!(
                "thread exits with {} protected pointers, handing them over to the domain",
                reclaim.retired.len()
            );
            self.domain.orphans.push(Orphan {
                record: self.hazards as *const _,
                retired: mem::take(&mut reclaim.retired),
            });
        }
    }
}

impl core::fmt::Debug for Thread<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Thread")
            .field("domain", &(self.domain as *const _))
            .field("hazards", &(self.hazards as *const _))
            .field("available_indices", &self.available_indices.borrow().len())
            .field(
                "retired",
                &format!("[...; {}]", self.reclaim.borrow().retired.len()),
            )
            .finish()
    }
}
