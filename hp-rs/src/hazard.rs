use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use core::{mem, ptr};

use crossbeam_utils::CachePadded;

use crate::thread::Thread;

/// Index of the slot a thread uses to protect other threads' hazard arrays while scanning them.
pub(crate) const SCAN_SLOT: usize = 0;

/// A published hazard slot of a [`Thread`].
///
/// Publishing an address through a hazard pointer prevents every thread of the same [`Domain`]
/// from freeing it. The slot is released when the hazard pointer is dropped.
///
/// [`Domain`]: crate::Domain
#[derive(Debug)]
pub struct HazardPointer<'domain> {
    thread: *const Thread<'domain>,
    idx: usize,
}

impl<'domain> HazardPointer<'domain> {
    /// Takes a free slot of `thread`.
    pub fn new(thread: &Thread<'domain>) -> Self {
        let idx = thread.acquire();
        Self { thread, idx }
    }

    #[inline]
    fn slot(&self) -> &AtomicPtr<u8> {
        unsafe { (*self.thread).hazards.slot(self.idx) }
    }

    /// Publishes `ptr` without validating it.
    ///
    /// Sound only if `ptr` stays alive until the publication is visible, e.g. because it is in the
    /// frontier of a retired node that is itself protected.
    pub fn protect_raw<T>(&mut self, ptr: *mut T) {
        self.slot().store(ptr as *mut u8, Ordering::Release);
        membarrier::light();
    }

    /// Clears the slot. The slot itself stays with this hazard pointer.
    pub fn reset_protection(&mut self) {
        self.slot().store(ptr::null_mut(), Ordering::Release);
    }

    /// Checks that `src` still holds `pointer`. `Err` carries the value it holds now.
    pub fn validate<T>(pointer: *mut T, src: &AtomicPtr<T>) -> Result<(), *mut T> {
        let new = src.load(Ordering::Acquire);
        if pointer == new {
            Ok(())
        } else {
            Err(new)
        }
    }

    /// Publishes `pointer`, read from `src`, and checks that `src` did not move on meanwhile.
    /// `Ok` is a valid protection as long as being reachable from `src` implies not retired.
    pub fn try_protect<T>(&mut self, pointer: *mut T, src: &AtomicPtr<T>) -> Result<(), *mut T> {
        self.protect_raw(pointer);
        Self::validate(pointer, src)
    }

    /// Loads `src` and protects the result, retrying until validated.
    pub fn protect<T>(&mut self, src: &AtomicPtr<T>) -> *mut T {
        let mut pointer = src.load(Ordering::Relaxed);
        while let Err(new) = self.try_protect(pointer, src) {
            pointer = new;
        }
        pointer
    }

    /// Exchanges the slots of two hazard pointers of the same thread, so that each keeps
    /// protecting what the other one did.
    #[inline]
    pub fn swap(x: &mut HazardPointer<'domain>, y: &mut HazardPointer<'domain>) {
        mem::swap(&mut x.idx, &mut y.idx);
    }
}

impl Drop for HazardPointer<'_> {
    fn drop(&mut self) {
        self.reset_protection();
        unsafe { (*self.thread).release(self.idx) };
    }
}

/// Records of a domain. Records are recycled, never unlinked before the domain drops.
#[derive(Debug)]
pub(crate) struct ThreadRecords {
    head: AtomicPtr<ThreadRecord>,
}

/// Hazard slots of one thread. Only the owner writes them; the array doubles when full and
/// the old one is retired.
#[derive(Debug)]
pub struct ThreadRecord {
    pub(crate) next: *mut ThreadRecord,
    pub(crate) available: AtomicBool,
    pub(crate) hazptrs: CachePadded<AtomicPtr<HazardArray>>,
}

// Records are shared through the domain; only their owner writes their slots.
unsafe impl Send for ThreadRecord {}
unsafe impl Sync for ThreadRecord {}

pub(crate) type HazardArray = Vec<AtomicPtr<u8>>;

impl ThreadRecords {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Acquires a record, returning it with the indices of its free slots. The scan slot is never
    /// among them.
    pub(crate) fn acquire(&self) -> (&ThreadRecord, Vec<usize>) {
        if let Some(avail) = self.try_acquire_available() {
            return avail;
        }
        self.acquire_new()
    }

    fn try_acquire_available(&self) -> Option<(&ThreadRecord, Vec<usize>)> {
        let mut cur = self.head.load(Ordering::Acquire);
        while let Some(cur_ref) = unsafe { cur.as_ref() } {
            if cur_ref.available.load(Ordering::Relaxed)
                && cur_ref
                    .available
                    .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                let len = unsafe { &*cur_ref.hazptrs.load(Ordering::Relaxed) }.len();
                return Some((cur_ref, (SCAN_SLOT + 1..len).collect()));
            }
            cur = cur_ref.next;
        }
        None
    }

    fn acquire_new(&self) -> (&ThreadRecord, Vec<usize>) {
        const HAZARD_ARRAY_INIT_SIZE: usize = 64;
        let array: HazardArray = (0..HAZARD_ARRAY_INIT_SIZE)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        let new = Box::leak(Box::new(ThreadRecord {
            hazptrs: CachePadded::new(AtomicPtr::new(Box::into_raw(Box::new(array)))),
            next: ptr::null_mut(),
            available: AtomicBool::new(false),
        }));

        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            new.next = head;
            match self
                .head
                .compare_exchange(head, new, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return (new, (SCAN_SLOT + 1..HAZARD_ARRAY_INIT_SIZE).collect()),
                Err(head_new) => head = head_new,
            }
        }
    }

    pub(crate) fn release(&self, rec: &ThreadRecord) {
        rec.available.store(true, Ordering::Release);
    }

    pub(crate) fn iter(&self) -> ThreadRecordsIter<'_> {
        ThreadRecordsIter {
            cur: self.head.load(Ordering::Acquire).cast_const(),
            _marker: PhantomData,
        }
    }
}

impl Drop for ThreadRecords {
    fn drop(&mut self) {
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            let record = unsafe { Box::from_raw(cur) };
            drop(unsafe { Box::from_raw(record.hazptrs.load(Ordering::Relaxed)) });
            cur = record.next;
        }
    }
}

pub(crate) struct ThreadRecordsIter<'domain> {
    cur: *const ThreadRecord,
    _marker: PhantomData<&'domain ThreadRecord>,
}

impl<'domain> Iterator for ThreadRecordsIter<'domain> {
    type Item = &'domain ThreadRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(cur_ref) = unsafe { self.cur.as_ref() } {
            self.cur = cur_ref.next;
            Some(cur_ref)
        } else {
            None
        }
    }
}

impl ThreadRecord {
    /// Returns the slot `idx` of the current array.
    ///
    /// Only the writer of the record may call this: the array is replaced when it grows.
    #[inline]
    pub(crate) fn slot(&self, idx: usize) -> &AtomicPtr<u8> {
        unsafe {
            let array = &*self.hazptrs.load(Ordering::Relaxed);
            array.get_unchecked(idx)
        }
    }

    /// Iterates over the published addresses of this record, protecting its array with the scan
    /// slot of `reader`.
    pub(crate) fn iter<'r>(&self, reader: &'r ThreadRecord) -> ThreadHazardArrayIter<'r> {
        let scan = reader.slot(SCAN_SLOT);
        let mut array = self.hazptrs.load(Ordering::Relaxed);
        loop {
            scan.store(array as *mut u8, Ordering::Release);
            membarrier::light();
            let new = self.hazptrs.load(Ordering::Acquire);
            if new == array {
                break;
            }
            array = new;
        }
        ThreadHazardArrayIter {
            array,
            idx: 0,
            _marker: PhantomData,
        }
    }
}

pub(crate) struct ThreadHazardArrayIter<'r> {
    array: *const HazardArray,
    idx: usize,
    _marker: PhantomData<&'r ThreadRecord>,
}

impl Iterator for ThreadHazardArrayIter<'_> {
    type Item = *mut u8;

    fn next(&mut self) -> Option<Self::Item> {
        let array = unsafe { &*self.array };
        array.get(self.idx).map(|slot| {
            self.idx += 1;
            slot.load(Ordering::Acquire)
        })
    }
}
