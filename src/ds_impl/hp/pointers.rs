use core::mem;
use std::{
    ptr::null_mut,
    sync::atomic::{AtomicPtr, Ordering},
};

bitflags! {
    /// State bits stored in the low bits of a `next` link.
    ///
    /// A node whose `next` is flagged is about to have its successor removed. A node whose `next`
    /// is marked is logically deleted and its `next` never changes again. A link is never both.
    pub(crate) struct Marks: usize {
        const FLAG = 1usize.wrapping_shl(0);
        const MARK = 1usize.wrapping_shl(1);
    }
}

impl Marks {
    #[inline]
    pub(crate) fn flag(self) -> bool {
        self.contains(Marks::FLAG)
    }

    #[inline]
    pub(crate) fn mark(self) -> bool {
        self.contains(Marks::MARK)
    }
}

/// An atomic link that carries [`Marks`] in its low bits.
pub(crate) struct Atomic<T> {
    link: AtomicPtr<T>,
}

unsafe impl<T> Sync for Atomic<T> {}
unsafe impl<T> Send for Atomic<T> {}

impl<T> Atomic<T> {
    #[inline]
    pub(crate) fn null() -> Self {
        let link = AtomicPtr::new(null_mut());
        Self { link }
    }

    #[inline]
    pub(crate) fn load(&self, order: Ordering) -> Shared<T> {
        let ptr = self.link.load(order);
        Shared { ptr }
    }

    #[inline]
    pub(crate) fn store(&self, ptr: Shared<T>, order: Ordering) {
        self.link.store(ptr.into_raw(), order)
    }

    /// On failure, returns the current value.
    #[inline]
    pub(crate) fn compare_exchange(
        &self,
        current: Shared<T>,
        new: Shared<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<Shared<T>, Shared<T>> {
        self.link
            .compare_exchange(current.into_raw(), new.into_raw(), success, failure)
            .map(|ptr| Shared { ptr })
            .map_err(|ptr| Shared { ptr })
    }

    #[inline]
    pub(crate) fn as_atomic_ptr(&self) -> &AtomicPtr<T> {
        &self.link
    }
}

impl<T> From<Shared<T>> for Atomic<T> {
    #[inline]
    fn from(value: Shared<T>) -> Self {
        let link = AtomicPtr::new(value.into_raw());
        Self { link }
    }
}

/// A possibly marked pointer read from an [`Atomic`].
pub(crate) struct Shared<T> {
    ptr: *mut T,
}

impl<T> Shared<T> {
    #[inline]
    pub(crate) fn from_owned(init: T) -> Shared<T> {
        let ptr = Box::into_raw(Box::new(init));
        Self { ptr }
    }

    #[inline]
    pub(crate) unsafe fn drop_owned(self) {
        drop(Box::from_raw(base_ptr(self.ptr)));
    }

    #[inline]
    pub(crate) fn null() -> Self {
        Self { ptr: null_mut() }
    }

    #[inline]
    pub(crate) fn from_raw(ptr: *mut T) -> Self {
        Self { ptr }
    }

    #[inline]
    pub(crate) fn into_raw(self) -> *mut T {
        self.ptr
    }

    #[inline]
    pub(crate) fn is_null(&self) -> bool {
        base_ptr(self.ptr).is_null()
    }

    #[inline]
    pub(crate) fn marks(&self) -> Marks {
        Marks::from_bits_truncate(tag(self.ptr))
    }

    #[inline]
    pub(crate) fn with_marks(&self, marks: Marks) -> Self {
        let ptr = compose_tag(self.ptr, marks.bits());
        Self { ptr }
    }

    /// The same address without any marks.
    #[inline]
    pub(crate) fn unmarked(&self) -> Self {
        self.with_marks(Marks::empty())
    }

    /// The address without marks, for hazard pointers and frontiers.
    #[inline]
    pub(crate) fn as_raw(&self) -> *mut T {
        base_ptr(self.ptr)
    }

    #[inline]
    pub(crate) unsafe fn deref<'g>(&self) -> &'g T {
        &*base_ptr(self.ptr)
    }
}

impl<T> Clone for Shared<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Shared<T> {}

impl<T> PartialEq for Shared<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}

impl<T> Eq for Shared<T> {}

impl<T> core::fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:p}{:?}", base_ptr(self.ptr), self.marks())
    }
}

/// Returns a bitmask containing the unused least significant bits of an aligned pointer to `T`.
#[inline]
fn low_bits<T: Sized>() -> usize {
    (1 << mem::align_of::<T>().trailing_zeros()) - 1
}

/// Given a tagged pointer `data`, returns the same pointer, but tagged with `tag`.
///
/// `tag` is truncated to fit into the unused bits of the pointer to `T`.
#[inline]
fn compose_tag<T: Sized>(ptr: *mut T, tag: usize) -> *mut T {
    ((ptr as usize & !low_bits::<T>()) | (tag & low_bits::<T>())) as _
}

#[inline]
fn base_ptr<T: Sized>(ptr: *mut T) -> *mut T {
    (ptr as usize & !low_bits::<T>()) as _
}

#[inline]
fn tag<T: Sized>(ptr: *mut T) -> usize {
    ptr as usize & low_bits::<T>()
}

#[cfg(test)]
mod tests {
    use super::{Atomic, Marks, Shared};
    use std::sync::atomic::Ordering;

    #[test]
    fn marks_survive_round_trip() {
        let node = Shared::from_owned(7u64);
        let link = Atomic::from(node);

        let flagged = node.with_marks(Marks::FLAG);
        link.store(flagged, Ordering::Relaxed);
        let loaded = link.load(Ordering::Relaxed);
        assert!(loaded.marks().flag());
        assert!(!loaded.marks().mark());
        assert_eq!(loaded.unmarked(), node);
        assert_eq!(loaded.as_raw(), node.as_raw());
        assert_eq!(unsafe { *loaded.deref() }, 7);

        assert_eq!(
            link.compare_exchange(node, node, Ordering::Relaxed, Ordering::Relaxed),
            Err(flagged)
        );
        assert!(link
            .compare_exchange(flagged, node.with_marks(Marks::MARK), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok());
        assert!(link.load(Ordering::Relaxed).marks().mark());

        unsafe { node.drop_owned() };
    }

    #[test]
    fn null_is_null_with_marks() {
        let null = Shared::<u64>::null();
        assert!(null.is_null());
        assert!(null.with_marks(Marks::MARK).is_null());
        assert!(Atomic::<u64>::null().load(Ordering::Relaxed).is_null());
    }
}
